//! Configuration sources
//!
//! Two kinds of configuration decide who governs a class on a slot:
//!
//! - **Device defaults**: one package per feature class, fixed at construction
//! - **Carrier overrides**: per slot, read through a `ConfigSource` whenever the
//!   carrier configuration of that slot changes
//!
//! An empty package name means "not configured" everywhere.

use crate::types::{FeatureClass, PackageName, SlotId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// Reads the carrier override configured for a slot and class.
pub trait ConfigSource: Send {
    fn carrier_override(&self, slot: SlotId, class: FeatureClass) -> Option<PackageName>;
}

fn configured(name: &str) -> Option<&str> {
    let name = name.trim();
    (!name.is_empty()).then_some(name)
}

/// Process-wide device default package per class.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDefaults {
    #[serde(default)]
    pub voice: String,
    #[serde(default)]
    pub messaging: String,
}

impl DeviceDefaults {
    /// Same package for both classes
    pub fn single(package: impl Into<String>) -> Self {
        let package = package.into();
        Self {
            voice: package.clone(),
            messaging: package,
        }
    }

    pub fn new(voice: impl Into<String>, messaging: impl Into<String>) -> Self {
        Self {
            voice: voice.into(),
            messaging: messaging.into(),
        }
    }

    /// The configured default for `class`, if any
    pub fn for_class(&self, class: FeatureClass) -> Option<&str> {
        match class {
            FeatureClass::Voice => configured(&self.voice),
            FeatureClass::Messaging => configured(&self.messaging),
        }
    }
}

/// Carrier override keys for one slot.
///
/// `all` governs both classes; a class-specific key wins over it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CarrierOverrides {
    #[serde(default)]
    pub all: String,
    #[serde(default)]
    pub voice: String,
    #[serde(default)]
    pub messaging: String,
}

impl CarrierOverrides {
    /// One package for every class
    pub fn all(package: impl Into<String>) -> Self {
        Self {
            all: package.into(),
            ..Self::default()
        }
    }

    pub fn voice(mut self, package: impl Into<String>) -> Self {
        self.voice = package.into();
        self
    }

    pub fn messaging(mut self, package: impl Into<String>) -> Self {
        self.messaging = package.into();
        self
    }

    /// Effective override for `class`
    pub fn resolve(&self, class: FeatureClass) -> Option<&str> {
        let specific = match class {
            FeatureClass::Voice => &self.voice,
            FeatureClass::Messaging => &self.messaging,
        };
        configured(specific).or_else(|| configured(&self.all))
    }
}

/// In-memory carrier configuration shared between the producer of
/// carrier-config events and the resolver.
#[derive(Debug, Clone, Default)]
pub struct CarrierConfigStore {
    slots: Arc<Mutex<BTreeMap<SlotId, CarrierOverrides>>>,
}

impl CarrierConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the overrides of `slot`
    pub fn set(&self, slot: SlotId, overrides: CarrierOverrides) {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.insert(slot, overrides);
    }

    /// Remove every override of `slot`
    pub fn clear(&self, slot: SlotId) {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.remove(&slot);
    }

    pub fn get(&self, slot: SlotId) -> Option<CarrierOverrides> {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.get(&slot).cloned()
    }
}

impl ConfigSource for CarrierConfigStore {
    fn carrier_override(&self, slot: SlotId, class: FeatureClass) -> Option<PackageName> {
        self.get(slot)
            .and_then(|o| o.resolve(class).map(str::to_string))
    }
}
