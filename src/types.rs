//! Core value types for the capability resolver
//!
//! Features, feature classes and the `(slot, feature)` pair that is the unit of
//! ownership. Everything here is a plain value: `Copy` where possible, ordered so
//! that sets print and compare deterministically.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use strum::{Display, EnumIter, EnumString, IntoEnumIterator};

/// Index of a hardware slot, `0..slot_count`.
pub type SlotId = usize;

/// Subscription identifier bound to a slot.
pub type SubscriptionId = i32;

/// Package identity (e.g. `com.example.ims`).
pub type PackageName = String;

/// The set of pairs a package can provide or is bound to provide.
pub type FeatureSet = BTreeSet<FeatureSlotPair>;

/// Slot to active subscription map handed to controllers on bind/change.
pub type SlotSubscriptions = BTreeMap<SlotId, Option<SubscriptionId>>;

/// Which package owns which pairs. Packages owning nothing are absent.
pub type Assignment = BTreeMap<PackageName, FeatureSet>;

/// A capability a service package can provide.
///
/// The string form doubles as the metadata key a package uses to declare the
/// feature statically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    #[strum(serialize = "emergency_voice")]
    EmergencyVoice,
    #[strum(serialize = "voice")]
    Voice,
    #[strum(serialize = "messaging")]
    Messaging,
}

impl Feature {
    /// The configuration class that governs this feature
    pub const fn class(self) -> FeatureClass {
        match self {
            Self::EmergencyVoice | Self::Voice => FeatureClass::Voice,
            Self::Messaging => FeatureClass::Messaging,
        }
    }
}

/// Unit of configuration: overrides and device defaults are set per class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "snake_case")]
pub enum FeatureClass {
    #[strum(serialize = "voice")]
    Voice,
    #[strum(serialize = "messaging")]
    Messaging,
}

impl FeatureClass {
    /// Features governed by this class
    pub fn features(self) -> impl Iterator<Item = Feature> {
        Feature::iter().filter(move |f| f.class() == self)
    }
}

/// One feature on one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FeatureSlotPair {
    pub slot: SlotId,
    pub feature: Feature,
}

impl FeatureSlotPair {
    pub const fn new(slot: SlotId, feature: Feature) -> Self {
        Self { slot, feature }
    }
}

impl fmt::Display for FeatureSlotPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.slot, self.feature)
    }
}

/// Package plus service class name, the identity a controller binds to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ComponentName {
    pub package: PackageName,
    pub class: String,
}

impl ComponentName {
    pub fn new(package: impl Into<String>, class: impl Into<String>) -> Self {
        Self {
            package: package.into(),
            class: class.into(),
        }
    }
}

impl fmt::Display for ComponentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.package, self.class)
    }
}

/// Drop `(s, EmergencyVoice)` from a set wherever `(s, Voice)` is missing.
pub fn strip_orphan_emergency(features: &mut FeatureSet) {
    let voice_slots: BTreeSet<SlotId> = features
        .iter()
        .filter(|p| p.feature == Feature::Voice)
        .map(|p| p.slot)
        .collect();
    features.retain(|p| p.feature != Feature::EmergencyVoice || voice_slots.contains(&p.slot));
}

/// Format a feature set compactly for log lines.
pub fn describe(features: &FeatureSet) -> String {
    let parts: Vec<String> = features.iter().map(ToString::to_string).collect();
    format!("{{{}}}", parts.join(", "))
}
