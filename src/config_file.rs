//! Configuration files for the resolver and for scripted scenarios.
//!
//! `ResolverConfig` is the construction-time configuration. A `Scenario` wraps
//! one together with scripted collaborators (installed candidates, carrier
//! overrides, query outcomes) and a timeline of events, so a run can be replayed
//! from a single JSON file by the `simulate` and `explain` commands.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use crate::config::{CarrierOverrides, DeviceDefaults};
use crate::query::DEFAULT_MAX_START_ATTEMPTS;
use crate::registry::CandidatePackage;
use crate::types::{FeatureSlotPair, PackageName, SlotId, SubscriptionId};

fn default_slot_count() -> usize {
    1
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_START_ATTEMPTS
}

/// Construction-time resolver configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolverConfig {
    #[serde(default = "default_slot_count")]
    pub slot_count: usize,
    #[serde(default)]
    pub device_defaults: DeviceDefaults,
    /// Consecutive refused query starts before a package is given up on
    #[serde(default = "default_max_attempts")]
    pub max_query_start_attempts: u32,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            slot_count: default_slot_count(),
            device_defaults: DeviceDefaults::default(),
            max_query_start_attempts: default_max_attempts(),
        }
    }
}

impl ResolverConfig {
    pub fn new(slot_count: usize, device_defaults: DeviceDefaults) -> Self {
        Self {
            slot_count,
            device_defaults,
            ..Self::default()
        }
    }

    /// Save configuration to a JSON file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .context("Failed to serialize resolver configuration to JSON")?;

        fs::write(&path, json)
            .with_context(|| format!("Failed to write configuration to {:?}", path.as_ref()))?;

        Ok(())
    }

    /// Load configuration from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read configuration from {:?}", path.as_ref()))?;

        let config: Self = serde_json::from_str(&content)
            .context("Failed to parse resolver configuration JSON")?;

        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.slot_count == 0 {
            anyhow::bail!("slot_count must be at least 1");
        }
        if self.max_query_start_attempts == 0 {
            anyhow::bail!("max_query_start_attempts must be at least 1");
        }
        Ok(())
    }
}

/// Scripted answer of the capability querier for one package
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryScript {
    /// Complete with these pairs
    Features(BTreeSet<FeatureSlotPair>),
    /// Report a permanent error
    Fail,
    /// Start, but never complete
    Never,
    /// Refuse to start
    Refuse,
}

/// One step of a scenario timeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TimelineStep {
    /// Install (or reinstall) a candidate, then announce it
    PackageAdded { candidate: CandidatePackage },
    /// Replace an installed candidate, then announce the change
    PackageChanged { candidate: CandidatePackage },
    PackageRemoved { package: PackageName },
    /// Update the carrier overrides of a slot, then announce the change
    CarrierConfigChanged {
        slot: SlotId,
        #[serde(default)]
        subscription: Option<SubscriptionId>,
        #[serde(default)]
        overrides: CarrierOverrides,
    },
    SlotCountChanged { count: usize },
    BootCompleted,
    BindPermanentError { package: PackageName },
    EnableSlot { slot: SlotId },
    DisableSlot { slot: SlotId },
}

/// A replayable run: configuration, scripted collaborators and events
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scenario {
    #[serde(default)]
    pub config: ResolverConfig,
    #[serde(default)]
    pub candidates: Vec<CandidatePackage>,
    /// Carrier overrides in place before the resolver starts
    #[serde(default)]
    pub carrier_overrides: BTreeMap<SlotId, CarrierOverrides>,
    /// Query outcome per package; unscripted packages never complete
    #[serde(default)]
    pub queries: BTreeMap<PackageName, QueryScript>,
    #[serde(default)]
    pub timeline: Vec<TimelineStep>,
}

impl Scenario {
    /// Load a scenario from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read scenario from {:?}", path.as_ref()))?;

        let scenario: Self =
            serde_json::from_str(&content).context("Failed to parse scenario JSON")?;

        Ok(scenario)
    }

    /// Save the scenario to a JSON file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json =
            serde_json::to_string_pretty(self).context("Failed to serialize scenario to JSON")?;

        fs::write(&path, json)
            .with_context(|| format!("Failed to write scenario to {:?}", path.as_ref()))?;

        Ok(())
    }

    /// Validate the scenario
    pub fn validate(&self) -> Result<()> {
        self.config.validate()?;

        let mut seen = BTreeSet::new();
        for candidate in &self.candidates {
            if !seen.insert(candidate.component.package.as_str()) {
                anyhow::bail!(
                    "Candidate package '{}' is listed more than once",
                    candidate.component.package
                );
            }
        }

        if let Some(slot) = self
            .carrier_overrides
            .keys()
            .find(|slot| **slot >= self.config.slot_count)
        {
            anyhow::bail!(
                "Carrier override for slot {} but slot_count is {}",
                slot,
                self.config.slot_count
            );
        }

        for (index, step) in self.timeline.iter().enumerate() {
            if let TimelineStep::SlotCountChanged { count: 0 } = step {
                anyhow::bail!("Timeline step {} sets slot count to 0", index);
            }
        }

        Ok(())
    }
}
