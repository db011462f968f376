//! Target assignment computation
//!
//! Decides, for every `(slot, feature)` pair, which single package owns it.
//!
//! # Design
//!
//! - **Pure logic**: no I/O, no controllers, no queries; the resolver feeds in
//!   a read-only view of every package and gets an `Assignment` back
//! - **Deterministic**: ordered maps and sets throughout, so identical inputs
//!   always produce identical output
//!
//! # Precedence per (slot, class)
//!
//! | Carrier override | Pair outcome |
//! |------------------|--------------|
//! | known, proves the pair | carrier |
//! | known, does not prove the pair | device default if it supports the pair |
//! | unknown / querying | previous owner if it is this carrier or the device default, else unassigned |
//! | not configured, absent, failed | device default if it supports the pair |
//!
//! A dynamic device default still being queried keeps only the pairs it
//! already held. Afterwards `(s, emergency_voice)` is stripped from every
//! package that does not also own `(s, voice)`.

use crate::config::DeviceDefaults;
use crate::package_state::PackageState;
use crate::types::{
    strip_orphan_emergency, Assignment, FeatureClass, FeatureSet, FeatureSlotPair, PackageName,
    SlotId,
};
use std::collections::{BTreeMap, BTreeSet};
use strum::IntoEnumIterator;

/// What the computation needs to know about one package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageView {
    pub state: PackageState,
    /// Pairs the package can provide; meaningful only when `Known`
    pub supported: FeatureSet,
}

impl PackageView {
    pub fn known(supported: FeatureSet) -> Self {
        Self {
            state: PackageState::Known,
            supported,
        }
    }

    pub fn with_state(state: PackageState) -> Self {
        Self {
            state,
            supported: FeatureSet::new(),
        }
    }

    fn provides(&self, pair: &FeatureSlotPair) -> bool {
        self.state == PackageState::Known && self.supported.contains(pair)
    }
}

/// Effective carrier override per (slot, class).
pub type CarrierSelection = BTreeMap<(SlotId, FeatureClass), PackageName>;

/// Which slots a pass recomputes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    All,
    Slot(SlotId),
}

impl Scope {
    pub fn covers(self, slot: SlotId) -> bool {
        match self {
            Self::All => true,
            Self::Slot(s) => s == slot,
        }
    }
}

// ============================================================================
// Resolution
// ============================================================================

/// Read-only inputs of one reconciliation pass.
#[derive(Debug, Clone, Copy)]
pub struct ResolutionContext<'a> {
    pub slot_count: usize,
    pub device_defaults: &'a DeviceDefaults,
    pub carrier: &'a CarrierSelection,
    pub packages: &'a BTreeMap<PackageName, PackageView>,
}

impl<'a> ResolutionContext<'a> {
    fn view(&self, package: &str) -> Option<&'a PackageView> {
        self.packages.get(package)
    }

    /// Carrier override for (slot, class) if configured, present and not failed
    fn carrier_for(&self, slot: SlotId, class: FeatureClass) -> Option<&'a str> {
        self.carrier
            .get(&(slot, class))
            .map(String::as_str)
            .filter(|p| {
                self.view(p)
                    .is_some_and(|v| v.state != PackageState::Failed)
            })
    }

    /// Device default for `class` if configured and present
    fn device_for(&self, class: FeatureClass) -> Option<&'a str> {
        self.device_defaults
            .for_class(class)
            .filter(|p| self.packages.contains_key(*p))
    }

    /// The package whose configuration governs (slot, class).
    pub fn governing_package(&self, slot: SlotId, class: FeatureClass) -> Option<&'a str> {
        if slot >= self.slot_count {
            return None;
        }
        self.carrier_for(slot, class)
            .or_else(|| self.device_for(class))
    }

    /// Packages in `Unknown` whose capabilities the pass needs.
    pub fn packages_to_query(&self, scope: Scope) -> BTreeSet<PackageName> {
        let mut wanted = BTreeSet::new();
        for slot in (0..self.slot_count).filter(|&s| scope.covers(s)) {
            for class in FeatureClass::iter() {
                let candidates = [self.carrier_for(slot, class), self.device_for(class)];
                for package in candidates.into_iter().flatten() {
                    if self
                        .view(package)
                        .is_some_and(|v| v.state == PackageState::Unknown)
                    {
                        wanted.insert(package.to_string());
                    }
                }
            }
        }
        wanted
    }

    /// Whether `owner` may keep `pair` while the deciding package is pending.
    fn may_keep(&self, owner: &str, pair: &FeatureSlotPair) -> bool {
        match self.view(owner) {
            Some(view) => match view.state {
                PackageState::Known => view.supported.contains(pair),
                PackageState::Unknown | PackageState::Querying => true,
                PackageState::Failed => false,
            },
            None => false,
        }
    }

    fn owner_of(
        &self,
        pair: &FeatureSlotPair,
        previous: &BTreeMap<FeatureSlotPair, &str>,
    ) -> Option<String> {
        let class = pair.feature.class();
        let previous_owner = previous.get(pair).copied();

        if let Some(carrier) = self.carrier_for(pair.slot, class) {
            let view = self.view(carrier)?;
            if view.state.is_pending() {
                let device = self.device_for(class);
                return previous_owner
                    .filter(|owner| *owner == carrier || Some(*owner) == device)
                    .filter(|owner| self.may_keep(owner, pair))
                    .map(str::to_string);
            }
            if view.provides(pair) {
                return Some(carrier.to_string());
            }
        }

        let device = self.device_for(class)?;
        let view = self.view(device)?;
        if view.state.is_pending() {
            return previous_owner
                .filter(|owner| *owner == device)
                .map(str::to_string);
        }
        view.provides(pair).then(|| device.to_string())
    }

    /// Compute the target assignment.
    ///
    /// Slots outside `scope` keep their previous owners, minus owners that
    /// disappeared or failed.
    pub fn compute(&self, previous: &Assignment, scope: Scope) -> Assignment {
        let previous_owners: BTreeMap<FeatureSlotPair, &str> = previous
            .iter()
            .flat_map(|(package, set)| set.iter().map(move |pair| (*pair, package.as_str())))
            .collect();

        let mut target = Assignment::new();
        for slot in 0..self.slot_count {
            for class in FeatureClass::iter() {
                for feature in class.features() {
                    let pair = FeatureSlotPair::new(slot, feature);
                    let owner = if scope.covers(slot) {
                        self.owner_of(&pair, &previous_owners)
                    } else {
                        previous_owners
                            .get(&pair)
                            .filter(|owner| {
                                self.view(owner)
                                    .is_some_and(|v| v.state != PackageState::Failed)
                            })
                            .map(|owner| owner.to_string())
                    };
                    if let Some(owner) = owner {
                        target.entry(owner).or_default().insert(pair);
                    }
                }
            }
        }

        for set in target.values_mut() {
            strip_orphan_emergency(set);
        }
        target.retain(|_, set| !set.is_empty());
        target
    }
}

/// Owner of `pair` in `assignment`, if any.
pub fn owner_in<'a>(assignment: &'a Assignment, pair: &FeatureSlotPair) -> Option<&'a str> {
    assignment
        .iter()
        .find(|(_, set)| set.contains(pair))
        .map(|(package, _)| package.as_str())
}

// ============================================================================
// Tests
// ============================================================================
