//! Candidate Registry
//!
//! A point-in-time snapshot of installed service packages that can provide
//! features, built from a discovery scan.
//!
//! # Scan Rules
//!
//! 1. **Permission gate**: a candidate without the bind permission is excluded
//! 2. **Carrier packages are dynamic**: static metadata of a carrier-override
//!    target is ignored, its features must be queried
//! 3. **No metadata means dynamic**: a candidate declaring nothing is queried
//! 4. **Emergency needs voice**: `emergency_voice` declared without `voice` is
//!    dropped at parse time
//! 5. **Malformed metadata is contained**: an unknown feature name leaves that
//!    package in the registry declaring nothing; the scan continues

use crate::error::{ResolverError, Result};
use crate::types::{ComponentName, Feature, FeatureSet, FeatureSlotPair, PackageName};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;
use tracing::{debug, warn};

/// Raw discovery record for one installed candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidatePackage {
    pub component: ComponentName,
    /// Feature names declared in the package metadata
    #[serde(default)]
    pub declared_features: BTreeSet<String>,
    #[serde(default = "default_permission")]
    pub has_bind_permission: bool,
}

fn default_permission() -> bool {
    true
}

impl CandidatePackage {
    pub fn new(component: ComponentName) -> Self {
        Self {
            component,
            declared_features: BTreeSet::new(),
            has_bind_permission: true,
        }
    }

    /// Add declared metadata features
    pub fn with_features<I, S>(mut self, features: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.declared_features
            .extend(features.into_iter().map(Into::into));
        self
    }

    /// Set whether the bind permission is granted
    pub fn with_permission(mut self, granted: bool) -> Self {
        self.has_bind_permission = granted;
        self
    }
}

/// Source of candidate packages (the package manager, in production).
pub trait PackageDiscovery: Send {
    /// Return every installed package exposing the service interface.
    fn discover_candidates(&self) -> Result<Vec<CandidatePackage>>;
}

/// What the resolver knows about one candidate package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceInfo {
    pub component: ComponentName,
    /// True when `declared` came from static metadata
    pub features_from_metadata: bool,
    pub has_bind_permission: bool,
    declared: BTreeSet<Feature>,
    discovered: FeatureSet,
}

impl ServiceInfo {
    /// A package whose features come from static metadata
    pub fn from_metadata(component: ComponentName, declared: BTreeSet<Feature>) -> Self {
        Self {
            component,
            features_from_metadata: true,
            has_bind_permission: true,
            declared,
            discovered: FeatureSet::new(),
        }
    }

    /// A package whose features must be queried
    pub fn dynamic(component: ComponentName) -> Self {
        Self {
            component,
            features_from_metadata: false,
            has_bind_permission: true,
            declared: BTreeSet::new(),
            discovered: FeatureSet::new(),
        }
    }

    #[inline]
    pub fn package(&self) -> &str {
        &self.component.package
    }

    #[inline]
    pub fn is_dynamic(&self) -> bool {
        !self.features_from_metadata
    }

    /// Slot-independent features declared in metadata
    pub fn declared(&self) -> &BTreeSet<Feature> {
        &self.declared
    }

    /// Copy of this info with its metadata ignored
    pub fn as_dynamic(&self) -> Self {
        Self {
            features_from_metadata: false,
            declared: BTreeSet::new(),
            discovered: FeatureSet::new(),
            ..self.clone()
        }
    }

    /// Copy of this info carrying a completed query result
    pub fn with_discovered(&self, discovered: FeatureSet) -> Self {
        Self {
            discovered,
            ..self.clone()
        }
    }

    /// Every pair this package can provide with `slot_count` slots active.
    ///
    /// Metadata features are expanded to every slot; query results are
    /// clipped to the active slot range.
    pub fn supported_features(&self, slot_count: usize) -> FeatureSet {
        if self.features_from_metadata {
            (0..slot_count)
                .flat_map(|slot| {
                    self.declared
                        .iter()
                        .map(move |&feature| FeatureSlotPair::new(slot, feature))
                })
                .collect()
        } else {
            self.discovered
                .iter()
                .filter(|p| p.slot < slot_count)
                .copied()
                .collect()
        }
    }
}

/// Parse declared metadata names into features.
///
/// # Errors
///
/// Returns a `Metadata` error naming the first unrecognised feature.
pub fn parse_declared_features(
    package: &str,
    names: &BTreeSet<String>,
) -> Result<BTreeSet<Feature>> {
    let mut features = BTreeSet::new();
    for name in names {
        let feature = Feature::from_str(name.trim()).map_err(|_| {
            ResolverError::metadata(package, format!("unknown feature '{}'", name))
        })?;
        features.insert(feature);
    }

    if features.contains(&Feature::EmergencyVoice) && !features.contains(&Feature::Voice) {
        debug!(
            "{} declares emergency_voice without voice, dropping it",
            package
        );
        features.remove(&Feature::EmergencyVoice);
    }
    Ok(features)
}

/// Snapshot of candidate packages keyed by package name.
#[derive(Debug, Clone, Default)]
pub struct CandidateRegistry {
    packages: BTreeMap<PackageName, ServiceInfo>,
}

impl CandidateRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from a discovery scan.
    ///
    /// `carrier_targets` are the packages currently named as a carrier
    /// override on any slot; they are always treated as dynamic.
    pub fn scan(
        discovery: &dyn PackageDiscovery,
        carrier_targets: &BTreeSet<PackageName>,
    ) -> Result<Self> {
        let candidates = discovery.discover_candidates()?;
        Ok(Self::from_candidates(candidates, carrier_targets))
    }

    /// Build a registry from already-discovered candidates.
    pub fn from_candidates(
        candidates: Vec<CandidatePackage>,
        carrier_targets: &BTreeSet<PackageName>,
    ) -> Self {
        let mut registry = Self::new();

        for candidate in candidates {
            let package = candidate.component.package.clone();
            if !candidate.has_bind_permission {
                warn!(
                    "{} does not hold the bind permission, skipping",
                    candidate.component
                );
                continue;
            }
            if registry.packages.contains_key(&package) {
                warn!(
                    "{} exposes more than one service component, keeping the first",
                    package
                );
                continue;
            }

            let info = if carrier_targets.contains(&package)
                || candidate.declared_features.is_empty()
            {
                ServiceInfo::dynamic(candidate.component)
            } else {
                match parse_declared_features(&package, &candidate.declared_features) {
                    Ok(declared) => ServiceInfo::from_metadata(candidate.component, declared),
                    Err(e) => {
                        warn!("{}; treating package as declaring no features", e);
                        ServiceInfo::from_metadata(candidate.component, BTreeSet::new())
                    }
                }
            };
            debug!(
                "Discovered {} ({})",
                info.component,
                if info.is_dynamic() { "dynamic" } else { "metadata" }
            );
            registry.packages.insert(package, info);
        }

        registry
    }

    /// Get a package's info
    pub fn get(&self, package: &str) -> Option<&ServiceInfo> {
        self.packages.get(package)
    }

    pub fn contains(&self, package: &str) -> bool {
        self.packages.contains_key(package)
    }

    /// Insert or replace a package's info, returning the previous one
    pub fn insert(&mut self, info: ServiceInfo) -> Option<ServiceInfo> {
        self.packages.insert(info.package().to_string(), info)
    }

    /// Remove a package from the snapshot
    pub fn remove(&mut self, package: &str) -> Option<ServiceInfo> {
        self.packages.remove(package)
    }

    /// Get all packages
    pub fn all(&self) -> impl Iterator<Item = &ServiceInfo> {
        self.packages.values()
    }

    pub fn package_names(&self) -> BTreeSet<PackageName> {
        self.packages.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.packages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedDiscovery(Vec<CandidatePackage>);

    impl PackageDiscovery for FixedDiscovery {
        fn discover_candidates(&self) -> Result<Vec<CandidatePackage>> {
            Ok(self.0.clone())
        }
    }

    fn device(features: &[&str]) -> CandidatePackage {
        CandidatePackage::new(ComponentName::new("com.device", "DeviceService"))
            .with_features(features.iter().copied())
    }

    #[test]
    fn test_scan_parses_metadata() {
        let discovery = FixedDiscovery(vec![device(&["emergency_voice", "voice", "messaging"])]);
        let registry = CandidateRegistry::scan(&discovery, &BTreeSet::new()).unwrap();

        let info = registry.get("com.device").unwrap();
        assert!(info.features_from_metadata);
        assert_eq!(info.declared().len(), 3);
        assert!(info
            .supported_features(1)
            .contains(&FeatureSlotPair::new(0, Feature::EmergencyVoice)));
    }

    #[test]
    fn test_carrier_target_ignores_metadata() {
        let carrier = CandidatePackage::new(ComponentName::new("com.carrier", "CarrierService"))
            .with_features(["voice", "messaging"]);
        let targets: BTreeSet<PackageName> = ["com.carrier".to_string()].into_iter().collect();
        let registry = CandidateRegistry::from_candidates(vec![carrier], &targets);

        let info = registry.get("com.carrier").unwrap();
        assert!(!info.features_from_metadata);
        assert!(info.supported_features(1).is_empty());
    }

    #[test]
    fn test_no_metadata_is_dynamic() {
        let registry = CandidateRegistry::from_candidates(vec![device(&[])], &BTreeSet::new());
        assert!(registry.get("com.device").unwrap().is_dynamic());
    }

    #[test]
    fn test_missing_permission_excluded() {
        let candidate = device(&["voice"]).with_permission(false);
        let registry = CandidateRegistry::from_candidates(vec![candidate], &BTreeSet::new());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_emergency_without_voice_dropped() {
        let registry = CandidateRegistry::from_candidates(
            vec![device(&["emergency_voice", "messaging"])],
            &BTreeSet::new(),
        );
        let info = registry.get("com.device").unwrap();
        assert!(!info.declared().contains(&Feature::EmergencyVoice));
        assert!(info.declared().contains(&Feature::Messaging));
    }

    #[test]
    fn test_malformed_metadata_does_not_abort_scan() {
        let bad = CandidatePackage::new(ComponentName::new("com.bad", "BadService"))
            .with_features(["voice", "hologram"]);
        let good = device(&["voice"]);
        let registry = CandidateRegistry::from_candidates(vec![bad, good], &BTreeSet::new());

        assert_eq!(registry.len(), 2);
        let bad = registry.get("com.bad").unwrap();
        assert!(bad.features_from_metadata);
        assert!(bad.supported_features(2).is_empty());
        let good = registry.get("com.device").unwrap().supported_features(2);
        assert!(good.contains(&FeatureSlotPair::new(1, Feature::Voice)));
    }

    #[test]
    fn test_metadata_expands_per_slot() {
        let registry =
            CandidateRegistry::from_candidates(vec![device(&["voice", "messaging"])], &BTreeSet::new());
        let supported = registry.get("com.device").unwrap().supported_features(2);
        assert_eq!(supported.len(), 4);
        assert!(supported.contains(&FeatureSlotPair::new(1, Feature::Messaging)));
    }

    #[test]
    fn test_discovered_clipped_to_slot_range() {
        let info = ServiceInfo::dynamic(ComponentName::new("com.carrier", "C")).with_discovered(
            [
                FeatureSlotPair::new(0, Feature::Voice),
                FeatureSlotPair::new(1, Feature::Voice),
            ]
            .into_iter()
            .collect(),
        );
        assert_eq!(info.supported_features(1).len(), 1);
        assert!(info
            .supported_features(2)
            .contains(&FeatureSlotPair::new(1, Feature::Voice)));
    }

    #[test]
    fn test_duplicate_package_keeps_first() {
        let first = device(&["voice"]);
        let second = CandidatePackage::new(ComponentName::new("com.device", "Other"))
            .with_features(["messaging"]);
        let registry = CandidateRegistry::from_candidates(vec![first, second], &BTreeSet::new());
        assert_eq!(registry.get("com.device").unwrap().component.class, "DeviceService");
    }
}
