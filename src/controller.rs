//! Service controllers
//!
//! A `ServiceController` is the handle through which one package's service is
//! bound, reconfigured, and enabled per slot. Controllers are produced by an
//! injected `ControllerFactory` and owned by the `ControllerRegistry`, which
//! also keeps the last-applied feature set of each bound package and the
//! enable/disable de-duplication state.
//!
//! # Enable gating
//!
//! A controller is enabled on a slot only after every pair it holds on that slot
//! has reported "created". An enable requested earlier is remembered and
//! delivered when the last pair is created. Once enabled, repeated enable
//! requests are swallowed until a disable for that slot goes through.

use crate::error::Result;
use crate::logic::diff::ControllerOp;
use crate::types::{
    describe, ComponentName, FeatureSet, FeatureSlotPair, PackageName, SlotId, SlotSubscriptions,
    SubscriptionId,
};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

/// Lifecycle operations on one package's service.
pub trait ServiceController: Send {
    /// Component this controller was created for
    fn component(&self) -> &ComponentName;

    fn bind(&mut self, features: &FeatureSet, subscriptions: &SlotSubscriptions);

    fn unbind(&mut self);

    fn change_features(&mut self, features: &FeatureSet, subscriptions: &SlotSubscriptions);

    fn enable_feature(&mut self, slot: SlotId, subscription: Option<SubscriptionId>);

    fn disable_feature(&mut self, slot: SlotId, subscription: Option<SubscriptionId>);
}

/// Creates controllers for components.
pub trait ControllerFactory: Send {
    fn create(&mut self, component: &ComponentName) -> Result<Box<dyn ServiceController>>;
}

struct BoundController {
    controller: Box<dyn ServiceController>,
    features: FeatureSet,
    created: FeatureSet,
    enabled: BTreeSet<SlotId>,
}

impl BoundController {
    fn slots(&self) -> BTreeSet<SlotId> {
        self.features.iter().map(|p| p.slot).collect()
    }

    fn ready_on(&self, slot: SlotId) -> bool {
        let mut on_slot = self.features.iter().filter(|p| p.slot == slot).peekable();
        on_slot.peek().is_some() && on_slot.all(|p| self.created.contains(p))
    }

    /// Issue the enable for `slot` if it is wanted, ready, and not yet sent.
    fn try_enable(&mut self, slot: SlotId, subscription: Option<SubscriptionId>) {
        if self.enabled.contains(&slot) || !self.ready_on(slot) {
            return;
        }
        debug!("enable {} on slot {}", self.controller.component(), slot);
        self.controller.enable_feature(slot, subscription);
        self.enabled.insert(slot);
    }

    fn retain_to_features(&mut self) {
        let features = &self.features;
        self.created.retain(|p| features.contains(p));
        let slots = self.slots();
        self.enabled.retain(|s| slots.contains(s));
    }
}

/// Owns the live controllers, keyed by package.
pub struct ControllerRegistry {
    factory: Box<dyn ControllerFactory>,
    bound: BTreeMap<PackageName, BoundController>,
    enable_requested: BTreeSet<SlotId>,
}

impl ControllerRegistry {
    pub fn new(factory: Box<dyn ControllerFactory>) -> Self {
        Self {
            factory,
            bound: BTreeMap::new(),
            enable_requested: BTreeSet::new(),
        }
    }

    /// Apply diff operations in order.
    ///
    /// Returns the packages whose controller could not be created; they hold
    /// nothing afterwards.
    pub fn apply(
        &mut self,
        ops: &[ControllerOp],
        subscriptions: &SlotSubscriptions,
    ) -> Vec<PackageName> {
        let mut failed = Vec::new();

        for op in ops {
            info!("{}", op);
            match op {
                ControllerOp::Unbind { package } => self.unbind(package),
                ControllerOp::Bind {
                    component,
                    features,
                }
                | ControllerOp::ChangeFeatures {
                    component,
                    features,
                } => {
                    let reusable = self
                        .bound
                        .get(&component.package)
                        .is_some_and(|b| b.controller.component() == component);

                    if reusable {
                        self.change(&component.package, features, subscriptions);
                    } else {
                        if self.bound.contains_key(&component.package) {
                            debug!(
                                "Component of {} changed, recreating controller",
                                component.package
                            );
                            self.unbind(&component.package);
                        }
                        if let Err(e) = self.bind(component, features, subscriptions) {
                            warn!("Could not create controller for {}: {}", component, e);
                            failed.push(component.package.clone());
                        }
                    }
                }
            }
        }
        failed
    }

    fn bind(
        &mut self,
        component: &ComponentName,
        features: &FeatureSet,
        subscriptions: &SlotSubscriptions,
    ) -> Result<()> {
        let mut controller = self.factory.create(component)?;
        controller.bind(features, subscriptions);
        self.bound.insert(
            component.package.clone(),
            BoundController {
                controller,
                features: features.clone(),
                created: FeatureSet::new(),
                enabled: BTreeSet::new(),
            },
        );
        Ok(())
    }

    fn change(&mut self, package: &str, features: &FeatureSet, subscriptions: &SlotSubscriptions) {
        if let Some(bound) = self.bound.get_mut(package) {
            bound.controller.change_features(features, subscriptions);
            bound.features = features.clone();
            bound.retain_to_features();
        }
    }

    /// Unbind and drop the controller of `package`, if any.
    pub fn unbind(&mut self, package: &str) {
        if let Some(mut bound) = self.bound.remove(package) {
            bound.controller.unbind();
        }
    }

    /// Record that `pair` was created by `component`'s service.
    pub fn feature_created(
        &mut self,
        component: &ComponentName,
        pair: FeatureSlotPair,
        subscriptions: &SlotSubscriptions,
    ) {
        let wanted = self.enable_requested.contains(&pair.slot);
        let subscription = subscriptions.get(&pair.slot).copied().flatten();

        let Some(bound) = self.bound_for(component) else {
            debug!("Feature {} created by unbound {}, ignoring", pair, component);
            return;
        };
        if !bound.features.contains(&pair) {
            debug!("{} created {} which it does not hold", component, pair);
            return;
        }
        bound.created.insert(pair);
        if wanted {
            bound.try_enable(pair.slot, subscription);
        }
    }

    /// Record that `pair` was torn down by `component`'s service.
    pub fn feature_removed(&mut self, component: &ComponentName, pair: FeatureSlotPair) {
        if let Some(bound) = self.bound_for(component) {
            bound.created.remove(&pair);
        }
    }

    /// Request enable on `slot` for every controller holding pairs there.
    pub fn enable_slot(&mut self, slot: SlotId, subscription: Option<SubscriptionId>) {
        self.enable_requested.insert(slot);
        for bound in self.bound.values_mut() {
            bound.try_enable(slot, subscription);
        }
    }

    /// Disable `slot` on every controller enabled there.
    pub fn disable_slot(&mut self, slot: SlotId, subscription: Option<SubscriptionId>) {
        self.enable_requested.remove(&slot);
        for bound in self.bound.values_mut() {
            if bound.enabled.remove(&slot) {
                debug!("disable {} on slot {}", bound.controller.component(), slot);
                bound.controller.disable_feature(slot, subscription);
            }
        }
    }

    /// Drop enable requests for slots at or beyond `slot_count`.
    pub fn retain_slots(&mut self, slot_count: usize) {
        self.enable_requested.retain(|slot| *slot < slot_count);
    }

    fn bound_for(&mut self, component: &ComponentName) -> Option<&mut BoundController> {
        self.bound
            .get_mut(&component.package)
            .filter(|b| b.controller.component() == component)
    }

    /// Last-applied feature set of `package`
    pub fn bound_features(&self, package: &str) -> Option<&FeatureSet> {
        self.bound.get(package).map(|b| &b.features)
    }

    /// Component the controller of `package` was created for
    pub fn bound_component(&self, package: &str) -> Option<&ComponentName> {
        self.bound.get(package).map(|b| b.controller.component())
    }

    pub fn bound_packages(&self) -> impl Iterator<Item = &str> {
        self.bound.keys().map(String::as_str)
    }

    pub fn is_enabled(&self, package: &str, slot: SlotId) -> bool {
        self.bound
            .get(package)
            .is_some_and(|b| b.enabled.contains(&slot))
    }

    /// One line per bound controller, for diagnostics
    pub fn summary(&self) -> Vec<String> {
        self.bound
            .values()
            .map(|b| format!("{} {}", b.controller.component(), describe(&b.features)))
            .collect()
    }

    /// Unbind everything.
    pub fn shutdown(&mut self) {
        let packages: Vec<PackageName> = self.bound.keys().cloned().collect();
        for package in packages {
            self.unbind(&package);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ResolverError;
    use crate::types::Feature;
    use std::sync::{Arc, Mutex};

    type Log = Arc<Mutex<Vec<String>>>;

    struct TestController {
        component: ComponentName,
        log: Log,
    }

    impl ServiceController for TestController {
        fn component(&self) -> &ComponentName {
            &self.component
        }
        fn bind(&mut self, features: &FeatureSet, _subs: &SlotSubscriptions) {
            self.log.lock().unwrap().push(format!("bind {}", describe(features)));
        }
        fn unbind(&mut self) {
            self.log.lock().unwrap().push("unbind".into());
        }
        fn change_features(&mut self, features: &FeatureSet, _subs: &SlotSubscriptions) {
            self.log.lock().unwrap().push(format!("change {}", describe(features)));
        }
        fn enable_feature(&mut self, slot: SlotId, _sub: Option<SubscriptionId>) {
            self.log.lock().unwrap().push(format!("enable {}", slot));
        }
        fn disable_feature(&mut self, slot: SlotId, _sub: Option<SubscriptionId>) {
            self.log.lock().unwrap().push(format!("disable {}", slot));
        }
    }

    struct TestFactory {
        log: Log,
        refuse: Option<String>,
    }

    impl ControllerFactory for TestFactory {
        fn create(&mut self, component: &ComponentName) -> Result<Box<dyn ServiceController>> {
            if self.refuse.as_deref() == Some(component.package.as_str()) {
                return Err(ResolverError::controller("refused"));
            }
            Ok(Box::new(TestController {
                component: component.clone(),
                log: Arc::clone(&self.log),
            }))
        }
    }

    fn registry() -> (ControllerRegistry, Log) {
        let log: Log = Arc::default();
        let factory = TestFactory {
            log: Arc::clone(&log),
            refuse: None,
        };
        (ControllerRegistry::new(Box::new(factory)), log)
    }

    fn device() -> ComponentName {
        ComponentName::new("com.device", "DeviceService")
    }

    fn slot0() -> FeatureSet {
        [
            FeatureSlotPair::new(0, Feature::Voice),
            FeatureSlotPair::new(0, Feature::Messaging),
        ]
        .into_iter()
        .collect()
    }

    fn bind_slot0(registry: &mut ControllerRegistry) {
        let ops = [ControllerOp::Bind {
            component: device(),
            features: slot0(),
        }];
        assert!(registry.apply(&ops, &SlotSubscriptions::new()).is_empty());
    }

    #[test]
    fn test_enable_waits_for_all_created() {
        let (mut registry, log) = registry();
        bind_slot0(&mut registry);
        let subs = SlotSubscriptions::new();

        registry.enable_slot(0, Some(1));
        assert!(!registry.is_enabled("com.device", 0));

        registry.feature_created(&device(), FeatureSlotPair::new(0, Feature::Voice), &subs);
        assert!(!registry.is_enabled("com.device", 0));
        registry.feature_created(&device(), FeatureSlotPair::new(0, Feature::Messaging), &subs);
        assert!(registry.is_enabled("com.device", 0));

        let enables = log.lock().unwrap().iter().filter(|l| *l == "enable 0").count();
        assert_eq!(enables, 1);
    }

    #[test]
    fn test_enable_disable_deduplicated() {
        let (mut registry, log) = registry();
        bind_slot0(&mut registry);
        let subs = SlotSubscriptions::new();
        for pair in slot0() {
            registry.feature_created(&device(), pair, &subs);
        }

        registry.enable_slot(0, None);
        registry.enable_slot(0, None);
        registry.disable_slot(0, None);
        registry.disable_slot(0, None);

        let log = log.lock().unwrap();
        assert_eq!(log.iter().filter(|l| *l == "enable 0").count(), 1);
        assert_eq!(log.iter().filter(|l| *l == "disable 0").count(), 1);
    }

    #[test]
    fn test_factory_error_reported() {
        let log: Log = Arc::default();
        let factory = TestFactory {
            log,
            refuse: Some("com.device".into()),
        };
        let mut registry = ControllerRegistry::new(Box::new(factory));
        let failed = registry.apply(
            &[ControllerOp::Bind {
                component: device(),
                features: slot0(),
            }],
            &SlotSubscriptions::new(),
        );
        assert_eq!(failed, vec!["com.device".to_string()]);
        assert!(registry.bound_features("com.device").is_none());
    }

    #[test]
    fn test_component_change_recreates_controller() {
        let (mut registry, log) = registry();
        bind_slot0(&mut registry);

        let renamed = ComponentName::new("com.device", "NewService");
        registry.apply(
            &[ControllerOp::ChangeFeatures {
                component: renamed.clone(),
                features: slot0(),
            }],
            &SlotSubscriptions::new(),
        );

        assert_eq!(registry.bound_component("com.device"), Some(&renamed));
        let log = log.lock().unwrap();
        assert_eq!(log.len(), 3);
        assert_eq!(log[1], "unbind");
        assert!(log[2].starts_with("bind"));
    }

    #[test]
    fn test_unbind_removes_controller() {
        let (mut registry, log) = registry();
        bind_slot0(&mut registry);
        registry.apply(
            &[ControllerOp::Unbind {
                package: "com.device".into(),
            }],
            &SlotSubscriptions::new(),
        );
        assert_eq!(registry.bound_packages().count(), 0);
        assert_eq!(log.lock().unwrap().last().map(String::as_str), Some("unbind"));
    }

    #[test]
    fn test_shutdown_unbinds_everything() {
        let (mut registry, log) = registry();
        bind_slot0(&mut registry);
        assert_eq!(registry.summary().len(), 1);

        registry.shutdown();
        assert!(registry.summary().is_empty());
        assert_eq!(log.lock().unwrap().last().map(String::as_str), Some("unbind"));
    }

    #[test]
    fn test_removed_slot_forgets_enable_request() {
        let (mut registry, log) = registry();
        bind_slot0(&mut registry);
        registry.enable_slot(0, None);
        registry.retain_slots(0);

        let subs = SlotSubscriptions::new();
        for pair in slot0() {
            registry.feature_created(&device(), pair, &subs);
        }
        assert!(!registry.is_enabled("com.device", 0));
        assert!(!log.lock().unwrap().iter().any(|l| l.starts_with("enable")));
    }
}
