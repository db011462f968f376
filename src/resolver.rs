//! Resolution and binding engine
//!
//! The `Resolver` owns everything that changes while the system runs: the
//! candidate snapshot, each package's discovery state, pending queries, the
//! cached carrier overrides, the slot/subscription map, and the last-applied
//! assignment. Every trigger is handled to completion by `handle_event` before
//! the next one is looked at.
//!
//! # Reconciliation pass
//!
//! 1. Issue capability queries for governing packages still `Unknown`
//! 2. Compute the target assignment (`logic::assignment`)
//! 3. Diff it against the last-applied one (`logic::diff`)
//! 4. Apply the operations through the `ControllerRegistry`
//! 5. Persist the target; if a controller could not be created, fail that
//!    package and run again so the freed pairs fall through
//!
//! Nothing in here is fatal. Errors from collaborators are logged and end up
//! as fewer bound pairs.

use crate::config::{ConfigSource, DeviceDefaults};
use crate::config_file::ResolverConfig;
use crate::controller::{ControllerFactory, ControllerRegistry};
use crate::event_loop::ResolverEvent;
use crate::logic::assignment::{owner_in, CarrierSelection, PackageView, ResolutionContext, Scope};
use crate::logic::diff::{diff_assignments, DiffHints};
use crate::package_state::{PackageLifecycle, PackageState};
use crate::query::{CapabilityQuerier, CompletionVerdict, IssueOutcome, QueryTracker};
use crate::registry::{CandidateRegistry, PackageDiscovery, ServiceInfo};
use crate::types::{
    describe, strip_orphan_emergency, Assignment, ComponentName, Feature, FeatureClass,
    FeatureSet, FeatureSlotPair, PackageName, SlotId, SlotSubscriptions, SubscriptionId,
};
use std::collections::{BTreeMap, BTreeSet};
use std::ops::ControlFlow;
use strum::IntoEnumIterator;
use tracing::{debug, error, info, warn};

/// External collaborators the resolver drives.
pub struct ResolverDeps {
    pub discovery: Box<dyn PackageDiscovery>,
    pub config_source: Box<dyn ConfigSource>,
    pub querier: Box<dyn CapabilityQuerier>,
    pub factory: Box<dyn ControllerFactory>,
}

/// The engine. See the module docs.
pub struct Resolver {
    device_defaults: DeviceDefaults,
    slot_count: usize,

    discovery: Box<dyn PackageDiscovery>,
    config_source: Box<dyn ConfigSource>,
    querier: Box<dyn CapabilityQuerier>,
    controllers: ControllerRegistry,

    registry: CandidateRegistry,
    lifecycles: BTreeMap<PackageName, PackageLifecycle>,
    queries: QueryTracker,
    carrier: CarrierSelection,
    subscriptions: SlotSubscriptions,
    assignment: Assignment,

    resubscribed: BTreeSet<SlotId>,
    next_generation: u64,
}

impl Resolver {
    pub fn new(config: &ResolverConfig, deps: ResolverDeps) -> Self {
        let slot_count = config.slot_count.max(1);
        Self {
            device_defaults: config.device_defaults.clone(),
            slot_count,
            discovery: deps.discovery,
            config_source: deps.config_source,
            querier: deps.querier,
            controllers: ControllerRegistry::new(deps.factory),
            registry: CandidateRegistry::new(),
            lifecycles: BTreeMap::new(),
            queries: QueryTracker::new(config.max_query_start_attempts),
            carrier: CarrierSelection::new(),
            subscriptions: (0..slot_count).map(|s| (s, None)).collect(),
            assignment: Assignment::new(),
            resubscribed: BTreeSet::new(),
            next_generation: 1,
        }
    }

    /// Read configuration, scan candidates, and bind the initial assignment.
    pub fn initialize(&mut self) {
        info!(
            "Initializing resolver: {} slot(s), device defaults voice='{}' messaging='{}'",
            self.slot_count, self.device_defaults.voice, self.device_defaults.messaging
        );
        for slot in 0..self.slot_count {
            self.refresh_carrier_slot(slot);
        }
        self.rescan(None);
        self.reconcile(Scope::All);
    }

    /// Handle one trigger to completion.
    pub fn handle_event(&mut self, event: ResolverEvent) -> ControlFlow<()> {
        debug!("Handling {:?}", event);
        match event {
            ResolverEvent::PackageAdded(package) | ResolverEvent::PackageChanged(package) => {
                self.rescan(Some(&package));
                self.reconcile(Scope::All);
            }
            ResolverEvent::PackageRemoved(package) => {
                self.rescan(None);
                if self.registry.contains(&package) {
                    self.forget_package(&package);
                }
                self.reconcile(Scope::All);
            }
            ResolverEvent::BootCompleted => {
                self.rescan(None);
                self.reconcile(Scope::All);
            }
            ResolverEvent::CarrierConfigChanged { subscription, slot } => {
                self.on_carrier_config_changed(slot, subscription);
            }
            ResolverEvent::SlotCountChanged(count) => self.on_slot_count_changed(count),
            ResolverEvent::QueryComplete {
                component,
                features,
            } => self.on_query_complete(&component, features),
            ResolverEvent::QueryPermanentError(component) => {
                self.on_query_permanent_error(&component)
            }
            ResolverEvent::BindPermanentError(component) => {
                self.on_bind_permanent_error(&component)
            }
            ResolverEvent::FeatureCreated { component, pair } => {
                self.controllers
                    .feature_created(&component, pair, &self.subscriptions);
            }
            ResolverEvent::FeatureRemoved { component, pair } => {
                self.controllers.feature_removed(&component, pair);
            }
            ResolverEvent::EnableSlot(slot) => {
                let subscription = self.subscription_of(slot);
                self.controllers.enable_slot(slot, subscription);
            }
            ResolverEvent::DisableSlot(slot) => {
                let subscription = self.subscription_of(slot);
                self.controllers.disable_slot(slot, subscription);
            }
            ResolverEvent::Shutdown => {
                info!("Resolver shutting down");
                for line in self.controllers.summary() {
                    debug!("Releasing {}", line);
                }
                self.controllers.shutdown();
                self.assignment.clear();
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    // ========================================================================
    // Exposed queries
    // ========================================================================

    /// Whether some package owns `(slot, feature)` in the applied assignment.
    pub fn is_feature_provisioned(&self, slot: SlotId, feature: Feature) -> bool {
        self.bound_package(slot, feature).is_some()
    }

    /// The package whose configuration governs `feature` on `slot`.
    pub fn governing_package(&self, slot: SlotId, feature: Feature) -> Option<PackageName> {
        let views = self.package_views();
        self.context(&views)
            .governing_package(slot, feature.class())
            .map(str::to_string)
    }

    pub fn cached_service_info(&self, package: &str) -> Option<&ServiceInfo> {
        self.registry.get(package)
    }

    /// Package owning `(slot, feature)` in the applied assignment
    pub fn bound_package(&self, slot: SlotId, feature: Feature) -> Option<&str> {
        owner_in(&self.assignment, &FeatureSlotPair::new(slot, feature))
    }

    pub fn assignment(&self) -> &Assignment {
        &self.assignment
    }

    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    pub fn slot_subscriptions(&self) -> &SlotSubscriptions {
        &self.subscriptions
    }

    pub fn package_state(&self, package: &str) -> Option<PackageState> {
        self.lifecycles.get(package).map(PackageLifecycle::state)
    }

    /// Every tracked package with its discovery state
    pub fn package_states(&self) -> impl Iterator<Item = (&str, PackageState)> {
        self.lifecycles
            .iter()
            .map(|(package, lifecycle)| (package.as_str(), lifecycle.state()))
    }

    pub fn controllers(&self) -> &ControllerRegistry {
        &self.controllers
    }

    // ========================================================================
    // Candidate snapshot
    // ========================================================================

    fn carrier_targets(&self) -> BTreeSet<PackageName> {
        self.carrier.values().cloned().collect()
    }

    fn new_generation(&mut self) -> u64 {
        let generation = self.next_generation;
        self.next_generation += 1;
        generation
    }

    /// Start a fresh generation for `info` and make it current.
    fn track(&mut self, info: ServiceInfo) {
        let generation = self.new_generation();
        let package = info.package().to_string();
        let lifecycle = if info.is_dynamic() {
            PackageLifecycle::new(generation)
        } else {
            PackageLifecycle::known(generation)
        };
        debug!(
            "Tracking {} as {} (gen {})",
            info.component,
            lifecycle.state(),
            generation
        );
        let renamed = self
            .registry
            .get(&package)
            .is_some_and(|old| old.component != info.component);
        if renamed {
            // Results for the old component are dropped on arrival
            debug!("Component of {} changed, abandoning its pending query", package);
            self.queries.forget(&package);
        } else {
            self.queries.reset(&package);
        }
        self.lifecycles.insert(package, lifecycle);
        self.registry.insert(info);
    }

    fn forget_package(&mut self, package: &str) {
        info!("Package {} removed", package);
        self.registry.remove(package);
        self.lifecycles.remove(package);
        self.queries.forget(package);
    }

    /// Rebuild the snapshot from discovery, keeping what did not change.
    ///
    /// `changed` names a package whose change event forces a new generation.
    fn rescan(&mut self, changed: Option<&str>) {
        let targets = self.carrier_targets();
        let fresh = match CandidateRegistry::scan(self.discovery.as_ref(), &targets) {
            Ok(fresh) => fresh,
            Err(e) => {
                error!("Candidate discovery failed, keeping previous snapshot: {}", e);
                return;
            }
        };

        let gone: Vec<PackageName> = self
            .registry
            .package_names()
            .into_iter()
            .filter(|p| !fresh.contains(p))
            .collect();
        for package in gone {
            self.forget_package(&package);
        }

        for info in fresh.all() {
            let unchanged = changed != Some(info.package())
                && self
                    .registry
                    .get(info.package())
                    .is_some_and(|old| same_declaration(old, info));
            if !unchanged {
                if self.registry.contains(info.package()) {
                    info!("Package {} changed", info.package());
                } else {
                    info!("Package {} discovered", info.component);
                }
                self.track(info.clone());
            }
        }
        debug!("Candidate snapshot holds {} package(s)", self.registry.len());
    }

    /// Packages newly named as a carrier override lose their metadata.
    fn convert_carrier_targets(&mut self) {
        let converts: Vec<ServiceInfo> = self
            .carrier_targets()
            .iter()
            .filter_map(|p| self.registry.get(p))
            .filter(|info| info.features_from_metadata)
            .map(ServiceInfo::as_dynamic)
            .collect();
        for info in converts {
            info!(
                "{} is now a carrier override, ignoring its metadata",
                info.package()
            );
            self.track(info);
        }
    }

    // ========================================================================
    // Configuration
    // ========================================================================

    fn subscription_of(&self, slot: SlotId) -> Option<SubscriptionId> {
        self.subscriptions.get(&slot).copied().flatten()
    }

    fn refresh_carrier_slot(&mut self, slot: SlotId) {
        for class in FeatureClass::iter() {
            match self.config_source.carrier_override(slot, class) {
                Some(package) => {
                    debug!("Carrier override for ({}, {}): {}", slot, class, package);
                    self.carrier.insert((slot, class), package);
                }
                None => {
                    self.carrier.remove(&(slot, class));
                }
            }
        }
    }

    fn on_carrier_config_changed(&mut self, slot: SlotId, subscription: Option<SubscriptionId>) {
        if slot >= self.slot_count {
            warn!(
                "Carrier config change for slot {} ignored, only {} slot(s) active",
                slot, self.slot_count
            );
            return;
        }
        if self.subscriptions.insert(slot, subscription) != Some(subscription) {
            debug!("Slot {} now on subscription {:?}", slot, subscription);
            self.resubscribed.insert(slot);
        }

        self.refresh_carrier_slot(slot);
        self.convert_carrier_targets();

        // A known dynamic carrier is asked again for what it supports
        let requery: BTreeSet<PackageName> = FeatureClass::iter()
            .filter_map(|class| self.carrier.get(&(slot, class)).cloned())
            .filter(|p| {
                self.registry.get(p).is_some_and(ServiceInfo::is_dynamic)
                    && self.package_state(p) == Some(PackageState::Known)
            })
            .collect();
        for package in requery {
            if let Some(info) = self.registry.get(&package).cloned() {
                debug!("Re-querying carrier package {}", package);
                self.track(info);
            }
        }

        self.reconcile(Scope::Slot(slot));
    }

    fn on_slot_count_changed(&mut self, count: usize) {
        if count == 0 {
            warn!("Ignoring slot count of 0");
            return;
        }
        if count == self.slot_count {
            return;
        }
        info!("Slot count changed {} -> {}", self.slot_count, count);
        let previous = self.slot_count;
        self.slot_count = count;

        if count < previous {
            self.controllers.retain_slots(count);
            self.subscriptions.retain(|slot, _| *slot < count);
            self.carrier.retain(|(slot, _), _| *slot < count);
            self.resubscribed.retain(|slot| *slot < count);
        } else {
            for slot in previous..count {
                self.subscriptions.insert(slot, None);
                self.refresh_carrier_slot(slot);
            }
            self.convert_carrier_targets();
        }
        self.reconcile(Scope::All);
    }

    // ========================================================================
    // Queries
    // ========================================================================

    fn lifecycle_transition(&mut self, package: &str, target: PackageState) {
        if let Some(lifecycle) = self.lifecycles.get_mut(package) {
            match lifecycle.transition_to(target) {
                Ok(state) => debug!("{} is now {}", package, state),
                Err(e) => debug!("{}: {}", package, e),
            }
        }
    }

    fn issue_queries(&mut self, scope: Scope) {
        let wanted = {
            let views = self.package_views();
            self.context(&views).packages_to_query(scope)
        };

        for package in wanted {
            let (Some(info), Some(lifecycle)) =
                (self.registry.get(&package), self.lifecycles.get(&package))
            else {
                continue;
            };
            let component = info.component.clone();
            let generation = lifecycle.generation();

            match self
                .queries
                .issue(&component, generation, self.querier.as_mut())
            {
                IssueOutcome::Started => {
                    self.lifecycle_transition(&package, PackageState::Querying)
                }
                IssueOutcome::InFlight | IssueOutcome::Deferred => {}
                IssueOutcome::Exhausted => {
                    warn!("Giving up on querying {}", component);
                    self.lifecycle_transition(&package, PackageState::Failed);
                }
            }
        }
    }

    /// Look up a tracked package by the component an event refers to.
    fn current_generation(&self, component: &ComponentName) -> Option<u64> {
        let info = self.registry.get(&component.package)?;
        if &info.component != component {
            debug!("{} no longer matches {}", component, info.component);
            return None;
        }
        self.lifecycles
            .get(&component.package)
            .map(PackageLifecycle::generation)
    }

    fn on_query_complete(&mut self, component: &ComponentName, mut features: FeatureSet) {
        let Some(generation) = self.current_generation(component) else {
            debug!("Ignoring query result for untracked {}", component);
            return;
        };
        let package = component.package.as_str();

        match self.queries.complete(package, generation) {
            CompletionVerdict::Accept => {
                features.retain(|p| p.slot < self.slot_count);
                strip_orphan_emergency(&mut features);
                info!("{} supports {}", component, describe(&features));

                if let Some(info) = self.registry.get(package) {
                    let updated = info.with_discovered(features);
                    self.registry.insert(updated);
                }
                self.lifecycle_transition(package, PackageState::Known);
                self.reconcile(Scope::All);
            }
            CompletionVerdict::Stale => {
                debug!("Stale query result for {}, asking again", component);
                self.reconcile(Scope::All);
            }
            CompletionVerdict::Unexpected => {
                debug!("Duplicate query result for {}, ignoring", component);
                if self.package_state(package) == Some(PackageState::Unknown) {
                    self.reconcile(Scope::All);
                }
            }
        }
    }

    fn on_query_permanent_error(&mut self, component: &ComponentName) {
        let Some(generation) = self.current_generation(component) else {
            return;
        };
        let package = component.package.as_str();

        match self.queries.complete(package, generation) {
            CompletionVerdict::Accept => {
                warn!("Capability query for {} failed permanently", component);
                self.lifecycle_transition(package, PackageState::Failed);
                self.reconcile(Scope::All);
            }
            CompletionVerdict::Stale => self.reconcile(Scope::All),
            CompletionVerdict::Unexpected => {
                debug!("Duplicate query error for {}, ignoring", component)
            }
        }
    }

    fn on_bind_permanent_error(&mut self, component: &ComponentName) {
        if self.current_generation(component).is_none() {
            return;
        }
        warn!("Permanent bind failure for {}", component);
        self.fail_package(&component.package);
        self.reconcile(Scope::All);
    }

    fn fail_package(&mut self, package: &str) {
        if self.package_state(package) != Some(PackageState::Failed) {
            self.lifecycle_transition(package, PackageState::Failed);
        }
    }

    // ========================================================================
    // Reconciliation
    // ========================================================================

    fn package_views(&self) -> BTreeMap<PackageName, PackageView> {
        self.registry
            .all()
            .filter_map(|info| {
                let state = self.package_state(info.package())?;
                Some((
                    info.package().to_string(),
                    PackageView {
                        state,
                        supported: info.supported_features(self.slot_count),
                    },
                ))
            })
            .collect()
    }

    fn context<'a>(&'a self, views: &'a BTreeMap<PackageName, PackageView>) -> ResolutionContext<'a> {
        ResolutionContext {
            slot_count: self.slot_count,
            device_defaults: &self.device_defaults,
            carrier: &self.carrier,
            packages: views,
        }
    }

    /// Packages whose bound controller no longer matches their component
    fn rebind_candidates(&self) -> BTreeSet<PackageName> {
        self.controllers
            .bound_packages()
            .filter(|p| {
                self.registry
                    .get(p)
                    .is_some_and(|info| self.controllers.bound_component(p) != Some(&info.component))
            })
            .map(str::to_string)
            .collect()
    }

    fn reconcile(&mut self, scope: Scope) {
        let mut scope = scope;
        for _ in 0..=self.registry.len() {
            self.issue_queries(scope);

            let views = self.package_views();
            let target = self.context(&views).compute(&self.assignment, scope);
            let components: BTreeMap<PackageName, ComponentName> = self
                .registry
                .all()
                .map(|info| (info.package().to_string(), info.component.clone()))
                .collect();
            let hints = DiffHints {
                resubscribed: std::mem::take(&mut self.resubscribed),
                rebind: self.rebind_candidates(),
            };

            let ops = diff_assignments(&self.assignment, &target, &components, &hints);
            if ops.is_empty() {
                debug!("Assignment unchanged");
            }
            let failed = self.controllers.apply(&ops, &self.subscriptions);
            self.assignment = target;

            if failed.is_empty() {
                return;
            }
            for package in failed {
                self.assignment.remove(&package);
                self.fail_package(&package);
            }
            scope = Scope::All;
        }
        error!("Reconciliation did not settle");
    }
}

/// Same identity and declaration, ignoring any query result.
fn same_declaration(old: &ServiceInfo, new: &ServiceInfo) -> bool {
    old.component == new.component
        && old.features_from_metadata == new.features_from_metadata
        && old.declared() == new.declared()
}
