//! Scripted collaborators and the scenario runner behind the CLI.
//!
//! Every collaborator the resolver talks to is replaced by something driven
//! from a `Scenario`: discovery returns an editable list of candidates, the
//! querier answers from a script, and controllers write each lifecycle call to
//! a shared journal. Controllers also report their pairs as created, so enable
//! requests go through just as they would against live services.

use crate::config::CarrierConfigStore;
use crate::config_file::{QueryScript, Scenario, TimelineStep};
use crate::controller::{ControllerFactory, ServiceController};
use crate::error::Result;
use crate::event_loop::{drain, ResolverEvent, ResolverHandle};
use crate::query::CapabilityQuerier;
use crate::registry::{CandidatePackage, PackageDiscovery};
use crate::resolver::{Resolver, ResolverDeps};
use crate::types::{
    describe, Assignment, ComponentName, Feature, FeatureSet, PackageName, SlotId,
    SlotSubscriptions, SubscriptionId,
};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use strum::IntoEnumIterator;
use tracing::{debug, warn};

/// Shared, ordered record of controller calls.
pub type Journal = Arc<Mutex<Vec<String>>>;

fn record(journal: &Journal, line: String) {
    journal.lock().unwrap_or_else(|e| e.into_inner()).push(line);
}

/// Discovery backed by an editable candidate list.
#[derive(Debug, Clone, Default)]
pub struct ScriptedDiscovery {
    installed: Arc<Mutex<BTreeMap<PackageName, CandidatePackage>>>,
}

impl ScriptedDiscovery {
    pub fn new(candidates: impl IntoIterator<Item = CandidatePackage>) -> Self {
        let discovery = Self::default();
        for candidate in candidates {
            discovery.install(candidate);
        }
        discovery
    }

    /// Install or replace a candidate
    pub fn install(&self, candidate: CandidatePackage) {
        let mut installed = self.installed.lock().unwrap_or_else(|e| e.into_inner());
        installed.insert(candidate.component.package.clone(), candidate);
    }

    pub fn uninstall(&self, package: &str) {
        let mut installed = self.installed.lock().unwrap_or_else(|e| e.into_inner());
        installed.remove(package);
    }
}

impl PackageDiscovery for ScriptedDiscovery {
    fn discover_candidates(&self) -> Result<Vec<CandidatePackage>> {
        let installed = self.installed.lock().unwrap_or_else(|e| e.into_inner());
        Ok(installed.values().cloned().collect())
    }
}

/// Querier that answers from a script by posting completion events.
pub struct ScriptedQuerier {
    scripts: BTreeMap<PackageName, QueryScript>,
    handle: ResolverHandle,
    stalled: BTreeSet<ComponentName>,
}

impl ScriptedQuerier {
    pub fn new(scripts: BTreeMap<PackageName, QueryScript>, handle: ResolverHandle) -> Self {
        Self {
            scripts,
            handle,
            stalled: BTreeSet::new(),
        }
    }
}

impl CapabilityQuerier for ScriptedQuerier {
    fn start_query(&mut self, component: &ComponentName) -> bool {
        let event = match self.scripts.get(&component.package) {
            Some(QueryScript::Features(features)) => ResolverEvent::QueryComplete {
                component: component.clone(),
                features: features.clone(),
            },
            Some(QueryScript::Fail) => ResolverEvent::QueryPermanentError(component.clone()),
            Some(QueryScript::Refuse) => return false,
            Some(QueryScript::Never) | None => {
                debug!("Query for {} will not complete", component);
                self.stalled.insert(component.clone());
                return true;
            }
        };
        if let Err(e) = self.handle.post(event) {
            warn!("{}", e);
            return false;
        }
        true
    }

    fn is_query_in_progress(&self, component: &ComponentName) -> bool {
        self.stalled.contains(component)
    }
}

/// Controller that journals every call and reports its pairs as created.
pub struct LoggingController {
    component: ComponentName,
    journal: Journal,
    handle: ResolverHandle,
    features: FeatureSet,
}

impl LoggingController {
    fn announce(&self, event: ResolverEvent) {
        if let Err(e) = self.handle.post(event) {
            warn!("{}", e);
        }
    }

    fn update(&mut self, features: &FeatureSet) {
        for pair in self.features.difference(features) {
            self.announce(ResolverEvent::FeatureRemoved {
                component: self.component.clone(),
                pair: *pair,
            });
        }
        for pair in features.difference(&self.features) {
            self.announce(ResolverEvent::FeatureCreated {
                component: self.component.clone(),
                pair: *pair,
            });
        }
        self.features = features.clone();
    }
}

impl ServiceController for LoggingController {
    fn component(&self) -> &ComponentName {
        &self.component
    }

    fn bind(&mut self, features: &FeatureSet, _subscriptions: &SlotSubscriptions) {
        record(
            &self.journal,
            format!("bind {} {}", self.component.package, describe(features)),
        );
        self.update(features);
    }

    fn unbind(&mut self) {
        record(&self.journal, format!("unbind {}", self.component.package));
        self.features.clear();
    }

    fn change_features(&mut self, features: &FeatureSet, _subscriptions: &SlotSubscriptions) {
        record(
            &self.journal,
            format!("change {} {}", self.component.package, describe(features)),
        );
        self.update(features);
    }

    fn enable_feature(&mut self, slot: SlotId, subscription: Option<SubscriptionId>) {
        record(
            &self.journal,
            format!("enable {} slot {} sub {:?}", self.component.package, slot, subscription),
        );
    }

    fn disable_feature(&mut self, slot: SlotId, subscription: Option<SubscriptionId>) {
        record(
            &self.journal,
            format!("disable {} slot {} sub {:?}", self.component.package, slot, subscription),
        );
    }
}

/// Creates `LoggingController`s sharing one journal.
pub struct LoggingControllerFactory {
    journal: Journal,
    handle: ResolverHandle,
}

impl LoggingControllerFactory {
    pub fn new(journal: Journal, handle: ResolverHandle) -> Self {
        Self { journal, handle }
    }
}

impl ControllerFactory for LoggingControllerFactory {
    fn create(&mut self, component: &ComponentName) -> Result<Box<dyn ServiceController>> {
        Ok(Box::new(LoggingController {
            component: component.clone(),
            journal: Arc::clone(&self.journal),
            handle: self.handle.clone(),
            features: FeatureSet::new(),
        }))
    }
}

/// Owner and governing package of one (slot, feature) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PairReport {
    pub slot: SlotId,
    pub feature: Feature,
    pub governing: Option<PackageName>,
    pub owner: Option<PackageName>,
}

/// Outcome of a scenario run.
#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub slot_count: usize,
    pub subscriptions: SlotSubscriptions,
    pub assignment: Assignment,
    pub package_states: BTreeMap<PackageName, String>,
    pub pairs: Vec<PairReport>,
    pub journal: Vec<String>,
}

impl SimulationReport {
    fn capture(resolver: &Resolver, journal: &Journal) -> Self {
        let package_states = resolver
            .package_states()
            .map(|(package, state)| (package.to_string(), state.to_string()))
            .collect();

        let pairs = (0..resolver.slot_count())
            .flat_map(|slot| Feature::iter().map(move |feature| (slot, feature)))
            .map(|(slot, feature)| PairReport {
                slot,
                feature,
                governing: resolver.governing_package(slot, feature),
                owner: resolver.bound_package(slot, feature).map(str::to_string),
            })
            .collect();

        let journal = journal.lock().unwrap_or_else(|e| e.into_inner()).clone();
        Self {
            slot_count: resolver.slot_count(),
            subscriptions: resolver.slot_subscriptions().clone(),
            assignment: resolver.assignment().clone(),
            package_states,
            pairs,
            journal,
        }
    }
}

/// Replay `scenario` to completion and report the final state.
pub fn run_scenario(scenario: &Scenario) -> Result<SimulationReport> {
    let (handle, rx) = ResolverHandle::channel();
    let journal = Journal::default();

    let discovery = ScriptedDiscovery::new(scenario.candidates.iter().cloned());
    let carrier_config = CarrierConfigStore::new();
    for (slot, overrides) in &scenario.carrier_overrides {
        carrier_config.set(*slot, overrides.clone());
    }

    let deps = ResolverDeps {
        discovery: Box::new(discovery.clone()),
        config_source: Box::new(carrier_config.clone()),
        querier: Box::new(ScriptedQuerier::new(scenario.queries.clone(), handle.clone())),
        factory: Box::new(LoggingControllerFactory::new(
            Arc::clone(&journal),
            handle.clone(),
        )),
    };
    let mut resolver = Resolver::new(&scenario.config, deps);
    resolver.initialize();
    let _ = drain(&mut resolver, &rx);

    for step in &scenario.timeline {
        let event = match step {
            TimelineStep::PackageAdded { candidate } => {
                discovery.install(candidate.clone());
                ResolverEvent::PackageAdded(candidate.component.package.clone())
            }
            TimelineStep::PackageChanged { candidate } => {
                discovery.install(candidate.clone());
                ResolverEvent::PackageChanged(candidate.component.package.clone())
            }
            TimelineStep::PackageRemoved { package } => {
                discovery.uninstall(package);
                ResolverEvent::PackageRemoved(package.clone())
            }
            TimelineStep::CarrierConfigChanged {
                slot,
                subscription,
                overrides,
            } => {
                carrier_config.set(*slot, overrides.clone());
                ResolverEvent::CarrierConfigChanged {
                    subscription: *subscription,
                    slot: *slot,
                }
            }
            TimelineStep::SlotCountChanged { count } => ResolverEvent::SlotCountChanged(*count),
            TimelineStep::BootCompleted => ResolverEvent::BootCompleted,
            TimelineStep::BindPermanentError { package } => {
                match resolver
                    .cached_service_info(package)
                    .map(|info| info.component.clone())
                {
                    Some(component) => ResolverEvent::BindPermanentError(component),
                    None => {
                        warn!("No cached component for {}, skipping bind error", package);
                        continue;
                    }
                }
            }
            TimelineStep::EnableSlot { slot } => ResolverEvent::EnableSlot(*slot),
            TimelineStep::DisableSlot { slot } => ResolverEvent::DisableSlot(*slot),
        };
        handle.post(event)?;
        let _ = drain(&mut resolver, &rx);
    }

    Ok(SimulationReport::capture(&resolver, &journal))
}
