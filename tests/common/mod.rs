// Shared harness for resolver integration tests.
//
// Drives a `Resolver` synchronously: every event is handled, then everything
// the collaborators posted in response (query results, feature callbacks) is
// drained before control returns to the test.

#![allow(dead_code)]

use capability_resolver::config::{CarrierConfigStore, CarrierOverrides, DeviceDefaults};
use capability_resolver::config_file::ResolverConfig;
use capability_resolver::controller::{ControllerFactory, ServiceController};
use capability_resolver::error::{ResolverError, Result};
use capability_resolver::event_loop::{drain, ResolverEvent, ResolverHandle};
use capability_resolver::query::CapabilityQuerier;
use capability_resolver::registry::CandidatePackage;
use capability_resolver::resolver::{Resolver, ResolverDeps};
use capability_resolver::simulation::ScriptedDiscovery;
use capability_resolver::types::{
    ComponentName, Feature, FeatureSet, FeatureSlotPair, PackageName, SlotId, SlotSubscriptions,
    SubscriptionId,
};
use std::collections::BTreeSet;
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};

pub const DEVICE: &str = "com.device.ims";
pub const CARRIER: &str = "com.carrier.ims";

pub fn device_component() -> ComponentName {
    ComponentName::new(DEVICE, "DeviceImsService")
}

pub fn carrier_component() -> ComponentName {
    ComponentName::new(CARRIER, "CarrierImsService")
}

/// Device default candidate declaring `features` in metadata
pub fn device_candidate(features: &[&str]) -> CandidatePackage {
    CandidatePackage::new(device_component()).with_features(features.iter().copied())
}

/// Carrier candidate without metadata
pub fn carrier_candidate() -> CandidatePackage {
    CandidatePackage::new(carrier_component())
}

pub fn pairs(list: &[(SlotId, Feature)]) -> FeatureSet {
    list.iter()
        .map(|&(slot, feature)| FeatureSlotPair::new(slot, feature))
        .collect()
}

/// Voice and messaging on every slot below `slots`
pub fn voice_messaging(slots: usize) -> FeatureSet {
    (0..slots)
        .flat_map(|s| [(s, Feature::Voice), (s, Feature::Messaging)])
        .map(|(slot, feature)| FeatureSlotPair::new(slot, feature))
        .collect()
}

// =============================================================================
// Recording collaborators
// =============================================================================

/// One controller call as seen by a test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Bind(PackageName, FeatureSet),
    Change(PackageName, FeatureSet),
    Unbind(PackageName),
    Enable(PackageName, SlotId, Option<SubscriptionId>),
    Disable(PackageName, SlotId, Option<SubscriptionId>),
}

#[derive(Debug, Default)]
pub struct CallLog {
    pub calls: Vec<Call>,
    /// Subscription map handed over with each bind/change, in call order
    pub subscriptions: Vec<SlotSubscriptions>,
}

pub type SharedLog = Arc<Mutex<CallLog>>;

struct RecordingController {
    component: ComponentName,
    log: SharedLog,
}

impl RecordingController {
    fn push(&self, call: Call) {
        self.log.lock().unwrap().calls.push(call);
    }
}

impl ServiceController for RecordingController {
    fn component(&self) -> &ComponentName {
        &self.component
    }

    fn bind(&mut self, features: &FeatureSet, subscriptions: &SlotSubscriptions) {
        let mut log = self.log.lock().unwrap();
        log.calls
            .push(Call::Bind(self.component.package.clone(), features.clone()));
        log.subscriptions.push(subscriptions.clone());
    }

    fn unbind(&mut self) {
        self.push(Call::Unbind(self.component.package.clone()));
    }

    fn change_features(&mut self, features: &FeatureSet, subscriptions: &SlotSubscriptions) {
        let mut log = self.log.lock().unwrap();
        log.calls
            .push(Call::Change(self.component.package.clone(), features.clone()));
        log.subscriptions.push(subscriptions.clone());
    }

    fn enable_feature(&mut self, slot: SlotId, subscription: Option<SubscriptionId>) {
        self.push(Call::Enable(self.component.package.clone(), slot, subscription));
    }

    fn disable_feature(&mut self, slot: SlotId, subscription: Option<SubscriptionId>) {
        self.push(Call::Disable(self.component.package.clone(), slot, subscription));
    }
}

struct RecordingFactory {
    log: SharedLog,
    refused: Arc<Mutex<BTreeSet<PackageName>>>,
}

impl ControllerFactory for RecordingFactory {
    fn create(&mut self, component: &ComponentName) -> Result<Box<dyn ServiceController>> {
        if self.refused.lock().unwrap().contains(&component.package) {
            return Err(ResolverError::controller(format!(
                "cannot create controller for {}",
                component
            )));
        }
        Ok(Box::new(RecordingController {
            component: component.clone(),
            log: Arc::clone(&self.log),
        }))
    }
}

#[derive(Debug, Default)]
pub struct QuerierState {
    /// Every successfully started query, in order
    pub started: Vec<ComponentName>,
    pub in_progress: BTreeSet<ComponentName>,
    /// Refuse to start queries
    pub refuse: bool,
    /// Every `start_query` call, accepted or not
    pub attempts: usize,
}

/// Querier whose queries complete only when the test says so.
struct ManualQuerier {
    state: Arc<Mutex<QuerierState>>,
}

impl CapabilityQuerier for ManualQuerier {
    fn start_query(&mut self, component: &ComponentName) -> bool {
        let mut state = self.state.lock().unwrap();
        state.attempts += 1;
        if state.refuse {
            return false;
        }
        state.started.push(component.clone());
        state.in_progress.insert(component.clone());
        true
    }

    fn is_query_in_progress(&self, component: &ComponentName) -> bool {
        self.state.lock().unwrap().in_progress.contains(component)
    }
}

// =============================================================================
// Harness
// =============================================================================

pub struct Harness {
    pub resolver: Resolver,
    pub handle: ResolverHandle,
    pub discovery: ScriptedDiscovery,
    pub carrier_config: CarrierConfigStore,
    pub log: SharedLog,
    pub querier: Arc<Mutex<QuerierState>>,
    pub refused: Arc<Mutex<BTreeSet<PackageName>>>,
    rx: Receiver<ResolverEvent>,
}

impl Harness {
    pub fn new(
        slot_count: usize,
        defaults: DeviceDefaults,
        candidates: Vec<CandidatePackage>,
    ) -> Self {
        Self::with_config(ResolverConfig::new(slot_count, defaults), candidates)
    }

    pub fn with_config(config: ResolverConfig, candidates: Vec<CandidatePackage>) -> Self {
        let (handle, rx) = ResolverHandle::channel();
        let discovery = ScriptedDiscovery::new(candidates);
        let carrier_config = CarrierConfigStore::new();
        let log = SharedLog::default();
        let querier = Arc::new(Mutex::new(QuerierState::default()));
        let refused = Arc::new(Mutex::new(BTreeSet::new()));

        let deps = ResolverDeps {
            discovery: Box::new(discovery.clone()),
            config_source: Box::new(carrier_config.clone()),
            querier: Box::new(ManualQuerier {
                state: Arc::clone(&querier),
            }),
            factory: Box::new(RecordingFactory {
                log: Arc::clone(&log),
                refused: Arc::clone(&refused),
            }),
        };

        Self {
            resolver: Resolver::new(&config, deps),
            handle,
            discovery,
            carrier_config,
            log,
            querier,
            refused,
            rx,
        }
    }

    /// Set a slot's carrier overrides before or between events
    pub fn set_override(&self, slot: SlotId, overrides: CarrierOverrides) {
        self.carrier_config.set(slot, overrides);
    }

    pub fn start(&mut self) {
        self.resolver.initialize();
        self.pump();
    }

    /// Handle every queued event
    pub fn pump(&mut self) {
        let _ = drain(&mut self.resolver, &self.rx);
    }

    /// Post `event` and handle it plus everything it caused
    pub fn send(&mut self, event: ResolverEvent) {
        self.handle.post(event).unwrap();
        self.pump();
    }

    /// Finish an outstanding query with `features`
    pub fn complete_query(&mut self, component: ComponentName, features: FeatureSet) {
        self.querier.lock().unwrap().in_progress.remove(&component);
        self.send(ResolverEvent::QueryComplete {
            component,
            features,
        });
    }

    pub fn fail_query(&mut self, component: ComponentName) {
        self.querier.lock().unwrap().in_progress.remove(&component);
        self.send(ResolverEvent::QueryPermanentError(component));
    }

    /// Report every pair currently bound to `component` as created
    pub fn create_all(&mut self, component: &ComponentName) {
        let bound = self
            .resolver
            .controllers()
            .bound_features(&component.package)
            .cloned()
            .unwrap_or_default();
        for pair in bound {
            self.send(ResolverEvent::FeatureCreated {
                component: component.clone(),
                pair,
            });
        }
    }

    /// Controller calls since the last call to `take_calls`
    pub fn take_calls(&self) -> Vec<Call> {
        let mut log = self.log.lock().unwrap();
        log.subscriptions.clear();
        std::mem::take(&mut log.calls)
    }

    /// Subscription map of the most recent bind/change
    pub fn last_subscriptions(&self) -> Option<SlotSubscriptions> {
        self.log.lock().unwrap().subscriptions.last().cloned()
    }

    pub fn started_queries(&self) -> Vec<ComponentName> {
        self.querier.lock().unwrap().started.clone()
    }

    pub fn owned_by(&self, package: &str) -> FeatureSet {
        self.resolver
            .assignment()
            .get(package)
            .cloned()
            .unwrap_or_default()
    }
}
