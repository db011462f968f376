// Tests for the dedicated resolver thread
//
// These run the resolver exactly as a host process would: collaborators post
// back onto the same channel and the thread is stopped with a shutdown event.

use capability_resolver::config::{CarrierConfigStore, CarrierOverrides, DeviceDefaults};
use capability_resolver::config_file::{QueryScript, ResolverConfig};
use capability_resolver::error::ResolverError;
use capability_resolver::event_loop::{spawn_resolver_thread, ResolverEvent, ResolverHandle};
use capability_resolver::registry::CandidatePackage;
use capability_resolver::resolver::{Resolver, ResolverDeps};
use capability_resolver::simulation::{
    Journal, LoggingControllerFactory, ScriptedDiscovery, ScriptedQuerier,
};
use capability_resolver::types::{ComponentName, Feature, FeatureSlotPair};
use std::collections::BTreeMap;
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::time::{Duration, Instant};

const DEVICE: &str = "com.device.ims";
const CARRIER: &str = "com.carrier.ims";

struct Running {
    handle: ResolverHandle,
    journal: Journal,
    rx: Receiver<ResolverEvent>,
    resolver: Resolver,
}

fn build(queries: BTreeMap<String, QueryScript>, with_carrier: bool) -> Running {
    let (handle, rx) = ResolverHandle::channel();
    let journal = Journal::default();

    let mut candidates = vec![CandidatePackage::new(ComponentName::new(DEVICE, "DeviceService"))
        .with_features(["voice", "messaging"])];
    let carrier_config = CarrierConfigStore::new();
    if with_carrier {
        candidates.push(CandidatePackage::new(ComponentName::new(
            CARRIER,
            "CarrierService",
        )));
        carrier_config.set(0, CarrierOverrides::all(CARRIER));
    }

    let deps = ResolverDeps {
        discovery: Box::new(ScriptedDiscovery::new(candidates)),
        config_source: Box::new(carrier_config),
        querier: Box::new(ScriptedQuerier::new(queries, handle.clone())),
        factory: Box::new(LoggingControllerFactory::new(
            Arc::clone(&journal),
            handle.clone(),
        )),
    };
    let config = ResolverConfig::new(1, DeviceDefaults::single(DEVICE));
    Running {
        resolver: Resolver::new(&config, deps),
        handle,
        journal,
        rx,
    }
}

/// Wait until some journal line starts with `prefix`.
fn wait_for(journal: &Journal, prefix: &str) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if journal.lock().unwrap().iter().any(|l| l.starts_with(prefix)) {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    false
}

#[test]
fn test_thread_binds_device_default_and_stops() {
    let running = build(BTreeMap::new(), false);
    let thread = spawn_resolver_thread(running.resolver, running.rx);

    assert!(wait_for(&running.journal, "bind com.device.ims"));

    running.handle.shutdown().unwrap();
    let resolver = thread.join().unwrap();

    let journal = running.journal.lock().unwrap().clone();
    assert_eq!(journal.last().map(String::as_str), Some("unbind com.device.ims"));
    assert!(resolver.assignment().is_empty());
    assert_eq!(resolver.controllers().bound_packages().count(), 0);
}

#[test]
fn test_thread_handles_query_results_and_enable() {
    let queries = BTreeMap::from([(
        CARRIER.to_string(),
        QueryScript::Features([FeatureSlotPair::new(0, Feature::Messaging)].into()),
    )]);
    let running = build(queries, true);
    let thread = spawn_resolver_thread(running.resolver, running.rx);

    assert!(wait_for(&running.journal, "bind com.carrier.ims"));
    assert!(wait_for(&running.journal, "bind com.device.ims"));

    running.handle.post(ResolverEvent::EnableSlot(0)).unwrap();
    assert!(wait_for(&running.journal, "enable com.carrier.ims slot 0"));
    assert!(wait_for(&running.journal, "enable com.device.ims slot 0"));

    running.handle.shutdown().unwrap();
    let resolver = thread.join().unwrap();
    assert_eq!(resolver.bound_package(0, Feature::Voice), None);

    let journal = running.journal.lock().unwrap().clone();
    assert!(journal.contains(&"unbind com.carrier.ims".to_string()));
    assert!(journal.contains(&"unbind com.device.ims".to_string()));
}

#[test]
fn test_post_after_shutdown_fails() {
    let running = build(BTreeMap::new(), false);
    let thread = spawn_resolver_thread(running.resolver, running.rx);

    running.handle.shutdown().unwrap();
    let resolver = thread.join().unwrap();
    // The thread dropped its receiver; only the collaborators' senders remain
    drop(resolver);

    let result = running.handle.post(ResolverEvent::BootCompleted);
    assert!(matches!(result, Err(ResolverError::Channel(_))));
}
