//! event_loop.rs - Serializes every trigger onto one resolver thread.
//!
//! Package broadcasts, carrier-config changes, query completions and controller
//! callbacks may originate on any thread. They are posted as `ResolverEvent`s
//! through a cloneable `ResolverHandle`; a single dedicated thread owns the
//! `Resolver` and handles the events strictly in arrival order, so no two
//! reconciliation passes ever overlap.

use crate::error::{ResolverError, Result};
use crate::resolver::Resolver;
use crate::types::{ComponentName, FeatureSet, FeatureSlotPair, PackageName, SlotId, SubscriptionId};
use std::ops::ControlFlow;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::JoinHandle;
use tracing::{debug, info};

/// Everything that can make the resolver act.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolverEvent {
    PackageAdded(PackageName),
    PackageChanged(PackageName),
    PackageRemoved(PackageName),
    /// Carrier configuration of `slot` changed; `subscription` is now active there
    CarrierConfigChanged {
        subscription: Option<SubscriptionId>,
        slot: SlotId,
    },
    SlotCountChanged(usize),
    BootCompleted,
    QueryComplete {
        component: ComponentName,
        features: FeatureSet,
    },
    QueryPermanentError(ComponentName),
    BindPermanentError(ComponentName),
    FeatureCreated {
        component: ComponentName,
        pair: FeatureSlotPair,
    },
    FeatureRemoved {
        component: ComponentName,
        pair: FeatureSlotPair,
    },
    EnableSlot(SlotId),
    DisableSlot(SlotId),
    Shutdown,
}

/// Posts events to the resolver thread. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ResolverHandle {
    tx: Sender<ResolverEvent>,
}

impl ResolverHandle {
    pub fn new(tx: Sender<ResolverEvent>) -> Self {
        Self { tx }
    }

    /// Create a handle together with the receiving end of its channel.
    pub fn channel() -> (Self, Receiver<ResolverEvent>) {
        let (tx, rx) = mpsc::channel();
        (Self::new(tx), rx)
    }

    /// Post an event.
    ///
    /// # Errors
    ///
    /// Returns a `Channel` error once the resolver thread has stopped.
    pub fn post(&self, event: ResolverEvent) -> Result<()> {
        self.tx
            .send(event)
            .map_err(|e| ResolverError::channel(format!("resolver stopped, dropped {:?}", e.0)))
    }

    /// Ask the resolver thread to stop after the events already queued.
    pub fn shutdown(&self) -> Result<()> {
        self.post(ResolverEvent::Shutdown)
    }
}

/// Handle every event currently queued on `rx` without blocking.
///
/// Returns `Break` if a `Shutdown` was handled.
pub fn drain(resolver: &mut Resolver, rx: &Receiver<ResolverEvent>) -> ControlFlow<()> {
    while let Ok(event) = rx.try_recv() {
        resolver.handle_event(event)?;
    }
    ControlFlow::Continue(())
}

/// Spawns the dedicated resolver thread.
///
/// The thread initializes the resolver, then handles events from `rx` until a
/// `Shutdown` arrives or every sender is dropped. The resolver is handed back
/// through the join handle for inspection.
pub fn spawn_resolver_thread(
    mut resolver: Resolver,
    rx: Receiver<ResolverEvent>,
) -> JoinHandle<Resolver> {
    std::thread::spawn(move || {
        debug!("Resolver thread started.");
        resolver.initialize();
        while let Ok(event) = rx.recv() {
            if resolver.handle_event(event).is_break() {
                break;
            }
        }
        info!("Resolver thread shut down.");
        resolver
    })
}
