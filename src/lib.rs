//! Capability Resolver Library
//!
//! Decides which installed service package provides each feature on each slot,
//! and keeps the per-package service controllers bound accordingly as packages,
//! carrier configuration, and slot count change.

pub mod cli;
pub mod config;
pub mod config_file;
pub mod controller;
pub mod error;
pub mod event_loop;
pub mod logic;
pub mod package_state;
pub mod query;
pub mod registry;
pub mod resolver;
pub mod simulation;
pub mod types;

// Re-export main types for convenience
pub use config::{CarrierConfigStore, CarrierOverrides, ConfigSource, DeviceDefaults};
pub use config_file::{QueryScript, ResolverConfig, Scenario, TimelineStep};
pub use controller::{ControllerFactory, ControllerRegistry, ServiceController};
pub use error::{ResolverError, Result};
pub use event_loop::{spawn_resolver_thread, ResolverEvent, ResolverHandle};
pub use package_state::{PackageLifecycle, PackageState, PackageTransitionError};
pub use query::{CapabilityQuerier, QueryTracker};
pub use registry::{CandidatePackage, CandidateRegistry, PackageDiscovery, ServiceInfo};
pub use resolver::{Resolver, ResolverDeps};
pub use types::{
    Assignment, ComponentName, Feature, FeatureClass, FeatureSet, FeatureSlotPair, PackageName,
    SlotId, SlotSubscriptions, SubscriptionId,
};

// Pure resolution logic
pub use logic::assignment::{PackageView, ResolutionContext, Scope};
pub use logic::diff::{diff_assignments, ControllerOp, DiffHints};
