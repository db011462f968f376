//! Package Discovery State Machine
//!
//! Tracks, per candidate package, whether its capabilities are known. Only
//! `Known` packages contribute pairs to an assignment; every other state simply
//! contributes nothing without blocking other packages.
//!
//! # State Flow
//!
//! ```text
//! Unknown ──(static metadata)──────────────► Known
//!    │                                         │
//!    └──(query issued)──► Querying ──(result)──┘
//!                            │                 │
//!                            └──(perm. error)──┴──(bind failure)──► Failed
//! ```
//!
//! `Failed` is sticky: the only way out is a new generation of the package,
//! created when a package-changed event replaces its `ServiceInfo`.

use std::fmt;
use thiserror::Error;

/// Discovery state of one candidate package.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PackageState {
    /// Capabilities not yet known; a dynamic query is needed
    Unknown,
    /// A dynamic query is outstanding
    Querying,
    /// Capabilities known (from metadata or a completed query)
    Known,
    /// Provides nothing until the package changes
    Failed,
}

impl PackageState {
    /// Returns true while the package's capabilities are still being resolved
    #[inline]
    pub const fn is_pending(self) -> bool {
        matches!(self, Self::Unknown | Self::Querying)
    }

    /// Returns true if a transition from `self` to `to` is allowed
    pub const fn can_transition_to(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Unknown, Self::Querying)
                | (Self::Unknown, Self::Known)
                | (Self::Unknown, Self::Failed)
                | (Self::Querying, Self::Known)
                | (Self::Querying, Self::Failed)
                | (Self::Querying, Self::Unknown)
                | (Self::Known, Self::Failed)
        )
    }

    pub const fn description(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Querying => "querying",
            Self::Known => "known",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for PackageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Errors that can occur during state transitions
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PackageTransitionError {
    /// The transition is not part of the state machine
    #[error("Cannot move package from {from} to {to}")]
    Invalid { from: PackageState, to: PackageState },

    /// Attempted to transition to the same state
    #[error("Package is already {state}")]
    AlreadyInState { state: PackageState },
}

/// Per-package discovery context.
///
/// Owns the current state and the generation it belongs to. A new generation is
/// started whenever the package's `ServiceInfo` is replaced; anything tagged
/// with an older generation (late query results) is stale.
#[derive(Debug, Clone)]
pub struct PackageLifecycle {
    state: PackageState,
    generation: u64,
    history: Vec<PackageState>,
}

impl PackageLifecycle {
    /// Start a lifecycle in `Unknown` for the given generation.
    pub fn new(generation: u64) -> Self {
        Self {
            state: PackageState::Unknown,
            generation,
            history: vec![PackageState::Unknown],
        }
    }

    /// Start a lifecycle that is already `Known` (static metadata).
    pub fn known(generation: u64) -> Self {
        let mut lifecycle = Self::new(generation);
        lifecycle.state = PackageState::Known;
        lifecycle.history.push(PackageState::Known);
        lifecycle
    }

    #[inline]
    pub fn state(&self) -> PackageState {
        self.state
    }

    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// States visited in this generation, oldest first
    pub fn history(&self) -> &[PackageState] {
        &self.history
    }

    /// Move to `target`.
    ///
    /// # Errors
    ///
    /// - `AlreadyInState` if target is the current state
    /// - `Invalid` if the state machine does not allow the move
    pub fn transition_to(
        &mut self,
        target: PackageState,
    ) -> Result<PackageState, PackageTransitionError> {
        if target == self.state {
            return Err(PackageTransitionError::AlreadyInState { state: target });
        }
        if !self.state.can_transition_to(target) {
            return Err(PackageTransitionError::Invalid {
                from: self.state,
                to: target,
            });
        }
        self.state = target;
        self.history.push(target);
        Ok(target)
    }

    /// Mark the package failed from any non-failed state.
    pub fn fail(&mut self) -> Result<(), PackageTransitionError> {
        self.transition_to(PackageState::Failed).map(|_| ())
    }

    /// Begin a new generation in `Unknown`, discarding history.
    pub fn reset(&mut self, generation: u64) {
        *self = Self::new(generation);
    }
}
