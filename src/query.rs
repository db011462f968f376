//! Dynamic capability queries
//!
//! The querier itself is an external collaborator: it is handed a component,
//! works asynchronously, and reports back with a `QueryComplete` or
//! `QueryPermanentError` event on the resolver's channel. This module owns the
//! bookkeeping that keeps those round-trips safe:
//!
//! - at most one outstanding query per package
//! - bounded re-issue when a query cannot be started
//! - completions tagged with the generation they were issued for, so duplicate
//!   and late results are recognised

use crate::types::{ComponentName, PackageName};
use std::collections::HashMap;
use tracing::{debug, warn};

/// Default cap on consecutive failed `start_query` calls
pub const DEFAULT_MAX_START_ATTEMPTS: u32 = 3;

/// Issues asynchronous capability-discovery requests.
pub trait CapabilityQuerier: Send {
    /// Begin a query. Returns false if the query could not be started.
    fn start_query(&mut self, component: &ComponentName) -> bool;

    /// Whether a query for this component is already running.
    fn is_query_in_progress(&self, component: &ComponentName) -> bool;
}

/// Bookkeeping for one package under dynamic query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingQuery {
    /// Consecutive `start_query` calls that returned false
    pub attempts: u32,
    /// Generation the in-flight query was issued for
    pub outstanding: Option<u64>,
    /// A result or permanent error was accepted for the current generation
    pub observed: bool,
}

/// Result of asking the tracker to issue a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueOutcome {
    /// The querier accepted the request
    Started,
    /// A query is already in flight; wait for it
    InFlight,
    /// The querier refused; a later trigger will retry
    Deferred,
    /// The start-attempt cap is reached; the package should fail
    Exhausted,
}

/// How an arriving completion relates to what was asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionVerdict {
    /// Matches the outstanding query of the current generation
    Accept,
    /// Answers a query issued for an older generation
    Stale,
    /// Nothing was outstanding (duplicate or unknown package)
    Unexpected,
}

/// Tracks every package's `PendingQuery`.
#[derive(Debug, Clone)]
pub struct QueryTracker {
    pending: HashMap<PackageName, PendingQuery>,
    max_start_attempts: u32,
}

impl Default for QueryTracker {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_START_ATTEMPTS)
    }
}

impl QueryTracker {
    pub fn new(max_start_attempts: u32) -> Self {
        Self {
            pending: HashMap::new(),
            max_start_attempts: max_start_attempts.max(1),
        }
    }

    pub fn get(&self, package: &str) -> Option<&PendingQuery> {
        self.pending.get(package)
    }

    /// Whether a query for `package` is in flight
    pub fn is_outstanding(&self, package: &str) -> bool {
        self.pending
            .get(package)
            .is_some_and(|p| p.outstanding.is_some())
    }

    /// Issue a query for `component` at `generation` unless one is in flight.
    pub fn issue(
        &mut self,
        component: &ComponentName,
        generation: u64,
        querier: &mut dyn CapabilityQuerier,
    ) -> IssueOutcome {
        let entry = self.pending.entry(component.package.clone()).or_default();

        if entry.outstanding.is_some() || querier.is_query_in_progress(component) {
            debug!("Query for {} already in progress", component);
            return IssueOutcome::InFlight;
        }
        if entry.attempts >= self.max_start_attempts {
            return IssueOutcome::Exhausted;
        }

        if querier.start_query(component) {
            debug!("Started capability query for {} (gen {})", component, generation);
            entry.outstanding = Some(generation);
            entry.attempts = 0;
            entry.observed = false;
            IssueOutcome::Started
        } else {
            entry.attempts += 1;
            warn!(
                "Could not start capability query for {} (attempt {}/{})",
                component, entry.attempts, self.max_start_attempts
            );
            if entry.attempts >= self.max_start_attempts {
                IssueOutcome::Exhausted
            } else {
                IssueOutcome::Deferred
            }
        }
    }

    /// Record an arriving completion (result or permanent error) for `package`
    /// whose current generation is `current_generation`.
    pub fn complete(&mut self, package: &str, current_generation: u64) -> CompletionVerdict {
        let Some(entry) = self.pending.get_mut(package) else {
            return CompletionVerdict::Unexpected;
        };
        match entry.outstanding.take() {
            None => CompletionVerdict::Unexpected,
            Some(generation) if generation == current_generation => {
                entry.observed = true;
                CompletionVerdict::Accept
            }
            Some(_) => CompletionVerdict::Stale,
        }
    }

    /// Start over for a new generation. An in-flight query stays in flight.
    pub fn reset(&mut self, package: &str) {
        if let Some(entry) = self.pending.get_mut(package) {
            entry.attempts = 0;
            entry.observed = false;
        }
    }

    /// Drop all interest in `package`; late completions become `Unexpected`.
    pub fn forget(&mut self, package: &str) {
        self.pending.remove(package);
    }
}
