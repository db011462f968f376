//! Error handling module for the capability resolver
//!
//! Provides centralized error types using thiserror. The engine itself never
//! propagates these out of event handling: failures degrade to fewer bound
//! pairs. They surface at the fallible edges (controller creation, metadata
//! parsing, file loading, posting events to a stopped loop).

use crate::package_state::PackageTransitionError;
use thiserror::Error;

/// Main error type for the resolver
#[derive(Error, Debug)]
pub enum ResolverError {
    /// Candidate discovery failed or returned unusable data
    #[error("Discovery error: {0}")]
    Discovery(String),

    /// A package declared malformed feature metadata
    #[error("Metadata error in {package}: {reason}")]
    Metadata { package: String, reason: String },

    /// Dynamic capability query could not be issued or failed
    #[error("Query error: {0}")]
    Query(String),

    /// Controller could not be created or bound
    #[error("Controller error: {0}")]
    Controller(String),

    /// Configuration errors (loading, parsing, validation)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid package state transition
    #[error("Package transition error: {0}")]
    Transition(#[from] PackageTransitionError),

    /// The event loop is gone
    #[error("Event channel closed: {0}")]
    Channel(String),

    /// IO errors (config files)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for resolver operations
pub type Result<T> = std::result::Result<T, ResolverError>;

impl ResolverError {
    /// Create a discovery error
    pub fn discovery(msg: impl Into<String>) -> Self {
        Self::Discovery(msg.into())
    }

    /// Create a metadata error for a package
    pub fn metadata(package: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Metadata {
            package: package.into(),
            reason: reason.into(),
        }
    }

    /// Create a query error
    pub fn query(msg: impl Into<String>) -> Self {
        Self::Query(msg.into())
    }

    /// Create a controller error
    pub fn controller(msg: impl Into<String>) -> Self {
        Self::Controller(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a channel error
    pub fn channel(msg: impl Into<String>) -> Self {
        Self::Channel(msg.into())
    }
}
