//! Logic modules — pure computations behind each reconciliation pass.
//!
//! Nothing here performs I/O or talks to collaborators; the resolver feeds in
//! snapshots and applies what comes back.
//!
//! # Modules
//!
//! - `assignment` — who owns each `(slot, feature)` pair
//! - `diff` — minimal controller operations between two assignments

pub mod assignment;
pub mod diff;
