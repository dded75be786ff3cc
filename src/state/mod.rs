//! State Management Module
//!
//! Persistent node state that survives restarts: server identity and
//! replication client progress.

mod tracker;

pub use tracker::StateTracker;
