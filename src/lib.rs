//! Syncpoint - Replication Provider Engine
//!
//! The server side of a leader/follower replication protocol for a document
//! store. Followers use it to copy a consistent starting state and then tail
//! the leader's write-ahead log.
//!
//! # Architecture
//!
//! A storage engine logs every mutation to a WAL before applying it. On top
//! of it, the replication layer offers:
//!
//! - A log cursor serving committed entries after a tick, gap-free and
//!   resumable
//! - Sync batches that pin log retention and a repeatable-read snapshot
//! - Read-lock jobs that hand a collection over at a precise tick
//! - Key-chunk sessions for bandwidth-efficient divergence detection
//! - Follower sets for synchronous replication
//!
//! All of it is reached through one dispatcher, exposed over HTTP.

pub mod api;
pub mod cluster;
pub mod config;
pub mod error;
pub mod id;
pub mod node;
pub mod replication;
pub mod state;
pub mod storage;
pub mod wal;

pub use config::SyncpointConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::cluster::{ServerIdentity, ServerRole};
    pub use crate::config::SyncpointConfig;
    pub use crate::error::{Error, ErrorCode, Result};
    pub use crate::id::ResourceId;
    pub use crate::node::Node;
    pub use crate::replication::{Operation, ReplicationHandler, Response};
    pub use crate::storage::{StorageEngine, WriteOp};
    pub use crate::wal::{LogOperation, Tick, WalEntry};
}
