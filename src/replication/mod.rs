//! Replication Module
//!
//! The provider side of the replication protocol: log tailing, sync
//! batches, read-lock handover, key-chunk diffing and follower sets, all
//! reached through [`ReplicationHandler`].

mod batch;
mod clients;
mod cursor;
mod expiry;
mod followers;
mod handler;
mod keys;
mod lock;
mod pins;

pub use batch::{BatchInfo, BatchRegistry};
pub use clients::{ClientProgress, ClientTracker};
pub use cursor::{FollowResponse, LogCursor, LogFilter, OpenTransactions};
pub use followers::FollowerSets;
pub use handler::{
    DumpResponse, ErrorBody, FollowerSet, IndexRestore, Operation, OperationError,
    ReplicationHandler, Response, StateResponse,
};
pub use keys::{
    chunk_digest, compute_chunks, ChunkContents, ChunkDiff, KeyChunk, KeyRevision, KeySessions,
    SessionInfo,
};
pub use lock::{LockCoordinator, LockState, LockStatus};
pub use pins::TickPins;
