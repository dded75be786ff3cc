//! Write-Ahead Log Module
//!
//! Append-only, segmented log of committed storage operations. The log is
//! the source the replication cursor tails.

pub mod entry;
mod reader;
mod segment;
mod writer;

pub use entry::{Document, LogOperation, RawJson, Revision, Tick, TransactionId, WalEntry};
pub use reader::{ScanControl, WalReader};
pub use segment::{list_segments, Segment};
pub use writer::WalWriter;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};

/// WAL directory structure
#[derive(Debug, Clone)]
pub struct WalPaths {
    pub base_dir: PathBuf,
}

impl WalPaths {
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// Get path for a specific segment file
    pub fn segment_path(&self, segment_id: u64) -> PathBuf {
        self.base_dir.join(format!("wal_{:020}.log", segment_id))
    }

    /// Get path for the storage checkpoint
    pub fn checkpoint_path(&self) -> PathBuf {
        self.base_dir.join("checkpoint.bin")
    }

    /// Ensure WAL directory exists
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.base_dir)
    }
}

/// Information about a WAL segment
#[derive(Debug, Clone)]
pub struct SegmentInfo {
    pub id: u64,
    pub path: PathBuf,
    pub first_tick: Tick,
    pub last_tick: Tick,
    pub entry_count: u32,
    /// Committed length in bytes; readers never look past it
    pub len: u64,
    pub sealed: bool,
    pub last_write: Option<DateTime<Utc>>,
}

/// Segment catalogue shared by the writer and all readers
#[derive(Debug, Default)]
pub struct SegmentIndex {
    pub segments: BTreeMap<Tick, SegmentInfo>,
    /// Every tick at or below this has been reclaimed
    pub pruned_through: Tick,
}

impl SegmentIndex {
    pub fn first_tick(&self) -> Option<Tick> {
        self.segments.values().find(|s| s.entry_count > 0).map(|s| s.first_tick)
    }

    pub fn last_tick(&self) -> Option<Tick> {
        self.segments
            .values()
            .rev()
            .find(|s| s.entry_count > 0)
            .map(|s| s.last_tick)
    }

    pub fn entry_count(&self) -> u64 {
        self.segments.values().map(|s| s.entry_count as u64).sum()
    }

    pub fn total_bytes(&self) -> u64 {
        self.segments.values().map(|s| s.len).sum()
    }
}

/// Handle to the shared segment index
#[derive(Debug, Clone, Default)]
pub struct SharedIndex(Arc<RwLock<SegmentIndex>>);

impl SharedIndex {
    pub fn read(&self) -> RwLockReadGuard<'_, SegmentIndex> {
        self.0.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, SegmentIndex> {
        self.0.write().unwrap_or_else(PoisonError::into_inner)
    }
}
