//! WAL Reader
//!
//! Reads committed entries by tick range. Readers share the writer's
//! segment index and never read past a segment's committed length.

use super::entry::{Tick, WalEntry};
use super::segment::read_entries;
use super::{SegmentInfo, SharedIndex};
use crate::error::{Error, Result};

/// Returned by scan visitors to continue or stop the scan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanControl {
    Continue,
    Stop,
}

/// WAL Reader for accessing log entries
#[derive(Debug, Clone)]
pub struct WalReader {
    index: SharedIndex,
}

impl WalReader {
    /// Create a reader over the writer's segment index
    pub fn new(index: SharedIndex) -> Self {
        Self { index }
    }

    /// Every tick at or below this has been reclaimed
    pub fn pruned_through(&self) -> Tick {
        self.index.read().pruned_through
    }

    /// Get the first tick still in the log
    pub fn first_tick(&self) -> Option<Tick> {
        self.index.read().first_tick()
    }

    /// Get the last tick in the log
    pub fn last_tick(&self) -> Option<Tick> {
        self.index.read().last_tick()
    }

    /// Fail with `DataUnavailable` unless every entry after `after` is retained
    pub fn ensure_available(&self, after: Tick) -> Result<()> {
        let pruned_through = self.pruned_through();
        if after < pruned_through {
            return Err(Error::DataUnavailable {
                requested: after,
                oldest: pruned_through,
            });
        }
        Ok(())
    }

    /// Visit entries with `first <= tick <= last` in tick order
    pub fn scan<F>(&self, first: Tick, last: Tick, mut visit: F) -> Result<()>
    where
        F: FnMut(WalEntry) -> ScanControl,
    {
        if first > last {
            return Ok(());
        }

        let segments: Vec<SegmentInfo> = {
            let catalogue = self.index.read();
            catalogue
                .segments
                .range(..=last)
                .map(|(_, info)| info)
                .filter(|info| info.entry_count > 0 && info.last_tick >= first)
                .cloned()
                .collect()
        };

        for info in segments {
            let entries = match read_entries(&info.path, info.len) {
                Ok(entries) => entries,
                // Pruned between taking the snapshot and opening the file
                Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(Error::DataUnavailable {
                        requested: first.saturating_sub(1),
                        oldest: self.pruned_through(),
                    });
                }
                Err(e) => return Err(e),
            };

            for entry in entries {
                if entry.tick < first {
                    continue;
                }
                if entry.tick > last {
                    return Ok(());
                }
                if visit(entry) == ScanControl::Stop {
                    return Ok(());
                }
            }
        }

        Ok(())
    }

    /// Read entries in a specific tick range (inclusive)
    pub fn read_range(&self, first: Tick, last: Tick) -> Result<Vec<WalEntry>> {
        let mut entries = Vec::new();
        self.scan(first, last, |entry| {
            entries.push(entry);
            ScanControl::Continue
        })?;
        Ok(entries)
    }

    /// Get all segment info
    pub fn segments(&self) -> Vec<SegmentInfo> {
        self.index.read().segments.values().cloned().collect()
    }
}
