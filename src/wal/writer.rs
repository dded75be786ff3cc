//! WAL Writer
//!
//! Appends committed entries to the active segment and rotates segments.
//! The writer is driven from inside the storage engine's commit section, so
//! appends are strictly ordered by tick.

use std::path::{Path, PathBuf};
use std::time::Duration;

use super::entry::{Tick, WalEntry};
use super::segment::{encode_record, list_segments, Segment};
use super::{SegmentInfo, SharedIndex, WalPaths};
use crate::config::WalConfig;
use crate::error::{Error, Result};

/// WAL writer owning the active segment
pub struct WalWriter {
    /// WAL paths
    paths: WalPaths,
    /// Configuration
    config: WalConfig,
    /// Current active segment
    active: Option<Segment>,
    /// Catalogue shared with readers
    index: SharedIndex,
    /// Tick of the last appended entry
    last_tick: Tick,
}

impl WalWriter {
    /// Open the WAL in `wal_dir`, recovering every existing segment
    pub fn open(wal_dir: PathBuf, config: WalConfig) -> Result<Self> {
        let paths = WalPaths::new(wal_dir);
        paths.ensure_dirs()?;

        let index = SharedIndex::default();
        let mut active = None;
        let mut last_tick = 0;

        let segment_paths = list_segments(&paths.base_dir)?;
        let count = segment_paths.len();
        {
            let mut catalogue = index.write();
            for (position, path) in segment_paths.into_iter().enumerate() {
                let segment = Segment::recover(path, config.segment_size_mb, config.compression)?;
                if segment.entry_count() > 0 {
                    last_tick = last_tick.max(segment.last_tick());
                }
                catalogue.segments.insert(segment.first_tick(), info_of(&segment));

                if position + 1 == count && !segment.is_sealed() {
                    active = Some(segment);
                }
            }

            catalogue.pruned_through = catalogue
                .first_tick()
                .map(|first| first.saturating_sub(1))
                .unwrap_or(0);
        }

        tracing::debug!(
            "Opened WAL at {:?}: {} segments, last tick {}",
            paths.base_dir,
            count,
            last_tick
        );

        Ok(Self {
            paths,
            config,
            active,
            index,
            last_tick,
        })
    }

    /// Index handle for readers
    pub fn index(&self) -> SharedIndex {
        self.index.clone()
    }

    /// Tick of the last appended entry (0 if the log is empty)
    pub fn last_tick(&self) -> Tick {
        self.last_tick
    }

    pub fn dir(&self) -> &Path {
        &self.paths.base_dir
    }

    /// Raise the reclaimed horizon when no segment covers older ticks, e.g.
    /// after recovering from a checkpoint whose log was already pruned
    pub fn raise_horizon(&mut self, tick: Tick) {
        let mut catalogue = self.index.write();
        if catalogue.first_tick().is_none() {
            catalogue.pruned_through = catalogue.pruned_through.max(tick);
        }
        self.last_tick = self.last_tick.max(tick);
    }

    /// Append an entry to the WAL
    pub fn append(&mut self, entry: &WalEntry) -> Result<()> {
        if entry.tick <= self.last_tick {
            return Err(Error::Wal(format!(
                "Tick {} is not after last tick {}",
                entry.tick, self.last_tick
            )));
        }

        let record = encode_record(entry, self.config.compression)?;

        let needs_rotation = match self.active.as_ref() {
            Some(segment) => {
                segment.is_sealed() || (!segment.is_empty() && !segment.has_space(record.len()))
            }
            None => true,
        };
        if needs_rotation {
            self.rotate(entry.tick)?;
        }

        let segment = self
            .active
            .as_mut()
            .ok_or_else(|| Error::Wal("No active segment".into()))?;
        segment.write_record(entry, &record)?;
        if self.config.fsync {
            segment.sync()?;
        }
        self.last_tick = entry.tick;

        // Publish the committed length only after the record is written
        let info = info_of(segment);
        self.index.write().segments.insert(info.first_tick, info);
        Ok(())
    }

    /// Seal the active segment so it becomes eligible for pruning
    pub fn seal_active(&mut self) -> Result<()> {
        if let Some(mut segment) = self.active.take() {
            if segment.is_sealed() {
                return Ok(());
            }
            if segment.is_empty() {
                // Nothing to keep; drop the empty file
                self.index.write().segments.remove(&segment.first_tick());
                std::fs::remove_file(&segment.path)?;
                return Ok(());
            }
            segment.seal()?;
            let info = info_of(&segment);
            self.index.write().segments.insert(info.first_tick, info);
        }
        Ok(())
    }

    /// Delete segments whose entries are all at or below `horizon` and whose
    /// newest record is older than `min_age`. Returns the number of segments
    /// removed.
    pub fn prune(&mut self, horizon: Tick, min_age: Duration) -> Result<usize> {
        let now = chrono::Utc::now();
        let min_age = chrono::Duration::from_std(min_age)
            .map_err(|e| Error::Internal(format!("retention out of range: {}", e)))?;

        let eligible = |info: &SegmentInfo| {
            info.entry_count > 0
                && info.last_tick <= horizon
                && info.last_write.map_or(true, |written| now - written >= min_age)
        };

        if self
            .active
            .as_ref()
            .map_or(false, |segment| eligible(&info_of(segment)))
        {
            self.seal_active()?;
        }

        let victims: Vec<SegmentInfo> = {
            let catalogue = self.index.read();
            catalogue
                .segments
                .values()
                .take_while(|info| info.sealed && eligible(info))
                .cloned()
                .collect()
        };

        if victims.is_empty() {
            return Ok(0);
        }

        {
            // Unpublish before deleting so readers fail cleanly
            let mut catalogue = self.index.write();
            for info in &victims {
                catalogue.segments.remove(&info.first_tick);
                catalogue.pruned_through = catalogue.pruned_through.max(info.last_tick);
            }
        }

        for info in &victims {
            if let Err(e) = std::fs::remove_file(&info.path) {
                tracing::warn!("Failed to remove WAL segment {:?}: {}", info.path, e);
            }
        }

        tracing::info!(
            "Pruned {} WAL segments through tick {}",
            victims.len(),
            self.index.read().pruned_through
        );
        Ok(victims.len())
    }

    /// Create a new active segment starting at `first_tick`
    fn rotate(&mut self, first_tick: Tick) -> Result<()> {
        self.seal_active()?;

        let segment = Segment::create(
            self.paths.segment_path(first_tick),
            first_tick,
            self.config.segment_size_mb,
            self.config.compression,
        )?;
        self.index.write().segments.insert(first_tick, info_of(&segment));
        self.active = Some(segment);
        Ok(())
    }
}

fn info_of(segment: &Segment) -> SegmentInfo {
    SegmentInfo {
        id: segment.id,
        path: segment.path.clone(),
        first_tick: segment.first_tick(),
        last_tick: segment.last_tick(),
        entry_count: segment.entry_count(),
        len: segment.len(),
        sealed: segment.is_sealed(),
        last_write: segment.last_timestamp(),
    }
}
