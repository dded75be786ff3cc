//! Log Cursor
//!
//! Serves committed log entries after a client-supplied tick, in tick order,
//! bounded by a byte budget. Clients resume from `last_scanned_tick`;
//! because every tick up to it has been examined, the concatenation of
//! successive responses equals one unbounded read.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::storage::StorageEngine;
use crate::wal::{LogOperation, ScanControl, Tick, TransactionId, WalEntry};

/// Which entries a follow-log request wants to see
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogFilter {
    /// Only entries of this database
    #[serde(default)]
    pub database: Option<String>,
    /// Only entries touching this collection (markers are always kept)
    #[serde(default)]
    pub collection: Option<String>,
    /// Keep entries of system collections
    #[serde(default)]
    pub include_system: bool,
}

impl LogFilter {
    pub fn matches(&self, entry: &WalEntry) -> bool {
        if let Some(database) = &self.database {
            if &entry.database != database {
                return false;
            }
        }

        match entry.operation.collection() {
            Some(collection) => {
                if !self.include_system && collection.starts_with('_') {
                    return false;
                }
                self.collection.as_deref().map_or(true, |wanted| wanted == collection)
            }
            None => true,
        }
    }
}

/// One follow-log response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FollowResponse {
    pub entries: Vec<WalEntry>,
    /// Tick of the last entry returned (`from` if none)
    pub last_included_tick: Tick,
    /// Every tick up to here has been examined; resume from it
    pub last_scanned_tick: Tick,
    /// Newest committed tick on the server
    pub latest_tick: Tick,
    /// More entries are available within the requested range
    pub check_more: bool,
    /// The entry at `from` itself is still in the log (always true for 0)
    pub from_present: bool,
}

/// Transactions begun but not committed within a tick range
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenTransactions {
    pub transactions: Vec<TransactionId>,
    pub last_scanned_tick: Tick,
}

/// Tailing cursor over the storage engine's log
#[derive(Clone)]
pub struct LogCursor {
    engine: Arc<StorageEngine>,
}

impl LogCursor {
    pub fn new(engine: Arc<StorageEngine>) -> Self {
        Self { engine }
    }

    /// Entries with `from < tick <= min(to, latest)` that match `filter`.
    /// At least one matching entry is returned when any exists, even if it
    /// alone exceeds `budget_bytes`.
    pub fn follow(
        &self,
        from: Tick,
        to: Option<Tick>,
        filter: &LogFilter,
        budget_bytes: usize,
    ) -> Result<FollowResponse> {
        let reader = self.engine.reader();
        let latest = self.engine.last_tick();
        let upper = to.map_or(latest, |to| to.min(latest));

        reader.ensure_available(from)?;

        let mut response = FollowResponse {
            entries: Vec::new(),
            last_included_tick: from,
            last_scanned_tick: from.max(upper),
            latest_tick: latest,
            check_more: false,
            from_present: from == 0,
        };

        if from >= upper {
            response.last_scanned_tick = from;
            response.from_present = from == 0 || self.tick_present(from)?;
            return Ok(response);
        }

        let mut used = 0usize;
        let mut budget_hit = false;
        reader.scan(from.max(1), upper, |entry| {
            if entry.tick == from {
                response.from_present = true;
                return ScanControl::Continue;
            }

            response.last_scanned_tick = entry.tick;
            if filter.matches(&entry) {
                used += entry.approximate_size();
                response.last_included_tick = entry.tick;
                response.entries.push(entry);
                if used >= budget_bytes {
                    budget_hit = true;
                    return ScanControl::Stop;
                }
            }
            ScanControl::Continue
        })?;

        // A scan that ran off the end has examined everything up to `upper`
        if !budget_hit {
            response.last_scanned_tick = upper;
        }
        response.check_more = response.last_scanned_tick < upper;

        // GC may have raced the scan; never hand out a response with a hole
        reader.ensure_available(from)?;

        tracing::debug!(
            "follow-log from {}: {} entries, scanned through {} (latest {})",
            from,
            response.entries.len(),
            response.last_scanned_tick,
            latest
        );
        Ok(response)
    }

    /// Transactions that have begun but not committed in `(from, to]`
    pub fn open_transactions(&self, from: Tick, to: Option<Tick>) -> Result<OpenTransactions> {
        let reader = self.engine.reader();
        let latest = self.engine.last_tick();
        let upper = to.map_or(latest, |to| to.min(latest));

        reader.ensure_available(from)?;
        if from >= upper {
            return Ok(OpenTransactions {
                transactions: Vec::new(),
                last_scanned_tick: from,
            });
        }

        let mut open = BTreeSet::new();
        let mut committed = BTreeSet::new();
        reader.scan(from + 1, upper, |entry| {
            match &entry.operation {
                LogOperation::CommitTransaction { tid } => {
                    open.remove(tid);
                    committed.insert(*tid);
                }
                operation => {
                    if let Some(tid) = operation.transaction_id() {
                        if !committed.contains(&tid) {
                            open.insert(tid);
                        }
                    }
                }
            }
            ScanControl::Continue
        })?;

        Ok(OpenTransactions {
            transactions: open.into_iter().collect(),
            last_scanned_tick: upper.max(from),
        })
    }

    fn tick_present(&self, tick: Tick) -> Result<bool> {
        let mut present = false;
        self.engine.reader().scan(tick, tick, |_| {
            present = true;
            ScanControl::Stop
        })?;
        Ok(present)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WalConfig;
    use crate::error::Error;
    use crate::storage::{CollectionDescription, WriteOp, SYSTEM_DATABASE};
    use crate::wal::RawJson;
    use serde_json::json;
    use tempfile::tempdir;

    fn test_config() -> WalConfig {
        WalConfig {
            compression: false,
            segment_size_mb: 1,
            retention_secs: 0,
            fsync: false,
        }
    }

    async fn setup(dir: &std::path::Path) -> (Arc<StorageEngine>, LogCursor) {
        let engine = Arc::new(StorageEngine::open(dir.join("wal"), test_config()).unwrap());
        for name in ["orders", "users", "_graphs"] {
            engine
                .create_collection(SYSTEM_DATABASE, CollectionDescription::new(name))
                .await
                .unwrap();
        }
        let cursor = LogCursor::new(Arc::clone(&engine));
        (engine, cursor)
    }

    fn all() -> LogFilter {
        LogFilter {
            include_system: true,
            ..LogFilter::default()
        }
    }

    #[tokio::test]
    async fn test_follow_returns_entries_after_from() {
        let dir = tempdir().unwrap();
        let (engine, cursor) = setup(dir.path()).await;
        for i in 0..5 {
            engine
                .insert(SYSTEM_DATABASE, "orders", &format!("o{}", i), json!({ "i": i }))
                .await
                .unwrap();
        }

        let response = cursor.follow(3, None, &all(), usize::MAX).unwrap();
        let ticks: Vec<Tick> = response.entries.iter().map(|e| e.tick).collect();
        assert_eq!(ticks, vec![4, 5, 6, 7, 8]);
        assert_eq!(response.last_included_tick, 8);
        assert_eq!(response.latest_tick, 8);
        assert!(!response.check_more);
        assert!(response.from_present);
    }

    #[tokio::test]
    async fn test_resumed_reads_are_gap_free() {
        let dir = tempdir().unwrap();
        let (engine, cursor) = setup(dir.path()).await;
        for i in 0..40 {
            let collection = if i % 3 == 0 { "users" } else { "orders" };
            engine
                .insert(SYSTEM_DATABASE, collection, &format!("k{}", i), json!({ "i": i }))
                .await
                .unwrap();
        }
        engine
            .write(
                SYSTEM_DATABASE,
                "orders",
                vec![
                    WriteOp::Upsert { key: "t1".into(), data: RawJson::from(json!({})), rev: None },
                    WriteOp::Remove { key: "k1".into() },
                ],
            )
            .await
            .unwrap();

        let filter = LogFilter {
            collection: Some("orders".into()),
            ..LogFilter::default()
        };
        let unbounded = cursor.follow(0, None, &filter, usize::MAX).unwrap();

        let mut concatenated = Vec::new();
        let mut from = 0;
        loop {
            let response = cursor.follow(from, None, &filter, 200).unwrap();
            concatenated.extend(response.entries);
            from = response.last_scanned_tick;
            if !response.check_more {
                break;
            }
        }

        assert_eq!(concatenated, unbounded.entries);
        let mut ticks: Vec<Tick> = concatenated.iter().map(|e| e.tick).collect();
        let before = ticks.len();
        ticks.dedup();
        assert_eq!(ticks.len(), before);
    }

    #[tokio::test]
    async fn test_budget_always_includes_one_entry() {
        let dir = tempdir().unwrap();
        let (engine, cursor) = setup(dir.path()).await;
        engine
            .insert(SYSTEM_DATABASE, "orders", "big", json!({ "blob": "x".repeat(4096) }))
            .await
            .unwrap();
        engine.insert(SYSTEM_DATABASE, "orders", "next", json!({})).await.unwrap();

        let response = cursor.follow(3, None, &all(), 1).unwrap();
        assert_eq!(response.entries.len(), 1);
        assert_eq!(response.last_included_tick, 4);
        assert!(response.check_more);
    }

    #[tokio::test]
    async fn test_filters() {
        let dir = tempdir().unwrap();
        let (engine, cursor) = setup(dir.path()).await;
        engine.insert(SYSTEM_DATABASE, "_graphs", "g", json!({})).await.unwrap();
        engine.insert(SYSTEM_DATABASE, "users", "u", json!({})).await.unwrap();

        let response = cursor.follow(0, None, &LogFilter::default(), usize::MAX).unwrap();
        assert!(response.entries.iter().all(|e| !e.operation.is_system()));

        let response = cursor.follow(0, None, &all(), usize::MAX).unwrap();
        assert!(response.entries.iter().any(|e| e.operation.is_system()));

        let other_db = LogFilter {
            database: Some("shop".into()),
            include_system: true,
            ..LogFilter::default()
        };
        let response = cursor.follow(0, None, &other_db, usize::MAX).unwrap();
        assert!(response.entries.is_empty());
        assert_eq!(response.last_scanned_tick, 5);
    }

    #[tokio::test]
    async fn test_upper_bound() {
        let dir = tempdir().unwrap();
        let (engine, cursor) = setup(dir.path()).await;
        for i in 0..5 {
            engine.insert(SYSTEM_DATABASE, "orders", &format!("o{}", i), json!({})).await.unwrap();
        }

        let response = cursor.follow(3, Some(5), &all(), usize::MAX).unwrap();
        let ticks: Vec<Tick> = response.entries.iter().map(|e| e.tick).collect();
        assert_eq!(ticks, vec![4, 5]);
        assert_eq!(response.latest_tick, 8);
        assert!(!response.check_more);

        let caught_up = cursor.follow(8, None, &all(), usize::MAX).unwrap();
        assert!(caught_up.entries.is_empty());
        assert_eq!(caught_up.last_scanned_tick, 8);
        assert!(caught_up.from_present);
    }

    #[tokio::test]
    async fn test_reclaimed_range_is_unavailable() {
        let dir = tempdir().unwrap();
        let (engine, cursor) = setup(dir.path()).await;
        engine.insert(SYSTEM_DATABASE, "orders", "a", json!({})).await.unwrap();
        engine.collect_garbage(|| None).await.unwrap();
        engine.insert(SYSTEM_DATABASE, "orders", "b", json!({})).await.unwrap();

        assert!(matches!(
            cursor.follow(1, None, &all(), usize::MAX),
            Err(Error::DataUnavailable { requested: 1, oldest: 4 })
        ));

        let response = cursor.follow(4, None, &all(), usize::MAX).unwrap();
        assert_eq!(response.entries.len(), 1);
        assert!(!response.from_present);
    }

    #[tokio::test]
    async fn test_open_transactions() {
        let dir = tempdir().unwrap();
        let (engine, cursor) = setup(dir.path()).await;
        let last = engine
            .write(
                SYSTEM_DATABASE,
                "orders",
                vec![
                    WriteOp::Upsert { key: "a".into(), data: RawJson::from(json!({})), rev: None },
                    WriteOp::Upsert { key: "b".into(), data: RawJson::from(json!({})), rev: None },
                ],
            )
            .await
            .unwrap();
        assert_eq!(last, 7);

        // Begin marker is tick 4; at tick 5 the transaction is still open
        let open = cursor.open_transactions(3, Some(5)).unwrap();
        assert_eq!(open.transactions, vec![4]);
        assert_eq!(open.last_scanned_tick, 5);

        let closed = cursor.open_transactions(3, None).unwrap();
        assert!(closed.transactions.is_empty());

        // Joining mid-transaction still reports it
        let mid = cursor.open_transactions(4, Some(6)).unwrap();
        assert_eq!(mid.transactions, vec![4]);

        // Nothing lies beyond the end of the log
        let beyond = cursor.open_transactions(Tick::MAX, None).unwrap();
        assert!(beyond.transactions.is_empty());
        assert_eq!(beyond.last_scanned_tick, Tick::MAX);
        let inverted = cursor.open_transactions(6, Some(2)).unwrap();
        assert!(inverted.transactions.is_empty());
        assert_eq!(inverted.last_scanned_tick, 6);
    }
}
