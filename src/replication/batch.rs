//! Context Registry (sync batches)
//!
//! A sync batch pins a minimum log tick and a repeatable-read snapshot for
//! as long as a replication client keeps it alive. Batches end by explicit
//! close or by TTL expiry; both go through [`BatchTable::finish`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::expiry::ExpiryQueue;
use super::pins::TickPins;
use crate::error::{Error, ResourceKind, Result};
use crate::id::{IdGenerator, ResourceId};
use crate::storage::{Snapshot, StorageEngine};
use crate::wal::Tick;

/// Public view of a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchInfo {
    pub id: ResourceId,
    pub database: String,
    /// Log entries after this tick are retained while the batch lives
    pub min_tick: Tick,
    /// Tick of the batch's snapshot
    pub snapshot_tick: Tick,
    pub ttl_secs: u64,
}

struct Batch {
    database: String,
    min_tick: Tick,
    ttl: Duration,
    expires_at: Instant,
    snapshot: Arc<Snapshot>,
}

impl Batch {
    fn info(&self, id: ResourceId) -> BatchInfo {
        BatchInfo {
            id,
            database: self.database.clone(),
            min_tick: self.min_tick,
            snapshot_tick: self.snapshot.tick,
            ttl_secs: self.ttl.as_secs(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EndReason {
    Closed,
    Expired,
}

#[derive(Default)]
struct BatchTable {
    batches: HashMap<ResourceId, Batch>,
    expiry: ExpiryQueue<ResourceId>,
}

impl BatchTable {
    /// The single removal path for batches
    fn finish(&mut self, pins: &TickPins, id: ResourceId, reason: EndReason) -> Option<Batch> {
        let batch = self.batches.remove(&id)?;
        pins.unpin(batch.min_tick);
        match reason {
            EndReason::Closed => tracing::debug!("Closed sync batch {}", id),
            EndReason::Expired => tracing::warn!(
                "Sync batch {} for database '{}' expired after {:?} without keep-alive",
                id,
                batch.database,
                batch.ttl
            ),
        }
        Some(batch)
    }

    /// Look up a live batch; an expired one is reaped on the spot
    fn live(&mut self, pins: &TickPins, id: ResourceId, now: Instant) -> Result<&mut Batch> {
        let expired = match self.batches.get(&id) {
            None => return Err(Error::not_found(ResourceKind::Batch, id)),
            Some(batch) => batch.expires_at <= now,
        };
        if expired {
            self.finish(pins, id, EndReason::Expired);
            return Err(Error::expired(ResourceKind::Batch, id));
        }
        self.batches
            .get_mut(&id)
            .ok_or_else(|| Error::not_found(ResourceKind::Batch, id))
    }
}

/// Registry of live sync batches
pub struct BatchRegistry {
    engine: Arc<StorageEngine>,
    ids: Arc<IdGenerator>,
    pins: TickPins,
    table: Mutex<BatchTable>,
}

impl BatchRegistry {
    pub fn new(engine: Arc<StorageEngine>, ids: Arc<IdGenerator>) -> Self {
        Self {
            engine,
            ids,
            pins: TickPins::new(),
            table: Mutex::new(BatchTable::default()),
        }
    }

    /// Open a batch pinning the current tick
    pub async fn open(&self, database: &str, ttl: Duration) -> Result<BatchInfo> {
        self.engine.ensure_serving()?;

        let pinned = self.pins.pin_current(|| self.engine.last_tick());
        let snapshot = self.engine.snapshot().await;
        if let Err(e) = snapshot.database(database) {
            self.pins.unpin(pinned);
            return Err(e);
        }
        self.pins.repin(pinned, snapshot.tick);

        let id = self.ids.generate();
        let expires_at = Instant::now() + ttl;
        let batch = Batch {
            database: database.to_string(),
            min_tick: snapshot.tick,
            ttl,
            expires_at,
            snapshot: Arc::new(snapshot),
        };
        let info = batch.info(id);

        let mut table = self.table.lock().await;
        table.batches.insert(id, batch);
        table.expiry.schedule(id, expires_at);

        tracing::debug!(
            "Opened sync batch {} on '{}' at tick {} (ttl {:?})",
            id,
            database,
            info.min_tick,
            ttl
        );
        Ok(info)
    }

    /// Keep a batch alive for another `ttl`; `tick` may only raise its
    /// minimum tick
    pub async fn extend(&self, id: ResourceId, ttl: Duration, tick: Option<Tick>) -> Result<BatchInfo> {
        let now = Instant::now();
        let latest = self.engine.last_tick();
        let mut table = self.table.lock().await;

        let batch = table.live(&self.pins, id, now)?;
        batch.ttl = ttl;
        batch.expires_at = now + ttl;
        if let Some(tick) = tick.map(|t| t.min(latest)) {
            if tick > batch.min_tick {
                self.pins.repin(batch.min_tick, tick);
                batch.min_tick = tick;
            }
        }
        let info = batch.info(id);
        let expires_at = batch.expires_at;
        table.expiry.schedule(id, expires_at);
        Ok(info)
    }

    /// Close a batch, releasing its pin immediately
    pub async fn close(&self, id: ResourceId) -> Result<()> {
        let mut table = self.table.lock().await;
        table
            .finish(&self.pins, id, EndReason::Closed)
            .map(|_| ())
            .ok_or_else(|| Error::not_found(ResourceKind::Batch, id))
    }

    /// The batch's snapshot
    pub async fn snapshot(&self, id: ResourceId) -> Result<Arc<Snapshot>> {
        let mut table = self.table.lock().await;
        let batch = table.live(&self.pins, id, Instant::now())?;
        Ok(Arc::clone(&batch.snapshot))
    }

    pub async fn get(&self, id: ResourceId) -> Result<BatchInfo> {
        let mut table = self.table.lock().await;
        let batch = table.live(&self.pins, id, Instant::now())?;
        Ok(batch.info(id))
    }

    /// Reap every batch whose TTL has passed; returns how many were reaped
    pub async fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut table = self.table.lock().await;
        let mut reaped = 0;
        for id in table.expiry.pop_due(now) {
            // Stale heap entries belong to batches that were extended or closed
            let due = table
                .batches
                .get(&id)
                .map_or(false, |batch| batch.expires_at <= now);
            if due && table.finish(&self.pins, id, EndReason::Expired).is_some() {
                reaped += 1;
            }
        }
        reaped
    }

    /// Minimum tick pinned by any live batch
    pub fn min_tick(&self) -> Option<Tick> {
        self.pins.min()
    }

    pub async fn len(&self) -> usize {
        self.table.lock().await.batches.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WalConfig;
    use crate::storage::{CollectionDescription, SYSTEM_DATABASE};
    use crate::replication::cursor::{LogCursor, LogFilter};
    use rand::Rng;
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

    async fn setup(dir: &std::path::Path) -> (Arc<StorageEngine>, BatchRegistry) {
        let engine = Arc::new(StorageEngine::open(dir.join("wal"), test_config()).unwrap());
        engine
            .create_collection(SYSTEM_DATABASE, CollectionDescription::new("orders"))
            .await
            .unwrap();
        let registry = BatchRegistry::new(Arc::clone(&engine), Arc::new(IdGenerator::new(1)));
        (engine, registry)
    }

    #[tokio::test]
    async fn test_open_extend_close() {
        let dir = tempdir().unwrap();
        let (engine, registry) = setup(dir.path()).await;

        let batch = registry.open(SYSTEM_DATABASE, Duration::from_secs(60)).await.unwrap();
        assert_eq!(batch.min_tick, 1);
        assert_eq!(registry.min_tick(), Some(1));

        engine.insert(SYSTEM_DATABASE, "orders", "a", json!({})).await.unwrap();
        let extended = registry
            .extend(batch.id, Duration::from_secs(120), Some(2))
            .await
            .unwrap();
        assert_eq!(extended.min_tick, 2);
        assert_eq!(extended.ttl_secs, 120);

        // minTick never moves down
        let extended = registry
            .extend(batch.id, Duration::from_secs(120), Some(1))
            .await
            .unwrap();
        assert_eq!(extended.min_tick, 2);

        registry.close(batch.id).await.unwrap();
        assert_eq!(registry.min_tick(), None);
        assert!(matches!(registry.close(batch.id).await, Err(Error::NotFound { .. })));
        assert!(matches!(
            registry.extend(batch.id, Duration::from_secs(1), None).await,
            Err(Error::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_unknown_database() {
        let dir = tempdir().unwrap();
        let (_engine, registry) = setup(dir.path()).await;

        assert!(matches!(
            registry.open("nope", Duration::from_secs(60)).await,
            Err(Error::NotFound { kind: ResourceKind::Database, .. })
        ));
        assert_eq!(registry.min_tick(), None);
    }

    #[tokio::test]
    async fn test_shutdown_refuses_open() {
        let dir = tempdir().unwrap();
        let (engine, registry) = setup(dir.path()).await;
        engine.begin_shutdown();

        assert!(matches!(
            registry.open(SYSTEM_DATABASE, Duration::from_secs(60)).await,
            Err(Error::NotReplicationCapable(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_and_sweep() {
        let dir = tempdir().unwrap();
        let (_engine, registry) = setup(dir.path()).await;

        let short = registry.open(SYSTEM_DATABASE, Duration::from_secs(5)).await.unwrap();
        let long = registry.open(SYSTEM_DATABASE, Duration::from_secs(60)).await.unwrap();

        tokio::time::advance(Duration::from_secs(6)).await;

        // Expired but not yet swept
        assert!(matches!(
            registry.extend(short.id, Duration::from_secs(5), None).await,
            Err(Error::Expired { .. })
        ));
        // Reaped by the failed call
        assert!(matches!(registry.close(short.id).await, Err(Error::NotFound { .. })));

        registry.extend(long.id, Duration::from_secs(10), None).await.unwrap();
        tokio::time::advance(Duration::from_secs(55)).await;
        // Extended to t=16s, so it is due now
        assert_eq!(registry.sweep().await, 1);
        assert!(registry.is_empty().await);
        assert_eq!(registry.min_tick(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_extended_batch_survives_stale_deadline() {
        let dir = tempdir().unwrap();
        let (_engine, registry) = setup(dir.path()).await;

        let batch = registry.open(SYSTEM_DATABASE, Duration::from_secs(5)).await.unwrap();
        tokio::time::advance(Duration::from_secs(4)).await;
        registry.extend(batch.id, Duration::from_secs(30), None).await.unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(registry.sweep().await, 0);
        assert!(registry.get(batch.id).await.is_ok());
    }

    #[tokio::test]
    async fn test_min_tick_never_exceeds_live_batches() {
        let dir = tempdir().unwrap();
        let (engine, registry) = setup(dir.path()).await;
        let mut rng = rand::thread_rng();
        let mut live: HashMap<ResourceId, Tick> = HashMap::new();

        for step in 0..200 {
            match rng.gen_range(0..4) {
                0 => {
                    let batch = registry.open(SYSTEM_DATABASE, Duration::from_secs(60)).await.unwrap();
                    live.insert(batch.id, batch.min_tick);
                }
                1 if !live.is_empty() => {
                    let id = *live.keys().nth(rng.gen_range(0..live.len())).unwrap();
                    let tick = rng.gen_range(0..=engine.last_tick());
                    let info = registry.extend(id, Duration::from_secs(60), Some(tick)).await.unwrap();
                    assert!(info.min_tick >= live[&id]);
                    live.insert(id, info.min_tick);
                }
                2 if !live.is_empty() => {
                    let id = *live.keys().nth(rng.gen_range(0..live.len())).unwrap();
                    registry.close(id).await.unwrap();
                    live.remove(&id);
                }
                _ => {
                    engine
                        .insert(SYSTEM_DATABASE, "orders", &format!("k{}", step), json!({}))
                        .await
                        .unwrap();
                }
            }

            let reported = registry.min_tick();
            match live.values().min() {
                Some(lowest) => assert_eq!(reported, Some(*lowest)),
                None => assert_eq!(reported, None),
            }
        }
    }

    #[tokio::test]
    async fn test_batch_retains_log_until_closed() {
        let dir = tempdir().unwrap();
        let (engine, registry) = setup(dir.path()).await;
        for i in 0..99 {
            engine.insert(SYSTEM_DATABASE, "orders", &format!("seed{}", i), json!({})).await.unwrap();
        }
        assert_eq!(engine.last_tick(), 100);

        let batch = registry.open(SYSTEM_DATABASE, Duration::from_secs(60)).await.unwrap();
        assert_eq!(batch.min_tick, 100);
        for i in 0..50 {
            engine.insert(SYSTEM_DATABASE, "orders", &format!("w{}", i), json!({ "i": i })).await.unwrap();
        }

        let cursor = LogCursor::new(Arc::clone(&engine));
        let filter = LogFilter::default();

        engine.collect_garbage(|| registry.min_tick()).await.unwrap();
        let response = cursor.follow(100, None, &filter, usize::MAX).unwrap();
        assert_eq!(response.entries.len(), 50);
        assert_eq!(response.last_included_tick, 150);

        registry.close(batch.id).await.unwrap();
        engine.collect_garbage(|| registry.min_tick()).await.unwrap();
        assert!(matches!(
            cursor.follow(100, None, &filter, usize::MAX),
            Err(Error::DataUnavailable { .. })
        ));
    }
}
