//! Read-Lock Coordinator (lock jobs)
//!
//! A lock job asks for a collection's write-exclusion section on behalf of a
//! follower. Acquisition runs in a background waiter; the follower polls.
//!
//! ```text
//! Pending --(section acquired)--> Locked --(cancel | ttl)--> Canceled / TimedOut
//! Pending --(cancel | ttl)--> Canceled / TimedOut
//! ```
//!
//! The held section is an owned guard stored in the job, so every exit path
//! releases it by dropping the guard. All transitions out of `Pending` and
//! `Locked` go through [`LockTable::finish`], and a grant is only accepted
//! while the job is still `Pending`, so cancellation wins over a late grant.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedRwLockWriteGuard};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::expiry::ExpiryQueue;
use crate::error::{Error, ResourceKind, Result};
use crate::id::{IdGenerator, ResourceId};
use crate::storage::StorageEngine;
use crate::wal::Tick;

/// Lock job state as reported to pollers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "kebab-case")]
pub enum LockState {
    Pending,
    Locked { handover_tick: Tick },
    Canceled,
    TimedOut,
}

impl LockState {
    pub fn is_active(&self) -> bool {
        matches!(self, LockState::Pending | LockState::Locked { .. })
    }
}

/// Public view of a lock job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockStatus {
    pub id: ResourceId,
    pub database: String,
    pub collection: String,
    #[serde(flatten)]
    pub state: LockState,
    pub ttl_secs: u64,
}

type CollectionKey = (String, String);

struct Job {
    database: String,
    collection: String,
    state: LockState,
    ttl: Duration,
    expires_at: Instant,
    cancel: CancellationToken,
    guard: Option<OwnedRwLockWriteGuard<()>>,
}

impl Job {
    fn status(&self, id: ResourceId) -> LockStatus {
        LockStatus {
            id,
            database: self.database.clone(),
            collection: self.collection.clone(),
            state: self.state,
            ttl_secs: self.ttl.as_secs(),
        }
    }

    fn key(&self) -> CollectionKey {
        (self.database.clone(), self.collection.clone())
    }
}

#[derive(Default)]
struct LockTable {
    jobs: HashMap<ResourceId, Job>,
    /// Pending or Locked job per collection
    active: HashMap<CollectionKey, ResourceId>,
    expiry: ExpiryQueue<ResourceId>,
    tombstones: ExpiryQueue<ResourceId>,
}

impl LockTable {
    /// Move an active job to a final state, releasing the section if held
    fn finish(&mut self, id: ResourceId, state: LockState, tombstone_ttl: Duration) {
        let Some(job) = self.jobs.get_mut(&id) else {
            return;
        };
        if !job.state.is_active() {
            return;
        }

        let was_locked = matches!(job.state, LockState::Locked { .. });
        job.state = state;
        job.cancel.cancel();
        job.guard = None;
        let key = job.key();

        match state {
            LockState::TimedOut => tracing::warn!(
                "Lock job {} on {}/{} timed out after {:?} (was {})",
                id,
                key.0,
                key.1,
                job.ttl,
                if was_locked { "locked" } else { "pending" }
            ),
            _ => tracing::debug!("Lock job {} on {}/{} canceled", id, key.0, key.1),
        }

        if self.active.get(&key) == Some(&id) {
            self.active.remove(&key);
        }
        self.tombstones.schedule(id, Instant::now() + tombstone_ttl);
    }

    /// Expire the job if its TTL has passed
    fn check_expiry(&mut self, id: ResourceId, now: Instant, tombstone_ttl: Duration) {
        let due = self
            .jobs
            .get(&id)
            .map_or(false, |job| job.state.is_active() && job.expires_at <= now);
        if due {
            self.finish(id, LockState::TimedOut, tombstone_ttl);
        }
    }

    /// Accept the waiter's guard only if the job still wants it
    fn grant(&mut self, id: ResourceId, guard: OwnedRwLockWriteGuard<()>, handover_tick: Tick) -> bool {
        match self.jobs.get_mut(&id) {
            Some(job) if job.state == LockState::Pending => {
                job.state = LockState::Locked { handover_tick };
                job.guard = Some(guard);
                tracing::debug!(
                    "Lock job {} acquired {}/{} at handover tick {}",
                    id,
                    job.database,
                    job.collection,
                    handover_tick
                );
                true
            }
            // Canceled or timed out in the meantime; `guard` drops here
            _ => false,
        }
    }
}

/// Coordinator of all lock jobs
pub struct LockCoordinator {
    engine: Arc<StorageEngine>,
    ids: Arc<IdGenerator>,
    table: Arc<Mutex<LockTable>>,
    tombstone_ttl: Duration,
}

impl LockCoordinator {
    pub fn new(engine: Arc<StorageEngine>, ids: Arc<IdGenerator>, tombstone_ttl: Duration) -> Self {
        Self {
            engine,
            ids,
            table: Arc::new(Mutex::new(LockTable::default())),
            tombstone_ttl,
        }
    }

    /// Start acquiring a collection's write-exclusion section
    pub async fn request(&self, database: &str, collection: &str, ttl: Duration) -> Result<LockStatus> {
        self.engine.ensure_serving()?;
        if !self.engine.has_collection(database, collection).await {
            return Err(Error::not_found(
                ResourceKind::Collection,
                format!("{}/{}", database, collection),
            ));
        }

        let key = (database.to_string(), collection.to_string());
        let now = Instant::now();
        let mut table = self.table.lock().await;

        if let Some(existing) = table.active.get(&key).copied() {
            table.check_expiry(existing, now, self.tombstone_ttl);
            if table.active.contains_key(&key) {
                return Err(Error::LockConflict {
                    collection: collection.to_string(),
                    job: existing.to_string(),
                });
            }
        }

        let id = self.ids.generate();
        let cancel = CancellationToken::new();
        let job = Job {
            database: database.to_string(),
            collection: collection.to_string(),
            state: LockState::Pending,
            ttl,
            expires_at: now + ttl,
            cancel: cancel.clone(),
            guard: None,
        };
        let status = job.status(id);

        table.jobs.insert(id, job);
        table.active.insert(key, id);
        table.expiry.schedule(id, now + ttl);
        drop(table);

        self.spawn_waiter(id, database, collection, cancel);

        tracing::debug!("Lock job {} requested for {}/{} (ttl {:?})", id, database, collection, ttl);
        Ok(status)
    }

    fn spawn_waiter(&self, id: ResourceId, database: &str, collection: &str, cancel: CancellationToken) {
        let section = self.engine.write_section(database, collection);
        let engine = Arc::clone(&self.engine);
        let table = Arc::clone(&self.table);

        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                guard = section.write_owned() => {
                    // In-flight writers have drained; later ones block on the section
                    let handover_tick = engine.last_tick();
                    let mut table = table.lock().await;
                    table.grant(id, guard, handover_tick);
                }
            }
        });
    }

    /// Report a job's state. Polling an active job keeps it alive for
    /// another TTL.
    pub async fn poll(&self, id: ResourceId) -> Result<LockStatus> {
        let now = Instant::now();
        let mut table = self.table.lock().await;
        table.check_expiry(id, now, self.tombstone_ttl);

        let job = table
            .jobs
            .get_mut(&id)
            .ok_or_else(|| Error::not_found(ResourceKind::LockJob, id))?;
        let status = job.status(id);
        if job.state.is_active() {
            job.expires_at = now + job.ttl;
            let expires_at = job.expires_at;
            table.expiry.schedule(id, expires_at);
        }
        Ok(status)
    }

    /// Cancel a job, releasing the section if it was acquired. Cancelling
    /// a finished job reports its final state.
    pub async fn cancel(&self, id: ResourceId) -> Result<LockStatus> {
        let now = Instant::now();
        let mut table = self.table.lock().await;
        table.check_expiry(id, now, self.tombstone_ttl);
        table.finish(id, LockState::Canceled, self.tombstone_ttl);

        table
            .jobs
            .get(&id)
            .map(|job| job.status(id))
            .ok_or_else(|| Error::not_found(ResourceKind::LockJob, id))
    }

    /// The Pending or Locked job on a collection
    pub async fn job_for_collection(&self, database: &str, collection: &str) -> Result<ResourceId> {
        let key = (database.to_string(), collection.to_string());
        let mut table = self.table.lock().await;
        if let Some(id) = table.active.get(&key).copied() {
            table.check_expiry(id, Instant::now(), self.tombstone_ttl);
        }
        table.active.get(&key).copied().ok_or_else(|| {
            Error::not_found(ResourceKind::LockJob, format!("{}/{}", database, collection))
        })
    }

    /// Time out expired jobs and forget old tombstones
    pub async fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut table = self.table.lock().await;

        let mut timed_out = 0;
        for id in table.expiry.pop_due(now) {
            let due = table
                .jobs
                .get(&id)
                .map_or(false, |job| job.state.is_active() && job.expires_at <= now);
            if due {
                table.finish(id, LockState::TimedOut, self.tombstone_ttl);
                timed_out += 1;
            }
        }

        for id in table.tombstones.pop_due(now) {
            if table.jobs.get(&id).map_or(false, |job| !job.state.is_active()) {
                table.jobs.remove(&id);
            }
        }

        timed_out
    }

    /// Number of Pending or Locked jobs
    pub async fn active_count(&self) -> usize {
        self.table.lock().await.active.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WalConfig;
    use crate::storage::{CollectionDescription, SYSTEM_DATABASE};
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

    async fn setup(dir: &std::path::Path) -> (Arc<StorageEngine>, LockCoordinator) {
        let engine = Arc::new(StorageEngine::open(dir.join("wal"), test_config()).unwrap());
        engine
            .create_collection(SYSTEM_DATABASE, CollectionDescription::new("orders"))
            .await
            .unwrap();
        let coordinator = LockCoordinator::new(
            Arc::clone(&engine),
            Arc::new(IdGenerator::new(1)),
            Duration::from_secs(300),
        );
        (engine, coordinator)
    }

    async fn wait_for_lock(coordinator: &LockCoordinator, id: ResourceId) -> Tick {
        for _ in 0..1000 {
            match coordinator.poll(id).await.unwrap().state {
                LockState::Locked { handover_tick } => return handover_tick,
                LockState::Pending => tokio::task::yield_now().await,
                other => panic!("unexpected state {:?}", other),
            }
        }
        panic!("lock job {} never acquired", id);
    }

    #[tokio::test]
    async fn test_lock_blocks_writes_until_cancel() {
        let dir = tempdir().unwrap();
        let (engine, coordinator) = setup(dir.path()).await;
        engine.insert(SYSTEM_DATABASE, "orders", "a", json!({})).await.unwrap();

        let job = coordinator.request(SYSTEM_DATABASE, "orders", Duration::from_secs(60)).await.unwrap();
        let handover = wait_for_lock(&coordinator, job.id).await;
        assert_eq!(handover, 2);

        let writer = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.insert(SYSTEM_DATABASE, "orders", "b", json!({})).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!writer.is_finished());
        assert_eq!(engine.last_tick(), handover);

        let status = coordinator.cancel(job.id).await.unwrap();
        assert_eq!(status.state, LockState::Canceled);
        assert_eq!(writer.await.unwrap().unwrap(), handover + 1);
    }

    #[tokio::test]
    async fn test_conflicting_request() {
        let dir = tempdir().unwrap();
        let (_engine, coordinator) = setup(dir.path()).await;

        let job = coordinator.request(SYSTEM_DATABASE, "orders", Duration::from_secs(60)).await.unwrap();
        // Conflicts while pending
        let err = coordinator
            .request(SYSTEM_DATABASE, "orders", Duration::from_secs(60))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::LockConflict { .. }));
        assert_eq!(err.identifier(), Some(job.id.to_string()));

        // ...and while locked
        wait_for_lock(&coordinator, job.id).await;
        assert!(matches!(
            coordinator.request(SYSTEM_DATABASE, "orders", Duration::from_secs(60)).await,
            Err(Error::LockConflict { .. })
        ));

        assert_eq!(
            coordinator.job_for_collection(SYSTEM_DATABASE, "orders").await.unwrap(),
            job.id
        );
    }

    #[tokio::test]
    async fn test_cancel_pending_releases_immediately() {
        let dir = tempdir().unwrap();
        let (engine, coordinator) = setup(dir.path()).await;

        // An in-flight writer keeps the job pending
        let section = engine.write_section(SYSTEM_DATABASE, "orders");
        let in_flight = Arc::clone(&section).read_owned().await;

        let job = coordinator.request(SYSTEM_DATABASE, "orders", Duration::from_secs(60)).await.unwrap();
        tokio::task::yield_now().await;
        assert_eq!(coordinator.poll(job.id).await.unwrap().state, LockState::Pending);

        let status = coordinator.cancel(job.id).await.unwrap();
        assert_eq!(status.state, LockState::Canceled);
        drop(in_flight);

        // A fresh request is accepted right away and acquires the section
        let next = coordinator.request(SYSTEM_DATABASE, "orders", Duration::from_secs(60)).await.unwrap();
        wait_for_lock(&coordinator, next.id).await;
        coordinator.cancel(next.id).await.unwrap();

        // Nothing is left holding the section
        assert!(section.try_write().is_ok());
        assert!(coordinator.job_for_collection(SYSTEM_DATABASE, "orders").await.is_err());
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let dir = tempdir().unwrap();
        let (_engine, coordinator) = setup(dir.path()).await;

        let job = coordinator.request(SYSTEM_DATABASE, "orders", Duration::from_secs(60)).await.unwrap();
        coordinator.cancel(job.id).await.unwrap();
        assert_eq!(coordinator.cancel(job.id).await.unwrap().state, LockState::Canceled);
        assert!(matches!(
            coordinator.cancel(ResourceId(42)).await,
            Err(Error::NotFound { kind: ResourceKind::LockJob, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unpolled_lock_times_out() {
        let dir = tempdir().unwrap();
        let (engine, coordinator) = setup(dir.path()).await;

        let job = coordinator.request(SYSTEM_DATABASE, "orders", Duration::from_secs(5)).await.unwrap();
        wait_for_lock(&coordinator, job.id).await;

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(coordinator.poll(job.id).await.unwrap().state, LockState::TimedOut);

        // The section is free again and a fresh request succeeds
        assert!(engine.write_section(SYSTEM_DATABASE, "orders").try_write().is_ok());
        let next = coordinator.request(SYSTEM_DATABASE, "orders", Duration::from_secs(5)).await.unwrap();
        assert_eq!(next.state, LockState::Pending);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_times_out_and_purges() {
        let dir = tempdir().unwrap();
        let (_engine, coordinator) = setup(dir.path()).await;

        let job = coordinator.request(SYSTEM_DATABASE, "orders", Duration::from_secs(5)).await.unwrap();
        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(coordinator.sweep().await, 1);
        assert_eq!(coordinator.active_count().await, 0);
        assert_eq!(coordinator.poll(job.id).await.unwrap().state, LockState::TimedOut);

        tokio::time::advance(Duration::from_secs(301)).await;
        coordinator.sweep().await;
        assert!(matches!(coordinator.poll(job.id).await, Err(Error::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_unknown_collection() {
        let dir = tempdir().unwrap();
        let (_engine, coordinator) = setup(dir.path()).await;

        assert!(matches!(
            coordinator.request(SYSTEM_DATABASE, "missing", Duration::from_secs(5)).await,
            Err(Error::NotFound { kind: ResourceKind::Collection, .. })
        ));
    }

    #[test]
    fn test_status_wire_format() {
        let status = LockStatus {
            id: ResourceId(7),
            database: "_system".into(),
            collection: "orders".into(),
            state: LockState::Locked { handover_tick: 12 },
            ttl_secs: 60,
        };
        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value["state"], "locked");
        assert_eq!(value["handover_tick"], 12);
        assert_eq!(value["id"], "7");
    }
}
