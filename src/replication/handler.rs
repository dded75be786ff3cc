//! Protocol Dispatcher
//!
//! Decodes replication operations, checks them against the server's role
//! and routes them to the registries and the log cursor. Every failure is
//! reported together with the name of the operation that produced it.

use std::collections::BTreeSet;
use std::ops::Bound;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::batch::{BatchInfo, BatchRegistry};
use super::clients::{ClientProgress, ClientTracker};
use super::cursor::{FollowResponse, LogCursor, LogFilter, OpenTransactions};
use super::followers::FollowerSets;
use super::keys::{ChunkContents, KeyChunk, KeySessions, SessionInfo};
use super::lock::{LockCoordinator, LockStatus};
use crate::cluster::{self, ClusterInventory, ServerIdentity, ServerRole, ShardForwarder};
use crate::config::ReplicationConfig;
use crate::error::{Error, ErrorCode, Result};
use crate::id::{IdGenerator, ResourceId};
use crate::storage::{
    CollectionDescription, IndexDescription, Inventory, RestoreOutcome, Snapshot, StorageEngine,
    ViewDescription, WriteOp,
};
use crate::wal::{Document, Tick};

/// Documents per dump response unless the client asks otherwise
const DEFAULT_DUMP_LIMIT: usize = 1000;

/// A replication request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "kebab-case")]
pub enum Operation {
    GetState {
        #[serde(default)]
        database: Option<String>,
    },

    ServerId,

    FollowLog {
        #[serde(default)]
        from: Tick,
        #[serde(default)]
        to: Option<Tick>,
        #[serde(default)]
        chunk_bytes: Option<usize>,
        #[serde(default)]
        database: Option<String>,
        #[serde(default)]
        collection: Option<String>,
        #[serde(default)]
        include_system: bool,
        #[serde(default)]
        client_id: Option<String>,
    },

    OpenTransactions {
        #[serde(default)]
        from: Tick,
        #[serde(default)]
        to: Option<Tick>,
    },

    OpenBatch {
        database: String,
        #[serde(default)]
        ttl: Option<u64>,
    },

    ExtendBatch {
        id: ResourceId,
        #[serde(default)]
        ttl: Option<u64>,
        #[serde(default)]
        tick: Option<Tick>,
    },

    CloseBatch {
        id: ResourceId,
    },

    Inventory {
        database: String,
        #[serde(default)]
        batch_id: Option<ResourceId>,
        #[serde(default)]
        include_system: bool,
    },

    ClusterInventory {
        database: String,
        #[serde(default)]
        include_system: bool,
    },

    RestoreCollection {
        database: String,
        collection: CollectionDescription,
        #[serde(default)]
        overwrite: bool,
    },

    RestoreIndexes {
        database: String,
        collection: String,
        indexes: Vec<IndexDescription>,
    },

    RestoreData {
        database: String,
        collection: String,
        documents: Vec<WriteOp>,
    },

    RestoreView {
        database: String,
        view: ViewDescription,
        #[serde(default)]
        overwrite: bool,
    },

    CreateKeys {
        database: String,
        collection: String,
        #[serde(default)]
        chunk_size: Option<usize>,
        #[serde(default)]
        batch_id: Option<ResourceId>,
        #[serde(default)]
        ttl: Option<u64>,
    },

    ListKeys {
        id: ResourceId,
    },

    FetchKeys {
        id: ResourceId,
        chunk: usize,
        #[serde(default)]
        offset: usize,
        #[serde(default)]
        count: Option<usize>,
        #[serde(default)]
        documents: bool,
    },

    RemoveKeys {
        id: ResourceId,
    },

    Dump {
        database: String,
        collection: String,
        #[serde(default)]
        batch_id: Option<ResourceId>,
        /// Only documents whose revision is above this tick
        #[serde(default)]
        from: Option<Tick>,
        #[serde(default)]
        after_key: Option<String>,
        #[serde(default)]
        limit: Option<usize>,
    },

    RequestLock {
        database: String,
        collection: String,
        #[serde(default)]
        ttl: Option<u64>,
    },

    PollLock {
        id: ResourceId,
    },

    CancelLock {
        id: ResourceId,
    },

    LockIdForCollection {
        database: String,
        collection: String,
    },

    AddFollower {
        shard: String,
        follower: String,
    },

    RemoveFollower {
        shard: String,
        follower: String,
    },

    ListFollowers {
        shard: String,
    },

    Forward {
        server: String,
        request: Box<Operation>,
    },
}

/// Where an operation may run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    /// Any server
    Any,
    /// Needs a local log and collections
    Local,
    /// Needs the cluster view of a coordinator
    Coordinator,
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::GetState { .. } => "get-state",
            Operation::ServerId => "server-id",
            Operation::FollowLog { .. } => "follow-log",
            Operation::OpenTransactions { .. } => "open-transactions",
            Operation::OpenBatch { .. } => "open-batch",
            Operation::ExtendBatch { .. } => "extend-batch",
            Operation::CloseBatch { .. } => "close-batch",
            Operation::Inventory { .. } => "inventory",
            Operation::ClusterInventory { .. } => "cluster-inventory",
            Operation::RestoreCollection { .. } => "restore-collection",
            Operation::RestoreIndexes { .. } => "restore-indexes",
            Operation::RestoreData { .. } => "restore-data",
            Operation::RestoreView { .. } => "restore-view",
            Operation::CreateKeys { .. } => "create-keys",
            Operation::ListKeys { .. } => "list-keys",
            Operation::FetchKeys { .. } => "fetch-keys",
            Operation::RemoveKeys { .. } => "remove-keys",
            Operation::Dump { .. } => "dump",
            Operation::RequestLock { .. } => "request-lock",
            Operation::PollLock { .. } => "poll-lock",
            Operation::CancelLock { .. } => "cancel-lock",
            Operation::LockIdForCollection { .. } => "lock-id-for-collection",
            Operation::AddFollower { .. } => "add-follower",
            Operation::RemoveFollower { .. } => "remove-follower",
            Operation::ListFollowers { .. } => "list-followers",
            Operation::Forward { .. } => "forward",
        }
    }

    fn scope(&self) -> Scope {
        match self {
            Operation::ServerId => Scope::Any,
            Operation::ClusterInventory { .. } | Operation::Forward { .. } => Scope::Coordinator,
            _ => Scope::Local,
        }
    }

    /// Operations that read or change data; releasing resources stays
    /// possible while the engine shuts down
    fn needs_serving_engine(&self) -> bool {
        matches!(
            self,
            Operation::FollowLog { .. }
                | Operation::OpenTransactions { .. }
                | Operation::Inventory { .. }
                | Operation::RestoreCollection { .. }
                | Operation::RestoreIndexes { .. }
                | Operation::RestoreData { .. }
                | Operation::RestoreView { .. }
                | Operation::Dump { .. }
        )
    }
}

/// Server state reported by `get-state`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateResponse {
    pub server: ServerIdentity,
    pub running: bool,
    pub tick: Tick,
    /// Log entries at or below this tick have been reclaimed
    pub pruned_through: Tick,
    pub clients: Vec<ClientProgress>,
    pub batches: usize,
    pub lock_jobs: usize,
    pub key_sessions: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexRestore {
    pub id: String,
    pub outcome: RestoreOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DumpResponse {
    pub tick: Tick,
    pub documents: Vec<Document>,
    /// Pass as `after_key` to continue
    pub last_key: Option<String>,
    pub has_more: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FollowerSet {
    pub shard: String,
    pub followers: BTreeSet<String>,
}

/// Reply to an [`Operation`]; serialized without a wrapper
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Response {
    State(StateResponse),
    Server(ServerIdentity),
    Log(FollowResponse),
    OpenTransactions(OpenTransactions),
    Batch(BatchInfo),
    Inventory(Inventory),
    ClusterInventory(ClusterInventory),
    Restored { outcome: RestoreOutcome },
    Indexes { indexes: Vec<IndexRestore> },
    Data { tick: Tick, count: usize },
    KeySession(SessionInfo),
    Chunks { id: ResourceId, chunks: Vec<KeyChunk> },
    ChunkContents(ChunkContents),
    Dump(DumpResponse),
    Lock(LockStatus),
    LockId { id: ResourceId },
    Followers(FollowerSet),
    FollowerChange { shard: String, follower: String, changed: bool },
    Done { ok: bool },
    Forwarded(serde_json::Value),
}

impl Response {
    fn done() -> Self {
        Response::Done { ok: true }
    }
}

/// A failed operation
#[derive(Debug, thiserror::Error)]
#[error("{operation}: {error}")]
pub struct OperationError {
    pub operation: String,
    #[source]
    pub error: Error,
}

impl OperationError {
    pub fn new(operation: impl Into<String>, error: Error) -> Self {
        Self {
            operation: operation.into(),
            error,
        }
    }

    pub fn code(&self) -> ErrorCode {
        self.error.code()
    }

    pub fn body(&self) -> ErrorBody {
        ErrorBody {
            error: true,
            code: self.error.code(),
            operation: self.operation.clone(),
            identifier: self.error.identifier(),
            retryable: self.error.is_retryable(),
            message: self.error.to_string(),
        }
    }
}

/// Wire form of an [`OperationError`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: bool,
    pub code: ErrorCode,
    pub operation: String,
    pub identifier: Option<String>,
    pub retryable: bool,
    pub message: String,
}

/// Routes operations to the replication components of one server
pub struct ReplicationHandler {
    identity: ServerIdentity,
    config: ReplicationConfig,
    engine: Arc<StorageEngine>,
    cursor: LogCursor,
    batches: Arc<BatchRegistry>,
    locks: Arc<LockCoordinator>,
    keys: Arc<KeySessions>,
    followers: Arc<FollowerSets>,
    clients: Arc<ClientTracker>,
    forwarder: Option<Arc<dyn ShardForwarder>>,
}

impl ReplicationHandler {
    pub fn new(
        identity: ServerIdentity,
        config: ReplicationConfig,
        engine: Arc<StorageEngine>,
        clients: Arc<ClientTracker>,
        forwarder: Option<Arc<dyn ShardForwarder>>,
    ) -> Self {
        let ids = Arc::new(IdGenerator::for_server(&identity.id));
        Self {
            cursor: LogCursor::new(Arc::clone(&engine)),
            batches: Arc::new(BatchRegistry::new(Arc::clone(&engine), Arc::clone(&ids))),
            locks: Arc::new(LockCoordinator::new(
                Arc::clone(&engine),
                Arc::clone(&ids),
                config.lock_tombstone(),
            )),
            keys: Arc::new(KeySessions::new(
                Arc::clone(&engine),
                ids,
                config.chunk_hash,
                config.max_keys_chunk_size,
            )),
            followers: Arc::new(FollowerSets::new()),
            identity,
            config,
            engine,
            clients,
            forwarder,
        }
    }

    pub fn identity(&self) -> &ServerIdentity {
        &self.identity
    }

    pub fn engine(&self) -> &Arc<StorageEngine> {
        &self.engine
    }

    pub fn batches(&self) -> &Arc<BatchRegistry> {
        &self.batches
    }

    pub fn locks(&self) -> &Arc<LockCoordinator> {
        &self.locks
    }

    pub fn keys(&self) -> &Arc<KeySessions> {
        &self.keys
    }

    pub fn followers(&self) -> &Arc<FollowerSets> {
        &self.followers
    }

    pub fn clients(&self) -> &Arc<ClientTracker> {
        &self.clients
    }

    /// Lowest tick any batch or key session still needs
    pub fn pinned_floor(&self) -> Option<Tick> {
        match (self.batches.min_tick(), self.keys.min_tick()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Run one operation
    pub async fn handle(&self, operation: Operation) -> std::result::Result<Response, OperationError> {
        let name = operation.name();
        tracing::debug!("Replication operation {}", name);

        let result = match self.check_role(&operation) {
            Ok(()) => self.dispatch(operation).await,
            Err(e) => Err(e),
        };

        result.map_err(|error| {
            match error.code() {
                ErrorCode::Internal => tracing::error!("{} failed: {}", name, error),
                _ => tracing::debug!("{} rejected: {}", name, error),
            }
            OperationError::new(name, error)
        })
    }

    fn check_role(&self, operation: &Operation) -> Result<()> {
        let role = self.identity.role;
        let allowed = match operation.scope() {
            Scope::Any => true,
            Scope::Local => role.has_local_data(),
            Scope::Coordinator => role == ServerRole::Coordinator,
        };
        if !allowed {
            return Err(Error::WrongServerRole {
                operation: operation.name().to_string(),
                role,
            });
        }
        if operation.needs_serving_engine() {
            self.engine.ensure_serving()?;
        }
        Ok(())
    }

    fn ttl(&self, requested: Option<u64>, default_secs: u64) -> Duration {
        self.config.ttl(requested, default_secs)
    }

    /// The batch's snapshot, or a fresh one
    async fn snapshot_for(&self, batch_id: Option<ResourceId>) -> Result<Arc<Snapshot>> {
        match batch_id {
            Some(id) => self.batches.snapshot(id).await,
            None => Ok(Arc::new(self.engine.snapshot().await)),
        }
    }

    async fn dispatch(&self, operation: Operation) -> Result<Response> {
        match operation {
            Operation::GetState { database } => self.get_state(database).await.map(Response::State),

            Operation::ServerId => Ok(Response::Server(self.identity.clone())),

            Operation::FollowLog {
                from,
                to,
                chunk_bytes,
                database,
                collection,
                include_system,
                client_id,
            } => {
                let filter = LogFilter {
                    database,
                    collection,
                    include_system,
                };
                let budget = chunk_bytes
                    .filter(|b| *b > 0)
                    .unwrap_or(self.config.follow_chunk_bytes);
                let cursor = self.cursor.clone();
                let response =
                    blocking(move || cursor.follow(from, to, &filter, budget)).await?;

                if let Some(client_id) = client_id {
                    self.clients.record(&client_id, response.last_scanned_tick).await;
                }
                Ok(Response::Log(response))
            }

            Operation::OpenTransactions { from, to } => {
                let cursor = self.cursor.clone();
                let open = blocking(move || cursor.open_transactions(from, to)).await?;
                Ok(Response::OpenTransactions(open))
            }

            Operation::OpenBatch { database, ttl } => {
                let ttl = self.ttl(ttl, self.config.batch_ttl_secs);
                self.batches.open(&database, ttl).await.map(Response::Batch)
            }

            Operation::ExtendBatch { id, ttl, tick } => {
                let ttl = self.ttl(ttl, self.config.batch_ttl_secs);
                self.batches.extend(id, ttl, tick).await.map(Response::Batch)
            }

            Operation::CloseBatch { id } => {
                self.batches.close(id).await?;
                Ok(Response::done())
            }

            Operation::Inventory {
                database,
                batch_id,
                include_system,
            } => {
                let snapshot = self.snapshot_for(batch_id).await?;
                snapshot
                    .inventory(&database, include_system)
                    .map(Response::Inventory)
            }

            Operation::ClusterInventory {
                database,
                include_system,
            } => {
                let forwarder = self.forwarder()?;
                cluster::cluster_inventory(forwarder.as_ref(), &database, include_system)
                    .await
                    .map(Response::ClusterInventory)
            }

            Operation::RestoreCollection {
                database,
                collection,
                overwrite,
            } => {
                let outcome = self
                    .engine
                    .restore_collection(&database, collection, overwrite)
                    .await?;
                Ok(Response::Restored { outcome })
            }

            Operation::RestoreIndexes {
                database,
                collection,
                indexes,
            } => {
                let indexes = self
                    .engine
                    .restore_indexes(&database, &collection, indexes)
                    .await?
                    .into_iter()
                    .map(|(id, outcome)| IndexRestore { id, outcome })
                    .collect();
                Ok(Response::Indexes { indexes })
            }

            Operation::RestoreData {
                database,
                collection,
                documents,
            } => {
                let count = documents.len();
                let tick = self.engine.write(&database, &collection, documents).await?;
                Ok(Response::Data { tick, count })
            }

            Operation::RestoreView {
                database,
                view,
                overwrite,
            } => {
                let outcome = self.engine.restore_view(&database, view, overwrite).await?;
                Ok(Response::Restored { outcome })
            }

            Operation::CreateKeys {
                database,
                collection,
                chunk_size,
                batch_id,
                ttl,
            } => {
                let snapshot = match batch_id {
                    Some(id) => Some(self.batches.snapshot(id).await?),
                    None => None,
                };
                let chunk_size = chunk_size.unwrap_or(self.config.keys_chunk_size);
                let ttl = self.ttl(ttl, self.config.keys_ttl_secs);
                self.keys
                    .create(&database, &collection, chunk_size, ttl, snapshot)
                    .await
                    .map(Response::KeySession)
            }

            Operation::ListKeys { id } => {
                let chunks = self.keys.list_chunks(id).await?;
                Ok(Response::Chunks { id, chunks })
            }

            Operation::FetchKeys {
                id,
                chunk,
                offset,
                count,
                documents,
            } => self
                .keys
                .fetch_chunk(id, chunk, offset, count, documents)
                .await
                .map(Response::ChunkContents),

            Operation::RemoveKeys { id } => {
                self.keys.remove(id).await?;
                Ok(Response::done())
            }

            Operation::Dump {
                database,
                collection,
                batch_id,
                from,
                after_key,
                limit,
            } => {
                let snapshot = self.snapshot_for(batch_id).await?;
                let limit = limit
                    .unwrap_or(DEFAULT_DUMP_LIMIT)
                    .min(self.config.max_dump_limit);
                dump(&snapshot, &database, &collection, from, after_key, limit).map(Response::Dump)
            }

            Operation::RequestLock {
                database,
                collection,
                ttl,
            } => {
                let ttl = self.ttl(ttl, self.config.lock_ttl_secs);
                self.locks
                    .request(&database, &collection, ttl)
                    .await
                    .map(Response::Lock)
            }

            Operation::PollLock { id } => self.locks.poll(id).await.map(Response::Lock),

            Operation::CancelLock { id } => self.locks.cancel(id).await.map(Response::Lock),

            Operation::LockIdForCollection {
                database,
                collection,
            } => {
                let id = self.locks.job_for_collection(&database, &collection).await?;
                Ok(Response::LockId { id })
            }

            Operation::AddFollower { shard, follower } => {
                let changed = self.followers.add(&shard, &follower).await?;
                Ok(Response::FollowerChange {
                    shard,
                    follower,
                    changed,
                })
            }

            Operation::RemoveFollower { shard, follower } => {
                let changed = self.followers.remove(&shard, &follower).await?;
                Ok(Response::FollowerChange {
                    shard,
                    follower,
                    changed,
                })
            }

            Operation::ListFollowers { shard } => {
                let followers = self.followers.list(&shard).await;
                Ok(Response::Followers(FollowerSet { shard, followers }))
            }

            Operation::Forward { server, request } => {
                if matches!(*request, Operation::Forward { .. }) {
                    return Err(Error::malformed("forwarded requests cannot be forwarded again"));
                }
                let forwarder = self.forwarder()?;
                forwarder
                    .forward(&server, &request)
                    .await
                    .map(Response::Forwarded)
            }
        }
    }

    fn forwarder(&self) -> Result<&Arc<dyn ShardForwarder>> {
        self.forwarder
            .as_ref()
            .ok_or_else(|| Error::Config("no DB servers configured for forwarding".into()))
    }

    async fn get_state(&self, database: Option<String>) -> Result<StateResponse> {
        if let Some(database) = database {
            self.engine.snapshot().await.database(&database)?;
        }

        Ok(StateResponse {
            server: self.identity.clone(),
            running: self.engine.ensure_serving().is_ok(),
            tick: self.engine.last_tick(),
            pruned_through: self.engine.reader().pruned_through(),
            clients: self.clients.list().await,
            batches: self.batches.len().await,
            lock_jobs: self.locks.active_count().await,
            key_sessions: self.keys.len().await,
        })
    }
}

/// Run a log read off the async workers
async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Internal(format!("log reader task failed: {}", e)))?
}

/// One page of a collection's documents at the snapshot tick
fn dump(
    snapshot: &Snapshot,
    database: &str,
    collection: &str,
    from: Option<Tick>,
    after_key: Option<String>,
    limit: usize,
) -> Result<DumpResponse> {
    if limit == 0 {
        return Err(Error::malformed("dump limit must be positive"));
    }

    let documents = &snapshot.collection(database, collection)?.documents;
    let range = match after_key {
        Some(key) => documents.range((Bound::Excluded(key), Bound::Unbounded)),
        None => documents.range::<String, _>(..),
    };
    let min_rev = from.unwrap_or(0);
    let mut page: Vec<Document> = range
        .map(|(_, doc)| doc)
        .filter(|doc| doc.rev > min_rev)
        .take(limit.saturating_add(1))
        .cloned()
        .collect();

    let has_more = page.len() > limit;
    page.truncate(limit);

    Ok(DumpResponse {
        tick: snapshot.tick,
        last_key: page.last().map(|d| d.key.clone()),
        documents: page,
        has_more,
    })
}
