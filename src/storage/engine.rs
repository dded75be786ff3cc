//! Storage engine
//!
//! All mutations run inside one commit section: entries are appended to the
//! WAL with consecutive ticks and then applied to the in-memory state.
//! Document writes additionally hold their collection's write-exclusion
//! section in shared mode for the whole commit.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};

use super::checkpoint::{read_checkpoint, write_checkpoint};
use super::{
    CollectionDescription, CollectionSnapshot, IndexDescription, Snapshot, ViewDescription,
};
use crate::config::WalConfig;
use crate::error::{Error, ResourceKind, Result};
use crate::wal::{
    Document, LogOperation, RawJson, Revision, Tick, TransactionId, WalEntry, WalPaths,
    WalReader, WalWriter,
};

/// A document mutation inside a write
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum WriteOp {
    /// Insert or replace; `rev` keeps a revision assigned elsewhere
    Upsert {
        key: String,
        data: RawJson,
        #[serde(default)]
        rev: Option<Revision>,
    },
    Remove {
        key: String,
    },
}

impl WriteOp {
    fn key(&self) -> &str {
        match self {
            WriteOp::Upsert { key, .. } | WriteOp::Remove { key } => key,
        }
    }
}

/// Result of an idempotent restore step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestoreOutcome {
    Created,
    Replaced,
    Unchanged,
}

/// Allocates consecutive ticks for the entries of one commit
struct EntryBuilder {
    database: String,
    next_tick: Tick,
    entries: Vec<WalEntry>,
}

impl EntryBuilder {
    fn push(&mut self, operation: LogOperation) -> Tick {
        let tick = self.next_tick;
        self.next_tick += 1;
        self.entries
            .push(WalEntry::new(tick, self.database.clone(), operation));
        tick
    }

    fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

struct Inner {
    writer: WalWriter,
    state: Snapshot,
}

impl Inner {
    fn builder(&self, database: &str) -> EntryBuilder {
        EntryBuilder {
            database: database.to_string(),
            next_tick: self.state.tick.max(self.writer.last_tick()) + 1,
            entries: Vec::new(),
        }
    }

    /// Log then apply; returns the last tick written
    fn commit(&mut self, builder: EntryBuilder) -> Result<Tick> {
        for entry in &builder.entries {
            self.writer.append(entry)?;
        }
        for entry in &builder.entries {
            apply(&mut self.state, entry)?;
            self.state.tick = entry.tick;
        }
        Ok(self.state.tick)
    }
}

/// The document store
pub struct StorageEngine {
    inner: Mutex<Inner>,
    reader: WalReader,
    paths: WalPaths,
    retention: Duration,
    last_tick: AtomicU64,
    checkpoint_tick: AtomicU64,
    sections: std::sync::Mutex<HashMap<(String, String), Arc<RwLock<()>>>>,
    shutting_down: AtomicBool,
}

impl StorageEngine {
    /// Open the store in `wal_dir`: load the checkpoint, then replay the log
    pub fn open(wal_dir: PathBuf, config: WalConfig) -> Result<Self> {
        let paths = WalPaths::new(wal_dir.clone());
        paths.ensure_dirs()?;

        let mut state = read_checkpoint(&paths.checkpoint_path())?.unwrap_or_default();
        let checkpoint_tick = state.tick;

        let mut writer = WalWriter::open(wal_dir, config.clone())?;
        writer.raise_horizon(checkpoint_tick);
        let reader = WalReader::new(writer.index());

        if let Some(first) = reader.first_tick() {
            if first > checkpoint_tick + 1 {
                return Err(Error::State(format!(
                    "WAL starts at tick {} but the checkpoint only covers through tick {}",
                    first, checkpoint_tick
                )));
            }
        }

        let replayed = replay(&reader, &mut state, checkpoint_tick)?;
        state.tick = state.tick.max(writer.last_tick());

        tracing::info!(
            "Storage opened at tick {} (checkpoint {}, {} entries replayed)",
            state.tick,
            checkpoint_tick,
            replayed
        );

        Ok(Self {
            last_tick: AtomicU64::new(state.tick),
            checkpoint_tick: AtomicU64::new(checkpoint_tick),
            inner: Mutex::new(Inner { writer, state }),
            reader,
            paths,
            retention: Duration::from_secs(config.retention_secs),
            sections: std::sync::Mutex::new(HashMap::new()),
            shutting_down: AtomicBool::new(false),
        })
    }

    /// Tick of the last committed operation
    pub fn last_tick(&self) -> Tick {
        self.last_tick.load(Ordering::Acquire)
    }

    /// Reader over the committed log
    pub fn reader(&self) -> &WalReader {
        &self.reader
    }

    /// Fail with `NotReplicationCapable` once shutdown has begun
    pub fn ensure_serving(&self) -> Result<()> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(Error::NotReplicationCapable(
                "storage engine is shutting down".into(),
            ));
        }
        Ok(())
    }

    pub fn begin_shutdown(&self) {
        if !self.shutting_down.swap(true, Ordering::AcqRel) {
            tracing::info!("Storage engine entering shutdown");
        }
    }

    /// Write-exclusion section of a collection
    pub fn write_section(&self, database: &str, collection: &str) -> Arc<RwLock<()>> {
        let mut sections = self.sections.lock().unwrap_or_else(PoisonError::into_inner);
        sections
            .entry((database.to_string(), collection.to_string()))
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    /// Repeatable-read view of the current state
    pub async fn snapshot(&self) -> Snapshot {
        self.inner.lock().await.state.clone()
    }

    pub async fn has_collection(&self, database: &str, collection: &str) -> bool {
        let inner = self.inner.lock().await;
        inner.state.collection(database, collection).is_ok()
    }

    /// Create a collection; fails if it already exists
    pub async fn create_collection(
        &self,
        database: &str,
        description: CollectionDescription,
    ) -> Result<Tick> {
        description.validate()?;
        let mut inner = self.inner.lock().await;
        if collection_exists(&inner.state, database, &description.name) {
            return Err(Error::AlreadyExists {
                kind: ResourceKind::Collection,
                id: description.name,
            });
        }

        let mut builder = inner.builder(database);
        builder.push(LogOperation::CreateCollection {
            collection: description,
        });
        self.finish(&mut inner, builder)
    }

    pub async fn drop_collection(&self, database: &str, name: &str) -> Result<Tick> {
        let section = self.write_section(database, name);
        let _guard = section.read().await;

        let mut inner = self.inner.lock().await;
        inner.state.collection(database, name)?;

        let mut builder = inner.builder(database);
        builder.push(LogOperation::DropCollection {
            collection: name.to_string(),
        });
        self.finish(&mut inner, builder)
    }

    /// Create or verify a collection. An identical description is left alone;
    /// a different one is replaced only with `overwrite`.
    pub async fn restore_collection(
        &self,
        database: &str,
        description: CollectionDescription,
        overwrite: bool,
    ) -> Result<RestoreOutcome> {
        description.validate()?;
        let section = self.write_section(database, &description.name);
        let _guard = section.read().await;

        let mut inner = self.inner.lock().await;
        let existing = inner
            .state
            .collection(database, &description.name)
            .ok()
            .map(|c| c.description.clone());

        let outcome = match existing {
            Some(current) if current == description => return Ok(RestoreOutcome::Unchanged),
            Some(_) if !overwrite => {
                return Err(Error::AlreadyExists {
                    kind: ResourceKind::Collection,
                    id: description.name,
                })
            }
            Some(_) => RestoreOutcome::Replaced,
            None => RestoreOutcome::Created,
        };

        let mut builder = inner.builder(database);
        if outcome == RestoreOutcome::Replaced {
            builder.push(LogOperation::DropCollection {
                collection: description.name.clone(),
            });
        }
        builder.push(LogOperation::CreateCollection {
            collection: description,
        });
        self.finish(&mut inner, builder)?;
        Ok(outcome)
    }

    /// Create missing indexes; an index whose id exists with a different
    /// definition is dropped and recreated
    pub async fn restore_indexes(
        &self,
        database: &str,
        collection: &str,
        indexes: Vec<IndexDescription>,
    ) -> Result<Vec<(String, RestoreOutcome)>> {
        for index in &indexes {
            index.validate()?;
        }
        let section = self.write_section(database, collection);
        let _guard = section.read().await;

        let mut inner = self.inner.lock().await;
        let current = inner.state.collection(database, collection)?.indexes.clone();

        let mut builder = inner.builder(database);
        let mut outcomes = Vec::with_capacity(indexes.len());
        for index in indexes {
            let outcome = match current.iter().find(|i| i.id == index.id) {
                Some(existing) if *existing == index => RestoreOutcome::Unchanged,
                Some(_) => {
                    builder.push(LogOperation::DropIndex {
                        collection: collection.to_string(),
                        index_id: index.id.clone(),
                    });
                    RestoreOutcome::Replaced
                }
                None => RestoreOutcome::Created,
            };
            if outcome != RestoreOutcome::Unchanged {
                let id = index.id.clone();
                builder.push(LogOperation::CreateIndex {
                    collection: collection.to_string(),
                    index,
                });
                outcomes.push((id, outcome));
            } else {
                outcomes.push((index.id, outcome));
            }
        }

        if !builder.is_empty() {
            self.finish(&mut inner, builder)?;
        }
        Ok(outcomes)
    }

    pub async fn drop_index(&self, database: &str, collection: &str, index_id: &str) -> Result<Tick> {
        let mut inner = self.inner.lock().await;
        let coll = inner.state.collection(database, collection)?;
        if !coll.indexes.iter().any(|i| i.id == index_id) {
            return Err(Error::not_found(ResourceKind::Index, index_id));
        }

        let mut builder = inner.builder(database);
        builder.push(LogOperation::DropIndex {
            collection: collection.to_string(),
            index_id: index_id.to_string(),
        });
        self.finish(&mut inner, builder)
    }

    /// Create or verify a view, with the same rules as collections
    pub async fn restore_view(
        &self,
        database: &str,
        view: ViewDescription,
        overwrite: bool,
    ) -> Result<RestoreOutcome> {
        view.validate()?;
        let mut inner = self.inner.lock().await;
        let existing = inner
            .state
            .databases
            .get(database)
            .and_then(|db| db.views.get(&view.name))
            .cloned();

        let outcome = match existing {
            Some(current) if current == view => return Ok(RestoreOutcome::Unchanged),
            Some(_) if !overwrite => {
                return Err(Error::AlreadyExists {
                    kind: ResourceKind::View,
                    id: view.name,
                })
            }
            Some(_) => RestoreOutcome::Replaced,
            None => RestoreOutcome::Created,
        };

        let mut builder = inner.builder(database);
        if outcome == RestoreOutcome::Replaced {
            builder.push(LogOperation::DropView {
                view: view.name.clone(),
            });
        }
        builder.push(LogOperation::CreateView { view });
        self.finish(&mut inner, builder)?;
        Ok(outcome)
    }

    /// Apply document mutations to one collection. Several operations are
    /// logged as a single transaction. Removing an absent key is a no-op.
    pub async fn write(&self, database: &str, collection: &str, ops: Vec<WriteOp>) -> Result<Tick> {
        if let Some(op) = ops.iter().find(|op| op.key().is_empty()) {
            return Err(Error::malformed(format!("document key missing in {:?}", op)));
        }

        let section = self.write_section(database, collection);
        let _guard = section.read().await;

        let mut inner = self.inner.lock().await;
        let documents = Arc::clone(&inner.state.collection(database, collection)?.documents);

        // Removals of absent keys never reach the log
        let mut present: HashMap<&str, bool> = HashMap::new();
        let mut effective = Vec::with_capacity(ops.len());
        for op in &ops {
            let exists = *present
                .get(op.key())
                .unwrap_or(&documents.contains_key(op.key()));
            match op {
                WriteOp::Upsert { .. } => {
                    present.insert(op.key(), true);
                    effective.push(op);
                }
                WriteOp::Remove { .. } if exists => {
                    present.insert(op.key(), false);
                    effective.push(op);
                }
                WriteOp::Remove { .. } => {}
            }
        }

        if effective.is_empty() {
            return Ok(inner.state.tick);
        }

        let mut builder = inner.builder(database);
        let tid: Option<TransactionId> = if effective.len() > 1 {
            let begin = builder.next_tick;
            builder.push(LogOperation::BeginTransaction { tid: begin });
            Some(begin)
        } else {
            None
        };

        for op in effective {
            let tick = builder.next_tick;
            let operation = match op {
                WriteOp::Upsert { key, data, rev } => LogOperation::DocumentUpsert {
                    collection: collection.to_string(),
                    tid,
                    document: Document {
                        key: key.clone(),
                        rev: rev.unwrap_or(tick),
                        data: data.clone(),
                    },
                },
                WriteOp::Remove { key } => LogOperation::DocumentRemove {
                    collection: collection.to_string(),
                    tid,
                    key: key.clone(),
                    rev: tick,
                },
            };
            builder.push(operation);
        }

        if let Some(tid) = tid {
            builder.push(LogOperation::CommitTransaction { tid });
        }

        self.finish(&mut inner, builder)
    }

    /// Insert or replace a single document
    pub async fn insert(
        &self,
        database: &str,
        collection: &str,
        key: &str,
        data: serde_json::Value,
    ) -> Result<Tick> {
        self.write(
            database,
            collection,
            vec![WriteOp::Upsert {
                key: key.to_string(),
                data: RawJson::from(data),
                rev: None,
            }],
        )
        .await
    }

    pub async fn remove(&self, database: &str, collection: &str, key: &str) -> Result<Tick> {
        self.write(database, collection, vec![WriteOp::Remove { key: key.to_string() }])
            .await
    }

    /// Checkpoint the store, then reclaim log segments that neither the
    /// checkpoint nor the pinned floor still needs. The floor is read after
    /// the checkpoint so a pin taken concurrently is never overtaken.
    pub async fn collect_garbage<F>(&self, pinned_floor: F) -> Result<usize>
    where
        F: FnOnce() -> Option<Tick>,
    {
        let snapshot = self.snapshot().await;
        let tick = snapshot.tick;

        if tick > self.checkpoint_tick.load(Ordering::Acquire) {
            let path = self.paths.checkpoint_path();
            tokio::task::spawn_blocking(move || write_checkpoint(&path, &snapshot))
                .await
                .map_err(|e| Error::Internal(format!("checkpoint task failed: {}", e)))??;
            self.checkpoint_tick.store(tick, Ordering::Release);
        }

        let checkpoint = self.checkpoint_tick.load(Ordering::Acquire);
        let horizon = pinned_floor().map_or(checkpoint, |floor| floor.min(checkpoint));

        let mut inner = self.inner.lock().await;
        inner.writer.prune(horizon, self.retention)
    }

    fn finish(&self, inner: &mut Inner, builder: EntryBuilder) -> Result<Tick> {
        let tick = inner.commit(builder)?;
        self.last_tick.store(tick, Ordering::Release);
        Ok(tick)
    }
}

fn collection_exists(state: &Snapshot, database: &str, name: &str) -> bool {
    state
        .databases
        .get(database)
        .map_or(false, |db| db.collections.contains_key(name))
}

fn collection_mut<'a>(
    state: &'a mut Snapshot,
    database: &str,
    name: &str,
) -> Result<&'a mut CollectionSnapshot> {
    state
        .databases
        .get_mut(database)
        .and_then(|db| db.collections.get_mut(name))
        .ok_or_else(|| Error::not_found(ResourceKind::Collection, format!("{}/{}", database, name)))
}

/// Apply one logged operation to the state
fn apply(state: &mut Snapshot, entry: &WalEntry) -> Result<()> {
    let database = entry.database.as_str();
    match &entry.operation {
        LogOperation::CreateCollection { collection } => {
            state
                .databases
                .entry(database.to_string())
                .or_default()
                .collections
                .insert(collection.name.clone(), CollectionSnapshot::new(collection.clone()));
        }
        LogOperation::DropCollection { collection } => {
            if let Some(db) = state.databases.get_mut(database) {
                db.collections.remove(collection);
            }
        }
        LogOperation::CreateIndex { collection, index } => {
            let coll = collection_mut(state, database, collection)?;
            coll.indexes.retain(|i| i.id != index.id);
            coll.indexes.push(index.clone());
        }
        LogOperation::DropIndex { collection, index_id } => {
            collection_mut(state, database, collection)?
                .indexes
                .retain(|i| &i.id != index_id);
        }
        LogOperation::CreateView { view } => {
            state
                .databases
                .entry(database.to_string())
                .or_default()
                .views
                .insert(view.name.clone(), view.clone());
        }
        LogOperation::DropView { view } => {
            if let Some(db) = state.databases.get_mut(database) {
                db.views.remove(view);
            }
        }
        LogOperation::BeginTransaction { .. } | LogOperation::CommitTransaction { .. } => {}
        LogOperation::DocumentUpsert {
            collection,
            document,
            ..
        } => {
            let coll = collection_mut(state, database, collection)?;
            Arc::make_mut(&mut coll.documents).insert(document.key.clone(), document.clone());
        }
        LogOperation::DocumentRemove { collection, key, .. } => {
            let coll = collection_mut(state, database, collection)?;
            Arc::make_mut(&mut coll.documents).remove(key);
        }
    }
    Ok(())
}

/// Replay committed log entries after `after`. Operations of a transaction
/// are applied when its commit marker is seen.
fn replay(reader: &WalReader, state: &mut Snapshot, after: Tick) -> Result<usize> {
    let entries = reader.read_range(after + 1, Tick::MAX)?;
    let count = entries.len();
    let mut pending: HashMap<TransactionId, Vec<WalEntry>> = HashMap::new();

    for entry in entries {
        let tick = entry.tick;
        match (&entry.operation, entry.operation.transaction_id()) {
            (LogOperation::BeginTransaction { tid }, _) => {
                pending.insert(*tid, Vec::new());
            }
            (LogOperation::CommitTransaction { tid }, _) => {
                for op in pending.remove(tid).unwrap_or_default() {
                    apply(state, &op)?;
                }
            }
            (_, Some(tid)) => pending.entry(tid).or_default().push(entry),
            (_, None) => apply(state, &entry)?,
        }
        state.tick = tick;
    }

    if !pending.is_empty() {
        tracing::warn!(
            "Discarding {} uncommitted transactions found in the WAL",
            pending.len()
        );
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SYSTEM_DATABASE;
    use serde_json::json;
    use tempfile::tempdir;

    fn test_config() -> WalConfig {
        WalConfig {
            compression: true,
            segment_size_mb: 1,
            retention_secs: 0,
            fsync: false,
        }
    }

    async fn engine_with_orders(dir: &std::path::Path) -> StorageEngine {
        let engine = StorageEngine::open(dir.join("wal"), test_config()).unwrap();
        engine
            .create_collection(SYSTEM_DATABASE, CollectionDescription::new("orders"))
            .await
            .unwrap();
        engine
    }

    fn upsert(key: &str, n: i64) -> WriteOp {
        WriteOp::Upsert {
            key: key.to_string(),
            data: RawJson::from(json!({ "n": n })),
            rev: None,
        }
    }

    #[tokio::test]
    async fn test_writes_advance_ticks_and_revisions() {
        let dir = tempdir().unwrap();
        let engine = engine_with_orders(dir.path()).await;
        assert_eq!(engine.last_tick(), 1);

        let tick = engine.insert(SYSTEM_DATABASE, "orders", "a", json!({"n": 1})).await.unwrap();
        assert_eq!(tick, 2);
        assert_eq!(engine.last_tick(), 2);

        let snapshot = engine.snapshot().await;
        let orders = snapshot.collection(SYSTEM_DATABASE, "orders").unwrap();
        assert_eq!(orders.documents["a"].rev, 2);
    }

    #[tokio::test]
    async fn test_multi_op_write_is_logged_as_transaction() {
        let dir = tempdir().unwrap();
        let engine = engine_with_orders(dir.path()).await;

        let last = engine
            .write(SYSTEM_DATABASE, "orders", vec![upsert("a", 1), upsert("b", 2)])
            .await
            .unwrap();
        assert_eq!(last, 5);

        let entries = engine.reader().read_range(2, last).unwrap();
        assert!(matches!(entries[0].operation, LogOperation::BeginTransaction { tid: 2 }));
        assert_eq!(entries[1].operation.transaction_id(), Some(2));
        assert_eq!(entries[2].operation.transaction_id(), Some(2));
        assert!(matches!(entries[3].operation, LogOperation::CommitTransaction { tid: 2 }));
    }

    #[tokio::test]
    async fn test_remove_of_absent_key_is_not_logged() {
        let dir = tempdir().unwrap();
        let engine = engine_with_orders(dir.path()).await;

        let tick = engine.remove(SYSTEM_DATABASE, "orders", "ghost").await.unwrap();
        assert_eq!(tick, 1);
        assert_eq!(engine.last_tick(), 1);
    }

    #[tokio::test]
    async fn test_snapshot_is_repeatable() {
        let dir = tempdir().unwrap();
        let engine = engine_with_orders(dir.path()).await;
        engine.insert(SYSTEM_DATABASE, "orders", "a", json!({"n": 1})).await.unwrap();

        let before = engine.snapshot().await;
        engine.insert(SYSTEM_DATABASE, "orders", "b", json!({"n": 2})).await.unwrap();
        engine.remove(SYSTEM_DATABASE, "orders", "a").await.unwrap();

        let orders = before.collection(SYSTEM_DATABASE, "orders").unwrap();
        assert_eq!(orders.keys(), vec![("a".to_string(), 2)]);
        assert_eq!(before.tick, 2);
    }

    #[tokio::test]
    async fn test_recovery_replays_log_and_checkpoint() {
        let dir = tempdir().unwrap();
        {
            let engine = engine_with_orders(dir.path()).await;
            engine.insert(SYSTEM_DATABASE, "orders", "a", json!({"n": 1})).await.unwrap();
            engine.collect_garbage(|| None).await.unwrap();
            engine
                .write(SYSTEM_DATABASE, "orders", vec![upsert("b", 2), upsert("c", 3)])
                .await
                .unwrap();
        }

        let engine = StorageEngine::open(dir.path().join("wal"), test_config()).unwrap();
        assert_eq!(engine.last_tick(), 6);
        let snapshot = engine.snapshot().await;
        let keys: Vec<String> = snapshot
            .collection(SYSTEM_DATABASE, "orders")
            .unwrap()
            .keys()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec!["a", "b", "c"]);

        // Ticks continue after the recovered position
        let tick = engine.insert(SYSTEM_DATABASE, "orders", "d", json!({})).await.unwrap();
        assert_eq!(tick, 7);
    }

    #[tokio::test]
    async fn test_gc_respects_pinned_floor() {
        let dir = tempdir().unwrap();
        let engine = engine_with_orders(dir.path()).await;
        for i in 0..10 {
            engine
                .insert(SYSTEM_DATABASE, "orders", &format!("k{}", i), json!({ "i": i }))
                .await
                .unwrap();
        }

        assert_eq!(engine.collect_garbage(|| Some(3)).await.unwrap(), 0);
        assert!(engine.reader().ensure_available(3).is_ok());

        assert_eq!(engine.collect_garbage(|| None).await.unwrap(), 1);
        assert!(matches!(
            engine.reader().ensure_available(3),
            Err(Error::DataUnavailable { requested: 3, oldest: 11 })
        ));
    }

    #[tokio::test]
    async fn test_restore_collection_is_idempotent() {
        let dir = tempdir().unwrap();
        let engine = engine_with_orders(dir.path()).await;
        engine.insert(SYSTEM_DATABASE, "orders", "a", json!({})).await.unwrap();

        let same = CollectionDescription::new("orders");
        assert_eq!(
            engine.restore_collection(SYSTEM_DATABASE, same, false).await.unwrap(),
            RestoreOutcome::Unchanged
        );

        let mut edge = CollectionDescription::new("orders");
        edge.kind = crate::storage::CollectionKind::Edge;
        assert!(matches!(
            engine.restore_collection(SYSTEM_DATABASE, edge.clone(), false).await,
            Err(Error::AlreadyExists { .. })
        ));
        assert_eq!(
            engine.restore_collection(SYSTEM_DATABASE, edge, true).await.unwrap(),
            RestoreOutcome::Replaced
        );

        let snapshot = engine.snapshot().await;
        assert!(snapshot.collection(SYSTEM_DATABASE, "orders").unwrap().documents.is_empty());
    }

    #[tokio::test]
    async fn test_restore_indexes_replaces_changed_definitions() {
        let dir = tempdir().unwrap();
        let engine = engine_with_orders(dir.path()).await;
        let index = IndexDescription {
            id: "idx_1".into(),
            kind: crate::storage::IndexKind::Persistent,
            fields: vec!["customer".into()],
            unique: false,
            sparse: false,
        };

        let first = engine
            .restore_indexes(SYSTEM_DATABASE, "orders", vec![index.clone()])
            .await
            .unwrap();
        assert_eq!(first, vec![("idx_1".to_string(), RestoreOutcome::Created)]);

        let tick = engine.last_tick();
        let again = engine
            .restore_indexes(SYSTEM_DATABASE, "orders", vec![index.clone()])
            .await
            .unwrap();
        assert_eq!(again[0].1, RestoreOutcome::Unchanged);
        assert_eq!(engine.last_tick(), tick);

        let changed = IndexDescription { unique: true, ..index };
        let replaced = engine
            .restore_indexes(SYSTEM_DATABASE, "orders", vec![changed])
            .await
            .unwrap();
        assert_eq!(replaced[0].1, RestoreOutcome::Replaced);

        let snapshot = engine.snapshot().await;
        let orders = snapshot.collection(SYSTEM_DATABASE, "orders").unwrap();
        assert_eq!(orders.indexes.len(), 1);
        assert!(orders.indexes[0].unique);
    }

    #[tokio::test]
    async fn test_writes_wait_for_exclusive_section() {
        let dir = tempdir().unwrap();
        let engine = Arc::new(engine_with_orders(dir.path()).await);

        let section = engine.write_section(SYSTEM_DATABASE, "orders");
        let guard = section.write_owned().await;

        let writer = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move {
                engine.insert(SYSTEM_DATABASE, "orders", "a", json!({})).await
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!writer.is_finished());
        assert_eq!(engine.last_tick(), 1);

        drop(guard);
        assert_eq!(writer.await.unwrap().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_shutdown_refuses_replication() {
        let dir = tempdir().unwrap();
        let engine = engine_with_orders(dir.path()).await;
        assert!(engine.ensure_serving().is_ok());

        engine.begin_shutdown();
        assert!(matches!(engine.ensure_serving(), Err(Error::NotReplicationCapable(_))));
    }
}
