//! Key-Chunk Differ (key sessions)
//!
//! A key session freezes a collection at one snapshot and splits its keys
//! into fixed-size chunks, each summarized by a digest over the ordered
//! `(key, revision)` pairs. Followers compare digests and only fetch the
//! chunks that differ.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::expiry::ExpiryQueue;
use super::pins::TickPins;
use crate::config::ChunkHash;
use crate::error::{Error, ResourceKind, Result};
use crate::id::{IdGenerator, ResourceId};
use crate::storage::{Snapshot, StorageEngine};
use crate::wal::{Document, Revision, Tick};

/// Digest summary of one key range
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyChunk {
    pub index: usize,
    pub low_key: String,
    pub high_key: String,
    pub count: usize,
    pub hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRevision {
    pub key: String,
    pub rev: Revision,
}

/// Sub-range of a chunk's contents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkContents {
    pub index: usize,
    pub offset: usize,
    pub keys: Vec<KeyRevision>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub documents: Option<Vec<Document>>,
}

/// Public view of a key session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: ResourceId,
    pub database: String,
    pub collection: String,
    pub tick: Tick,
    pub count: usize,
    pub chunk_size: usize,
    pub ttl_secs: u64,
}

/// Digest over ordered `(key, revision)` pairs. Keys are length-prefixed so
/// boundaries between keys cannot shift without changing the digest.
pub fn chunk_digest<'a, I>(hash: ChunkHash, entries: I) -> String
where
    I: IntoIterator<Item = (&'a str, Revision)>,
{
    match hash {
        ChunkHash::Sha1 => {
            let mut hasher = Sha1::new();
            for (key, rev) in entries {
                hasher.update((key.len() as u32).to_le_bytes());
                hasher.update(key.as_bytes());
                hasher.update(rev.to_le_bytes());
            }
            hasher
                .finalize()
                .iter()
                .map(|b| format!("{:02x}", b))
                .collect()
        }
        ChunkHash::Crc32 => {
            let mut hasher = crc32fast::Hasher::new();
            for (key, rev) in entries {
                hasher.update(&(key.len() as u32).to_le_bytes());
                hasher.update(key.as_bytes());
                hasher.update(&rev.to_le_bytes());
            }
            format!("{:08x}", hasher.finalize())
        }
    }
}

/// Split key-ordered documents into chunks of `chunk_size`
pub fn compute_chunks<'a, I>(documents: I, chunk_size: usize, hash: ChunkHash) -> Vec<KeyChunk>
where
    I: IntoIterator<Item = &'a Document>,
{
    let documents = documents.into_iter();
    let mut chunks = Vec::new();
    let mut pending: Vec<&Document> = Vec::with_capacity(chunk_size.min(documents.size_hint().0));

    let mut flush = |pending: &mut Vec<&Document>| {
        if let (Some(first), Some(last)) = (pending.first(), pending.last()) {
            chunks.push(KeyChunk {
                index: chunks.len(),
                low_key: first.key.clone(),
                high_key: last.key.clone(),
                count: pending.len(),
                hash: chunk_digest(hash, pending.iter().map(|d| (d.key.as_str(), d.rev))),
            });
        }
        pending.clear();
    };

    for doc in documents {
        pending.push(doc);
        if pending.len() == chunk_size {
            flush(&mut pending);
        }
    }
    flush(&mut pending);

    chunks
}

/// Key-level difference between a follower's chunk and the leader's
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkDiff {
    /// On the leader but not locally
    pub missing: Vec<String>,
    /// Local keys the leader does not have
    pub extra: Vec<String>,
    /// Present on both sides with different revisions
    pub changed: Vec<String>,
}

impl ChunkDiff {
    /// Compare key lists of one chunk (both in key order)
    pub fn compute(local: &[KeyRevision], remote: &[KeyRevision]) -> Self {
        let local: BTreeMap<&str, Revision> = local.iter().map(|k| (k.key.as_str(), k.rev)).collect();
        let mut diff = ChunkDiff::default();

        for entry in remote {
            match local.get(entry.key.as_str()) {
                None => diff.missing.push(entry.key.clone()),
                Some(rev) if *rev != entry.rev => diff.changed.push(entry.key.clone()),
                Some(_) => {}
            }
        }

        let remote_keys: std::collections::BTreeSet<&str> =
            remote.iter().map(|k| k.key.as_str()).collect();
        diff.extra = local
            .keys()
            .filter(|key| !remote_keys.contains(*key))
            .map(|key| key.to_string())
            .collect();

        diff
    }

    pub fn is_empty(&self) -> bool {
        self.missing.is_empty() && self.extra.is_empty() && self.changed.is_empty()
    }
}

/// Frozen contents of a session
struct SessionData {
    database: String,
    collection: String,
    tick: Tick,
    chunk_size: usize,
    hash: ChunkHash,
    documents: Arc<BTreeMap<String, Document>>,
    chunks: OnceLock<Vec<KeyChunk>>,
}

impl SessionData {
    fn chunks(&self) -> &[KeyChunk] {
        self.chunks
            .get_or_init(|| compute_chunks(self.documents.values(), self.chunk_size, self.hash))
    }
}

struct Session {
    data: Arc<SessionData>,
    ttl: Duration,
    expires_at: Instant,
}

impl Session {
    fn info(&self, id: ResourceId) -> SessionInfo {
        SessionInfo {
            id,
            database: self.data.database.clone(),
            collection: self.data.collection.clone(),
            tick: self.data.tick,
            count: self.data.documents.len(),
            chunk_size: self.data.chunk_size,
            ttl_secs: self.ttl.as_secs(),
        }
    }
}

#[derive(Default)]
struct SessionTable {
    sessions: HashMap<ResourceId, Session>,
    expiry: ExpiryQueue<ResourceId>,
}

impl SessionTable {
    fn finish(&mut self, pins: &TickPins, id: ResourceId, expired: bool) -> bool {
        let Some(session) = self.sessions.remove(&id) else {
            return false;
        };
        pins.unpin(session.data.tick);
        if expired {
            tracing::warn!(
                "Key session {} on {}/{} expired after {:?}",
                id,
                session.data.database,
                session.data.collection,
                session.ttl
            );
        } else {
            tracing::debug!("Removed key session {}", id);
        }
        true
    }

    /// Fetch a live session and push its deadline out by another TTL
    fn touch(&mut self, pins: &TickPins, id: ResourceId, now: Instant) -> Result<Arc<SessionData>> {
        let expired = match self.sessions.get(&id) {
            None => return Err(Error::not_found(ResourceKind::KeySession, id)),
            Some(session) => session.expires_at <= now,
        };
        if expired {
            self.finish(pins, id, true);
            return Err(Error::expired(ResourceKind::KeySession, id));
        }

        let session = self
            .sessions
            .get_mut(&id)
            .ok_or_else(|| Error::not_found(ResourceKind::KeySession, id))?;
        session.expires_at = now + session.ttl;
        let (data, expires_at) = (Arc::clone(&session.data), session.expires_at);
        self.expiry.schedule(id, expires_at);
        Ok(data)
    }
}

/// Registry of key sessions
pub struct KeySessions {
    engine: Arc<StorageEngine>,
    ids: Arc<IdGenerator>,
    hash: ChunkHash,
    max_chunk_size: usize,
    pins: TickPins,
    table: Mutex<SessionTable>,
}

impl KeySessions {
    pub fn new(
        engine: Arc<StorageEngine>,
        ids: Arc<IdGenerator>,
        hash: ChunkHash,
        max_chunk_size: usize,
    ) -> Self {
        Self {
            engine,
            ids,
            hash,
            max_chunk_size,
            pins: TickPins::new(),
            table: Mutex::new(SessionTable::default()),
        }
    }

    /// Freeze a collection for chunked comparison. With `snapshot` the
    /// session shares a batch's view, otherwise it takes a fresh one.
    pub async fn create(
        &self,
        database: &str,
        collection: &str,
        chunk_size: usize,
        ttl: Duration,
        snapshot: Option<Arc<Snapshot>>,
    ) -> Result<SessionInfo> {
        self.engine.ensure_serving()?;
        if chunk_size == 0 {
            return Err(Error::malformed("chunk size must be positive"));
        }
        if chunk_size > self.max_chunk_size {
            return Err(Error::malformed(format!(
                "chunk size {} exceeds the limit of {}",
                chunk_size, self.max_chunk_size
            )));
        }

        let (snapshot, pinned) = match snapshot {
            Some(snapshot) => {
                self.pins.pin(snapshot.tick);
                let tick = snapshot.tick;
                (snapshot, tick)
            }
            None => {
                let pinned = self.pins.pin_current(|| self.engine.last_tick());
                (Arc::new(self.engine.snapshot().await), pinned)
            }
        };

        let documents = match snapshot.collection(database, collection) {
            Ok(c) => Arc::clone(&c.documents),
            Err(e) => {
                self.pins.unpin(pinned);
                return Err(e);
            }
        };
        self.pins.repin(pinned, snapshot.tick);

        let id = self.ids.generate();
        let expires_at = Instant::now() + ttl;
        let session = Session {
            data: Arc::new(SessionData {
                database: database.to_string(),
                collection: collection.to_string(),
                tick: snapshot.tick,
                chunk_size,
                hash: self.hash,
                documents,
                chunks: OnceLock::new(),
            }),
            ttl,
            expires_at,
        };
        let info = session.info(id);

        let mut table = self.table.lock().await;
        table.sessions.insert(id, session);
        table.expiry.schedule(id, expires_at);

        tracing::debug!(
            "Created key session {} on {}/{} at tick {} ({} documents)",
            id,
            database,
            collection,
            info.tick,
            info.count
        );
        Ok(info)
    }

    /// Chunk digests in key order
    pub async fn list_chunks(&self, id: ResourceId) -> Result<Vec<KeyChunk>> {
        let data = self.table.lock().await.touch(&self.pins, id, Instant::now())?;
        Ok(data.chunks().to_vec())
    }

    /// Keys (and optionally documents) of a chunk, starting at `offset`
    /// within it
    pub async fn fetch_chunk(
        &self,
        id: ResourceId,
        index: usize,
        offset: usize,
        count: Option<usize>,
        with_documents: bool,
    ) -> Result<ChunkContents> {
        let data = self.table.lock().await.touch(&self.pins, id, Instant::now())?;
        let chunk = data
            .chunks()
            .get(index)
            .ok_or_else(|| Error::not_found(ResourceKind::Chunk, format!("{}/{}", id, index)))?;

        let docs: Vec<&Document> = data
            .documents
            .range(chunk.low_key.clone()..=chunk.high_key.clone())
            .map(|(_, doc)| doc)
            .skip(offset)
            .take(count.unwrap_or(usize::MAX))
            .collect();

        Ok(ChunkContents {
            index,
            offset,
            keys: docs
                .iter()
                .map(|d| KeyRevision { key: d.key.clone(), rev: d.rev })
                .collect(),
            documents: with_documents.then(|| docs.into_iter().cloned().collect()),
        })
    }

    pub async fn get(&self, id: ResourceId) -> Result<SessionInfo> {
        let mut table = self.table.lock().await;
        table.touch(&self.pins, id, Instant::now())?;
        table
            .sessions
            .get(&id)
            .map(|s| s.info(id))
            .ok_or_else(|| Error::not_found(ResourceKind::KeySession, id))
    }

    pub async fn remove(&self, id: ResourceId) -> Result<()> {
        let mut table = self.table.lock().await;
        if table.finish(&self.pins, id, false) {
            Ok(())
        } else {
            Err(Error::not_found(ResourceKind::KeySession, id))
        }
    }

    /// Reap sessions whose TTL has passed
    pub async fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut table = self.table.lock().await;
        let mut reaped = 0;
        for id in table.expiry.pop_due(now) {
            let due = table
                .sessions
                .get(&id)
                .map_or(false, |s| s.expires_at <= now);
            if due && table.finish(&self.pins, id, true) {
                reaped += 1;
            }
        }
        reaped
    }

    /// Minimum snapshot tick of any live session
    pub fn min_tick(&self) -> Option<Tick> {
        self.pins.min()
    }

    pub async fn len(&self) -> usize {
        self.table.lock().await.sessions.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
