//! Storage checkpoints
//!
//! A checkpoint is the full store image at a tick. Once written, WAL
//! segments at or below its tick are only needed by replication clients.
//!
//! File layout: [magic: 8][crc32: u32][lz4(bincode(image))]

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::{
    CollectionDescription, CollectionSnapshot, DatabaseSnapshot, IndexDescription, Snapshot,
    ViewDescription,
};
use crate::error::{Error, Result};
use crate::wal::{Document, Tick};

const CHECKPOINT_MAGIC: &[u8; 8] = b"SYNCPCKP";

#[derive(Serialize, Deserialize)]
struct CollectionImage {
    description: CollectionDescription,
    indexes: Vec<IndexDescription>,
    documents: Vec<Document>,
}

#[derive(Serialize, Deserialize)]
struct DatabaseImage {
    name: String,
    collections: Vec<CollectionImage>,
    views: Vec<ViewDescription>,
}

#[derive(Serialize, Deserialize)]
struct CheckpointImage {
    tick: Tick,
    databases: Vec<DatabaseImage>,
}

impl From<&Snapshot> for CheckpointImage {
    fn from(snapshot: &Snapshot) -> Self {
        let databases = snapshot
            .databases
            .iter()
            .map(|(name, db)| DatabaseImage {
                name: name.clone(),
                collections: db
                    .collections
                    .values()
                    .map(|c| CollectionImage {
                        description: c.description.clone(),
                        indexes: c.indexes.clone(),
                        documents: c.documents.values().cloned().collect(),
                    })
                    .collect(),
                views: db.views.values().cloned().collect(),
            })
            .collect();

        Self {
            tick: snapshot.tick,
            databases,
        }
    }
}

impl From<CheckpointImage> for Snapshot {
    fn from(image: CheckpointImage) -> Self {
        let mut snapshot = Snapshot {
            tick: image.tick,
            ..Snapshot::default()
        };

        for db in image.databases {
            let collections = db
                .collections
                .into_iter()
                .map(|c| {
                    let documents: BTreeMap<String, Document> = c
                        .documents
                        .into_iter()
                        .map(|doc| (doc.key.clone(), doc))
                        .collect();
                    let state = CollectionSnapshot {
                        description: c.description,
                        indexes: c.indexes,
                        documents: Arc::new(documents),
                    };
                    (state.description.name.clone(), state)
                })
                .collect();
            let views = db.views.into_iter().map(|v| (v.name.clone(), v)).collect();
            snapshot
                .databases
                .insert(db.name, DatabaseSnapshot { collections, views });
        }

        snapshot
    }
}

/// Write a checkpoint atomically (temp file + rename)
pub fn write_checkpoint(path: &Path, snapshot: &Snapshot) -> Result<()> {
    let image = CheckpointImage::from(snapshot);
    let serialized = bincode::serialize(&image)?;
    let compressed = lz4_flex::compress_prepend_size(&serialized);

    let tmp_path = path.with_extension("tmp");
    {
        let mut file = std::fs::File::create(&tmp_path)?;
        file.write_all(CHECKPOINT_MAGIC)?;
        file.write_all(&crc32fast::hash(&compressed).to_le_bytes())?;
        file.write_all(&compressed)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp_path, path)?;

    tracing::debug!("Wrote checkpoint at tick {} to {:?}", snapshot.tick, path);
    Ok(())
}

/// Load a checkpoint, if one exists
pub fn read_checkpoint(path: &Path) -> Result<Option<Snapshot>> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    if bytes.len() < 12 || &bytes[0..8] != CHECKPOINT_MAGIC {
        return Err(Error::State(format!("Invalid checkpoint file {:?}", path)));
    }

    let mut crc = [0u8; 4];
    crc.copy_from_slice(&bytes[8..12]);
    let compressed = &bytes[12..];
    if crc32fast::hash(compressed) != u32::from_le_bytes(crc) {
        return Err(Error::State(format!("Checkpoint checksum mismatch in {:?}", path)));
    }

    let serialized = lz4_flex::decompress_size_prepended(compressed)
        .map_err(|e| Error::State(format!("Checkpoint decompression failed: {}", e)))?;
    let image: CheckpointImage = bincode::deserialize(&serialized)?;
    Ok(Some(image.into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::RawJson;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn test_checkpoint_restores_state() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("checkpoint.bin");

        let mut snapshot = Snapshot {
            tick: 42,
            ..Snapshot::default()
        };
        let mut orders = CollectionSnapshot::new(CollectionDescription::new("orders"));
        Arc::make_mut(&mut orders.documents).insert(
            "a1".to_string(),
            Document {
                key: "a1".into(),
                rev: 40,
                data: RawJson::from(json!({"qty": 2})),
            },
        );
        snapshot
            .databases
            .get_mut("_system")
            .unwrap()
            .collections
            .insert("orders".into(), orders);

        write_checkpoint(&path, &snapshot).unwrap();
        let restored = read_checkpoint(&path).unwrap().unwrap();

        assert_eq!(restored.tick, 42);
        let orders = restored.collection("_system", "orders").unwrap();
        assert_eq!(orders.documents.len(), 1);
        assert_eq!(orders.documents["a1"].rev, 40);
    }

    #[test]
    fn test_missing_checkpoint() {
        let dir = tempdir().unwrap();
        assert!(read_checkpoint(&dir.path().join("checkpoint.bin")).unwrap().is_none());
    }

    #[test]
    fn test_corrupt_checkpoint_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("checkpoint.bin");
        write_checkpoint(&path, &Snapshot::default()).unwrap();

        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        std::fs::write(&path, bytes).unwrap();

        assert!(read_checkpoint(&path).is_err());
    }
}
