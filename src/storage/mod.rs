//! Storage Engine Module
//!
//! In-process document store that the replication protocols run against.
//! Every mutation is logged to the WAL before it becomes visible; readers
//! work from cheap copy-on-write snapshots.

mod checkpoint;
mod engine;
mod schema;

pub use engine::{RestoreOutcome, StorageEngine, WriteOp};
pub use schema::{
    CollectionDescription, CollectionKind, IndexDescription, IndexKind, ViewDescription,
};

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Error, ResourceKind, Result};
use crate::wal::{Document, Tick};

/// Database that always exists
pub const SYSTEM_DATABASE: &str = "_system";

/// A collection's state at some tick
#[derive(Debug, Clone)]
pub struct CollectionSnapshot {
    pub description: CollectionDescription,
    pub indexes: Vec<IndexDescription>,
    /// Documents in key order; shared until the next write
    pub documents: Arc<BTreeMap<String, Document>>,
}

impl CollectionSnapshot {
    fn new(description: CollectionDescription) -> Self {
        Self {
            description,
            indexes: Vec::new(),
            documents: Arc::new(BTreeMap::new()),
        }
    }

    /// (key, revision) pairs in key order
    pub fn keys(&self) -> Vec<(String, u64)> {
        self.documents
            .values()
            .map(|doc| (doc.key.clone(), doc.rev))
            .collect()
    }
}

/// A database's state at some tick
#[derive(Debug, Clone, Default)]
pub struct DatabaseSnapshot {
    pub collections: BTreeMap<String, CollectionSnapshot>,
    pub views: BTreeMap<String, ViewDescription>,
}

/// Repeatable-read view of the whole store
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub tick: Tick,
    pub databases: BTreeMap<String, DatabaseSnapshot>,
}

impl Default for Snapshot {
    fn default() -> Self {
        let mut databases = BTreeMap::new();
        databases.insert(SYSTEM_DATABASE.to_string(), DatabaseSnapshot::default());
        Self { tick: 0, databases }
    }
}

impl Snapshot {
    pub fn database(&self, name: &str) -> Result<&DatabaseSnapshot> {
        self.databases
            .get(name)
            .ok_or_else(|| Error::not_found(ResourceKind::Database, name))
    }

    pub fn collection(&self, database: &str, name: &str) -> Result<&CollectionSnapshot> {
        self.database(database)?
            .collections
            .get(name)
            .ok_or_else(|| Error::not_found(ResourceKind::Collection, format!("{}/{}", database, name)))
    }

    /// Describe a database's collections, indexes and views
    pub fn inventory(&self, database: &str, include_system: bool) -> Result<Inventory> {
        let db = self.database(database)?;
        let collections = db
            .collections
            .values()
            .filter(|c| include_system || !c.description.is_system())
            .map(|c| CollectionInventory {
                parameters: c.description.clone(),
                indexes: c.indexes.clone(),
                count: c.documents.len(),
            })
            .collect();

        Ok(Inventory {
            database: database.to_string(),
            tick: self.tick,
            collections,
            views: db.views.values().cloned().collect(),
        })
    }
}

/// Inventory entry for one collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionInventory {
    pub parameters: CollectionDescription,
    pub indexes: Vec<IndexDescription>,
    pub count: usize,
}

/// Collection, index and view descriptions of a database at a tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Inventory {
    pub database: String,
    pub tick: Tick,
    pub collections: Vec<CollectionInventory>,
    pub views: Vec<ViewDescription>,
}
