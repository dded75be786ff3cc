//! WAL Log Entry Types
//!
//! Defines the operations written to the WAL and served to replication
//! clients by the log cursor.

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::storage::{CollectionDescription, IndexDescription, ViewDescription};

/// Log position - monotonically increasing, one per committed operation
pub type Tick = u64;

/// Identifier of a multi-operation transaction in the log
pub type TransactionId = u64;

/// Document revision (the tick of the write that produced it)
pub type Revision = u64;

/// JSON payload stored as text.
///
/// Human-readable formats (the HTTP API) see a nested JSON value, while the
/// binary log codec sees a plain string.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RawJson(String);

impl RawJson {
    pub fn from_value(value: &serde_json::Value) -> Self {
        Self(value.to_string())
    }

    pub fn to_value(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::from_str(&self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<serde_json::Value> for RawJson {
    fn from(value: serde_json::Value) -> Self {
        Self::from_value(&value)
    }
}

impl Serialize for RawJson {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            let value: serde_json::Value =
                serde_json::from_str(&self.0).map_err(serde::ser::Error::custom)?;
            value.serialize(serializer)
        } else {
            serializer.serialize_str(&self.0)
        }
    }
}

impl<'de> Deserialize<'de> for RawJson {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        if deserializer.is_human_readable() {
            let value = serde_json::Value::deserialize(deserializer)?;
            Ok(Self(value.to_string()))
        } else {
            String::deserialize(deserializer).map(Self)
        }
    }
}

/// A stored document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub key: String,
    pub rev: Revision,
    pub data: RawJson,
}

/// Operations recorded in the log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LogOperation {
    CreateCollection {
        collection: CollectionDescription,
    },

    DropCollection {
        collection: String,
    },

    CreateIndex {
        collection: String,
        index: IndexDescription,
    },

    DropIndex {
        collection: String,
        index_id: String,
    },

    CreateView {
        view: ViewDescription,
    },

    DropView {
        view: String,
    },

    BeginTransaction {
        tid: TransactionId,
    },

    CommitTransaction {
        tid: TransactionId,
    },

    /// Insert or replace a document
    DocumentUpsert {
        collection: String,
        tid: Option<TransactionId>,
        document: Document,
    },

    DocumentRemove {
        collection: String,
        tid: Option<TransactionId>,
        key: String,
        rev: Revision,
    },
}

impl LogOperation {
    /// Get the collection affected by this operation (if applicable)
    pub fn collection(&self) -> Option<&str> {
        match self {
            LogOperation::CreateCollection { collection } => Some(&collection.name),
            LogOperation::DropCollection { collection }
            | LogOperation::CreateIndex { collection, .. }
            | LogOperation::DropIndex { collection, .. }
            | LogOperation::DocumentUpsert { collection, .. }
            | LogOperation::DocumentRemove { collection, .. } => Some(collection),
            LogOperation::CreateView { .. }
            | LogOperation::DropView { .. }
            | LogOperation::BeginTransaction { .. }
            | LogOperation::CommitTransaction { .. } => None,
        }
    }

    /// Get the transaction this operation belongs to (if any)
    pub fn transaction_id(&self) -> Option<TransactionId> {
        match self {
            LogOperation::BeginTransaction { tid } | LogOperation::CommitTransaction { tid } => {
                Some(*tid)
            }
            LogOperation::DocumentUpsert { tid, .. } | LogOperation::DocumentRemove { tid, .. } => {
                *tid
            }
            _ => None,
        }
    }

    /// Check if this operation touches a system collection
    pub fn is_system(&self) -> bool {
        self.collection().map(|c| c.starts_with('_')).unwrap_or(false)
    }

    /// Check if this is a schema (DDL) operation
    pub fn is_ddl(&self) -> bool {
        matches!(
            self,
            LogOperation::CreateCollection { .. }
                | LogOperation::DropCollection { .. }
                | LogOperation::CreateIndex { .. }
                | LogOperation::DropIndex { .. }
                | LogOperation::CreateView { .. }
                | LogOperation::DropView { .. }
        )
    }
}

/// A committed log entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalEntry {
    pub tick: Tick,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub database: String,
    pub operation: LogOperation,
}

impl WalEntry {
    pub fn new(tick: Tick, database: String, operation: LogOperation) -> Self {
        Self {
            tick,
            timestamp: chrono::Utc::now(),
            database,
            operation,
        }
    }

    /// Rough size of this entry on the wire, used for response budgeting
    pub fn approximate_size(&self) -> usize {
        let payload = match &self.operation {
            LogOperation::DocumentUpsert { document, .. } => document.key.len() + document.data.len(),
            LogOperation::DocumentRemove { key, .. } => key.len(),
            LogOperation::CreateView { view } => view.properties.len(),
            _ => 64,
        };
        let collection = self.operation.collection().map(str::len).unwrap_or(0);
        48 + self.database.len() + collection + payload
    }

    /// Serialize entry to bytes
    pub fn serialize(&self) -> std::result::Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize entry from bytes
    pub fn deserialize(bytes: &[u8]) -> std::result::Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}
