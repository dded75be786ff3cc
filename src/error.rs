//! Syncpoint Error Types

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cluster::ServerRole;
use crate::wal::Tick;

/// Result type alias for Syncpoint operations
pub type Result<T> = std::result::Result<T, Error>;

/// Kind of resource an identifier refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Batch,
    LockJob,
    KeySession,
    Chunk,
    Database,
    Collection,
    Index,
    View,
    Server,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ResourceKind::Batch => "batch",
            ResourceKind::LockJob => "lock job",
            ResourceKind::KeySession => "key session",
            ResourceKind::Chunk => "chunk",
            ResourceKind::Database => "database",
            ResourceKind::Collection => "collection",
            ResourceKind::Index => "index",
            ResourceKind::View => "view",
            ResourceKind::Server => "server",
        };
        write!(f, "{}", name)
    }
}

/// Machine-readable error classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    NotFound,
    Expired,
    LockConflict,
    WrongServerRole,
    NotReplicationCapable,
    MalformedInput,
    DataUnavailable,
    AlreadyExists,
    Internal,
}

/// Syncpoint error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // WAL errors
    #[error("WAL error: {0}")]
    Wal(String),

    #[error("WAL segment {segment} corrupted: {reason}")]
    WalCorrupted { segment: u64, reason: String },

    #[error("WAL serialization error: {0}")]
    WalSerialization(#[from] bincode::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // State errors
    #[error("State error: {0}")]
    State(String),

    #[error("State database error: {0}")]
    StateDatabase(#[from] rusqlite::Error),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Network error: {0}")]
    Network(String),

    #[error("server '{server}' failed the request: {message}")]
    Remote {
        server: String,
        code: ErrorCode,
        identifier: Option<String>,
        retryable: bool,
        message: String,
    },

    // Protocol errors
    #[error("{kind} '{id}' not found")]
    NotFound { kind: ResourceKind, id: String },

    #[error("{kind} '{id}' has expired")]
    Expired { kind: ResourceKind, id: String },

    #[error("{kind} '{id}' already exists with a different definition")]
    AlreadyExists { kind: ResourceKind, id: String },

    #[error("collection '{collection}' is already held by lock job {job}")]
    LockConflict { collection: String, job: String },

    #[error("operation '{operation}' is not permitted on a {role} server")]
    WrongServerRole { operation: String, role: ServerRole },

    #[error("server cannot service replication: {0}")]
    NotReplicationCapable(String),

    #[error("malformed input: {0}")]
    MalformedInput(String),

    #[error("log data after tick {requested} is no longer available (reclaimed through tick {oldest})")]
    DataUnavailable { requested: Tick, oldest: Tick },

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn not_found(kind: ResourceKind, id: impl ToString) -> Self {
        Error::NotFound { kind, id: id.to_string() }
    }

    pub fn expired(kind: ResourceKind, id: impl ToString) -> Self {
        Error::Expired { kind, id: id.to_string() }
    }

    pub fn malformed(reason: impl Into<String>) -> Self {
        Error::MalformedInput(reason.into())
    }

    /// Machine-readable code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::NotFound { .. } => ErrorCode::NotFound,
            Error::Expired { .. } => ErrorCode::Expired,
            Error::AlreadyExists { .. } => ErrorCode::AlreadyExists,
            Error::LockConflict { .. } => ErrorCode::LockConflict,
            Error::WrongServerRole { .. } => ErrorCode::WrongServerRole,
            Error::NotReplicationCapable(_) => ErrorCode::NotReplicationCapable,
            Error::MalformedInput(_) | Error::Json(_) => ErrorCode::MalformedInput,
            Error::DataUnavailable { .. } => ErrorCode::DataUnavailable,
            Error::Remote { code, .. } => *code,
            _ => ErrorCode::Internal,
        }
    }

    /// The offending identifier, when the error concerns one
    pub fn identifier(&self) -> Option<String> {
        match self {
            Error::NotFound { id, .. }
            | Error::Expired { id, .. }
            | Error::AlreadyExists { id, .. } => Some(id.clone()),
            Error::LockConflict { job, .. } => Some(job.clone()),
            Error::DataUnavailable { requested, .. } => Some(requested.to_string()),
            Error::Remote { identifier, .. } => identifier.clone(),
            _ => None,
        }
    }

    /// Check if the caller may retry (possibly with a fresh resource)
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Remote { retryable, .. } => *retryable,
            _ => matches!(
                self,
                Error::NotFound { .. }
                    | Error::Expired { .. }
                    | Error::LockConflict { .. }
                    | Error::Network(_)
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_and_identifiers() {
        let err = Error::not_found(ResourceKind::Batch, 42);
        assert_eq!(err.code(), ErrorCode::NotFound);
        assert_eq!(err.identifier().as_deref(), Some("42"));
        assert!(err.is_retryable());

        let err = Error::WrongServerRole {
            operation: "follow-log".into(),
            role: ServerRole::Coordinator,
        };
        assert_eq!(err.code(), ErrorCode::WrongServerRole);
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("coordinator"));
    }

    #[test]
    fn test_code_serialization() {
        let json = serde_json::to_string(&ErrorCode::LockConflict).unwrap();
        assert_eq!(json, "\"LOCK_CONFLICT\"");
    }
}
