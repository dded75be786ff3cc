//! Syncpoint Configuration
//!
//! This module provides configuration structures for a Syncpoint
//! replication provider node.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::cluster::ServerRole;

/// Main Syncpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncpointConfig {
    /// Node-specific configuration
    pub node: NodeConfig,

    /// Write-Ahead Log configuration
    #[serde(default)]
    pub wal: WalConfig,

    /// Replication protocol configuration
    #[serde(default)]
    pub replication: ReplicationConfig,

    /// Cluster configuration
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique node identifier
    pub id: String,

    /// Data directory for WAL and state storage
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Role of this server in the cluster
    #[serde(default)]
    pub role: ServerRole,
}

/// Write-Ahead Log configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalConfig {
    /// Enable LZ4 compression for WAL entries
    #[serde(default = "default_compression")]
    pub compression: bool,

    /// Maximum segment size in megabytes
    #[serde(default = "default_segment_size_mb")]
    pub segment_size_mb: u64,

    /// Minimum age in seconds before a reclaimable segment is deleted
    /// (0 = keep only what live batches and sessions require)
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,

    /// Use fsync for durability (slower but safer)
    #[serde(default = "default_fsync")]
    pub fsync: bool,
}

/// Replication protocol configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Default TTL of a sync batch
    #[serde(default = "default_batch_ttl_secs")]
    pub batch_ttl_secs: u64,

    /// Upper bound for any client-supplied TTL
    #[serde(default = "default_max_ttl_secs")]
    pub max_ttl_secs: u64,

    /// Default TTL of a lock job
    #[serde(default = "default_lock_ttl_secs")]
    pub lock_ttl_secs: u64,

    /// How long finished lock jobs remain pollable
    #[serde(default = "default_lock_tombstone_secs")]
    pub lock_tombstone_secs: u64,

    /// Default TTL of a key-chunk session
    #[serde(default = "default_keys_ttl_secs")]
    pub keys_ttl_secs: u64,

    /// Default number of keys per chunk
    #[serde(default = "default_keys_chunk_size")]
    pub keys_chunk_size: usize,

    /// Largest chunk size a client may request
    #[serde(default = "default_max_keys_chunk_size")]
    pub max_keys_chunk_size: usize,

    /// Chunk digest function
    #[serde(default)]
    pub chunk_hash: ChunkHash,

    /// Default byte budget of a follow-log response
    #[serde(default = "default_follow_chunk_bytes")]
    pub follow_chunk_bytes: usize,

    /// Largest page a dump request may ask for
    #[serde(default = "default_max_dump_limit")]
    pub max_dump_limit: usize,

    /// Interval of the TTL sweeper
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,

    /// Interval of log garbage collection
    #[serde(default = "default_gc_interval_secs")]
    pub gc_interval_secs: u64,
}

/// Digest used for key-chunk content hashes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkHash {
    #[default]
    Sha1,
    Crc32,
}

/// Cluster configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// DB servers reachable from a coordinator: server id -> base URL
    #[serde(default)]
    pub db_servers: BTreeMap<String, String>,

    /// Timeout of a forwarded request in seconds
    #[serde(default = "default_forward_timeout_secs")]
    pub forward_timeout_secs: u64,
}

/// API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Enable HTTP API
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// HTTP API bind address
    #[serde(default = "default_api_address")]
    pub bind_address: String,

    /// Enable CORS
    #[serde(default)]
    pub cors_enabled: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_compression() -> bool {
    true
}

fn default_segment_size_mb() -> u64 {
    64
}

fn default_retention_secs() -> u64 {
    7200
}

fn default_fsync() -> bool {
    true
}

fn default_batch_ttl_secs() -> u64 {
    300
}

fn default_max_ttl_secs() -> u64 {
    86_400
}

fn default_lock_ttl_secs() -> u64 {
    60
}

fn default_lock_tombstone_secs() -> u64 {
    300
}

fn default_keys_ttl_secs() -> u64 {
    600
}

fn default_keys_chunk_size() -> usize {
    5000
}

fn default_max_keys_chunk_size() -> usize {
    100_000
}

fn default_max_dump_limit() -> usize {
    10_000
}

fn default_follow_chunk_bytes() -> usize {
    1024 * 1024
}

fn default_sweep_interval_ms() -> u64 {
    1000
}

fn default_gc_interval_secs() -> u64 {
    30
}

fn default_forward_timeout_secs() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

fn default_api_address() -> String {
    "0.0.0.0:8529".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/syncpoint")
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            compression: default_compression(),
            segment_size_mb: default_segment_size_mb(),
            retention_secs: default_retention_secs(),
            fsync: default_fsync(),
        }
    }
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            batch_ttl_secs: default_batch_ttl_secs(),
            max_ttl_secs: default_max_ttl_secs(),
            lock_ttl_secs: default_lock_ttl_secs(),
            lock_tombstone_secs: default_lock_tombstone_secs(),
            keys_ttl_secs: default_keys_ttl_secs(),
            keys_chunk_size: default_keys_chunk_size(),
            max_keys_chunk_size: default_max_keys_chunk_size(),
            chunk_hash: ChunkHash::default(),
            follow_chunk_bytes: default_follow_chunk_bytes(),
            max_dump_limit: default_max_dump_limit(),
            sweep_interval_ms: default_sweep_interval_ms(),
            gc_interval_secs: default_gc_interval_secs(),
        }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            db_servers: BTreeMap::new(),
            forward_timeout_secs: default_forward_timeout_secs(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: default_api_address(),
            cors_enabled: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl ReplicationConfig {
    /// Clamp a client-supplied TTL, falling back to `default_secs`
    pub fn ttl(&self, requested_secs: Option<u64>, default_secs: u64) -> Duration {
        let secs = requested_secs.filter(|s| *s > 0).unwrap_or(default_secs);
        Duration::from_secs(secs.min(self.max_ttl_secs))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn gc_interval(&self) -> Duration {
        Duration::from_secs(self.gc_interval_secs)
    }

    pub fn lock_tombstone(&self) -> Duration {
        Duration::from_secs(self.lock_tombstone_secs)
    }
}

impl SyncpointConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: SyncpointConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Minimal configuration for a node with the given id and data directory
    pub fn for_node(id: impl Into<String>, data_dir: PathBuf) -> Self {
        Self {
            node: NodeConfig {
                id: id.into(),
                data_dir,
                role: ServerRole::default(),
            },
            wal: WalConfig::default(),
            replication: ReplicationConfig::default(),
            cluster: ClusterConfig::default(),
            api: ApiConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.id.is_empty() {
            return Err(crate::Error::Config("node.id cannot be empty".into()));
        }

        if self.wal.segment_size_mb == 0 {
            return Err(crate::Error::Config("wal.segment_size_mb must be positive".into()));
        }

        let replication = &self.replication;
        if replication.keys_chunk_size == 0 {
            return Err(crate::Error::Config(
                "replication.keys_chunk_size must be positive".into(),
            ));
        }
        if replication.keys_chunk_size > replication.max_keys_chunk_size {
            return Err(crate::Error::Config(format!(
                "replication.keys_chunk_size exceeds max_keys_chunk_size ({})",
                replication.max_keys_chunk_size
            )));
        }
        if replication.max_dump_limit == 0 {
            return Err(crate::Error::Config(
                "replication.max_dump_limit must be positive".into(),
            ));
        }
        if replication.follow_chunk_bytes == 0 {
            return Err(crate::Error::Config(
                "replication.follow_chunk_bytes must be positive".into(),
            ));
        }
        if replication.sweep_interval_ms == 0 || replication.gc_interval_secs == 0 {
            return Err(crate::Error::Config(
                "replication sweep and gc intervals must be positive".into(),
            ));
        }
        for (name, ttl) in [
            ("batch_ttl_secs", replication.batch_ttl_secs),
            ("lock_ttl_secs", replication.lock_ttl_secs),
            ("keys_ttl_secs", replication.keys_ttl_secs),
        ] {
            if ttl == 0 || ttl > replication.max_ttl_secs {
                return Err(crate::Error::Config(format!(
                    "replication.{} must be between 1 and max_ttl_secs",
                    name
                )));
            }
        }

        if self.node.role == ServerRole::Coordinator && self.cluster.db_servers.is_empty() {
            return Err(crate::Error::Config(
                "a coordinator needs at least one entry in cluster.db_servers".into(),
            ));
        }

        if !matches!(self.logging.format.as_str(), "pretty" | "compact") {
            return Err(crate::Error::Config(format!(
                "logging.format must be 'pretty' or 'compact', got '{}'",
                self.logging.format
            )));
        }

        Ok(())
    }

    /// Get the data directory path
    pub fn data_dir(&self) -> &PathBuf {
        &self.node.data_dir
    }

    /// Get the WAL directory path
    pub fn wal_dir(&self) -> PathBuf {
        self.node.data_dir.join("wal")
    }

    /// Get the state directory path
    pub fn state_dir(&self) -> PathBuf {
        self.node.data_dir.join("state")
    }

    /// Get forward timeout as Duration
    pub fn forward_timeout(&self) -> Duration {
        Duration::from_secs(self.cluster.forward_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[node]
id = "prmr-1"
data_dir = "/var/lib/syncpoint"
role = "primary"

[wal]
segment_size_mb = 16
retention_secs = 0

[replication]
keys_chunk_size = 100
chunk_hash = "crc32"
"#;

        let config = SyncpointConfig::from_str(toml).unwrap();
        assert_eq!(config.node.id, "prmr-1");
        assert_eq!(config.node.role, ServerRole::Primary);
        assert_eq!(config.wal.segment_size_mb, 16);
        assert_eq!(config.replication.keys_chunk_size, 100);
        assert_eq!(config.replication.chunk_hash, ChunkHash::Crc32);
        assert_eq!(config.replication.batch_ttl_secs, 300);
        assert!(config.api.enabled);
    }

    #[test]
    fn test_coordinator_requires_db_servers() {
        let toml = r#"
[node]
id = "crdn-1"
role = "coordinator"
"#;
        assert!(SyncpointConfig::from_str(toml).is_err());

        let toml = r#"
[node]
id = "crdn-1"
role = "coordinator"

[cluster.db_servers]
"prmr-1" = "http://10.0.0.1:8529"
"#;
        let config = SyncpointConfig::from_str(toml).unwrap();
        assert_eq!(config.cluster.db_servers.len(), 1);
    }

    #[test]
    fn test_ttl_clamping() {
        let replication = ReplicationConfig::default();
        assert_eq!(replication.ttl(None, 60), Duration::from_secs(60));
        assert_eq!(replication.ttl(Some(0), 60), Duration::from_secs(60));
        assert_eq!(replication.ttl(Some(10), 60), Duration::from_secs(10));
        assert_eq!(
            replication.ttl(Some(10_000_000), 60),
            Duration::from_secs(replication.max_ttl_secs)
        );
    }

    #[test]
    fn test_default_chunk_size_within_limit() {
        let toml = r#"
[node]
id = "prmr-1"

[replication]
keys_chunk_size = 20000
max_keys_chunk_size = 10000
"#;
        assert!(SyncpointConfig::from_str(toml).is_err());

        let config = SyncpointConfig::from_str("[node]\nid = \"prmr-1\"\n").unwrap();
        assert!(config.replication.keys_chunk_size <= config.replication.max_keys_chunk_size);
        assert_eq!(config.replication.max_dump_limit, 10_000);
    }
}
