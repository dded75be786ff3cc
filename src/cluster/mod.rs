//! Cluster Module
//!
//! Server roles and identity, plus the collaborator a coordinator uses to
//! hand replication requests to DB servers.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::replication::{ErrorBody, Operation};
use crate::storage::Inventory;

/// Role of a server in the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerRole {
    /// Standalone server with local data
    #[default]
    Single,
    /// DB server holding shard leaders
    Primary,
    /// Routes requests; holds no local log or collections
    Coordinator,
}

impl ServerRole {
    pub fn has_local_data(&self) -> bool {
        !matches!(self, ServerRole::Coordinator)
    }
}

impl std::fmt::Display for ServerRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerRole::Single => write!(f, "single"),
            ServerRole::Primary => write!(f, "primary"),
            ServerRole::Coordinator => write!(f, "coordinator"),
        }
    }
}

/// Who this server is
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerIdentity {
    /// Configured server id
    pub id: String,
    /// Generated once per data directory
    pub instance: String,
    pub role: ServerRole,
    pub version: String,
}

/// Sends replication operations to other servers
#[async_trait::async_trait]
pub trait ShardForwarder: Send + Sync {
    /// Ids of the servers this forwarder can reach
    fn servers(&self) -> Vec<String>;

    /// Run `operation` on `server` and return its response body
    async fn forward(&self, server: &str, operation: &Operation) -> Result<serde_json::Value>;
}

/// Forwarder speaking the HTTP API of each DB server
pub struct HttpForwarder {
    client: reqwest::Client,
    /// Server id -> base URL
    servers: BTreeMap<String, String>,
}

impl HttpForwarder {
    pub fn new(servers: BTreeMap<String, String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Network(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { client, servers })
    }
}

#[async_trait::async_trait]
impl ShardForwarder for HttpForwarder {
    fn servers(&self) -> Vec<String> {
        self.servers.keys().cloned().collect()
    }

    async fn forward(&self, server: &str, operation: &Operation) -> Result<serde_json::Value> {
        let base = self
            .servers
            .get(server)
            .ok_or_else(|| Error::not_found(crate::error::ResourceKind::Server, server))?;
        let url = format!("{}/_api/replication", base.trim_end_matches('/'));

        tracing::debug!("Forwarding {} to {} at {}", operation.name(), server, url);

        let response = self
            .client
            .post(&url)
            .json(operation)
            .send()
            .await
            .map_err(|e| Error::Network(format!("Failed to reach {}: {}", server, e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| Error::Network(format!("Failed to read response from {}: {}", server, e)))?;

        if status.is_success() {
            return Ok(serde_json::from_str(&body)?);
        }

        match serde_json::from_str::<ErrorBody>(&body) {
            Ok(remote) => Err(Error::Remote {
                server: server.to_string(),
                code: remote.code,
                identifier: remote.identifier,
                retryable: remote.retryable,
                message: remote.message,
            }),
            Err(_) => Err(Error::Network(format!(
                "{} answered {}: {}",
                server, status, body
            ))),
        }
    }
}

/// Inventories of one database across all DB servers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterInventory {
    pub database: String,
    pub servers: BTreeMap<String, Inventory>,
    /// Documents across all servers
    pub total_documents: usize,
}

/// Ask every DB server for its inventory of `database` and merge the answers
pub async fn cluster_inventory(
    forwarder: &dyn ShardForwarder,
    database: &str,
    include_system: bool,
) -> Result<ClusterInventory> {
    let request = Operation::Inventory {
        database: database.to_string(),
        batch_id: None,
        include_system,
    };

    let servers = forwarder.servers();
    let answers = futures::future::join_all(
        servers.iter().map(|server| forwarder.forward(server, &request)),
    )
    .await;

    let mut merged = ClusterInventory {
        database: database.to_string(),
        servers: BTreeMap::new(),
        total_documents: 0,
    };
    for (server, answer) in servers.into_iter().zip(answers) {
        let inventory: Inventory = serde_json::from_value(answer?)?;
        merged.total_documents += inventory.collections.iter().map(|c| c.count).sum::<usize>();
        merged.servers.insert(server, inventory);
    }

    tracing::debug!(
        "Cluster inventory of '{}' from {} servers",
        database,
        merged.servers.len()
    );
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::storage::{CollectionDescription, CollectionInventory};
    use std::collections::HashMap;

    /// Answers from canned inventories
    struct StaticForwarder {
        inventories: HashMap<String, Inventory>,
    }

    #[async_trait::async_trait]
    impl ShardForwarder for StaticForwarder {
        fn servers(&self) -> Vec<String> {
            let mut servers: Vec<String> = self.inventories.keys().cloned().collect();
            servers.sort();
            servers
        }

        async fn forward(&self, server: &str, _operation: &Operation) -> Result<serde_json::Value> {
            let inventory = self
                .inventories
                .get(server)
                .ok_or_else(|| Error::Network(format!("{} is down", server)))?;
            Ok(serde_json::to_value(inventory)?)
        }
    }

    fn inventory(collection: &str, count: usize) -> Inventory {
        Inventory {
            database: "_system".into(),
            tick: 10,
            collections: vec![CollectionInventory {
                parameters: CollectionDescription::new(collection),
                indexes: Vec::new(),
                count,
            }],
            views: Vec::new(),
        }
    }

    #[test]
    fn test_role_serialization() {
        assert_eq!(serde_json::to_string(&ServerRole::Coordinator).unwrap(), "\"coordinator\"");
        assert_eq!(ServerRole::default(), ServerRole::Single);
        assert!(ServerRole::Primary.has_local_data());
        assert!(!ServerRole::Coordinator.has_local_data());
    }

    #[tokio::test]
    async fn test_cluster_inventory_merges_servers() {
        let mut inventories = HashMap::new();
        inventories.insert("dbserver-1".to_string(), inventory("s1001", 5));
        inventories.insert("dbserver-2".to_string(), inventory("s1002", 7));
        let forwarder = StaticForwarder { inventories };

        let merged = cluster_inventory(&forwarder, "_system", false).await.unwrap();
        assert_eq!(merged.servers.len(), 2);
        assert_eq!(merged.total_documents, 12);
        assert_eq!(merged.servers["dbserver-2"].collections[0].parameters.name, "s1002");
    }

    #[tokio::test]
    async fn test_unknown_server() {
        let forwarder = HttpForwarder::new(BTreeMap::new(), Duration::from_secs(1)).unwrap();
        let err = forwarder.forward("nowhere", &Operation::ServerId).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotFound);
    }
}
