//! Replication client progress.
//!
//! Records, per client id, the last tick served by `follow-log` and when
//! the client was last seen. Progress is kept in memory and written through
//! to the state tracker when one is attached.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::Result;
use crate::state::StateTracker;
use crate::wal::Tick;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientProgress {
    pub client_id: String,
    pub last_served_tick: Tick,
    pub last_seen: DateTime<Utc>,
}

pub struct ClientTracker {
    clients: RwLock<BTreeMap<String, ClientProgress>>,
    store: Option<Arc<StateTracker>>,
}

impl ClientTracker {
    /// In-memory tracker
    pub fn new() -> Self {
        Self {
            clients: RwLock::new(BTreeMap::new()),
            store: None,
        }
    }

    /// Tracker restored from, and persisting to, `store`
    pub async fn load(store: Arc<StateTracker>) -> Result<Self> {
        let clients = store
            .load_clients()
            .await?
            .into_iter()
            .map(|c| (c.client_id.clone(), c))
            .collect::<BTreeMap<_, _>>();
        tracing::debug!("Restored progress of {} replication clients", clients.len());

        Ok(Self {
            clients: RwLock::new(clients),
            store: Some(store),
        })
    }

    /// Note that `client_id` has been served up to `tick`. Progress never
    /// moves backwards; a client re-reading older ticks only refreshes
    /// `last_seen`.
    pub async fn record(&self, client_id: &str, tick: Tick) {
        let progress = {
            let mut clients = self.clients.write().await;
            let entry = clients
                .entry(client_id.to_string())
                .or_insert_with(|| ClientProgress {
                    client_id: client_id.to_string(),
                    last_served_tick: 0,
                    last_seen: Utc::now(),
                });
            entry.last_served_tick = entry.last_served_tick.max(tick);
            entry.last_seen = Utc::now();
            entry.clone()
        };

        if let Some(store) = &self.store {
            if let Err(e) = store.save_client(&progress).await {
                tracing::warn!("Failed to persist progress of client {}: {}", client_id, e);
            }
        }
    }

    pub async fn get(&self, client_id: &str) -> Option<ClientProgress> {
        self.clients.read().await.get(client_id).cloned()
    }

    /// All known clients, ordered by id
    pub async fn list(&self) -> Vec<ClientProgress> {
        self.clients.read().await.values().cloned().collect()
    }

    /// Forget clients not seen for `max_age`
    pub async fn prune(&self, max_age: chrono::Duration) -> Result<usize> {
        let cutoff = Utc::now() - max_age;
        let removed = {
            let mut clients = self.clients.write().await;
            let before = clients.len();
            clients.retain(|_, c| c.last_seen >= cutoff);
            before - clients.len()
        };
        if let Some(store) = &self.store {
            store.remove_clients_before(cutoff).await?;
        }
        Ok(removed)
    }
}

impl Default for ClientTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_progress_only_moves_forward() {
        let clients = ClientTracker::new();
        clients.record("follower-1", 50).await;
        clients.record("follower-1", 20).await;
        assert_eq!(clients.get("follower-1").await.unwrap().last_served_tick, 50);
        assert!(clients.get("follower-2").await.is_none());
    }

    #[tokio::test]
    async fn test_restored_from_store() {
        let dir = tempdir().unwrap();
        let store = Arc::new(StateTracker::new(dir.path().to_path_buf()).unwrap());

        let clients = ClientTracker::load(Arc::clone(&store)).await.unwrap();
        clients.record("b", 3).await;
        clients.record("a", 9).await;
        drop(clients);

        let restored = ClientTracker::load(store).await.unwrap();
        let list = restored.list().await;
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].client_id, "a");
        assert_eq!(list[0].last_served_tick, 9);
    }

    #[tokio::test]
    async fn test_prune() {
        let clients = ClientTracker::new();
        clients.record("stale", 1).await;
        clients.clients.write().await.get_mut("stale").unwrap().last_seen =
            Utc::now() - chrono::Duration::days(2);
        clients.record("fresh", 1).await;

        assert_eq!(clients.prune(chrono::Duration::days(1)).await.unwrap(), 1);
        assert_eq!(clients.list().await.len(), 1);
    }
}
