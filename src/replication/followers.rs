//! Follower Set Manager
//!
//! Tracks which nodes receive synchronous writes for each shard. Changes are
//! applied under the write lock, so the write path observes them as soon as
//! `add` or `remove` returns.

use std::collections::{BTreeSet, HashMap};

use tokio::sync::RwLock;

use crate::error::{Error, Result};

#[derive(Debug, Default)]
pub struct FollowerSets {
    shards: RwLock<HashMap<String, BTreeSet<String>>>,
}

fn check_ids(shard: &str, node: &str) -> Result<()> {
    if shard.is_empty() {
        return Err(Error::malformed("shard id must not be empty"));
    }
    if node.is_empty() {
        return Err(Error::malformed("follower id must not be empty"));
    }
    Ok(())
}

impl FollowerSets {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a follower; returns false if it was already present
    pub async fn add(&self, shard: &str, node: &str) -> Result<bool> {
        check_ids(shard, node)?;
        let mut shards = self.shards.write().await;
        let added = shards
            .entry(shard.to_string())
            .or_default()
            .insert(node.to_string());
        if added {
            tracing::info!("Added follower {} to shard {}", node, shard);
        }
        Ok(added)
    }

    /// Remove a follower; returns false if it was not present
    pub async fn remove(&self, shard: &str, node: &str) -> Result<bool> {
        check_ids(shard, node)?;
        let mut shards = self.shards.write().await;
        let Some(members) = shards.get_mut(shard) else {
            return Ok(false);
        };
        let removed = members.remove(node);
        if members.is_empty() {
            shards.remove(shard);
        }
        if removed {
            tracing::info!("Removed follower {} from shard {}", node, shard);
        }
        Ok(removed)
    }

    pub async fn list(&self, shard: &str) -> BTreeSet<String> {
        let shards = self.shards.read().await;
        shards.get(shard).cloned().unwrap_or_default()
    }

    pub async fn contains(&self, shard: &str, node: &str) -> bool {
        let shards = self.shards.read().await;
        shards.get(shard).map_or(false, |m| m.contains(node))
    }

    /// Number of shards with at least one follower
    pub async fn shard_count(&self) -> usize {
        self.shards.read().await.len()
    }
}
