//! Node assembly
//!
//! Opens the storage engine and state, builds the replication handler and
//! runs the HTTP API together with the background TTL sweeper and log
//! garbage collector.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::api::HttpServer;
use crate::cluster::{HttpForwarder, ServerIdentity, ServerRole, ShardForwarder};
use crate::config::SyncpointConfig;
use crate::error::Result;
use crate::replication::{ClientTracker, ReplicationHandler};
use crate::state::StateTracker;
use crate::storage::StorageEngine;

/// Replication clients not seen for this long are forgotten
const CLIENT_RETENTION_DAYS: i64 = 7;

/// What one sweeper pass reaped
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub batches: usize,
    pub lock_jobs: usize,
    pub key_sessions: usize,
}

impl SweepStats {
    pub fn total(&self) -> usize {
        self.batches + self.lock_jobs + self.key_sessions
    }
}

/// A running Syncpoint server
pub struct Node {
    config: SyncpointConfig,
    handler: Arc<ReplicationHandler>,
    shutdown: CancellationToken,
}

impl Node {
    /// Open all components of the configured server
    pub async fn open(config: SyncpointConfig) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(config.data_dir())?;

        let tracker = Arc::new(StateTracker::new(config.state_dir())?);
        let instance = tracker.init_identity(&config.node.id).await?;
        let identity = ServerIdentity {
            id: config.node.id.clone(),
            instance,
            role: config.node.role,
            version: env!("CARGO_PKG_VERSION").to_string(),
        };

        let engine = Arc::new(StorageEngine::open(config.wal_dir(), config.wal.clone())?);
        tracing::info!(
            "Storage engine open at tick {} (log reclaimed through {})",
            engine.last_tick(),
            engine.reader().pruned_through()
        );

        let clients = Arc::new(ClientTracker::load(tracker).await?);

        let forwarder: Option<Arc<dyn ShardForwarder>> = match config.node.role {
            ServerRole::Coordinator => Some(Arc::new(HttpForwarder::new(
                config.cluster.db_servers.clone(),
                config.forward_timeout(),
            )?)),
            _ => None,
        };

        let handler = Arc::new(ReplicationHandler::new(
            identity,
            config.replication.clone(),
            engine,
            clients,
            forwarder,
        ));

        Ok(Self {
            config,
            handler,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn handler(&self) -> &Arc<ReplicationHandler> {
        &self.handler
    }

    /// Token that stops the node when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Start the sweeper and garbage collector
    pub fn spawn_background(&self) -> Vec<JoinHandle<()>> {
        let sweeper = {
            let handler = Arc::clone(&self.handler);
            let shutdown = self.shutdown.clone();
            let period = self.config.replication.sweep_interval();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = interval.tick() => {
                            let stats = sweep(&handler).await;
                            if stats.total() > 0 {
                                tracing::debug!("Sweeper reaped {:?}", stats);
                            }
                        }
                    }
                }
            })
        };

        let collector = {
            let handler = Arc::clone(&self.handler);
            let shutdown = self.shutdown.clone();
            let period = self.config.replication.gc_interval();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                // The first tick fires immediately; skip it
                interval.tick().await;
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = interval.tick() => {
                            if let Err(e) = collect_garbage(&handler).await {
                                tracing::error!("Log garbage collection failed: {}", e);
                            }
                        }
                    }
                }
            })
        };

        vec![sweeper, collector]
    }

    /// Serve until the shutdown token is cancelled
    pub async fn run(self) -> Result<()> {
        let identity = self.handler.identity();
        tracing::info!(
            "Syncpoint {} server {} starting (instance {})",
            identity.role,
            identity.id,
            identity.instance
        );

        let tasks = self.spawn_background();
        let server = HttpServer::new(self.config.api.clone(), Arc::clone(&self.handler));
        let result = server.start(self.shutdown.clone()).await;

        // The API may be disabled; keep running until asked to stop
        if result.is_ok() {
            self.shutdown.cancelled().await;
        }
        self.shutdown.cancel();

        self.handler.engine().begin_shutdown();
        for task in tasks {
            if let Err(e) = task.await {
                tracing::error!("Background task failed: {}", e);
            }
        }

        tracing::info!("Syncpoint server {} stopped", self.handler.identity().id);
        result
    }
}

/// Reap expired batches, lock jobs and key sessions
pub async fn sweep(handler: &ReplicationHandler) -> SweepStats {
    SweepStats {
        batches: handler.batches().sweep().await,
        lock_jobs: handler.locks().sweep().await,
        key_sessions: handler.keys().sweep().await,
    }
}

/// Checkpoint and reclaim log segments nothing still needs
pub async fn collect_garbage(handler: &ReplicationHandler) -> Result<usize> {
    let removed = handler
        .engine()
        .collect_garbage(|| handler.pinned_floor())
        .await?;
    if removed > 0 {
        tracing::info!(
            "Reclaimed {} log segments; log now starts after tick {}",
            removed,
            handler.engine().reader().pruned_through()
        );
    }

    let forgotten = handler
        .clients()
        .prune(chrono::Duration::days(CLIENT_RETENTION_DAYS))
        .await?;
    if forgotten > 0 {
        tracing::info!("Forgot {} inactive replication clients", forgotten);
    }
    Ok(removed)
}
