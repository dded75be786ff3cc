//! State Tracker
//!
//! Persistent storage for node state: the server's instance identity and
//! the progress of replication clients that have tailed this node's log.

use std::path::PathBuf;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::replication::ClientProgress;
use crate::wal::Tick;

/// Fixed-width RFC 3339 so stored timestamps compare as text
fn timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Persistent state tracker backed by SQLite
pub struct StateTracker {
    /// Database connection
    conn: Mutex<Connection>,
}

impl StateTracker {
    /// Create or open the state tracker database
    pub fn new(state_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&state_dir)?;

        let db_path = state_dir.join("state.db");
        let conn = Connection::open(&db_path)?;

        // Initialize schema
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS node_state (
                key TEXT PRIMARY KEY,
                value_text TEXT NOT NULL,
                updated_at TEXT DEFAULT CURRENT_TIMESTAMP
            );

            CREATE TABLE IF NOT EXISTS client_progress (
                client_id TEXT PRIMARY KEY,
                last_served_tick INTEGER NOT NULL,
                last_seen TEXT NOT NULL
            );
            "#,
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    async fn get_text(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().await;
        let value = conn
            .query_row(
                "SELECT value_text FROM node_state WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    async fn set_text(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"
            INSERT INTO node_state (key, value_text) VALUES (?1, ?2)
            ON CONFLICT(key) DO UPDATE SET value_text = ?2, updated_at = CURRENT_TIMESTAMP
            "#,
            params![key, value],
        )?;
        Ok(())
    }

    /// The configured server id this data directory belongs to
    pub async fn server_id(&self) -> Result<Option<String>> {
        self.get_text("server_id").await
    }

    /// Instance id generated when the data directory was initialized
    pub async fn instance_id(&self) -> Result<Option<String>> {
        self.get_text("instance_id").await
    }

    /// Bind the data directory to `server_id`, creating the instance id on
    /// first use. A data directory already bound to another server is
    /// rejected.
    pub async fn init_identity(&self, server_id: &str) -> Result<String> {
        match self.server_id().await? {
            Some(existing) if existing != server_id => {
                return Err(Error::State(format!(
                    "data directory belongs to server '{}', not '{}'",
                    existing, server_id
                )));
            }
            Some(_) => {}
            None => self.set_text("server_id", server_id).await?,
        }

        if let Some(instance) = self.instance_id().await? {
            return Ok(instance);
        }
        let instance = uuid::Uuid::new_v4().to_string();
        self.set_text("instance_id", &instance).await?;
        tracing::info!("Initialized server {} with instance id {}", server_id, instance);
        Ok(instance)
    }

    /// Upsert a client's progress
    pub async fn save_client(&self, progress: &ClientProgress) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"
            INSERT INTO client_progress (client_id, last_served_tick, last_seen)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(client_id) DO UPDATE SET
                last_served_tick = ?2,
                last_seen = ?3
            "#,
            params![
                progress.client_id,
                progress.last_served_tick as i64,
                timestamp(&progress.last_seen)
            ],
        )?;
        Ok(())
    }

    /// All recorded clients, ordered by id
    pub async fn load_clients(&self) -> Result<Vec<ClientProgress>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT client_id, last_served_tick, last_seen FROM client_progress ORDER BY client_id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)? as Tick,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut clients = Vec::new();
        for result in rows {
            let (client_id, last_served_tick, last_seen) = result?;
            let last_seen = DateTime::parse_from_rfc3339(&last_seen)
                .map_err(|e| Error::State(format!("Bad timestamp for client {}: {}", client_id, e)))?
                .with_timezone(&Utc);
            clients.push(ClientProgress {
                client_id,
                last_served_tick,
                last_seen,
            });
        }

        Ok(clients)
    }

    /// Forget clients not seen since `cutoff`
    pub async fn remove_clients_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn.lock().await;
        let deleted = conn.execute(
            "DELETE FROM client_progress WHERE last_seen < ?1",
            params![timestamp(&cutoff)],
        )?;
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_identity() {
        let dir = tempdir().unwrap();
        let tracker = StateTracker::new(dir.path().to_path_buf()).unwrap();

        assert!(tracker.server_id().await.unwrap().is_none());
        let instance = tracker.init_identity("dbserver-1").await.unwrap();
        assert_eq!(tracker.init_identity("dbserver-1").await.unwrap(), instance);
        assert_eq!(tracker.server_id().await.unwrap().as_deref(), Some("dbserver-1"));

        assert!(matches!(
            tracker.init_identity("dbserver-2").await,
            Err(Error::State(_))
        ));
    }

    #[tokio::test]
    async fn test_client_progress_persists() {
        let dir = tempdir().unwrap();
        let seen = Utc::now();
        {
            let tracker = StateTracker::new(dir.path().to_path_buf()).unwrap();
            let mut progress = ClientProgress {
                client_id: "follower-b".into(),
                last_served_tick: 10,
                last_seen: seen,
            };
            tracker.save_client(&progress).await.unwrap();
            progress.last_served_tick = 42;
            tracker.save_client(&progress).await.unwrap();
            tracker
                .save_client(&ClientProgress {
                    client_id: "follower-a".into(),
                    last_served_tick: 7,
                    last_seen: seen - chrono::Duration::hours(2),
                })
                .await
                .unwrap();
        }

        let tracker = StateTracker::new(dir.path().to_path_buf()).unwrap();
        let clients = tracker.load_clients().await.unwrap();
        assert_eq!(clients.len(), 2);
        assert_eq!(clients[0].client_id, "follower-a");
        assert_eq!(clients[1].last_served_tick, 42);

        let removed = tracker
            .remove_clients_before(seen - chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(tracker.load_clients().await.unwrap().len(), 1);
    }
}
