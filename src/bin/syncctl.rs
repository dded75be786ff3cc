//! SyncCtl - Command line tool for inspecting Syncpoint servers
//!
//! Usage:
//!   syncctl state                - Show server state and client progress
//!   syncctl follow --from N      - Tail the replication log (Ctrl+C to stop)
//!   syncctl inventory            - Show collections, indexes and views
//!   syncctl followers <shard>    - Show the follower set of a shard

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde::de::DeserializeOwned;

use syncpoint::config::SyncpointConfig;
use syncpoint::replication::{ErrorBody, FollowResponse, FollowerSet, Operation, StateResponse};
use syncpoint::storage::{Inventory, SYSTEM_DATABASE};
use syncpoint::wal::Tick;

/// Syncpoint Control Tool
#[derive(Parser)]
#[command(name = "syncctl")]
#[command(about = "Inspect Syncpoint replication servers", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "/etc/syncpoint/config.toml")]
    config: PathBuf,

    /// API endpoint to connect to (overrides config)
    #[arg(short, long)]
    endpoint: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show server state and replication client progress
    State,
    /// Tail the replication log until Ctrl+C
    Follow {
        /// Start after this tick
        #[arg(long, default_value_t = 0)]
        from: Tick,
        /// Only this database
        #[arg(long)]
        database: Option<String>,
        /// Only this collection
        #[arg(long)]
        collection: Option<String>,
        /// Include system collections
        #[arg(long)]
        include_system: bool,
        /// Report progress under this client id
        #[arg(long)]
        client_id: Option<String>,
    },
    /// Show a database's collections, indexes and views
    Inventory {
        #[arg(long, default_value = SYSTEM_DATABASE)]
        database: String,
        /// Include system collections
        #[arg(long)]
        include_system: bool,
    },
    /// Show the follower set of a shard
    Followers {
        shard: String,
    },
}

/// API endpoint from the server's config, or the default
fn resolve_endpoint(cli: &Cli) -> String {
    if let Some(endpoint) = &cli.endpoint {
        return endpoint.trim_end_matches('/').to_string();
    }

    match SyncpointConfig::from_file(&cli.config) {
        Ok(config) => {
            let addr = config.api.bind_address;
            match addr.strip_prefix("0.0.0.0:") {
                Some(port) => format!("http://127.0.0.1:{}", port),
                None => format!("http://{}", addr),
            }
        }
        Err(_) => "http://127.0.0.1:8529".to_string(),
    }
}

struct Client {
    http: reqwest::Client,
    url: String,
}

impl Client {
    fn new(endpoint: &str) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("failed to create HTTP client")?;
        Ok(Self {
            http,
            url: format!("{}/_api/replication", endpoint),
        })
    }

    async fn call<T: DeserializeOwned>(&self, operation: &Operation) -> anyhow::Result<T> {
        let response = self
            .http
            .post(&self.url)
            .json(operation)
            .send()
            .await
            .with_context(|| format!("failed to reach {}", self.url))?;

        if response.status().is_success() {
            return response
                .json::<T>()
                .await
                .with_context(|| format!("unexpected {} response", operation.name()));
        }

        let status = response.status();
        match response.json::<ErrorBody>().await {
            Ok(body) => bail!("{} failed ({:?}): {}", body.operation, body.code, body.message),
            Err(_) => bail!("{} failed with HTTP {}", operation.name(), status),
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let endpoint = resolve_endpoint(&cli);

    let result = match &cli.command {
        Commands::State => show_state(&endpoint).await,
        Commands::Follow {
            from,
            database,
            collection,
            include_system,
            client_id,
        } => {
            let operation = Operation::FollowLog {
                from: *from,
                to: None,
                chunk_bytes: None,
                database: database.clone(),
                collection: collection.clone(),
                include_system: *include_system,
                client_id: client_id.clone(),
            };
            follow(&endpoint, operation).await
        }
        Commands::Inventory {
            database,
            include_system,
        } => show_inventory(&endpoint, database, *include_system).await,
        Commands::Followers { shard } => show_followers(&endpoint, shard).await,
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn show_state(endpoint: &str) -> anyhow::Result<()> {
    let client = Client::new(endpoint)?;
    let state: StateResponse = client.call(&Operation::GetState { database: None }).await?;

    println!("Server:          {} ({})", state.server.id, state.server.role);
    println!("Instance:        {}", state.server.instance);
    println!("Version:         {}", state.server.version);
    println!("Running:         {}", if state.running { "yes" } else { "shutting down" });
    println!("Tick:            {}", state.tick);
    println!("Reclaimed:       through tick {}", state.pruned_through);
    println!("Sync batches:    {}", state.batches);
    println!("Lock jobs:       {}", state.lock_jobs);
    println!("Key sessions:    {}", state.key_sessions);

    if !state.clients.is_empty() {
        println!();
        println!("{:<24} {:>12}  {}", "CLIENT", "SERVED", "LAST SEEN");
        for c in &state.clients {
            println!(
                "{:<24} {:>12}  {}",
                c.client_id,
                c.last_served_tick,
                c.last_seen.format("%Y-%m-%d %H:%M:%S")
            );
        }
    }
    Ok(())
}

async fn follow(endpoint: &str, mut operation: Operation) -> anyhow::Result<()> {
    let client = Client::new(endpoint)?;

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;

    while running.load(Ordering::SeqCst) {
        let response: FollowResponse = client.call(&operation).await?;
        for entry in &response.entries {
            println!("{}", serde_json::to_string(entry)?);
        }

        if let Operation::FollowLog { from, .. } = &mut operation {
            *from = response.last_scanned_tick;
        }
        if !response.check_more {
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }

    if let Operation::FollowLog { from, .. } = &operation {
        eprintln!("Stopped after tick {}", from);
    }
    Ok(())
}

async fn show_inventory(endpoint: &str, database: &str, include_system: bool) -> anyhow::Result<()> {
    let client = Client::new(endpoint)?;
    let inventory: Inventory = client
        .call(&Operation::Inventory {
            database: database.to_string(),
            batch_id: None,
            include_system,
        })
        .await?;

    println!("Database '{}' at tick {}", inventory.database, inventory.tick);
    println!();
    println!("{:<32} {:<10} {:>10} {:>8}", "COLLECTION", "TYPE", "DOCUMENTS", "INDEXES");
    for c in &inventory.collections {
        println!(
            "{:<32} {:<10} {:>10} {:>8}",
            c.parameters.name,
            format!("{:?}", c.parameters.kind).to_lowercase(),
            c.count,
            c.indexes.len()
        );
    }
    if !inventory.views.is_empty() {
        println!();
        for v in &inventory.views {
            println!("view {}", v.name);
        }
    }
    Ok(())
}

async fn show_followers(endpoint: &str, shard: &str) -> anyhow::Result<()> {
    let client = Client::new(endpoint)?;
    let set: FollowerSet = client
        .call(&Operation::ListFollowers {
            shard: shard.to_string(),
        })
        .await?;

    if set.followers.is_empty() {
        println!("Shard {} has no followers", set.shard);
    } else {
        println!("Followers of shard {}:", set.shard);
        for follower in &set.followers {
            println!("  {}", follower);
        }
    }
    Ok(())
}
