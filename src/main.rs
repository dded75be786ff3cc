//! Syncpoint - Replication Provider Engine
//!
//! Server binary: runs a node, or creates and inspects its configuration.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use syncpoint::config::SyncpointConfig;
use syncpoint::error::Result;
use syncpoint::node::Node;

/// Syncpoint - Replication Provider Engine
#[derive(Parser)]
#[command(name = "syncpoint")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "syncpoint.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the Syncpoint server
    Start,

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "syncpoint.toml")]
        output: PathBuf,

        /// Server ID
        #[arg(long, default_value = "dbserver-1")]
        node_id: String,

        /// Server role (single, primary, coordinator)
        #[arg(long, default_value = "single")]
        role: String,
    },

    /// Validate configuration file
    Validate,

    /// Show server information
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start => run_start(cli.config, cli.log_level).await,
        Commands::Init {
            output,
            node_id,
            role,
        } => run_init(output, node_id, role),
        Commands::Validate => run_validate(cli.config),
        Commands::Info => run_info(cli.config),
    }
}

/// Initialize logging
fn init_logging(level: &str, format: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if format == "compact" {
        registry.with(tracing_subscriber::fmt::layer().compact()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Start the Syncpoint server
async fn run_start(config_path: PathBuf, log_level: Option<String>) -> Result<()> {
    let config = match SyncpointConfig::from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load configuration from {:?}: {}", config_path, e);
            return Err(e);
        }
    };

    let level = log_level.unwrap_or_else(|| config.logging.level.clone());
    init_logging(&level, &config.logging.format);
    tracing::info!("Loaded configuration for server: {}", config.node.id);

    let node = match Node::open(config).await {
        Ok(node) => node,
        Err(e) => {
            tracing::error!("Failed to open server: {}", e);
            return Err(e);
        }
    };

    let shutdown = node.shutdown_token();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for shutdown signal: {}", e);
            return;
        }
        tracing::info!("Received shutdown signal");
        shutdown.cancel();
    });

    node.run().await
}

/// Write a starter configuration file
fn run_init(output: PathBuf, node_id: String, role: String) -> Result<()> {
    let db_servers = if role == "coordinator" {
        "\n[cluster.db_servers]\ndbserver-1 = \"http://dbserver-1:8529\"\n"
    } else {
        "\n# [cluster.db_servers]\n# dbserver-1 = \"http://dbserver-1:8529\"\n"
    };

    let config_content = format!(
        r#"# Syncpoint Configuration
# Generated configuration file

[node]
id = "{node_id}"
role = "{role}"
data_dir = "/var/lib/syncpoint/{node_id}"

[wal]
compression = true
segment_size_mb = 64
retention_secs = 7200
fsync = true

[replication]
batch_ttl_secs = 300
max_ttl_secs = 86400
lock_ttl_secs = 60
lock_tombstone_secs = 300
keys_ttl_secs = 600
keys_chunk_size = 5000
max_keys_chunk_size = 100000
chunk_hash = "sha1"
follow_chunk_bytes = 1048576
max_dump_limit = 10000
sweep_interval_ms = 1000
gc_interval_secs = 30

[cluster]
forward_timeout_secs = 30
{db_servers}
[api]
enabled = true
bind_address = "0.0.0.0:8529"
cors_enabled = false

[logging]
level = "info"
format = "pretty"
"#
    );

    // Refuse to write something we could not load back
    SyncpointConfig::from_str(&config_content)?;

    std::fs::write(&output, config_content)?;
    println!("Configuration file created: {}", output.display());
    println!("Then start with: syncpoint --config {} start", output.display());

    Ok(())
}

/// Validate configuration
fn run_validate(config_path: PathBuf) -> Result<()> {
    match SyncpointConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Server ID: {}", config.node.id);
            println!("  Role: {}", config.node.role);
            println!("  API: {}", config.api.bind_address);
            println!("  DB servers: {}", config.cluster.db_servers.len());
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}

/// Show server information
fn run_info(config_path: PathBuf) -> Result<()> {
    let config = SyncpointConfig::from_file(&config_path)?;
    let replication = &config.replication;

    println!("Syncpoint Server Information");
    println!("============================");
    println!();
    println!("Server ID:        {}", config.node.id);
    println!("Role:             {}", config.node.role);
    println!("Data Directory:   {}", config.data_dir().display());
    println!("API:              {}", config.api.bind_address);
    println!();
    println!("WAL Configuration:");
    println!("  Compression:    {}", config.wal.compression);
    println!("  Segment Size:   {} MB", config.wal.segment_size_mb);
    println!("  Retention:      {} s", config.wal.retention_secs);
    println!("  Fsync:          {}", config.wal.fsync);
    println!();
    println!("Replication:");
    println!("  Batch TTL:      {} s", replication.batch_ttl_secs);
    println!("  Lock TTL:       {} s", replication.lock_ttl_secs);
    println!("  Key Sessions:   {} s, {} keys/chunk, {:?}", replication.keys_ttl_secs, replication.keys_chunk_size, replication.chunk_hash);
    println!("  Follow Budget:  {} bytes", replication.follow_chunk_bytes);
    if !config.cluster.db_servers.is_empty() {
        println!();
        println!("DB Servers:");
        for (id, url) in &config.cluster.db_servers {
            println!("  {:<16}{}", id, url);
        }
    }

    Ok(())
}
