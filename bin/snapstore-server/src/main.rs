//! snapstore-server: snapshot metadata server
//!
//! Owns one snapshot store (and the origin volume it shadows) and
//! arbitrates chunk-level copy-on-write for origin and snapshot
//! clients over a small length-prefixed TCP protocol.

mod service;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Deserialize;
use snapstore_engine::{BlockDevice, SnapStore};
use std::path::PathBuf;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const DEFAULT_LISTEN: &str = "0.0.0.0:9401";
const DEFAULT_CHUNK_SIZE_BITS: u32 = 12;

#[derive(Parser)]
#[command(name = "snapstore-server", version, about = "Snapshot metadata server")]
struct Args {
    /// Path to a TOML configuration file
    #[arg(short, long, global = true, env = "SNAPSTORE_CONFIG")]
    config: Option<PathBuf>,

    /// Log filter, e.g. "info" or "snapstore_engine=debug"
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Format a snapshot store on an existing device or file
    Init {
        /// Snapshot store device
        snapshot_dev: PathBuf,
        /// Origin device being shadowed
        origin_dev: PathBuf,
        /// Log2 of the chunk size in bytes
        #[arg(long)]
        chunk_size_bits: Option<u32>,
    },
    /// Serve snapshot metadata for an initialized store
    Serve {
        /// Snapshot store device
        snapshot_dev: PathBuf,
        /// Origin device being shadowed
        origin_dev: PathBuf,
        /// Listen address
        #[arg(short, long)]
        listen: Option<String>,
    },
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct Config {
    server: ServerConfig,
    store: StoreConfig,
    logging: LoggingConfig,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ServerConfig {
    listen: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct StoreConfig {
    chunk_size_bits: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct LoggingConfig {
    level: Option<String>,
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<Config> {
    let Some(path) = path else {
        return Ok(Config::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("invalid config file {}", path.display()))
}

fn init_tracing(level: Option<&str>) {
    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = load_config(args.config.as_ref())?;
    init_tracing(
        args.log_level
            .as_deref()
            .or(config.logging.level.as_deref()),
    );

    match args.command {
        Command::Init {
            snapshot_dev,
            origin_dev,
            chunk_size_bits,
        } => {
            let bits = chunk_size_bits
                .or(config.store.chunk_size_bits)
                .unwrap_or(DEFAULT_CHUNK_SIZE_BITS);
            let snapdev = BlockDevice::open(&snapshot_dev)?;
            let origindev = BlockDevice::open(&origin_dev)?;
            let store = SnapStore::create(snapdev, origindev, bits)?;
            info!(
                device = %snapshot_dev.display(),
                chunk_size_bits = bits,
                free_chunks = store.free_chunks(),
                "initialized snapshot store"
            );
            Ok(())
        }
        Command::Serve {
            snapshot_dev,
            origin_dev,
            listen,
        } => {
            let addr = listen
                .or(config.server.listen)
                .unwrap_or_else(|| DEFAULT_LISTEN.to_string());
            let snapdev = BlockDevice::open(&snapshot_dev)?;
            let origindev = BlockDevice::open(&origin_dev)?;
            let store = SnapStore::open(snapdev, origindev)?;
            run_server(&addr, store)
        }
    }
}

/// The store is single-task, so the whole engine loop runs on the
/// runtime's entry future; only socket tasks are spawned.
fn run_server(addr: &str, store: SnapStore) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build runtime")?;
    runtime.block_on(async {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        info!(addr, "listening");
        service::serve(listener, store).await
    })
}
