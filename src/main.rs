//! veneer: maintenance of the local content cache.
//!
//! ```bash
//! # Reconcile the index with what is on disk
//! veneer rescan
//!
//! # Reconcile, then keep reconciling as files change until Ctrl-C
//! veneer watch
//!
//! # Show where a hash is stored
//! veneer lookup 0A4D55A8D778E5022FAB701977C5D840BBC486D0
//! ```
//!
//! Log verbosity follows `RUST_LOG` (default `info`).

use clap::{Parser, Subcommand};
use derive_more::{Display, Error};
use exn::ResultExt;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
use veneer::cache::{CacheHandle, ContentCache, Database, ScanOutcome};
use veneer::config::Config;

#[derive(Debug, Display, Error)]
enum CliError {
    #[display("could not load the configuration")]
    Config,
    #[display("cache operation failed")]
    Cache,
    #[display("could not listen for Ctrl-C")]
    Signal,
}

type Result<T> = std::result::Result<T, exn::Exn<CliError>>;

#[derive(Parser, Debug)]
#[command(name = "veneer")]
#[command(version)]
#[command(about = "Maintain the local content cache")]
struct Cli {
    /// Configuration file (TOML, YAML or JSON). Defaults to veneer.toml in
    /// the platform's configuration directory, if present.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Reconcile the index with the mod and cache directories
    Rescan,
    /// Delete the least recently used cache files until under the size ceiling
    Evict,
    /// Show entry counts and sizes
    Stats,
    /// Show where a content hash is stored
    Lookup {
        /// 40-character SHA-1 hex digest
        hash: String,
    },
    /// Rescan, then reconcile changes as they happen until Ctrl-C
    Watch,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %*err, "Command failed");
            eprintln!("{err:?}");
            ExitCode::FAILURE
        },
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load(cli.config.as_deref()).or_raise(|| CliError::Config)?;
    let database = Database::connect(config.cache.database_path()).await.or_raise(|| CliError::Cache)?;
    let cache: CacheHandle =
        Arc::new(ContentCache::open(config.cache.clone(), &database).await.or_raise(|| CliError::Cache)?);

    let result = match cli.command {
        Command::Rescan => rescan(&cache).await,
        Command::Evict => evict(&cache).await,
        Command::Stats => {
            stats(&cache);
            Ok(())
        },
        Command::Lookup { hash } => {
            lookup(&cache, &hash);
            Ok(())
        },
        Command::Watch => watch(&cache).await,
    };
    database.close().await;
    result
}

async fn rescan(cache: &ContentCache) -> Result<()> {
    match cache.rescan().await.or_raise(|| CliError::Cache)? {
        ScanOutcome::Completed(report) => println!(
            "ingested {}, re-ingested {}, removed {}, unchanged {}, failed {}, corrupt {}",
            report.ingested, report.reingested, report.removed, report.unchanged, report.failed, report.corrupt
        ),
        ScanOutcome::Queued => println!("a rescan is already running"),
    }
    Ok(())
}

async fn evict(cache: &ContentCache) -> Result<()> {
    let report = cache.evict().await.or_raise(|| CliError::Cache)?;
    println!(
        "evicted {} files, freed {} bytes, {} bytes left",
        report.evicted.len(),
        report.freed_bytes,
        report.total_bytes
    );
    Ok(())
}

fn stats(cache: &ContentCache) {
    let stats = cache.stats();
    println!("mods:   {:>8} files {:>14} bytes", stats.mod_entries, stats.mod_bytes);
    println!("cache:  {:>8} files {:>14} bytes", stats.cache_entries, stats.cache_bytes);
    println!("ceiling:               {:>14} bytes", cache.settings().max_size_bytes);
}

fn lookup(cache: &ContentCache, hash: &str) {
    match cache.lookup(&hash.to_ascii_uppercase()) {
        Some(entry) => println!("{} {} {} bytes {}", entry.hash, entry.root, entry.size, entry.path.display()),
        None => println!("{hash} is not cached"),
    }
}

async fn watch(cache: &CacheHandle) -> Result<()> {
    rescan(cache).await?;
    let token = CancellationToken::new();
    let handle = cache.watch(token).or_raise(|| CliError::Cache)?;
    tracing::info!("Watching for changes, press Ctrl-C to stop");
    let signal = tokio::signal::ctrl_c().await.or_raise(|| CliError::Signal);
    handle.stop().await;
    signal
}
