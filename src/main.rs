/// Coachstore: operator tooling for a coaching data directory
///
/// Lists records and runs maintenance on the data directory, using the
/// same library the applications embed.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use coachstore::{config::Config, AtomicRecordStore, LockManager, PathResolver, SchemaRegistry};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "coachstore", version, about = "Inspect a coachstore data directory")]
struct Cli {
    /// Data root; overrides COACHSTORE_ROOT
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List record paths matching a glob such as `activities/**/*.yaml`
    List { pattern: String },

    /// Remove hidden temp files left behind by interrupted writes
    SweepTemp {
        /// Minimum age in seconds; defaults to the lock staleness threshold
        #[arg(long)]
        older_than: Option<u64>,
    },

    /// Inspect or clear the store lock
    Lock {
        #[command(subcommand)]
        action: LockAction,
    },
}

#[derive(Subcommand)]
enum LockAction {
    /// Print the current holder as JSON, or nothing if unlocked
    Status,
    /// Remove the lock only if it is stale
    ClearStale,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_target(false)
        .with_level(true)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = match cli.root {
        Some(root) => Config::with_root(root),
        None => Config::default(),
    };
    let store = AtomicRecordStore::new(
        PathResolver::new(&config.store.root_dir),
        Arc::new(SchemaRegistry::new()),
    );

    match cli.command {
        Command::List { pattern } => {
            let paths = store
                .list(&pattern)
                .with_context(|| format!("listing '{}'", pattern))?;
            for path in paths {
                println!("{}", path);
            }
        }
        Command::SweepTemp { older_than } => {
            let older_than = older_than
                .map(Duration::from_secs)
                .unwrap_or_else(|| config.lock.stale_after());
            let removed = store
                .sweep_temp_files(older_than)
                .context("sweeping temp files")?;
            for path in &removed {
                println!("{}", path.display());
            }
            tracing::info!("🧹 Removed {} temp files", removed.len());
        }
        Command::Lock { action } => {
            let locks = LockManager::from_config(&config);
            match action {
                LockAction::Status => {
                    if let Some(status) = locks.status().context("reading lock status")? {
                        println!("{}", serde_json::to_string_pretty(&status)?);
                    }
                }
                LockAction::ClearStale => match locks.clear_stale().context("clearing stale lock")? {
                    Some(lock) => println!(
                        "cleared stale lock for '{}' (pid {})",
                        lock.operation, lock.owner_pid
                    ),
                    None => println!("no stale lock"),
                },
            }
        }
    }

    Ok(())
}
