//! # Ingest Harness CLI (`ingest`)
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `ingest init` | Create the SQLite database and run schema migrations |
//! | `ingest sources` | List configured sources, their capabilities and health |
//! | `ingest sync <source>` | Run one lease-guarded sync cycle (`all` for every source) |
//! | `ingest prune <source>` | Delete indexed items the source no longer has |
//! | `ingest sync-permissions <source>` | Refresh access metadata without re-syncing content |
//! | `ingest validate-checkpoint <source>` | Check that the stored checkpoint still parses |
//!
//! ## Examples
//!
//! ```bash
//! ingest init --config ./config/ingest.toml
//! ingest sync filesystem:docs
//! ingest sync all --since 2024-01-01
//! ingest sync feed:calls --full
//! ingest prune feed:calls
//! ```

use anyhow::{bail, Context};
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use ingest_harness::config::{self, Config};
use ingest_harness::db;
use ingest_harness::lock::SqliteLeaseStore;
use ingest_harness::migrate;
use ingest_harness::scheduler::{
    self, CycleOptions, CycleOutcome, PermSyncOutcome, PruneOutcome, SyncDeps,
};
use ingest_harness::sources;
use ingest_harness::store::{CheckpointStore, SqliteSink};
use ingest_harness::window::TimeWindow;

/// Ingest Harness — a checkpointed, resumable document sync framework.
#[derive(Parser)]
#[command(
    name = "ingest",
    about = "Checkpointed, resumable document sync into a local index",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/ingest.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables (documents,
    /// checkpoints, leases, sync_failures). Idempotent.
    Init,

    /// List configured sources with capability tags and health.
    Sources,

    /// Run one sync cycle for a source (or `all`).
    ///
    /// A cycle acquires the source's lease, resumes from its stored
    /// checkpoint, and hands batches to the index. If another worker holds
    /// the lease the cycle is skipped, not failed.
    Sync {
        /// Source label (`filesystem:docs`, `feed:calls`) or `all`.
        source: String,

        /// Discard the stored checkpoint and resync from scratch.
        #[arg(long)]
        full: bool,

        /// Window start (YYYY-MM-DD). Defaults to the Unix epoch.
        #[arg(long)]
        since: Option<String>,

        /// Window end (YYYY-MM-DD). Defaults to now.
        #[arg(long)]
        until: Option<String>,
    },

    /// Delete indexed items the source no longer has.
    ///
    /// Enumerates the source's live ids through its slim capability and
    /// removes everything indexed under the source that is not in that set.
    Prune {
        /// Source label (`filesystem:docs`, `feed:calls`).
        source: String,
    },

    /// Refresh access metadata for everything indexed from a source.
    ///
    /// Runs independently of content sync: an item whose content has not
    /// changed can still change visibility at the source.
    SyncPermissions {
        /// Source label (`filesystem:docs`, `feed:calls`).
        source: String,
    },

    /// Check that a source's stored checkpoint blob still parses.
    ///
    /// Useful after upgrading a connector whose checkpoint shape changed.
    ValidateCheckpoint {
        /// Source label (`filesystem:docs`, `feed:calls`).
        source: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&cfg.db.path).await?;
            migrate::run_migrations(&pool).await?;
            println!("Database initialized successfully.");
        }
        Commands::Sources => {
            sources::list_sources(&cfg)?;
        }
        Commands::Sync {
            source,
            full,
            since,
            until,
        } => {
            run_sync(&cfg, &source, full, since, until).await?;
        }
        Commands::Prune { source } => {
            run_prune(&cfg, &source).await?;
        }
        Commands::SyncPermissions { source } => {
            run_sync_permissions(&cfg, &source).await?;
        }
        Commands::ValidateCheckpoint { source } => {
            run_validate_checkpoint(&cfg, &source).await?;
        }
    }

    Ok(())
}

async fn build_deps(cfg: &Config) -> anyhow::Result<SyncDeps> {
    let pool = db::connect(&cfg.db.path).await?;
    migrate::run_migrations(&pool).await?;
    Ok(SyncDeps {
        checkpoints: Arc::new(CheckpointStore::new(pool.clone())),
        leases: Arc::new(SqliteLeaseStore::new(pool.clone())),
        sink: Arc::new(SqliteSink::new(pool)),
    })
}

fn requested_window(since: Option<String>, until: Option<String>) -> anyhow::Result<TimeWindow> {
    let start = match since {
        Some(date) => parse_date(&date)?,
        None => DateTime::<Utc>::UNIX_EPOCH,
    };
    let end = match until {
        Some(date) => parse_date(&date)?,
        None => Utc::now(),
    };
    if start >= end {
        bail!("--since must be before --until");
    }
    Ok(TimeWindow::new(start, end))
}

fn parse_date(date: &str) -> anyhow::Result<DateTime<Utc>> {
    let parsed = NaiveDate::parse_from_str(date, "%Y-%m-%d")
        .with_context(|| format!("invalid date '{date}' (expected YYYY-MM-DD)"))?;
    Ok(parsed.and_hms_opt(0, 0, 0).unwrap().and_utc())
}

async fn run_sync(
    cfg: &Config,
    source: &str,
    full: bool,
    since: Option<String>,
    until: Option<String>,
) -> anyhow::Result<()> {
    let deps = build_deps(cfg).await?;
    let window = requested_window(since, until)?;
    let options = CycleOptions {
        batch_size: cfg.sync.batch_size,
        lease_ttl: cfg.lease.ttl(),
        full_resync: full,
    };
    let all_sources = sources::build_sources(cfg)?;

    let results = if source == "all" {
        scheduler::run_all(all_sources, window, options, deps).await
    } else {
        let runtime = sources::find_source(&all_sources, source)?;
        let result = scheduler::run_source_cycle(&runtime, window, options, &deps).await;
        vec![(source.to_string(), result)]
    };

    let mut failed = 0usize;
    for (label, result) in results {
        match result {
            Ok(CycleOutcome::Completed(report)) => {
                println!(
                    "{label}: {} items, {} failures, {} batches",
                    report.items, report.failures, report.batches
                );
            }
            Ok(CycleOutcome::SkippedLocked) => {
                println!("{label}: skipped (lease held by another worker)");
            }
            Err(err) => {
                failed += 1;
                eprintln!("{label}: sync failed: {err}");
            }
        }
    }
    if failed > 0 {
        bail!("{failed} source(s) failed to sync");
    }
    Ok(())
}

async fn run_prune(cfg: &Config, source: &str) -> anyhow::Result<()> {
    let deps = build_deps(cfg).await?;
    let options = CycleOptions {
        batch_size: cfg.sync.batch_size,
        lease_ttl: cfg.lease.ttl(),
        full_resync: false,
    };
    let all_sources = sources::build_sources(cfg)?;
    let runtime = sources::find_source(&all_sources, source)?;

    match scheduler::prune_source(&runtime, options, &deps).await? {
        PruneOutcome::Completed(report) => {
            println!(
                "{source}: {} live items, {} deleted",
                report.live, report.deleted
            );
        }
        PruneOutcome::SkippedLocked => {
            println!("{source}: skipped (prune lease held by another worker)");
        }
    }
    Ok(())
}

async fn run_sync_permissions(cfg: &Config, source: &str) -> anyhow::Result<()> {
    let deps = build_deps(cfg).await?;
    let options = CycleOptions {
        batch_size: cfg.sync.batch_size,
        lease_ttl: cfg.lease.ttl(),
        full_resync: false,
    };
    let all_sources = sources::build_sources(cfg)?;
    let runtime = sources::find_source(&all_sources, source)?;

    match scheduler::sync_permissions(&runtime, options, &deps).await? {
        PermSyncOutcome::Completed(report) => {
            println!(
                "{source}: {} items checked, {} access records updated",
                report.checked, report.updated
            );
        }
        PermSyncOutcome::SkippedLocked => {
            println!("{source}: skipped (permission lease held by another worker)");
        }
    }
    Ok(())
}

async fn run_validate_checkpoint(cfg: &Config, source: &str) -> anyhow::Result<()> {
    let deps = build_deps(cfg).await?;
    let all_sources = sources::build_sources(cfg)?;
    let runtime = sources::find_source(&all_sources, source)?;
    let connector = runtime.require_checkpointed()?;

    match deps.checkpoints.get(source).await? {
        None => println!("{source}: no stored checkpoint (next sync starts fresh)"),
        Some(blob) => match connector.validate_blob(&blob) {
            Ok(()) => println!("{source}: stored checkpoint is valid"),
            Err(err) => bail!("{source}: stored checkpoint is invalid: {err}"),
        },
    }
    Ok(())
}
