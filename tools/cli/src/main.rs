//! PlotSync CLI - inspect and drive the offline sync layer of a device.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use plotsync_app::{AppConfig, PlotSync};
use plotsync_common::EntityTable;
use plotsync_storage::MutationStatus;
use plotsync_sync::{DrainReport, ManualProbe, SyncEvent};

#[derive(Parser)]
#[command(name = "plotsync")]
#[command(about = "PlotSync - offline cache and mutation queue")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file (default: <config dir>/plotsync/config.json).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Treat the backend as unreachable without probing it.
    #[arg(long)]
    offline: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show connectivity and queue summary.
    Status,

    /// Print the cached rows of a table.
    Cache {
        /// Entity table (e.g. "inspections").
        table: String,
    },

    /// List queued mutations in replay order.
    Queue,

    /// Replay the queue against the backend.
    Drain,

    /// Requeue a failed mutation.
    Retry {
        /// Queue sequence number.
        seq: u64,
    },

    /// Drop a failed mutation.
    Discard {
        /// Queue sequence number.
        seq: u64,
    },

    /// Keep the session open and report sync events until interrupted.
    Watch,

    /// Write the effective configuration to the config file.
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    if std::env::var("RUST_LOG").is_ok() {
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(EnvFilter::from_default_env())
            .with_target(false)
            .compact()
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(level)
            .with_target(false)
            .compact()
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let config = AppConfig::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    if let Commands::Init = cli.command {
        return cmd_init(&config, &config_path);
    }

    let app = open(&config, cli.offline).await?;

    match cli.command {
        Commands::Status => cmd_status(&app).await,
        Commands::Cache { table } => cmd_cache(&app, &table).await,
        Commands::Queue => cmd_queue(&app).await,
        Commands::Drain => cmd_drain(&app).await,
        Commands::Retry { seq } => cmd_retry(&app, seq).await,
        Commands::Discard { seq } => cmd_discard(&app, seq).await,
        Commands::Watch => cmd_watch(&app).await,
        Commands::Init => Ok(()),
    }
}

fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("plotsync")
        .join("config.json")
}

async fn open(config: &AppConfig, offline: bool) -> Result<PlotSync> {
    let app = if offline {
        PlotSync::open_with_probe(config, Arc::new(ManualProbe::new(false))).await
    } else {
        PlotSync::open(config).await
    };
    app.context("Failed to open session")
}

/// Write the config file.
fn cmd_init(config: &AppConfig, path: &Path) -> Result<()> {
    config
        .save(path)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    println!("Config written: {}", path.display());
    Ok(())
}

/// Show connectivity and queue summary.
async fn cmd_status(app: &PlotSync) -> Result<()> {
    let sync = app.sync();
    let online = sync.is_online().await;
    let entries = sync.queue().entries().await.context("Failed to read queue")?;
    let failed = entries
        .iter()
        .filter(|e| e.status == MutationStatus::Failed)
        .count();

    println!("Session:");
    println!("  Viewer: {} ({:?})", app.viewer().user_id, app.viewer().role);
    println!("  Backend: {}", sync.backend().name());
    println!("  Connectivity: {}", if online { "online" } else { "offline" });
    println!("  Queued: {}", entries.len());
    println!("  Failed: {}", failed);

    let tables = sync.cache().tables().await.context("Failed to list cache")?;
    if !tables.is_empty() {
        println!("  Cached tables:");
        for table in tables {
            println!("    {}", table);
        }
    }

    // A drain may have started on the online edge.
    if let Some(report) = sync.wait_for_drain().await {
        print_report(&report);
    }

    Ok(())
}

/// Print the cached rows of a table.
async fn cmd_cache(app: &PlotSync, table: &str) -> Result<()> {
    let table = EntityTable::new(table).context("Invalid table name")?;
    let entries = app
        .sync()
        .cache()
        .entries(&table)
        .await
        .context("Failed to read cache")?;

    if entries.is_empty() {
        println!("{} is empty", table.cache_table());
        return Ok(());
    }

    for entry in entries {
        println!(
            "{} [{}] {}",
            entry.id,
            entry.sync_status.as_str(),
            serde_json::to_string(entry.record.as_map())?
        );
    }

    Ok(())
}

/// List queued mutations.
async fn cmd_queue(app: &PlotSync) -> Result<()> {
    let entries = app
        .sync()
        .queue()
        .entries()
        .await
        .context("Failed to read queue")?;

    if entries.is_empty() {
        println!("Queue is empty");
        return Ok(());
    }

    for entry in entries {
        let target = entry
            .record_id
            .as_ref()
            .map(|id| id.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "#{} {} {} {} {:?} attempts={}",
            entry.seq, entry.created_at, entry.op, entry.table, entry.status, entry.attempts
        );
        println!("    target: {}", target);
        if let Some(error) = &entry.last_error {
            println!("    error: {}", error);
        }
    }

    Ok(())
}

/// Replay the queue.
async fn cmd_drain(app: &PlotSync) -> Result<()> {
    match app.sync().flush().await.context("Drain failed")? {
        Some(report) => print_report(&report),
        None => println!("Offline; queue left untouched"),
    }
    Ok(())
}

/// Requeue a failed mutation.
async fn cmd_retry(app: &PlotSync, seq: u64) -> Result<()> {
    let entry = app
        .sync()
        .retry_failed(seq)
        .await
        .with_context(|| format!("Failed to retry #{}", seq))?;
    println!("Requeued #{} ({} {})", entry.seq, entry.op, entry.table);
    Ok(())
}

/// Drop a failed mutation.
async fn cmd_discard(app: &PlotSync, seq: u64) -> Result<()> {
    let entry = app
        .sync()
        .discard_failed(seq)
        .await
        .with_context(|| format!("Failed to discard #{}", seq))?;
    println!("Discarded #{} ({} {})", entry.seq, entry.op, entry.table);
    Ok(())
}

/// Report sync events until Ctrl-C.
async fn cmd_watch(app: &PlotSync) -> Result<()> {
    let mut events = app.sync().subscribe();
    let (watcher, task) = app.spawn_watcher();
    info!("Watching sync events (Ctrl-C to stop)");

    let response = watcher.network_changed().await.context("Watcher stopped")?;
    println!(
        "Connectivity: {}",
        if response.online { "online" } else { "offline" }
    );

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(SyncEvent::ConnectivityChanged(t)) => {
                    println!("Connectivity: {} -> {}", t.from, t.to);
                }
                Ok(SyncEvent::DrainCompleted(report)) => print_report(&report),
                Ok(SyncEvent::MutationFailed(failed)) => {
                    println!(
                        "Failed #{} {} {}: {}",
                        failed.seq, failed.op, failed.table, failed.error
                    );
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    println!("Missed {} events", n);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    // Flush before exiting, like an app going to the background.
    let response = watcher.background().await.context("Watcher stopped")?;
    if let Some(report) = &response.drained {
        print_report(report);
    }
    watcher.shutdown().await;
    task.await.context("Watcher task failed")?;

    Ok(())
}

fn print_report(report: &DrainReport) {
    println!(
        "Drain: {} applied, {} failed in {:?}",
        report.applied.len(),
        report.failed.len(),
        report.duration
    );
    for applied in &report.applied {
        let id = applied
            .record_id
            .as_ref()
            .map(|id| id.to_string())
            .unwrap_or_default();
        println!("  ok   #{} {} {} {}", applied.seq, applied.op, applied.table, id);
    }
    for failed in &report.failed {
        let kind = if failed.terminal { "fail" } else { "wait" };
        println!(
            "  {} #{} {} {}: {}",
            kind, failed.seq, failed.op, failed.table, failed.error
        );
    }
    for table in &report.blocked_tables {
        println!("  blocked: {}", table);
    }
    for seq in &report.waiting {
        println!("  held #{}: references a record not synced yet", seq);
    }
}
