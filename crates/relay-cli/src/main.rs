//! chunkrelay: move large files through a small intermediate remote folder
//!
//! Commands:
//!   produce <origins>...  - split origins, write the manifest, upload manifest + chunks
//!   consume               - fetch, verify and delete chunks, then merge each origin
//!   merge                 - merge from a local manifest and chunks directory
//!   verify                - check local chunks against the manifest
//!   health                - check that the remote folder is reachable
//!   config show           - display the effective configuration

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{HumanBytes, ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use relay_core::config::RelayConfig;
use relay_core::VerificationResult;
use relay_storage::{build_operator, check_health, Credentials, OpendalStore};
use relay_sync::{ChunkState, Consumer, EventFn, Producer, TransferEvent};

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "chunkrelay",
    version,
    about = "Relay large files through a remote folder in verified chunks",
    long_about = "chunkrelay: split files into checksummed chunks, pass them through a \
                  WebDAV folder one at a time, and reassemble them byte for byte"
)]
struct Cli {
    /// Path to chunkrelay.toml configuration file
    #[arg(long, short = 'c', env = "RELAY_CONFIG", default_value = "chunkrelay.toml", global = true)]
    config: PathBuf,

    /// Local manifest file (overrides paths.manifest)
    #[arg(long, global = true)]
    manifest: Option<PathBuf>,

    /// Local chunks directory (overrides paths.chunks_dir)
    #[arg(long, global = true)]
    chunks_dir: Option<PathBuf>,

    /// Where merged files are written (overrides paths.output_dir)
    #[arg(long, global = true)]
    output_dir: Option<PathBuf>,

    /// Log level filter (RUST_LOG takes precedence)
    #[arg(long, env = "RELAY_LOG", global = true)]
    log: Option<String>,

    /// Log format
    #[arg(long, env = "RELAY_LOG_FORMAT", global = true)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Split origin files and upload them with their manifest
    ///
    /// Credentials are read from RELAY_REMOTE_USERNAME and
    /// RELAY_REMOTE_PASSWORD.
    Produce {
        /// Origin files to relay
        #[arg(required = true)]
        origins: Vec<PathBuf>,
        /// Chunk size in bytes (overrides transfer.chunk_size_bytes)
        #[arg(long)]
        chunk_size: Option<u64>,
        /// Upload every chunk without waiting for the consumer to take it
        #[arg(long)]
        no_wait: bool,
        /// Keep local chunk files after upload
        #[arg(long)]
        keep_chunks: bool,
    },

    /// Download, verify and merge everything the manifest lists
    Consume {
        /// Keep local chunk files after a successful merge
        #[arg(long)]
        keep_chunks: bool,
    },

    /// Merge origins from a local manifest and chunks directory
    Merge,

    /// Verify local chunks against the manifest
    Verify,

    /// Check that the remote folder is reachable with the given credentials
    Health,

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the effective configuration (defaults + file + flags)
    Show,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = RelayConfig::load(&cli.config)
        .with_context(|| format!("loading config: {}", cli.config.display()))?;
    apply_overrides(&mut config, &cli);

    let level = cli.log.clone().unwrap_or_else(|| config.log.level.clone());
    let format = cli.log_format.unwrap_or(match config.log.format.as_str() {
        "json" => LogFormat::Json,
        _ => LogFormat::Text,
    });
    init_logging(&level, format);
    tracing::debug!(config = %cli.config.display(), backend = ?config.remote.backend, "configuration loaded");

    match cli.command {
        Commands::Produce { origins, chunk_size, no_wait, keep_chunks } => {
            if let Some(size) = chunk_size {
                config.transfer.chunk_size_bytes = size;
            }
            config.producer.wait_for_ack &= !no_wait;
            config.producer.cleanup_local_chunks &= !keep_chunks;
            config.validate()?;
            cmd_produce(&config, &origins).await
        }
        Commands::Consume { keep_chunks } => {
            config.consumer.cleanup_local_chunks &= !keep_chunks;
            config.validate()?;
            cmd_consume(&config).await
        }
        Commands::Merge => cmd_merge(&config).await,
        Commands::Verify => cmd_verify(&config).await,
        Commands::Health => cmd_health(&config).await,
        Commands::Config { action: ConfigAction::Show } => cmd_config_show(&config, &cli.config),
    }
}

fn apply_overrides(config: &mut RelayConfig, cli: &Cli) {
    if let Some(p) = &cli.manifest {
        config.paths.manifest = p.clone();
    }
    if let Some(p) = &cli.chunks_dir {
        config.paths.chunks_dir = p.clone();
    }
    if let Some(p) = &cli.output_dir {
        config.paths.output_dir = Some(p.clone());
    }
}

fn init_logging(level: &str, format: LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}

// ── Remote store from environment credentials ────────────────────────────────

/// Credentials from RELAY_REMOTE_USERNAME / RELAY_REMOTE_PASSWORD, if set.
fn credentials_from_env() -> Result<Option<Credentials>> {
    let Ok(username) = std::env::var("RELAY_REMOTE_USERNAME") else {
        return Ok(None);
    };
    let password = std::env::var("RELAY_REMOTE_PASSWORD").context(
        "RELAY_REMOTE_USERNAME is set but RELAY_REMOTE_PASSWORD is not\n\
         Example:\n\
         \texport RELAY_REMOTE_USERNAME=alice\n\
         \texport RELAY_REMOTE_PASSWORD=app-password",
    )?;
    Ok(Some(Credentials { username, password }))
}

fn open_store(config: &RelayConfig) -> Result<Arc<OpendalStore>> {
    let creds = credentials_from_env()?;
    let op = build_operator(&config.remote, creds.as_ref()).context("building remote operator")?;
    Ok(Arc::new(OpendalStore::new(op, &config.remote.folder)))
}

/// Cancel `token` on Ctrl-C. Already-verified chunks and the manifest stay on disk.
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\ninterrupted; verified chunks are kept, re-run to resume");
            token.cancel();
        }
    });
}

// ── Progress bar helpers ──────────────────────────────────────────────────────

fn make_progress_bar(total: u64, prefix: &str) -> Result<ProgressBar> {
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::with_template("{prefix:.bold} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .context("progress template")?
            .progress_chars("=>-"),
    );
    pb.set_prefix(prefix.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    Ok(pb)
}

// ── `chunkrelay produce` ──────────────────────────────────────────────────────

async fn cmd_produce(config: &RelayConfig, origins: &[PathBuf]) -> Result<()> {
    let store = open_store(config)?;
    check_health(store.as_ref())
        .await
        .context("remote store is not reachable")?;

    println!(
        "Producing {} origin(s) → {} (folder: {})",
        origins.len(),
        config.remote.endpoint,
        config.remote.folder,
    );

    let pb = make_progress_bar(0, "upload")?;
    let events: EventFn = {
        let pb = pb.clone();
        Arc::new(move |e: &TransferEvent| match e {
            TransferEvent::ChunkRecorded { .. } => pb.inc_length(1),
            TransferEvent::Uploaded { name, .. } => {
                pb.set_message(format!("{name} (waiting for consumer)"));
            }
            TransferEvent::Acknowledged { name } => {
                pb.inc(1);
                pb.set_message(format!("{name} taken"));
            }
            _ => {}
        })
    };

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());
    let report = Producer::new(store, config)
        .with_events(events)
        .produce(origins, cancel)
        .await
        .context("produce run failed")?;
    pb.finish_with_message("done".to_string());

    println!();
    println!("Produce complete:");
    println!("  origins:      {}", report.origins);
    println!("  chunks:       {}", report.chunks);
    println!("  bytes:        {}", HumanBytes(report.bytes));
    println!("  acknowledged: {}", report.acknowledged);
    println!("  manifest:     {}", report.manifest.display());
    Ok(())
}

// ── `chunkrelay consume` ──────────────────────────────────────────────────────

async fn cmd_consume(config: &RelayConfig) -> Result<()> {
    let store = open_store(config)?;
    check_health(store.as_ref())
        .await
        .context("remote store is not reachable")?;

    let pb = make_progress_bar(0, "download")?;
    pb.set_message("waiting for manifest...");
    let events: EventFn = {
        let pb = pb.clone();
        Arc::new(move |e: &TransferEvent| match e {
            TransferEvent::ManifestFetched { chunks, groups } => {
                pb.set_length(*chunks as u64);
                pb.set_message(format!("{groups} origin(s)"));
            }
            TransferEvent::Chunk { name, state: ChunkState::Verified } => {
                pb.inc(1);
                pb.set_message(name.clone());
            }
            TransferEvent::GroupMerged { base, bytes } => {
                pb.println(format!("  merged {base} ({})", HumanBytes(*bytes)));
            }
            TransferEvent::DeleteFailed { name, reason } => {
                pb.println(format!("  warning: could not delete remote {name}: {reason}"));
            }
            _ => {}
        })
    };

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());
    let report = Consumer::new(store, config)
        .with_events(events)
        .run(cancel)
        .await
        .context("consume run failed")?;
    pb.finish_with_message("done".to_string());

    println!();
    for r in report.merged() {
        println!("  ✓ {} ({}, {} chunks)", r.output.display(), HumanBytes(r.bytes), r.chunks);
    }
    for (base, err) in report.failures() {
        println!("  ✗ {base}: {err}");
    }
    let deletes = report.delete_failures();
    if deletes > 0 {
        println!("  {deletes} remote chunk(s) could not be deleted; remove them by hand");
    }

    if !report.all_merged() {
        anyhow::bail!(
            "{} of {} origin(s) not merged",
            report.failures().count(),
            report.groups.len()
        );
    }
    Ok(())
}

// ── `chunkrelay merge` / `chunkrelay verify` ──────────────────────────────────

async fn cmd_merge(config: &RelayConfig) -> Result<()> {
    let manifest = config.paths.manifest.clone();
    let chunks_dir = config.paths.chunks_dir.clone();
    let output_dir = config.paths.resolved_output_dir();

    println!("Merging {} → {}", manifest.display(), output_dir.display());
    let report = tokio::task::spawn_blocking(move || {
        relay_sync::merge_local(&manifest, &chunks_dir, &output_dir)
    })
    .await
    .context("merge task failed")?
    .context("merge run failed")?;

    for r in report.merged() {
        println!("  ✓ {} ({}, {} chunks)", r.output.display(), HumanBytes(r.bytes), r.chunks);
    }
    let mut failed = 0;
    for (base, outcome) in &report.groups {
        if let relay_sync::GroupOutcome::NotMerged(err) = outcome {
            println!("  ✗ {base}: {err}");
            failed += 1;
        }
    }
    if failed > 0 {
        anyhow::bail!("{failed} of {} origin(s) not merged", report.groups.len());
    }
    Ok(())
}

async fn cmd_verify(config: &RelayConfig) -> Result<()> {
    let manifest = config.paths.manifest.clone();
    let chunks_dir = config.paths.chunks_dir.clone();

    let results = tokio::task::spawn_blocking(move || relay_sync::verify_local(&manifest, &chunks_dir))
        .await
        .context("verify task failed")?
        .context("verify run failed")?;

    let mut bad = 0;
    for (entry, result) in &results {
        match result {
            VerificationResult::Verified => println!("{}: OK", entry.filename()),
            other => {
                bad += 1;
                println!("{}: FAILED ({other})", entry.filename());
            }
        }
    }
    if bad > 0 {
        anyhow::bail!("{bad} of {} chunk(s) did not verify", results.len());
    }
    Ok(())
}

// ── `chunkrelay health` ───────────────────────────────────────────────────────

async fn cmd_health(config: &RelayConfig) -> Result<()> {
    let store = open_store(config)?;
    check_health(store.as_ref())
        .await
        .with_context(|| format!("remote {} is not healthy", config.remote.endpoint))?;
    println!("remote OK: {} (folder: {})", config.remote.endpoint, config.remote.folder);
    Ok(())
}

// ── `chunkrelay config show` ──────────────────────────────────────────────────

fn cmd_config_show(config: &RelayConfig, config_path: &Path) -> Result<()> {
    if config_path.exists() {
        println!("# Configuration from: {}", config_path.display());
    } else {
        println!("# Configuration: defaults (no file at {})", config_path.display());
    }
    println!();
    let rendered = toml::to_string_pretty(config).context("serializing config to TOML")?;
    print!("{rendered}");
    Ok(())
}
