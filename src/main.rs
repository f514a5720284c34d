//! Main application entry point (CLI binary).
//!
//! This is a thin wrapper around the `parcel_records` library that handles:
//! - Command-line argument parsing
//! - Environment variable loading (.env file)
//! - Logger initialization
//! - User-facing output formatting
//!
//! All core functionality is implemented in the library crate.

use std::collections::HashSet;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use parcel_records::config::{DB_PATH, DEFAULT_POOL_ACQUIRE_TIMEOUT};
use parcel_records::initialization::init_logger_with;
use parcel_records::status_server::{start_status_server, StatusState};
use parcel_records::{
    DataSource, EngineConfig, JobId, JobOutcome, JobStatus, LogFormat, LogLevel, Priority,
    PropertyEngine, SearchCriteria, StorageManager,
};

/// Collects and searches county property records.
#[derive(Debug, Parser)]
#[command(name = "parcel-records", version, about)]
struct Opt {
    #[command(flatten)]
    global: GlobalOpts,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Args)]
struct GlobalOpts {
    /// SQLite database path
    #[arg(long, env = "PARCEL_DB_PATH", default_value = DB_PATH, global = true)]
    db_path: PathBuf,

    /// Log level: error|warn|info|debug|trace
    #[arg(long, value_enum, default_value = "info", global = true)]
    log_level: LogLevel,

    /// Log format: plain|json
    #[arg(long, value_enum, default_value = "plain", global = true)]
    log_format: LogFormat,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Search stored records (never contacts a remote source)
    Search(SearchOpts),
    /// Collect records for one or more APNs and wait for the result
    Collect(CollectOpts),
    /// Run the engine with the status server until interrupted
    Serve(EngineOpts),
}

#[derive(Debug, Args)]
struct SearchOpts {
    #[arg(long)]
    apn: Option<String>,

    /// Case-insensitive owner name fragment
    #[arg(long)]
    owner: Option<String>,

    /// Case-insensitive situs address fragment
    #[arg(long)]
    address: Option<String>,

    #[arg(long)]
    limit: Option<u32>,
}

#[derive(Debug, Args)]
struct CollectOpts {
    /// APNs to collect
    #[arg(required = true)]
    apns: Vec<String>,

    #[arg(long, value_enum, default_value = "normal")]
    priority: Priority,

    #[command(flatten)]
    engine: EngineOpts,
}

#[derive(Debug, Args)]
struct EngineOpts {
    /// Base URL of the remote records service
    #[arg(long, env = "PARCEL_API_URL")]
    api_url: Option<String>,

    /// Bearer token for the remote records service
    #[arg(long, env = "PARCEL_API_TOKEN", hide_env_values = true)]
    api_token: Option<String>,

    /// Remote requests per second (0 disables throttling)
    #[arg(long)]
    rate_limit_rps: Option<u32>,

    /// Concurrent collection workers
    #[arg(long)]
    workers: Option<usize>,

    /// Enabled sources, in chain order
    #[arg(long, value_enum, value_delimiter = ',')]
    sources: Vec<DataSource>,

    /// Public parcel page template containing `{apn}`
    #[arg(long, env = "PARCEL_SCRAPE_URL")]
    scrape_url: Option<String>,

    /// Chrome/Chromium executable for the browser source
    #[arg(long, env = "CHROME_EXECUTABLE")]
    chrome_executable: Option<PathBuf>,

    /// Per-job timeout in seconds
    #[arg(long)]
    job_timeout_secs: Option<u64>,

    /// Port for the HTTP status server
    #[arg(long, env = "PARCEL_STATUS_PORT")]
    status_port: Option<u16>,
}

impl EngineOpts {
    fn into_config(self, db_path: PathBuf) -> EngineConfig {
        let mut config = EngineConfig {
            db_path,
            ..Default::default()
        };
        if let Some(url) = self.api_url {
            config.remote.base_url = url;
        }
        if let Some(token) = self.api_token {
            config.remote.api_token = token;
        }
        if let Some(rps) = self.rate_limit_rps {
            config.rate_limit_rps = rps;
        }
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if !self.sources.is_empty() {
            config.sources = self.sources;
        }
        if let Some(template) = self.scrape_url {
            config.scrape.url_template = template;
        }
        config.scrape.chrome_executable = self.chrome_executable;
        if let Some(secs) = self.job_timeout_secs {
            config.job_timeout = Duration::from_secs(secs);
        }
        config.status_port = self.status_port;
        config
    }
}

fn load_dotenv() {
    // Try the current directory first, then next to the executable
    if dotenvy::dotenv().is_err() {
        if let Ok(exe_path) = std::env::current_exe() {
            if let Some(exe_dir) = exe_path.parent() {
                let env_path = exe_dir.join(".env");
                if env_path.exists() {
                    let _ = dotenvy::from_path(&env_path);
                }
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    load_dotenv();

    let opt = Opt::parse();
    let GlobalOpts {
        db_path,
        log_level,
        log_format,
    } = opt.global;
    init_logger_with(log_level.into(), log_format).context("Failed to initialize logger")?;

    let result = match opt.command {
        Command::Search(search) => run_search(db_path, search).await,
        Command::Collect(collect) => run_collect(db_path, collect).await,
        Command::Serve(engine) => run_serve(db_path, engine).await,
    };

    match result {
        Ok(true) => Ok(()),
        Ok(false) => process::exit(2),
        Err(e) => {
            eprintln!("parcel-records error: {:#}", e);
            process::exit(1);
        }
    }
}

/// Reads the store directly so a search works without remote credentials.
async fn run_search(db_path: PathBuf, opts: SearchOpts) -> Result<bool> {
    let criteria = SearchCriteria {
        apn: opts.apn,
        owner_contains: opts.owner,
        address_contains: opts.address,
        limit: opts.limit,
    };
    let storage = StorageManager::open(&db_path, 2, DEFAULT_POOL_ACQUIRE_TIMEOUT)
        .await
        .with_context(|| format!("Failed to open {}", db_path.display()))?;
    let records = storage.search(&criteria).await?;
    storage.close().await;

    println!("{}", serde_json::to_string_pretty(&records)?);
    eprintln!(
        "{} record{} found",
        records.len(),
        if records.len() == 1 { "" } else { "s" }
    );
    Ok(true)
}

/// Submits every APN and waits for each job to finish. Returns false when
/// any job failed or was cancelled.
async fn run_collect(db_path: PathBuf, opts: CollectOpts) -> Result<bool> {
    let config = opts.engine.into_config(db_path);
    let status_port = config.status_port;
    let engine = Arc::new(
        PropertyEngine::start(config)
            .await
            .context("Failed to start engine")?,
    );
    if let Some(port) = status_port {
        spawn_status_server(port, Arc::clone(&engine));
    }

    let mut events = engine.subscribe();
    let mut pending = HashSet::new();
    for apn in &opts.apns {
        let id = engine.submit_collection(apn, opts.priority)?;
        // a duplicate APN on the command line reports through its target job
        let id = match engine.get_status(id) {
            Some(JobStatus::Deduplicated { into }) => into,
            _ => id,
        };
        pending.insert(id);
    }

    let mut all_ok = true;
    // jobs may finish before the receiver sees them; check stored status too
    pending.retain(|id| match engine.get_status(*id) {
        Some(status) if status.is_finished() => {
            all_ok &= report_status(*id, &status);
            false
        }
        _ => true,
    });

    while !pending.is_empty() {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                log::warn!("Missed {skipped} completion events; re-reading job status");
                pending.retain(|id| match engine.get_status(*id) {
                    Some(status) if status.is_finished() => {
                        all_ok &= report_status(*id, &status);
                        false
                    }
                    _ => true,
                });
                continue;
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        };
        if !pending.remove(&event.job_id) {
            continue;
        }
        match &event.outcome {
            JobOutcome::Completed { summary } => {
                println!(
                    "✅ {} ({}): {:?}, {} kind(s) from {}",
                    event.apn,
                    event.job_id,
                    summary.outcome,
                    summary.collected.len(),
                    summary
                        .sources
                        .iter()
                        .map(ToString::to_string)
                        .collect::<Vec<_>>()
                        .join(", ")
                );
                for error in &summary.errors {
                    println!("   ⚠️ {error}");
                }
            }
            JobOutcome::Failed { error } => {
                all_ok = false;
                println!("❌ {} ({}): {error}", event.apn, event.job_id);
            }
            JobOutcome::Cancelled => {
                all_ok = false;
                println!("❌ {} ({}): cancelled", event.apn, event.job_id);
            }
        }
    }

    engine.shutdown().await;
    Ok(all_ok)
}

fn report_status(id: JobId, status: &JobStatus) -> bool {
    match status {
        JobStatus::Completed { outcome } => {
            println!("✅ {id}: {outcome:?}");
            true
        }
        other => {
            println!("❌ {id}: {other:?}");
            false
        }
    }
}

async fn run_serve(db_path: PathBuf, opts: EngineOpts) -> Result<bool> {
    let config = opts.into_config(db_path);
    let port = config.status_port.unwrap_or(parcel_records::config::DEFAULT_STATUS_PORT);
    let engine = Arc::new(
        PropertyEngine::start(config)
            .await
            .context("Failed to start engine")?,
    );
    spawn_status_server(port, Arc::clone(&engine));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    log::info!("Interrupted; shutting down");
    engine.shutdown().await;
    Ok(true)
}

fn spawn_status_server(port: u16, engine: Arc<PropertyEngine>) {
    let state = StatusState::new(engine);
    tokio::spawn(async move {
        if let Err(e) = start_status_server(port, state).await {
            log::error!("Status server stopped: {e:#}");
        }
    });
}
