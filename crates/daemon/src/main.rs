use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use dbsnap_core::{BackupType, Catalog, RestoreMode};
use dbsnap_daemon::config::{self, Config};
use dbsnap_daemon::{build_router, AppState, DEFAULT_MAX_UPLOAD_BYTES};
use dbsnap_pipeline::{PipelineOptions, SnapshotService};
use dbsnap_storage::{open_metadata_store, open_object_store, open_relational_store};
use tokio::sync::Mutex;
use tokio::time::{sleep, Duration};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

enum Mode {
    Serve,
    RunOnce,
    Restore { file: PathBuf, mode: RestoreMode },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let (cfg, mode) = parse_args()?;

    let root = env::var("DBSNAP_ROOT")
        .ok()
        .or_else(|| cfg.storage.root.clone())
        .unwrap_or_else(|| "./data".to_owned());

    let listen = env::var("DBSNAP_LISTEN")
        .ok()
        .or_else(|| cfg.server.listen.clone())
        .unwrap_or_else(|| "127.0.0.1:8088".to_owned());

    let source_url = env::var("DATABASE_URL")
        .ok()
        .or_else(|| cfg.source.database_url.clone())
        .context("no source database configured (DATABASE_URL or [source] database_url)")?;

    let metadata_url = env::var("DBSNAP_METADATA_URL")
        .ok()
        .or_else(|| cfg.storage.metadata_url.clone());

    let root = PathBuf::from(root);
    let catalog = Catalog::shipped().context("invalid table catalog")?;
    let service = SnapshotService::new(
        Arc::new(catalog),
        open_relational_store(&source_url).await?,
        open_object_store(&root)?,
        open_metadata_store(&root, metadata_url.as_deref()).await?,
        pipeline_options(&cfg),
    );

    match mode {
        Mode::RunOnce => run_once(service).await,
        Mode::Restore { file, mode } => restore_file(service, file, mode).await,
        Mode::Serve => run_service(service, &listen, &cfg).await,
    }
}

/// Parse CLI args, returning the loaded config and the requested mode.
fn parse_args() -> Result<(Config, Mode)> {
    let args: Vec<String> = env::args().collect();
    let mut config_path: Option<PathBuf> = None;
    let mut positional = Vec::new();
    let mut merge = false;
    let mut i = 1;

    while i < args.len() {
        match args[i].as_str() {
            "--config" => {
                i += 1;
                if i >= args.len() {
                    bail!("--config requires a path argument");
                }
                config_path = Some(PathBuf::from(&args[i]));
            }
            "--merge" => merge = true,
            other => positional.push(other.to_owned()),
        }
        i += 1;
    }

    let mode = match positional.first().map(String::as_str) {
        None | Some("serve") => Mode::Serve,
        Some("run-once") => Mode::RunOnce,
        Some("restore") => {
            let Some(file) = positional.get(1) else {
                bail!("restore requires a snapshot file argument");
            };
            Mode::Restore {
                file: PathBuf::from(file),
                mode: if merge {
                    RestoreMode::Merge
                } else {
                    RestoreMode::Replace
                },
            }
        }
        Some(other) => bail!("unknown mode: {other}"),
    };

    let cfg = match config_path {
        Some(path) => {
            info!(?path, "loading config file");
            config::load_config(&path)?
        }
        None => Config::default(),
    };

    Ok((cfg, mode))
}

fn env_override<T: FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|v| v.parse::<T>().ok())
}

fn pipeline_options(cfg: &Config) -> PipelineOptions {
    let defaults = PipelineOptions::default();
    PipelineOptions {
        page_size: env_override("DBSNAP_PAGE_SIZE")
            .or(cfg.backup.page_size)
            .unwrap_or(defaults.page_size),
        batch_size: env_override("DBSNAP_BATCH_SIZE")
            .or(cfg.backup.batch_size)
            .unwrap_or(defaults.batch_size),
        retention_count: env_override("DBSNAP_RETENTION_COUNT")
            .or(cfg.backup.retention_count)
            .unwrap_or(defaults.retention_count),
        require_owner: env_override("DBSNAP_REQUIRE_OWNER")
            .or(cfg.backup.require_owner)
            .unwrap_or(defaults.require_owner),
    }
}

async fn run_once(service: SnapshotService) -> Result<()> {
    let outcome = service.run_backup(BackupType::Auto, None).await?;
    info!(backup_id = %outcome.id, path = %outcome.storage_path, "backup created");
    Ok(())
}

async fn restore_file(service: SnapshotService, file: PathBuf, mode: RestoreMode) -> Result<()> {
    let bytes = std::fs::read(&file)
        .with_context(|| format!("reading snapshot {}", file.display()))?;
    let report = service.run_restore(&bytes, mode).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    if report.has_errors() {
        bail!("{} table(s) failed to restore", report.errors.len());
    }
    Ok(())
}

async fn run_service(service: SnapshotService, listen: &str, cfg: &Config) -> Result<()> {
    let state = AppState {
        service: service.clone(),
        restore_gate: Arc::new(Mutex::new(())),
        api_token: env::var("DBSNAP_API_TOKEN")
            .ok()
            .or_else(|| cfg.security.api_token.clone()),
        max_upload_bytes: env_override("DBSNAP_MAX_UPLOAD_BYTES")
            .or(cfg.backup.max_upload_bytes)
            .unwrap_or(DEFAULT_MAX_UPLOAD_BYTES),
    };

    let interval_hours = env_override("DBSNAP_INTERVAL_HOURS")
        .or(cfg.backup.interval_hours)
        .unwrap_or(24u64)
        .max(1);

    match service.sweep_dangling_entries().await {
        Ok(removed) if removed > 0 => info!(removed, "startup sweep removed dangling history"),
        Ok(_) => {}
        Err(e) => warn!(error = %format!("{e:#}"), "startup sweep failed"),
    }

    tokio::spawn(scheduler_loop(service, interval_hours));

    let addr: SocketAddr = listen
        .parse()
        .with_context(|| format!("invalid listen address: {listen}"))?;
    let app = build_router(state);

    info!(%addr, "starting daemon API server");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn scheduler_loop(service: SnapshotService, interval_hours: u64) {
    let period = Duration::from_secs(interval_hours * 3600);
    loop {
        sleep(period).await;

        // run_backup enforces retention for automatic backups.
        match service.run_backup(BackupType::Auto, None).await {
            Ok(outcome) => info!(backup_id = %outcome.id, "scheduled backup created"),
            Err(e) => error!(error = %e, "scheduled backup failed"),
        }
    }
}
