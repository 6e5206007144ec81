//! fx-refresh: binary entrypoint.
//! `run` drives the scheduler and serves the read API; `tick` runs once;
//! `append-snapshot` hands collector output to the snapshot store.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::Value;
use tokio::sync::watch;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use fx_refresh::metrics::Metrics;
use fx_refresh::scheduler::{spawn_scheduler, SchedulerCfg};
use fx_refresh::{api, build_analyst, AppConfig, PipelineOrchestrator, Snapshot, SnapshotStore};

#[derive(Parser, Debug)]
#[command(name = "fx-refresh", version, about = "Incremental FX data refresh pipeline")]
struct Cli {
    /// Config file (overrides FX_REFRESH_CONFIG).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Tick every interval and serve the read API until ctrl-c.
    Run,
    /// Run a single tick and print the report as JSON.
    Tick,
    /// Append a `{key: value}` JSON object as a new snapshot.
    AppendSnapshot { file: PathBuf },
}

/// `RUST_LOG` picks the filter (default `fx_refresh=info,warn`);
/// `LOG_FORMAT=json` switches to JSON lines.
fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("fx_refresh=info,warn"));
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer().compact()).init();
    }
}

fn load_config(path: Option<PathBuf>) -> anyhow::Result<AppConfig> {
    match path {
        Some(p) => AppConfig::load_from(&p),
        None => AppConfig::load_default(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env in local/dev; no-op when absent.
    let _ = dotenvy::dotenv();
    init_tracing();

    let cli = Cli::parse();
    let cfg = load_config(cli.config).context("loading configuration")?;

    match cli.command {
        Command::Run => run(cfg).await,
        Command::Tick => {
            let analyst = build_analyst(&cfg)?;
            let orchestrator = PipelineOrchestrator::new(&cfg, analyst)?;
            let report = orchestrator.tick().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::AppendSnapshot { file } => {
            let text = std::fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let data: BTreeMap<String, Value> =
                serde_json::from_str(&text).context("snapshot input must be a JSON object")?;
            let store = SnapshotStore::new(cfg.snapshot_path(), cfg.snapshot_limit);
            let keys = data.len();
            let len = store.append(Snapshot::now(data))?;
            tracing::info!(keys, retained = len, path = %store.path().display(), "snapshot appended");
            Ok(())
        }
    }
}

async fn run(cfg: AppConfig) -> anyhow::Result<()> {
    let analyst = build_analyst(&cfg)?;
    let orchestrator = Arc::new(PipelineOrchestrator::new(&cfg, analyst)?);
    let metrics = Metrics::init(cfg.interval_secs)?;

    let (stop_tx, stop_rx) = watch::channel(false);
    let scheduler = spawn_scheduler(
        orchestrator,
        SchedulerCfg {
            interval: cfg.interval(),
        },
        stop_rx,
    );

    if cfg.api.enabled {
        let app = api::router(&cfg).merge(metrics.router());
        let listener = tokio::net::TcpListener::bind(&cfg.api.bind)
            .await
            .with_context(|| format!("binding {}", cfg.api.bind))?;
        tracing::info!(bind = %cfg.api.bind, "read api listening");
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = tokio::signal::ctrl_c().await;
            })
            .await
            .context("read api server")?;
    } else {
        tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    }

    tracing::info!("shutting down, letting the current tick finish");
    let _ = stop_tx.send(true);
    scheduler.await.context("scheduler task")?;
    Ok(())
}
