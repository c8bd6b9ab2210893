//! dispatch-replay: drive the dispatch engine from a JSON-lines script.
//!
//! Wires the store, update hub, acceptance watchdog and prune scheduler the
//! way a server process would, replays driver and passenger commands, and
//! prints every ride snapshot or live update as one JSON document per line.
//! Logs go to stderr (`RUST_LOG`, default `info`).

mod runner;
mod script;

use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use dispatch_core::clock::SystemClock;
use dispatch_core::config::{ConfigError, DispatchConfig};
use dispatch_core::geo::GeoBackend;
use dispatch_core::persistence::MemoryMirror;
use dispatch_core::service::{DispatchService, Ports};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use crate::runner::Replay;
use crate::script::{parse_script, ScriptError};

/// Replay a dispatch script against an in-process engine.
#[derive(Parser)]
#[command(name = "dispatch-replay", about = "Replay driver and passenger commands against the dispatch engine")]
struct Cli {
    /// JSON-lines script; `-` reads stdin.
    script: PathBuf,

    /// TOML config file, overridden by environment variables.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the configured geo backend (`scan` or `cell`).
    #[arg(long)]
    geo_backend: Option<String>,

    /// Skip the in-memory mirror (no audit events, no durable idempotency).
    #[arg(long)]
    no_mirror: bool,
}

#[derive(Debug, thiserror::Error)]
enum ReplayError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Script(#[from] ScriptError),

    #[error("unknown geo backend {0:?}, expected scan or cell")]
    GeoBackend(String),
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();
}

fn load_config(cli: &Cli) -> Result<DispatchConfig, ReplayError> {
    if let Err(error) = dotenvy::dotenv() {
        debug!(%error, "no .env file loaded");
    }
    let mut config = DispatchConfig::load(cli.config.as_deref())?;
    if let Some(backend) = &cli.geo_backend {
        config.geo_backend = match backend.to_ascii_lowercase().as_str() {
            "scan" => GeoBackend::Scan,
            "cell" => GeoBackend::Cell,
            other => return Err(ReplayError::GeoBackend(other.to_string())),
        };
    }
    Ok(config)
}

fn read_script(path: &Path) -> Result<Vec<script::Step>, ReplayError> {
    let steps = if path.as_os_str() == "-" {
        parse_script(io::stdin().lock())?
    } else {
        let file = File::open(path).map_err(ScriptError::Io)?;
        parse_script(BufReader::new(file))?
    };
    Ok(steps)
}

async fn run(cli: Cli) -> Result<(), ReplayError> {
    let config = load_config(&cli)?;
    let steps = read_script(&cli.script)?;
    info!(
        steps = steps.len(),
        geo_backend = ?config.geo_backend,
        radius_km = config.match_radius_km,
        window_secs = config.acceptance_window_secs,
        "starting replay"
    );

    let ports = if cli.no_mirror {
        Ports::default()
    } else {
        Ports::memory(Arc::new(MemoryMirror::with_clock(
            Arc::new(SystemClock),
            config.idempotency_ttl(),
        )))
    };
    let shutdown = CancellationToken::new();
    let (service, hub_task) = DispatchService::start(&config, ports, shutdown.clone());
    let pruner = service.spawn_pruner(config.prune_interval(), shutdown.clone());

    let mut replay = Replay::new(&service);
    let summary = replay.run(&steps).await;
    replay.finish().await;

    shutdown.cancel();
    let _ = pruner.await;
    let _ = hub_task.await;

    info!(steps = summary.steps, failed = summary.failed, "replay finished");
    println!(
        "{}",
        serde_json::json!({ "summary": summary, "telemetry": service.telemetry() })
    );
    Ok(())
}

#[tokio::main]
async fn main() {
    init_logging();
    let cli = Cli::parse();
    if let Err(error) = run(cli).await {
        tracing::error!(%error, "replay failed");
        std::process::exit(1);
    }
}
