use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use mirage::api::{AppState, router};
use mirage::config::ServerConfig;
use mirage::perturb::PerturbationEngine;
use mirage::pipeline::PipelineRunner;
use mirage::store::TaskStore;
use mirage::toolchain::{FfmpegToolchain, MediaToolchain};
use mirage::worker::{self, WakeSignal};
use mirage::{logging, metrics};

#[derive(Parser, Debug)]
#[command(name = "mirage-server")]
#[command(about = "HTTP server for adversarial video protection")]
struct Params {
    /// Host interface to bind to.
    #[arg(long = "host", default_value = "127.0.0.1")]
    host: String,

    /// TCP port to listen on.
    #[arg(long = "port", default_value_t = 8000)]
    port: u16,

    /// Number of media-processing workers.
    #[arg(long = "workers", default_value_t = 3)]
    workers: usize,

    /// Server root the service directories are created under.
    #[arg(long = "root", default_value = ".")]
    root: PathBuf,

    /// Name or path of the ffmpeg binary.
    #[arg(long = "ffmpeg", default_value = "ffmpeg")]
    ffmpeg: String,

    /// Verbose logging (equivalent to MIRAGE_LOG=debug).
    #[arg(long = "debug", default_value_t = false)]
    debug: bool,
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(error = ?err, "mirage-server failed");
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let params = Params::parse();
    let default_level = if params.debug {
        tracing::level_filters::LevelFilter::DEBUG
    } else {
        tracing::level_filters::LevelFilter::INFO
    };

    let config = ServerConfig {
        root: params.root,
        host: params.host,
        port: params.port,
        workers: params.workers.clamp(1, num_cpus::get()),
        ffmpeg: params.ffmpeg,
        ..Default::default()
    };

    // Bootstrap before logging so the file layer has a directory to write to.
    config
        .bootstrap()
        .context("configuration validation failed")?;
    logging::init_with_log_dir(Some(&config.logs_dir()), default_level);

    if let Err(err) = metrics::init() {
        warn!(error = ?err, "metrics disabled (init failed)");
    }

    let toolchain: Arc<dyn MediaToolchain> = Arc::new(FfmpegToolchain::new(&config.ffmpeg));
    toolchain
        .verify()
        .context("media toolchain validation failed")?;

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .context("invalid host/port bind address")?;

    let store = Arc::new(
        TaskStore::open(config.tasks_db_path()).context("failed to open the task store")?,
    );
    let stats = store.stats();
    info!(
        total = stats.total,
        pending = stats.pending,
        "task store loaded"
    );

    // The classifier weights load once; workers share the engine read-only.
    let engine = Arc::new(PerturbationEngine::new());
    let runner = Arc::new(PipelineRunner::new(
        store.clone(),
        toolchain,
        engine,
        config.clone(),
    ));

    let wake = Arc::new(WakeSignal::new());
    worker::start(
        runner,
        store.clone(),
        wake.clone(),
        config.workers,
        config.task_timeout_hours,
        config.auto_cleanup_days,
    );

    let state = AppState {
        store,
        config: Arc::new(config),
        wake,
    };
    let app = router(state);

    let listener = TcpListener::bind(addr).await.context("bind failed")?;
    info!(%addr, "listening");
    axum::serve(listener, app).await.context("server error")?;

    Ok(())
}
