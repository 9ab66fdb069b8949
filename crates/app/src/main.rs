mod cli;
mod server;
mod telemetry;

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use traffic_core::{
    AggregateStore, FrameBroadcaster, HttpTracker, MemoryStore, SqliteStore, StatsAggregator,
    WorkerContext, WorkerSupervisor, load_cameras,
};
use video_ingest::VideoSource;

use crate::{
    cli::{AppConfig, Cli, SourceBackend, StoreBackend},
    server::{ServerState, spawn_api_server},
};

const STATUS_LOG_INTERVAL: Duration = Duration::from_secs(60);
const MONITOR_POLL: Duration = Duration::from_secs(1);
const STALE_STREAM_AFTER: Duration = Duration::from_secs(10);

fn main() {
    if let Err(err) = run() {
        eprintln!("{err:?}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let config = AppConfig::try_from(Cli::parse())?;
    telemetry::init_tracing(config.verbose)?;
    telemetry::init_metrics_recorder()?;

    let cameras = load_cameras(&config.cameras_path)
        .with_context(|| format!("failed to load cameras from {}", config.cameras_path.display()))?;
    info!("loaded {} camera(s)", cameras.len());

    let store: Arc<dyn AggregateStore> = match &config.store {
        StoreBackend::Memory => {
            warn!("using the in-memory store; statistics are lost on exit");
            Arc::new(MemoryStore::new())
        }
        StoreBackend::Sqlite(url) => Arc::new(
            SqliteStore::connect(url).with_context(|| format!("failed to open store {url}"))?,
        ),
    };
    let stats = Arc::new(StatsAggregator::new(store));
    let broadcaster = Arc::new(FrameBroadcaster::new());

    let context = WorkerContext {
        source: video_source(&config)?,
        trackers: HttpTracker::factory(config.tracker_url.clone(), config.tracker_timeout),
        stats: stats.clone(),
        broadcaster: broadcaster.clone(),
        options: config.worker.clone(),
    };
    let supervisor = Arc::new(WorkerSupervisor::new(context));
    let started = supervisor.start_all(&cameras)?;
    supervisor
        .spawn_monitor(MONITOR_POLL, STALE_STREAM_AFTER)
        .context("failed to spawn worker monitor")?;
    info!("started {started} camera worker(s)");

    let server = spawn_api_server(
        config.bind,
        ServerState {
            cameras: Arc::new(cameras),
            supervisor: supervisor.clone(),
            stats,
            broadcaster,
            stream_interval: config.stream_interval,
        },
    )?;

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = shutdown.clone();
        if let Err(err) = ctrlc::set_handler(move || {
            shutdown.store(true, Ordering::SeqCst);
        }) {
            warn!("Failed to install Ctrl+C handler: {err}");
        }
    }

    let mut last_status = Instant::now();
    while !shutdown.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(200));
        if last_status.elapsed() >= STATUS_LOG_INTERVAL {
            last_status = Instant::now();
            let active = supervisor.active_count();
            metrics::gauge!("traffic_active_workers").set(active as f64);
            info!("{active} camera worker(s) active");
        }
    }

    info!("shutting down");
    server.stop();
    supervisor.stop_all();
    Ok(())
}

fn video_source(config: &AppConfig) -> Result<Arc<dyn VideoSource>> {
    match config.source_backend {
        SourceBackend::Ffmpeg => Ok(Arc::new(video_ingest::FfmpegSource::new(config.use_nvdec))),
        #[cfg(feature = "opencv")]
        SourceBackend::Opencv => Ok(Arc::new(video_ingest::OpenCvSource)),
        #[cfg(not(feature = "opencv"))]
        SourceBackend::Opencv => {
            anyhow::bail!("--source-backend opencv requires building with the `opencv` feature")
        }
    }
}
