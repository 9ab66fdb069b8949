//! Command-line surface and its translation into a validated [`AppConfig`].

use std::{net::SocketAddr, path::PathBuf, time::Duration};

use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};
use traffic_core::{Capabilities, WorkerOptions};

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
/// Backend used to open camera streams.
pub enum SourceBackend {
    /// `ffprobe` + `ffmpeg` subprocess decoding to raw BGR.
    Ffmpeg,
    /// OpenCV `VideoCapture` (requires the `opencv` feature).
    Opencv,
}

#[derive(Clone, Debug, PartialEq, Eq)]
/// Where daily aggregates live.
pub enum StoreBackend {
    Memory,
    Sqlite(String),
}

impl StoreBackend {
    fn parse(url: &str) -> Result<Self> {
        match url {
            "memory" | "mem" => Ok(StoreBackend::Memory),
            url if url.starts_with("sqlite:") => Ok(StoreBackend::Sqlite(url.to_string())),
            other => bail!("unsupported database URL {other:?}; expected `memory` or `sqlite:...`"),
        }
    }
}

/// Multi-camera traffic counter with a live MJPEG preview.
#[derive(Debug, Parser)]
#[command(name = "traffic-monitor", version, about)]
pub struct Cli {
    /// JSON file holding the camera list.
    #[arg(long, env = "CAMERAS_FILE", value_name = "PATH")]
    pub cameras: PathBuf,
    /// `sqlite://path.db`, `sqlite::memory:` or `memory`.
    #[arg(long, env = "DATABASE_URL", default_value = "sqlite://traffic.db")]
    pub database_url: String,
    /// Endpoint of the detection and tracking service.
    #[arg(long, env = "TRACKER_URL", value_name = "URL")]
    pub tracker_url: String,
    /// Per-request timeout for the tracker in milliseconds.
    #[arg(long, default_value_t = 5_000)]
    pub tracker_timeout_ms: u64,
    /// Address the HTTP server binds to.
    #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0:5000")]
    pub bind: SocketAddr,
    #[arg(long, value_enum, default_value_t = SourceBackend::Ffmpeg)]
    pub source_backend: SourceBackend,
    /// Seconds to wait after a failed open.
    #[arg(long, default_value_t = 10)]
    pub connect_backoff_secs: u64,
    /// Seconds to wait after a dropped stream.
    #[arg(long, default_value_t = 2)]
    pub reconnect_delay_secs: u64,
    /// Forget tracks unseen for this many seconds (0 keeps them forever).
    #[arg(long, default_value_t = 10)]
    pub track_idle_secs: u64,
    /// Cadence of the MJPEG stream in milliseconds.
    #[arg(long, default_value_t = 40)]
    pub stream_interval_ms: u64,
    /// JPEG quality for published frames (1-100).
    #[arg(long, default_value_t = 80)]
    pub jpeg_quality: u8,
    /// Do not record crossing statistics.
    #[arg(long = "no-stats", action = clap::ArgAction::SetTrue)]
    pub no_stats: bool,
    /// Do not publish annotated frames.
    #[arg(long = "no-stream", action = clap::ArgAction::SetTrue)]
    pub no_stream: bool,
    /// Decode with NVDEC through ffmpeg.
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub nvdec: bool,
    /// Debug-level logging unless `RUST_LOG` says otherwise.
    #[arg(long, short, action = clap::ArgAction::SetTrue)]
    pub verbose: bool,
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub cameras_path: PathBuf,
    pub store: StoreBackend,
    pub tracker_url: String,
    pub tracker_timeout: Duration,
    pub bind: SocketAddr,
    pub source_backend: SourceBackend,
    pub use_nvdec: bool,
    pub stream_interval: Duration,
    pub worker: WorkerOptions,
    pub verbose: bool,
}

impl TryFrom<Cli> for AppConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self> {
        if !(1..=100).contains(&cli.jpeg_quality) {
            bail!("--jpeg-quality must be an integer between 1 and 100");
        }
        if cli.stream_interval_ms == 0 {
            bail!("--stream-interval-ms must be at least 1");
        }
        if cli.tracker_url.trim().is_empty() {
            bail!("--tracker-url must not be empty");
        }
        if cli.no_stats && cli.no_stream {
            bail!("--no-stats and --no-stream together leave nothing to do");
        }
        if cli.source_backend == SourceBackend::Opencv && !cfg!(feature = "opencv") {
            bail!("--source-backend opencv requires building with the `opencv` feature");
        }
        let store = StoreBackend::parse(&cli.database_url)
            .with_context(|| format!("invalid --database-url {:?}", cli.database_url))?;

        let worker = WorkerOptions {
            capabilities: Capabilities {
                record_stats: !cli.no_stats,
                publish_frames: !cli.no_stream,
            },
            connect_backoff: Duration::from_secs(cli.connect_backoff_secs),
            reconnect_delay: Duration::from_secs(cli.reconnect_delay_secs),
            track_idle_timeout: (cli.track_idle_secs > 0)
                .then(|| Duration::from_secs(cli.track_idle_secs)),
            jpeg_quality: cli.jpeg_quality,
        };

        Ok(Self {
            cameras_path: cli.cameras,
            store,
            tracker_url: cli.tracker_url,
            tracker_timeout: Duration::from_millis(cli.tracker_timeout_ms),
            bind: cli.bind,
            source_backend: cli.source_backend,
            use_nvdec: cli.nvdec,
            stream_interval: Duration::from_millis(cli.stream_interval_ms),
            worker,
            verbose: cli.verbose,
        })
    }
}
