use std::path::PathBuf;

use thiserror::Error;
use video_ingest::CaptureError;

/// Failures observed by a camera worker. Only the store variant leaves the
/// connection untouched; the others abort the current stream.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("video source unavailable: {0}")]
    SourceUnavailable(#[source] CaptureError),
    #[error("stream interrupted: {0}")]
    StreamInterrupted(#[source] CaptureError),
    #[error("frame processing failed: {0}")]
    ProcessingFailure(#[source] anyhow::Error),
    #[error("aggregate write failed: {0}")]
    AggregateWriteFailure(#[source] StoreError),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("aggregate store unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error("store runtime error: {0}")]
    Runtime(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("tracker request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("tracker returned HTTP {status}")]
    Status { status: u16 },
    #[error("failed to encode frame for tracker: {0}")]
    Encode(String),
    #[error("unsupported frame: {0}")]
    Frame(String),
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("no cameras configured")]
    NoCameras,
    #[error("failed to spawn worker thread for camera {camera_id}: {source}")]
    Spawn {
        camera_id: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid camera configuration: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("camera record is missing `{0}`")]
    MissingField(&'static str),
    #[error("camera {camera_id}: calibration line position {value} is outside [0, 1]")]
    LineRatio { camera_id: String, value: f64 },
    #[error("camera {camera_id}: pixel_to_distance {value} must be a positive number")]
    PixelToDistance { camera_id: String, value: f64 },
}
