//! Camera records and worker tuning knobs.

use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default calibration line position as a ratio of the frame height.
pub const DEFAULT_LINE_RATIO: f64 = 0.5;
/// Default distance units (metres) covered by one pixel.
pub const DEFAULT_PIXEL_TO_DISTANCE: f64 = 0.1;

fn default_line_ratio() -> f64 {
    DEFAULT_LINE_RATIO
}

fn default_pixel_to_distance() -> f64 {
    DEFAULT_PIXEL_TO_DISTANCE
}

/// One monitored camera. Immutable once its worker has started.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CameraConfig {
    pub camera_id: String,
    #[serde(alias = "rtsp_url")]
    pub source_uri: String,
    #[serde(
        rename = "calibration_line_position",
        alias = "line_ratio",
        default = "default_line_ratio"
    )]
    pub line_ratio: f64,
    #[serde(default = "default_pixel_to_distance")]
    pub pixel_to_distance: f64,
}

impl CameraConfig {
    pub fn new(camera_id: impl Into<String>, source_uri: impl Into<String>) -> Self {
        Self {
            camera_id: camera_id.into(),
            source_uri: source_uri.into(),
            line_ratio: DEFAULT_LINE_RATIO,
            pixel_to_distance: DEFAULT_PIXEL_TO_DISTANCE,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.camera_id.trim().is_empty() {
            return Err(ConfigError::MissingField("camera_id"));
        }
        if self.source_uri.trim().is_empty() {
            return Err(ConfigError::MissingField("source_uri"));
        }
        if !(0.0..=1.0).contains(&self.line_ratio) {
            return Err(ConfigError::LineRatio {
                camera_id: self.camera_id.clone(),
                value: self.line_ratio,
            });
        }
        if !self.pixel_to_distance.is_finite() || self.pixel_to_distance <= 0.0 {
            return Err(ConfigError::PixelToDistance {
                camera_id: self.camera_id.clone(),
                value: self.pixel_to_distance,
            });
        }
        Ok(())
    }
}

/// Parse and validate a JSON array of camera records.
pub fn parse_cameras(json: &str) -> Result<Vec<CameraConfig>, ConfigError> {
    let cameras: Vec<CameraConfig> = serde_json::from_str(json)?;
    for camera in &cameras {
        camera.validate()?;
    }
    Ok(cameras)
}

/// Load camera records from a JSON file.
pub fn load_cameras(path: &Path) -> Result<Vec<CameraConfig>, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_cameras(&text)
}

/// Which outputs a worker produces. Replaces the per-variant processing loops.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Capabilities {
    pub record_stats: bool,
    pub publish_frames: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            record_stats: true,
            publish_frames: true,
        }
    }
}

/// Timing and encoding options shared by every worker.
#[derive(Clone, Debug)]
pub struct WorkerOptions {
    pub capabilities: Capabilities,
    /// Sleep after a failed open before retrying.
    pub connect_backoff: Duration,
    /// Sleep after a dropped stream before reconnecting.
    pub reconnect_delay: Duration,
    /// Drop tracks not seen for this long; `None` keeps them forever.
    pub track_idle_timeout: Option<Duration>,
    pub jpeg_quality: u8,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            capabilities: Capabilities::default(),
            connect_backoff: Duration::from_secs(10),
            reconnect_delay: Duration::from_secs(2),
            track_idle_timeout: Some(Duration::from_secs(10)),
            jpeg_quality: 80,
        }
    }
}
