use anyhow::Error;
use thiserror::Error;

/// Raw BGR frame read from a video source.
#[derive(Clone)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: i32,
    pub height: i32,
    pub timestamp_ms: i64,
    pub format: FrameFormat,
}

impl Frame {
    /// Number of bytes a packed frame of the given geometry occupies.
    pub fn expected_len(width: i32, height: i32, format: FrameFormat) -> usize {
        (width.max(0) as usize) * (height.max(0) as usize) * format.bytes_per_pixel()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameFormat {
    Bgr8,
}

impl FrameFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            FrameFormat::Bgr8 => 3,
        }
    }
}

/// Geometry and sampling rate reported by a source when it is opened.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StreamInfo {
    pub width: i32,
    pub height: i32,
    /// Frames per second as reported by the source; `None` when unknown.
    pub fps: Option<f64>,
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to open video source {uri:?}")]
    Open { uri: String },
    #[error("video source {uri:?} reported an invalid geometry {width}x{height}")]
    InvalidGeometry { uri: String, width: i32, height: i32 },
    #[error("end of stream")]
    EndOfStream,
    #[error(transparent)]
    Other(#[from] Error),
}
