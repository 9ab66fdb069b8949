//! Video acquisition for the traffic monitor.
//!
//! Every backend implements [`VideoSource`], which opens a blocking
//! [`FrameStream`] yielding packed BGR frames. The FFmpeg backend is always
//! available; the OpenCV backend requires the `opencv` feature.

#[cfg(feature = "opencv")]
mod camera;
mod ffmpeg;
mod source;
mod types;

#[cfg(feature = "opencv")]
pub use camera::OpenCvSource;
pub use ffmpeg::FfmpegSource;
pub use source::{FrameStream, SourceKind, VideoSource, parse_device_index, sanitize_fps};
pub use types::{CaptureError, Frame, FrameFormat, StreamInfo};
