//! Source abstraction shared by every capture backend.

use crate::types::{CaptureError, Frame, StreamInfo};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// Ingress transport inferred from a source URI.
pub enum SourceKind {
    /// Local V4L devices or pre-recorded files.
    Device,
    /// Real-time streaming protocol feeds.
    Rtsp,
    /// HTTP(S) streams such as HLS playlists or MJPEG endpoints.
    Http,
}

impl SourceKind {
    /// Infer the transport kind from a URI.
    pub fn from_uri(uri: &str) -> Self {
        if uri.starts_with("rtsp://") || uri.starts_with("rtsps://") {
            SourceKind::Rtsp
        } else if uri.starts_with("http://") || uri.starts_with("https://") {
            SourceKind::Http
        } else {
            SourceKind::Device
        }
    }
}

/// An opened stream. Dropping it releases the underlying capture resource.
pub trait FrameStream: Send {
    /// Geometry and fps measured when the stream was opened.
    fn info(&self) -> StreamInfo;

    /// Block until the next frame is available.
    fn read(&mut self) -> Result<Frame, CaptureError>;
}

/// Factory able to open a [`FrameStream`] for a URI.
pub trait VideoSource: Send + Sync {
    fn open(&self, uri: &str) -> Result<Box<dyn FrameStream>, CaptureError>;
}

/// Parse a `/dev/videoX` style URI and return the zero-based index if present.
pub fn parse_device_index(uri: &str) -> Option<i32> {
    if let Ok(index) = uri.parse::<i32>() {
        return Some(index);
    }
    if let Some(stripped) = uri.strip_prefix("/dev/video") {
        if !stripped.is_empty() && stripped.chars().all(|c| c.is_ascii_digit()) {
            return stripped.parse::<i32>().ok();
        }
    }
    None
}

/// Replace zero, negative or non-finite fps readings with `None`.
pub fn sanitize_fps(fps: f64) -> Option<f64> {
    if fps.is_finite() && fps > 0.0 {
        Some(fps)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infers_source_kind() {
        assert_eq!(SourceKind::from_uri("rtsp://cam/1"), SourceKind::Rtsp);
        assert_eq!(SourceKind::from_uri("rtsps://cam/1"), SourceKind::Rtsp);
        assert_eq!(
            SourceKind::from_uri("https://cctv.example/live.m3u8"),
            SourceKind::Http
        );
        assert_eq!(SourceKind::from_uri("/videos/a.mp4"), SourceKind::Device);
    }

    #[test]
    fn parses_device_indices() {
        assert_eq!(parse_device_index("0"), Some(0));
        assert_eq!(parse_device_index("/dev/video2"), Some(2));
        assert_eq!(parse_device_index("/dev/video"), None);
        assert_eq!(parse_device_index("/dev/videoX"), None);
        assert_eq!(parse_device_index("rtsp://cam"), None);
    }

    #[test]
    fn zero_fps_is_unknown() {
        assert_eq!(sanitize_fps(0.0), None);
        assert_eq!(sanitize_fps(f64::NAN), None);
        assert_eq!(sanitize_fps(29.97), Some(29.97));
    }
}
