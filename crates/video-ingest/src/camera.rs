//! OpenCV-backed capture, enabled with the `opencv` feature.

use chrono::Utc;
use opencv::{
    core::MatTraitConstManual,
    prelude::*,
    videoio::{self, VideoCapture, VideoCaptureTrait, VideoCaptureTraitConst},
};
use tracing::warn;

use crate::{
    source::{FrameStream, VideoSource, parse_device_index, sanitize_fps},
    types::{CaptureError, Frame, FrameFormat, StreamInfo},
};

/// Opens devices, files and network URIs through `cv::VideoCapture`.
#[derive(Clone, Debug, Default)]
pub struct OpenCvSource;

impl VideoSource for OpenCvSource {
    fn open(&self, uri: &str) -> Result<Box<dyn FrameStream>, CaptureError> {
        let cap = open_video_capture(uri)?;
        let width = cap
            .get(videoio::CAP_PROP_FRAME_WIDTH)
            .map_err(|e| CaptureError::Other(e.into()))? as i32;
        let height = cap
            .get(videoio::CAP_PROP_FRAME_HEIGHT)
            .map_err(|e| CaptureError::Other(e.into()))? as i32;
        let fps = cap
            .get(videoio::CAP_PROP_FPS)
            .map_err(|e| CaptureError::Other(e.into()))?;

        if width <= 0 || height <= 0 {
            return Err(CaptureError::InvalidGeometry {
                uri: uri.to_string(),
                width,
                height,
            });
        }

        Ok(Box::new(OpenCvStream {
            cap,
            frame: Mat::default(),
            info: StreamInfo {
                width,
                height,
                fps: sanitize_fps(fps),
            },
        }))
    }
}

struct OpenCvStream {
    cap: VideoCapture,
    frame: Mat,
    info: StreamInfo,
}

impl FrameStream for OpenCvStream {
    fn info(&self) -> StreamInfo {
        self.info
    }

    fn read(&mut self) -> Result<Frame, CaptureError> {
        let grabbed = self
            .cap
            .read(&mut self.frame)
            .map_err(|e| CaptureError::Other(e.into()))?;
        if !grabbed {
            return Err(CaptureError::EndOfStream);
        }

        let size = self
            .frame
            .size()
            .map_err(|e| CaptureError::Other(e.into()))?;
        if size.width <= 0 || size.height <= 0 {
            return Err(CaptureError::EndOfStream);
        }

        let data = self
            .frame
            .data_bytes()
            .map_err(|e| CaptureError::Other(e.into()))?
            .to_vec();

        Ok(Frame {
            data,
            width: size.width,
            height: size.height,
            timestamp_ms: Utc::now().timestamp_millis(),
            format: FrameFormat::Bgr8,
        })
    }
}

impl Drop for OpenCvStream {
    fn drop(&mut self) {
        let _ = self.cap.release();
    }
}

/// Attempt to open a camera input either by index or URI.
fn open_video_capture(uri: &str) -> Result<VideoCapture, CaptureError> {
    if let Some(index) = parse_device_index(uri) {
        for backend in [videoio::CAP_V4L, videoio::CAP_ANY] {
            match VideoCapture::new(index, backend) {
                Ok(cap) => {
                    if cap.is_opened().map_err(|e| CaptureError::Other(e.into()))? {
                        return Ok(cap);
                    }
                }
                Err(err) => {
                    warn!("video-ingest: failed to open device #{index} with backend {backend}: {err}");
                }
            }
        }
    }

    for backend in [videoio::CAP_FFMPEG, videoio::CAP_ANY] {
        match VideoCapture::from_file(uri, backend) {
            Ok(cap) => {
                if cap.is_opened().map_err(|e| CaptureError::Other(e.into()))? {
                    return Ok(cap);
                }
            }
            Err(err) => {
                warn!("video-ingest: failed to open {uri} with backend {backend}: {err}");
            }
        }
    }

    Err(CaptureError::Open {
        uri: uri.to_string(),
    })
}
