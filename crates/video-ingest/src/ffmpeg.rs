//! FFmpeg subprocess backend.
//!
//! `ffprobe` measures the stream geometry and frame rate at open time, then an
//! `ffmpeg` child decodes the source into packed BGR24 frames on stdout. The
//! stream reads whole frames synchronously so the caller controls pacing.

use std::{
    io::{ErrorKind, Read},
    process::{Child, ChildStdout, Command, Stdio},
};

use anyhow::{Context, anyhow};
use chrono::Utc;
use tracing::{debug, warn};

use crate::{
    source::{FrameStream, SourceKind, VideoSource, parse_device_index, sanitize_fps},
    types::{CaptureError, Frame, FrameFormat, StreamInfo},
};

/// Opens sources by shelling out to `ffprobe`/`ffmpeg`.
#[derive(Clone, Debug, Default)]
pub struct FfmpegSource {
    /// Decode H.264 through NVDEC (`h264_cuvid`) instead of software.
    pub use_nvdec: bool,
}

impl FfmpegSource {
    pub fn new(use_nvdec: bool) -> Self {
        Self { use_nvdec }
    }

    fn input_uri(uri: &str) -> String {
        match parse_device_index(uri) {
            Some(index) => format!("/dev/video{index}"),
            None => uri.to_string(),
        }
    }

    fn probe(&self, uri: &str) -> Result<StreamInfo, CaptureError> {
        let input = Self::input_uri(uri);
        let mut cmd = Command::new("ffprobe");
        cmd.arg("-v").arg("error");
        if SourceKind::from_uri(uri) == SourceKind::Rtsp {
            cmd.arg("-rtsp_transport").arg("tcp");
        }
        cmd.arg("-select_streams")
            .arg("v:0")
            .arg("-show_entries")
            .arg("stream=width,height,r_frame_rate,avg_frame_rate")
            .arg("-of")
            .arg("default=noprint_wrappers=1")
            .arg(&input)
            .stdin(Stdio::null())
            .stderr(Stdio::null());

        let output = cmd.output().map_err(|err| {
            warn!("video-ingest: failed to run ffprobe for {uri}: {err}");
            CaptureError::Open {
                uri: uri.to_string(),
            }
        })?;
        if !output.status.success() {
            return Err(CaptureError::Open {
                uri: uri.to_string(),
            });
        }

        let text = String::from_utf8_lossy(&output.stdout);
        let info = parse_probe_output(&text).ok_or_else(|| CaptureError::Open {
            uri: uri.to_string(),
        })?;
        if info.width <= 0 || info.height <= 0 {
            return Err(CaptureError::InvalidGeometry {
                uri: uri.to_string(),
                width: info.width,
                height: info.height,
            });
        }
        Ok(info)
    }

    fn decoder_command(&self, uri: &str) -> Command {
        let input = Self::input_uri(uri);
        let mut cmd = Command::new("ffmpeg");
        cmd.arg("-hide_banner").arg("-loglevel").arg("error");

        if SourceKind::from_uri(uri) == SourceKind::Rtsp {
            cmd.arg("-rtsp_transport")
                .arg("tcp")
                .arg("-timeout")
                .arg("10000000")
                .arg("-fflags")
                .arg("nobuffer")
                .arg("-flags")
                .arg("low_delay");
        }

        if self.use_nvdec {
            cmd.arg("-hwaccel")
                .arg("cuda")
                .arg("-c:v")
                .arg("h264_cuvid");
        }

        cmd.arg("-i")
            .arg(&input)
            .arg("-an")
            .arg("-pix_fmt")
            .arg("bgr24")
            .arg("-f")
            .arg("rawvideo")
            .arg("-");
        cmd
    }
}

impl VideoSource for FfmpegSource {
    fn open(&self, uri: &str) -> Result<Box<dyn FrameStream>, CaptureError> {
        let info = self.probe(uri)?;
        debug!(
            "video-ingest: probed {uri}: {}x{} @ {:?} fps",
            info.width, info.height, info.fps
        );

        let mut cmd = self.decoder_command(uri);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());

        let mut child = cmd
            .spawn()
            .context("failed to spawn ffmpeg")
            .map_err(CaptureError::Other)?;
        let stdout = match child.stdout.take() {
            Some(stdout) => stdout,
            None => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(CaptureError::Other(anyhow!("failed to capture ffmpeg stdout")));
            }
        };

        let frame_bytes = Frame::expected_len(info.width, info.height, FrameFormat::Bgr8);
        Ok(Box::new(FfmpegStream {
            child,
            stdout,
            info,
            buffer: vec![0u8; frame_bytes],
        }))
    }
}

struct FfmpegStream {
    child: Child,
    stdout: ChildStdout,
    info: StreamInfo,
    buffer: Vec<u8>,
}

impl FrameStream for FfmpegStream {
    fn info(&self) -> StreamInfo {
        self.info
    }

    fn read(&mut self) -> Result<Frame, CaptureError> {
        match self.stdout.read_exact(&mut self.buffer) {
            Ok(()) => Ok(Frame {
                data: self.buffer.clone(),
                width: self.info.width,
                height: self.info.height,
                timestamp_ms: Utc::now().timestamp_millis(),
                format: FrameFormat::Bgr8,
            }),
            Err(err) if err.kind() == ErrorKind::UnexpectedEof => Err(CaptureError::EndOfStream),
            Err(err) => Err(CaptureError::Other(err.into())),
        }
    }
}

impl Drop for FfmpegStream {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Parse `key=value` lines emitted by `ffprobe -of default=noprint_wrappers=1`.
pub(crate) fn parse_probe_output(text: &str) -> Option<StreamInfo> {
    let mut width = None;
    let mut height = None;
    let mut avg_rate = None;
    let mut raw_rate = None;

    for line in text.lines() {
        let Some((key, value)) = line.trim().split_once('=') else {
            continue;
        };
        match key {
            "width" => width = value.parse::<i32>().ok(),
            "height" => height = value.parse::<i32>().ok(),
            "avg_frame_rate" => avg_rate = parse_frame_rate(value),
            "r_frame_rate" => raw_rate = parse_frame_rate(value),
            _ => {}
        }
    }

    Some(StreamInfo {
        width: width?,
        height: height?,
        fps: avg_rate.or(raw_rate),
    })
}

/// Parse an ffprobe rational such as `30000/1001` or a plain number.
pub(crate) fn parse_frame_rate(value: &str) -> Option<f64> {
    let fps = match value.split_once('/') {
        Some((num, den)) => {
            let num = num.trim().parse::<f64>().ok()?;
            let den = den.trim().parse::<f64>().ok()?;
            if den == 0.0 {
                return None;
            }
            num / den
        }
        None => value.trim().parse::<f64>().ok()?,
    };
    sanitize_fps(fps)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_probe_output() {
        let text = "width=1280\nheight=720\nr_frame_rate=25/1\navg_frame_rate=30000/1001\n";
        let info = parse_probe_output(text).unwrap();
        assert_eq!(info.width, 1280);
        assert_eq!(info.height, 720);
        assert!((info.fps.unwrap() - 29.97).abs() < 0.01);
    }

    #[test]
    fn falls_back_to_raw_frame_rate() {
        let text = "width=640\nheight=480\nr_frame_rate=15/1\navg_frame_rate=0/0\n";
        let info = parse_probe_output(text).unwrap();
        assert_eq!(info.fps, Some(15.0));
    }

    #[test]
    fn missing_geometry_is_rejected() {
        assert!(parse_probe_output("avg_frame_rate=25/1\n").is_none());
        assert!(parse_probe_output("").is_none());
    }

    #[test]
    fn frame_rate_edge_cases() {
        assert_eq!(parse_frame_rate("0/0"), None);
        assert_eq!(parse_frame_rate("N/A"), None);
        assert_eq!(parse_frame_rate("12.5"), Some(12.5));
    }

    #[test]
    fn rtsp_decoder_uses_tcp_transport() {
        let cmd = FfmpegSource::new(false).decoder_command("rtsp://cam/1");
        let args: Vec<String> = cmd
            .get_args()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect();
        assert!(args.windows(2).any(|w| w[0] == "-rtsp_transport" && w[1] == "tcp"));
        assert!(!args.iter().any(|arg| arg == "h264_cuvid"));
        assert_eq!(args.last().map(String::as_str), Some("-"));
    }
}
