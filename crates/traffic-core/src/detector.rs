//! Object detection and tracking seam.
//!
//! The pipeline never runs a model itself. Each camera worker owns one
//! [`ObjectTracker`] session, created by a [`TrackerFactory`], and calls it
//! once per frame. Track ids persist across calls inside a session.

use std::{sync::Arc, time::Duration};

use serde::Deserialize;
use tracing::debug;
use video_ingest::Frame;

use crate::{annotation::encode_jpeg, config::CameraConfig, error::TrackerError, history::Point};

/// One tracked box returned for a frame.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct TrackedObject {
    /// Centre-based `[x, y, w, h]` in frame pixels.
    #[serde(rename = "bbox")]
    pub bbox_xywh: [f32; 4],
    /// `None` when the tracker has no active track for this box.
    #[serde(default)]
    pub track_id: Option<i64>,
    pub class_id: i64,
    #[serde(default)]
    pub score: f32,
}

impl TrackedObject {
    /// Box centre in whole pixels, truncated toward zero.
    pub fn center(&self) -> Point {
        Point::new(self.bbox_xywh[0] as i32, self.bbox_xywh[1] as i32)
    }

    /// Corner form `[left, top, right, bottom]`.
    pub fn corners(&self) -> [f32; 4] {
        let [cx, cy, w, h] = self.bbox_xywh;
        [cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0]
    }
}

/// Stateful per-camera tracking session.
pub trait ObjectTracker: Send {
    /// Detect and track objects of `classes` in `frame`.
    fn track(&mut self, frame: &Frame, classes: &[i64]) -> Result<Vec<TrackedObject>, TrackerError>;
}

/// Builds a fresh tracker session for a camera.
pub type TrackerFactory =
    Arc<dyn Fn(&CameraConfig) -> Result<Box<dyn ObjectTracker>, TrackerError> + Send + Sync>;

const TRACKER_JPEG_QUALITY: u8 = 90;

#[derive(Deserialize)]
struct TrackResponse {
    #[serde(default)]
    detections: Vec<TrackedObject>,
}

/// Client for a remote detection + tracking service.
///
/// Frames are posted as JPEG to
/// `{endpoint}?camera={id}&persist=true&classes=2,3,5,7`; the service keeps
/// tracker state per `camera`.
pub struct HttpTracker {
    client: reqwest::blocking::Client,
    endpoint: String,
    camera_id: String,
}

impl HttpTracker {
    pub fn new(
        endpoint: impl Into<String>,
        camera_id: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, TrackerError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            camera_id: camera_id.into(),
        })
    }

    /// Factory producing one session per camera against `endpoint`.
    pub fn factory(endpoint: impl Into<String>, timeout: Duration) -> TrackerFactory {
        let endpoint = endpoint.into();
        Arc::new(
            move |camera: &CameraConfig| -> Result<Box<dyn ObjectTracker>, TrackerError> {
                let tracker =
                    HttpTracker::new(endpoint.clone(), camera.camera_id.clone(), timeout)?;
                Ok(Box::new(tracker) as Box<dyn ObjectTracker>)
            },
        )
    }
}

impl ObjectTracker for HttpTracker {
    fn track(&mut self, frame: &Frame, classes: &[i64]) -> Result<Vec<TrackedObject>, TrackerError> {
        let jpeg = encode_jpeg(frame, TRACKER_JPEG_QUALITY)
            .map_err(|err| TrackerError::Encode(err.to_string()))?;
        let classes = classes
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(",");

        let response = self
            .client
            .post(&self.endpoint)
            .query(&[
                ("camera", self.camera_id.as_str()),
                ("persist", "true"),
                ("classes", classes.as_str()),
            ])
            .header(reqwest::header::CONTENT_TYPE, "image/jpeg")
            .body(jpeg)
            .send()?;

        let status = response.status();
        if !status.is_success() {
            return Err(TrackerError::Status {
                status: status.as_u16(),
            });
        }
        let body: TrackResponse = response.json()?;
        debug!(
            camera = %self.camera_id,
            detections = body.detections.len(),
            "tracker response"
        );
        Ok(body.detections)
    }
}

/// Parse a tracker response body.
pub fn parse_detections(json: &str) -> Result<Vec<TrackedObject>, serde_json::Error> {
    serde_json::from_str::<TrackResponse>(json).map(|body| body.detections)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_service_payload() {
        let json = r#"{"detections": [
            {"bbox": [320.0, 260.0, 80.0, 40.0], "track_id": 4, "class_id": 2, "score": 0.91},
            {"bbox": [100.4, 99.6, 10.0, 10.0], "track_id": null, "class_id": 7, "score": 0.4}
        ]}"#;
        let detections = parse_detections(json).unwrap();
        assert_eq!(detections.len(), 2);
        assert_eq!(detections[0].track_id, Some(4));
        assert_eq!(detections[0].center(), Point::new(320, 260));
        assert_eq!(detections[1].track_id, None);
        assert_eq!(detections[1].center(), Point::new(100, 99));
    }

    #[test]
    fn empty_payload_has_no_detections() {
        assert!(parse_detections("{}").unwrap().is_empty());
    }

    #[test]
    fn corners_from_centre_box() {
        let object = TrackedObject {
            bbox_xywh: [50.0, 40.0, 20.0, 10.0],
            track_id: Some(1),
            class_id: 2,
            score: 1.0,
        };
        assert_eq!(object.corners(), [40.0, 35.0, 60.0, 45.0]);
    }
}
