//! First-order speed estimate from two consecutive track samples.
//!
//! The estimate assumes the two samples are exactly one frame interval apart.
//! When the detector drops a frame in between, the displacement spans two
//! intervals and the result overstates the speed by that factor.

use crate::history::Point;

/// Sampling rate used when the source does not report one.
pub const DEFAULT_FPS: f64 = 25.0;
const MPS_TO_KMH: f64 = 3.6;

/// Converts pixel displacement into km/h for one camera.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SpeedEstimator {
    fps: f64,
    pixel_to_distance: f64,
}

impl SpeedEstimator {
    /// The reported rate is truncated to whole frames per second. Missing,
    /// non-finite or sub-1 rates fall back to [`DEFAULT_FPS`].
    pub fn new(fps: Option<f64>, pixel_to_distance: f64) -> Self {
        let fps = match fps.map(f64::trunc) {
            Some(fps) if fps.is_finite() && fps > 0.0 => fps,
            _ => DEFAULT_FPS,
        };
        Self {
            fps,
            pixel_to_distance,
        }
    }

    pub fn fps(&self) -> f64 {
        self.fps
    }

    pub fn estimate(&self, prev: Point, curr: Point) -> f64 {
        let dx = (curr.x - prev.x) as f64;
        let dy = (curr.y - prev.y) as f64;
        let pixels = dx.hypot(dy);
        pixels * self.pixel_to_distance * self.fps * MPS_TO_KMH
    }
}
