//! Virtual counting line checks.

use std::collections::VecDeque;

use crate::history::Point;

/// Direction of travel relative to image rows.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Moving towards larger `y` (down the image).
    Descending,
    /// Moving towards smaller `y` (up the image).
    Ascending,
}

impl Direction {
    pub fn label(self) -> &'static str {
        match self {
            Direction::Descending => "descending",
            Direction::Ascending => "ascending",
        }
    }
}

/// Absolute row of the calibration line for a frame of `frame_height` pixels.
pub fn line_y(line_ratio: f64, frame_height: i32) -> i32 {
    (frame_height as f64 * line_ratio).floor() as i32
}

/// Decide whether moving from `prev` to `curr` crosses `line_y`.
///
/// Landing exactly on the line counts as a crossing; leaving it does not.
pub fn detect(prev: Point, curr: Point, line_y: i32) -> Option<Direction> {
    if prev.y < line_y && curr.y >= line_y {
        Some(Direction::Descending)
    } else if prev.y > line_y && curr.y <= line_y {
        Some(Direction::Ascending)
    } else {
        None
    }
}

/// Check the two most recent samples of a trajectory.
pub fn detect_in(positions: &VecDeque<Point>, line_y: i32) -> Option<Direction> {
    let len = positions.len();
    if len < 2 {
        return None;
    }
    detect(positions[len - 2], positions[len - 1], line_y)
}
