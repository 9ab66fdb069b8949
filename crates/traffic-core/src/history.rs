//! Bounded per-track trajectory buffers owned by a single camera worker.

use std::{
    collections::{HashMap, VecDeque},
    time::{Duration, Instant},
};

/// Maximum number of samples retained per track.
pub const TRACK_HISTORY_CAPACITY: usize = 30;

/// Pixel position of a track's box centre.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

struct TrackRecord {
    positions: VecDeque<Point>,
    last_seen: Instant,
}

/// Mapping from track id to its most recent positions, oldest first.
#[derive(Default)]
pub struct TrackHistory {
    tracks: HashMap<i64, TrackRecord>,
}

impl TrackHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `position` to the track, evicting the oldest sample beyond
    /// [`TRACK_HISTORY_CAPACITY`], and return the retained samples.
    pub fn update(&mut self, track_id: i64, position: Point, now: Instant) -> &VecDeque<Point> {
        let record = self.tracks.entry(track_id).or_insert_with(|| TrackRecord {
            positions: VecDeque::with_capacity(TRACK_HISTORY_CAPACITY),
            last_seen: now,
        });
        record.positions.push_back(position);
        while record.positions.len() > TRACK_HISTORY_CAPACITY {
            record.positions.pop_front();
        }
        record.last_seen = now;
        &record.positions
    }

    pub fn evict(&mut self, track_id: i64) {
        self.tracks.remove(&track_id);
    }

    /// Drop every track whose last update is older than `max_idle`. Returns
    /// how many were removed.
    pub fn evict_stale(&mut self, now: Instant, max_idle: Duration) -> usize {
        let before = self.tracks.len();
        self.tracks
            .retain(|_, record| now.saturating_duration_since(record.last_seen) <= max_idle);
        before - self.tracks.len()
    }

    pub fn positions(&self, track_id: i64) -> Option<&VecDeque<Point>> {
        self.tracks.get(&track_id).map(|record| &record.positions)
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_at_most_thirty_samples_fifo() {
        let mut history = TrackHistory::new();
        let now = Instant::now();
        for y in 0..45 {
            let positions = history.update(7, Point::new(10, y), now);
            assert!(positions.len() <= TRACK_HISTORY_CAPACITY);
        }
        let positions = history.positions(7).unwrap();
        assert_eq!(positions.len(), TRACK_HISTORY_CAPACITY);
        assert_eq!(positions.front(), Some(&Point::new(10, 15)));
        assert_eq!(positions.back(), Some(&Point::new(10, 44)));
    }

    #[test]
    fn tracks_are_independent() {
        let mut history = TrackHistory::new();
        let now = Instant::now();
        history.update(1, Point::new(0, 0), now);
        history.update(2, Point::new(5, 5), now);
        history.update(1, Point::new(1, 1), now);
        assert_eq!(history.positions(1).unwrap().len(), 2);
        assert_eq!(history.positions(2).unwrap().len(), 1);
    }

    #[test]
    fn evict_restarts_history() {
        let mut history = TrackHistory::new();
        let now = Instant::now();
        history.update(3, Point::new(0, 0), now);
        history.update(3, Point::new(0, 1), now);
        history.evict(3);
        assert!(history.positions(3).is_none());
        assert_eq!(history.update(3, Point::new(0, 2), now).len(), 1);
    }

    #[test]
    fn stale_tracks_are_dropped() {
        let mut history = TrackHistory::new();
        let start = Instant::now();
        history.update(1, Point::new(0, 0), start);
        history.update(2, Point::new(0, 0), start + Duration::from_secs(8));

        let removed = history.evict_stale(start + Duration::from_secs(12), Duration::from_secs(10));
        assert_eq!(removed, 1);
        assert!(history.positions(1).is_none());
        assert!(history.positions(2).is_some());
    }
}
