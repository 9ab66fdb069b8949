//! Lock-free worker state and heartbeat counters.

use std::{
    sync::atomic::{AtomicU8, AtomicU64, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};

use serde::Serialize;

/// Reconnect state machine of a camera worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Connecting,
    Streaming,
    Disconnected,
    ReconnectBackoff,
    Stopped,
}

impl WorkerState {
    pub fn label(self) -> &'static str {
        match self {
            WorkerState::Connecting => "connecting",
            WorkerState::Streaming => "streaming",
            WorkerState::Disconnected => "disconnected",
            WorkerState::ReconnectBackoff => "reconnect_backoff",
            WorkerState::Stopped => "stopped",
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => WorkerState::Connecting,
            1 => WorkerState::Streaming,
            2 => WorkerState::Disconnected,
            3 => WorkerState::ReconnectBackoff,
            _ => WorkerState::Stopped,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            WorkerState::Connecting => 0,
            WorkerState::Streaming => 1,
            WorkerState::Disconnected => 2,
            WorkerState::ReconnectBackoff => 3,
            WorkerState::Stopped => 4,
        }
    }
}

/// Shared between a worker and its supervisor.
pub struct WorkerHealth {
    state: AtomicU8,
    last_frame_ms: AtomicU64,
    frames: AtomicU64,
    crossings: AtomicU64,
    reconnects: AtomicU64,
    open_failures: AtomicU64,
}

impl Default for WorkerHealth {
    fn default() -> Self {
        Self {
            state: AtomicU8::new(WorkerState::Connecting.as_u8()),
            last_frame_ms: AtomicU64::new(0),
            frames: AtomicU64::new(0),
            crossings: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            open_failures: AtomicU64::new(0),
        }
    }
}

impl WorkerHealth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: WorkerState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    pub fn frame_processed(&self) {
        self.last_frame_ms.store(current_millis(), Ordering::Relaxed);
        self.frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn crossing_counted(&self) {
        self.crossings.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reconnected(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn open_failed(&self) {
        self.open_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// A streaming worker whose last frame is older than `threshold_ms`.
    pub fn is_stale(&self, now_ms: u64, threshold_ms: u64) -> bool {
        if self.state() != WorkerState::Streaming {
            return false;
        }
        let last = self.last_frame_ms.load(Ordering::Relaxed);
        last != 0 && now_ms.saturating_sub(last) > threshold_ms
    }

    pub fn snapshot(&self, camera_id: &str) -> WorkerStatus {
        let last = self.last_frame_ms.load(Ordering::Relaxed);
        WorkerStatus {
            camera_id: camera_id.to_string(),
            state: self.state(),
            frames: self.frames.load(Ordering::Relaxed),
            crossings: self.crossings.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            open_failures: self.open_failures.load(Ordering::Relaxed),
            last_frame_age_ms: (last != 0).then(|| current_millis().saturating_sub(last)),
        }
    }
}

/// Point-in-time view of one worker.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct WorkerStatus {
    pub camera_id: String,
    pub state: WorkerState,
    pub frames: u64,
    pub crossings: u64,
    pub reconnects: u64,
    pub open_failures: u64,
    pub last_frame_age_ms: Option<u64>,
}

pub(crate) fn current_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
