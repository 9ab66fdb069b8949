//! Latest-frame hand-off between camera workers and viewers.
//!
//! Each camera owns one overwrite slot. Publishing swaps an `Arc` under the
//! slot lock, so readers always observe a complete frame and never block on
//! encoding.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, RwLock},
};

use chrono::{DateTime, Utc};

/// Multipart boundary used by the live stream.
pub const MULTIPART_BOUNDARY: &str = "frame";
pub const MULTIPART_CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

/// Annotated JPEG ready to serve.
#[derive(Clone, Debug)]
pub struct EncodedFrame {
    pub camera_id: String,
    pub jpeg: Vec<u8>,
    pub produced_at: DateTime<Utc>,
    pub frame_number: u64,
}

type Slot = Arc<Mutex<Option<Arc<EncodedFrame>>>>;

#[derive(Default)]
pub struct FrameBroadcaster {
    slots: RwLock<HashMap<String, Slot>>,
}

impl FrameBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the latest frame for `frame.camera_id`.
    pub fn publish(&self, frame: EncodedFrame) {
        let slot = self.slot(&frame.camera_id);
        let frame = Arc::new(frame);
        if let Ok(mut guard) = slot.lock() {
            *guard = Some(frame);
        }
    }

    /// Most recent frame for `camera_id`, if one was ever published.
    pub fn latest(&self, camera_id: &str) -> Option<Arc<EncodedFrame>> {
        let slot = self.slots.read().ok()?.get(camera_id).cloned()?;
        let guard = slot.lock().ok()?;
        guard.clone()
    }

    fn slot(&self, camera_id: &str) -> Slot {
        if let Some(slot) = self
            .slots
            .read()
            .ok()
            .and_then(|slots| slots.get(camera_id).cloned())
        {
            return slot;
        }
        match self.slots.write() {
            Ok(mut slots) => slots.entry(camera_id.to_string()).or_default().clone(),
            Err(poisoned) => poisoned
                .into_inner()
                .entry(camera_id.to_string())
                .or_default()
                .clone(),
        }
    }
}

/// One part of a `multipart/x-mixed-replace` MJPEG response.
pub fn multipart_part(frame: &EncodedFrame) -> Vec<u8> {
    let mut payload = Vec::with_capacity(frame.jpeg.len() + 64);
    payload.extend_from_slice(b"--");
    payload.extend_from_slice(MULTIPART_BOUNDARY.as_bytes());
    payload.extend_from_slice(b"\r\nContent-Type: image/jpeg\r\n\r\n");
    payload.extend_from_slice(&frame.jpeg);
    payload.extend_from_slice(b"\r\n");
    payload
}
