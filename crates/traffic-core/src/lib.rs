//! Multi-camera traffic counting pipeline.
//!
//! One [`CameraWorker`] per camera reads frames, asks an [`ObjectTracker`]
//! for tracked boxes, keeps a bounded [`TrackHistory`] per track and counts
//! vehicles crossing a calibration line. Crossings feed the shared
//! [`StatsAggregator`]; annotated frames go to the [`FrameBroadcaster`].
//! [`WorkerSupervisor`] owns the worker threads.

pub mod annotation;
pub mod broadcast;
pub mod config;
pub mod crossing;
pub mod detector;
pub mod error;
pub mod health;
pub mod history;
pub mod speed;
pub mod stats;
pub mod supervisor;
pub mod worker;

pub use broadcast::{EncodedFrame, FrameBroadcaster, MULTIPART_CONTENT_TYPE, multipart_part};
pub use config::{CameraConfig, Capabilities, WorkerOptions, load_cameras, parse_cameras};
pub use crossing::Direction;
pub use detector::{HttpTracker, ObjectTracker, TrackedObject, TrackerFactory};
pub use error::{ConfigError, PipelineError, StoreError, SupervisorError, TrackerError};
pub use health::{WorkerHealth, WorkerState, WorkerStatus};
pub use history::{Point, TRACK_HISTORY_CAPACITY, TrackHistory};
pub use speed::SpeedEstimator;
pub use stats::{
    AggregateStore, DailyStats, MONITORED_CLASS_IDS, MemoryStore, SqliteStore, StatsAggregator,
    VehicleClass,
};
pub use supervisor::{WorkerSupervisor, spawn_thread};
pub use worker::{CameraWorker, WorkerContext, stats_date};
