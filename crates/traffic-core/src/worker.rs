//! Per-camera processing loop.
//!
//! A worker owns its source connection, tracker session and track history.
//! It walks an explicit state machine:
//!
//! ```text
//! Connecting -> Streaming -> Disconnected -> ReconnectBackoff -> Connecting
//! ```
//!
//! and only reaches `Stopped` when its stop flag is cleared. The flag is
//! checked once per iteration and inside every backoff sleep.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::anyhow;
use chrono::{Local, NaiveDate, Utc};
use tracing::{debug, error, info, warn};
use video_ingest::{FrameStream, VideoSource};

use crate::{
    annotation::{Overlay, annotate},
    broadcast::{EncodedFrame, FrameBroadcaster},
    config::{CameraConfig, WorkerOptions},
    crossing::{Direction, detect_in, line_y},
    detector::{ObjectTracker, TrackerFactory},
    error::PipelineError,
    health::{WorkerHealth, WorkerState},
    history::TrackHistory,
    speed::SpeedEstimator,
    stats::{MONITORED_CLASS_IDS, StatsAggregator},
};

const STOP_POLL_SLICE: Duration = Duration::from_millis(100);

/// Collaborators shared by every worker.
#[derive(Clone)]
pub struct WorkerContext {
    pub source: Arc<dyn VideoSource>,
    pub trackers: TrackerFactory,
    pub stats: Arc<StatsAggregator>,
    pub broadcaster: Arc<FrameBroadcaster>,
    pub options: WorkerOptions,
}

/// An open stream plus the geometry-derived values computed at open time.
struct Session {
    stream: Box<dyn FrameStream>,
    line_y: i32,
    speed: SpeedEstimator,
}

pub struct CameraWorker {
    config: CameraConfig,
    context: WorkerContext,
    health: Arc<WorkerHealth>,
    running: Arc<AtomicBool>,
    tracker: Option<Box<dyn ObjectTracker>>,
    history: TrackHistory,
    frame_number: u64,
}

impl CameraWorker {
    pub fn new(
        config: CameraConfig,
        context: WorkerContext,
        health: Arc<WorkerHealth>,
        running: Arc<AtomicBool>,
    ) -> Self {
        Self {
            config,
            context,
            health,
            running,
            tracker: None,
            history: TrackHistory::new(),
            frame_number: 0,
        }
    }

    /// Drive the state machine until the stop flag is cleared.
    pub fn run(mut self) {
        let span = tracing::info_span!("camera.worker", camera = %self.config.camera_id);
        let _guard = span.enter();
        info!(source = %self.config.source_uri, "camera worker started");

        let mut state = WorkerState::Connecting;
        let mut session: Option<Session> = None;

        while self.running.load(Ordering::Acquire) {
            self.health.set_state(state);
            state = match state {
                WorkerState::Connecting => match self.connect() {
                    Ok(opened) => {
                        session = Some(opened);
                        WorkerState::Streaming
                    }
                    Err(err) => {
                        warn!(
                            "{err}; retrying in {:?}",
                            self.context.options.connect_backoff
                        );
                        self.health.open_failed();
                        self.pause(self.context.options.connect_backoff);
                        WorkerState::Connecting
                    }
                },
                WorkerState::Streaming => match session.as_mut() {
                    Some(active) => match self.step(active) {
                        Ok(()) => WorkerState::Streaming,
                        Err(err) => {
                            warn!("{err}; reconnecting");
                            WorkerState::Disconnected
                        }
                    },
                    None => WorkerState::Connecting,
                },
                WorkerState::Disconnected => {
                    session = None;
                    WorkerState::ReconnectBackoff
                }
                WorkerState::ReconnectBackoff => {
                    self.pause(self.context.options.reconnect_delay);
                    self.health.reconnected();
                    metrics::counter!(
                        "traffic_reconnects_total",
                        "camera" => self.config.camera_id.clone()
                    )
                    .increment(1);
                    WorkerState::Connecting
                }
                WorkerState::Stopped => break,
            };
        }

        drop(session);
        self.health.set_state(WorkerState::Stopped);
        info!(frames = self.frame_number, "camera worker stopped");
    }

    fn connect(&mut self) -> Result<Session, PipelineError> {
        if self.tracker.is_none() {
            let tracker = (self.context.trackers)(&self.config)
                .map_err(|err| PipelineError::ProcessingFailure(err.into()))?;
            self.tracker = Some(tracker);
        }

        let stream = self
            .context
            .source
            .open(&self.config.source_uri)
            .map_err(PipelineError::SourceUnavailable)?;
        let stream_info = stream.info();
        let speed = SpeedEstimator::new(stream_info.fps, self.config.pixel_to_distance);
        let line_y = line_y(self.config.line_ratio, stream_info.height);
        info!(
            width = stream_info.width,
            height = stream_info.height,
            fps = speed.fps(),
            line_y,
            "stream opened"
        );
        Ok(Session {
            stream,
            line_y,
            speed,
        })
    }

    /// Read, track, count and publish one frame.
    fn step(&mut self, session: &mut Session) -> Result<(), PipelineError> {
        let frame = session
            .stream
            .read()
            .map_err(PipelineError::StreamInterrupted)?;
        let started = Instant::now();
        self.frame_number += 1;

        let tracker = self
            .tracker
            .as_mut()
            .ok_or_else(|| PipelineError::ProcessingFailure(anyhow!("tracker not initialised")))?;
        let objects = tracker
            .track(&frame, &MONITORED_CLASS_IDS)
            .map_err(|err| PipelineError::ProcessingFailure(err.into()))?;

        let now = Instant::now();
        if let Some(max_idle) = self.context.options.track_idle_timeout {
            let evicted = self.history.evict_stale(now, max_idle);
            if evicted > 0 {
                debug!(evicted, "dropped idle tracks");
            }
        }

        for object in &objects {
            let Some(track_id) = object.track_id else {
                continue;
            };
            let positions = self.history.update(track_id, object.center(), now);
            let Some(direction) = detect_in(positions, session.line_y) else {
                continue;
            };
            let len = positions.len();
            let speed_kmh = session
                .speed
                .estimate(positions[len - 2], positions[len - 1]);
            self.history.evict(track_id);
            self.count_crossing(track_id, object.class_id, direction, speed_kmh);
        }

        if self.context.options.capabilities.publish_frames {
            let overlay = Overlay {
                objects: &objects,
                line_y: session.line_y,
                frame_number: self.frame_number,
                fps: session.speed.fps(),
            };
            let jpeg = annotate(&frame, &overlay, self.context.options.jpeg_quality)
                .map_err(PipelineError::ProcessingFailure)?;
            self.context.broadcaster.publish(EncodedFrame {
                camera_id: self.config.camera_id.clone(),
                jpeg,
                produced_at: Utc::now(),
                frame_number: self.frame_number,
            });
        }

        self.health.frame_processed();
        metrics::gauge!("traffic_tracked_objects", "camera" => self.config.camera_id.clone())
            .set(self.history.len() as f64);
        metrics::counter!("traffic_frames_total", "camera" => self.config.camera_id.clone())
            .increment(1);
        metrics::histogram!("traffic_frame_seconds", "camera" => self.config.camera_id.clone())
            .record(started.elapsed().as_secs_f64());
        Ok(())
    }

    fn count_crossing(&self, track_id: i64, class_id: i64, direction: Direction, speed_kmh: f64) {
        debug!(
            track_id,
            class_id,
            direction = direction.label(),
            speed_kmh,
            "line crossing"
        );
        if !self.context.options.capabilities.record_stats {
            return;
        }
        match self
            .context
            .stats
            .record(&self.config.camera_id, stats_date(), class_id, speed_kmh)
        {
            Ok(Some(class)) => {
                self.health.crossing_counted();
                metrics::counter!(
                    "traffic_crossings_total",
                    "camera" => self.config.camera_id.clone(),
                    "class" => class.label()
                )
                .increment(1);
            }
            Ok(None) => {}
            Err(err) => {
                let err = PipelineError::AggregateWriteFailure(err);
                error!(track_id, "{err}");
                metrics::counter!(
                    "traffic_stats_write_errors_total",
                    "camera" => self.config.camera_id.clone()
                )
                .increment(1);
            }
        }
    }

    /// Sleep for `duration` in short slices. Returns `false` when stopped early.
    fn pause(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        while self.running.load(Ordering::Acquire) {
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep((deadline - now).min(STOP_POLL_SLICE));
        }
        false
    }
}

/// Calendar day crossings are attributed to.
pub fn stats_date() -> NaiveDate {
    Local::now().date_naive()
}

#[cfg(test)]
pub(crate) mod tests {
    use std::{
        collections::VecDeque,
        sync::{
            Mutex,
            atomic::{AtomicUsize, Ordering},
        },
    };

    use chrono::DateTime;
    use video_ingest::{CaptureError, Frame, FrameFormat, StreamInfo};

    use super::*;
    use crate::{
        config::Capabilities,
        detector::TrackedObject,
        error::{StoreError, TrackerError},
        history::Point,
        stats::{AggregateStore, DailyStatAggregate, StatKey, VehicleClass},
    };

    pub(crate) fn blank_frame(width: i32, height: i32) -> Frame {
        Frame {
            data: vec![0; Frame::expected_len(width, height, FrameFormat::Bgr8)],
            width,
            height,
            timestamp_ms: 0,
            format: FrameFormat::Bgr8,
        }
    }

    /// Each `open` consumes one script entry; `None` or an exhausted script
    /// fails the open.
    pub(crate) struct ScriptedSource {
        sessions: Mutex<VecDeque<Option<usize>>>,
        pub(crate) opens: AtomicUsize,
        width: i32,
        height: i32,
        fps: Option<f64>,
    }

    impl ScriptedSource {
        pub(crate) fn new(sessions: Vec<Option<usize>>, height: i32) -> Self {
            Self {
                sessions: Mutex::new(sessions.into()),
                opens: AtomicUsize::new(0),
                width: 32,
                height,
                fps: Some(25.0),
            }
        }

        pub(crate) fn failing() -> Self {
            Self::new(Vec::new(), 480)
        }
    }

    struct ScriptedStream {
        remaining: usize,
        info: StreamInfo,
    }

    impl FrameStream for ScriptedStream {
        fn info(&self) -> StreamInfo {
            self.info
        }

        fn read(&mut self) -> Result<Frame, CaptureError> {
            if self.remaining == 0 {
                return Err(CaptureError::EndOfStream);
            }
            self.remaining -= 1;
            Ok(blank_frame(self.info.width, self.info.height))
        }
    }

    impl VideoSource for ScriptedSource {
        fn open(&self, uri: &str) -> Result<Box<dyn FrameStream>, CaptureError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            let next = self.sessions.lock().unwrap().pop_front().flatten();
            match next {
                Some(frames) => Ok(Box::new(ScriptedStream {
                    remaining: frames,
                    info: StreamInfo {
                        width: self.width,
                        height: self.height,
                        fps: self.fps,
                    },
                })),
                None => Err(CaptureError::Open {
                    uri: uri.to_string(),
                }),
            }
        }
    }

    pub(crate) type Script = Arc<Mutex<VecDeque<Result<Vec<TrackedObject>, u16>>>>;

    struct ScriptedTracker {
        script: Script,
    }

    impl ObjectTracker for ScriptedTracker {
        fn track(
            &mut self,
            _frame: &Frame,
            _classes: &[i64],
        ) -> Result<Vec<TrackedObject>, TrackerError> {
            match self.script.lock().unwrap().pop_front() {
                Some(Ok(objects)) => Ok(objects),
                Some(Err(status)) => Err(TrackerError::Status { status }),
                None => Ok(Vec::new()),
            }
        }
    }

    pub(crate) fn scripted_trackers(script: Script) -> TrackerFactory {
        Arc::new(
            move |_camera: &CameraConfig| -> Result<Box<dyn ObjectTracker>, TrackerError> {
                Ok(Box::new(ScriptedTracker {
                    script: script.clone(),
                }) as Box<dyn ObjectTracker>)
            },
        )
    }

    pub(crate) fn object(track_id: i64, class_id: i64, x: f32, y: f32) -> TrackedObject {
        TrackedObject {
            bbox_xywh: [x, y, 20.0, 20.0],
            track_id: Some(track_id),
            class_id,
            score: 0.9,
        }
    }

    pub(crate) fn fast_options() -> WorkerOptions {
        WorkerOptions {
            connect_backoff: Duration::from_millis(20),
            reconnect_delay: Duration::from_millis(10),
            ..WorkerOptions::default()
        }
    }

    pub(crate) fn context(
        source: Arc<dyn VideoSource>,
        script: Script,
        options: WorkerOptions,
    ) -> WorkerContext {
        WorkerContext {
            source,
            trackers: scripted_trackers(script),
            stats: Arc::new(StatsAggregator::in_memory()),
            broadcaster: Arc::new(FrameBroadcaster::new()),
            options,
        }
    }

    fn script(calls: Vec<Result<Vec<TrackedObject>, u16>>) -> Script {
        Arc::new(Mutex::new(calls.into()))
    }

    fn worker(context: WorkerContext) -> CameraWorker {
        CameraWorker::new(
            CameraConfig::new("cam-1", "rtsp://scripted"),
            context,
            Arc::new(WorkerHealth::new()),
            Arc::new(AtomicBool::new(true)),
        )
    }

    fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    #[test]
    fn single_car_crossing_is_counted_and_history_cleared() {
        let source = Arc::new(ScriptedSource::new(vec![Some(3)], 480));
        let calls = script(vec![
            Ok(vec![object(1, 2, 16.0, 200.0)]),
            Ok(vec![object(1, 2, 16.0, 260.0)]),
        ]);
        let ctx = context(source, calls, fast_options());
        let mut worker = worker(ctx.clone());

        let mut session = worker.connect().unwrap();
        assert_eq!(session.line_y, 240);
        worker.step(&mut session).unwrap();
        assert_eq!(worker.history.positions(1).unwrap().len(), 1);
        worker.step(&mut session).unwrap();
        assert!(worker.history.positions(1).is_none());

        let stats = ctx.stats.query("cam-1", stats_date()).unwrap();
        assert_eq!(stats.total_car, 1);
        assert_eq!(stats.total(), 1);
        assert_eq!(stats.average_speed, 540.0);
        assert_eq!(worker.health.snapshot("cam-1").crossings, 1);

        let latest = ctx.broadcaster.latest("cam-1").unwrap();
        assert_eq!(latest.frame_number, 2);
        assert_eq!(&latest.jpeg[..2], &[0xFF, 0xD8]);

        worker.step(&mut session).unwrap();
        assert!(matches!(
            worker.step(&mut session),
            Err(PipelineError::StreamInterrupted(CaptureError::EndOfStream))
        ));
    }

    #[test]
    fn boxes_without_track_ids_are_skipped() {
        let source = Arc::new(ScriptedSource::new(vec![Some(2)], 480));
        let mut untracked = object(1, 2, 16.0, 200.0);
        untracked.track_id = None;
        let mut moved = untracked.clone();
        moved.bbox_xywh[1] = 260.0;
        let calls = script(vec![Ok(vec![untracked]), Ok(vec![moved])]);
        let ctx = context(source, calls, fast_options());
        let mut worker = worker(ctx.clone());

        let mut session = worker.connect().unwrap();
        worker.step(&mut session).unwrap();
        worker.step(&mut session).unwrap();
        assert!(worker.history.is_empty());
        assert_eq!(ctx.stats.query("cam-1", stats_date()).unwrap().total(), 0);
    }

    #[test]
    fn fractional_centres_short_of_the_line_do_not_count() {
        let source = Arc::new(ScriptedSource::new(vec![Some(3)], 480));
        let calls = script(vec![
            Ok(vec![object(3, 2, 16.0, 200.0)]),
            Ok(vec![object(3, 2, 16.0, 239.6)]),
            Ok(vec![object(3, 2, 16.0, 240.4)]),
        ]);
        let ctx = context(source, calls, fast_options());
        let mut worker = worker(ctx.clone());

        let mut session = worker.connect().unwrap();
        worker.step(&mut session).unwrap();
        worker.step(&mut session).unwrap();
        assert_eq!(
            worker.history.positions(3).unwrap().back(),
            Some(&Point::new(16, 239))
        );
        assert_eq!(ctx.stats.query("cam-1", stats_date()).unwrap().total(), 0);

        worker.step(&mut session).unwrap();
        let stats = ctx.stats.query("cam-1", stats_date()).unwrap();
        assert_eq!(stats.total_car, 1);
        // One pixel between 239 and 240 at 25 fps and 0.1 m/px.
        assert_eq!(stats.average_speed, 9.0);
    }

    #[test]
    fn oscillating_track_counts_each_transition() {
        let source = Arc::new(ScriptedSource::new(vec![Some(4)], 480));
        let calls = script(
            [230.0, 250.0, 230.0, 250.0]
                .into_iter()
                .map(|y| Ok(vec![object(5, 7, 16.0, y)]))
                .collect(),
        );
        let ctx = context(source, calls, fast_options());
        let mut worker = worker(ctx.clone());

        let mut session = worker.connect().unwrap();
        for _ in 0..4 {
            worker.step(&mut session).unwrap();
        }
        // Each count resets the history, so the 250->230 step is never seen.
        let stats = ctx.stats.query("cam-1", stats_date()).unwrap();
        assert_eq!(stats.total_truck, 2);
    }

    #[test]
    fn unmonitored_classes_never_reach_aggregates() {
        let source = Arc::new(ScriptedSource::new(vec![Some(2)], 480));
        let calls = script(vec![
            Ok(vec![object(9, 0, 16.0, 200.0)]),
            Ok(vec![object(9, 0, 16.0, 260.0)]),
        ]);
        let ctx = context(source, calls, fast_options());
        let mut worker = worker(ctx.clone());

        let mut session = worker.connect().unwrap();
        worker.step(&mut session).unwrap();
        worker.step(&mut session).unwrap();
        assert_eq!(ctx.stats.query("cam-1", stats_date()).unwrap().total(), 0);
        assert_eq!(worker.health.snapshot("cam-1").crossings, 0);
    }

    #[test]
    fn capability_flags_disable_outputs() {
        let source = Arc::new(ScriptedSource::new(vec![Some(2)], 480));
        let calls = script(vec![
            Ok(vec![object(1, 3, 16.0, 200.0)]),
            Ok(vec![object(1, 3, 16.0, 260.0)]),
        ]);
        let options = WorkerOptions {
            capabilities: Capabilities {
                record_stats: false,
                publish_frames: false,
            },
            ..fast_options()
        };
        let ctx = context(source, calls, options);
        let mut worker = worker(ctx.clone());

        let mut session = worker.connect().unwrap();
        worker.step(&mut session).unwrap();
        worker.step(&mut session).unwrap();
        assert!(worker.history.positions(1).is_none());
        assert_eq!(ctx.stats.query("cam-1", stats_date()).unwrap().total(), 0);
        assert!(ctx.broadcaster.latest("cam-1").is_none());
    }

    struct BrokenStore;

    impl AggregateStore for BrokenStore {
        fn increment(
            &self,
            _key: &StatKey,
            _class: VehicleClass,
            _speed_kmh: Option<f64>,
            _at: DateTime<chrono::Utc>,
        ) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }

        fn load(&self, _key: &StatKey) -> Result<Option<DailyStatAggregate>, StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
    }

    #[test]
    fn store_failures_do_not_interrupt_the_stream() {
        let source = Arc::new(ScriptedSource::new(vec![Some(3)], 480));
        let calls = script(vec![
            Ok(vec![object(1, 2, 16.0, 200.0)]),
            Ok(vec![object(1, 2, 16.0, 260.0)]),
        ]);
        let mut ctx = context(source, calls, fast_options());
        ctx.stats = Arc::new(StatsAggregator::new(Arc::new(BrokenStore)));
        let mut worker = worker(ctx);

        let mut session = worker.connect().unwrap();
        worker.step(&mut session).unwrap();
        worker.step(&mut session).unwrap();
        worker.step(&mut session).unwrap();
        assert_eq!(worker.health.snapshot("cam-1").crossings, 0);
    }

    #[test]
    fn tracker_failure_forces_a_reconnect() {
        let source = Arc::new(ScriptedSource::new(vec![Some(5), Some(5)], 480));
        let calls = script(vec![Err(503)]);
        let ctx = context(source.clone(), calls, fast_options());
        let worker = worker(ctx);
        let health = worker.health.clone();
        let running = worker.running.clone();

        let handle = thread::spawn(move || worker.run());
        assert!(wait_until(Duration::from_secs(5), || {
            source.opens.load(Ordering::SeqCst) >= 2
        }));
        running.store(false, Ordering::Release);
        handle.join().unwrap();

        let status = health.snapshot("cam-1");
        assert!(status.reconnects >= 1);
        assert_eq!(status.state, WorkerState::Stopped);
    }

    #[test]
    fn failing_source_keeps_retrying_until_stopped() {
        let source = Arc::new(ScriptedSource::failing());
        let ctx = context(source.clone(), script(Vec::new()), fast_options());
        let stats = ctx.stats.clone();
        let worker = worker(ctx);
        let health = worker.health.clone();
        let running = worker.running.clone();

        let handle = thread::spawn(move || worker.run());
        assert!(wait_until(Duration::from_secs(5), || {
            source.opens.load(Ordering::SeqCst) >= 3
        }));
        assert_eq!(health.state(), WorkerState::Connecting);
        assert!(!handle.is_finished());

        running.store(false, Ordering::Release);
        handle.join().unwrap();
        assert_eq!(health.state(), WorkerState::Stopped);
        assert!(health.snapshot("cam-1").open_failures >= 3);
        assert_eq!(stats.query("cam-1", stats_date()).unwrap().total(), 0);
    }

    #[test]
    fn stop_interrupts_a_long_backoff() {
        let source = Arc::new(ScriptedSource::failing());
        let options = WorkerOptions {
            connect_backoff: Duration::from_secs(60),
            ..fast_options()
        };
        let worker = worker(context(source.clone(), script(Vec::new()), options));
        let running = worker.running.clone();

        let handle = thread::spawn(move || worker.run());
        assert!(wait_until(Duration::from_secs(5), || {
            source.opens.load(Ordering::SeqCst) >= 1
        }));
        let stop_requested = Instant::now();
        running.store(false, Ordering::Release);
        handle.join().unwrap();
        assert!(stop_requested.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn history_survives_reconnects() {
        let source = Arc::new(ScriptedSource::new(vec![Some(1), Some(1)], 480));
        let calls = script(vec![
            Ok(vec![object(4, 2, 16.0, 200.0)]),
            Ok(vec![object(4, 2, 16.0, 260.0)]),
        ]);
        let ctx = context(source, calls, fast_options());
        let mut worker = worker(ctx.clone());

        let mut first = worker.connect().unwrap();
        worker.step(&mut first).unwrap();
        assert!(worker.step(&mut first).is_err());
        drop(first);

        let mut second = worker.connect().unwrap();
        worker.step(&mut second).unwrap();
        assert_eq!(ctx.stats.query("cam-1", stats_date()).unwrap().total_car, 1);
    }
}
