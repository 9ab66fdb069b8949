//! Starts one [`CameraWorker`] thread per configured camera and watches them.

use std::{
    collections::BTreeMap,
    io,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use tracing::{debug, info, warn};

use crate::{
    config::CameraConfig,
    error::SupervisorError,
    health::{WorkerHealth, WorkerStatus, current_millis},
    worker::{CameraWorker, WorkerContext},
};

struct WorkerHandle {
    health: Arc<WorkerHealth>,
    running: Arc<AtomicBool>,
    join: Option<thread::JoinHandle<()>>,
}

impl WorkerHandle {
    fn is_alive(&self) -> bool {
        self.join
            .as_ref()
            .is_some_and(|join| !join.is_finished())
    }
}

type Workers = Arc<Mutex<BTreeMap<String, WorkerHandle>>>;

struct Monitor {
    running: Arc<AtomicBool>,
    join: thread::JoinHandle<()>,
}

pub struct WorkerSupervisor {
    context: WorkerContext,
    workers: Workers,
    monitor: Mutex<Option<Monitor>>,
}

impl WorkerSupervisor {
    pub fn new(context: WorkerContext) -> Self {
        Self {
            context,
            workers: Arc::new(Mutex::new(BTreeMap::new())),
            monitor: Mutex::new(None),
        }
    }

    /// Start a worker for every camera not already running. Returns how many
    /// were started.
    pub fn start_all(&self, cameras: &[CameraConfig]) -> Result<usize, SupervisorError> {
        if cameras.is_empty() {
            return Err(SupervisorError::NoCameras);
        }

        let mut workers = self.lock_workers();
        let mut started = 0;
        for camera in cameras {
            if workers
                .get(&camera.camera_id)
                .is_some_and(WorkerHandle::is_alive)
            {
                debug!(camera = %camera.camera_id, "worker already running; skipping");
                continue;
            }

            let health = Arc::new(WorkerHealth::new());
            let running = Arc::new(AtomicBool::new(true));
            let worker = CameraWorker::new(
                camera.clone(),
                self.context.clone(),
                health.clone(),
                running.clone(),
            );
            let join = spawn_thread(format!("camera-{}", camera.camera_id), move || worker.run())
                .map_err(|source| SupervisorError::Spawn {
                    camera_id: camera.camera_id.clone(),
                    source,
                })?;

            info!(camera = %camera.camera_id, source = %camera.source_uri, "worker started");
            workers.insert(
                camera.camera_id.clone(),
                WorkerHandle {
                    health,
                    running,
                    join: Some(join),
                },
            );
            started += 1;
        }
        Ok(started)
    }

    pub fn is_running(&self, camera_id: &str) -> bool {
        self.lock_workers()
            .get(camera_id)
            .is_some_and(WorkerHandle::is_alive)
    }

    pub fn active_count(&self) -> usize {
        self.lock_workers()
            .values()
            .filter(|handle| handle.is_alive())
            .count()
    }

    pub fn statuses(&self) -> Vec<WorkerStatus> {
        self.lock_workers()
            .iter()
            .map(|(camera_id, handle)| handle.health.snapshot(camera_id))
            .collect()
    }

    pub fn status(&self, camera_id: &str) -> Option<WorkerStatus> {
        self.lock_workers()
            .get(camera_id)
            .map(|handle| handle.health.snapshot(camera_id))
    }

    /// Spawn a thread that warns about streaming workers with no recent
    /// frame. Replaces any previous monitor.
    pub fn spawn_monitor(&self, poll: Duration, stale_after: Duration) -> io::Result<()> {
        self.stop_monitor();

        let workers = self.workers.clone();
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();
        let threshold_ms = stale_after.as_millis() as u64;
        let join = spawn_thread("worker-monitor", move || {
            while flag.load(Ordering::Acquire) {
                thread::sleep(poll);
                let now = current_millis();
                let Ok(workers) = workers.lock() else {
                    break;
                };
                let mut stale = 0;
                for (camera_id, handle) in workers.iter() {
                    if handle.health.is_stale(now, threshold_ms) {
                        stale += 1;
                        warn!(camera = %camera_id, "no frame processed for over {stale_after:?}");
                    }
                }
                metrics::gauge!("traffic_stale_workers").set(stale as f64);
            }
        })?;

        if let Ok(mut monitor) = self.monitor.lock() {
            *monitor = Some(Monitor { running, join });
        }
        Ok(())
    }

    /// Ask every worker to stop and wait for all of them.
    pub fn stop_all(&self) {
        self.stop_monitor();

        let handles: Vec<(String, WorkerHandle)> = {
            let mut workers = self.lock_workers();
            std::mem::take(&mut *workers).into_iter().collect()
        };
        for (_, handle) in &handles {
            handle.running.store(false, Ordering::Release);
        }
        for (camera_id, mut handle) in handles {
            if let Some(join) = handle.join.take() {
                if join.join().is_err() {
                    warn!(camera = %camera_id, "worker thread panicked");
                }
            }
        }
    }

    fn stop_monitor(&self) {
        let monitor = self.monitor.lock().ok().and_then(|mut guard| guard.take());
        if let Some(monitor) = monitor {
            monitor.running.store(false, Ordering::Release);
            let _ = monitor.join.join();
        }
    }

    fn lock_workers(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, WorkerHandle>> {
        self.workers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for WorkerSupervisor {
    fn drop(&mut self) {
        self.stop_all();
    }
}

/// Spawn a named thread that inherits the current tracing dispatcher.
pub fn spawn_thread<F, T>(name: impl Into<String>, f: F) -> io::Result<thread::JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let dispatch = tracing::dispatcher::get_default(|current| current.clone());
    thread::Builder::new()
        .name(name.into())
        .spawn(move || tracing::dispatcher::with_default(&dispatch, f))
}

#[cfg(test)]
mod tests {
    use std::{collections::VecDeque, time::Instant};

    use super::*;
    use crate::{
        health::WorkerState,
        worker::tests::{ScriptedSource, context, fast_options},
    };

    fn supervisor() -> WorkerSupervisor {
        let script = Arc::new(Mutex::new(VecDeque::new()));
        WorkerSupervisor::new(context(
            Arc::new(ScriptedSource::failing()),
            script,
            fast_options(),
        ))
    }

    #[test]
    fn empty_configuration_is_rejected() {
        assert!(matches!(
            supervisor().start_all(&[]),
            Err(SupervisorError::NoCameras)
        ));
    }

    #[test]
    fn start_all_is_idempotent_per_camera() {
        let supervisor = supervisor();
        let cameras = vec![
            CameraConfig::new("cam-1", "rtsp://a"),
            CameraConfig::new("cam-2", "rtsp://b"),
            CameraConfig::new("cam-1", "rtsp://a-duplicate"),
        ];
        assert_eq!(supervisor.start_all(&cameras).unwrap(), 2);
        assert_eq!(supervisor.start_all(&cameras).unwrap(), 0);
        assert!(supervisor.is_running("cam-1"));
        assert!(supervisor.is_running("cam-2"));
        assert!(!supervisor.is_running("cam-3"));
        let mut ids: Vec<_> = supervisor
            .statuses()
            .into_iter()
            .map(|status| status.camera_id)
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["cam-1", "cam-2"]);
        assert_eq!(supervisor.active_count(), 2);
        supervisor.stop_all();
    }

    #[test]
    fn stop_all_joins_every_worker() {
        let supervisor = supervisor();
        supervisor
            .start_all(&[CameraConfig::new("cam-1", "rtsp://a")])
            .unwrap();
        supervisor
            .spawn_monitor(Duration::from_millis(10), Duration::from_secs(5))
            .unwrap();
        let health = supervisor
            .lock_workers()
            .get("cam-1")
            .map(|handle| handle.health.clone())
            .unwrap();

        let started = Instant::now();
        supervisor.stop_all();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(health.state(), WorkerState::Stopped);
        assert!(!supervisor.is_running("cam-1"));
        assert!(supervisor.statuses().is_empty());
    }

    #[test]
    fn statuses_cover_each_worker() {
        let supervisor = supervisor();
        supervisor
            .start_all(&[
                CameraConfig::new("cam-1", "rtsp://a"),
                CameraConfig::new("cam-2", "rtsp://b"),
            ])
            .unwrap();
        let statuses = supervisor.statuses();
        assert_eq!(statuses.len(), 2);
        assert_eq!(statuses[0].camera_id, "cam-1");
        assert!(supervisor.status("cam-2").is_some());
        assert!(supervisor.status("cam-9").is_none());
        supervisor.stop_all();
    }
}
