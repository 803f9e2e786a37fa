//! Read-only status board.
//!
//! Each camera's pipeline and event client update their own `CameraStatus`
//! with relaxed atomics; the status API and heartbeats read snapshots. This is
//! the only state shared across cameras.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

const FPS_WINDOW: Duration = Duration::from_secs(5);

struct FpsWindow {
    started: Instant,
    frames: u64,
    fps: f64,
}

pub struct CameraStatus {
    camera_id: String,
    stream_connected: AtomicBool,
    collector_reachable: AtomicBool,
    frames: AtomicU64,
    active_tracks: AtomicU64,
    open_occupancies: AtomicU64,
    events_emitted: AtomicU64,
    events_dropped: AtomicU64,
    batches_sent: AtomicU64,
    batches_buffered: AtomicU64,
    batches_evicted: AtomicU64,
    stream_faults: AtomicU64,
    detector_failures: AtomicU64,
    restarts: AtomicU64,
    fps: Mutex<FpsWindow>,
    last_error: Mutex<Option<String>>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub camera_id: String,
    pub stream_connected: bool,
    pub collector_reachable: bool,
    pub fps: f64,
    pub frames: u64,
    pub active_tracks: u64,
    pub open_occupancies: u64,
    pub events_emitted: u64,
    pub events_dropped: u64,
    pub batches_sent: u64,
    pub buffered_batches: u64,
    pub evicted_batches: u64,
    pub stream_faults: u64,
    pub detector_failures: u64,
    pub restarts: u64,
    pub last_error: Option<String>,
}

impl CameraStatus {
    pub fn new(camera_id: &str) -> Self {
        Self {
            camera_id: camera_id.to_string(),
            stream_connected: AtomicBool::new(false),
            collector_reachable: AtomicBool::new(false),
            frames: AtomicU64::new(0),
            active_tracks: AtomicU64::new(0),
            open_occupancies: AtomicU64::new(0),
            events_emitted: AtomicU64::new(0),
            events_dropped: AtomicU64::new(0),
            batches_sent: AtomicU64::new(0),
            batches_buffered: AtomicU64::new(0),
            batches_evicted: AtomicU64::new(0),
            stream_faults: AtomicU64::new(0),
            detector_failures: AtomicU64::new(0),
            restarts: AtomicU64::new(0),
            fps: Mutex::new(FpsWindow {
                started: Instant::now(),
                frames: 0,
                fps: 0.0,
            }),
            last_error: Mutex::new(None),
        }
    }

    pub fn camera_id(&self) -> &str {
        &self.camera_id
    }

    pub fn record_frame(&self) {
        let total = self.frames.fetch_add(1, Ordering::Relaxed) + 1;
        if let Ok(mut window) = self.fps.lock() {
            let elapsed = window.started.elapsed();
            if elapsed >= FPS_WINDOW {
                window.fps = (total - window.frames) as f64 / elapsed.as_secs_f64();
                window.frames = total;
                window.started = Instant::now();
            }
        }
    }

    pub fn set_stream_connected(&self, connected: bool) {
        self.stream_connected.store(connected, Ordering::Relaxed);
    }

    pub fn set_collector_reachable(&self, reachable: bool) {
        self.collector_reachable.store(reachable, Ordering::Relaxed);
    }

    pub fn set_tracking(&self, active_tracks: usize, open_occupancies: usize) {
        self.active_tracks.store(active_tracks as u64, Ordering::Relaxed);
        self.open_occupancies
            .store(open_occupancies as u64, Ordering::Relaxed);
    }

    pub fn record_events_emitted(&self, count: u64) {
        self.events_emitted.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_event_dropped(&self) {
        self.events_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_batch_sent(&self) {
        self.batches_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_buffered_batches(&self, count: u64) {
        self.batches_buffered.store(count, Ordering::Relaxed);
    }

    pub fn record_evictions(&self, count: u64) {
        self.batches_evicted.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_stream_fault(&self, reason: &str) {
        self.stream_faults.fetch_add(1, Ordering::Relaxed);
        self.set_stream_connected(false);
        self.set_last_error(reason);
    }

    pub fn record_detector_failure(&self, reason: &str) {
        self.detector_failures.fetch_add(1, Ordering::Relaxed);
        self.set_last_error(reason);
    }

    pub fn record_restart(&self, reason: &str) {
        self.restarts.fetch_add(1, Ordering::Relaxed);
        self.set_last_error(reason);
    }

    pub fn set_last_error(&self, reason: &str) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = Some(reason.to_string());
        }
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let fps = self.fps.lock().map(|w| w.fps).unwrap_or(0.0);
        let last_error = self.last_error.lock().ok().and_then(|g| g.clone());
        StatusSnapshot {
            camera_id: self.camera_id.clone(),
            stream_connected: self.stream_connected.load(Ordering::Relaxed),
            collector_reachable: self.collector_reachable.load(Ordering::Relaxed),
            fps,
            frames: self.frames.load(Ordering::Relaxed),
            active_tracks: self.active_tracks.load(Ordering::Relaxed),
            open_occupancies: self.open_occupancies.load(Ordering::Relaxed),
            events_emitted: self.events_emitted.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            batches_sent: self.batches_sent.load(Ordering::Relaxed),
            buffered_batches: self.batches_buffered.load(Ordering::Relaxed),
            evicted_batches: self.batches_evicted.load(Ordering::Relaxed),
            stream_faults: self.stream_faults.load(Ordering::Relaxed),
            detector_failures: self.detector_failures.load(Ordering::Relaxed),
            restarts: self.restarts.load(Ordering::Relaxed),
            last_error,
        }
    }
}

/// All cameras' status, keyed by camera id.
#[derive(Default)]
pub struct StatusBoard {
    cameras: RwLock<BTreeMap<String, Arc<CameraStatus>>>,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the camera's status entry, creating it on first use.
    ///
    /// Entries survive pipeline restarts so counters stay cumulative.
    pub fn register(&self, camera_id: &str) -> Arc<CameraStatus> {
        if let Ok(mut cameras) = self.cameras.write() {
            return cameras
                .entry(camera_id.to_string())
                .or_insert_with(|| Arc::new(CameraStatus::new(camera_id)))
                .clone();
        }
        Arc::new(CameraStatus::new(camera_id))
    }

    pub fn get(&self, camera_id: &str) -> Option<Arc<CameraStatus>> {
        self.cameras.read().ok()?.get(camera_id).cloned()
    }

    pub fn remove(&self, camera_id: &str) {
        if let Ok(mut cameras) = self.cameras.write() {
            cameras.remove(camera_id);
        }
    }

    pub fn snapshot(&self) -> Vec<StatusSnapshot> {
        self.cameras
            .read()
            .map(|cameras| cameras.values().map(|s| s.snapshot()).collect())
            .unwrap_or_default()
    }
}
