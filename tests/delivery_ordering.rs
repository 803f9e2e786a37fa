use anyhow::{anyhow, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use footfall_edge::client::{
    BatchStore, DeliverySettings, EventClient, InMemoryBatchStore, SqliteBatchStore,
};
use footfall_edge::transport::{Collector, Heartbeat};
use footfall_edge::{
    BackoffPolicy, CameraStatus, Direction, Event, EventBatch, SystemClock, Timestamp,
};

/// Collector that fails while offline and records what it accepts.
#[derive(Default)]
struct FakeCollector {
    online: AtomicBool,
    attempts: Mutex<usize>,
    heartbeats: Mutex<usize>,
    batches: Mutex<Vec<EventBatch>>,
}

impl FakeCollector {
    fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    fn person_keys(&self) -> Vec<String> {
        self.batches
            .lock()
            .unwrap()
            .iter()
            .flat_map(|b| b.events.iter().map(|e| e.person_key().to_string()))
            .collect()
    }
}

impl Collector for FakeCollector {
    fn post_events(&self, batch_json: &str) -> Result<()> {
        *self.attempts.lock().unwrap() += 1;
        if !self.online.load(Ordering::SeqCst) {
            return Err(anyhow!("connection refused"));
        }
        let batch: EventBatch = serde_json::from_str(batch_json)?;
        self.batches.lock().unwrap().push(batch);
        Ok(())
    }

    fn post_heartbeat(&self, _heartbeat: &Heartbeat) -> Result<()> {
        *self.heartbeats.lock().unwrap() += 1;
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(anyhow!("connection refused"))
        }
    }
}

fn settings() -> DeliverySettings {
    DeliverySettings {
        flush_interval: Duration::from_millis(20),
        max_batch: 1,
        backoff: BackoffPolicy {
            initial: Duration::from_millis(20),
            factor: 1.0,
            max: Duration::from_millis(20),
            jitter: 0.0,
        },
        heartbeat_interval: Duration::ZERO,
        shutdown_grace: Duration::from_secs(2),
        ..DeliverySettings::default()
    }
}

fn client() -> EventClient {
    client_with(settings())
}

fn client_with(settings: DeliverySettings) -> EventClient {
    EventClient {
        org_id: "org-1".into(),
        store_id: "store-1".into(),
        camera_id: "cam-1".into(),
        settings,
    }
}

/// Delivery backoff long enough that only a heartbeat can cut it short.
fn hour_backoff() -> BackoffPolicy {
    BackoffPolicy {
        initial: Duration::from_secs(3600),
        factor: 1.0,
        max: Duration::from_secs(3600),
        jitter: 0.0,
    }
}

fn event(i: i64) -> Event {
    Event::entrance(
        "cam-1",
        &format!("cam-1_s1_t{}", i),
        "door",
        Direction::In,
        Timestamp::from_secs(1_700_000_000 + i),
    )
}

fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    check()
}

#[test]
fn offline_batches_are_delivered_in_order_after_reconnect() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let collector = Arc::new(FakeCollector::default());
    let status = Arc::new(CameraStatus::new("cam-1"));
    let store = SqliteBatchStore::open_for_camera(dir.path(), "cam-1")?;

    let (sink, handle) = client().spawn(
        Box::new(store),
        collector.clone(),
        Arc::new(SystemClock::new()),
        status.clone(),
    )?;

    for i in 1..=5 {
        assert!(sink.submit(event(i)));
    }
    assert!(
        wait_until(Duration::from_secs(5), || status.snapshot().buffered_batches == 5),
        "five one-event batches buffered while offline"
    );
    assert!(collector.person_keys().is_empty());

    collector.set_online(true);
    assert!(wait_until(Duration::from_secs(5), || {
        collector.person_keys().len() == 5
    }));
    let expected: Vec<String> = (1..=5).map(|i| format!("cam-1_s1_t{}", i)).collect();
    assert_eq!(collector.person_keys(), expected);

    assert!(handle.shutdown());
    let mut reopened = SqliteBatchStore::open_for_camera(dir.path(), "cam-1")?;
    assert!(reopened.is_empty()?);
    assert_eq!(status.snapshot().batches_sent, 5);
    Ok(())
}

#[test]
fn new_batches_queue_behind_the_buffer() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let collector = Arc::new(FakeCollector::default());
    let status = Arc::new(CameraStatus::new("cam-1"));
    let store = SqliteBatchStore::open_for_camera(dir.path(), "cam-1")?;
    let (sink, handle) = client().spawn(
        Box::new(store),
        collector.clone(),
        Arc::new(SystemClock::new()),
        status.clone(),
    )?;

    sink.submit(event(1));
    sink.submit(event(2));
    assert!(wait_until(Duration::from_secs(5), || {
        status.snapshot().buffered_batches == 2
    }));
    collector.set_online(true);
    sink.submit(event(3));

    assert!(wait_until(Duration::from_secs(5), || {
        collector.person_keys().len() == 3
    }));
    assert_eq!(
        collector.person_keys(),
        vec!["cam-1_s1_t1", "cam-1_s1_t2", "cam-1_s1_t3"]
    );
    assert!(handle.shutdown());
    Ok(())
}

#[test]
fn buffered_batches_survive_a_restart() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let offline = Arc::new(FakeCollector::default());
    let status = Arc::new(CameraStatus::new("cam-1"));
    let (sink, handle) = client().spawn(
        Box::new(SqliteBatchStore::open_for_camera(dir.path(), "cam-1")?),
        offline.clone(),
        Arc::new(SystemClock::new()),
        status.clone(),
    )?;
    for i in 1..=3 {
        sink.submit(event(i));
    }
    drop(sink);
    handle.shutdown();
    assert!(offline.person_keys().is_empty());

    let mut store = SqliteBatchStore::open_for_camera(dir.path(), "cam-1")?;
    assert_eq!(store.len()?, 3, "shutdown persists everything it could not send");
    drop(store);

    let online = Arc::new(FakeCollector::default());
    online.set_online(true);
    let (_sink, handle) = client().spawn(
        Box::new(SqliteBatchStore::open_for_camera(dir.path(), "cam-1")?),
        online.clone(),
        Arc::new(SystemClock::new()),
        Arc::new(CameraStatus::new("cam-1")),
    )?;
    assert!(wait_until(Duration::from_secs(5), || online.person_keys().len() == 3));
    assert_eq!(
        online.person_keys(),
        vec!["cam-1_s1_t1", "cam-1_s1_t2", "cam-1_s1_t3"]
    );
    assert!(handle.shutdown());
    Ok(())
}

#[test]
fn heartbeat_ends_the_delivery_backoff_early() -> Result<()> {
    let collector = Arc::new(FakeCollector::default());
    let status = Arc::new(CameraStatus::new("cam-1"));
    let (sink, handle) = client_with(DeliverySettings {
        backoff: hour_backoff(),
        heartbeat_interval: Duration::from_millis(50),
        ..settings()
    })
    .spawn(
        Box::new(InMemoryBatchStore::new()),
        collector.clone(),
        Arc::new(SystemClock::new()),
        status.clone(),
    )?;

    for i in 1..=3 {
        sink.submit(event(i));
    }
    assert!(
        wait_until(Duration::from_secs(5), || status.snapshot().buffered_batches == 3),
        "failing heartbeats do not hold up flushing"
    );
    assert!(
        wait_until(Duration::from_secs(5), || *collector.heartbeats.lock().unwrap() >= 3),
        "heartbeats keep probing while delivery waits out its backoff"
    );
    assert_eq!(*collector.attempts.lock().unwrap(), 1, "delivery still backing off");

    let restored = Instant::now();
    collector.set_online(true);
    assert!(wait_until(Duration::from_secs(5), || {
        collector.person_keys().len() == 3
    }));
    assert!(restored.elapsed() < Duration::from_secs(5));
    assert_eq!(
        collector.person_keys(),
        vec!["cam-1_s1_t1", "cam-1_s1_t2", "cam-1_s1_t3"]
    );
    assert!(status.snapshot().collector_reachable);
    assert!(handle.shutdown());
    Ok(())
}

/// Collector that refuses at once until stalled, then only answers when
/// its deadline runs out.
#[derive(Default)]
struct StallingCollector {
    stalled: AtomicBool,
    deadlines: Mutex<Vec<Duration>>,
}

const STALL: Duration = Duration::from_secs(5);

impl Collector for StallingCollector {
    fn post_events(&self, _batch_json: &str) -> Result<()> {
        if self.stalled.load(Ordering::SeqCst) {
            std::thread::sleep(STALL);
            return Err(anyhow!("timed out"));
        }
        Err(anyhow!("connection refused"))
    }

    fn post_events_within(&self, batch_json: &str, timeout: Duration) -> Result<()> {
        if !self.stalled.load(Ordering::SeqCst) {
            return self.post_events(batch_json);
        }
        self.deadlines.lock().unwrap().push(timeout);
        std::thread::sleep(timeout.min(STALL));
        Err(anyhow!("timed out"))
    }

    fn post_heartbeat(&self, _heartbeat: &Heartbeat) -> Result<()> {
        Err(anyhow!("connection refused"))
    }
}

#[test]
fn shutdown_replay_stays_within_the_grace_period() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let collector = Arc::new(StallingCollector::default());
    let status = Arc::new(CameraStatus::new("cam-1"));
    let grace = Duration::from_millis(300);
    let (sink, handle) = client_with(DeliverySettings {
        backoff: hour_backoff(),
        shutdown_grace: grace,
        ..settings()
    })
    .spawn(
        Box::new(SqliteBatchStore::open_for_camera(dir.path(), "cam-1")?),
        collector.clone(),
        Arc::new(SystemClock::new()),
        status.clone(),
    )?;
    for i in 1..=3 {
        sink.submit(event(i));
    }
    assert!(wait_until(Duration::from_secs(5), || {
        status.snapshot().buffered_batches == 3
    }));

    collector.stalled.store(true, Ordering::SeqCst);
    let lease = handle.buffer_lease();
    let started = Instant::now();
    assert!(handle.shutdown(), "flush thread finished within the grace period");
    assert!(started.elapsed() < Duration::from_secs(2), "{:?}", started.elapsed());
    assert!(lease.is_released());

    let deadlines = collector.deadlines.lock().unwrap().clone();
    assert_eq!(deadlines.len(), 1, "one stalled replay uses up the grace");
    assert!(deadlines[0] <= grace, "request deadline {:?}", deadlines[0]);

    let mut store = SqliteBatchStore::open_for_camera(dir.path(), "cam-1")?;
    assert_eq!(store.len()?, 3, "undelivered batches stay buffered");
    Ok(())
}
