//! Occupancy events and the batch envelope sent to the collector.
//!
//! Wire shapes (every event also carries `event_id` and `camera_id`):
//!
//! ```text
//! entrance  {type, ts, direction, person_key, line_id}
//! zone      {type, ts, zone_id,  enter_ts, exit_ts, dwell_seconds, person_key}
//! shelf     {type, ts, shelf_id, enter_ts, exit_ts, dwell_seconds, person_key}
//! queue     {type, ts, queue_id, enter_ts, exit_ts, wait_seconds,  person_key}
//! ```
//!
//! `event_id` is a content hash, so a batch replayed after an ambiguous
//! failure carries the same ids and the collector can drop duplicates.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::clock::Timestamp;
use crate::geometry::Direction;
use crate::region::PolygonKind;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EntranceEvent {
    pub event_id: String,
    pub ts: Timestamp,
    pub camera_id: String,
    pub person_key: String,
    pub line_id: String,
    pub direction: Direction,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ZoneEvent {
    pub event_id: String,
    pub ts: Timestamp,
    pub camera_id: String,
    pub person_key: String,
    pub zone_id: String,
    pub enter_ts: Timestamp,
    pub exit_ts: Timestamp,
    pub dwell_seconds: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ShelfEvent {
    pub event_id: String,
    pub ts: Timestamp,
    pub camera_id: String,
    pub person_key: String,
    pub shelf_id: String,
    pub enter_ts: Timestamp,
    pub exit_ts: Timestamp,
    pub dwell_seconds: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueueEvent {
    pub event_id: String,
    pub ts: Timestamp,
    pub camera_id: String,
    pub person_key: String,
    pub queue_id: String,
    pub enter_ts: Timestamp,
    pub exit_ts: Timestamp,
    pub wait_seconds: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Event {
    Entrance(EntranceEvent),
    Zone(ZoneEvent),
    Shelf(ShelfEvent),
    Queue(QueueEvent),
}

/// Hex SHA-256 over `camera_id|person_key|ts|type|logical_key`.
pub fn event_id(
    camera_id: &str,
    person_key: &str,
    ts: Timestamp,
    kind: &str,
    logical_key: &str,
) -> String {
    let ts = ts.to_rfc3339();
    let mut hasher = Sha256::new();
    for (i, part) in [camera_id, person_key, ts.as_str(), kind, logical_key]
        .iter()
        .enumerate()
    {
        if i > 0 {
            hasher.update(b"|");
        }
        hasher.update(part.as_bytes());
    }
    hex::encode(hasher.finalize())
}

impl Event {
    pub fn entrance(
        camera_id: &str,
        person_key: &str,
        line_id: &str,
        direction: Direction,
        ts: Timestamp,
    ) -> Self {
        let logical_key = format!("{}:{}", line_id, direction.as_str());
        Event::Entrance(EntranceEvent {
            event_id: event_id(camera_id, person_key, ts, "entrance", &logical_key),
            ts,
            camera_id: camera_id.to_string(),
            person_key: person_key.to_string(),
            line_id: line_id.to_string(),
            direction,
        })
    }

    /// Closed presence interval in a polygon region. `ts` is the exit time.
    pub fn presence(
        kind: PolygonKind,
        camera_id: &str,
        person_key: &str,
        region_id: &str,
        enter_ts: Timestamp,
        exit_ts: Timestamp,
    ) -> Self {
        let exit_ts = exit_ts.max(enter_ts);
        let seconds = exit_ts.seconds_since(enter_ts);
        let logical_key = format!("{}:{}", region_id, enter_ts.to_rfc3339());
        let event_id = event_id(camera_id, person_key, exit_ts, kind.as_str(), &logical_key);
        let camera_id = camera_id.to_string();
        let person_key = person_key.to_string();
        let region_id = region_id.to_string();
        match kind {
            PolygonKind::Zone => Event::Zone(ZoneEvent {
                event_id,
                ts: exit_ts,
                camera_id,
                person_key,
                zone_id: region_id,
                enter_ts,
                exit_ts,
                dwell_seconds: seconds,
            }),
            PolygonKind::Shelf => Event::Shelf(ShelfEvent {
                event_id,
                ts: exit_ts,
                camera_id,
                person_key,
                shelf_id: region_id,
                enter_ts,
                exit_ts,
                dwell_seconds: seconds,
            }),
            PolygonKind::Queue => Event::Queue(QueueEvent {
                event_id,
                ts: exit_ts,
                camera_id,
                person_key,
                queue_id: region_id,
                enter_ts,
                exit_ts,
                wait_seconds: seconds,
            }),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Event::Entrance(_) => "entrance",
            Event::Zone(_) => "zone",
            Event::Shelf(_) => "shelf",
            Event::Queue(_) => "queue",
        }
    }

    pub fn event_id(&self) -> &str {
        match self {
            Event::Entrance(e) => &e.event_id,
            Event::Zone(e) => &e.event_id,
            Event::Shelf(e) => &e.event_id,
            Event::Queue(e) => &e.event_id,
        }
    }

    pub fn ts(&self) -> Timestamp {
        match self {
            Event::Entrance(e) => e.ts,
            Event::Zone(e) => e.ts,
            Event::Shelf(e) => e.ts,
            Event::Queue(e) => e.ts,
        }
    }

    pub fn camera_id(&self) -> &str {
        match self {
            Event::Entrance(e) => &e.camera_id,
            Event::Zone(e) => &e.camera_id,
            Event::Shelf(e) => &e.camera_id,
            Event::Queue(e) => &e.camera_id,
        }
    }

    pub fn person_key(&self) -> &str {
        match self {
            Event::Entrance(e) => &e.person_key,
            Event::Zone(e) => &e.person_key,
            Event::Shelf(e) => &e.person_key,
            Event::Queue(e) => &e.person_key,
        }
    }

    /// Line or polygon region id the event refers to.
    pub fn region_id(&self) -> &str {
        match self {
            Event::Entrance(e) => &e.line_id,
            Event::Zone(e) => &e.zone_id,
            Event::Shelf(e) => &e.shelf_id,
            Event::Queue(e) => &e.queue_id,
        }
    }

    /// `(enter_ts, exit_ts, seconds)` for presence events.
    pub fn interval(&self) -> Option<(Timestamp, Timestamp, f64)> {
        match self {
            Event::Entrance(_) => None,
            Event::Zone(e) => Some((e.enter_ts, e.exit_ts, e.dwell_seconds)),
            Event::Shelf(e) => Some((e.enter_ts, e.exit_ts, e.dwell_seconds)),
            Event::Queue(e) => Some((e.enter_ts, e.exit_ts, e.wait_seconds)),
        }
    }
}

/// Unit of transmission and persistence for one camera.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventBatch {
    pub org_id: String,
    pub store_id: String,
    pub camera_id: String,
    pub device_ts: Timestamp,
    pub events: Vec<Event>,
}

impl EventBatch {
    pub fn to_json(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[test]
    fn entrance_wire_shape() -> anyhow::Result<()> {
        let event = Event::entrance(
            "cam-1",
            "cam-1_s100_t7",
            "door",
            Direction::In,
            Timestamp::from_secs(1_714_557_600),
        );
        let value: Value = serde_json::to_value(&event)?;
        assert_eq!(value["type"], "entrance");
        assert_eq!(value["direction"], "in");
        assert_eq!(value["line_id"], "door");
        assert_eq!(value["ts"], "2024-05-01T10:00:00.000000Z");
        assert_eq!(value["event_id"].as_str().map(str::len), Some(64));
        Ok(())
    }

    #[test]
    fn presence_kinds_use_their_own_field_names() -> anyhow::Result<()> {
        let enter = Timestamp::from_secs(10);
        let exit = Timestamp::from_secs(15);
        let zone = serde_json::to_value(Event::presence(
            PolygonKind::Zone, "c", "p", "z1", enter, exit,
        ))?;
        assert_eq!(zone["zone_id"], "z1");
        assert_eq!(zone["dwell_seconds"], json!(5.0));
        let shelf = serde_json::to_value(Event::presence(
            PolygonKind::Shelf, "c", "p", "s1", enter, exit,
        ))?;
        assert_eq!(shelf["type"], "shelf");
        assert_eq!(shelf["shelf_id"], "s1");
        let queue = serde_json::to_value(Event::presence(
            PolygonKind::Queue, "c", "p", "q1", enter, exit,
        ))?;
        assert_eq!(queue["queue_id"], "q1");
        assert_eq!(queue["wait_seconds"], json!(5.0));
        assert!(queue.get("dwell_seconds").is_none());
        Ok(())
    }

    #[test]
    fn event_id_is_deterministic_and_distinguishing() {
        let ts = Timestamp::from_secs(1);
        let a = event_id("cam", "p1", ts, "zone", "z1");
        assert_eq!(a, event_id("cam", "p1", ts, "zone", "z1"));
        assert_ne!(a, event_id("cam", "p1", ts, "zone", "z2"));
        assert_ne!(a, event_id("cam", "p2", ts, "zone", "z1"));
    }

    #[test]
    fn batch_envelope_parses_back() -> anyhow::Result<()> {
        let batch = EventBatch {
            org_id: "org".into(),
            store_id: "store".into(),
            camera_id: "cam-1".into(),
            device_ts: Timestamp::from_secs(20),
            events: vec![Event::presence(
                PolygonKind::Zone,
                "cam-1",
                "p",
                "z1",
                Timestamp::from_secs(10),
                Timestamp::from_secs(10),
            )],
        };
        let parsed: EventBatch = serde_json::from_str(&batch.to_json()?)?;
        assert_eq!(parsed, batch);
        assert_eq!(parsed.events[0].interval().map(|i| i.2), Some(0.0));
        Ok(())
    }
}
