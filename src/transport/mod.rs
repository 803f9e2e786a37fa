//! Collector transport.
//!
//! The `Collector` trait is the seam between the event client and the
//! network: `HttpCollector` posts JSON with a per-camera bearer credential,
//! tests substitute in-memory fakes.

mod http;

pub use http::HttpCollector;
pub(crate) use http::validate_api_base;

use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::clock::Timestamp;
use crate::status::StatusSnapshot;

/// Liveness report for one camera.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub org_id: String,
    pub store_id: String,
    pub camera_id: String,
    pub ts: Timestamp,
    pub status: StatusSnapshot,
}

/// Remote event sink.
///
/// Any `Err` is a delivery failure: transport error, timeout or non-2xx.
pub trait Collector: Send + Sync {
    /// Post one serialized `EventBatch`.
    fn post_events(&self, batch_json: &str) -> Result<()>;

    /// Like `post_events`, but the request must finish within `timeout`.
    ///
    /// Collectors without a per-request deadline ignore the limit.
    fn post_events_within(&self, batch_json: &str, _timeout: Duration) -> Result<()> {
        self.post_events(batch_json)
    }

    fn post_heartbeat(&self, heartbeat: &Heartbeat) -> Result<()>;
}

#[derive(Clone, Debug, PartialEq)]
pub struct CollectorSettings {
    pub api_base: String,
    pub events_path: String,
    pub heartbeat_path: String,
    pub events_timeout: Duration,
    pub heartbeat_timeout: Duration,
}

impl Default for CollectorSettings {
    fn default() -> Self {
        Self {
            api_base: "http://127.0.0.1:8000".to_string(),
            events_path: "/api/ingest/events".to_string(),
            heartbeat_path: "/api/ingest/heartbeat".to_string(),
            events_timeout: Duration::from_secs(10),
            heartbeat_timeout: Duration::from_secs(5),
        }
    }
}
