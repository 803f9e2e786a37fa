//! Event time.
//!
//! Timestamps are integer microseconds since the Unix epoch so that
//! `exit_ts - enter_ts` is exact. The pipeline reads its clock once per frame.

use anyhow::{anyhow, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const MICROS_PER_SECOND: i64 = 1_000_000;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp {
    micros: i64,
}

impl Timestamp {
    pub const fn from_micros(micros: i64) -> Self {
        Self { micros }
    }

    pub const fn from_secs(secs: i64) -> Self {
        Self {
            micros: secs * MICROS_PER_SECOND,
        }
    }

    pub fn from_secs_f64(secs: f64) -> Self {
        Self {
            micros: (secs * MICROS_PER_SECOND as f64).round() as i64,
        }
    }

    pub fn as_micros(self) -> i64 {
        self.micros
    }

    pub fn as_secs_f64(self) -> f64 {
        self.micros as f64 / MICROS_PER_SECOND as f64
    }

    /// Seconds elapsed from `earlier` to `self`, clamped at zero.
    pub fn seconds_since(self, earlier: Timestamp) -> f64 {
        (self.micros - earlier.micros).max(0) as f64 / MICROS_PER_SECOND as f64
    }

    pub fn saturating_add(self, duration: Duration) -> Self {
        let micros = i64::try_from(duration.as_micros()).unwrap_or(i64::MAX);
        Self {
            micros: self.micros.saturating_add(micros),
        }
    }

    /// RFC 3339 UTC with microsecond precision, e.g. `2024-05-01T10:00:00.000000Z`.
    pub fn to_rfc3339(self) -> String {
        let secs = self.micros.div_euclid(MICROS_PER_SECOND);
        let nanos = (self.micros.rem_euclid(MICROS_PER_SECOND) * 1_000) as u32;
        match DateTime::<Utc>::from_timestamp(secs, nanos) {
            Some(dt) => dt.to_rfc3339_opts(SecondsFormat::Micros, true),
            None => format!("{}us", self.micros),
        }
    }

    pub fn parse_rfc3339(value: &str) -> Result<Self> {
        let parsed = DateTime::parse_from_rfc3339(value)
            .map_err(|e| anyhow!("invalid timestamp '{}': {}", value, e))?;
        Ok(Self {
            micros: parsed.timestamp_micros(),
        })
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_rfc3339())
    }
}

impl Serialize for Timestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_rfc3339())
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Timestamp::parse_rfc3339(&raw).map_err(serde::de::Error::custom)
    }
}

/// Source of event time.
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

/// Wall clock that never runs backwards.
///
/// NTP steps backwards are absorbed by holding the last reading, so
/// durations computed from two readings are never negative.
#[derive(Debug, Default)]
pub struct SystemClock {
    last: AtomicI64,
}

impl SystemClock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        let wall = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| i64::try_from(d.as_micros()).unwrap_or(i64::MAX))
            .unwrap_or(0);
        let prev = self.last.fetch_max(wall, Ordering::SeqCst);
        Timestamp::from_micros(prev.max(wall))
    }
}

/// Manually driven clock for tests and replays.
#[derive(Clone, Debug, Default)]
pub struct ManualClock {
    micros: Arc<AtomicI64>,
}

impl ManualClock {
    pub fn starting_at(ts: Timestamp) -> Self {
        Self {
            micros: Arc::new(AtomicI64::new(ts.as_micros())),
        }
    }

    pub fn set(&self, ts: Timestamp) {
        self.micros.store(ts.as_micros(), Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        let micros = i64::try_from(by.as_micros()).unwrap_or(i64::MAX);
        self.micros.fetch_add(micros, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        Timestamp::from_micros(self.micros.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rfc3339_round_trips_with_micro_precision() -> Result<()> {
        let ts = Timestamp::from_micros(1_714_557_600_123_456);
        let text = ts.to_rfc3339();
        assert_eq!(text, "2024-05-01T10:00:00.123456Z");
        assert_eq!(Timestamp::parse_rfc3339(&text)?, ts);
        Ok(())
    }

    #[test]
    fn seconds_since_is_exact_and_clamped() {
        let enter = Timestamp::from_secs(10);
        let exit = Timestamp::from_secs(15);
        assert_eq!(exit.seconds_since(enter), 5.0);
        assert_eq!(enter.seconds_since(exit), 0.0);
    }

    #[test]
    fn system_clock_is_monotonic() {
        let clock = SystemClock::new();
        let mut last = clock.now();
        for _ in 0..1000 {
            let next = clock.now();
            assert!(next >= last);
            last = next;
        }
    }

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::starting_at(Timestamp::from_secs(100));
        clock.advance(Duration::from_millis(1500));
        assert_eq!(clock.now(), Timestamp::from_micros(101_500_000));
    }
}
