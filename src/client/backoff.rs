//! Jittered exponential backoff as explicit state.
//!
//! `current` is the un-jittered delay of the latest failure, `attempts` the
//! number of consecutive failures, `next_eligible` the earliest instant the
//! next attempt may run. Callers pass `Instant`s in, which keeps the schedule
//! deterministic under test.

use std::time::{Duration, Instant};

use rand::Rng;

#[derive(Clone, Debug, PartialEq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub factor: f64,
    pub max: Duration,
    /// Relative jitter in `[0, 1)`: each delay is scaled by `1 ± jitter`.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            factor: 1.5,
            max: Duration::from_secs(60),
            jitter: 0.2,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Backoff {
    policy: BackoffPolicy,
    current: Duration,
    attempts: u32,
    next_eligible: Option<Instant>,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            current: Duration::ZERO,
            attempts: 0,
            next_eligible: None,
            policy,
        }
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn next_eligible(&self) -> Option<Instant> {
        self.next_eligible
    }

    /// True when no wait is pending at `now`.
    pub fn ready(&self, now: Instant) -> bool {
        self.next_eligible.map_or(true, |at| now >= at)
    }

    /// True while a failure streak is in progress.
    pub fn is_backing_off(&self) -> bool {
        self.attempts > 0
    }

    /// Records a failure and returns the (jittered) wait before the next attempt.
    pub fn on_failure(&mut self, now: Instant) -> Duration {
        self.attempts = self.attempts.saturating_add(1);
        let grown = if self.attempts == 1 {
            self.policy.initial
        } else {
            self.current.mul_f64(self.policy.factor.max(1.0))
        };
        self.current = grown.min(self.policy.max);

        let delay = self.jittered(self.current);
        self.next_eligible = Some(now + delay);
        delay
    }

    /// Clears the failure streak.
    pub fn on_success(&mut self) {
        self.attempts = 0;
        self.current = Duration::ZERO;
        self.next_eligible = None;
    }

    /// Drops the pending wait but keeps the streak, so a repeated failure keeps growing.
    pub fn force_ready(&mut self) {
        self.next_eligible = None;
    }

    fn jittered(&self, base: Duration) -> Duration {
        let jitter = self.policy.jitter.clamp(0.0, 0.99);
        if jitter == 0.0 || base.is_zero() {
            return base;
        }
        let scale = 1.0 + rand::thread_rng().gen_range(-jitter..=jitter);
        base.mul_f64(scale).min(self.policy.max)
    }
}
