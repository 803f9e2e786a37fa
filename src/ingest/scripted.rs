//! Scripted frame source for tests and replays.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};

use crate::clock::ManualClock;
use crate::frame::Frame;
use crate::ingest::FrameSource;

/// One scripted stream step.
#[derive(Clone, Debug, PartialEq)]
pub enum SourceStep {
    /// Deliver a blank frame.
    Frame,
    /// Drop the connection while reading.
    Drop(String),
    /// Refuse the next connect attempt.
    Refuse(String),
}

/// Plays a fixed script of frames and stream faults.
///
/// When the script runs out every read fails; if a stop flag was attached it
/// is raised first, so a pipeline driven by this source winds down by itself.
pub struct ScriptedSource {
    steps: VecDeque<SourceStep>,
    width: u32,
    height: u32,
    seq: u64,
    connected: bool,
    connects: Arc<AtomicU32>,
    clock: Option<(ManualClock, Duration)>,
    stop_when_exhausted: Option<Arc<AtomicBool>>,
}

impl ScriptedSource {
    pub fn new(width: u32, height: u32, steps: impl IntoIterator<Item = SourceStep>) -> Self {
        Self {
            steps: steps.into_iter().collect(),
            width,
            height,
            seq: 0,
            connected: false,
            connects: Arc::new(AtomicU32::new(0)),
            clock: None,
            stop_when_exhausted: None,
        }
    }

    /// `n` frames in a row.
    pub fn frames(width: u32, height: u32, n: usize) -> Self {
        Self::new(width, height, std::iter::repeat(SourceStep::Frame).take(n))
    }

    /// Advances `clock` by `per_frame` before every delivered frame.
    pub fn advancing(mut self, clock: ManualClock, per_frame: Duration) -> Self {
        self.clock = Some((clock, per_frame));
        self
    }

    pub fn stop_when_exhausted(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop_when_exhausted = Some(stop);
        self
    }

    /// Shared counter of successful connects.
    pub fn connect_counter(&self) -> Arc<AtomicU32> {
        Arc::clone(&self.connects)
    }
}

impl FrameSource for ScriptedSource {
    fn connect(&mut self) -> Result<()> {
        if let Some(SourceStep::Refuse(reason)) = self.steps.front() {
            let reason = reason.clone();
            self.steps.pop_front();
            return Err(anyhow!("connect refused: {}", reason));
        }
        self.connected = true;
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Frame> {
        if !self.connected {
            return Err(anyhow!("not connected"));
        }
        match self.steps.pop_front() {
            Some(SourceStep::Frame) => {
                if let Some((clock, step)) = &self.clock {
                    clock.advance(*step);
                }
                self.seq += 1;
                Ok(Frame::blank(self.width, self.height, self.seq))
            }
            Some(SourceStep::Drop(reason)) => {
                self.connected = false;
                Err(anyhow!("stream dropped: {}", reason))
            }
            Some(refuse @ SourceStep::Refuse(_)) => {
                self.steps.push_front(refuse);
                self.connected = false;
                Err(anyhow!("stream dropped"))
            }
            None => {
                if let Some(stop) = &self.stop_when_exhausted {
                    stop.store(true, Ordering::SeqCst);
                }
                Err(anyhow!("script exhausted"))
            }
        }
    }

    fn close(&mut self) {
        self.connected = false;
    }

    fn is_healthy(&self) -> bool {
        self.connected
    }
}
