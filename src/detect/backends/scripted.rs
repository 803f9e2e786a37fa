use std::collections::VecDeque;

use anyhow::{anyhow, Result};

use crate::detect::backend::DetectorBackend;
use crate::detect::result::Detection;
use crate::frame::Frame;

/// One scripted reply.
#[derive(Clone, Debug)]
pub enum ScriptStep {
    Detections(Vec<Detection>),
    Fail(String),
    Panic(String),
}

/// Detector that replays a fixed script, one step per frame.
///
/// Once the script is exhausted every frame yields no detections.
pub struct ScriptedBackend {
    steps: VecDeque<ScriptStep>,
}

impl ScriptedBackend {
    pub const NAME: &'static str = "scripted";

    pub fn new(steps: impl IntoIterator<Item = ScriptStep>) -> Self {
        Self {
            steps: steps.into_iter().collect(),
        }
    }

    pub fn remaining(&self) -> usize {
        self.steps.len()
    }
}

impl DetectorBackend for ScriptedBackend {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn detect(&mut self, _frame: &Frame) -> Result<Vec<Detection>> {
        match self.steps.pop_front() {
            Some(ScriptStep::Detections(detections)) => Ok(detections),
            Some(ScriptStep::Fail(reason)) => Err(anyhow!(reason)),
            Some(ScriptStep::Panic(reason)) => panic!("{}", reason),
            None => Ok(Vec::new()),
        }
    }
}
