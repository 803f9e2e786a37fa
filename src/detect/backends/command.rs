//! External detector process.
//!
//! The child speaks line-delimited JSON over stdin/stdout. For each frame the
//! backend writes one header line followed by the raw RGB24 bytes:
//!
//! ```text
//! {"seq":42,"width":1280,"height":720,"format":"rgb24","bytes":2764800}\n<bytes>
//! ```
//!
//! and reads one reply line:
//!
//! ```text
//! {"detections":[{"bbox":[x1,y1,x2,y2],"confidence":0.91,"class":"person"}]}
//! {"error":"model not loaded"}
//! ```
//!
//! Detections with a `class` other than `person` are ignored. A missing or
//! late reply kills the child; it is respawned on the next frame.

use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

use crate::detect::backend::DetectorBackend;
use crate::detect::result::{BoundingBox, Detection};
use crate::detect::DetectorSettings;
use crate::frame::Frame;

#[derive(Serialize)]
struct FrameHeader<'a> {
    seq: u64,
    width: u32,
    height: u32,
    format: &'a str,
    bytes: usize,
}

#[derive(Deserialize)]
struct DetectorReply {
    #[serde(default)]
    detections: Vec<ReplyDetection>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct ReplyDetection {
    bbox: [f64; 4],
    confidence: f32,
    #[serde(default)]
    class: Option<String>,
}

struct RunningDetector {
    child: Child,
    stdin: ChildStdin,
    replies: Receiver<std::io::Result<String>>,
}

impl RunningDetector {
    fn kill(mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

pub struct CommandBackend {
    camera_id: String,
    program: String,
    args: Vec<String>,
    timeout: Duration,
    running: Option<RunningDetector>,
}

impl CommandBackend {
    pub const NAME: &'static str = "command";

    pub fn new(camera_id: &str, program: &str, args: &[String], timeout: Duration) -> Self {
        Self {
            camera_id: camera_id.to_string(),
            program: program.to_string(),
            args: args.to_vec(),
            timeout,
            running: None,
        }
    }

    pub fn from_settings(settings: &DetectorSettings, camera_id: &str) -> Result<Self> {
        let (program, args) = settings
            .command
            .split_first()
            .ok_or_else(|| anyhow!("command detector requires detector.command"))?;
        Ok(Self::new(camera_id, program, args, settings.timeout))
    }

    fn spawn(&self) -> Result<RunningDetector> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env("EDGE_CAMERA_ID", &self.camera_id)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .with_context(|| format!("spawn detector '{}'", self.program))?;
        let stdin = child.stdin.take().context("detector stdin unavailable")?;
        let stdout = child.stdout.take().context("detector stdout unavailable")?;

        let (tx, replies) = mpsc::channel();
        std::thread::Builder::new()
            .name(format!("detector-{}", self.camera_id))
            .spawn(move || {
                for line in BufReader::new(stdout).lines() {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
            })
            .context("spawn detector reader thread")?;

        log::info!(
            "[{}] detector process '{}' started (pid {})",
            self.camera_id,
            self.program,
            child.id()
        );
        Ok(RunningDetector {
            child,
            stdin,
            replies,
        })
    }

    fn exchange(&mut self, frame: &Frame) -> Result<String> {
        if self.running.is_none() {
            self.running = Some(self.spawn()?);
        }
        let running = self
            .running
            .as_mut()
            .ok_or_else(|| anyhow!("detector process not running"))?;

        let header = serde_json::to_string(&FrameHeader {
            seq: frame.seq,
            width: frame.width,
            height: frame.height,
            format: "rgb24",
            bytes: frame.pixels().len(),
        })?;
        running
            .stdin
            .write_all(header.as_bytes())
            .and_then(|_| running.stdin.write_all(b"\n"))
            .and_then(|_| running.stdin.write_all(frame.pixels()))
            .and_then(|_| running.stdin.flush())
            .context("write frame to detector")?;

        match running.replies.recv_timeout(self.timeout) {
            Ok(Ok(line)) => Ok(line),
            Ok(Err(err)) => Err(anyhow!("read detector reply: {}", err)),
            Err(RecvTimeoutError::Timeout) => {
                Err(anyhow!("detector reply timed out after {:?}", self.timeout))
            }
            Err(RecvTimeoutError::Disconnected) => Err(anyhow!("detector process exited")),
        }
    }

    fn restart_on_next_frame(&mut self) {
        if let Some(running) = self.running.take() {
            running.kill();
        }
    }
}

fn parse_reply(line: &str) -> Result<Vec<Detection>> {
    let reply: DetectorReply =
        serde_json::from_str(line).with_context(|| format!("malformed detector reply: {}", line))?;
    if let Some(error) = reply.error {
        return Err(anyhow!("detector reported: {}", error));
    }
    Ok(reply
        .detections
        .into_iter()
        .filter(|d| d.class.as_deref().map_or(true, |c| c == "person"))
        .map(|d| {
            let [x1, y1, x2, y2] = d.bbox;
            Detection::new(BoundingBox::new(x1, y1, x2, y2), d.confidence)
        })
        .collect())
}

impl DetectorBackend for CommandBackend {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        match self.exchange(frame) {
            Ok(line) => parse_reply(&line),
            Err(err) => {
                self.restart_on_next_frame();
                Err(err)
            }
        }
    }

    fn warm_up(&mut self) -> Result<()> {
        if self.running.is_none() {
            self.running = Some(self.spawn()?);
        }
        Ok(())
    }
}

impl Drop for CommandBackend {
    fn drop(&mut self) {
        self.restart_on_next_frame();
    }
}
