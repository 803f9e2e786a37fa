//! Typed pipeline faults.
//!
//! Faults travel inside `anyhow::Error` and are recovered at the pipeline and
//! client boundaries with `downcast_ref::<Fault>()`.

#[derive(Clone, Debug, PartialEq)]
pub enum Fault {
    /// Stream connect or read failed; retried with backoff indefinitely.
    Stream { camera_id: String, reason: String },
    /// Detector failed `consecutive` frames in a row past the restart threshold.
    Detector {
        camera_id: String,
        consecutive: u32,
        reason: String,
    },
    /// A batch could not be delivered and was buffered for retry.
    Delivery { camera_id: String, reason: String },
    /// Configuration rejected. `camera_id` is `None` for global settings.
    Config {
        camera_id: Option<String>,
        reason: String,
    },
    /// The durable buffer was full and `evicted` oldest batches were dropped.
    BufferExhaustion { camera_id: String, evicted: u64 },
}

impl Fault {
    pub fn kind(&self) -> &'static str {
        match self {
            Fault::Stream { .. } => "stream",
            Fault::Detector { .. } => "detector",
            Fault::Delivery { .. } => "delivery",
            Fault::Config { .. } => "config",
            Fault::BufferExhaustion { .. } => "buffer_exhaustion",
        }
    }

    pub fn config(camera_id: Option<&str>, reason: impl Into<String>) -> Self {
        Fault::Config {
            camera_id: camera_id.map(str::to_string),
            reason: reason.into(),
        }
    }
}

impl std::fmt::Display for Fault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Fault::Stream { camera_id, reason } => {
                write!(f, "[{}] stream fault: {}", camera_id, reason)
            }
            Fault::Detector {
                camera_id,
                consecutive,
                reason,
            } => write!(
                f,
                "[{}] detector failed {} consecutive frames: {}",
                camera_id, consecutive, reason
            ),
            Fault::Delivery { camera_id, reason } => {
                write!(f, "[{}] delivery fault: {}", camera_id, reason)
            }
            Fault::Config {
                camera_id: Some(camera_id),
                reason,
            } => write!(f, "[{}] config rejected: {}", camera_id, reason),
            Fault::Config {
                camera_id: None,
                reason,
            } => write!(f, "config rejected: {}", reason),
            Fault::BufferExhaustion { camera_id, evicted } => write!(
                f,
                "[{}] buffer full, evicted {} oldest batch(es)",
                camera_id, evicted
            ),
        }
    }
}

impl std::error::Error for Fault {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fault_survives_anyhow_downcast() {
        let err = anyhow::Error::new(Fault::Detector {
            camera_id: "cam-1".into(),
            consecutive: 6,
            reason: "model crashed".into(),
        });
        let fault = err.downcast_ref::<Fault>().expect("fault");
        assert_eq!(fault.kind(), "detector");
        assert!(err.to_string().contains("cam-1"));
    }
}
