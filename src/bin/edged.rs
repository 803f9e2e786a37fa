//! edged - footfall edge daemon
//!
//! Runs one supervised pipeline per configured camera:
//! 1. Reads frames from RTSP (or `stub://` demo streams)
//! 2. Detects and tracks people, evaluates entrance lines and regions
//! 3. Delivers events to the collector, buffering to SQLite when offline
//! 4. Serves a loopback status API
//! 5. Polls the config file and restarts only the cameras that changed

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use footfall_edge::{
    api::{ApiConfig, ApiServer},
    config::EdgeConfig,
    ingest::rtsp_source_factory,
    supervisor::{batch_store_factory, http_collector_factory, Supervisor, SupervisorDeps},
    BackendRegistry, StatusBoard, SystemClock,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Footfall edge pipeline daemon")]
struct Args {
    /// Config file (JSON, or TOML with a .toml extension).
    #[arg(long, env = "EDGE_CONFIG")]
    config: Option<PathBuf>,

    /// Loopback address for the status API (overrides the config file).
    #[arg(long)]
    status_addr: Option<String>,

    /// Seconds between config file checks; 0 disables reloading.
    #[arg(long, env = "EDGE_RELOAD_SECS", default_value_t = 10)]
    reload_secs: u64,

    /// Detector backend name (overrides the config file).
    #[arg(long, env = "EDGE_DETECTOR")]
    detector: Option<String>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let registry = BackendRegistry::with_builtin();
    let mut cfg = load_config(&args)?;
    if let Some(backend) = &args.detector {
        if !registry.list().contains(backend) {
            return Err(anyhow!(
                "unknown detector backend '{}' (available: {})",
                backend,
                registry.list().join(", ")
            ));
        }
        cfg.detector.backend = backend.clone();
    }
    if let Some(addr) = &args.status_addr {
        cfg.status_addr = addr.clone();
    }
    let runtime = cfg.runtime_settings();

    let status = Arc::new(StatusBoard::new());
    let deps = SupervisorDeps {
        detectors: registry,
        sources: rtsp_source_factory(cfg.stream.clone()),
        collectors: http_collector_factory(cfg.collector.clone()),
        stores: batch_store_factory(Some(cfg.buffer_dir.clone())),
        clock: Arc::new(SystemClock::new()),
        status: Arc::clone(&status),
    };

    let api_handle = ApiServer::new(
        ApiConfig {
            addr: cfg.status_addr.clone(),
        },
        Arc::clone(&status),
    )
    .spawn()?;

    log::info!(
        "edged running: org={} store={} collector={} buffer={}",
        cfg.org_id,
        cfg.store_id,
        cfg.collector.api_base,
        cfg.buffer_dir.display()
    );
    let mut supervisor = Supervisor::new(runtime.clone(), deps);
    let summary = supervisor.apply(cfg.cameras.clone());
    log::info!(
        "started {} camera(s), {} failed to start, {} rejected by config",
        summary.added.len(),
        summary.failed.len(),
        cfg.rejected.len()
    );

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .expect("error setting Ctrl-C handler");

    let reload_every = Duration::from_secs(args.reload_secs);
    let mut last_modified = cfg.source.as_deref().and_then(modified_at);
    loop {
        let wait = if reload_every.is_zero() {
            Duration::from_secs(3600)
        } else {
            reload_every
        };
        match rx.recv_timeout(wait) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }
        if reload_every.is_zero() {
            continue;
        }
        let Some(path) = cfg.source.clone() else {
            continue;
        };
        let modified = modified_at(&path);
        if modified.is_none() || modified == last_modified {
            continue;
        }
        last_modified = modified;

        log::info!("config file {} changed, reloading", path.display());
        match EdgeConfig::load_from(&path) {
            Ok(mut next) => {
                next.detector.backend = cfg.detector.backend.clone();
                if next.runtime_settings() != runtime
                    || next.collector != cfg.collector
                    || next.stream != cfg.stream
                    || next.buffer_dir != cfg.buffer_dir
                {
                    log::warn!("global settings changed; they take effect after a restart of edged");
                }
                let summary = supervisor.apply(next.cameras.clone());
                log::info!(
                    "reload applied: {} added, {} changed, {} removed, {} unchanged, {} failed",
                    summary.added.len(),
                    summary.changed.len(),
                    summary.removed.len(),
                    summary.unchanged.len(),
                    summary.failed.len()
                );
            }
            Err(err) => {
                log::error!("config reload rejected, keeping current cameras: {:#}", err);
            }
        }
    }

    log::info!("shutdown signal received, stopping cameras...");
    supervisor.shutdown();
    api_handle.stop()?;
    log::info!("edged stopped");
    Ok(())
}

fn load_config(args: &Args) -> Result<EdgeConfig> {
    match &args.config {
        Some(path) => EdgeConfig::load_from(path),
        None => EdgeConfig::load(),
    }
}

fn modified_at(path: &std::path::Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}
