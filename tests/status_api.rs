use anyhow::Result;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use footfall_edge::api::{ApiConfig, ApiHandle, ApiServer};
use footfall_edge::{StatusBoard, StatusSnapshot};

fn start(board: Arc<StatusBoard>) -> Result<ApiHandle> {
    ApiServer::new(
        ApiConfig {
            addr: "127.0.0.1:0".to_string(),
        },
        board,
    )
    .spawn()
}

fn request(handle: &ApiHandle, method: &str, path: &str) -> Result<(u16, String)> {
    let mut stream = TcpStream::connect(handle.addr)?;
    stream.set_read_timeout(Some(Duration::from_secs(5)))?;
    write!(
        stream,
        "{} {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
        method, path
    )?;
    let mut response = String::new();
    stream.read_to_string(&mut response)?;
    let status = response
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .unwrap_or(0);
    let body = response
        .split_once("\r\n\r\n")
        .map(|(_, body)| body.to_string())
        .unwrap_or_default();
    Ok((status, body))
}

#[test]
fn serves_health_and_camera_status() -> Result<()> {
    let board = Arc::new(StatusBoard::new());
    let entrance = board.register("cam-entrance-1");
    entrance.set_stream_connected(true);
    entrance.set_tracking(4, 2);
    entrance.record_restart("panic: model crashed");
    board.register("cam-zones-1");
    let handle = start(Arc::clone(&board))?;

    let (status, body) = request(&handle, "GET", "/health")?;
    assert_eq!(status, 200);
    assert_eq!(body, r#"{"status":"ok"}"#);

    let (status, body) = request(&handle, "GET", "/status")?;
    assert_eq!(status, 200);
    let all: Vec<StatusSnapshot> = serde_json::from_str(&body)?;
    let ids: Vec<&str> = all.iter().map(|s| s.camera_id.as_str()).collect();
    assert_eq!(ids, vec!["cam-entrance-1", "cam-zones-1"]);

    let (status, body) = request(&handle, "GET", "/status/cam-entrance-1")?;
    assert_eq!(status, 200);
    let one: StatusSnapshot = serde_json::from_str(&body)?;
    assert!(one.stream_connected);
    assert_eq!(one.active_tracks, 4);
    assert_eq!(one.open_occupancies, 2);
    assert_eq!(one.restarts, 1);
    assert_eq!(one.last_error.as_deref(), Some("panic: model crashed"));

    handle.stop()?;
    Ok(())
}

#[test]
fn rejects_unknown_paths_and_methods() -> Result<()> {
    let board = Arc::new(StatusBoard::new());
    board.register("cam-1");
    let handle = start(board)?;

    assert_eq!(request(&handle, "GET", "/status/cam-missing")?.0, 404);
    assert_eq!(request(&handle, "GET", "/metrics")?.0, 404);
    assert_eq!(request(&handle, "POST", "/status")?.0, 405);
    assert_eq!(request(&handle, "GET", "/health?verbose=1")?.0, 200);

    handle.stop()?;
    Ok(())
}

#[test]
fn refuses_non_loopback_bind() {
    let result = ApiServer::new(
        ApiConfig {
            addr: "0.0.0.0:0".to_string(),
        },
        Arc::new(StatusBoard::new()),
    )
    .spawn();
    assert!(result.is_err());
}
