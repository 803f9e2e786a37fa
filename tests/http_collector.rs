use anyhow::Result;
use std::io::{Read, Write};
use std::net::TcpListener;
use std::sync::mpsc;
use std::thread::JoinHandle;
use std::time::Duration;

use footfall_edge::transport::{Collector, CollectorSettings, Heartbeat, HttpCollector};
use footfall_edge::{StatusSnapshot, Timestamp};

struct Captured {
    request_line: String,
    headers: Vec<(String, String)>,
    body: String,
}

impl Captured {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Serves one request with `status`, reporting what it received.
fn one_shot_server(status: u16) -> Result<(String, mpsc::Receiver<Captured>, JoinHandle<()>)> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let base = format!("http://{}", listener.local_addr()?);
    let (tx, rx) = mpsc::channel();
    let join = std::thread::spawn(move || {
        let (mut stream, _) = listener.accept().expect("accept");
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .expect("timeout");
        let mut data = Vec::new();
        let mut buf = [0u8; 4096];
        let header_end = loop {
            let n = stream.read(&mut buf).expect("read");
            assert!(n > 0, "client closed early");
            data.extend_from_slice(&buf[..n]);
            if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
        };
        let head = String::from_utf8_lossy(&data[..header_end]).to_string();
        let mut lines = head.split("\r\n");
        let request_line = lines.next().unwrap_or_default().to_string();
        let headers: Vec<(String, String)> = lines
            .filter_map(|l| l.split_once(':'))
            .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
            .collect();
        let length: usize = headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
            .and_then(|(_, v)| v.parse().ok())
            .unwrap_or(0);
        while data.len() < header_end + length {
            let n = stream.read(&mut buf).expect("read body");
            if n == 0 {
                break;
            }
            data.extend_from_slice(&buf[..n]);
        }
        let body = String::from_utf8_lossy(&data[header_end..]).to_string();

        let reply = if status == 200 { r#"{"inserted":1}"# } else { r#"{"error":"nope"}"# };
        let response = format!(
            "HTTP/1.1 {} X\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            status,
            reply.len(),
            reply
        );
        stream.write_all(response.as_bytes()).expect("write");
        let _ = tx.send(Captured {
            request_line,
            headers,
            body,
        });
    });
    Ok((base, rx, join))
}

fn settings(api_base: &str) -> CollectorSettings {
    CollectorSettings {
        api_base: api_base.to_string(),
        events_timeout: Duration::from_secs(2),
        heartbeat_timeout: Duration::from_secs(2),
        ..CollectorSettings::default()
    }
}

#[test]
fn posts_events_with_bearer_credential() -> Result<()> {
    let (base, rx, join) = one_shot_server(200)?;
    let collector = HttpCollector::new(&settings(&base), "cam-secret")?;
    let payload = r#"{"org_id":"o","store_id":"s","camera_id":"cam-1","device_ts":"2024-01-01T00:00:00.000000Z","events":[]}"#;
    collector.post_events(payload)?;

    let captured = rx.recv_timeout(Duration::from_secs(5))?;
    join.join().expect("server thread");
    assert_eq!(captured.request_line, "POST /api/ingest/events HTTP/1.1");
    assert_eq!(captured.header("authorization"), Some("Bearer cam-secret"));
    assert_eq!(captured.header("content-type"), Some("application/json"));
    assert_eq!(captured.body, payload);
    Ok(())
}

#[test]
fn non_success_status_is_a_delivery_failure() -> Result<()> {
    let (base, rx, join) = one_shot_server(503)?;
    let collector = HttpCollector::new(&settings(&base), "k")?;
    let err = collector
        .post_events("{}")
        .expect_err("503 must fail");
    assert!(format!("{:#}", err).contains("503"), "{:#}", err);
    rx.recv_timeout(Duration::from_secs(5))?;
    join.join().expect("server thread");
    Ok(())
}

#[test]
fn heartbeat_carries_status() -> Result<()> {
    let (base, rx, join) = one_shot_server(200)?;
    let collector = HttpCollector::new(&settings(&base), "k")?;
    let heartbeat = Heartbeat {
        org_id: "org-1".into(),
        store_id: "store-1".into(),
        camera_id: "cam-1".into(),
        ts: Timestamp::from_secs(1_700_000_000),
        status: StatusSnapshot {
            camera_id: "cam-1".into(),
            active_tracks: 3,
            buffered_batches: 7,
            ..StatusSnapshot::default()
        },
    };
    collector.post_heartbeat(&heartbeat)?;

    let captured = rx.recv_timeout(Duration::from_secs(5))?;
    join.join().expect("server thread");
    assert_eq!(captured.request_line, "POST /api/ingest/heartbeat HTTP/1.1");
    let sent: Heartbeat = serde_json::from_str(&captured.body)?;
    assert_eq!(sent, heartbeat);
    Ok(())
}

#[test]
fn unreachable_collector_is_a_delivery_failure() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let base = format!("http://{}", listener.local_addr()?);
    drop(listener);
    let collector = HttpCollector::new(&settings(&base), "k")?;
    assert!(collector.post_events("{}").is_err());
    Ok(())
}
