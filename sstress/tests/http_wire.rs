//! A full instance over the HTTP transport, checked on the wire.

use std::io::{Read, Write};
use std::net::TcpListener;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::mpsc;
use std::thread;

use sstress::config::HarnessConfig;
use sstress::policy::Policy;
use sstress::runtime::instance::{Instance, InstanceExit, InstanceSpec};
use sstress::runtime::timing::{Duration, MonotonicClock};
use sstress::transport::HttpTransport;

/// Answers `n` requests with an empty 200 and hands each request back.
fn serve(n: usize) -> (u16, mpsc::Receiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        for _ in 0..n {
            let (mut conn, _) = listener.accept().unwrap();
            let mut req = Vec::new();
            let mut buf = [0u8; 1024];
            while !req.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = conn.read(&mut buf).unwrap();
                if n == 0 {
                    break;
                }
                req.extend_from_slice(&buf[..n]);
            }
            conn.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
                .unwrap();
            tx.send(String::from_utf8_lossy(&req).into_owned()).unwrap();
        }
    });
    (port, rx)
}

fn run(host: &str, port: u16, budget: u32) -> sstress::InstanceReport {
    let dir = tempfile::tempdir().unwrap();
    let policy = Policy::parse(&format!(
        r#"{{"s": [{{"mintest": {{
            "endpoint": "{host}", "port": {port},
            "http_url": "index.html?uptag=${{uptag}}",
            "metadata": [{{"uptag": "X-Upload-Tag:"}}, {{"ctype": "Content-Type:"}}]
        }}}}]}}"#
    ))
    .unwrap();
    let mut config = HarnessConfig::default();
    config.budget = budget;
    config.pass_limit = budget;
    config.timeout = Duration::from_millis(2000);
    let spec = InstanceSpec {
        ordinal: 0,
        name: "ctx0".to_owned(),
        log_path: dir.path().join("ctx0.log"),
    };
    Instance::new(
        &config,
        &spec,
        policy,
        HttpTransport::new(),
        MonotonicClock::new(),
        Arc::new(AtomicBool::new(false)),
    )
    .run()
    .unwrap()
}

#[test]
fn attempt_tags_reach_the_request() {
    let (port, rx) = serve(1);
    let report = run("127.0.0.1", port, 1);

    assert_eq!(report.exit, InstanceExit::Completed);
    assert_eq!(report.verdict.observed_successes, 1);
    let req = rx.recv().unwrap();
    assert!(
        req.starts_with("GET /index.html?uptag=myuptag123 HTTP/1.1\r\n"),
        "{req}"
    );
    assert!(req.contains("X-Upload-Tag: myuptag123\r\n"), "{req}");
    assert!(req.contains("Content-Type: myctype\r\n"), "{req}");
}

#[test]
fn named_host_is_looked_up_and_every_attempt_is_served() {
    let (port, rx) = serve(2);
    let report = run("localhost", port, 2);

    assert_eq!(report.attempts_created, 2);
    assert_eq!(report.verdict.observed_successes, 2);
    assert!(report.verdict.good);
    for _ in 0..2 {
        assert!(rx.recv().unwrap().contains("Host: localhost\r\n"));
    }
}
