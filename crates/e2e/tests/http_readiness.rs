//! Readiness probing against a local socket that models workload startup:
//! connection refused first, then real responses.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;
use std::time::{Duration, Instant};

use conductor_e2e::{get_until, Error, HttpProber, ProbePolicy};

fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .expect("bind to find free port")
        .local_addr()
        .expect("local addr")
        .port()
}

fn answer(mut stream: TcpStream, status_line: &str, body: &str) {
    let mut request = [0u8; 1024];
    let _ = stream.read(&mut request);
    let response = format!(
        "HTTP/1.1 {status_line}\r\nContent-Length: {len}\r\nConnection: close\r\n\r\n{body}",
        len = body.len(),
    );
    let _ = stream.write_all(response.as_bytes());
}

/// Serves up to `connections` requests with a fixed response, then exits.
fn serve(listener: TcpListener, status_line: &'static str, body: &'static str, connections: usize) {
    thread::spawn(move || {
        for _ in 0..connections {
            match listener.accept() {
                Ok((stream, _)) => answer(stream, status_line, body),
                Err(_) => break,
            }
        }
    });
}

#[test]
fn returns_body_once_endpoint_stops_refusing_connections() {
    conductor_e2e::init_tracing();
    let port = free_port();
    let url = format!("http://127.0.0.1:{port}/health");

    // Nothing is listening yet; bind only after a startup delay.
    thread::spawn(move || {
        thread::sleep(Duration::from_millis(400));
        let listener = TcpListener::bind(("127.0.0.1", port)).expect("rebind startup port");
        serve(listener, "200 OK", "ready", 4);
    });

    let start = Instant::now();
    let body = get_until(&url, 200, Duration::from_secs(10), Duration::from_millis(100)).unwrap();

    assert_eq!(body, "ready");
    assert!(
        start.elapsed() >= Duration::from_millis(300),
        "probe succeeded before the endpoint existed"
    );
}

#[test]
fn immediate_success_returns_the_body_without_retrying() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let url = format!("http://{}/", listener.local_addr().unwrap());
    serve(listener, "200 OK", "{\"word\":\"noun\"}", 2);

    let start = Instant::now();
    let body = get_until(&url, 200, Duration::from_secs(5), Duration::from_secs(1)).unwrap();

    assert!(body.contains("\"word\""));
    assert!(start.elapsed() < Duration::from_secs(2));
}

#[test]
fn wrong_status_drains_to_readiness_timeout_with_last_observation() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let url = format!("http://{}/health", listener.local_addr().unwrap());
    serve(listener, "404 Not Found", "missing", 32);

    let err = get_until(&url, 200, Duration::from_millis(400), Duration::from_millis(100))
        .unwrap_err();

    match err {
        Error::ReadinessTimeout { url: u, last, .. } => {
            assert_eq!(u, url);
            assert!(last.contains("404"), "last observation: {last}");
        }
        other => panic!("expected ReadinessTimeout, got {other:?}"),
    }
}

#[test]
fn connect_errors_abort_when_the_policy_makes_them_terminal() {
    let port = free_port();
    let url = format!("http://127.0.0.1:{port}/");

    let prober = HttpProber::with_policy(ProbePolicy {
        retry_connect_errors: false,
        ..ProbePolicy::default()
    })
    .unwrap();

    let start = Instant::now();
    let err = prober
        .get_until(&url, 200, Duration::from_secs(30), Duration::from_secs(1))
        .unwrap_err();

    assert!(matches!(err, Error::Http(_)));
    assert!(start.elapsed() < Duration::from_secs(5));
}
