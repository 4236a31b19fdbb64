use nocturne_core::{Config, ConnectionIo, CookieFlags, Daemon, Method, SocketType};
use std::fs::File;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::PathBuf;
use std::time::{Duration, Instant};

const FILE_BODY: &str = "static file contents\n";

fn test_file() -> PathBuf {
    let path = std::env::temp_dir().join(format!("nocturne-sendfile-{}.txt", std::process::id()));
    std::fs::write(&path, FILE_BODY).unwrap();
    path
}

fn setup_test_server() -> Daemon {
    let file = test_file();
    let config = Config {
        sock_type: SocketType::IPv4,
        bind_addr: Some("127.0.0.1".into()),
        port: 0,
        workers: 1,
        listeners: 1,
        idle_timeout: 1000,
        ..Config::default()
    };

    let mut daemon = Daemon::new();
    daemon.bind(config).unwrap();
    daemon
        .start(move |io: &mut ConnectionIo<'_>| {
            let path = io.request().path.clone();
            let _ = match (io.request().method, path.as_str()) {
                (Method::Get, "/hello") => io.send_text(200, "Hello, World!", "text/plain"),
                (Method::Get, "/stream") => io.send(200, None, |w| {
                    w.write_all(b"chunk1")?;
                    w.write_all(b"chunk2")
                }),
                (Method::Post, "/upload") => {
                    let mut body = Vec::new();
                    match io.open_for_read(1024) {
                        Ok(mut reader) => {
                            let _ = reader.read_to_end(&mut body);
                        }
                        Err(_) => return,
                    }
                    io.send_text(200, &format!("Received {} bytes", body.len()), "text/plain")
                }
                (Method::Get, "/file") => match File::open(&file) {
                    Ok(f) => io.send_file(200, f, None),
                    Err(_) => io.send_error(404, None),
                },
                (Method::Get, "/cookie") => io
                    .add_cookie_header("/", "session", Some("abc"), CookieFlags { http_only: true, secure: false })
                    .and_then(|_| io.send_empty(204)),
                (Method::Get, "/query") => {
                    let name = io.request().query_value("name").unwrap_or("nobody").to_string();
                    io.send_text(200, &name, "text/plain")
                }
                (Method::Get, "/silent") => return,
                _ => io.send_error(404, Some("no route")),
            };
        })
        .unwrap();
    daemon
}

fn connect(daemon: &Daemon) -> TcpStream {
    let stream = TcpStream::connect(daemon.local_addr().unwrap()).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    stream
}

fn roundtrip(daemon: &Daemon, request: &str) -> String {
    let mut stream = connect(daemon);
    stream.write_all(request.as_bytes()).unwrap();
    let mut res = String::new();
    stream.read_to_string(&mut res).unwrap();
    res
}

/// Read one response with a Content-Length body.
fn read_response(stream: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let n = stream.read(&mut chunk).unwrap();
        assert!(n > 0, "connection closed early");
        buf.extend_from_slice(&chunk[..n]);
        let text = String::from_utf8_lossy(&buf).into_owned();
        if let Some(end) = text.find("\r\n\r\n") {
            let len: usize = text[..end]
                .lines()
                .find_map(|l| l.strip_prefix("Content-Length: "))
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
            if buf.len() >= end + 4 + len {
                return text;
            }
        }
    }
}

#[test]
fn test_integration_endpoints() {
    let daemon = setup_test_server();

    // 1. Simple GET
    let res = roundtrip(&daemon, "GET /hello HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
    assert!(res.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(res.contains("Connection: close\r\n"));
    assert!(res.contains("Content-Length: 13\r\n"));
    assert!(res.contains("Date: "));
    assert!(res.ends_with("\r\n\r\nHello, World!"));

    // 2. Chunked response
    let res = roundtrip(&daemon, "GET /stream HTTP/1.1\r\nConnection: close\r\n\r\n");
    assert!(res.contains("Transfer-Encoding: chunked\r\n"));
    assert!(res.contains("0006\r\nchunk1\r\n"));
    assert!(res.contains("0006\r\nchunk2\r\n"));
    assert!(res.ends_with("0\r\n\r\n"));

    // 3. Request body
    let res = roundtrip(
        &daemon,
        "POST /upload HTTP/1.1\r\nConnection: close\r\nContent-Length: 5\r\n\r\nhello",
    );
    assert!(res.ends_with("Received 5 bytes"));

    // 4. Body above the handler's limit
    let body = "x".repeat(2000);
    let res = roundtrip(
        &daemon,
        &format!("POST /upload HTTP/1.1\r\nConnection: close\r\nContent-Length: 2000\r\n\r\n{body}"),
    );
    assert!(res.starts_with("HTTP/1.1 413 "));

    // 5. Query string
    let res = roundtrip(&daemon, "GET /query?name=night%20owl HTTP/1.1\r\nConnection: close\r\n\r\n");
    assert!(res.ends_with("night owl"));

    // 6. Cookie header
    let res = roundtrip(&daemon, "GET /cookie HTTP/1.1\r\nConnection: close\r\n\r\n");
    assert!(res.starts_with("HTTP/1.1 204 "));
    assert!(res.contains("Set-Cookie: session=abc; Path=/; SameSite=Strict; HttpOnly\r\n"));

    // 7. Unknown route
    let res = roundtrip(&daemon, "GET /missing HTTP/1.1\r\nConnection: close\r\n\r\n");
    assert!(res.starts_with("HTTP/1.1 404 "));
    assert!(res.contains("no route"));

    // 8. Handler that never answers
    let res = roundtrip(&daemon, "GET /silent HTTP/1.1\r\nConnection: close\r\n\r\n");
    assert!(res.starts_with("HTTP/1.1 500 "));
}

#[test]
fn test_keepalive_reuses_connection() {
    let daemon = setup_test_server();
    let mut stream = connect(&daemon);

    for _ in 0..3 {
        stream.write_all(b"GET /hello HTTP/1.1\r\nHost: localhost\r\n\r\n").unwrap();
        let res = read_response(&mut stream);
        assert!(res.contains("Connection: keep-alive\r\n"));
        assert!(res.ends_with("Hello, World!"));
    }
    // Counters are bumped after the response is on the wire
    let metrics = daemon.metrics();
    let started = Instant::now();
    while metrics.requests() < 3 && started.elapsed() < Duration::from_secs(2) {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(metrics.requests(), 3);
}

#[test]
fn test_http10_defaults_to_close() {
    let daemon = setup_test_server();
    let res = roundtrip(&daemon, "GET /hello HTTP/1.0\r\n\r\n");
    assert!(res.starts_with("HTTP/1.0 200 OK\r\n"));
    assert!(res.contains("Connection: close\r\n"));
}

#[test]
fn test_pipelined_requests() {
    let daemon = setup_test_server();
    let res = roundtrip(
        &daemon,
        "GET /hello HTTP/1.1\r\n\r\nGET /query?name=second HTTP/1.1\r\nConnection: close\r\n\r\n",
    );
    let first = res.find("Hello, World!").unwrap();
    let second = res.find("second").unwrap();
    assert!(first < second);
    assert_eq!(res.matches("HTTP/1.1 200 OK").count(), 2);
}

#[test]
fn test_head_request_has_no_body() {
    let daemon = setup_test_server();
    let res = roundtrip(&daemon, "HEAD /hello HTTP/1.1\r\nConnection: close\r\n\r\n");
    assert!(res.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(res.contains("Content-Length: 13\r\n"));
    assert!(res.ends_with("\r\n\r\n"));
}

#[test]
fn test_send_file() {
    let daemon = setup_test_server();
    let res = roundtrip(&daemon, "GET /file HTTP/1.1\r\nConnection: close\r\n\r\n");
    assert!(res.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(res.contains(&format!("Content-Length: {}\r\n", FILE_BODY.len())));
    assert!(res.ends_with(FILE_BODY));
}

#[test]
fn test_malformed_requests_are_rejected() {
    let daemon = setup_test_server();

    let res = roundtrip(&daemon, "GET /../etc/passwd HTTP/1.1\r\n\r\n");
    assert!(res.starts_with("HTTP/1.1 403 "));
    assert!(res.contains("Connection: close\r\n"));

    let res = roundtrip(&daemon, "POST /upload HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n0\r\n\r\n");
    assert!(res.starts_with("HTTP/1.1 501 "));

    let res = roundtrip(&daemon, "BREW /pot HTTP/1.1\r\n\r\n");
    assert!(res.starts_with("HTTP/1.1 405 "));

    let res = roundtrip(&daemon, "GET /hello HTTP/2.0\r\n\r\n");
    assert!(res.starts_with("HTTP/1.1 400 "));
}

#[test]
fn test_idle_connection_is_closed() {
    let daemon = setup_test_server();
    let mut stream = connect(&daemon);

    let started = Instant::now();
    let mut buf = [0u8; 16];
    assert_eq!(stream.read(&mut buf).unwrap(), 0);
    let waited = started.elapsed();
    assert!(waited >= Duration::from_millis(900), "closed after {:?}", waited);
}

#[test]
fn test_stop_is_idempotent() {
    let mut daemon = setup_test_server();
    let addr = daemon.local_addr().unwrap();
    let res = roundtrip(&daemon, "GET /hello HTTP/1.1\r\nConnection: close\r\n\r\n");
    assert!(res.ends_with("Hello, World!"));

    daemon.stop();
    daemon.stop();
    assert!(!daemon.is_running());
    assert!(TcpStream::connect(addr).is_err());
}
