// examples/echo.rs
//! HTTP and WebSocket echo server.
//!
//! `cargo run --example echo -- 8080` listens on port 8080; a non-numeric
//! argument selects a Unix socket path. Other settings come from
//! `NOCTURNE_*` variables.
use std::io::{Read, Write};

use nocturne_core::{Config, ConnectionIo, Daemon, Method, NocturneResult, WsMode};
use tracing::info;

fn echo(io: &mut ConnectionIo<'_>) {
    let path = io.request().path.clone();
    let result = match (io.request().method, path.as_str()) {
        (Method::Get, "/") => io.send_text(200, "Hello, World!", "text/plain; charset=UTF-8"),
        (Method::Post, "/echo") => echo_body(io),
        (Method::Get, "/stream") => io.send(200, None, |w| {
            for i in 0..10 {
                writeln!(w, "line {}", i)?;
            }
            Ok(())
        }),
        (Method::Get, "/ws") => echo_ws(io),
        _ => io.send_error(404, None),
    };
    if let Err(e) = result {
        info!("request ended early: {}", e);
    }
}

fn echo_body(io: &mut ConnectionIo<'_>) -> NocturneResult<()> {
    let mut body = Vec::new();
    io.open_for_read(1 << 20)?.read_to_end(&mut body)?;
    let mimetype = io
        .request()
        .header("Content-Type")
        .unwrap_or("application/octet-stream")
        .to_string();
    io.send_binary(200, &body, Some(&mimetype))
}

fn echo_ws(io: &mut ConnectionIo<'_>) -> NocturneResult<()> {
    let mut ws = io.upgrade_to_ws(WsMode::Text)?;
    let mut message = Vec::new();
    while let Some(mode) = ws.read_message(&mut message)? {
        ws.send_message(mode, &message)?;
    }
    Ok(())
}

fn main() -> NocturneResult<()> {
    nocturne_core::logging::init_logging();

    let mut config = Config::from_env()?;
    if let Some(arg) = std::env::args().nth(1) {
        config.set_port_or_path(&arg)?;
    }

    let mut daemon = Daemon::new();
    daemon.bind(config)?;
    daemon.start(echo)?;
    info!("listening on {:?}", daemon.local_addr());
    daemon.wait_for_signal()
}
