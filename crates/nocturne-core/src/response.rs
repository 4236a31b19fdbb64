// src/response.rs
use std::cell::RefCell;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::http::{KeyValues, Version, status_text};

/// Largest chunk payload, so that sizes always fit four hex digits.
pub const MAX_CHUNK: usize = 0xFFFF;

/// Outgoing state of the current exchange.
#[derive(Debug, Default)]
pub struct ResponseState {
    /// Head sent; headers are frozen from here on.
    pub started: bool,
    pub status: u16,
    pub headers: KeyValues,
    pub chunked: bool,
    pub expected: Option<u64>,
    pub sent: u64,
}

impl ResponseState {
    pub fn clear(&mut self) {
        self.started = false;
        self.status = 0;
        self.headers.clear();
        self.chunked = false;
        self.expected = None;
        self.sent = 0;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyLength {
    Known(u64),
    Chunked,
    /// No framing header at all (101 switching protocols).
    Omitted,
}

thread_local! {
    static DATE: RefCell<(u64, String)> = const { RefCell::new((u64::MAX, String::new())) };
}

/// IMF-fixdate of the current second, cached per thread.
pub fn http_date() -> String {
    let now = SystemTime::now();
    let secs = now.duration_since(UNIX_EPOCH).map_or(0, |d| d.as_secs());
    DATE.with(|cache| {
        let mut cache = cache.borrow_mut();
        if cache.0 != secs {
            *cache = (secs, httpdate::fmt_http_date(now));
        }
        cache.1.clone()
    })
}

pub fn write_head(
    out: &mut Vec<u8>,
    version: Version,
    status: u16,
    connection: &str,
    headers: &KeyValues,
    length: BodyLength,
) {
    let mut num = itoa::Buffer::new();

    out.extend_from_slice(version.as_str().as_bytes());
    out.push(b' ');
    out.extend_from_slice(num.format(status).as_bytes());
    out.push(b' ');
    out.extend_from_slice(status_text(status).as_bytes());
    out.extend_from_slice(b"\r\nConnection: ");
    out.extend_from_slice(connection.as_bytes());
    out.extend_from_slice(b"\r\nDate: ");
    out.extend_from_slice(http_date().as_bytes());
    out.extend_from_slice(b"\r\n");

    for (key, value) in headers.iter() {
        out.extend_from_slice(key.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }

    match length {
        BodyLength::Known(len) => {
            out.extend_from_slice(b"Content-Length: ");
            out.extend_from_slice(num.format(len).as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        BodyLength::Chunked => out.extend_from_slice(b"Transfer-Encoding: chunked\r\n"),
        BodyLength::Omitted => {}
    }
    out.extend_from_slice(b"\r\n");
}

/// `XXXX\r\n` header of a chunk of at most [`MAX_CHUNK`] bytes.
pub fn chunk_header(len: usize) -> [u8; 6] {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    debug_assert!(len <= MAX_CHUNK);
    [
        HEX[(len >> 12) & 0xF],
        HEX[(len >> 8) & 0xF],
        HEX[(len >> 4) & 0xF],
        HEX[len & 0xF],
        b'\r',
        b'\n',
    ]
}

pub fn error_body(status: u16, msg: Option<&str>) -> String {
    match msg {
        Some(msg) => format!("Error {}: {}\n{}", status, status_text(status), msg),
        None => format!("Error {}: {}\n", status, status_text(status)),
    }
}
