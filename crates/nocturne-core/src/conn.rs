// src/conn.rs
use std::io::{self, IoSlice};
use std::net::Shutdown;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use tracing::{debug, error};

use crate::config::Limits;
use crate::error::ParseError;
use crate::http::Request;
use crate::parser;
use crate::response::ResponseState;
use crate::syscalls;
use crate::ws::WsPhase;

/// Growth step of the read buffer.
pub const READ_CHUNK: usize = 8 * 1024;
/// Buffers above this capacity are shrunk before pooling.
pub const BUFFER_RETAIN: usize = 64 * 1024;
/// Minimum time a kept-alive connection may wait for its next request.
pub const KEEPALIVE_GRACE: i64 = 5000;
pub const MAX_KEEPALIVE_REQUESTS: u32 = 10_000;

/// Milliseconds on a process-wide monotonic clock.
pub fn now_ms() -> i64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_millis() as i64
}

/// Absolute expiry time of a connection, shared with the reactor while a
/// worker owns the connection.
#[derive(Debug, Clone, Default)]
pub struct Deadline(Arc<AtomicI64>);

impl Deadline {
    pub fn new(at: i64) -> Self {
        Self(Arc::new(AtomicI64::new(at)))
    }

    pub fn get(&self) -> i64 {
        self.0.load(Ordering::Acquire)
    }

    /// Move the deadline forward; earlier values are ignored.
    pub fn extend(&self, at: i64) {
        self.0.fetch_max(at, Ordering::AcqRel);
    }

    /// Start a new deadline cycle.
    pub fn reset(&self, at: i64) {
        self.0.store(at, Ordering::Release);
    }

    pub fn expired(&self, now: i64) -> bool {
        self.get() <= now
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    /// More bytes are needed.
    Busy,
    /// A request (or a rejection to answer) is ready for a worker.
    Ready,
}

/// One accepted socket with its buffers and request/response state.
#[derive(Debug)]
pub struct Connection {
    socket: Option<OwnedFd>,
    pub(crate) incoming: Vec<u8>,
    /// Bytes of `incoming` belonging to the current request.
    pub(crate) pos: usize,
    /// Body bytes not yet consumed, buffered or still in the socket.
    pub(crate) body_left: u64,
    pub(crate) process: bool,
    pub(crate) deadline: Deadline,
    pub(crate) socket_start: i64,
    pub(crate) peer: String,
    pub(crate) limits: Limits,
    pub(crate) request: Request,
    pub(crate) response: ResponseState,
    pub(crate) reject: Option<ParseError>,
    pub(crate) ws: WsPhase,
    pub(crate) requests: u32,
    pub(crate) bytes_sent: usize,
}

impl Connection {
    pub fn new() -> Self {
        Self {
            socket: None,
            incoming: Vec::new(),
            pos: 0,
            body_left: 0,
            process: false,
            deadline: Deadline::new(0),
            socket_start: 0,
            peer: String::new(),
            limits: Limits::default(),
            request: Request::default(),
            response: ResponseState::default(),
            reject: None,
            ws: WsPhase::Http,
            requests: 0,
            bytes_sent: 0,
        }
    }

    pub(crate) fn init(&mut self, socket: OwnedFd, start: i64, peer: String, limits: Limits) {
        self.socket = Some(socket);
        self.socket_start = start;
        self.peer = peer;
        self.limits = limits;
        // The arena may still hold a clone of a recycled deadline
        self.deadline = Deadline::new(start + limits.idle_timeout);
        self.process = false;
        self.requests = 0;
        self.bytes_sent = 0;
        self.reset_exchange();
        self.incoming.clear();
    }

    /// Close the socket and drop per-connection state.
    pub(crate) fn clear(&mut self) {
        self.socket = None;
        self.peer.clear();
        self.process = false;
        self.reset_exchange();
        self.incoming.clear();
        if self.incoming.capacity() > BUFFER_RETAIN {
            self.incoming.shrink_to(BUFFER_RETAIN);
        }
    }

    fn reset_exchange(&mut self) {
        self.pos = 0;
        self.body_left = 0;
        self.request.clear();
        self.response.clear();
        self.reject = None;
        self.ws = WsPhase::Http;
    }

    pub fn fd(&self) -> RawFd {
        self.socket.as_ref().map_or(-1, |s| s.as_raw_fd())
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub(crate) fn shutdown(&self, how: Shutdown) {
        if let Err(e) = syscalls::shutdown(self.fd(), how) {
            debug!(client = %self.peer, "shutdown failed: {}", e);
        }
    }

    /// Non-blocking receive appending to the read buffer, used by the reactor.
    /// `Ok(0)` means the peer closed, `WouldBlock` that nothing was pending.
    pub(crate) fn recv_available(&mut self) -> io::Result<usize> {
        let len = self.incoming.len();
        if self.incoming.capacity() - len < READ_CHUNK / 2 {
            self.incoming.reserve(READ_CHUNK);
        }
        let available = self.incoming.capacity() - len;
        self.incoming.resize(len + available, 0);

        let result = loop {
            match syscalls::recv(self.fd(), &mut self.incoming[len..], true) {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                other => break other,
            }
        };
        let received = *result.as_ref().unwrap_or(&0);
        self.incoming.truncate(len + received);
        result
    }

    /// Try to parse a request from the buffered bytes.
    pub(crate) fn parse_request(&mut self) -> RequestStatus {
        if self.incoming.is_empty() {
            return RequestStatus::Busy;
        }

        match parser::parse_request(&self.incoming, &self.limits, &self.peer) {
            Ok(None) => RequestStatus::Busy,
            Ok(Some((request, head_len))) => {
                self.pos = head_len;
                self.body_left = request.body_len;
                self.request = request;
                RequestStatus::Ready
            }
            Err(err) => {
                debug!(client = %self.peer, status = err.status, "rejecting request: {}", err.reason);
                self.request.client_addr = self.peer.clone();
                self.request.keepalive = false;
                self.reject = Some(err);
                RequestStatus::Ready
            }
        }
    }

    /// Apply keep-alive limits before a handler runs, so the response head
    /// announces the right connection state.
    pub(crate) fn prepare_dispatch(&mut self, now: i64) {
        if now >= self.socket_start + self.limits.keepalive_time
            || self.requests + 1 >= MAX_KEEPALIVE_REQUESTS
        {
            self.request.keepalive = false;
        }
    }

    /// End the current exchange. Returns whether the connection stays open
    /// for another request; `None` forces it closed.
    pub(crate) fn rearm(&mut self, now: Option<i64>) -> bool {
        let keep = match now {
            Some(now) if self.request.keepalive && self.body_left == 0 && self.ws == WsPhase::Http => {
                let at = (self.socket_start + self.limits.keepalive_time).max(now + KEEPALIVE_GRACE);
                self.deadline.reset(at);
                true
            }
            _ => false,
        };

        if keep {
            let consumed = self.pos.min(self.incoming.len());
            self.incoming.drain(..consumed);
        } else {
            self.incoming.clear();
        }
        self.requests += 1;
        self.reset_exchange();

        keep
    }

    fn log_error(&self, op: &str, err: &io::Error) {
        if syscalls::is_benign(err) {
            debug!(client = %self.peer, "{} failed: {}", op, err);
        } else {
            error!(client = %self.peer, "{} failed: {}", op, err);
        }
    }

    /// Blocking receive straight from the socket.
    pub(crate) fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match syscalls::recv(self.fd(), buf, false) {
                Ok(n) => {
                    if n > 0 {
                        self.deadline.extend(now_ms() + self.limits.idle_timeout);
                    }
                    return Ok(n);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.request.keepalive = false;
                    self.log_error("read", &e);
                    return Err(e);
                }
            }
        }
    }

    /// Read buffered bytes first, then the socket.
    pub(crate) fn read_buffered(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let buffered = self.incoming.len() - self.pos;
        if buffered > 0 {
            let n = buffered.min(buf.len());
            buf[..n].copy_from_slice(&self.incoming[self.pos..self.pos + n]);
            self.pos += n;
            return Ok(n);
        }
        self.read(buf)
    }

    /// Make sure at least `min` unconsumed bytes are buffered.
    /// Returns `false` if the peer closed first.
    pub(crate) fn fill(&mut self, min: usize) -> io::Result<bool> {
        if self.incoming.len() - self.pos >= min {
            return Ok(true);
        }
        self.incoming.drain(..self.pos);
        self.pos = 0;

        while self.incoming.len() < min {
            let mut buf = std::mem::take(&mut self.incoming);
            let len = buf.len();
            buf.resize(len + READ_CHUNK.max(min - len), 0);
            let result = self.read(&mut buf[len..]);
            buf.truncate(len + *result.as_ref().unwrap_or(&0));
            self.incoming = buf;
            if result? == 0 {
                return Ok(false);
            }
        }
        Ok(true)
    }

    pub(crate) fn write_all(&mut self, mut buf: &[u8], more: bool) -> io::Result<()> {
        while !buf.is_empty() {
            match syscalls::send(self.fd(), buf, more) {
                Ok(0) => {
                    self.request.keepalive = false;
                    return Err(io::ErrorKind::WriteZero.into());
                }
                Ok(n) => {
                    self.bytes_sent += n;
                    self.deadline.extend(now_ms() + self.limits.send_timeout);
                    buf = &buf[n..];
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.request.keepalive = false;
                    self.log_error("write", &e);
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Send every part, resuming after partial sends.
    pub(crate) fn write_vectored_all(&mut self, mut parts: &mut [IoSlice<'_>], more: bool) -> io::Result<()> {
        while !parts.is_empty() {
            let batch = parts.len().min(IOV_MAX);
            match syscalls::sendmsg(self.fd(), &parts[..batch], more || batch < parts.len()) {
                Ok(0) => {
                    self.request.keepalive = false;
                    return Err(io::ErrorKind::WriteZero.into());
                }
                Ok(n) => {
                    self.bytes_sent += n;
                    self.deadline.extend(now_ms() + self.limits.send_timeout);
                    IoSlice::advance_slices(&mut parts, n);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.request.keepalive = false;
                    self.log_error("write", &e);
                    return Err(e);
                }
            }
        }
        Ok(())
    }
}

const IOV_MAX: usize = 1024;

impl Default for Connection {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connection_with(bytes: &[u8]) -> Connection {
        let mut conn = Connection::new();
        conn.incoming.extend_from_slice(bytes);
        conn
    }

    #[test]
    fn test_deadline_is_monotonic() {
        let deadline = Deadline::new(100);
        deadline.extend(250);
        deadline.extend(180);
        assert_eq!(deadline.get(), 250);

        let shared = deadline.clone();
        shared.extend(300);
        assert_eq!(deadline.get(), 300);
        assert!(deadline.expired(300));
        assert!(!deadline.expired(299));
    }

    #[test]
    fn test_parse_then_rearm_keeps_pipelined_bytes() {
        let mut conn = connection_with(b"GET /a HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\n\r\n");
        assert_eq!(conn.parse_request(), RequestStatus::Ready);
        assert_eq!(conn.request.path, "/a");

        assert!(conn.rearm(Some(1000)));
        assert_eq!(conn.incoming, b"GET /b HTTP/1.1\r\n\r\n");
        assert_eq!(conn.deadline.get(), 20_000);

        assert_eq!(conn.parse_request(), RequestStatus::Ready);
        assert_eq!(conn.request.path, "/b");
    }

    #[test]
    fn test_rearm_grace_period() {
        let mut conn = connection_with(b"GET / HTTP/1.1\r\n\r\n");
        conn.parse_request();
        assert!(conn.rearm(Some(19_000)));
        assert_eq!(conn.deadline.get(), 19_000 + KEEPALIVE_GRACE);
    }

    #[test]
    fn test_rearm_closes() {
        let mut conn = connection_with(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\nleftover");
        conn.parse_request();
        assert!(!conn.rearm(Some(10)));
        assert!(conn.incoming.is_empty());

        let mut conn = connection_with(b"GET / HTTP/1.1\r\n\r\n");
        conn.parse_request();
        assert!(!conn.rearm(None));
    }

    #[test]
    fn test_rearm_refuses_unread_body() {
        let mut conn = connection_with(b"POST / HTTP/1.1\r\nContent-Length: 5\r\n\r\nab");
        assert_eq!(conn.parse_request(), RequestStatus::Ready);
        assert_eq!(conn.body_left, 5);
        assert!(!conn.rearm(Some(10)));
    }

    #[test]
    fn test_partial_request_is_busy() {
        let mut conn = connection_with(b"GET / HTTP/1.1\r\nHost:");
        assert_eq!(conn.parse_request(), RequestStatus::Busy);
        assert!(conn.reject.is_none());
    }

    #[test]
    fn test_malformed_request_is_rejected() {
        let mut conn = connection_with(b"GET nope HTTP/1.1\r\n\r\n");
        assert_eq!(conn.parse_request(), RequestStatus::Ready);
        assert_eq!(conn.reject.map(|e| e.status), Some(400));
        assert!(!conn.request.keepalive);
    }

    #[test]
    fn test_prepare_dispatch_applies_keepalive_time() {
        let mut conn = connection_with(b"GET / HTTP/1.1\r\n\r\n");
        conn.parse_request();
        conn.prepare_dispatch(1000);
        assert!(conn.request.keepalive);
        conn.prepare_dispatch(conn.limits.keepalive_time);
        assert!(!conn.request.keepalive);
    }
}
