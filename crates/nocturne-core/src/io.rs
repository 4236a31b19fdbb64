//! The handler-facing side of a connection.
//!
//! A [`Handler`] receives a [`ConnectionIo`] for every parsed request. It
//! reads the request (and optionally its body) and answers with one of the
//! `send_*` methods, a streamed [`ResponseWriter`], or upgrades the
//! connection to WebSocket. If the handler returns without answering, the
//! worker replies with 500.

use std::fs::File;
use std::io::{self, IoSlice, Read, Write};
use std::os::fd::AsRawFd;

use tracing::{debug, trace};

use crate::conn::{Connection, now_ms};
use crate::error::{NocturneError, NocturneResult, WsError};
use crate::http::{KeyValues, Request, Version};
use crate::response::{self, BodyLength, MAX_CHUNK, chunk_header, write_head};
use crate::syscalls;
use crate::ws::{self, WsMode, WsPhase, WsStream};

/// Unread request bodies up to this size are drained to keep the
/// connection alive; larger ones close it.
pub const DISCARD_LIMIT: u64 = 32 * 1024 * 1024;
const SENDFILE_CHUNK: u64 = 2 * 1024 * 1024;

pub trait Handler: Send + Sync + 'static {
    fn handle(&self, io: &mut ConnectionIo<'_>);
}

impl<F> Handler for F
where
    F: Fn(&mut ConnectionIo<'_>) + Send + Sync + 'static,
{
    fn handle(&self, io: &mut ConnectionIo<'_>) {
        self(io)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CookieFlags {
    pub http_only: bool,
    pub secure: bool,
}

pub struct ConnectionIo<'a> {
    conn: &'a mut Connection,
}

impl<'a> ConnectionIo<'a> {
    pub(crate) fn new(conn: &'a mut Connection) -> Self {
        Self { conn }
    }

    pub fn request(&self) -> &Request {
        &self.conn.request
    }

    pub fn client_addr(&self) -> &str {
        &self.conn.request.client_addr
    }

    /// Whether the response head went out already.
    pub fn is_started(&self) -> bool {
        self.conn.response.started
    }

    /// Close the connection after this response.
    pub fn disable_keepalive(&mut self) {
        self.conn.request.keepalive = false;
    }

    pub fn add_header(&mut self, key: &str, value: &str) -> NocturneResult<()> {
        if self.conn.response.started {
            return Err(NocturneError::ResponseStarted);
        }
        self.conn.response.headers.push(key, value);
        Ok(())
    }

    /// Add a `Set-Cookie` header. A `None` value deletes the cookie.
    pub fn add_cookie_header(
        &mut self,
        path: &str,
        name: &str,
        value: Option<&str>,
        flags: CookieFlags,
    ) -> NocturneResult<()> {
        let mut cookie = format!("{}={}; Path={}", name, value.unwrap_or(""), path);
        if value.is_none() {
            cookie.push_str("; Max-Age=0");
        }
        cookie.push_str("; SameSite=Strict");
        if flags.http_only {
            cookie.push_str("; HttpOnly");
        }
        if flags.secure {
            cookie.push_str("; Secure");
        }
        self.add_header("Set-Cookie", &cookie)
    }

    pub fn add_caching_headers(&mut self, max_age_ms: u64, etag: Option<&str>) -> NocturneResult<()> {
        if max_age_ms > 0 {
            self.add_header("Cache-Control", &format!("max-age={}", max_age_ms / 1000))?;
        } else {
            self.add_header("Cache-Control", "no-store")?;
        }
        if let Some(etag) = etag {
            self.add_header("ETag", &format!("\"{etag}\""))?;
        }
        Ok(())
    }

    /// Open the request body for reading, refusing bodies above `max_len`.
    pub fn open_for_read(&mut self, max_len: u64) -> NocturneResult<BodyReader<'_>> {
        if self.conn.response.started {
            return Err(NocturneError::ResponseStarted);
        }
        if self.conn.request.header("Content-Encoding").is_some() {
            self.send_error(400, Some("Request Content-Encoding is not supported"))?;
            return Err(NocturneError::Rejected { status: 400 });
        }
        if self.conn.request.body_len > max_len {
            self.send_error(413, Some("Request body is too large"))?;
            return Err(NocturneError::Rejected { status: 413 });
        }
        Ok(BodyReader { conn: self.conn })
    }

    fn discard_body(&mut self) {
        if self.conn.body_left == 0 {
            return;
        }
        if self.conn.body_left > DISCARD_LIMIT {
            self.conn.request.keepalive = false;
            return;
        }

        let mut scratch = [0u8; 8192];
        while self.conn.body_left > 0 {
            let want = scratch.len().min(self.conn.body_left as usize);
            match self.conn.read_buffered(&mut scratch[..want]) {
                Ok(0) | Err(_) => {
                    self.conn.request.keepalive = false;
                    return;
                }
                Ok(n) => self.conn.body_left -= n as u64,
            }
        }
    }

    /// Build the response head into `head`. Returns whether a body should follow.
    fn prepare(&mut self, status: u16, length: BodyLength, head: &mut Vec<u8>) -> NocturneResult<bool> {
        if self.conn.response.started {
            return Err(NocturneError::ResponseStarted);
        }
        self.discard_body();
        // From here on the send timeout governs the connection
        self.conn.deadline.reset(now_ms() + self.conn.limits.send_timeout);

        let request = &mut self.conn.request;
        if length == BodyLength::Chunked && request.version == Version::Http10 {
            request.keepalive = false;
        }
        let connection = if request.keepalive { "keep-alive" } else { "close" };
        write_head(head, request.version, status, connection, &self.conn.response.headers, length);

        let response = &mut self.conn.response;
        response.started = true;
        response.status = status;
        response.chunked = length == BodyLength::Chunked;
        response.expected = match length {
            BodyLength::Known(len) => Some(len),
            _ => None,
        };

        Ok(!self.conn.request.headers_only)
    }

    pub fn send_binary(&mut self, status: u16, data: &[u8], mimetype: Option<&str>) -> NocturneResult<()> {
        if let Some(mimetype) = mimetype {
            self.add_header("Content-Type", mimetype)?;
        }
        let mut head = Vec::with_capacity(256);
        let with_body = self.prepare(status, BodyLength::Known(data.len() as u64), &mut head)?;

        let mut parts = [IoSlice::new(&head), IoSlice::new(if with_body { data } else { &[] })];
        self.conn.write_vectored_all(&mut parts, false)?;
        if with_body {
            self.conn.response.sent = data.len() as u64;
        }
        Ok(())
    }

    pub fn send_text(&mut self, status: u16, text: &str, mimetype: &str) -> NocturneResult<()> {
        self.send_binary(status, text.as_bytes(), Some(mimetype))
    }

    pub fn send_empty(&mut self, status: u16) -> NocturneResult<()> {
        self.send_binary(status, &[], None)
    }

    /// Send `Error <status>: <reason>` followed by `msg` as plain text.
    pub fn send_error(&mut self, status: u16, msg: Option<&str>) -> NocturneResult<()> {
        let body = response::error_body(status, msg);
        self.send_text(status, &body, "text/plain; charset=UTF-8")
    }

    /// Start a streamed response. A known `len` is sent with
    /// Content-Length, otherwise the body is chunked.
    pub fn open_for_write(&mut self, status: u16, len: Option<u64>) -> NocturneResult<ResponseWriter<'_>> {
        let length = len.map_or(BodyLength::Chunked, BodyLength::Known);
        let mut head = Vec::with_capacity(256);
        let with_body = self.prepare(status, length, &mut head)?;

        let fd = self.conn.fd();
        if let Err(e) = syscalls::set_cork(fd, true) {
            trace!("cork unavailable: {}", e);
        }
        let writer = ResponseWriter {
            conn: self.conn,
            mode: match (with_body, len) {
                (false, _) => WriterMode::Discard,
                (true, Some(len)) => WriterMode::Direct { remaining: len },
                (true, None) => WriterMode::Chunked,
            },
            finished: false,
        };
        writer.conn.write_all(&head, true)?;
        Ok(writer)
    }

    /// Stream a response through `f`, then finish it.
    pub fn send<F>(&mut self, status: u16, len: Option<u64>, f: F) -> NocturneResult<()>
    where
        F: FnOnce(&mut ResponseWriter<'_>) -> io::Result<()>,
    {
        let mut writer = self.open_for_write(status, len)?;
        f(&mut writer)?;
        writer.finish()?;
        Ok(())
    }

    /// Send a file, using kernel file transmission where available. The
    /// file is closed on return. Its length is taken from metadata when
    /// `len` is `None`.
    pub fn send_file(&mut self, status: u16, mut file: File, len: Option<u64>) -> NocturneResult<()> {
        let len = match len {
            Some(len) => len,
            None => file.metadata()?.len(),
        };
        let mut writer = self.open_for_write(status, Some(len))?;
        writer.transmit_file(&mut file, len)?;
        writer.finish()?;
        Ok(())
    }

    /// Perform the WebSocket handshake. On failure a 400/426 response has
    /// been sent and the connection stays in HTTP mode.
    pub fn upgrade_to_ws(&mut self, mode: WsMode) -> NocturneResult<WsStream<'_>> {
        if self.conn.response.started {
            return Err(NocturneError::ResponseStarted);
        }
        self.conn.ws = WsPhase::Upgrading;

        let accept = match ws::check_handshake(&self.conn.request) {
            Ok(accept) => accept,
            Err(err) => {
                self.conn.ws = WsPhase::Http;
                self.conn.request.keepalive = false;
                if let WsError::Handshake { status, reason } = err {
                    if status == 426 {
                        self.add_header("Sec-WebSocket-Version", "13")?;
                    }
                    self.send_error(status, Some(reason))?;
                }
                return Err(err.into());
            }
        };

        let conn = &mut *self.conn;
        let mut headers = KeyValues::new();
        headers.push("Upgrade", "websocket");
        headers.push("Sec-WebSocket-Accept", accept);
        for (k, v) in conn.response.headers.iter() {
            headers.push(k, v);
        }

        let mut head = Vec::with_capacity(256);
        write_head(&mut head, conn.request.version, 101, "Upgrade", &headers, BodyLength::Omitted);
        conn.response.started = true;
        conn.response.status = 101;
        conn.request.keepalive = false;
        conn.request.ws_opcode = Some(mode.opcode());
        conn.write_all(&head, false)?;

        conn.ws = WsPhase::Open;
        debug!(client = %conn.peer(), "connection upgraded to websocket");
        Ok(WsStream::new(conn, mode))
    }
}

/// Request body reader bounded by Content-Length.
pub struct BodyReader<'a> {
    conn: &'a mut Connection,
}

impl BodyReader<'_> {
    /// Body bytes not read yet.
    pub fn remaining(&self) -> u64 {
        self.conn.body_left
    }
}

impl Read for BodyReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.conn.body_left == 0 || buf.is_empty() {
            return Ok(0);
        }
        let want = buf.len().min(self.conn.body_left.min(usize::MAX as u64) as usize);
        let n = self.conn.read_buffered(&mut buf[..want])?;
        if n == 0 {
            self.conn.request.keepalive = false;
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "request body truncated"));
        }
        self.conn.body_left -= n as u64;
        Ok(n)
    }
}

enum WriterMode {
    Direct { remaining: u64 },
    Chunked,
    /// HEAD request: the body is swallowed.
    Discard,
}

/// Streamed response body. Finishing (explicitly or on drop) terminates
/// chunked bodies and releases the cork.
pub struct ResponseWriter<'a> {
    conn: &'a mut Connection,
    mode: WriterMode,
    finished: bool,
}

impl ResponseWriter<'_> {
    fn write_chunked(&mut self, buf: &[u8]) -> io::Result<()> {
        let headers: Vec<[u8; 6]> = buf.chunks(MAX_CHUNK).map(|c| chunk_header(c.len())).collect();
        let mut parts = Vec::with_capacity(headers.len() * 3);
        for (header, chunk) in headers.iter().zip(buf.chunks(MAX_CHUNK)) {
            parts.push(IoSlice::new(header));
            parts.push(IoSlice::new(chunk));
            parts.push(IoSlice::new(b"\r\n"));
        }
        self.conn.write_vectored_all(&mut parts, true)
    }

    fn transmit_file(&mut self, file: &mut File, len: u64) -> io::Result<()> {
        let WriterMode::Direct { remaining } = self.mode else {
            return Ok(());
        };
        let len = len.min(remaining);
        let sock = self.conn.fd();
        let mut offset = 0u64;

        while offset < len {
            let chunk = (len - offset).min(SENDFILE_CHUNK) as usize;
            match syscalls::sendfile(sock, file.as_raw_fd(), offset, chunk) {
                Ok(0) => break,
                Ok(n) => {
                    offset += n as u64;
                    self.conn.bytes_sent += n;
                    self.conn.deadline.extend(now_ms() + self.conn.limits.send_timeout);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if offset == 0 && is_sendfile_unsupported(&e) => {
                    trace!("sendfile unavailable, copying: {}", e);
                    return io::copy(&mut file.take(len), self).map(|_| ());
                }
                Err(e) => {
                    self.conn.request.keepalive = false;
                    return Err(e);
                }
            }
        }

        self.conn.response.sent += offset;
        self.mode = WriterMode::Direct { remaining: remaining - offset };
        if offset < len {
            self.conn.request.keepalive = false;
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "file shorter than announced"));
        }
        Ok(())
    }

    fn finish_inner(&mut self) -> io::Result<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;

        let result = match self.mode {
            WriterMode::Chunked => self.conn.write_all(b"0\r\n\r\n", false),
            WriterMode::Direct { remaining } if remaining > 0 => {
                self.conn.request.keepalive = false;
                Err(io::Error::new(io::ErrorKind::UnexpectedEof, "response body shorter than announced"))
            }
            _ => Ok(()),
        };
        if let Err(e) = syscalls::set_cork(self.conn.fd(), false) {
            trace!("uncork failed: {}", e);
        }
        result
    }

    /// Complete the response.
    pub fn finish(mut self) -> io::Result<()> {
        self.finish_inner()
    }
}

fn is_sendfile_unsupported(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::Unsupported
        || matches!(err.raw_os_error(), Some(libc::EINVAL) | Some(libc::ENOSYS) | Some(libc::EOPNOTSUPP))
}

impl Write for ResponseWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.finished {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "response already finished"));
        }
        if buf.is_empty() {
            return Ok(0);
        }

        match self.mode {
            WriterMode::Discard => {}
            WriterMode::Direct { remaining } => {
                if buf.len() as u64 > remaining {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "response body exceeds announced length",
                    ));
                }
                self.conn.write_all(buf, true)?;
                self.mode = WriterMode::Direct { remaining: remaining - buf.len() as u64 };
            }
            WriterMode::Chunked => self.write_chunked(buf)?,
        }
        self.conn.response.sent += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for ResponseWriter<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.finish_inner() {
            debug!(client = %self.conn.peer(), "unfinished response: {}", e);
        }
    }
}
