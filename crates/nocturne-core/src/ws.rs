//! WebSocket (RFC 6455) handshake and framing.
//!
//! Client frames must be masked; server frames never are. Outgoing
//! messages are split into [`WS_CHUNK`]-sized frames, the first carrying
//! the message opcode and the rest the continuation opcode.

use std::io::{self, Read, Write};
use std::net::Shutdown;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use sha1::{Digest, Sha1};
use tracing::debug;

use crate::conn::Connection;
use crate::error::WsError;
use crate::http::Request;

pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
/// Largest payload accepted in a client frame or a reassembled message.
pub const WS_MAX_FRAME: u64 = 4 * 1024 * 1024;
/// Payload size of outgoing frames.
pub const WS_CHUNK: usize = 4092;

pub mod opcode {
    pub const CONTINUATION: u8 = 0;
    pub const TEXT: u8 = 1;
    pub const BINARY: u8 = 2;
    pub const CLOSE: u8 = 8;
    pub const PING: u8 = 9;
    pub const PONG: u8 = 10;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WsMode {
    Text,
    Binary,
}

impl WsMode {
    pub fn opcode(self) -> u8 {
        match self {
            WsMode::Text => opcode::TEXT,
            WsMode::Binary => opcode::BINARY,
        }
    }

    fn from_opcode(op: u8) -> Self {
        if op == opcode::TEXT { WsMode::Text } else { WsMode::Binary }
    }
}

/// Protocol phase of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WsPhase {
    #[default]
    Http,
    Upgrading,
    Open,
    Closed,
}

/// `Sec-WebSocket-Accept` value for a client key.
pub fn accept_key(key: &str) -> String {
    let mut sha = Sha1::new();
    sha.update(key.as_bytes());
    sha.update(WS_GUID.as_bytes());
    BASE64.encode(sha.finalize())
}

/// Validate an upgrade request and compute its accept key.
pub fn check_handshake(request: &Request) -> Result<String, WsError> {
    let connection = request.header("Connection").unwrap_or("");
    let upgrade = request.header("Upgrade").unwrap_or("");
    if !connection.split(',').any(|t| t.trim().eq_ignore_ascii_case("upgrade"))
        || !upgrade.trim().eq_ignore_ascii_case("websocket")
    {
        return Err(WsError::Handshake {
            status: 400,
            reason: "Missing WebSocket upgrade headers",
        });
    }
    if request.header("Sec-WebSocket-Version").map(str::trim) != Some("13") {
        return Err(WsError::Handshake {
            status: 426,
            reason: "Unsupported WebSocket version",
        });
    }
    match request.header("Sec-WebSocket-Key").map(str::trim) {
        Some(key) if !key.is_empty() => Ok(accept_key(key)),
        _ => Err(WsError::Handshake {
            status: 400,
            reason: "Missing Sec-WebSocket-Key header",
        }),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub fin: bool,
    pub opcode: u8,
    pub mask: Option<[u8; 4]>,
    pub payload_len: u64,
    /// Bytes taken by the header itself.
    pub header_len: usize,
}

impl FrameHeader {
    /// Parse a frame header from the start of `buf`. `Ok(None)` means more
    /// bytes are needed. Lengths above `max_len` are refused as soon as the
    /// length field is readable.
    pub fn parse(buf: &[u8], max_len: u64) -> Result<Option<Self>, WsError> {
        let (b0, b1) = match buf {
            [b0, b1, ..] => (*b0, *b1),
            _ => return Ok(None),
        };
        if b0 & 0x70 != 0 {
            return Err(WsError::ReservedBits);
        }

        let (payload_len, mut header_len) = match b1 & 0x7F {
            126 => match buf.get(2..4) {
                Some(b) => (u64::from(u16::from_be_bytes([b[0], b[1]])), 4),
                None => return Ok(None),
            },
            127 => match buf.get(2..10) {
                Some(b) => {
                    let mut len = [0u8; 8];
                    len.copy_from_slice(b);
                    (u64::from_be_bytes(len), 10)
                }
                None => return Ok(None),
            },
            n => (u64::from(n), 2),
        };
        if payload_len > max_len {
            return Err(WsError::FrameTooLarge {
                len: payload_len,
                max: max_len,
            });
        }

        let mask = if b1 & 0x80 != 0 {
            match buf.get(header_len..header_len + 4) {
                Some(m) => {
                    header_len += 4;
                    Some([m[0], m[1], m[2], m[3]])
                }
                None => return Ok(None),
            }
        } else {
            None
        };

        Ok(Some(Self {
            fin: b0 & 0x80 != 0,
            opcode: b0 & 0x0F,
            mask,
            payload_len,
            header_len,
        }))
    }

    pub fn is_control(&self) -> bool {
        self.opcode & 0x08 != 0
    }
}

/// XOR `payload` with `mask`, where `payload[0]` sits at `offset` in the frame.
pub fn unmask(payload: &mut [u8], mask: [u8; 4], offset: usize) {
    let mut key = mask;
    key.rotate_left(offset % 4);
    let word = u32::from_ne_bytes(key);

    let mut chunks = payload.chunks_exact_mut(4);
    for chunk in &mut chunks {
        let value = u32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) ^ word;
        chunk.copy_from_slice(&value.to_ne_bytes());
    }
    for (b, k) in chunks.into_remainder().iter_mut().zip(key) {
        *b ^= k;
    }
}

/// Append one frame to `out`.
pub fn encode_frame(out: &mut Vec<u8>, op: u8, fin: bool, payload: &[u8], mask: Option<[u8; 4]>) {
    out.push(((fin as u8) << 7) | (op & 0x0F));

    let mask_bit = if mask.is_some() { 0x80 } else { 0 };
    let len = payload.len();
    if len < 126 {
        out.push(mask_bit | len as u8);
    } else if len <= u16::MAX as usize {
        out.push(mask_bit | 126);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        out.push(mask_bit | 127);
        out.extend_from_slice(&(len as u64).to_be_bytes());
    }

    if let Some(mask) = mask {
        out.extend_from_slice(&mask);
    }
    let start = out.len();
    out.extend_from_slice(payload);
    if let Some(mask) = mask {
        unmask(&mut out[start..], mask, 0);
    }
}

/// Append a whole message split into [`WS_CHUNK`]-sized unmasked frames.
pub fn encode_message(out: &mut Vec<u8>, op: u8, payload: &[u8]) {
    if payload.is_empty() {
        encode_frame(out, op, true, payload, None);
        return;
    }

    let count = payload.len().div_ceil(WS_CHUNK);
    for (i, chunk) in payload.chunks(WS_CHUNK).enumerate() {
        let frame_op = if i == 0 { op } else { opcode::CONTINUATION };
        encode_frame(out, frame_op, i + 1 == count, chunk, None);
    }
}

/// Decode one complete frame from `buf`, returning its header, unmasked
/// payload and total length.
pub fn decode_frame(buf: &[u8], max_len: u64) -> Result<Option<(FrameHeader, Vec<u8>, usize)>, WsError> {
    let Some(header) = FrameHeader::parse(buf, max_len)? else {
        return Ok(None);
    };
    let total = header.header_len + header.payload_len as usize;
    let Some(body) = buf.get(header.header_len..total) else {
        return Ok(None);
    };

    let mut payload = body.to_vec();
    if let Some(mask) = header.mask {
        unmask(&mut payload, mask, 0);
    }
    Ok(Some((header, payload, total)))
}

/// Message stream over an upgraded connection.
///
/// `Read` yields payload bytes across frame boundaries and returns 0 once
/// the client sends Close. `Write` sends each call as one message.
pub struct WsStream<'a> {
    conn: &'a mut Connection,
    opcode: u8,
    frame_left: u64,
    mask: [u8; 4],
    mask_offset: usize,
    in_message: bool,
    message_opcode: u8,
}

impl<'a> WsStream<'a> {
    pub(crate) fn new(conn: &'a mut Connection, mode: WsMode) -> Self {
        Self {
            conn,
            opcode: mode.opcode(),
            frame_left: 0,
            mask: [0; 4],
            mask_offset: 0,
            in_message: false,
            message_opcode: mode.opcode(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.conn.ws == WsPhase::Closed
    }

    fn violation(&mut self, err: WsError) -> io::Error {
        debug!(client = %self.conn.peer(), "websocket protocol violation: {}", err);
        self.conn.ws = WsPhase::Closed;
        self.conn.request.keepalive = false;
        self.conn.shutdown(Shutdown::Both);
        err.into()
    }

    fn close(&mut self) {
        self.conn.ws = WsPhase::Closed;
        let mut frame = Vec::with_capacity(2);
        encode_frame(&mut frame, opcode::CLOSE, true, &[], None);
        let _ = self.conn.write_all(&frame, false);
    }

    /// Read a complete control payload into a small buffer.
    fn read_control(&mut self, header: &FrameHeader) -> io::Result<Option<Vec<u8>>> {
        let len = header.payload_len as usize;
        if !self.conn.fill(len)? {
            return Ok(None);
        }
        let start = self.conn.pos;
        let mut payload = self.conn.incoming[start..start + len].to_vec();
        self.conn.pos += len;
        if let Some(mask) = header.mask {
            unmask(&mut payload, mask, 0);
        }
        Ok(Some(payload))
    }

    /// Advance to the next data frame. `None` once the stream is closed.
    fn next_frame(&mut self) -> io::Result<Option<FrameHeader>> {
        loop {
            if self.conn.ws == WsPhase::Closed {
                return Ok(None);
            }

            let header = loop {
                let buffered = &self.conn.incoming[self.conn.pos..];
                match FrameHeader::parse(buffered, self.conn.limits.ws_max_frame) {
                    Ok(Some(header)) => break header,
                    Ok(None) => {
                        let need = buffered.len() + 1;
                        if !self.conn.fill(need)? {
                            self.conn.ws = WsPhase::Closed;
                            return Ok(None);
                        }
                    }
                    Err(e) => return Err(self.violation(e)),
                }
            };
            let Some(mask) = header.mask else {
                return Err(self.violation(WsError::Unmasked));
            };
            self.conn.pos += header.header_len;

            if header.is_control() {
                if header.payload_len > 125 || !header.fin {
                    return Err(self.violation(WsError::UnexpectedOpcode(header.opcode)));
                }
                let Some(payload) = self.read_control(&header)? else {
                    self.conn.ws = WsPhase::Closed;
                    return Ok(None);
                };
                match header.opcode {
                    opcode::CLOSE => {
                        self.close();
                        return Ok(None);
                    }
                    opcode::PING => {
                        let mut pong = Vec::with_capacity(payload.len() + 2);
                        encode_frame(&mut pong, opcode::PONG, true, &payload, None);
                        self.conn.write_all(&pong, false)?;
                    }
                    opcode::PONG => {}
                    op => return Err(self.violation(WsError::UnexpectedOpcode(op))),
                }
                continue;
            }

            match header.opcode {
                opcode::TEXT | opcode::BINARY if !self.in_message => {
                    self.message_opcode = header.opcode;
                }
                opcode::CONTINUATION if self.in_message => {}
                op => return Err(self.violation(WsError::UnexpectedOpcode(op))),
            }
            self.in_message = !header.fin;
            self.frame_left = header.payload_len;
            self.mask = mask;
            self.mask_offset = 0;
            return Ok(Some(header));
        }
    }

    fn read_payload(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let want = buf.len().min(self.frame_left.min(usize::MAX as u64) as usize);
        let n = self.conn.read_buffered(&mut buf[..want])?;
        if n == 0 {
            self.conn.ws = WsPhase::Closed;
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        unmask(&mut buf[..n], self.mask, self.mask_offset);
        self.mask_offset += n;
        self.frame_left -= n as u64;
        Ok(n)
    }

    /// Read one whole message into `out`. `None` once the client closed.
    pub fn read_message(&mut self, out: &mut Vec<u8>) -> io::Result<Option<WsMode>> {
        out.clear();
        let mut started = false;
        loop {
            if self.frame_left == 0 {
                if started && !self.in_message {
                    return Ok(Some(WsMode::from_opcode(self.message_opcode)));
                }
                let Some(header) = self.next_frame()? else {
                    return Ok(None);
                };
                let total = out.len() as u64 + header.payload_len;
                let max = self.conn.limits.ws_max_frame;
                if total > max {
                    return Err(self.violation(WsError::FrameTooLarge { len: total, max }));
                }
                started = true;
                continue;
            }

            let len = out.len();
            let step = self.frame_left.min(64 * 1024) as usize;
            out.resize(len + step, 0);
            let result = self.read_payload(&mut out[len..]);
            out.truncate(len + *result.as_ref().unwrap_or(&0));
            result?;
        }
    }

    /// Send `data` as one message with an explicit opcode.
    pub fn send_message(&mut self, mode: WsMode, data: &[u8]) -> io::Result<()> {
        if self.conn.ws == WsPhase::Closed {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        let mut frames = Vec::with_capacity(data.len() + 4 * (data.len() / WS_CHUNK + 1));
        encode_message(&mut frames, mode.opcode(), data);
        self.conn.write_all(&frames, false)
    }
}

impl Read for WsStream<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        // Empty frames are skipped; 0 is reserved for end of stream
        while self.frame_left == 0 {
            if self.next_frame()?.is_none() {
                return Ok(0);
            }
        }
        self.read_payload(buf)
    }
}

impl Write for WsStream<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mode = WsMode::from_opcode(self.opcode);
        self.send_message(mode, buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Limits;
    use crate::conn::now_ms;
    use std::os::fd::OwnedFd;
    use std::os::unix::net::UnixStream;

    const MASK: [u8; 4] = [0x37, 0xfa, 0x21, 0x3d];

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    /// An upgraded connection with `frames` already buffered.
    fn upgraded(stream: UnixStream, max_frame: u64, frames: &[u8]) -> Connection {
        let limits = Limits {
            ws_max_frame: max_frame,
            ..Limits::default()
        };
        let mut conn = Connection::new();
        conn.init(OwnedFd::from(stream), now_ms(), "test".into(), limits);
        conn.incoming.extend_from_slice(frames);
        conn.ws = WsPhase::Open;
        conn
    }

    #[test]
    fn test_fragmented_message_is_reassembled() {
        let (server, _client) = UnixStream::pair().unwrap();
        let data = payload(300);
        let mut wire = Vec::new();
        encode_frame(&mut wire, opcode::BINARY, false, &data[..150], Some(MASK));
        encode_frame(&mut wire, opcode::CONTINUATION, true, &data[150..], Some(MASK));

        let mut conn = upgraded(server, 300, &wire);
        let mut ws = WsStream::new(&mut conn, WsMode::Binary);
        let mut message = Vec::new();
        assert_eq!(ws.read_message(&mut message).unwrap(), Some(WsMode::Binary));
        assert_eq!(message, data);
    }

    #[test]
    fn test_message_above_frame_limit_is_refused() {
        let (server, _client) = UnixStream::pair().unwrap();
        let mut wire = Vec::new();
        encode_frame(&mut wire, opcode::TEXT, false, &payload(150), Some(MASK));
        encode_frame(&mut wire, opcode::CONTINUATION, false, &payload(150), Some(MASK));
        encode_frame(&mut wire, opcode::CONTINUATION, true, &payload(150), Some(MASK));

        let mut conn = upgraded(server, 200, &wire);
        let mut ws = WsStream::new(&mut conn, WsMode::Text);
        let mut message = Vec::new();
        let err = ws.read_message(&mut message).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(message.len() <= 200);
        assert!(ws.is_closed());
    }

    #[test]
    fn test_accept_key_rfc_sample() {
        assert_eq!(accept_key("dGhlIHNhbXBsZSBub25jZQ=="), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn test_frame_round_trip_lengths() {
        for len in [0usize, 1, 125, 126, 65536] {
            let data = payload(len);
            let mut wire = Vec::new();
            encode_frame(&mut wire, opcode::BINARY, true, &data, Some(MASK));

            let expected_len_field = match len {
                0..=125 => 0,
                126..=65535 => 2,
                _ => 8,
            };
            assert_eq!(wire.len(), 2 + expected_len_field + 4 + len);

            let (header, decoded, used) = decode_frame(&wire, WS_MAX_FRAME).unwrap().unwrap();
            assert_eq!(used, wire.len());
            assert_eq!(header.payload_len, len as u64);
            assert!(header.fin);
            assert_eq!(decoded, data, "length {len}");
        }
    }

    #[test]
    fn test_length_field_boundaries() {
        let mut wire = Vec::new();
        encode_frame(&mut wire, opcode::TEXT, true, &payload(126), None);
        assert_eq!(wire[1], 126);
        assert_eq!(&wire[2..4], &126u16.to_be_bytes());

        wire.clear();
        encode_frame(&mut wire, opcode::TEXT, true, &payload(65536), None);
        assert_eq!(wire[1], 127);
        assert_eq!(&wire[2..10], &65536u64.to_be_bytes());
    }

    #[test]
    fn test_masking_correctness() {
        let data = payload(37);
        let masked: Vec<u8> = data.iter().enumerate().map(|(i, b)| b ^ MASK[i % 4]).collect();

        let mut wire = vec![0x82, 0x80 | 37];
        wire.extend_from_slice(&MASK);
        wire.extend_from_slice(&masked);

        let (_, decoded, _) = decode_frame(&wire, WS_MAX_FRAME).unwrap().unwrap();
        for i in 0..data.len() {
            assert_eq!(decoded[i], masked[i] ^ MASK[i % 4]);
        }
        assert_eq!(decoded, data);
    }

    #[test]
    fn test_unmask_with_offset() {
        let data = payload(23);
        let mut masked: Vec<u8> = data.iter().enumerate().map(|(i, b)| b ^ MASK[i % 4]).collect();
        let (a, b) = masked.split_at_mut(7);
        unmask(a, MASK, 0);
        unmask(b, MASK, 7);
        assert_eq!(masked, data);
    }

    #[test]
    fn test_oversized_frame_rejected_from_header() {
        // Only the header is present: the claimed length is never buffered
        let mut wire = vec![0x82, 0x80 | 127];
        wire.extend_from_slice(&(WS_MAX_FRAME + 1).to_be_bytes());
        assert_eq!(
            FrameHeader::parse(&wire, WS_MAX_FRAME),
            Err(WsError::FrameTooLarge {
                len: WS_MAX_FRAME + 1,
                max: WS_MAX_FRAME
            })
        );
    }

    #[test]
    fn test_reserved_bits_rejected() {
        assert_eq!(FrameHeader::parse(&[0xC1, 0x80], WS_MAX_FRAME), Err(WsError::ReservedBits));
    }

    #[test]
    fn test_partial_header_needs_more() {
        assert_eq!(FrameHeader::parse(&[0x81], WS_MAX_FRAME), Ok(None));
        assert_eq!(FrameHeader::parse(&[0x81, 0xFE, 0x01], WS_MAX_FRAME), Ok(None));
        assert_eq!(FrameHeader::parse(&[0x81, 0x85, 1, 2], WS_MAX_FRAME), Ok(None));
    }

    #[test]
    fn test_message_fragmentation() {
        let data = payload(WS_CHUNK * 2 + 10);
        let mut wire = Vec::new();
        encode_message(&mut wire, opcode::TEXT, &data);

        let mut offset = 0;
        let mut frames = Vec::new();
        while offset < wire.len() {
            let (header, body, used) = decode_frame(&wire[offset..], WS_MAX_FRAME).unwrap().unwrap();
            assert!(header.mask.is_none());
            frames.push((header, body));
            offset += used;
        }

        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].0.opcode, opcode::TEXT);
        assert_eq!(frames[1].0.opcode, opcode::CONTINUATION);
        assert_eq!(frames[2].0.opcode, opcode::CONTINUATION);
        assert!(!frames[0].0.fin && !frames[1].0.fin && frames[2].0.fin);
        assert_eq!(frames[0].1.len(), WS_CHUNK);
        assert_eq!(frames.iter().flat_map(|(_, b)| b.clone()).collect::<Vec<_>>(), data);
    }

    #[test]
    fn test_check_handshake() {
        let mut request = Request::default();
        request.headers.push("Connection", "keep-alive, Upgrade");
        request.headers.push("Upgrade", "websocket");
        request.headers.push("Sec-WebSocket-Version", "13");
        request.headers.push("Sec-WebSocket-Key", "dGhlIHNhbXBsZSBub25jZQ==");
        assert_eq!(check_handshake(&request).unwrap(), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");

        let mut old = request.clone();
        old.headers.push("Sec-WebSocket-Version", "8");
        assert!(matches!(check_handshake(&old), Err(WsError::Handshake { status: 426, .. })));

        let mut plain = Request::default();
        plain.headers.push("Sec-WebSocket-Version", "13");
        assert!(matches!(check_handshake(&plain), Err(WsError::Handshake { status: 400, .. })));
    }
}
