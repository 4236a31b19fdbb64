use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum NocturneError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("poller error: {0}")]
    Poller(#[source] io::Error),
    #[error("daemon is already bound")]
    AlreadyBound,
    #[error("daemon is already started")]
    AlreadyStarted,
    #[error("daemon is not bound")]
    NotBound,
    #[error("response headers were already sent")]
    ResponseStarted,
    #[error("request rejected with status {status}")]
    Rejected { status: u16 },
    #[error("websocket: {0}")]
    WebSocket(#[from] WsError),
}

pub type NocturneResult<T> = Result<T, NocturneError>;

/// WebSocket protocol and handshake failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WsError {
    #[error("client frame is not masked")]
    Unmasked,
    #[error("reserved bits set in frame header")]
    ReservedBits,
    #[error("frame payload of {len} bytes exceeds limit of {max} bytes")]
    FrameTooLarge { len: u64, max: u64 },
    #[error("unexpected opcode {0}")]
    UnexpectedOpcode(u8),
    #[error("handshake rejected with {status}: {reason}")]
    Handshake { status: u16, reason: &'static str },
}

impl From<WsError> for io::Error {
    fn from(err: WsError) -> Self {
        io::Error::new(io::ErrorKind::InvalidData, err)
    }
}

/// A request the parser refused, with the status to answer it with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{status} {reason}")]
pub struct ParseError {
    pub status: u16,
    pub reason: &'static str,
}

impl ParseError {
    pub const fn new(status: u16, reason: &'static str) -> Self {
        Self { status, reason }
    }
}
