//! Nocturne: a multi-reactor HTTP/1.x and WebSocket server engine.
//!
//! Each reactor thread owns a readiness poller (epoll on Linux, kqueue on
//! BSD and macOS), a connection arena and a small pool of worker threads.
//! Requests are buffered and parsed on the reactor; complete requests are
//! handed to a worker that runs the user [`Handler`] against a
//! [`ConnectionIo`].
//!
//! ```rust,no_run
//! use nocturne_core::{Config, ConnectionIo, Daemon};
//!
//! fn main() -> Result<(), nocturne_core::NocturneError> {
//!     nocturne_core::logging::init_logging();
//!
//!     let mut daemon = Daemon::new();
//!     daemon.bind(Config::from_env()?)?;
//!     daemon.start(|io: &mut ConnectionIo<'_>| {
//!         let path = io.request().path.clone();
//!         let _ = io.send_text(200, &format!("Hello from {path}\n"), "text/plain");
//!     })?;
//!     daemon.wait_for_signal()
//! }
//! ```

pub mod config;
pub mod conn;
pub mod error;
pub mod http;
pub mod io;
pub mod logging;
pub mod metrics;
pub mod parser;
pub mod poller;
pub mod pool;
pub mod reactor;
pub mod response;
pub mod server;
pub mod slab;
pub mod syscalls;
pub mod worker;
pub mod ws;

pub use config::{AddressMode, Config, SocketType};
pub use error::{NocturneError, NocturneResult, ParseError, WsError};
pub use http::{KeyValues, Method, Request, Version};
pub use io::{BodyReader, ConnectionIo, CookieFlags, Handler, ResponseWriter};
pub use metrics::Metrics;
pub use server::Daemon;
pub use ws::{WsMode, WsStream};
