//! Readiness notification behind one trait.
//!
//! Backends: [`epoll`] on Linux and Android, [`kqueue`] on BSD and Apple
//! platforms. Registration changes may be buffered by a backend and applied
//! on the next [`Poller::wait`], so callers must never assume a change is
//! visible to the kernel before then.

use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::time::Duration;

#[cfg(any(target_os = "linux", target_os = "android"))]
pub mod epoll;
#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd",
    target_os = "dragonfly"
))]
pub mod kqueue;

#[cfg(any(target_os = "linux", target_os = "android"))]
pub type DefaultPoller = epoll::Epoll;
#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd",
    target_os = "dragonfly"
))]
pub type DefaultPoller = kqueue::Kqueue;

/// Key of the listening socket. Connection keys come from the arena and
/// never reach these values.
pub const LISTENER_KEY: u64 = u64::MAX - 1;
/// Key of the waker descriptor; consumed inside the backends.
pub const WAKE_KEY: u64 = u64::MAX;

/// Events capacity per wait call.
pub const EVENTS_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    /// Read readiness on a connection.
    Read,
    /// Accept readiness on a listener shared by several reactors.
    Accept,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub key: u64,
    pub readable: bool,
    pub hangup: bool,
    pub error: bool,
}

pub trait Poller: Send {
    fn register(&mut self, fd: RawFd, key: u64, interest: Interest) -> io::Result<()>;

    /// Enable (`Some`) or suspend (`None`) readiness reporting for `fd`.
    fn modify(&mut self, fd: RawFd, key: u64, interest: Option<Interest>) -> io::Result<()>;

    fn deregister(&mut self, fd: RawFd) -> io::Result<()>;

    /// Apply pending changes and block until readiness, a wake-up or the
    /// timeout. `events` is replaced with what was reported; `None` waits
    /// forever.
    fn wait(&mut self, events: &mut Vec<Event>, timeout: Option<Duration>) -> io::Result<()>;

    fn waker(&self) -> Arc<Waker>;

    fn wake(&self) -> io::Result<()> {
        self.waker().wake()
    }
}

/// Cross-thread handle that interrupts a blocked [`Poller::wait`].
#[derive(Debug)]
pub struct Waker {
    fd: Arc<OwnedFd>,
}

impl Waker {
    pub(crate) fn new(fd: Arc<OwnedFd>) -> Self {
        Self { fd }
    }

    pub fn wake(&self) -> io::Result<()> {
        #[cfg(any(target_os = "linux", target_os = "android"))]
        let payload = 1u64.to_ne_bytes();
        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        let payload = [1u8];

        let ret = unsafe {
            libc::write(
                self.fd.as_raw_fd(),
                payload.as_ptr() as *const libc::c_void,
                payload.len(),
            )
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            // A full pipe or counter already guarantees a pending wake-up
            if err.kind() != io::ErrorKind::WouldBlock {
                return Err(err);
            }
        }
        Ok(())
    }
}

/// Read everything pending on a non-blocking descriptor.
pub(crate) fn drain(fd: RawFd) {
    let mut buf = [0u8; 64];
    loop {
        let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n <= 0 {
            let err = io::Error::last_os_error();
            if n < 0 && err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            break;
        }
    }
}

pub(crate) fn timeout_ms(timeout: Option<Duration>) -> i32 {
    match timeout {
        None => -1,
        Some(d) => {
            // Round up so a pending deadline is never polled early
            let ms = d.as_millis() + u128::from(d.subsec_nanos() % 1_000_000 != 0);
            ms.min(i32::MAX as u128) as i32
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{TcpListener, TcpStream};
    use std::io::Write;
    use std::time::Instant;

    #[test]
    fn test_timeout_rounding() {
        assert_eq!(timeout_ms(None), -1);
        assert_eq!(timeout_ms(Some(Duration::from_millis(5))), 5);
        assert_eq!(timeout_ms(Some(Duration::from_micros(1500))), 2);
        assert_eq!(timeout_ms(Some(Duration::from_secs(u64::MAX / 2))), i32::MAX);
    }

    #[test]
    fn test_wait_times_out() {
        let mut poller = DefaultPoller::new().unwrap();
        let mut events = Vec::new();
        let start = Instant::now();
        poller.wait(&mut events, Some(Duration::from_millis(30))).unwrap();
        assert!(events.is_empty());
        assert!(start.elapsed() >= Duration::from_millis(25));
    }

    #[test]
    fn test_wake_unblocks_wait() {
        let mut poller = DefaultPoller::new().unwrap();
        let waker = poller.waker();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            waker.wake().unwrap();
        });

        let mut events = Vec::new();
        let start = Instant::now();
        poller.wait(&mut events, Some(Duration::from_secs(10))).unwrap();
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(events.is_empty());
        handle.join().unwrap();
    }

    #[test]
    fn test_read_readiness_and_suspend() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        let fd = server.as_raw_fd();

        let mut poller = DefaultPoller::new().unwrap();
        poller.register(fd, 7, Interest::Read).unwrap();
        client.write_all(b"x").unwrap();

        let mut events = Vec::new();
        poller.wait(&mut events, Some(Duration::from_secs(5))).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].key, 7);
        assert!(events[0].readable);

        // Suspended descriptors stay silent even with data pending
        poller.modify(fd, 7, None).unwrap();
        events.clear();
        poller.wait(&mut events, Some(Duration::from_millis(30))).unwrap();
        assert!(events.is_empty());

        poller.modify(fd, 7, Some(Interest::Read)).unwrap();
        events.clear();
        poller.wait(&mut events, Some(Duration::from_secs(5))).unwrap();
        assert_eq!(events.len(), 1);

        poller.deregister(fd).unwrap();
        events.clear();
        poller.wait(&mut events, Some(Duration::from_millis(30))).unwrap();
        assert!(events.is_empty());
    }
}
