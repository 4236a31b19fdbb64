use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;
use std::sync::Arc;
use std::time::Duration;

use tracing::trace;

use super::{Event, EVENTS_CAPACITY, Interest, Poller, WAKE_KEY, Waker, drain};

/// kqueue with a self-pipe waker.
///
/// Changes are queued and submitted with `EV_RECEIPT` at the start of the
/// next [`Poller::wait`]; a failed change (for example on a descriptor that
/// was closed meanwhile) only affects itself.
pub struct Kqueue {
    fd: OwnedFd,
    pipe_rd: OwnedFd,
    waker: Arc<Waker>,
    changes: Vec<libc::kevent>,
    receipts: Vec<libc::kevent>,
    buf: Vec<libc::kevent>,
}

// udata only ever carries integer keys, never pointers
unsafe impl Send for Kqueue {}

fn change(fd: RawFd, filter: i32, flags: u32, key: u64) -> libc::kevent {
    let mut ev: libc::kevent = unsafe { mem::zeroed() };
    ev.ident = fd as _;
    ev.filter = filter as _;
    ev.flags = flags as _;
    ev.udata = key as usize as _;
    ev
}

fn nonblocking_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as libc::c_int; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
        return Err(io::Error::last_os_error());
    }
    let (rd, wr) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
    for fd in [rd.as_raw_fd(), wr.as_raw_fd()] {
        crate::syscalls::set_nonblocking(fd, true)?;
        unsafe {
            libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
        }
    }
    Ok((rd, wr))
}

impl Kqueue {
    pub fn new() -> io::Result<Self> {
        let kq = unsafe { libc::kqueue() };
        if kq < 0 {
            return Err(io::Error::last_os_error());
        }
        let fd = unsafe { OwnedFd::from_raw_fd(kq) };
        unsafe {
            libc::fcntl(fd.as_raw_fd(), libc::F_SETFD, libc::FD_CLOEXEC);
        }

        let (pipe_rd, pipe_wr) = nonblocking_pipe()?;
        let mut kqueue = Self {
            fd,
            waker: Arc::new(Waker::new(Arc::new(pipe_wr))),
            pipe_rd,
            changes: Vec::new(),
            receipts: Vec::new(),
            buf: vec![unsafe { mem::zeroed() }; EVENTS_CAPACITY],
        };
        let rd = kqueue.pipe_rd.as_raw_fd();
        kqueue.push(rd, (libc::EV_ADD | libc::EV_ENABLE) as u32, WAKE_KEY);
        kqueue.flush()?;

        Ok(kqueue)
    }

    fn push(&mut self, fd: RawFd, flags: u32, key: u64) {
        let flags = flags | libc::EV_RECEIPT as u32;
        self.changes.push(change(fd, libc::EVFILT_READ as i32, flags, key));
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.changes.is_empty() {
            return Ok(());
        }
        self.receipts.clear();
        self.receipts.reserve(self.changes.len());

        let zero = libc::timespec { tv_sec: 0, tv_nsec: 0 };
        let n = unsafe {
            libc::kevent(
                self.fd.as_raw_fd(),
                self.changes.as_ptr(),
                self.changes.len() as _,
                self.receipts.as_mut_ptr(),
                self.changes.len() as _,
                &zero,
            )
        };
        self.changes.clear();
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err);
        }
        unsafe { self.receipts.set_len(n as usize) };

        for receipt in &self.receipts {
            if receipt.flags as u32 & libc::EV_ERROR as u32 != 0 && receipt.data != 0 {
                trace!(fd = receipt.ident as i64, errno = receipt.data as i64, "kevent change rejected");
            }
        }
        Ok(())
    }
}

impl Poller for Kqueue {
    fn register(&mut self, fd: RawFd, key: u64, _interest: Interest) -> io::Result<()> {
        self.push(fd, (libc::EV_ADD | libc::EV_ENABLE) as u32, key);
        Ok(())
    }

    fn modify(&mut self, fd: RawFd, key: u64, interest: Option<Interest>) -> io::Result<()> {
        let flags = match interest {
            Some(_) => libc::EV_ADD | libc::EV_ENABLE,
            None => libc::EV_DISABLE,
        };
        self.push(fd, flags as u32, key);
        Ok(())
    }

    fn deregister(&mut self, fd: RawFd) -> io::Result<()> {
        self.push(fd, libc::EV_DELETE as u32, 0);
        Ok(())
    }

    fn wait(&mut self, events: &mut Vec<Event>, timeout: Option<Duration>) -> io::Result<()> {
        events.clear();
        self.flush()?;

        let ts = timeout.map(|d| libc::timespec {
            tv_sec: d.as_secs().min(i32::MAX as u64) as _,
            tv_nsec: d.subsec_nanos() as _,
        });
        let ts_ptr = ts.as_ref().map_or(ptr::null(), |t| t as *const libc::timespec);

        let n = unsafe {
            libc::kevent(
                self.fd.as_raw_fd(),
                ptr::null(),
                0,
                self.buf.as_mut_ptr(),
                self.buf.len() as _,
                ts_ptr,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err);
        }

        for ev in &self.buf[..n as usize] {
            let key = ev.udata as usize as u64;
            if key == WAKE_KEY {
                drain(self.pipe_rd.as_raw_fd());
                continue;
            }
            let flags = ev.flags as u32;
            events.push(Event {
                key,
                readable: true,
                hangup: flags & libc::EV_EOF as u32 != 0,
                error: flags & libc::EV_ERROR as u32 != 0,
            });
        }

        Ok(())
    }

    fn waker(&self) -> Arc<Waker> {
        self.waker.clone()
    }
}
