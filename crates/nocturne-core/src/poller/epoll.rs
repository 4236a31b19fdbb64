use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::time::Duration;

use super::{Event, EVENTS_CAPACITY, Interest, Poller, WAKE_KEY, Waker, drain, timeout_ms};

/// Level-triggered epoll with an eventfd waker.
pub struct Epoll {
    fd: OwnedFd,
    wake_fd: Arc<OwnedFd>,
    waker: Arc<Waker>,
    buf: Vec<libc::epoll_event>,
}

impl Epoll {
    pub fn new() -> io::Result<Self> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        let efd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
        if efd < 0 {
            return Err(io::Error::last_os_error());
        }
        let wake_fd = Arc::new(unsafe { OwnedFd::from_raw_fd(efd) });

        let mut epoll = Self {
            fd,
            waker: Arc::new(Waker::new(wake_fd.clone())),
            wake_fd,
            buf: vec![libc::epoll_event { events: 0, u64: 0 }; EVENTS_CAPACITY],
        };
        let efd = epoll.wake_fd.as_raw_fd();
        epoll.ctl(libc::EPOLL_CTL_ADD, efd, WAKE_KEY, libc::EPOLLIN as u32)?;

        Ok(epoll)
    }

    fn ctl(&mut self, op: libc::c_int, fd: RawFd, key: u64, events: u32) -> io::Result<()> {
        let mut ev = libc::epoll_event { events, u64: key };
        if unsafe { libc::epoll_ctl(self.fd.as_raw_fd(), op, fd, &mut ev) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn flags(interest: Interest) -> u32 {
        match interest {
            Interest::Read => (libc::EPOLLIN | libc::EPOLLRDHUP) as u32,
            Interest::Accept => (libc::EPOLLIN | libc::EPOLLEXCLUSIVE) as u32,
        }
    }
}

impl Poller for Epoll {
    fn register(&mut self, fd: RawFd, key: u64, interest: Interest) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, key, Self::flags(interest))
    }

    fn modify(&mut self, fd: RawFd, key: u64, interest: Option<Interest>) -> io::Result<()> {
        match interest {
            // epoll keeps reporting HUP/ERR on a descriptor with an empty
            // mask, so suspension removes it from the set
            None => self.deregister(fd),
            Some(interest) => match self.ctl(libc::EPOLL_CTL_ADD, fd, key, Self::flags(interest)) {
                Err(e) if e.raw_os_error() == Some(libc::EEXIST) => {
                    self.ctl(libc::EPOLL_CTL_MOD, fd, key, Self::flags(interest))
                }
                other => other,
            },
        }
    }

    fn deregister(&mut self, fd: RawFd) -> io::Result<()> {
        match self.ctl(libc::EPOLL_CTL_DEL, fd, 0, 0) {
            Err(e) if e.raw_os_error() == Some(libc::ENOENT) => Ok(()),
            other => other,
        }
    }

    fn wait(&mut self, events: &mut Vec<Event>, timeout: Option<Duration>) -> io::Result<()> {
        events.clear();
        let n = unsafe {
            libc::epoll_wait(
                self.fd.as_raw_fd(),
                self.buf.as_mut_ptr(),
                self.buf.len() as libc::c_int,
                timeout_ms(timeout),
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
            let ev = *ev;
            let (key, flags) = (ev.u64, ev.events);
            if key == WAKE_KEY {
                drain(self.wake_fd.as_raw_fd());
                continue;
            }
            events.push(Event {
                key,
                readable: flags & libc::EPOLLIN as u32 != 0,
                hangup: flags & (libc::EPOLLHUP | libc::EPOLLRDHUP) as u32 != 0,
                error: flags & libc::EPOLLERR as u32 != 0,
            });
        }

        Ok(())
    }

    fn waker(&self) -> Arc<Waker> {
        self.waker.clone()
    }
}
