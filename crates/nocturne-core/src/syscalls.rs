// Thin libc wrappers for the socket plumbing used by the reactors and workers.
use std::ffi::CString;
use std::io::{self, IoSlice};
use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, Shutdown, SocketAddr};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use libc::{c_int, c_void, socklen_t};

use crate::config::{Config, SocketType};

/// Pending connection queue length of every listener.
pub const LISTEN_BACKLOG: c_int = 200;

#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
const SEND_FLAGS: c_int = libc::MSG_NOSIGNAL;
#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
const SEND_FLAGS: c_int = 0;

#[cfg(any(target_os = "linux", target_os = "android"))]
const MORE_FLAG: c_int = libc::MSG_MORE;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const MORE_FLAG: c_int = 0;

fn cvt(ret: c_int) -> io::Result<c_int> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

fn cvt_size(ret: libc::ssize_t) -> io::Result<usize> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret as usize)
    }
}

fn setsockopt_int(fd: RawFd, level: c_int, name: c_int, value: c_int) -> io::Result<()> {
    let ret = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            &value as *const c_int as *const c_void,
            mem::size_of::<c_int>() as socklen_t,
        )
    };
    cvt(ret).map(|_| ())
}

fn new_socket(domain: c_int) -> io::Result<OwnedFd> {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    let fd = cvt(unsafe {
        libc::socket(domain, libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC, 0)
    })?;
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    let fd = cvt(unsafe { libc::socket(domain, libc::SOCK_STREAM, 0) })?;

    let sock = unsafe { OwnedFd::from_raw_fd(fd) };

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    {
        set_cloexec(sock.as_raw_fd())?;
        set_nonblocking(sock.as_raw_fd(), true)?;
    }

    Ok(sock)
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn set_cloexec(fd: RawFd) -> io::Result<()> {
    let flags = cvt(unsafe { libc::fcntl(fd, libc::F_GETFD) })?;
    cvt(unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) }).map(|_| ())
}

pub fn set_nonblocking(fd: RawFd, enable: bool) -> io::Result<()> {
    let flags = cvt(unsafe { libc::fcntl(fd, libc::F_GETFL) })?;
    let flags = if enable { flags | libc::O_NONBLOCK } else { flags & !libc::O_NONBLOCK };
    cvt(unsafe { libc::fcntl(fd, libc::F_SETFL, flags) }).map(|_| ())
}

fn ip_sockaddr(addr: SocketAddr) -> (libc::sockaddr_storage, socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };

    let len = match addr {
        SocketAddr::V4(a) => {
            let sin = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in) };
            sin.sin_family = libc::AF_INET as libc::sa_family_t;
            sin.sin_port = a.port().to_be();
            sin.sin_addr = libc::in_addr {
                s_addr: u32::from_ne_bytes(a.ip().octets()),
            };
            #[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
            {
                sin.sin_len = mem::size_of::<libc::sockaddr_in>() as u8;
            }
            mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(a) => {
            let sin6 = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in6) };
            sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sin6.sin6_port = a.port().to_be();
            sin6.sin6_addr = libc::in6_addr {
                s6_addr: a.ip().octets(),
            };
            sin6.sin6_scope_id = a.scope_id();
            #[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
            {
                sin6.sin6_len = mem::size_of::<libc::sockaddr_in6>() as u8;
            }
            mem::size_of::<libc::sockaddr_in6>()
        }
    };

    (storage, len as socklen_t)
}

fn listen_addr(config: &Config, port: u16) -> io::Result<SocketAddr> {
    let ip = match config.bind_addr.as_deref() {
        Some(addr) => addr
            .parse::<IpAddr>()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?,
        None if config.sock_type == SocketType::IPv4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        None => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    };

    let ip = match (config.sock_type, ip) {
        (SocketType::Dual, IpAddr::V4(v4)) => IpAddr::V6(v4.to_ipv6_mapped()),
        (_, ip) => ip,
    };

    Ok(SocketAddr::new(ip, port))
}

/// Create a non-blocking listener for `config`, bound to `port`.
///
/// TCP listeners set SO_REUSEPORT so that every reactor can own one.
/// Unix listeners replace any stale socket file at the configured path.
pub fn create_listener(config: &Config, port: u16) -> io::Result<OwnedFd> {
    if config.sock_type == SocketType::Unix {
        let path = config
            .unix_path
            .as_deref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "missing Unix socket path"))?;
        return create_unix_listener(path);
    }

    let addr = listen_addr(config, port)?;
    let domain = if addr.is_ipv6() { libc::AF_INET6 } else { libc::AF_INET };
    let sock = new_socket(domain)?;
    let fd = sock.as_raw_fd();

    if addr.is_ipv6() {
        let v6only = (config.sock_type == SocketType::IPv6) as c_int;
        setsockopt_int(fd, libc::IPPROTO_IPV6, libc::IPV6_V6ONLY, v6only)?;
    }
    setsockopt_int(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, 1)?;
    setsockopt_int(fd, libc::SOL_SOCKET, libc::SO_REUSEPORT, 1)?;

    let (storage, len) = ip_sockaddr(addr);
    cvt(unsafe { libc::bind(fd, &storage as *const _ as *const libc::sockaddr, len) })?;
    cvt(unsafe { libc::listen(fd, LISTEN_BACKLOG) })?;

    Ok(sock)
}

fn create_unix_listener(path: &str) -> io::Result<OwnedFd> {
    let sock = new_socket(libc::AF_UNIX)?;
    let fd = sock.as_raw_fd();

    let mut addr: libc::sockaddr_un = unsafe { mem::zeroed() };
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
    let bytes = path.as_bytes();
    if bytes.len() >= addr.sun_path.len() {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "Unix socket path is too long"));
    }
    for (dst, src) in addr.sun_path.iter_mut().zip(bytes) {
        *dst = *src as libc::c_char;
    }

    let cpath = CString::new(path).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    if unsafe { libc::unlink(cpath.as_ptr()) } < 0 {
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::NotFound {
            return Err(err);
        }
    }

    let len = mem::size_of::<libc::sockaddr_un>() as socklen_t;
    cvt(unsafe { libc::bind(fd, &addr as *const _ as *const libc::sockaddr, len) })?;
    cvt(unsafe { libc::listen(fd, LISTEN_BACKLOG) })?;

    Ok(sock)
}

/// Local TCP address of a listener, `None` for Unix sockets.
pub fn local_addr(fd: RawFd) -> io::Result<Option<SocketAddr>> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;
    cvt(unsafe { libc::getsockname(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len) })?;
    Ok(sockaddr_to_std(&storage))
}

fn sockaddr_to_std(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match storage.ss_family as c_int {
        libc::AF_INET => {
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes());
            Some(SocketAddr::new(IpAddr::V4(ip), u16::from_be(sin.sin_port)))
        }
        libc::AF_INET6 => {
            let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            Some(SocketAddr::new(IpAddr::V6(ip), u16::from_be(sin6.sin6_port)))
        }
        _ => None,
    }
}

/// Render a peer address the way handlers see it: IPv4-mapped IPv6
/// addresses as plain IPv4, Unix peers as `unix`.
pub fn peer_string(addr: Option<SocketAddr>) -> String {
    match addr {
        None => "unix".to_string(),
        Some(SocketAddr::V4(a)) => a.ip().to_string(),
        Some(SocketAddr::V6(a)) => match a.ip().to_ipv4_mapped() {
            Some(v4) => v4.to_string(),
            None => a.ip().to_string(),
        },
    }
}

/// Accept one pending connection. The returned socket is blocking and
/// close-on-exec; the reactor reads it with `MSG_DONTWAIT`.
pub fn accept(listener: RawFd) -> io::Result<(OwnedFd, String)> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;
    let addr_ptr = &mut storage as *mut _ as *mut libc::sockaddr;

    #[cfg(any(target_os = "linux", target_os = "android"))]
    let fd = cvt(unsafe { libc::accept4(listener, addr_ptr, &mut len, libc::SOCK_CLOEXEC) })?;
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    let fd = cvt(unsafe { libc::accept(listener, addr_ptr, &mut len) })?;

    let sock = unsafe { OwnedFd::from_raw_fd(fd) };

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    {
        set_cloexec(fd)?;
        // BSD sockets inherit O_NONBLOCK from the listener
        set_nonblocking(fd, false)?;
    }
    #[cfg(any(target_os = "macos", target_os = "ios"))]
    setsockopt_int(fd, libc::SOL_SOCKET, libc::SO_NOSIGPIPE, 1)?;

    let peer = sockaddr_to_std(&storage);
    if peer.is_some() {
        setsockopt_int(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY, 1)?;
    }

    Ok((sock, peer_string(peer)))
}

/// Receive into `buf`. With `nonblocking`, `WouldBlock` is returned
/// instead of waiting for data.
pub fn recv(fd: RawFd, buf: &mut [u8], nonblocking: bool) -> io::Result<usize> {
    let flags = if nonblocking { libc::MSG_DONTWAIT } else { 0 };
    cvt_size(unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut c_void, buf.len(), flags) })
}

/// Send part of `buf`. `more` hints that further data follows immediately.
pub fn send(fd: RawFd, buf: &[u8], more: bool) -> io::Result<usize> {
    let flags = SEND_FLAGS | if more { MORE_FLAG } else { 0 };
    cvt_size(unsafe { libc::send(fd, buf.as_ptr() as *const c_void, buf.len(), flags) })
}

/// Gathered send of `parts`, returning how many bytes went out.
pub fn sendmsg(fd: RawFd, parts: &[IoSlice<'_>], more: bool) -> io::Result<usize> {
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    // IoSlice is ABI-compatible with iovec
    msg.msg_iov = parts.as_ptr() as *mut libc::iovec;
    msg.msg_iovlen = parts.len() as _;

    let flags = SEND_FLAGS | if more { MORE_FLAG } else { 0 };
    cvt_size(unsafe { libc::sendmsg(fd, &msg, flags) })
}

/// Kernel file-to-socket transfer of up to `len` bytes starting at `offset`.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub fn sendfile(sock: RawFd, file: RawFd, offset: u64, len: usize) -> io::Result<usize> {
    let mut off = offset as libc::off_t;
    cvt_size(unsafe { libc::sendfile(sock, file, &mut off, len) })
}

#[cfg(any(target_os = "macos", target_os = "ios"))]
pub fn sendfile(sock: RawFd, file: RawFd, offset: u64, len: usize) -> io::Result<usize> {
    let mut sent = len as libc::off_t;
    let ret = unsafe {
        libc::sendfile(file, sock, offset as libc::off_t, &mut sent, std::ptr::null_mut(), 0)
    };
    if ret < 0 {
        let err = io::Error::last_os_error();
        // Partial transfers report progress alongside EAGAIN/EINTR
        if sent > 0 {
            return Ok(sent as usize);
        }
        return Err(err);
    }
    Ok(sent as usize)
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "ios"
)))]
pub fn sendfile(_sock: RawFd, _file: RawFd, _offset: u64, _len: usize) -> io::Result<usize> {
    Err(io::Error::from(io::ErrorKind::Unsupported))
}

/// Hold back partial segments until uncorked.
pub fn set_cork(fd: RawFd, enable: bool) -> io::Result<()> {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    return setsockopt_int(fd, libc::IPPROTO_TCP, libc::TCP_CORK, enable as c_int);

    #[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
    return setsockopt_int(fd, libc::IPPROTO_TCP, libc::TCP_NOPUSH, enable as c_int);

    #[cfg(not(any(
        target_os = "linux",
        target_os = "android",
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd"
    )))]
    {
        let _ = (fd, enable);
        Ok(())
    }
}

pub fn shutdown(fd: RawFd, how: Shutdown) -> io::Result<()> {
    let how = match how {
        Shutdown::Read => libc::SHUT_RD,
        Shutdown::Write => libc::SHUT_WR,
        Shutdown::Both => libc::SHUT_RDWR,
    };
    cvt(unsafe { libc::shutdown(fd, how) }).map(|_| ())
}

/// Errors a peer causes by going away; not worth more than a debug line.
pub fn is_benign(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EPIPE) | Some(libc::ECONNRESET) | Some(libc::EINVAL) | Some(libc::ENOTCONN)
    ) || matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset
    )
}

/// Accept failures caused by descriptor or memory exhaustion.
pub fn is_resource_exhaustion(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EMFILE) | Some(libc::ENFILE) | Some(libc::ENOBUFS) | Some(libc::ENOMEM)
    )
}
