use super::timeout_ms;

use libc::{
    AF_INET, AF_INET6, F_GETFD, F_GETFL, F_SETFD, F_SETFL, FD_CLOEXEC, IPPROTO_IPV6, IPV6_V6ONLY,
    O_NONBLOCK, POLLOUT, SO_ERROR, SO_RCVBUF, SO_REUSEADDR, SO_SNDBUF,
    SOCK_STREAM, SOL_SOCKET, bind, c_int, close, connect, fcntl, getsockopt, listen, pollfd,
    setsockopt, sockaddr, sockaddr_in, sockaddr_in6, sockaddr_storage, socket, socklen_t,
};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::{AsRawFd, FromRawFd};
use std::time::Duration;
use std::{io, mem};

pub(crate) use std::os::fd::RawFd;

/// Poll descriptor used by the portable backend.
pub(crate) type PollFd = pollfd;

pub(crate) const POLL_READ: i16 = libc::POLLIN;
pub(crate) const POLL_WRITE: i16 = libc::POLLOUT;
pub(crate) const POLL_ERROR: i16 = libc::POLLERR | libc::POLLHUP | libc::POLLNVAL;

/// Listen backlog.
const BACKLOG: c_int = 1024;

/// Returns the raw descriptor of a stream.
pub(crate) fn raw_stream(stream: &TcpStream) -> RawFd {
    stream.as_raw_fd()
}

/// Returns the raw descriptor of a listener.
pub(crate) fn raw_listener(listener: &TcpListener) -> RawFd {
    listener.as_raw_fd()
}

/// Builds a poll descriptor.
pub(crate) fn poll_fd(fd: RawFd, events: i16) -> PollFd {
    pollfd {
        fd,
        events,
        revents: 0,
    }
}

/// Waits on a set of poll descriptors.
pub(crate) fn sys_poll(fds: &mut [PollFd], timeout: Option<Duration>) -> io::Result<usize> {
    let rc = unsafe {
        libc::poll(
            fds.as_mut_ptr(),
            fds.len() as libc::nfds_t,
            timeout_ms(timeout),
        )
    };

    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(rc as usize)
    }
}

/// Closes a file descriptor.
pub(crate) fn sys_close(fd: RawFd) {
    unsafe { close(fd) };
}

/// Sets a file descriptor to non-blocking, close-on-exec mode.
pub(crate) fn sys_set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { fcntl(fd, F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }

    let rc = unsafe { fcntl(fd, F_SETFL, flags | O_NONBLOCK) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }

    let flags = unsafe { fcntl(fd, F_GETFD) };
    if flags >= 0 {
        unsafe { fcntl(fd, F_SETFD, flags | FD_CLOEXEC) };
    }

    Ok(())
}

/// Creates a non-blocking stream socket.
pub(crate) fn sys_socket(domain: c_int) -> io::Result<RawFd> {
    let fd = unsafe { socket(domain, SOCK_STREAM, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }

    if let Err(e) = sys_set_nonblocking(fd) {
        unsafe { close(fd) };
        return Err(e);
    }

    Ok(fd)
}

/// Creates the wake channel of the portable poller: a non-blocking
/// pipe, returned as `(read, write)`.
pub(crate) fn sys_wake_pair() -> io::Result<(RawFd, RawFd)> {
    let mut fds = [0 as c_int; 2];

    let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }

    for fd in fds {
        if let Err(e) = sys_set_nonblocking(fd) {
            sys_close(fds[0]);
            sys_close(fds[1]);
            return Err(e);
        }
    }

    Ok((fds[0], fds[1]))
}

/// Signals the wake channel.
pub(crate) fn sys_wake(fd: RawFd) -> io::Result<()> {
    let buf = [1u8];
    let rc = unsafe { libc::write(fd, buf.as_ptr() as *const _, 1) };

    if rc < 0 {
        let err = io::Error::last_os_error();
        // A full pipe already guarantees a wake-up.
        if err.kind() != io::ErrorKind::WouldBlock {
            return Err(err);
        }
    }
    Ok(())
}

/// Empties the read side of the wake channel.
pub(crate) fn sys_drain(fd: RawFd) {
    let mut buf = [0u8; 64];
    while unsafe { libc::read(fd, buf.as_mut_ptr() as *mut _, buf.len()) } > 0 {}
}

fn set_int_option(fd: RawFd, level: c_int, name: c_int, value: c_int) -> io::Result<()> {
    let rc = unsafe {
        setsockopt(
            fd,
            level,
            name,
            &value as *const _ as *const _,
            mem::size_of::<c_int>() as socklen_t,
        )
    };

    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Enables `SO_REUSEADDR` on a socket.
pub(crate) fn sys_set_reuseaddr(fd: RawFd) -> io::Result<()> {
    set_int_option(fd, SOL_SOCKET, SO_REUSEADDR, 1)
}

/// Sets `SO_SNDBUF` and `SO_RCVBUF` to `size`.
pub(crate) fn sys_set_buffer_sizes(fd: RawFd, size: usize) -> io::Result<()> {
    let size = size.min(c_int::MAX as usize) as c_int;

    set_int_option(fd, SOL_SOCKET, SO_SNDBUF, size)?;
    set_int_option(fd, SOL_SOCKET, SO_RCVBUF, size)
}

/// Sets the `IPV6_V6ONLY` socket option.
pub(crate) fn sys_set_v6only(fd: RawFd, v6only: bool) -> io::Result<()> {
    set_int_option(fd, IPPROTO_IPV6, IPV6_V6ONLY, c_int::from(v6only))
}

/// Retrieves the pending socket error via `SO_ERROR`.
pub(crate) fn sys_get_socket_error(fd: RawFd) -> io::Result<()> {
    let mut err: c_int = 0;
    let mut len = mem::size_of::<c_int>() as socklen_t;

    let rc = unsafe {
        getsockopt(
            fd,
            SOL_SOCKET,
            SO_ERROR,
            &mut err as *mut _ as *mut _,
            &mut len,
        )
    };

    if rc < 0 {
        Err(io::Error::last_os_error())
    } else if err != 0 {
        Err(io::Error::from_raw_os_error(err))
    } else {
        Ok(())
    }
}

/// Creates a bound, listening, non-blocking socket.
pub(crate) fn sys_listen(addr: &SocketAddr, buffer_size: usize) -> io::Result<TcpListener> {
    let (storage, len) = socketaddr_to_storage(addr);
    let domain = storage.ss_family as c_int;
    let fd = sys_socket(domain)?;

    let setup = || -> io::Result<()> {
        sys_set_reuseaddr(fd)?;
        if domain == AF_INET6 {
            sys_set_v6only(fd, false)?;
        }
        sys_set_buffer_sizes(fd, buffer_size)?;

        if unsafe { bind(fd, &storage as *const _ as *const sockaddr, len) } < 0 {
            return Err(io::Error::last_os_error());
        }
        if unsafe { listen(fd, BACKLOG) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    };

    if let Err(e) = setup() {
        sys_close(fd);
        return Err(e);
    }

    // SAFETY: `fd` is a freshly created listening socket owned by nobody else.
    Ok(unsafe { TcpListener::from_raw_fd(fd) })
}

/// Connects a non-blocking socket, waiting at most `timeout`.
pub(crate) fn sys_connect(
    addr: &SocketAddr,
    buffer_size: usize,
    timeout: Option<Duration>,
) -> io::Result<TcpStream> {
    let (storage, len) = socketaddr_to_storage(addr);
    let fd = sys_socket(storage.ss_family as c_int)?;

    let attempt = || -> io::Result<()> {
        sys_set_buffer_sizes(fd, buffer_size)?;

        let rc = unsafe { connect(fd, &storage as *const _ as *const sockaddr, len) };
        if rc == 0 {
            return Ok(());
        }

        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINPROGRESS) {
            return Err(err);
        }

        let mut fds = [poll_fd(fd, POLLOUT)];
        loop {
            match sys_poll(&mut fds, timeout) {
                Ok(0) => return Err(io::ErrorKind::TimedOut.into()),
                Ok(_) => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        sys_get_socket_error(fd)
    };

    if let Err(e) = attempt() {
        sys_close(fd);
        return Err(e);
    }

    // SAFETY: `fd` is a freshly connected socket owned by nobody else.
    Ok(unsafe { TcpStream::from_raw_fd(fd) })
}

/// Converts a `SocketAddr` to a `sockaddr_storage`.
pub(crate) fn socketaddr_to_storage(addr: &SocketAddr) -> (sockaddr_storage, socklen_t) {
    let mut storage: sockaddr_storage = unsafe { mem::zeroed() };

    match addr {
        SocketAddr::V4(v4) => {
            let sa = unsafe { &mut *(&mut storage as *mut _ as *mut sockaddr_in) };
            sa.sin_family = AF_INET as _;
            sa.sin_port = v4.port().to_be();
            sa.sin_addr.s_addr = u32::from(*v4.ip()).to_be();

            (storage, mem::size_of::<sockaddr_in>() as socklen_t)
        }

        SocketAddr::V6(v6) => {
            let sa = unsafe { &mut *(&mut storage as *mut _ as *mut sockaddr_in6) };
            sa.sin6_family = AF_INET6 as _;
            sa.sin6_port = v6.port().to_be();
            sa.sin6_addr.s6_addr = v6.ip().octets();
            sa.sin6_flowinfo = v6.flowinfo();
            sa.sin6_scope_id = v6.scope_id();

            (storage, mem::size_of::<sockaddr_in6>() as socklen_t)
        }
    }
}
