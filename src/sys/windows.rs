//! Windows platform layer.
//!
//! Mirrors the Unix layer with identical function names. Sockets are
//! created with `WSA_FLAG_OVERLAPPED` so that the same handle can be
//! driven either by `WSAPoll` or by an I/O completion port.

use super::timeout_ms;

use std::io;
use std::mem;
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::os::windows::io::{AsRawSocket, FromRawSocket};
use std::sync::Once;
use std::time::Duration;

use windows_sys::Win32::Networking::WinSock::{
    AF_INET, AF_INET6, FIONBIO, INVALID_SOCKET, IPPROTO_IPV6, IPPROTO_TCP, IPPROTO_UDP,
    IPV6_V6ONLY, POLLERR, POLLHUP, POLLNVAL, POLLRDNORM, POLLWRNORM, SO_ERROR, SO_RCVBUF,
    SO_REUSEADDR, SO_SNDBUF, SOCK_DGRAM, SOCK_STREAM, SOCKADDR, SOCKADDR_IN, SOCKADDR_IN6,
    SOCKADDR_STORAGE, SOCKET, SOCKET_ERROR, SOL_SOCKET, WSA_FLAG_OVERLAPPED, WSADATA,
    WSAEWOULDBLOCK, WSAPOLLFD, WSAPoll, WSASocketW, WSAStartup, bind, closesocket, connect,
    getsockname, getsockopt, ioctlsocket, listen, recv, send, setsockopt,
};

/// Raw socket type on Windows.
pub(crate) type RawFd = std::os::windows::io::RawSocket;

/// Poll descriptor used by the portable backend.
pub(crate) type PollFd = WSAPOLLFD;

pub(crate) const POLL_READ: i16 = POLLRDNORM;
pub(crate) const POLL_WRITE: i16 = POLLWRNORM;
pub(crate) const POLL_ERROR: i16 = POLLERR | POLLHUP | POLLNVAL;

/// Listen backlog.
const BACKLOG: i32 = 1024;

/// Creates a MAKEWORD value for Winsock version.
#[inline]
const fn makeword(low: u8, high: u8) -> u16 {
    ((high as u16) << 8) | (low as u16)
}

/// Winsock initialization guard.
static WINSOCK_INIT: Once = Once::new();

/// Initialize Winsock if not already initialized.
pub(crate) fn ensure_winsock() {
    WINSOCK_INIT.call_once(|| unsafe {
        let mut data: WSADATA = mem::zeroed();
        let rc = WSAStartup(makeword(2, 2), &mut data as *mut _);
        assert_eq!(rc, 0, "WSAStartup failed: {}", rc);
    });
}

/// Returns the raw socket of a stream.
pub(crate) fn raw_stream(stream: &TcpStream) -> RawFd {
    stream.as_raw_socket()
}

/// Returns the raw socket of a listener.
pub(crate) fn raw_listener(listener: &TcpListener) -> RawFd {
    listener.as_raw_socket()
}

/// Builds a poll descriptor.
pub(crate) fn poll_fd(fd: RawFd, events: i16) -> PollFd {
    WSAPOLLFD {
        fd: fd as SOCKET,
        events,
        revents: 0,
    }
}

/// Waits on a set of poll descriptors.
pub(crate) fn sys_poll(fds: &mut [PollFd], timeout: Option<Duration>) -> io::Result<usize> {
    let rc = unsafe { WSAPoll(fds.as_mut_ptr(), fds.len() as u32, timeout_ms(timeout)) };

    if rc == SOCKET_ERROR {
        Err(io::Error::last_os_error())
    } else {
        Ok(rc as usize)
    }
}

/// Closes a socket.
pub(crate) fn sys_close(fd: RawFd) {
    unsafe {
        let _ = closesocket(fd as SOCKET);
    }
}

/// Sets a socket to non-blocking mode.
pub(crate) fn sys_set_nonblocking(fd: RawFd) -> io::Result<()> {
    unsafe {
        let mut nonblocking: u32 = 1;
        if ioctlsocket(fd as SOCKET, FIONBIO, &mut nonblocking) != 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }
}

/// Creates a non-blocking, overlapped-capable stream socket.
pub(crate) fn sys_socket(domain: i32) -> io::Result<RawFd> {
    ensure_winsock();
    unsafe {
        let fd = WSASocketW(
            domain,
            SOCK_STREAM,
            IPPROTO_TCP,
            std::ptr::null(),
            0,
            WSA_FLAG_OVERLAPPED,
        );
        if fd == INVALID_SOCKET {
            return Err(io::Error::last_os_error());
        }
        if let Err(e) = sys_set_nonblocking(fd as RawFd) {
            let _ = closesocket(fd);
            return Err(e);
        }
        Ok(fd as RawFd)
    }
}

/// Creates the wake channel of the portable poller: a connected pair of
/// non-blocking loopback UDP sockets, returned as `(read, write)`.
pub(crate) fn sys_wake_pair() -> io::Result<(RawFd, RawFd)> {
    ensure_winsock();

    let udp = || -> io::Result<SOCKET> {
        let fd = unsafe {
            WSASocketW(
                AF_INET as i32,
                SOCK_DGRAM,
                IPPROTO_UDP,
                std::ptr::null(),
                0,
                0,
            )
        };
        if fd == INVALID_SOCKET {
            return Err(io::Error::last_os_error());
        }
        if let Err(e) = sys_set_nonblocking(fd as RawFd) {
            unsafe { closesocket(fd) };
            return Err(e);
        }
        Ok(fd)
    };

    let recv_sock = udp()?;
    let send_sock = match udp() {
        Ok(fd) => fd,
        Err(e) => {
            sys_close(recv_sock as RawFd);
            return Err(e);
        }
    };

    let link = || -> io::Result<()> {
        unsafe {
            let mut addr: SOCKADDR_IN = mem::zeroed();
            addr.sin_family = AF_INET;
            addr.sin_port = 0;
            addr.sin_addr.S_un.S_addr = u32::from_ne_bytes(Ipv4Addr::LOCALHOST.octets());

            let len = mem::size_of::<SOCKADDR_IN>() as i32;
            if bind(recv_sock, &addr as *const _ as *const SOCKADDR, len) == SOCKET_ERROR {
                return Err(io::Error::last_os_error());
            }

            let mut bound: SOCKADDR_IN = mem::zeroed();
            let mut bound_len = len;
            if getsockname(recv_sock, &mut bound as *mut _ as *mut SOCKADDR, &mut bound_len)
                == SOCKET_ERROR
            {
                return Err(io::Error::last_os_error());
            }

            if connect(send_sock, &bound as *const _ as *const SOCKADDR, len) == SOCKET_ERROR {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    };

    if let Err(e) = link() {
        sys_close(recv_sock as RawFd);
        sys_close(send_sock as RawFd);
        return Err(e);
    }

    Ok((recv_sock as RawFd, send_sock as RawFd))
}

/// Signals the wake channel.
pub(crate) fn sys_wake(fd: RawFd) -> io::Result<()> {
    let buf = [1u8];
    if unsafe { send(fd as SOCKET, buf.as_ptr(), 1, 0) } == SOCKET_ERROR {
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::WouldBlock {
            return Err(err);
        }
    }
    Ok(())
}

/// Empties the read side of the wake channel.
pub(crate) fn sys_drain(fd: RawFd) {
    let mut buf = [0u8; 64];
    while unsafe { recv(fd as SOCKET, buf.as_mut_ptr(), buf.len() as i32, 0) } > 0 {}
}

fn set_int_option(fd: RawFd, level: i32, name: i32, value: i32) -> io::Result<()> {
    unsafe {
        if setsockopt(
            fd as SOCKET,
            level,
            name,
            &value as *const _ as *const u8,
            mem::size_of::<i32>() as i32,
        ) != 0
        {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }
}

/// Sets the SO_REUSEADDR option on a socket.
pub(crate) fn sys_set_reuseaddr(fd: RawFd) -> io::Result<()> {
    set_int_option(fd, SOL_SOCKET, SO_REUSEADDR, 1)
}

/// Sets `SO_SNDBUF` and `SO_RCVBUF` to `size`.
pub(crate) fn sys_set_buffer_sizes(fd: RawFd, size: usize) -> io::Result<()> {
    let size = size.min(i32::MAX as usize) as i32;

    set_int_option(fd, SOL_SOCKET, SO_SNDBUF, size)?;
    set_int_option(fd, SOL_SOCKET, SO_RCVBUF, size)
}

/// Sets the IPV6_V6ONLY option on a socket.
pub(crate) fn sys_set_v6only(fd: RawFd, v6only: bool) -> io::Result<()> {
    set_int_option(fd, IPPROTO_IPV6, IPV6_V6ONLY, i32::from(v6only))
}

/// Retrieves the pending socket error via `SO_ERROR`.
pub(crate) fn sys_get_socket_error(fd: RawFd) -> io::Result<()> {
    unsafe {
        let mut err: i32 = 0;
        let mut len: i32 = mem::size_of::<i32>() as i32;

        let rc = getsockopt(
            fd as SOCKET,
            SOL_SOCKET,
            SO_ERROR,
            &mut err as *mut _ as *mut u8,
            &mut len,
        );

        if rc != 0 {
            Err(io::Error::last_os_error())
        } else if err != 0 {
            Err(io::Error::from_raw_os_error(err))
        } else {
            Ok(())
        }
    }
}

/// Creates a bound, listening, non-blocking socket.
pub(crate) fn sys_listen(addr: &SocketAddr, buffer_size: usize) -> io::Result<TcpListener> {
    let (storage, len) = socketaddr_to_storage(addr);
    let domain = storage.ss_family as i32;
    let fd = sys_socket(domain)?;

    let setup = || -> io::Result<()> {
        sys_set_reuseaddr(fd)?;
        if domain == AF_INET6 as i32 {
            sys_set_v6only(fd, false)?;
        }
        sys_set_buffer_sizes(fd, buffer_size)?;

        unsafe {
            if bind(fd as SOCKET, &storage as *const _ as *const SOCKADDR, len) != 0 {
                return Err(io::Error::last_os_error());
            }
            if listen(fd as SOCKET, BACKLOG) != 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    };

    if let Err(e) = setup() {
        sys_close(fd);
        return Err(e);
    }

    // SAFETY: `fd` is a freshly created listening socket owned by nobody else.
    Ok(unsafe { TcpListener::from_raw_socket(fd) })
}

/// Connects a non-blocking socket, waiting at most `timeout`.
pub(crate) fn sys_connect(
    addr: &SocketAddr,
    buffer_size: usize,
    timeout: Option<Duration>,
) -> io::Result<TcpStream> {
    let (storage, len) = socketaddr_to_storage(addr);
    let fd = sys_socket(storage.ss_family as i32)?;

    let attempt = || -> io::Result<()> {
        sys_set_buffer_sizes(fd, buffer_size)?;

        let rc = unsafe { connect(fd as SOCKET, &storage as *const _ as *const SOCKADDR, len) };
        if rc == 0 {
            return Ok(());
        }

        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(WSAEWOULDBLOCK) {
            return Err(err);
        }

        let mut fds = [poll_fd(fd, POLL_WRITE)];
        match sys_poll(&mut fds, timeout)? {
            0 => Err(io::ErrorKind::TimedOut.into()),
            _ => sys_get_socket_error(fd),
        }
    };

    if let Err(e) = attempt() {
        sys_close(fd);
        return Err(e);
    }

    // SAFETY: `fd` is a freshly connected socket owned by nobody else.
    Ok(unsafe { TcpStream::from_raw_socket(fd) })
}

/// Converts a SocketAddr to a SOCKADDR_STORAGE.
pub(crate) fn socketaddr_to_storage(addr: &SocketAddr) -> (SOCKADDR_STORAGE, i32) {
    let mut storage: SOCKADDR_STORAGE = unsafe { mem::zeroed() };
    match addr {
        SocketAddr::V4(v4) => {
            let sa = unsafe { &mut *(&mut storage as *mut _ as *mut SOCKADDR_IN) };
            sa.sin_family = AF_INET;
            sa.sin_port = v4.port().to_be();
            sa.sin_addr.S_un.S_addr = u32::from(*v4.ip()).to_be();
            (storage, mem::size_of::<SOCKADDR_IN>() as i32)
        }
        SocketAddr::V6(v6) => {
            let sa = unsafe { &mut *(&mut storage as *mut _ as *mut SOCKADDR_IN6) };
            sa.sin6_family = AF_INET6;
            sa.sin6_port = v6.port().to_be();
            sa.sin6_addr.u.Byte = v6.ip().octets();
            sa.Anonymous.sin6_scope_id = v6.scope_id();
            (storage, mem::size_of::<SOCKADDR_IN6>() as i32)
        }
    }
}
