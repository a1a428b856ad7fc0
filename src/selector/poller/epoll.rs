//! Linux `epoll`-based poller.
//!
//! Level-triggered: a descriptor keeps being reported while it stays
//! ready, so a dispatch that stops early (buffer full, socket blocked)
//! is picked up again on the next wait.

use super::{Event, Interest, Poller, push_event};
use crate::config::Backend;
use crate::sys::{RawFd, sys_close, timeout_ms};

use libc::{
    EFD_CLOEXEC, EFD_NONBLOCK, EPOLL_CLOEXEC, EPOLL_CTL_ADD, EPOLL_CTL_DEL, EPOLL_CTL_MOD,
    EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLOUT, EPOLLRDHUP, epoll_create1, epoll_ctl, epoll_event,
    epoll_wait,
};
use parking_lot::Mutex;
use tracing::trace;

use std::io;
use std::time::Duration;

/// Reserved token for the wake-up eventfd.
///
/// Never produced by a slot table.
const WAKE_TOKEN: u64 = u64::MAX;

/// `epoll` instance plus an `eventfd` used to interrupt waits.
pub(crate) struct EpollPoller {
    epoll: RawFd,
    eventfd: RawFd,
    /// Reusable buffer for `epoll_wait`.
    events: Mutex<Vec<epoll_event>>,
}

impl EpollPoller {
    fn ctl(&self, op: i32, fd: RawFd, token: usize, interest: Interest) -> io::Result<()> {
        let mut flags = EPOLLRDHUP;
        if interest.read {
            flags |= EPOLLIN;
        }
        if interest.write {
            flags |= EPOLLOUT;
        }

        let mut event = epoll_event {
            events: flags as u32,
            u64: token as u64,
        };

        let rc = unsafe { epoll_ctl(self.epoll, op, fd, &mut event) };
        if rc < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }
}

impl Poller for EpollPoller {
    const KIND: Backend = Backend::Native;

    fn new(capacity: usize) -> io::Result<Self> {
        let epoll = unsafe { epoll_create1(EPOLL_CLOEXEC) };
        if epoll < 0 {
            return Err(io::Error::last_os_error());
        }

        let eventfd = unsafe { libc::eventfd(0, EFD_NONBLOCK | EFD_CLOEXEC) };
        if eventfd < 0 {
            let err = io::Error::last_os_error();
            sys_close(epoll);
            return Err(err);
        }

        let mut event = epoll_event {
            events: EPOLLIN as u32,
            u64: WAKE_TOKEN,
        };

        if unsafe { epoll_ctl(epoll, EPOLL_CTL_ADD, eventfd, &mut event) } < 0 {
            let err = io::Error::last_os_error();
            sys_close(eventfd);
            sys_close(epoll);
            return Err(err);
        }

        Ok(Self {
            epoll,
            eventfd,
            events: Mutex::new(Vec::with_capacity(capacity.max(1))),
        })
    }

    fn register(&self, fd: RawFd, token: usize, interest: Interest) -> io::Result<()> {
        self.ctl(EPOLL_CTL_ADD, fd, token, interest)
    }

    fn reregister(&self, fd: RawFd, token: usize, interest: Interest) -> io::Result<()> {
        self.ctl(EPOLL_CTL_MOD, fd, token, interest)
    }

    fn deregister(&self, fd: RawFd) -> io::Result<()> {
        let rc = unsafe { epoll_ctl(self.epoll, EPOLL_CTL_DEL, fd, std::ptr::null_mut()) };
        if rc < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    fn poll(&self, events: &mut Vec<Event>, timeout: Option<Duration>) -> io::Result<()> {
        events.clear();

        let mut buffer = self.events.lock();
        let n = unsafe {
            epoll_wait(
                self.epoll,
                buffer.as_mut_ptr(),
                buffer.capacity() as i32,
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

        // SAFETY: the kernel initialized the first `n` entries.
        unsafe { buffer.set_len(n as usize) };

        for ev in buffer.iter() {
            let (token, flags) = (ev.u64, ev.events);

            if token == WAKE_TOKEN {
                let mut value = 0u64;
                unsafe {
                    libc::read(self.eventfd, &mut value as *mut _ as *mut _, 8);
                }
                continue;
            }

            push_event(
                events,
                Event {
                    token: token as usize,
                    readable: flags & (EPOLLIN | EPOLLERR | EPOLLHUP | EPOLLRDHUP) as u32 != 0,
                    writable: flags & (EPOLLOUT | EPOLLERR | EPOLLHUP) as u32 != 0,
                },
            );
        }

        trace!(ready = events.len(), "epoll wait returned");
        Ok(())
    }

    fn wake(&self) -> io::Result<()> {
        let value: u64 = 1;
        let rc = unsafe { libc::write(self.eventfd, &value as *const _ as *const _, 8) };

        if rc < 0 {
            let err = io::Error::last_os_error();
            // Counter saturated: a wake-up is already pending.
            if err.kind() != io::ErrorKind::WouldBlock {
                return Err(err);
            }
        }
        Ok(())
    }
}

impl Drop for EpollPoller {
    fn drop(&mut self) {
        sys_close(self.eventfd);
        sys_close(self.epoll);
    }
}
