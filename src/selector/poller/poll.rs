//! Portable poller over `poll(2)` (Unix) or `WSAPoll` (Windows).
//!
//! The registry of watched descriptors lives in a map and the descriptor
//! array is rebuilt before every wait. Interest changes made while a
//! wait is in progress wake it so they take effect immediately.

use super::{Event, Interest, Poller, push_event};
use crate::config::Backend;
use crate::sys::{self, POLL_ERROR, POLL_READ, POLL_WRITE, PollFd, RawFd};

use parking_lot::Mutex;
use tracing::trace;

use std::collections::HashMap;
use std::io;
use std::time::Duration;

pub(crate) struct PollPoller {
    /// Registered descriptors: `fd → (token, interest)`.
    registry: Mutex<HashMap<RawFd, (usize, Interest)>>,

    /// Reusable descriptor array; slot 0 is the wake channel.
    fds: Mutex<Vec<PollFd>>,

    wake_read: RawFd,
    wake_write: RawFd,
}

// `WSAPOLLFD` and `pollfd` are plain data.
unsafe impl Send for PollPoller {}
unsafe impl Sync for PollPoller {}

impl Poller for PollPoller {
    const KIND: Backend = Backend::Portable;

    fn new(capacity: usize) -> io::Result<Self> {
        let (wake_read, wake_write) = sys::sys_wake_pair()?;

        Ok(Self {
            registry: Mutex::new(HashMap::with_capacity(capacity)),
            fds: Mutex::new(Vec::with_capacity(capacity + 1)),
            wake_read,
            wake_write,
        })
    }

    fn register(&self, fd: RawFd, token: usize, interest: Interest) -> io::Result<()> {
        self.registry.lock().insert(fd, (token, interest));
        self.wake()
    }

    fn reregister(&self, fd: RawFd, token: usize, interest: Interest) -> io::Result<()> {
        let previous = self.registry.lock().insert(fd, (token, interest));
        match previous {
            Some((_, old)) if old == interest => Ok(()),
            _ => self.wake(),
        }
    }

    fn deregister(&self, fd: RawFd) -> io::Result<()> {
        match self.registry.lock().remove(&fd) {
            Some(_) => Ok(()),
            None => Err(io::ErrorKind::NotFound.into()),
        }
    }

    fn poll(&self, events: &mut Vec<Event>, timeout: Option<Duration>) -> io::Result<()> {
        events.clear();

        let mut fds = self.fds.lock();
        let mut tokens = Vec::new();
        fds.clear();
        fds.push(sys::poll_fd(self.wake_read, POLL_READ));

        {
            let registry = self.registry.lock();
            tokens.reserve(registry.len());

            for (&fd, &(token, interest)) in registry.iter() {
                let mut flags = 0;
                if interest.read {
                    flags |= POLL_READ;
                }
                if interest.write {
                    flags |= POLL_WRITE;
                }

                fds.push(sys::poll_fd(fd, flags));
                tokens.push(token);
            }
        }

        match sys::sys_poll(&mut fds, timeout) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e),
        }

        if fds[0].revents != 0 {
            sys::sys_drain(self.wake_read);
        }

        for (pfd, &token) in fds.iter().skip(1).zip(tokens.iter()) {
            let re = pfd.revents;
            if re == 0 {
                continue;
            }

            push_event(
                events,
                Event {
                    token,
                    readable: re & (POLL_READ | POLL_ERROR) != 0,
                    writable: re & (POLL_WRITE | POLL_ERROR) != 0,
                },
            );
        }

        trace!(ready = events.len(), watched = tokens.len(), "poll returned");
        Ok(())
    }

    fn wake(&self) -> io::Result<()> {
        sys::sys_wake(self.wake_write)
    }
}

impl Drop for PollPoller {
    fn drop(&mut self) {
        sys::sys_close(self.wake_read);
        sys::sys_close(self.wake_write);
    }
}
