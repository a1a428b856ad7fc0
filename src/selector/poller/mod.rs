//! Readiness pollers.
//!
//! A poller multiplexes OS readiness for registered descriptors and
//! reports it as [`Event`]s keyed by the token given at registration.
//! The concrete implementation is selected at compile time:
//!
//! - `EpollPoller` on Linux and Android,
//! - `KqueuePoller` on macOS, iOS and FreeBSD,
//! - [`PollPoller`] everywhere (`poll(2)` / `WSAPoll`).
//!
//! Every method takes `&self` so a poller can be shared between the loop
//! thread, which waits, and any thread that changes interest or wakes it.

#[cfg(any(target_os = "linux", target_os = "android"))]
mod epoll;

#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
mod kqueue;

mod poll;

#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) use epoll::EpollPoller;

#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
pub(crate) use kqueue::KqueuePoller;

pub(crate) use poll::PollPoller;

use crate::config::Backend;
use crate::sys::RawFd;

use std::io;
use std::time::Duration;

/// Readiness a descriptor is registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Interest {
    pub(crate) read: bool,
    pub(crate) write: bool,
}

impl Interest {
    pub(crate) const READ: Interest = Interest {
        read: true,
        write: false,
    };

    pub(crate) const READ_WRITE: Interest = Interest {
        read: true,
        write: true,
    };
}

/// Readiness reported for one token.
///
/// Errors and hang-ups are folded into `readable` so the read path
/// observes them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Event {
    pub(crate) token: usize,
    pub(crate) readable: bool,
    pub(crate) writable: bool,
}

/// Merges an event into `events`, one entry per token.
pub(crate) fn push_event(events: &mut Vec<Event>, event: Event) {
    if let Some(e) = events.iter_mut().find(|e| e.token == event.token) {
        e.readable |= event.readable;
        e.writable |= event.writable;
    } else {
        events.push(event);
    }
}

pub(crate) trait Poller: Send + Sync + Sized + 'static {
    /// Backend reported for selectors driven by this poller.
    const KIND: Backend;

    /// Creates a poller returning at most `capacity` events per wait.
    fn new(capacity: usize) -> io::Result<Self>;

    fn register(&self, fd: RawFd, token: usize, interest: Interest) -> io::Result<()>;

    fn reregister(&self, fd: RawFd, token: usize, interest: Interest) -> io::Result<()>;

    fn deregister(&self, fd: RawFd) -> io::Result<()>;

    /// Waits for readiness, replacing the contents of `events`.
    ///
    /// Returns with an empty list on timeout, wake-up or interruption.
    fn poll(&self, events: &mut Vec<Event>, timeout: Option<Duration>) -> io::Result<()>;

    /// Interrupts a concurrent [`poll`](Self::poll).
    fn wake(&self) -> io::Result<()>;
}
