//! BSD `kqueue`-based poller.
//!
//! Read and write interest map to separate `EVFILT_READ` /
//! `EVFILT_WRITE` filters; their events are merged per token. Waits are
//! interrupted through an `EVFILT_USER` event.

use super::{Event, Interest, Poller, push_event};
use crate::config::Backend;
use crate::sys::{RawFd, sys_close};

use libc::{
    EV_ADD, EV_CLEAR, EV_DELETE, EV_ENABLE, EV_EOF, EV_ERROR, EV_RECEIPT, EVFILT_READ,
    EVFILT_USER, EVFILT_WRITE, NOTE_TRIGGER, kevent, kqueue, timespec,
};
use parking_lot::Mutex;
use tracing::trace;

use std::io;
use std::mem;
use std::ptr;
use std::time::Duration;

/// Identifier of the wake-up user event.
const WAKE_IDENT: usize = usize::MAX;

pub(crate) struct KqueuePoller {
    kq: RawFd,
    events: Mutex<Vec<kevent>>,
}

// `kevent::udata` is a raw pointer, but only ever carries a token.
unsafe impl Send for KqueuePoller {}
unsafe impl Sync for KqueuePoller {}

fn change(ident: usize, filter: i16, flags: u16, fflags: u32, token: usize) -> kevent {
    // SAFETY: `kevent` is plain data; zero is valid for every field.
    let mut ev: kevent = unsafe { mem::zeroed() };
    ev.ident = ident as _;
    ev.filter = filter as _;
    ev.flags = flags as _;
    ev.fflags = fflags as _;
    ev.udata = token as _;
    ev
}

impl KqueuePoller {
    /// Applies `changes`, tolerating `ENOENT` for deletions of filters
    /// that were never added.
    fn apply(&self, changes: &mut [kevent]) -> io::Result<()> {
        for ev in changes.iter_mut() {
            ev.flags |= EV_RECEIPT;
        }

        let rc = unsafe {
            kevent(
                self.kq,
                changes.as_ptr(),
                changes.len() as _,
                changes.as_mut_ptr(),
                changes.len() as _,
                ptr::null(),
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }

        for ev in changes.iter().take(rc as usize) {
            let code = ev.data as i32;
            if ev.flags & EV_ERROR != 0 && code != 0 && code != libc::ENOENT {
                return Err(io::Error::from_raw_os_error(code));
            }
        }
        Ok(())
    }

    fn changes(fd: RawFd, token: usize, interest: Interest) -> [kevent; 2] {
        let read = if interest.read { EV_ADD | EV_ENABLE } else { EV_DELETE };
        let write = if interest.write { EV_ADD | EV_ENABLE } else { EV_DELETE };

        [
            change(fd as usize, EVFILT_READ, read, 0, token),
            change(fd as usize, EVFILT_WRITE, write, 0, token),
        ]
    }
}

impl Poller for KqueuePoller {
    const KIND: Backend = Backend::Native;

    fn new(capacity: usize) -> io::Result<Self> {
        let kq = unsafe { kqueue() };
        if kq < 0 {
            return Err(io::Error::last_os_error());
        }

        unsafe {
            let flags = libc::fcntl(kq, libc::F_GETFD);
            if flags >= 0 {
                libc::fcntl(kq, libc::F_SETFD, flags | libc::FD_CLOEXEC);
            }
        }

        let poller = Self {
            kq,
            events: Mutex::new(Vec::with_capacity(capacity.max(1))),
        };

        let mut wake = [change(WAKE_IDENT, EVFILT_USER, EV_ADD | EV_CLEAR, 0, 0)];
        poller.apply(&mut wake)?;

        Ok(poller)
    }

    fn register(&self, fd: RawFd, token: usize, interest: Interest) -> io::Result<()> {
        self.apply(&mut Self::changes(fd, token, interest))
    }

    fn reregister(&self, fd: RawFd, token: usize, interest: Interest) -> io::Result<()> {
        self.apply(&mut Self::changes(fd, token, interest))
    }

    fn deregister(&self, fd: RawFd) -> io::Result<()> {
        let mut changes = [
            change(fd as usize, EVFILT_READ, EV_DELETE, 0, 0),
            change(fd as usize, EVFILT_WRITE, EV_DELETE, 0, 0),
        ];
        self.apply(&mut changes)
    }

    fn poll(&self, events: &mut Vec<Event>, timeout: Option<Duration>) -> io::Result<()> {
        events.clear();

        let ts = timeout.map(|t| timespec {
            tv_sec: t.as_secs().min(i64::MAX as u64) as _,
            tv_nsec: t.subsec_nanos() as _,
        });
        let ts_ptr = ts
            .as_ref()
            .map_or(ptr::null(), |t| t as *const timespec);

        let mut buffer = self.events.lock();
        let n = unsafe {
            kevent(
                self.kq,
                ptr::null(),
                0,
                buffer.as_mut_ptr(),
                buffer.capacity() as _,
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

        // SAFETY: the kernel initialized the first `n` entries.
        unsafe { buffer.set_len(n as usize) };

        for ev in buffer.iter() {
            if ev.filter == EVFILT_USER && ev.ident as usize == WAKE_IDENT {
                continue;
            }

            let token = ev.udata as usize;
            let failed = ev.flags & (EV_EOF | EV_ERROR) != 0;

            push_event(
                events,
                Event {
                    token,
                    readable: ev.filter == EVFILT_READ || failed,
                    writable: ev.filter == EVFILT_WRITE,
                },
            );
        }

        trace!(ready = events.len(), "kevent returned");
        Ok(())
    }

    fn wake(&self) -> io::Result<()> {
        let trigger = [change(WAKE_IDENT, EVFILT_USER, 0, NOTE_TRIGGER, 0)];

        let rc = unsafe {
            kevent(
                self.kq,
                trigger.as_ptr(),
                1,
                ptr::null_mut(),
                0,
                ptr::null(),
            )
        };
        if rc < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }
}

impl Drop for KqueuePoller {
    fn drop(&mut self) {
        sys_close(self.kq);
    }
}
