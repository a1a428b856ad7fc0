//! Write engine.
//!
//! A write first goes straight to the socket. Whatever the socket does
//! not take is queued together with its completion callback, and write
//! interest is raised with the selector. Every later write is appended
//! behind it so bytes reach the wire in call order.

use super::{CLOSING, Connection, OPEN};
use crate::error::{Error, Result};

use bytes::{Buf, Bytes};
use tracing::trace;

use std::collections::VecDeque;
use std::io::{self, Write};
use std::mem;
use std::sync::atomic::Ordering;

type Finished = Box<dyn FnOnce(&Connection) + Send>;

pub(crate) struct PendingWrite {
    data: Bytes,
    on_finished: Option<Finished>,
}

#[derive(Default)]
pub(crate) struct WriteState {
    queue: VecDeque<PendingWrite>,
}

impl WriteState {
    pub(crate) fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Empties the queue without running any callback.
    pub(crate) fn take(&mut self) -> VecDeque<PendingWrite> {
        mem::take(&mut self.queue)
    }
}

/// Result of a [`Connection::continue_writing`] pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WriteProgress {
    /// The socket blocked again; keep write interest.
    More,
    /// The queue is empty.
    Done,
}

impl Connection {
    /// Writes `data`, queueing whatever the socket does not accept now.
    ///
    /// # Errors
    ///
    /// [`Error::Closed`] if the connection is closing or closed, or if
    /// this write hit a fatal socket error (which also closes it).
    pub fn write(&self, data: impl Into<Bytes>) -> Result<()> {
        self.enqueue(data.into(), None)
    }

    /// Like [`write`](Self::write), running `on_finished` once every
    /// byte of `data` has been handed to the socket.
    ///
    /// When the write completes synchronously the callback runs before
    /// this returns.
    pub fn write_then(
        &self,
        data: impl Into<Bytes>,
        on_finished: impl FnOnce(&Connection) + Send + 'static,
    ) -> Result<()> {
        self.enqueue(data.into(), Some(Box::new(on_finished)))
    }

    fn enqueue(&self, mut data: Bytes, on_finished: Option<Finished>) -> Result<()> {
        if self.state.load(Ordering::Acquire) != OPEN {
            return Err(Error::Closed);
        }

        let mut writer = self.writer.lock();

        if !writer.queue.is_empty() {
            writer.queue.push_back(PendingWrite { data, on_finished });
            return Ok(());
        }

        match self.write_some(&mut data) {
            Ok(()) if data.is_empty() => {
                drop(writer);
                self.finished(on_finished);
                Ok(())
            }
            Ok(()) => {
                trace!(token = self.token, remaining = data.len(), "write queued");
                writer.queue.push_back(PendingWrite { data, on_finished });
                self.set_writable(writer.queue.front().map(|w| &w.data));
                Ok(())
            }
            Err(err) => {
                drop(writer);
                self.fail(err);
                Err(Error::Closed)
            }
        }
    }

    /// Drains queued writes after the socket reported writable.
    pub(crate) fn continue_writing(&self) -> WriteProgress {
        let mut finished = Vec::new();

        let outcome = {
            let mut writer = self.writer.lock();

            loop {
                let Some(front) = writer.queue.front_mut() else {
                    self.set_writable(None);
                    let closing = self.state.load(Ordering::Acquire) == CLOSING;
                    break Ok(closing);
                };

                match self.write_some(&mut front.data) {
                    Ok(()) if front.data.is_empty() => {
                        if let Some(done) = writer.queue.pop_front() {
                            finished.extend(done.on_finished);
                        }
                    }
                    Ok(()) => break Err(None),
                    Err(err) => break Err(Some(err)),
                }
            }
        };

        for cb in finished {
            self.finished(Some(cb));
        }

        match outcome {
            Ok(closing) => {
                if closing {
                    self.finish_close();
                }
                WriteProgress::Done
            }
            Err(None) => WriteProgress::More,
            Err(Some(err)) => {
                self.fail(err);
                WriteProgress::Done
            }
        }
    }

    /// Accounts `n` bytes sent by an overlapped send of the head write.
    #[cfg_attr(not(windows), allow(dead_code))]
    pub(crate) fn complete_write(&self, n: usize) {
        let mut finished = None;

        let closing = {
            let mut writer = self.writer.lock();

            if let Some(front) = writer.queue.front_mut() {
                front.data.advance(n.min(front.data.len()));
                if front.data.is_empty() {
                    finished = writer.queue.pop_front().and_then(|w| w.on_finished);
                }
            }

            let next = writer.queue.front().map(|w| &w.data);
            self.set_writable(next);
            next.is_none() && self.state.load(Ordering::Acquire) == CLOSING
        };

        self.finished(finished);
        if closing {
            self.finish_close();
        }
    }

    /// Writes as much of `data` as the socket accepts, advancing it.
    fn write_some(&self, data: &mut Bytes) -> io::Result<()> {
        let guard = self.socket.read();
        let Some(mut socket) = guard.as_ref() else {
            return Err(io::ErrorKind::NotConnected.into());
        };

        while !data.is_empty() {
            match socket.write(data.chunk()) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => data.advance(n),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }

    fn finished(&self, on_finished: Option<Finished>) {
        if let Some(cb) = on_finished {
            self.guarded("on_finished", || cb(self));
        }
    }
}
