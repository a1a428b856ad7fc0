//! Readiness-driven event loop.
//!
//! One loop thread waits on a [`Poller`] and dispatches each batch of
//! events. A batch of more than one event is spread over a worker pool
//! and the loop blocks on a [`Countdown`] until every job finished: only
//! then is the event buffer reused and are slots of closed connections
//! released, so a slot index is never reused while a dispatch may still
//! resolve it.

use super::poller::{Event, Interest, Poller};
use super::{Hooks, Phase, Registry, Selector, enter_selector_thread};
use crate::config::{Backend, Config};
use crate::connection::{Connection, panic_message};
use crate::error::{DisconnectReason, Error};
use crate::sys;
use crate::utils::{Countdown, SlotTable, WorkerPool};

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};

use std::io;
use std::net::{TcpListener, TcpStream};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Consecutive failed waits after which the loop gives up.
const MAX_POLL_FAILURES: usize = 8;

/// Pause after a failed wait, so a persistent error does not spin.
const POLL_FAILURE_BACKOFF: Duration = Duration::from_millis(10);

#[derive(Clone)]
enum Entry {
    Listener(Arc<TcpListener>),
    Connection(Arc<Connection>),
}

pub(crate) struct ReadinessLoop<P: Poller> {
    poller: P,
    config: Config,
    hooks: Arc<Hooks>,
    entries: SlotTable<Entry>,
    /// Slots waiting for the end of the current batch.
    retired: Mutex<Vec<usize>>,
    latch: Arc<Countdown>,
    phase: Phase,
    this: Weak<Self>,
}

impl<P: Poller> ReadinessLoop<P> {
    pub(crate) fn new(config: &Config, hooks: Arc<Hooks>) -> io::Result<Arc<Self>> {
        let poller = P::new(config.events_per_poll)?;

        Ok(Arc::new_cyclic(|this| Self {
            poller,
            config: config.clone(),
            hooks,
            entries: SlotTable::new(64),
            retired: Mutex::new(Vec::new()),
            latch: Arc::new(Countdown::new()),
            phase: Phase::new(),
            this: this.clone(),
        }))
    }

    fn live_connections(&self) -> usize {
        self.entries
            .snapshot()
            .iter()
            .filter(|(_, e)| matches!(e, Entry::Connection(c) if !c.is_closed()))
            .count()
    }

    fn wake(&self) {
        if let Err(err) = self.poller.wake() {
            warn!(?err, "failed to wake selector");
        }
    }

    fn dispatch(&self, events: &[Event], workers: Option<&WorkerPool>) {
        let pool = match workers {
            Some(pool) if events.len() > 1 && pool.size() > 0 => pool,
            _ => {
                for &event in events {
                    self.dispatch_one(event);
                }
                return;
            }
        };

        let Some(this) = self.this.upgrade() else {
            return;
        };

        self.latch.reset(events.len());
        for &event in events {
            let arrival = self.latch.arrival();
            let this = this.clone();

            pool.execute(move || {
                let _arrival = arrival;
                enter_selector_thread();
                this.dispatch_one(event);
            });
        }
        self.latch.wait();
    }

    fn dispatch_one(&self, event: Event) {
        let Some(entry) = self.entries.get(event.token) else {
            trace!(token = event.token, "event for released slot");
            return;
        };

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| match &entry {
            Entry::Listener(listener) => {
                if event.readable {
                    self.accept(listener);
                }
            }
            Entry::Connection(conn) => {
                trace!(
                    token = event.token,
                    readable = event.readable,
                    writable = event.writable,
                    "dispatch"
                );
                if event.writable {
                    conn.continue_writing();
                }
                if event.readable {
                    conn.on_readable();
                }
            }
        }));

        if let Err(payload) = outcome {
            let message = panic_message(payload.as_ref());
            warn!(token = event.token, panic = %message, "dispatch panicked");

            if let Entry::Connection(conn) = entry {
                conn.notify_exception(&Error::CallbackPanicked(message));
                conn.shutdown(DisconnectReason::ExceptionClose);
            }
        }
    }

    fn accept(&self, listener: &TcpListener) {
        loop {
            if !self.phase.is_running() {
                return;
            }

            match listener.accept() {
                Ok((stream, peer)) => {
                    debug!(%peer, "accepted connection");
                    if let Err(err) = self.register(stream) {
                        warn!(?err, %peer, "failed to register accepted connection");
                        self.hooks.exception(&Error::Io(err));
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    warn!(?err, "accept failed");
                    self.hooks.exception(&Error::Io(err));
                    return;
                }
            }
        }
    }

    /// Releases slots retired during the last batch.
    fn reclaim(&self) {
        let retired = std::mem::take(&mut *self.retired.lock());
        for token in retired {
            self.entries.remove(token);
        }
    }

    fn teardown(&self, reason: DisconnectReason) {
        for conn in self.connections() {
            conn.close_urgent();
        }
        self.reclaim();

        for entry in self.entries.drain() {
            if let Entry::Listener(listener) = entry {
                let _ = self.poller.deregister(sys::raw_listener(&listener));
            }
        }

        debug!(%reason, "selector stopped");
        self.hooks.closed(reason);
    }
}

impl<P: Poller> Registry for ReadinessLoop<P> {
    fn set_writable(&self, conn: &Connection, pending: Option<&Bytes>) {
        let Some(fd) = conn.raw_fd() else {
            return;
        };

        let interest = if pending.is_some() {
            Interest::READ_WRITE
        } else {
            Interest::READ
        };

        if let Err(err) = self.poller.reregister(fd, conn.token(), interest) {
            trace!(token = conn.token(), ?err, "interest change failed");
        }
    }

    fn deregister(&self, conn: &Connection) {
        if let Some(fd) = conn.raw_fd()
            && let Err(err) = self.poller.deregister(fd)
        {
            trace!(token = conn.token(), ?err, "deregister failed");
        }

        self.retired.lock().push(conn.token());
        if !self.phase.is_running() || self.hooks.stop_when_idle {
            self.wake();
        }
    }
}

impl<P: Poller> Selector for ReadinessLoop<P> {
    fn kind(&self) -> Backend {
        P::KIND
    }

    fn listen(&self, listener: TcpListener) -> io::Result<()> {
        listener.set_nonblocking(true)?;
        let fd = sys::raw_listener(&listener);
        let listener = Arc::new(listener);

        self.entries.insert_with(|token| {
            self.poller.register(fd, token, Interest::READ)?;
            Ok::<_, io::Error>(Entry::Listener(listener))
        })?;

        debug!(backend = ?P::KIND, "listening");
        Ok(())
    }

    fn register(&self, stream: TcpStream) -> io::Result<Arc<Connection>> {
        sys::configure_stream(&stream, self.config.buffer_size, self.config.nodelay)?;

        let fd = sys::raw_stream(&stream);
        let registry: Weak<dyn Registry> = self.this.clone();

        let (_, entry) = self.entries.insert_with(|token| {
            let conn = Connection::new(token, stream, &self.config, registry);
            self.poller.register(fd, token, Interest::READ)?;
            Ok::<_, io::Error>(Entry::Connection(conn))
        })?;

        let Entry::Connection(conn) = entry else {
            unreachable!("connection slot holds a listener");
        };

        debug!(token = conn.token(), peer = ?conn.peer_addr(), "connection registered");
        self.hooks.connected(&conn);
        Ok(conn)
    }

    fn run_loop(&self) {
        enter_selector_thread();

        let workers = if self.config.inline_dispatch {
            None
        } else {
            Some(WorkerPool::new("fluentis-dispatch", self.config.resolved_workers()))
        };

        let mut events = Vec::with_capacity(self.config.events_per_poll);
        let mut failures = 0;

        let reason = loop {
            if self.phase.should_stop(|| self.live_connections()) {
                break DisconnectReason::User;
            }
            if self.hooks.stop_when_idle && self.entries.is_empty() {
                break DisconnectReason::User;
            }

            let timeout = self.phase.bound(self.config.poll_timeout);

            match self.poller.poll(&mut events, timeout) {
                Ok(()) => failures = 0,
                Err(err) => {
                    failures += 1;
                    warn!(?err, failures, "readiness wait failed");
                    self.hooks.exception(&Error::Io(err));

                    if failures >= MAX_POLL_FAILURES {
                        error!("readiness wait keeps failing, closing selector");
                        break DisconnectReason::ExceptionClose;
                    }
                    std::thread::sleep(POLL_FAILURE_BACKOFF);
                    continue;
                }
            }

            self.dispatch(&events, workers.as_ref());
            self.reclaim();
        };

        drop(workers);
        self.teardown(reason);
    }

    fn close(&self, urgent: bool) {
        if !self.phase.request(urgent, self.config.linger) {
            return;
        }

        for (token, entry) in self.entries.snapshot() {
            match entry {
                Entry::Listener(listener) => {
                    let _ = self.poller.deregister(sys::raw_listener(&listener));
                    self.retired.lock().push(token);
                }
                Entry::Connection(conn) if urgent => conn.close_urgent(),
                Entry::Connection(conn) => conn.close(),
            }
        }

        self.wake();
    }

    fn connections(&self) -> Vec<Arc<Connection>> {
        self.entries
            .snapshot()
            .into_iter()
            .filter_map(|(_, entry)| match entry {
                Entry::Connection(conn) if !conn.is_closed() => Some(conn),
                _ => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::super::poller::PollPoller;
    use super::*;

    use std::io::{Read, Write};
    use std::sync::mpsc;
    use std::thread;

    fn start<P: Poller>(
        config: Config,
        hooks: Hooks,
    ) -> (Arc<ReadinessLoop<P>>, thread::JoinHandle<()>) {
        let selector = ReadinessLoop::<P>::new(&config, Arc::new(hooks)).unwrap();
        let runner = selector.clone();
        let handle = thread::spawn(move || runner.run_loop());
        (selector, handle)
    }

    #[test]
    fn accepts_and_echoes() {
        let hooks = Hooks {
            on_connection: Some(Arc::new(|conn: &Arc<Connection>| {
                conn.on_read(|conn, bytes| {
                    let _ = conn.write(bytes.to_vec());
                });
            })),
            ..Hooks::default()
        };

        let config = Config::new()
            .poll_timeout(Some(Duration::from_millis(20)))
            .worker_threads(2);
        let (selector, handle) = start::<PollPoller>(config, hooks);

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        selector.listen(listener).unwrap();

        let mut client = TcpStream::connect(addr).unwrap();
        client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        client.write_all(b"echo me").unwrap();

        let mut buf = [0u8; 7];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"echo me");

        selector.close(false);
        handle.join().unwrap();
        assert_eq!(selector.connection_count(), 0);
    }

    #[test]
    fn close_hook_reports_user_reason() {
        let (tx, rx) = mpsc::channel();
        let hooks = Hooks {
            on_close: Mutex::new(Some(Box::new(move |reason: DisconnectReason| {
                let _ = tx.send(reason);
            }))),
            ..Hooks::default()
        };

        let config = Config::new().poll_timeout(Some(Duration::from_millis(20)));
        let (selector, handle) = start::<PollPoller>(config, hooks);

        selector.close(true);
        handle.join().unwrap();
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(1)).unwrap(),
            DisconnectReason::User
        );
    }

    #[test]
    fn closed_connection_slots_are_reused() {
        let config = Config::new()
            .poll_timeout(Some(Duration::from_millis(10)))
            .inline_dispatch(true);
        let (selector, handle) = start::<PollPoller>(config, Hooks::default());

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let first = {
            let peer = TcpStream::connect(addr).unwrap();
            let (stream, _) = listener.accept().unwrap();
            let conn = selector.register(stream).unwrap();
            drop(peer);
            conn
        };

        for _ in 0..200 {
            if first.is_closed() && selector.entries.is_empty() {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(first.disconnect_reason(), Some(DisconnectReason::RemoteClose));

        let _peer = TcpStream::connect(addr).unwrap();
        let (stream, _) = listener.accept().unwrap();
        let second = selector.register(stream).unwrap();
        assert_eq!(second.token(), first.token());

        selector.close(true);
        handle.join().unwrap();
    }
}
