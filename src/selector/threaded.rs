//! Thread-per-connection backend.
//!
//! The loop thread only accepts. Every connection gets its own thread
//! that reads until the socket would block, flushes queued writes and
//! then waits on its socket for readability (and writability while
//! writes are queued). A close shuts the socket down, which ends the
//! wait. A write queued from another thread while the connection thread
//! waits for readability only is picked up when that wait times out.
//! Connection threads are detached; they exit on their own once their
//! connection is closed.

use super::{Hooks, Phase, Registry, Selector, enter_selector_thread};
use crate::config::{Backend, Config};
use crate::connection::Connection;
use crate::error::{DisconnectReason, Error};
use crate::sys;
use crate::utils::SlotTable;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use std::io;
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Weak};
use std::thread::{self, Thread};
use std::time::Duration;

/// Pause between two accept rounds.
const ACCEPT_INTERVAL: Duration = Duration::from_millis(1);

/// Upper bound of one socket wait on a connection thread.
const MAX_IDLE_WAIT: Duration = Duration::from_secs(1);

pub(crate) struct ThreadedSelector {
    config: Config,
    hooks: Arc<Hooks>,
    entries: SlotTable<Arc<Connection>>,
    listeners: Mutex<Vec<TcpListener>>,
    runner: Mutex<Option<Thread>>,
    phase: Phase,
    this: Weak<Self>,
}

impl ThreadedSelector {
    pub(crate) fn new(config: &Config, hooks: Arc<Hooks>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            config: config.clone(),
            hooks,
            entries: SlotTable::new(16),
            listeners: Mutex::new(Vec::new()),
            runner: Mutex::new(None),
            phase: Phase::new(),
            this: this.clone(),
        })
    }

    fn unpark_runner(&self) {
        if let Some(runner) = self.runner.lock().as_ref() {
            runner.unpark();
        }
    }

    fn accept_all(&self) {
        let mut accepted = Vec::new();

        for listener in self.listeners.lock().iter() {
            loop {
                match listener.accept() {
                    Ok(pair) => accepted.push(pair),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => {
                        warn!(?err, "accept failed");
                        self.hooks.exception(&Error::Io(err));
                        break;
                    }
                }
            }
        }

        // Registration runs user hooks, which may close the selector.
        for (stream, peer) in accepted {
            if !self.phase.is_running() {
                return;
            }

            debug!(%peer, "accepted connection");
            if let Err(err) = self.register(stream) {
                warn!(?err, %peer, "failed to start connection thread");
                self.hooks.exception(&Error::Io(err));
            }
        }
    }

    /// How long a connection thread waits on its socket per round.
    fn idle_wait(&self) -> Duration {
        self.config
            .poll_timeout
            .map_or(MAX_IDLE_WAIT, |t| t.min(MAX_IDLE_WAIT))
    }

    fn serve(conn: &Connection, wait: Duration) {
        enter_selector_thread();
        trace!(token = conn.token(), "connection thread started");

        while !conn.is_closed() {
            conn.on_readable();
            if conn.has_pending_writes() {
                conn.continue_writing();
            }
            if conn.is_closed() {
                break;
            }
            Self::wait_ready(conn, wait);
        }

        trace!(token = conn.token(), "connection thread exiting");
    }

    /// Blocks until the socket is readable, or writable while writes are
    /// queued, or `wait` elapsed.
    fn wait_ready(conn: &Connection, wait: Duration) {
        let Some(fd) = conn.raw_fd() else {
            return;
        };

        let mut events = sys::POLL_READ;
        if conn.has_pending_writes() {
            events |= sys::POLL_WRITE;
        }

        let mut fds = [sys::poll_fd(fd, events)];
        if let Err(err) = sys::sys_poll(&mut fds, Some(wait)) {
            trace!(token = conn.token(), ?err, "socket wait failed");
            thread::sleep(ACCEPT_INTERVAL);
        }
    }

    fn teardown(&self) {
        for conn in self.connections() {
            conn.close_urgent();
        }
        self.listeners.lock().clear();

        debug!("thread-per-connection selector stopped");
        self.hooks.closed(DisconnectReason::User);
    }
}

impl Registry for ThreadedSelector {
    // The connection thread checks the write queue before every wait.
    fn set_writable(&self, _conn: &Connection, _pending: Option<&Bytes>) {}

    fn deregister(&self, conn: &Connection) {
        let owned = self
            .entries
            .get(conn.token())
            .is_some_and(|entry| std::ptr::eq(Arc::as_ptr(&entry), conn));

        if owned {
            self.entries.remove(conn.token());
        }

        if !self.phase.is_running() || self.hooks.stop_when_idle {
            self.unpark_runner();
        }
    }
}

impl Selector for ThreadedSelector {
    fn kind(&self) -> Backend {
        Backend::ThreadPerConnection
    }

    fn listen(&self, listener: TcpListener) -> io::Result<()> {
        listener.set_nonblocking(true)?;
        self.listeners.lock().push(listener);
        self.unpark_runner();
        Ok(())
    }

    fn register(&self, stream: TcpStream) -> io::Result<Arc<Connection>> {
        sys::configure_stream(&stream, self.config.buffer_size, self.config.nodelay)?;

        let registry: Weak<dyn Registry> = self.this.clone();
        let (token, conn) = self.entries.insert_with(|token| {
            Ok::<_, io::Error>(Connection::new(token, stream, &self.config, registry))
        })?;

        debug!(token, peer = ?conn.peer_addr(), "connection registered");
        self.hooks.connected(&conn);

        let served = conn.clone();
        let wait = self.idle_wait();
        let spawned = thread::Builder::new()
            .name(format!("fluentis-conn-{token}"))
            .spawn(move || Self::serve(&served, wait));

        if let Err(err) = spawned {
            conn.shutdown(DisconnectReason::ExceptionClose);
            return Err(err);
        }

        Ok(conn)
    }

    fn run_loop(&self) {
        enter_selector_thread();
        *self.runner.lock() = Some(thread::current());

        loop {
            if self.phase.should_stop(|| self.connection_count()) {
                break;
            }
            if self.hooks.stop_when_idle && self.entries.is_empty() {
                break;
            }

            self.accept_all();

            let pause = self.phase.bound(Some(ACCEPT_INTERVAL)).unwrap_or(ACCEPT_INTERVAL);
            thread::park_timeout(pause);
        }

        self.teardown();
        self.runner.lock().take();
    }

    fn close(&self, urgent: bool) {
        if !self.phase.request(urgent, self.config.linger) {
            return;
        }

        self.listeners.lock().clear();
        for conn in self.connections() {
            if urgent {
                conn.close_urgent();
            } else {
                conn.close();
            }
        }

        self.unpark_runner();
    }

    fn connections(&self) -> Vec<Arc<Connection>> {
        self.entries
            .snapshot()
            .into_iter()
            .map(|(_, conn)| conn)
            .filter(|conn| !conn.is_closed())
            .collect()
    }
}
