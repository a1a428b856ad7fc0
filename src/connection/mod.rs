//! Per-connection state.
//!
//! A [`Connection`] owns one non-blocking TCP socket together with:
//!
//! - a fixed-capacity read buffer taken from a [`BufferPool`],
//! - a FIFO of pending read requests (see [`read`]),
//! - a FIFO of pending writes (see [`write`]),
//! - user callbacks,
//! - a tri-state open / closing / closed flag.
//!
//! Connections are always handled through `Arc<Connection>`; the selector
//! that drives one keeps it in its slot table until the close completes.
//!
//! # Closing
//!
//! The flag moves `Open → Closing → Closed` with compare-and-swap. The
//! caller that wins `Open → Closing` records the [`DisconnectReason`];
//! the caller that wins `Closing → Closed` runs the side effects
//! (deregistration, socket close, buffer release, disconnect callback).
//! Both transitions happen at most once, whatever mix of user close,
//! remote end-of-stream and I/O failure races for them.

mod callbacks;
mod read;
mod write;

pub use read::ReadFlow;

pub(crate) use callbacks::panic_message;
pub(crate) use write::WriteProgress;

use crate::buffer::{BufferPool, ReadBuffer};
use crate::config::Config;
use crate::error::{DisconnectReason, Error};
use crate::selector::Registry;
use crate::sys::{self, RawFd};

use callbacks::Callbacks;
use read::ReadState;
use write::WriteState;

use bytes::Bytes;
use parking_lot::{Mutex, ReentrantMutex, RwLock};
use tracing::{debug, warn};

use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock, Weak};

const OPEN: u8 = 0;
const CLOSING: u8 = 1;
const CLOSED: u8 = 2;

/// Observable lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Reads and writes are accepted.
    Open,
    /// A graceful close is waiting for queued writes to drain.
    Closing,
    /// The socket is closed and the buffer released.
    Closed,
}

type Attachment = Arc<dyn Any + Send + Sync>;

/// One TCP connection driven by a selector.
pub struct Connection {
    token: usize,
    socket: RwLock<Option<TcpStream>>,
    peer_addr: Option<SocketAddr>,
    local_addr: Option<SocketAddr>,
    capacity: usize,

    state: AtomicU8,
    reason: OnceLock<DisconnectReason>,

    reader: ReentrantMutex<RefCell<ReadState>>,
    writer: Mutex<WriteState>,
    callbacks: Callbacks,
    attachment: Mutex<Option<Attachment>>,

    registry: Weak<dyn Registry>,
    pool: Arc<BufferPool>,
}

impl Connection {
    /// Wraps a configured, non-blocking stream.
    pub(crate) fn new(
        token: usize,
        stream: TcpStream,
        config: &Config,
        registry: Weak<dyn Registry>,
    ) -> Arc<Self> {
        let capacity = config.buffer_size;
        let block = config.pool.take(capacity);

        Arc::new(Self {
            token,
            peer_addr: stream.peer_addr().ok(),
            local_addr: stream.local_addr().ok(),
            socket: RwLock::new(Some(stream)),
            capacity,
            state: AtomicU8::new(OPEN),
            reason: OnceLock::new(),
            reader: ReentrantMutex::new(RefCell::new(ReadState::new(ReadBuffer::new(
                block, capacity,
            )))),
            writer: Mutex::new(WriteState::default()),
            callbacks: Callbacks::default(),
            attachment: Mutex::new(None),
            registry,
            pool: config.pool.clone(),
        })
    }

    /// Token identifying this connection inside its selector.
    pub fn token(&self) -> usize {
        self.token
    }

    /// Address of the remote peer.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Local address of the socket.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Capacity of the read buffer; the upper bound for a read request.
    pub fn buffer_capacity(&self) -> usize {
        self.capacity
    }

    /// Current lifecycle state. `Closing` lasts while queued writes drain
    /// after a graceful close.
    pub fn state(&self) -> ConnectionState {
        match self.state.load(Ordering::Acquire) {
            OPEN => ConnectionState::Open,
            CLOSING => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }

    /// Returns `true` once the close completed. Never reverts.
    pub fn is_closed(&self) -> bool {
        self.state.load(Ordering::Acquire) == CLOSED
    }

    /// The reason recorded by whichever close won, if any.
    pub fn disconnect_reason(&self) -> Option<DisconnectReason> {
        self.reason.get().copied()
    }

    /// Returns `true` if queued writes are waiting for the socket.
    pub fn has_pending_writes(&self) -> bool {
        !self.writer.lock().is_empty()
    }

    /// Stores application state on the connection, replacing any
    /// previous attachment.
    pub fn set_attachment<T: Any + Send + Sync>(&self, value: T) {
        *self.attachment.lock() = Some(Arc::new(value));
    }

    /// Returns the attachment if it is a `T`.
    pub fn attachment<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        let attachment = self.attachment.lock().clone()?;
        attachment.downcast::<T>().ok()
    }

    /// Installs the callback that observes every chunk read from the
    /// socket, before read requests are served.
    pub fn on_read(&self, cb: impl Fn(&Connection, &[u8]) + Send + Sync + 'static) {
        self.callbacks.set_read(Arc::new(cb));
    }

    /// Installs the callback fired exactly once when the connection closes.
    pub fn on_disconnect(
        &self,
        cb: impl Fn(&Connection, DisconnectReason) + Send + Sync + 'static,
    ) {
        self.callbacks.set_disconnect(Arc::new(cb));
    }

    /// Installs the callback that observes errors on this connection:
    /// fatal I/O errors, rejected read requests and callback panics.
    pub fn on_exception(&self, cb: impl Fn(&Connection, &Error) + Send + Sync + 'static) {
        self.callbacks.set_exception(Arc::new(cb));
    }

    /// Installs the callback that receives the full read buffer when it
    /// fills up without satisfying the head request. The buffer is
    /// discarded afterwards either way.
    pub fn on_buffer_overflow(&self, cb: impl Fn(&Connection, &[u8]) + Send + Sync + 'static) {
        self.callbacks.set_overflow(Arc::new(cb));
    }

    /// Closes the connection once every queued write has been sent.
    ///
    /// Pending read requests are cancelled immediately and no new reads
    /// or writes are accepted.
    pub fn close(&self) {
        if !self.begin_close(DisconnectReason::User) {
            return;
        }

        self.cancel_reads();
        if self.writer.lock().is_empty() {
            self.finish_close();
        } else {
            debug!(token = self.token, "closing after pending writes");
        }
    }

    /// Closes the connection now, discarding queued writes.
    pub fn close_urgent(&self) {
        self.begin_close(DisconnectReason::User);
        self.finish_close();
    }

    /// Raw handle of the socket while it is open.
    pub(crate) fn raw_fd(&self) -> Option<RawFd> {
        self.socket.read().as_ref().map(sys::raw_stream)
    }

    /// Moves `Open → Closing`, recording `reason`. Returns `true` for the
    /// caller that won.
    fn begin_close(&self, reason: DisconnectReason) -> bool {
        let won = self
            .state
            .compare_exchange(OPEN, CLOSING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();

        if won {
            let _ = self.reason.set(reason);
        }
        won
    }

    /// Closes with `reason`, abandoning queued writes.
    pub(crate) fn shutdown(&self, reason: DisconnectReason) {
        self.begin_close(reason);
        self.finish_close();
    }

    /// Handles a connection-fatal I/O error.
    pub(crate) fn fail(&self, err: std::io::Error) {
        if self.is_closed() {
            return;
        }

        let reason = DisconnectReason::classify(&err);
        debug!(token = self.token, ?err, %reason, "connection failed");

        self.begin_close(reason);
        if reason.reports_exception() {
            self.notify_exception(&Error::Io(err));
        }
        self.finish_close();
    }

    /// Runs the side effects of a close exactly once.
    fn finish_close(&self) {
        if self
            .state
            .compare_exchange(CLOSING, CLOSED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let reason = self.reason.get().copied().unwrap_or(DisconnectReason::User);

        if let Some(registry) = self.registry.upgrade() {
            registry.deregister(self);
        }

        if let Some(socket) = self.socket.write().take() {
            let _ = socket.shutdown(Shutdown::Both);
        }

        // The lock may be held by another thread mid-dispatch; that
        // thread releases the buffer when it observes the closed state.
        if let Some(reader) = self.reader.try_lock() {
            self.release_reader(&reader);
        }

        let abandoned = self.writer.lock().take();
        drop(abandoned);

        debug!(token = self.token, %reason, "connection closed");

        if let Some(cb) = self.callbacks.seal() {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| cb(self, reason)));
            if let Err(payload) = outcome {
                warn!(
                    token = self.token,
                    panic = %panic_message(payload.as_ref()),
                    "disconnect callback panicked"
                );
            }
        }

        self.attachment.lock().take();
    }

    /// Reports an error through the exception callback.
    pub(crate) fn notify_exception(&self, err: &Error) {
        let Some(cb) = self.callbacks.exception() else {
            debug!(token = self.token, %err, "unhandled connection exception");
            return;
        };

        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| cb(self, err))) {
            warn!(
                token = self.token,
                panic = %panic_message(payload.as_ref()),
                "exception callback panicked"
            );
            self.shutdown(DisconnectReason::ExceptionClose);
        }
    }

    /// Runs a user callback, turning a panic into an exception close.
    pub(crate) fn guarded<R>(&self, name: &'static str, f: impl FnOnce() -> R) -> Option<R> {
        match panic::catch_unwind(AssertUnwindSafe(f)) {
            Ok(value) => Some(value),
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                warn!(token = self.token, callback = name, panic = %message, "callback panicked");

                self.begin_close(DisconnectReason::ExceptionClose);
                self.notify_exception(&Error::CallbackPanicked(message));
                self.finish_close();
                None
            }
        }
    }

    fn registry(&self) -> Option<Arc<dyn Registry>> {
        self.registry.upgrade()
    }

    /// Queues interest changes for the write path.
    fn set_writable(&self, pending: Option<&Bytes>) {
        if let Some(registry) = self.registry() {
            registry.set_writable(self, pending);
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        let reader = self.reader.get_mut().get_mut();
        reader.release(&self.pool);
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("token", &self.token)
            .field("peer_addr", &self.peer_addr)
            .field("state", &self.state())
            .finish()
    }
}

/// Registry used by connections that no selector drives.
#[cfg(test)]
pub(crate) struct Detached;

#[cfg(test)]
impl Registry for Detached {
    fn set_writable(&self, _conn: &Connection, _pending: Option<&Bytes>) {}

    fn deregister(&self, _conn: &Connection) {}
}

#[cfg(test)]
impl Connection {
    /// Builds a connection over `stream` without any selector.
    pub(crate) fn detached(stream: TcpStream, config: &Config) -> Arc<Self> {
        sys::configure_stream(&stream, config.buffer_size, config.nodelay)
            .expect("configure stream");
        Self::new(0, stream, config, Weak::<Detached>::new())
    }
}


#[cfg(test)]
mod tests {
    use super::testing::socket_pair;
    use super::*;

    use std::io::Read;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn close_runs_once_under_races() {
        for _ in 0..20 {
            let (local, _remote) = socket_pair();
            let conn = Connection::detached(local, &Config::new().buffer_size(64));

            let fired = Arc::new(AtomicUsize::new(0));
            let counter = fired.clone();
            conn.on_disconnect(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
            });

            let handles: Vec<_> = (0..3)
                .map(|i| {
                    let conn = conn.clone();
                    thread::spawn(move || match i {
                        0 => conn.close_urgent(),
                        1 => conn.shutdown(DisconnectReason::RemoteClose),
                        _ => conn.fail(std::io::ErrorKind::ConnectionReset.into()),
                    })
                })
                .collect();

            for h in handles {
                h.join().unwrap();
            }

            assert!(conn.is_closed());
            assert_eq!(fired.load(Ordering::SeqCst), 1);
            assert!(conn.disconnect_reason().is_some());
        }
    }

    #[test]
    fn close_releases_buffer_and_socket() {
        let pool = Arc::new(BufferPool::new());
        let (local, mut remote) = socket_pair();
        let conn = Connection::detached(local, &Config::new().buffer_size(128).pool(pool.clone()));
        assert_eq!(pool.stats().outstanding, 1);

        conn.close();
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(conn.disconnect_reason(), Some(DisconnectReason::User));
        assert!(conn.raw_fd().is_none());
        assert_eq!(pool.stats().outstanding, 0);

        let mut buf = [0u8; 1];
        assert_eq!(remote.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn callbacks_are_cleared_after_close() {
        let (local, _remote) = socket_pair();
        let conn = Connection::detached(local, &Config::new());
        conn.close_urgent();

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        conn.on_disconnect(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        conn.close_urgent();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn attachment_downcasts() {
        let (local, _remote) = socket_pair();
        let conn = Connection::detached(local, &Config::new());

        conn.set_attachment(42u32);
        assert_eq!(conn.attachment::<u32>().as_deref(), Some(&42));
        assert!(conn.attachment::<String>().is_none());
    }

    #[test]
    fn reset_reports_exception_before_disconnect() {
        let (local, _remote) = socket_pair();
        let conn = Connection::detached(local, &Config::new());

        let events = Arc::new(Mutex::new(Vec::new()));
        let log = events.clone();
        conn.on_exception(move |_, _| log.lock().push("exception"));
        let log = events.clone();
        conn.on_disconnect(move |_, reason| {
            assert_eq!(reason, DisconnectReason::RemoteCloseByException);
            log.lock().push("disconnect");
        });

        conn.fail(std::io::ErrorKind::BrokenPipe.into());
        assert_eq!(*events.lock(), vec!["exception", "disconnect"]);
    }
}
