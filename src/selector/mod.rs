//! Selector backends.
//!
//! A selector owns the sockets of one server or client and drives their
//! connections: it accepts, dispatches readiness (or completions) into
//! the read and write engines, and tears everything down on close.
//!
//! Backends:
//!
//! - [`readiness::ReadinessLoop`] over a [`poller::Poller`]: epoll on
//!   Linux, kqueue on the BSDs, `poll(2)`/`WSAPoll` everywhere,
//! - `iocp::IocpSelector`: Windows I/O completion ports,
//! - [`threaded::ThreadedSelector`]: one thread per connection.
//!
//! [`open`] applies the selection policy: the native backend first,
//! falling back to the portable one if it cannot be created.

pub(crate) mod poller;
pub(crate) mod readiness;
pub(crate) mod threaded;

#[cfg(windows)]
pub(crate) mod iocp;

use crate::config::{Backend, Config};
use crate::connection::{Connection, panic_message};
use crate::error::{DisconnectReason, Error};

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::warn;

use std::cell::Cell;
use std::io;
use std::net::{TcpListener, TcpStream};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// The side of a selector that connections talk back to.
pub(crate) trait Registry: Send + Sync {
    /// Raises write interest while `pending` holds the head of the
    /// write queue, drops it when `None`.
    ///
    /// Called with the connection's write lock held.
    fn set_writable(&self, conn: &Connection, pending: Option<&Bytes>);

    /// Forgets a connection that is closing. Called exactly once, before
    /// its socket is closed.
    fn deregister(&self, conn: &Connection);
}

/// A running event loop.
pub(crate) trait Selector: Send + Sync + 'static {
    /// The backend actually in use.
    fn kind(&self) -> Backend;

    /// Starts accepting on a bound, non-blocking listener.
    fn listen(&self, listener: TcpListener) -> io::Result<()>;

    /// Wraps a connected stream into a driven connection and fires the
    /// connection hook.
    fn register(&self, stream: TcpStream) -> io::Result<Arc<Connection>>;

    /// Runs the loop on the calling thread until the selector closes.
    fn run_loop(&self);

    /// Requests shutdown. A graceful close lets queued writes drain for
    /// at most the configured linger.
    fn close(&self, urgent: bool);

    /// Live connections.
    fn connections(&self) -> Vec<Arc<Connection>>;

    /// Number of live connections. Walks every slot.
    fn connection_count(&self) -> usize {
        self.connections().len()
    }
}

thread_local! {
    static SELECTOR_THREAD: Cell<bool> = const { Cell::new(false) };
}

/// Marks the calling thread as owned by a selector.
pub(crate) fn enter_selector_thread() {
    SELECTOR_THREAD.with(|flag| flag.set(true));
}

/// Returns `true` on loop, worker and connection threads, where waiting
/// for the selector to stop would deadlock.
pub(crate) fn on_selector_thread() -> bool {
    SELECTOR_THREAD.with(Cell::get)
}

/// Spawns a named thread running [`Selector::run_loop`].
pub(crate) fn spawn(selector: Arc<dyn Selector>, name: &str) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(name.to_string())
        .spawn(move || selector.run_loop())
}

/// Creates the selector for `config`, applying the fallback policy.
pub(crate) fn open(config: &Config, hooks: Arc<Hooks>) -> io::Result<Arc<dyn Selector>> {
    match config.backend {
        Backend::ThreadPerConnection => {
            let selector: Arc<dyn Selector> = threaded::ThreadedSelector::new(config, hooks);
            Ok(selector)
        }
        Backend::Portable => portable(config, hooks),
        Backend::Native => match native(config, hooks.clone()) {
            Ok(selector) => Ok(selector),
            Err(err) => {
                warn!(?err, "native backend unavailable, falling back to portable");
                portable(config, hooks)
            }
        },
    }
}

fn portable(config: &Config, hooks: Arc<Hooks>) -> io::Result<Arc<dyn Selector>> {
    let selector: Arc<dyn Selector> =
        readiness::ReadinessLoop::<poller::PollPoller>::new(config, hooks)?;
    Ok(selector)
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn native(config: &Config, hooks: Arc<Hooks>) -> io::Result<Arc<dyn Selector>> {
    let selector: Arc<dyn Selector> =
        readiness::ReadinessLoop::<poller::EpollPoller>::new(config, hooks)?;
    Ok(selector)
}

#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
fn native(config: &Config, hooks: Arc<Hooks>) -> io::Result<Arc<dyn Selector>> {
    let selector: Arc<dyn Selector> =
        readiness::ReadinessLoop::<poller::KqueuePoller>::new(config, hooks)?;
    Ok(selector)
}

#[cfg(windows)]
fn native(config: &Config, hooks: Arc<Hooks>) -> io::Result<Arc<dyn Selector>> {
    let selector: Arc<dyn Selector> = iocp::IocpSelector::new(config, hooks)?;
    Ok(selector)
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    windows
)))]
fn native(_config: &Config, _hooks: Arc<Hooks>) -> io::Result<Arc<dyn Selector>> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "no native selector on this platform",
    ))
}

pub(crate) type ConnectionHook = Arc<dyn Fn(&Arc<Connection>) + Send + Sync>;
pub(crate) type ExceptionHook = Arc<dyn Fn(&Error) + Send + Sync>;
pub(crate) type CloseHook = Box<dyn FnOnce(DisconnectReason) + Send>;

/// Selector-level callbacks supplied by the server or client.
#[derive(Default)]
pub(crate) struct Hooks {
    pub(crate) on_connection: Option<ConnectionHook>,
    pub(crate) on_exception: Option<ExceptionHook>,
    pub(crate) on_close: Mutex<Option<CloseHook>>,
    /// Stop the loop once the last connection is gone.
    pub(crate) stop_when_idle: bool,
}

impl Hooks {
    /// Fires the connection hook; a panic closes only that connection.
    pub(crate) fn connected(&self, conn: &Arc<Connection>) {
        if let Some(cb) = &self.on_connection {
            conn.guarded("on_connection", || cb(conn));
        }
    }

    /// Reports an error that belongs to no connection.
    pub(crate) fn exception(&self, err: &Error) {
        let Some(cb) = &self.on_exception else {
            warn!(%err, "unhandled selector exception");
            return;
        };

        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| cb(err))) {
            warn!(panic = %panic_message(payload.as_ref()), "exception hook panicked");
        }
    }

    /// Fires the close hook, at most once.
    pub(crate) fn closed(&self, reason: DisconnectReason) {
        let Some(cb) = self.on_close.lock().take() else {
            return;
        };

        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| cb(reason))) {
            warn!(panic = %panic_message(payload.as_ref()), "close hook panicked");
        }
    }
}

const RUNNING: u8 = 0;
const GRACEFUL: u8 = 1;
const URGENT: u8 = 2;

/// Shutdown progress shared by every backend.
pub(crate) struct Phase {
    state: AtomicU8,
    deadline: Mutex<Option<Instant>>,
}

impl Phase {
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicU8::new(RUNNING),
            deadline: Mutex::new(None),
        }
    }

    /// Records a close request. An urgent request overrides a graceful
    /// one; nothing downgrades. Returns `false` if the same or a stronger
    /// request was already made.
    pub(crate) fn request(&self, urgent: bool, linger: Duration) -> bool {
        let next = if urgent { URGENT } else { GRACEFUL };
        let previous = self.state.fetch_max(next, Ordering::AcqRel);

        if previous == RUNNING {
            *self.deadline.lock() = Some(Instant::now() + linger);
        }
        previous < next
    }

    pub(crate) fn is_running(&self) -> bool {
        self.state.load(Ordering::Acquire) == RUNNING
    }

    /// Returns `true` once the loop must stop: an urgent close, or a
    /// graceful one with no live connection left or the linger elapsed.
    ///
    /// `live` is only called during a graceful close.
    pub(crate) fn should_stop(&self, live: impl FnOnce() -> usize) -> bool {
        match self.state.load(Ordering::Acquire) {
            RUNNING => false,
            GRACEFUL => self.remaining() == Some(Duration::ZERO) || live() == 0,
            _ => true,
        }
    }

    /// Time left before a graceful close gives up on queued writes.
    pub(crate) fn remaining(&self) -> Option<Duration> {
        self.deadline
            .lock()
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Bounds a wait timeout by the linger deadline.
    pub(crate) fn bound(&self, timeout: Option<Duration>) -> Option<Duration> {
        match (timeout, self.remaining()) {
            (Some(t), Some(r)) => Some(t.min(r)),
            (None, r) => r,
            (t, None) => t,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urgent_overrides_graceful() {
        let phase = Phase::new();
        assert!(phase.is_running());
        assert!(!phase.should_stop(|| 3));

        assert!(phase.request(false, Duration::from_secs(60)));
        assert!(!phase.should_stop(|| 3));
        assert!(phase.should_stop(|| 0));
        assert!(!phase.request(false, Duration::from_secs(60)));

        assert!(phase.request(true, Duration::from_secs(60)));
        assert!(phase.should_stop(|| 3));
        assert!(!phase.request(false, Duration::from_secs(60)));
    }

    #[test]
    fn live_count_is_only_taken_during_graceful_close() {
        use std::sync::atomic::AtomicUsize;

        let counted = AtomicUsize::new(0);
        let live = || {
            counted.fetch_add(1, Ordering::SeqCst);
            1
        };

        let phase = Phase::new();
        for _ in 0..10 {
            assert!(!phase.should_stop(live));
        }
        assert_eq!(counted.load(Ordering::SeqCst), 0);

        phase.request(false, Duration::from_secs(60));
        assert!(!phase.should_stop(live));
        assert_eq!(counted.load(Ordering::SeqCst), 1);

        phase.request(true, Duration::from_secs(60));
        assert!(phase.should_stop(live));
        assert_eq!(counted.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn linger_expiry_stops_graceful_close() {
        let phase = Phase::new();
        phase.request(false, Duration::ZERO);
        assert!(phase.should_stop(|| 5));
        assert_eq!(phase.bound(None), Some(Duration::ZERO));
    }

    #[test]
    fn bound_keeps_shorter_timeout() {
        let phase = Phase::new();
        assert_eq!(phase.bound(Some(Duration::from_millis(5))), Some(Duration::from_millis(5)));
        assert_eq!(phase.bound(None), None);

        phase.request(false, Duration::from_secs(60));
        assert_eq!(phase.bound(Some(Duration::from_millis(5))), Some(Duration::from_millis(5)));
    }

    #[test]
    fn close_hook_fires_once() {
        use std::sync::atomic::AtomicUsize;

        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let hooks = Hooks {
            on_close: Mutex::new(Some(Box::new(move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            }))),
            ..Hooks::default()
        };

        hooks.closed(DisconnectReason::User);
        hooks.closed(DisconnectReason::User);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn fallback_always_yields_a_selector() {
        let selector = open(&Config::new(), Arc::new(Hooks::default())).unwrap();
        assert_ne!(selector.kind(), Backend::ThreadPerConnection);
        selector.close(true);
    }
}
