use crate::buffer::BufferPool;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Selector backend used to drive a server or client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Backend {
    /// The platform's native mechanism: epoll (Linux), kqueue (macOS,
    /// FreeBSD) or I/O completion ports (Windows).
    ///
    /// Falls back to [`Backend::Portable`] when unavailable.
    #[default]
    Native,

    /// `poll(2)` on Unix, `WSAPoll` on Windows.
    Portable,

    /// One thread per connection plus a dedicated accept thread.
    ///
    /// Never selected automatically.
    ThreadPerConnection,
}

/// Configuration shared by [`Server`](crate::Server) and
/// [`Client`](crate::Client).
///
/// # Examples
///
/// ```rust,ignore
/// let config = Config::new()
///     .backend(Backend::Portable)
///     .buffer_size(4096)
///     .worker_threads(2);
/// ```
#[derive(Clone)]
pub struct Config {
    pub(crate) backend: Backend,
    pub(crate) buffer_size: usize,
    pub(crate) poll_timeout: Option<Duration>,
    pub(crate) events_per_poll: usize,
    pub(crate) worker_threads: usize,
    pub(crate) inline_dispatch: bool,
    pub(crate) linger: Duration,
    pub(crate) nodelay: bool,
    pub(crate) pool: Arc<BufferPool>,
}

impl Config {
    /// Default read buffer (and socket buffer) size in bytes.
    pub const DEFAULT_BUFFER_SIZE: usize = 8192;

    /// Creates a configuration with default values.
    ///
    /// - native backend,
    /// - 8 KiB buffers,
    /// - 100 ms poll timeout,
    /// - 64 events per poll,
    /// - `2 × logical CPUs` dispatch workers,
    /// - 5 s linger for graceful shutdown.
    pub fn new() -> Self {
        Self {
            backend: Backend::Native,
            buffer_size: Self::DEFAULT_BUFFER_SIZE,
            poll_timeout: Some(Duration::from_millis(100)),
            events_per_poll: 64,
            worker_threads: 0,
            inline_dispatch: false,
            linger: Duration::from_secs(5),
            nodelay: true,
            pool: BufferPool::global(),
        }
    }

    /// Selects the backend.
    pub fn backend(mut self, backend: Backend) -> Self {
        self.backend = backend;
        self
    }

    /// Sets the per-connection read buffer size, also applied to the
    /// socket send and receive buffers.
    ///
    /// # Panics
    ///
    /// Panics if `size == 0`.
    pub fn buffer_size(mut self, size: usize) -> Self {
        assert!(size > 0, "buffer_size must be > 0");

        self.buffer_size = size;
        self
    }

    /// Sets how long one readiness wait may block; `None` waits forever.
    pub fn poll_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.poll_timeout = timeout;
        self
    }

    /// Sets how many readiness events a single wait call may return.
    ///
    /// # Panics
    ///
    /// Panics if `n == 0`.
    pub fn events_per_poll(mut self, n: usize) -> Self {
        assert!(n > 0, "events_per_poll must be > 0");

        self.events_per_poll = n;
        self
    }

    /// Sets the number of dispatch (or completion) worker threads.
    ///
    /// `0` selects twice the number of logical CPUs.
    pub fn worker_threads(mut self, n: usize) -> Self {
        self.worker_threads = n;
        self
    }

    /// Dispatches readiness batches on the loop thread instead of the
    /// worker pool.
    pub fn inline_dispatch(mut self, inline: bool) -> Self {
        self.inline_dispatch = inline;
        self
    }

    /// Sets how long a graceful shutdown waits for queued writes.
    pub fn linger(mut self, linger: Duration) -> Self {
        self.linger = linger;
        self
    }

    /// Enables or disables `TCP_NODELAY` on every connection.
    pub fn nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    /// Uses a specific buffer pool instead of the process-wide one.
    pub fn pool(mut self, pool: Arc<BufferPool>) -> Self {
        self.pool = pool;
        self
    }

    /// Resolves the worker count, applying the `0 ⇒ 2 × CPUs` rule.
    pub(crate) fn resolved_workers(&self) -> usize {
        if self.worker_threads > 0 {
            return self.worker_threads;
        }

        thread::available_parallelism()
            .map(|n| n.get() * 2)
            .unwrap_or(2)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_workers_defaults_to_twice_cpus() {
        let config = Config::new().worker_threads(0);
        assert!(config.resolved_workers() >= 2);
        assert_eq!(config.resolved_workers() % 2, 0);
    }

    #[test]
    fn explicit_workers_are_kept() {
        assert_eq!(Config::new().worker_threads(3).resolved_workers(), 3);
    }

    #[test]
    #[should_panic(expected = "buffer_size must be > 0")]
    fn zero_buffer_size_panics() {
        let _ = Config::new().buffer_size(0);
    }
}
