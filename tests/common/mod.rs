#![allow(dead_code)]

use fluentis::{Backend, Config};

use std::thread;
use std::time::{Duration, Instant};

use tracing_subscriber::EnvFilter;

/// Every backend, including the ones that fall back on this host.
pub const BACKENDS: [Backend; 3] = [
    Backend::Native,
    Backend::Portable,
    Backend::ThreadPerConnection,
];

pub const TIMEOUT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn config(backend: Backend) -> Config {
    Config::new()
        .backend(backend)
        .poll_timeout(Some(Duration::from_millis(20)))
        .worker_threads(2)
        .linger(Duration::from_secs(2))
}

/// Polls `cond` until it holds or [`TIMEOUT`] elapses.
pub fn wait_until(cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

/// Deterministic payload of `len` bytes.
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}
