//! TCP client.
//!
//! A client owns one connection driven by its own selector. The loop
//! thread exits on its own once that connection is closed.

use crate::config::{Backend, Config};
use crate::connection::Connection;
use crate::error::{DisconnectReason, Error, Result};
use crate::selector::{self, CloseHook, ConnectionHook, ExceptionHook, Hooks, Selector};
use crate::server::resolve;
use crate::sys;

use parking_lot::Mutex;
use tracing::{debug, warn};

use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, OnceLock, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

/// Builder for a [`Client`].
pub struct ClientBuilder {
    config: Config,
    on_connect: Option<ConnectionHook>,
    on_connection_failed: Option<ExceptionHook>,
    on_exception: Option<ExceptionHook>,
    on_close: Option<CloseHook>,
}

impl ClientBuilder {
    /// Creates a builder with the default [`Config`] and no callbacks.
    pub fn new() -> Self {
        Self {
            config: Config::new(),
            on_connect: None,
            on_connection_failed: None,
            on_exception: None,
            on_close: None,
        }
    }

    /// Replaces the transport configuration.
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Runs on the connecting thread once the connection is established,
    /// before any of its bytes are dispatched.
    pub fn on_connect(mut self, cb: impl Fn(&Arc<Connection>) + Send + Sync + 'static) -> Self {
        self.on_connect = Some(Arc::new(cb));
        self
    }

    /// Runs when the connection attempt fails or times out.
    pub fn on_connection_failed(mut self, cb: impl Fn(&Error) + Send + Sync + 'static) -> Self {
        self.on_connection_failed = Some(Arc::new(cb));
        self
    }

    /// Receives errors raised outside the connection's own callbacks,
    /// including a failed connection attempt.
    pub fn on_exception(mut self, cb: impl Fn(&Error) + Send + Sync + 'static) -> Self {
        self.on_exception = Some(Arc::new(cb));
        self
    }

    /// Runs once after the client stopped, with the disconnect reason of
    /// its connection.
    pub fn on_close(mut self, cb: impl FnOnce(DisconnectReason) + Send + 'static) -> Self {
        self.on_close = Some(Box::new(cb));
        self
    }

    /// Connects to `addr`, blocking until the connection is established.
    pub fn connect(self, addr: impl ToSocketAddrs) -> Result<Client> {
        self.establish(resolve(addr)?, None)
    }

    /// Connects to `addr`, giving up after `timeout`.
    ///
    /// # Errors
    ///
    /// [`Error::ConnectTimeout`] if the peer did not answer in time. The
    /// failure callbacks run before this returns.
    pub fn connect_timeout(self, addr: impl ToSocketAddrs, timeout: Duration) -> Result<Client> {
        self.establish(resolve(addr)?, Some(timeout))
    }

    fn establish(self, addr: SocketAddr, timeout: Option<Duration>) -> Result<Client> {
        if addr.port() == 0 {
            return Err(Error::InvalidPort);
        }

        let stream = match sys::sys_connect(&addr, self.config.buffer_size, timeout) {
            Ok(stream) => stream,
            Err(err) => {
                let err = match err.kind() {
                    io::ErrorKind::TimedOut => Error::ConnectTimeout,
                    _ => Error::Io(err),
                };
                debug!(%addr, %err, "connect failed");

                notify(self.on_connection_failed.as_ref(), &err);
                notify(self.on_exception.as_ref(), &err);
                return Err(err);
            }
        };

        let connection: Arc<OnceLock<Weak<Connection>>> = Arc::new(OnceLock::new());
        let on_close = self.on_close.map(|cb| {
            let connection = connection.clone();
            Box::new(move |reason: DisconnectReason| {
                let reason = connection
                    .get()
                    .and_then(Weak::upgrade)
                    .and_then(|conn| conn.disconnect_reason())
                    .unwrap_or(reason);
                cb(reason);
            }) as CloseHook
        });

        let hooks = Hooks {
            on_connection: self.on_connect,
            on_exception: self.on_exception,
            on_close: Mutex::new(on_close),
            stop_when_idle: true,
        };

        let selector = selector::open(&self.config, Arc::new(hooks))?;
        let conn = selector.register(stream)?;
        let _ = connection.set(Arc::downgrade(&conn));

        let handle = match selector::spawn(selector.clone(), "fluentis-client") {
            Ok(handle) => handle,
            Err(err) => {
                conn.close_urgent();
                return Err(Error::Io(err));
            }
        };

        debug!(%addr, backend = ?selector.kind(), "client connected");

        Ok(Client {
            selector,
            conn,
            handle: Mutex::new(Some(handle)),
        })
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn notify(hook: Option<&ExceptionHook>, err: &Error) {
    let Some(cb) = hook else {
        return;
    };

    if panic::catch_unwind(AssertUnwindSafe(|| cb(err))).is_err() {
        warn!("connection failure callback panicked");
    }
}

/// A connected TCP client.
///
/// Dropping the client closes its connection urgently.
pub struct Client {
    selector: Arc<dyn Selector>,
    conn: Arc<Connection>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Client {
    /// Shorthand for [`ClientBuilder::new`].
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// The client's connection.
    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    /// The backend in use, after fallback.
    pub fn backend(&self) -> Backend {
        self.selector.kind()
    }

    /// Closes once queued writes are sent and waits for the loop thread.
    ///
    /// Called from a callback, the close is only requested.
    pub fn close(&self) {
        self.conn.close();
        self.selector.close(false);
        self.join();
    }

    /// Closes now, discarding queued writes.
    pub fn close_urgent(&self) {
        self.selector.close(true);
        self.conn.close_urgent();
        self.join();
    }

    /// Waits until the connection is closed and the loop thread exited.
    pub fn join(&self) {
        if selector::on_selector_thread() {
            return;
        }

        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.close_urgent();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::net::TcpListener;

    #[test]
    fn port_zero_is_rejected() {
        let result = Client::builder().connect("127.0.0.1:0");
        assert!(matches!(result, Err(Error::InvalidPort)));
    }

    #[test]
    fn refused_connection_fires_failure_callbacks() {
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };

        let (tx, rx) = std::sync::mpsc::channel();
        let failed = tx.clone();
        let result = Client::builder()
            .on_connection_failed(move |_| {
                let _ = failed.send("failed");
            })
            .on_exception(move |_| {
                let _ = tx.send("exception");
            })
            .connect_timeout(addr, Duration::from_secs(2));

        assert!(result.is_err());
        assert_eq!(rx.try_recv().unwrap(), "failed");
        assert_eq!(rx.try_recv().unwrap(), "exception");
    }
}
