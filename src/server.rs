//! TCP server.

use crate::config::{Backend, Config};
use crate::connection::Connection;
use crate::error::{DisconnectReason, Error, Result};
use crate::selector::{self, CloseHook, ConnectionHook, ExceptionHook, Hooks, Selector};
use crate::sys;

use parking_lot::Mutex;
use tracing::{debug, info};

use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::thread::JoinHandle;

type BindHook = Box<dyn FnOnce(SocketAddr) + Send>;

/// Builder for a [`Server`].
///
/// # Examples
///
/// ```rust,ignore
/// let server = Server::builder()
///     .on_connection(|conn| {
///         conn.add_request(5, |conn, bytes| {
///             let _ = conn.write(bytes.to_vec());
///         })
///         .unwrap();
///     })
///     .bind("127.0.0.1:7000")?;
/// ```
pub struct ServerBuilder {
    config: Config,
    on_bind: Option<BindHook>,
    on_connection: Option<ConnectionHook>,
    on_exception: Option<ExceptionHook>,
    on_close: Option<CloseHook>,
}

impl ServerBuilder {
    /// Creates a builder with the default [`Config`] and no callbacks.
    pub fn new() -> Self {
        Self {
            config: Config::new(),
            on_bind: None,
            on_connection: None,
            on_exception: None,
            on_close: None,
        }
    }

    /// Replaces the transport configuration.
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Runs once the listening socket is bound, with its local address.
    pub fn on_bind(mut self, cb: impl FnOnce(SocketAddr) + Send + 'static) -> Self {
        self.on_bind = Some(Box::new(cb));
        self
    }

    /// Runs for every accepted connection, before any of its bytes are
    /// dispatched. Required.
    pub fn on_connection(
        mut self,
        cb: impl Fn(&Arc<Connection>) + Send + Sync + 'static,
    ) -> Self {
        self.on_connection = Some(Arc::new(cb));
        self
    }

    /// Receives errors that belong to no single connection (accept and
    /// backend failures).
    pub fn on_exception(mut self, cb: impl Fn(&Error) + Send + Sync + 'static) -> Self {
        self.on_exception = Some(Arc::new(cb));
        self
    }

    /// Runs once after the server stopped.
    pub fn on_close(mut self, cb: impl FnOnce(DisconnectReason) + Send + 'static) -> Self {
        self.on_close = Some(Box::new(cb));
        self
    }

    /// Binds `addr` and starts accepting on a dedicated loop thread.
    ///
    /// Port `0` binds an ephemeral port; see [`Server::local_addr`].
    ///
    /// # Errors
    ///
    /// [`Error::MissingCallback`] without an `on_connection` callback,
    /// [`Error::Io`] if the address cannot be resolved or bound.
    pub fn bind(self, addr: impl ToSocketAddrs) -> Result<Server> {
        let Some(on_connection) = self.on_connection else {
            return Err(Error::MissingCallback("on_connection"));
        };

        let addr = resolve(addr)?;
        let listener = sys::sys_listen(&addr, self.config.buffer_size)?;
        let local_addr = listener.local_addr()?;

        let hooks = Hooks {
            on_connection: Some(on_connection),
            on_exception: self.on_exception,
            on_close: Mutex::new(self.on_close),
            stop_when_idle: false,
        };

        let selector = selector::open(&self.config, Arc::new(hooks))?;
        selector.listen(listener)?;

        let handle = selector::spawn(selector.clone(), "fluentis-server")?;
        info!(%local_addr, backend = ?selector.kind(), "server bound");

        if let Some(cb) = self.on_bind {
            cb(local_addr);
        }

        Ok(Server {
            selector,
            local_addr,
            handle: Mutex::new(Some(handle)),
        })
    }
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A bound TCP server.
///
/// Dropping the server closes it urgently.
pub struct Server {
    selector: Arc<dyn Selector>,
    local_addr: SocketAddr,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Server {
    /// Shorthand for [`ServerBuilder::new`].
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    /// The address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The backend in use, after fallback.
    pub fn backend(&self) -> Backend {
        self.selector.kind()
    }

    /// Snapshot of the live connections.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.selector.connections()
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.selector.connection_count()
    }

    /// Stops accepting, closes every connection once its queued writes
    /// are sent (bounded by [`Config::linger`]) and waits for the loop to
    /// exit.
    ///
    /// Called from a callback, the close is only requested.
    pub fn close(&self) {
        debug!(local_addr = %self.local_addr, "closing server");
        self.selector.close(false);
        self.join();
    }

    /// Like [`close`](Self::close), discarding queued writes.
    pub fn close_urgent(&self) {
        debug!(local_addr = %self.local_addr, "closing server urgently");
        self.selector.close(true);
        self.join();
    }

    /// Waits for the loop thread to exit.
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

impl Drop for Server {
    fn drop(&mut self) {
        self.close_urgent();
    }
}

/// Resolves `addr` to its first socket address.
pub(crate) fn resolve(addr: impl ToSocketAddrs) -> Result<SocketAddr> {
    addr.to_socket_addrs()?.next().ok_or_else(|| {
        Error::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            "address resolved to nothing",
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_requires_connection_callback() {
        let result = Server::builder().bind("127.0.0.1:0");
        assert!(matches!(result, Err(Error::MissingCallback("on_connection"))));
    }

    #[test]
    fn binds_ephemeral_port() {
        let (tx, rx) = std::sync::mpsc::channel();
        let server = Server::builder()
            .on_connection(|_| {})
            .on_bind(move |addr| {
                let _ = tx.send(addr);
            })
            .bind("127.0.0.1:0")
            .unwrap();

        assert_ne!(server.local_addr().port(), 0);
        assert_eq!(rx.try_recv().unwrap(), server.local_addr());
        server.close();
    }
}
