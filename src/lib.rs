//! Non-blocking TCP client/server transport.
//!
//! A [`Server`] or [`Client`] drives its sockets through a selector
//! backend chosen by [`Config::backend`]: the native readiness poller
//! (epoll, kqueue) or completion port (IOCP), a portable `poll(2)` /
//! `WSAPoll` loop, or one thread per connection. Every backend feeds the
//! same per-connection engines:
//!
//! - reads accumulate in a pooled buffer and are handed out through
//!   length-framed requests ([`Connection::add_request`]), served in
//!   registration order as bytes arrive,
//! - writes go to the socket immediately and whatever it does not accept
//!   is queued in order until it becomes writable again.
//!
//! Callbacks run on selector threads; a panicking callback only closes
//! its own connection.
//!
//! ```rust,ignore
//! let server = Server::builder()
//!     .on_connection(|conn| {
//!         conn.on_read(|conn, bytes| {
//!             let _ = conn.write(bytes.to_vec());
//!         });
//!     })
//!     .bind("127.0.0.1:0")?;
//! ```

#![warn(missing_docs)]

mod buffer;
mod client;
mod config;
mod connection;
mod error;
mod selector;
mod server;
mod sys;
mod utils;

pub use buffer::{BufferPool, DEFAULT_CEILING, DEFAULT_SLACK, PoolStats, PooledBuffer};
pub use client::{Client, ClientBuilder};
pub use config::{Backend, Config};
pub use connection::{Connection, ConnectionState, ReadFlow};
pub use error::{DisconnectReason, Error, Result};
pub use server::{Server, ServerBuilder};
