//! Read engine.
//!
//! Bytes read from the socket land in the connection's [`ReadBuffer`]
//! and are handed to pending read requests strictly in FIFO order. A
//! request is served only once its full length is buffered.
//!
//! Handlers run with the buffer detached from the shared state, so a
//! handler may register new requests (or close the connection) without
//! touching the bytes it is looking at. Requests registered from inside
//! a handler are queued aside and spliced in at the front once it
//! returns.

use super::{CLOSED, Connection, OPEN};
use crate::buffer::{BufferPool, ReadBuffer};
use crate::error::{DisconnectReason, Error, Result};

use parking_lot::ReentrantMutexGuard;
use tracing::{trace, warn};

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io::{self, Read};
use std::mem;
use std::sync::atomic::Ordering;

/// What a repeating read handler wants next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadFlow {
    /// Serve the same request (same length) again.
    Continue,
    /// Drop the request.
    Done,
}

type Handler = Box<dyn FnMut(&Connection, &[u8]) -> ReadFlow + Send>;

pub(crate) struct ReadRequest {
    length: usize,
    handler: Handler,
}

pub(crate) struct ReadState {
    buffer: ReadBuffer,
    requests: VecDeque<ReadRequest>,
    /// Requests registered while a handler runs.
    deferred: Vec<ReadRequest>,
    draining: bool,
    /// The connection closed while the buffer was detached.
    release_pending: bool,
}

impl ReadState {
    pub(crate) fn new(buffer: ReadBuffer) -> Self {
        Self {
            buffer,
            requests: VecDeque::new(),
            deferred: Vec::new(),
            draining: false,
            release_pending: false,
        }
    }

    pub(crate) fn release(&mut self, pool: &BufferPool) {
        self.requests.clear();
        self.deferred.clear();

        if self.draining {
            self.release_pending = true;
        } else {
            self.buffer.release(pool);
        }
    }
}

type ReaderGuard<'a> = ReentrantMutexGuard<'a, RefCell<ReadState>>;

impl Connection {
    /// Registers a request for exactly `length` bytes.
    ///
    /// `handler` runs once with a slice of exactly `length` bytes, which
    /// it must not retain. If enough bytes are already buffered and no
    /// other request is pending it runs before this call returns.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidLength`] if `length == 0`,
    /// - [`Error::Closed`] if the connection is closing or closed,
    /// - [`Error::RequestTooLarge`] if `length` exceeds the buffer
    ///   capacity; the exception callback observes it as well.
    pub fn add_request(
        &self,
        length: usize,
        handler: impl FnOnce(&Connection, &[u8]) + Send + 'static,
    ) -> Result<()> {
        let mut handler = Some(handler);
        self.add_request_while(length, move |conn, bytes| {
            if let Some(handler) = handler.take() {
                handler(conn, bytes);
            }
            ReadFlow::Done
        })
    }

    /// Registers a repeating request for `length` bytes.
    ///
    /// The handler is served again, with the same length and ahead of
    /// requests queued after it, for as long as it returns
    /// [`ReadFlow::Continue`].
    pub fn add_request_while(
        &self,
        length: usize,
        handler: impl FnMut(&Connection, &[u8]) -> ReadFlow + Send + 'static,
    ) -> Result<()> {
        if length == 0 {
            return Err(Error::InvalidLength);
        }
        if self.state.load(Ordering::Acquire) != OPEN {
            return Err(Error::Closed);
        }
        if length > self.capacity {
            let err = Error::RequestTooLarge {
                requested: length,
                capacity: self.capacity,
            };
            self.notify_exception(&err);
            return Err(err);
        }

        let request = ReadRequest {
            length,
            handler: Box::new(handler),
        };

        let reader = self.reader.lock();
        {
            let mut state = reader.borrow_mut();
            if state.draining {
                state.deferred.push(request);
                return Ok(());
            }
            state.requests.push_back(request);
        }

        self.drain(&reader);
        self.settle(&reader);
        Ok(())
    }

    /// Number of requests waiting for bytes.
    pub fn pending_requests(&self) -> usize {
        let reader = self.reader.lock();
        let state = reader.borrow();
        state.requests.len() + state.deferred.len()
    }

    /// Reads from the socket until it would block.
    pub(crate) fn on_readable(&self) {
        self.fill_from(|spare| match self.socket.read().as_ref() {
            Some(mut socket) => socket.read(spare),
            None => Err(io::ErrorKind::NotConnected.into()),
        });
    }

    /// Feeds bytes that arrived through a completion.
    #[cfg_attr(not(windows), allow(dead_code))]
    pub(crate) fn ingest(&self, mut data: &[u8]) {
        self.fill_from(|spare| {
            if data.is_empty() {
                return Err(io::ErrorKind::WouldBlock.into());
            }

            let n = spare.len().min(data.len());
            spare[..n].copy_from_slice(&data[..n]);
            data = &data[n..];
            Ok(n)
        });
    }

    /// Pulls bytes from `source` into the read buffer, serving requests
    /// after every chunk, until `source` would block.
    ///
    /// `Ok(0)` from `source` is end-of-stream.
    pub(crate) fn fill_from(&self, mut source: impl FnMut(&mut [u8]) -> io::Result<usize>) {
        let reader = self.reader.lock();

        loop {
            let state = self.state.load(Ordering::Acquire);
            if state == CLOSED {
                break;
            }

            let filled = {
                let mut st = reader.borrow_mut();
                if st.draining {
                    break;
                }
                if state != OPEN {
                    // Closing: keep the socket drained but drop the bytes.
                    st.buffer.clear();
                }
                if st.buffer.spare() == 0 {
                    st.buffer.compact();
                }
                if st.buffer.spare() == 0 {
                    None
                } else {
                    Some(source(st.buffer.spare_mut()).inspect(|&n| st.buffer.commit(n)))
                }
            };

            let Some(result) = filled else {
                self.overflow(&reader);
                continue;
            };

            match result {
                Ok(0) => {
                    trace!(token = self.token, "end of stream");
                    self.shutdown(DisconnectReason::RemoteClose);
                    break;
                }
                Ok(n) => {
                    trace!(token = self.token, bytes = n, "read");
                    if state == OPEN {
                        self.deliver_chunk(&reader, n);
                        self.drain(&reader);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    self.fail(e);
                    break;
                }
            }
        }

        self.settle(&reader);
    }

    /// Hands the last `n` bytes read to the read callback.
    fn deliver_chunk(&self, reader: &ReaderGuard<'_>, n: usize) {
        let Some(cb) = self.callbacks.read() else {
            return;
        };

        let chunk = {
            let st = reader.borrow();
            let unread = st.buffer.unread();
            unread[unread.len() - n..].to_vec()
        };
        self.guarded("on_read", || cb(self, &chunk));
    }

    /// Buffer is full and the head request is still unsatisfied.
    fn overflow(&self, reader: &ReaderGuard<'_>) {
        let full = reader.borrow().buffer.unread().to_vec();

        match self.callbacks.overflow() {
            Some(cb) => {
                self.guarded("on_buffer_overflow", || cb(self, &full));
            }
            None => warn!(
                token = self.token,
                bytes = full.len(),
                "read buffer overflow, discarding"
            ),
        }

        reader.borrow_mut().buffer.clear();
    }

    /// Serves queued requests while enough bytes are buffered.
    fn drain(&self, reader: &ReaderGuard<'_>) {
        loop {
            if self.state.load(Ordering::Acquire) != OPEN {
                break;
            }

            let (mut request, buffer) = {
                let mut st = reader.borrow_mut();
                if st.draining {
                    return;
                }

                let ready = st
                    .requests
                    .front()
                    .is_some_and(|r| r.length <= st.buffer.available());
                if !ready {
                    break;
                }
                let Some(request) = st.requests.pop_front() else {
                    break;
                };

                st.draining = true;
                (request, mem::take(&mut st.buffer))
            };

            let length = request.length;
            let flow = self.guarded("read handler", || {
                (request.handler)(self, &buffer.unread()[..length])
            });

            let mut buffer = buffer;
            buffer.consume(length);

            let mut st = reader.borrow_mut();
            st.draining = false;

            if flow == Some(ReadFlow::Continue) && !st.release_pending {
                st.requests.push_front(request);
            }
            for nested in mem::take(&mut st.deferred).into_iter().rev() {
                st.requests.push_front(nested);
            }

            if st.release_pending {
                st.release_pending = false;
                st.requests.clear();
                buffer.release(&self.pool);
            }
            st.buffer = buffer;
        }

        reader.borrow_mut().buffer.compact();
    }

    /// Cleans up after a drain pass if the connection changed state
    /// while this thread held the reader.
    fn settle(&self, reader: &ReaderGuard<'_>) {
        match self.state.load(Ordering::Acquire) {
            OPEN => {}
            CLOSED => self.release_reader(reader),
            _ => {
                let mut st = reader.borrow_mut();
                st.requests.clear();
                st.deferred.clear();
            }
        }
    }

    pub(super) fn release_reader(&self, reader: &ReaderGuard<'_>) {
        if let Ok(mut st) = reader.try_borrow_mut() {
            st.release(&self.pool);
        }
    }

    /// Drops pending requests without running them.
    pub(super) fn cancel_reads(&self) {
        if let Some(reader) = self.reader.try_lock() {
            self.settle(&reader);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::socket_pair;
    use super::*;
    use crate::buffer::BufferPool;
    use crate::config::Config;

    use parking_lot::Mutex;

    use std::io::Write;
    use std::net::TcpStream;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::Duration;

    fn connection(buffer_size: usize) -> (Arc<Connection>, TcpStream) {
        let (local, remote) = socket_pair();
        let conn = Connection::detached(local, &Config::new().buffer_size(buffer_size));
        (conn, remote)
    }

    /// Polls the socket until `done` holds or two seconds pass.
    fn pump(conn: &Connection, done: impl Fn() -> bool) {
        for _ in 0..200 {
            conn.on_readable();
            if done() {
                return;
            }
            thread::sleep(Duration::from_millis(10));
        }
        panic!("condition not reached");
    }

    #[test]
    fn requests_are_served_in_order_under_chunking() {
        let (conn, mut remote) = connection(64);
        let seen = Arc::new(Mutex::new(Vec::new()));

        for len in [3usize, 5, 2] {
            let seen = seen.clone();
            conn.add_request(len, move |_, bytes| seen.lock().push(bytes.to_vec()))
                .unwrap();
        }

        for chunk in [&b"ab"[..], b"cdef", b"gh", b"ij"] {
            remote.write_all(chunk).unwrap();
            thread::sleep(Duration::from_millis(5));
            conn.on_readable();
        }

        pump(&conn, || seen.lock().len() == 3);
        assert_eq!(
            *seen.lock(),
            vec![b"abc".to_vec(), b"defgh".to_vec(), b"ij".to_vec()]
        );
    }

    #[test]
    fn buffered_bytes_serve_a_late_request_immediately() {
        let (conn, mut remote) = connection(64);
        remote.write_all(b"hello").unwrap();
        pump(&conn, || reader_available(&conn) == 5);

        let served = Arc::new(AtomicUsize::new(0));
        let s = served.clone();
        conn.add_request(5, move |_, bytes| {
            assert_eq!(bytes, b"hello");
            s.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        assert_eq!(served.load(Ordering::SeqCst), 1);
    }

    fn reader_available(conn: &Connection) -> usize {
        conn.reader.lock().borrow().buffer.available()
    }

    #[test]
    fn nested_requests_run_before_queued_ones() {
        let (conn, mut remote) = connection(64);
        let order = Arc::new(Mutex::new(Vec::new()));

        let o = order.clone();
        conn.add_request(2, move |conn, header| {
            o.lock().push(header.to_vec());
            let o = o.clone();
            conn.add_request(3, move |_, body| o.lock().push(body.to_vec()))
                .unwrap();
        })
        .unwrap();

        let o = order.clone();
        conn.add_request(1, move |_, tail| o.lock().push(tail.to_vec()))
            .unwrap();

        remote.write_all(b"hdbodz").unwrap();
        pump(&conn, || order.lock().len() == 3);

        assert_eq!(
            *order.lock(),
            vec![b"hd".to_vec(), b"bod".to_vec(), b"z".to_vec()]
        );
    }

    #[test]
    fn repeating_request_is_served_until_done() {
        let (conn, mut remote) = connection(64);
        let frames = Arc::new(Mutex::new(Vec::new()));

        let f = frames.clone();
        conn.add_request_while(2, move |_, bytes| {
            f.lock().push(bytes.to_vec());
            if bytes == b"zz" {
                ReadFlow::Done
            } else {
                ReadFlow::Continue
            }
        })
        .unwrap();

        remote.write_all(b"aabbzzcc").unwrap();
        pump(&conn, || frames.lock().len() == 3);
        thread::sleep(Duration::from_millis(20));
        conn.on_readable();

        assert_eq!(frames.lock().len(), 3);
        assert_eq!(conn.pending_requests(), 0);
        assert_eq!(reader_available(&conn), 2);
    }

    #[test]
    fn invalid_requests_are_rejected() {
        let (conn, _remote) = connection(16);
        let exceptions = Arc::new(AtomicUsize::new(0));
        let e = exceptions.clone();
        conn.on_exception(move |_, err| {
            assert!(matches!(err, Error::RequestTooLarge { requested: 17, capacity: 16 }));
            e.fetch_add(1, Ordering::SeqCst);
        });

        assert!(matches!(conn.add_request(0, |_, _| {}), Err(Error::InvalidLength)));
        assert!(matches!(
            conn.add_request(17, |_, _| {}),
            Err(Error::RequestTooLarge { .. })
        ));
        assert_eq!(exceptions.load(Ordering::SeqCst), 1);
        assert_eq!(conn.pending_requests(), 0);
        assert!(!conn.is_closed());

        conn.close();
        assert!(matches!(conn.add_request(4, |_, _| {}), Err(Error::Closed)));
    }

    #[test]
    fn overflow_sees_full_buffer_then_resets() {
        let (conn, mut remote) = connection(16);
        let overflows = Arc::new(Mutex::new(Vec::new()));

        let o = overflows.clone();
        conn.on_buffer_overflow(move |_, bytes| o.lock().push(bytes.to_vec()));

        remote.write_all(&[7u8; 32]).unwrap();
        pump(&conn, || !overflows.lock().is_empty());

        let first = overflows.lock()[0].clone();
        assert_eq!(first, vec![7u8; 16]);
        assert!(!conn.is_closed());
    }

    #[test]
    fn end_of_stream_is_remote_close() {
        let (conn, remote) = connection(16);
        let reason = Arc::new(Mutex::new(None));
        let r = reason.clone();
        conn.on_disconnect(move |_, why| *r.lock() = Some(why));

        drop(remote);
        pump(&conn, || conn.is_closed());
        assert_eq!(*reason.lock(), Some(DisconnectReason::RemoteClose));
    }

    #[test]
    fn panicking_handler_closes_with_exception() {
        let (conn, mut remote) = connection(16);
        let reported = Arc::new(AtomicUsize::new(0));
        let r = reported.clone();
        conn.on_exception(move |_, err| {
            assert!(matches!(err, Error::CallbackPanicked(_)));
            r.fetch_add(1, Ordering::SeqCst);
        });

        conn.add_request(1, |_, _| panic!("handler failed")).unwrap();
        remote.write_all(b"x").unwrap();
        pump(&conn, || conn.is_closed());

        assert_eq!(reported.load(Ordering::SeqCst), 1);
        assert_eq!(
            conn.disconnect_reason(),
            Some(DisconnectReason::ExceptionClose)
        );
    }

    #[test]
    fn close_inside_handler_releases_buffer() {
        let pool = Arc::new(BufferPool::new());
        let (local, mut remote) = socket_pair();
        let conn = Connection::detached(local, &Config::new().buffer_size(32).pool(pool.clone()));

        conn.add_request(1, |conn, _| conn.close_urgent()).unwrap();
        remote.write_all(b"x").unwrap();
        pump(&conn, || conn.is_closed());

        assert_eq!(pool.stats().outstanding, 0);
    }

    #[test]
    fn ingest_feeds_requests() {
        let (conn, _remote) = connection(8);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        conn.add_request_while(4, move |_, bytes| {
            s.lock().push(bytes.to_vec());
            ReadFlow::Continue
        })
        .unwrap();

        conn.ingest(b"0123456789ab");
        assert_eq!(
            *seen.lock(),
            vec![b"0123".to_vec(), b"4567".to_vec(), b"89ab".to_vec()]
        );
    }

    #[test]
    fn unhandled_overflow_is_logged_as_warning() {
        use tracing::{Event, Level, Subscriber};
        use tracing_subscriber::Layer;
        use tracing_subscriber::layer::{Context, SubscriberExt};

        struct Warnings(Arc<Mutex<Vec<String>>>);

        impl<S: Subscriber> Layer<S> for Warnings {
            fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
                if *event.metadata().level() == Level::WARN {
                    self.0.lock().push(event.metadata().target().to_owned());
                }
            }
        }

        let warnings = Arc::new(Mutex::new(Vec::new()));
        let subscriber = tracing_subscriber::registry().with(Warnings(warnings.clone()));

        let (conn, _remote) = connection(8);
        tracing::subscriber::with_default(subscriber, || conn.ingest(b"0123456789"));

        assert_eq!(*warnings.lock(), vec!["fluentis::connection::read".to_owned()]);
        assert!(!conn.is_closed());
    }
}
