//! Windows I/O completion port backend.
//!
//! Every overlapped operation (accept, receive, send) is stored in a
//! [`SlotTable`] and its slot index travels inside the `OVERLAPPED`
//! wrapper handed to the kernel. A worker dequeuing the completion
//! removes the operation from the table, so each one is consumed exactly
//! once; the buffers it owns stay alive until then.
//!
//! The loop thread only coordinates: it spawns the workers, waits for a
//! close request, cancels what is still in flight and joins the workers.

use super::{Hooks, Phase, Registry, Selector, enter_selector_thread};
use crate::buffer::PooledBuffer;
use crate::config::{Backend, Config};
use crate::connection::{Connection, panic_message};
use crate::error::{DisconnectReason, Error};
use crate::sys::{self, RawFd};
use crate::utils::SlotTable;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};

use windows_sys::Win32::Foundation::{
    CloseHandle, ERROR_OPERATION_ABORTED, HANDLE, INVALID_HANDLE_VALUE,
};
use windows_sys::Win32::Networking::WinSock::{
    AF_INET, AF_INET6, AcceptEx, SO_UPDATE_ACCEPT_CONTEXT, SOCKADDR_STORAGE, SOCKET,
    SOCKET_ERROR, SOL_SOCKET, WSA_IO_PENDING, WSABUF, WSAGetLastError, WSARecv, WSASend,
    setsockopt,
};
use windows_sys::Win32::System::IO::{
    CancelIoEx, CreateIoCompletionPort, GetQueuedCompletionStatus, OVERLAPPED,
    PostQueuedCompletionStatus,
};
use windows_sys::Win32::System::Threading::INFINITE;

use std::io;
use std::mem;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::windows::io::FromRawSocket;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle, Thread};
use std::time::{Duration, Instant};

/// Completion key of the packets that stop a worker.
const EXIT_KEY: usize = usize::MAX;

/// Accepts kept posted on every listener.
const ACCEPTS_PER_LISTENER: usize = 4;

/// Space `AcceptEx` needs for one address.
const ADDRESS_LEN: usize = mem::size_of::<SOCKADDR_STORAGE>() + 16;

/// How often the coordinator re-checks its stop conditions.
const COORDINATOR_TICK: Duration = Duration::from_millis(50);

/// How long teardown waits for cancelled operations to complete.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

struct Port(HANDLE);

// The handle is an opaque kernel object usable from any thread.
unsafe impl Send for Port {}
unsafe impl Sync for Port {}

impl Port {
    fn new(threads: usize) -> io::Result<Self> {
        let handle = unsafe {
            CreateIoCompletionPort(INVALID_HANDLE_VALUE, ptr::null_mut(), 0, threads as u32)
        };
        if handle.is_null() {
            return Err(io::Error::last_os_error());
        }
        Ok(Self(handle))
    }

    fn associate(&self, socket: RawFd) -> io::Result<()> {
        let handle = unsafe { CreateIoCompletionPort(socket as usize as HANDLE, self.0, 0, 0) };
        if handle.is_null() {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn post(&self, key: usize, overlapped: *const OVERLAPPED) -> io::Result<()> {
        if unsafe { PostQueuedCompletionStatus(self.0, 0, key, overlapped) } == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Drop for Port {
    fn drop(&mut self) {
        unsafe {
            CloseHandle(self.0);
        }
    }
}

/// `OVERLAPPED` extended with the slot of the owning operation.
#[repr(C)]
struct Overlapped {
    raw: OVERLAPPED,
    token: usize,
}

impl Overlapped {
    fn boxed(token: usize) -> Box<Self> {
        Box::new(Self {
            // SAFETY: `OVERLAPPED` is plain data; all-zero is its initial state.
            raw: unsafe { mem::zeroed() },
            token,
        })
    }

    fn as_raw(&mut self) -> *mut OVERLAPPED {
        &mut self.raw
    }
}

enum Operation {
    Accept {
        listener: Arc<TcpListener>,
        socket: RawFd,
        _addresses: Box<[u8; 2 * ADDRESS_LEN]>,
        _overlapped: Box<Overlapped>,
    },
    Recv {
        conn: Arc<Connection>,
        staging: PooledBuffer,
        _overlapped: Box<Overlapped>,
    },
    Send {
        conn: Arc<Connection>,
        _data: Bytes,
        _overlapped: Box<Overlapped>,
    },
    /// A send that could not be posted; failed outside the write lock.
    Failed {
        conn: Arc<Connection>,
        error: io::Error,
        _overlapped: Box<Overlapped>,
    },
}

// The raw pointers inside `OVERLAPPED` are only touched by the kernel
// while the operation is in flight, and by the single worker that
// dequeues it afterwards.
unsafe impl Send for Operation {}
unsafe impl Sync for Operation {}

pub(crate) struct IocpSelector {
    port: Port,
    config: Config,
    hooks: Arc<Hooks>,
    conns: SlotTable<Arc<Connection>>,
    ops: SlotTable<Operation>,
    listeners: Mutex<Vec<Arc<TcpListener>>>,
    runner: Mutex<Option<Thread>>,
    phase: Phase,
    this: Weak<Self>,
}

impl IocpSelector {
    pub(crate) fn new(config: &Config, hooks: Arc<Hooks>) -> io::Result<Arc<Self>> {
        sys::ensure_winsock();
        let port = Port::new(config.resolved_workers())?;

        Ok(Arc::new_cyclic(|this| Self {
            port,
            config: config.clone(),
            hooks,
            conns: SlotTable::new(64),
            ops: SlotTable::new(256),
            listeners: Mutex::new(Vec::new()),
            runner: Mutex::new(None),
            phase: Phase::new(),
            this: this.clone(),
        }))
    }

    fn unpark_runner(&self) {
        if let Some(runner) = self.runner.lock().as_ref() {
            runner.unpark();
        }
    }

    fn post_accept(&self, listener: &Arc<TcpListener>) -> io::Result<()> {
        let family = match listener.local_addr()? {
            SocketAddr::V4(_) => AF_INET,
            SocketAddr::V6(_) => AF_INET6,
        };
        let socket = sys::sys_socket(family as i32)?;

        let mut overlapped = ptr::null_mut();
        let mut output = ptr::null_mut();

        let token = self.ops.insert_keyed(|token| {
            let mut ov = Overlapped::boxed(token);
            let mut addresses = Box::new([0u8; 2 * ADDRESS_LEN]);
            overlapped = ov.as_raw();
            output = addresses.as_mut_ptr();

            Operation::Accept {
                listener: listener.clone(),
                socket,
                _addresses: addresses,
                _overlapped: ov,
            }
        });

        let mut received = 0u32;
        let ok = unsafe {
            AcceptEx(
                sys::raw_listener(listener) as SOCKET,
                socket as SOCKET,
                output.cast(),
                0,
                ADDRESS_LEN as u32,
                ADDRESS_LEN as u32,
                &mut received,
                overlapped,
            )
        };

        if ok == 0 {
            let code = unsafe { WSAGetLastError() };
            if code != WSA_IO_PENDING {
                self.ops.remove(token);
                sys::sys_close(socket);
                return Err(io::Error::from_raw_os_error(code));
            }
        }

        trace!(token, "accept posted");
        Ok(())
    }

    fn post_recv(&self, conn: &Arc<Connection>, mut staging: PooledBuffer) {
        let Some(fd) = conn.raw_fd() else {
            self.config.pool.give(staging);
            return;
        };

        let buf = WSABUF {
            len: staging.capacity() as u32,
            buf: staging.as_mut_ptr(),
        };

        let mut overlapped = ptr::null_mut();
        let token = self.ops.insert_keyed(|token| {
            let mut ov = Overlapped::boxed(token);
            overlapped = ov.as_raw();

            Operation::Recv {
                conn: conn.clone(),
                staging,
                _overlapped: ov,
            }
        });

        let mut flags = 0u32;
        let rc = unsafe {
            WSARecv(
                fd as SOCKET,
                &buf,
                1,
                ptr::null_mut(),
                &mut flags,
                overlapped,
                None,
            )
        };

        if rc == SOCKET_ERROR {
            let code = unsafe { WSAGetLastError() };
            if code != WSA_IO_PENDING {
                if let Some(Operation::Recv { staging, .. }) = self.ops.remove(token) {
                    self.config.pool.give(staging);
                }
                conn.fail(io::Error::from_raw_os_error(code));
            }
        }
    }

    /// Posts an overlapped send of `data`. Runs under the connection's
    /// write lock, so a failure is only queued here.
    fn post_send(&self, conn: &Connection, data: &Bytes) {
        let Some(fd) = conn.raw_fd() else {
            return;
        };
        let Some(owner) = self.conns.get(conn.token()) else {
            return;
        };

        let buf = WSABUF {
            len: data.len().min(u32::MAX as usize) as u32,
            buf: data.as_ptr().cast_mut(),
        };

        let mut overlapped = ptr::null_mut();
        let token = self.ops.insert_keyed(|token| {
            let mut ov = Overlapped::boxed(token);
            overlapped = ov.as_raw();

            Operation::Send {
                conn: owner.clone(),
                _data: data.clone(),
                _overlapped: ov,
            }
        });

        let rc = unsafe { WSASend(fd as SOCKET, &buf, 1, ptr::null_mut(), 0, overlapped, None) };
        if rc != SOCKET_ERROR {
            return;
        }

        let code = unsafe { WSAGetLastError() };
        if code == WSA_IO_PENDING {
            return;
        }

        self.ops.remove(token);
        let mut failed = ptr::null_mut();
        let token = self.ops.insert_keyed(|token| {
            let mut ov = Overlapped::boxed(token);
            failed = ov.as_raw();

            Operation::Failed {
                conn: owner,
                error: io::Error::from_raw_os_error(code),
                _overlapped: ov,
            }
        });

        if let Err(err) = self.port.post(0, failed) {
            warn!(?err, token, "failed to queue send failure");
            self.ops.remove(token);
        }
    }

    fn worker(&self, id: usize) {
        enter_selector_thread();
        trace!(worker = id, "completion worker started");

        loop {
            let mut bytes = 0u32;
            let mut key = 0usize;
            let mut overlapped: *mut OVERLAPPED = ptr::null_mut();

            let ok = unsafe {
                GetQueuedCompletionStatus(
                    self.port.0,
                    &mut bytes,
                    &mut key,
                    &mut overlapped,
                    INFINITE,
                )
            } != 0;
            let failure = (!ok).then(io::Error::last_os_error);

            if overlapped.is_null() {
                if key == EXIT_KEY && ok {
                    break;
                }
                if let Some(err) = failure {
                    error!(?err, "completion port wait failed");
                    self.hooks.exception(&Error::Io(err));
                    break;
                }
                continue;
            }

            // SAFETY: every OVERLAPPED handed to the kernel is the first
            // field of an `Overlapped` still owned by `ops`.
            let token = unsafe { (*overlapped.cast::<Overlapped>()).token };
            let Some(op) = self.ops.remove(token) else {
                warn!(token, "completion for unknown operation");
                continue;
            };

            let result = match failure {
                None => Ok(bytes as usize),
                Some(err) => Err(err),
            };

            let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.complete(op, result)));
            if let Err(payload) = outcome {
                warn!(worker = id, panic = %panic_message(payload.as_ref()), "completion panicked");
            }
        }

        trace!(worker = id, "completion worker exiting");
    }

    fn complete(&self, op: Operation, result: io::Result<usize>) {
        match op {
            Operation::Accept {
                listener, socket, ..
            } => self.accepted(&listener, socket, result),
            Operation::Recv { conn, staging, .. } => self.received(&conn, staging, result),
            Operation::Send { conn, .. } => match result {
                Ok(n) => {
                    trace!(token = conn.token(), bytes = n, "send completed");
                    conn.complete_write(n);
                }
                Err(err) if is_aborted(&err) => {}
                Err(err) => conn.fail(err),
            },
            Operation::Failed { conn, error, .. } => conn.fail(error),
        }
    }

    fn accepted(&self, listener: &Arc<TcpListener>, socket: RawFd, result: io::Result<usize>) {
        match result {
            Ok(_) if self.phase.is_running() => {
                let listen_socket = sys::raw_listener(listener) as SOCKET;
                unsafe {
                    setsockopt(
                        socket as SOCKET,
                        SOL_SOCKET,
                        SO_UPDATE_ACCEPT_CONTEXT,
                        (&listen_socket as *const SOCKET).cast(),
                        mem::size_of::<SOCKET>() as i32,
                    );
                }

                // SAFETY: AcceptEx connected `socket`; nobody else owns it.
                let stream = unsafe { TcpStream::from_raw_socket(socket) };
                let peer = stream.peer_addr().ok();
                debug!(?peer, "accepted connection");

                if let Err(err) = self.register(stream) {
                    warn!(?err, ?peer, "failed to register accepted connection");
                    self.hooks.exception(&Error::Io(err));
                }
            }
            Ok(_) => {
                sys::sys_close(socket);
                return;
            }
            Err(err) => {
                sys::sys_close(socket);
                if is_aborted(&err) || !self.phase.is_running() {
                    return;
                }
                warn!(?err, "accept failed");
                self.hooks.exception(&Error::Io(err));
            }
        }

        if self.phase.is_running()
            && let Err(err) = self.post_accept(listener)
        {
            warn!(?err, "failed to post accept");
            self.hooks.exception(&Error::Io(err));
        }
    }

    fn received(&self, conn: &Arc<Connection>, staging: PooledBuffer, result: io::Result<usize>) {
        match result {
            Ok(0) => {
                trace!(token = conn.token(), "end of stream");
                self.config.pool.give(staging);
                conn.shutdown(DisconnectReason::RemoteClose);
            }
            Ok(n) => {
                trace!(token = conn.token(), bytes = n, "receive completed");
                conn.ingest(&staging[..n]);

                if conn.is_closed() {
                    self.config.pool.give(staging);
                } else {
                    self.post_recv(conn, staging);
                }
            }
            Err(err) => {
                self.config.pool.give(staging);
                if !is_aborted(&err) {
                    conn.fail(err);
                }
            }
        }
    }

    fn cancel_listeners(&self) {
        for listener in self.listeners.lock().drain(..) {
            let handle = sys::raw_listener(&listener) as usize as HANDLE;
            unsafe {
                CancelIoEx(handle, ptr::null());
            }
        }
    }

    fn teardown(&self, workers: Vec<JoinHandle<()>>) {
        for conn in self.connections() {
            conn.close_urgent();
        }
        self.cancel_listeners();

        let deadline = Instant::now() + DRAIN_TIMEOUT;
        while !self.ops.is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }

        for _ in 0..workers.len() {
            if let Err(err) = self.port.post(EXIT_KEY, ptr::null()) {
                warn!(?err, "failed to post worker exit");
            }
        }
        for handle in workers {
            let _ = handle.join();
        }

        // The kernel may still own their buffers.
        let leaked = self.ops.drain();
        if !leaked.is_empty() {
            warn!(count = leaked.len(), "leaking operations still in flight");
            for op in leaked {
                mem::forget(op);
            }
        }

        debug!("completion port selector stopped");
        self.hooks.closed(DisconnectReason::User);
    }
}

fn is_aborted(err: &io::Error) -> bool {
    err.raw_os_error() == Some(ERROR_OPERATION_ABORTED as i32)
}

impl Registry for IocpSelector {
    fn set_writable(&self, conn: &Connection, pending: Option<&Bytes>) {
        if let Some(data) = pending {
            self.post_send(conn, data);
        }
    }

    fn deregister(&self, conn: &Connection) {
        let owned = self
            .conns
            .get(conn.token())
            .is_some_and(|c| ptr::eq(Arc::as_ptr(&c), conn));

        if owned {
            self.conns.remove(conn.token());
        }

        if !self.phase.is_running() || self.hooks.stop_when_idle {
            self.unpark_runner();
        }
    }
}

impl Selector for IocpSelector {
    fn kind(&self) -> Backend {
        Backend::Native
    }

    fn listen(&self, listener: TcpListener) -> io::Result<()> {
        self.port.associate(sys::raw_listener(&listener))?;

        let listener = Arc::new(listener);
        for _ in 0..ACCEPTS_PER_LISTENER {
            self.post_accept(&listener)?;
        }
        self.listeners.lock().push(listener);

        debug!("listening on completion port");
        Ok(())
    }

    fn register(&self, stream: TcpStream) -> io::Result<Arc<Connection>> {
        sys::configure_stream(&stream, self.config.buffer_size, self.config.nodelay)?;
        self.port.associate(sys::raw_stream(&stream))?;

        let registry: Weak<dyn Registry> = self.this.clone();
        let (_, conn) = self.conns.insert_with(|token| {
            Ok::<_, io::Error>(Connection::new(token, stream, &self.config, registry))
        })?;

        debug!(token = conn.token(), peer = ?conn.peer_addr(), "connection registered");
        self.hooks.connected(&conn);

        if !conn.is_closed() {
            let staging = self.config.pool.take(self.config.buffer_size);
            self.post_recv(&conn, staging);
        }
        Ok(conn)
    }

    fn run_loop(&self) {
        enter_selector_thread();
        *self.runner.lock() = Some(thread::current());

        let mut workers = Vec::new();
        for id in 0..self.config.resolved_workers() {
            let Some(this) = self.this.upgrade() else {
                break;
            };

            let spawned = thread::Builder::new()
                .name(format!("fluentis-iocp-{id}"))
                .spawn(move || this.worker(id));

            match spawned {
                Ok(handle) => workers.push(handle),
                Err(err) => warn!(?err, "failed to spawn completion worker"),
            }
        }

        loop {
            if self.phase.should_stop(|| self.connection_count()) {
                break;
            }
            if self.hooks.stop_when_idle && self.conns.is_empty() {
                break;
            }
            if workers.is_empty() {
                error!("no completion worker running, closing selector");
                break;
            }

            let pause = self.phase.bound(Some(COORDINATOR_TICK));
            thread::park_timeout(pause.unwrap_or(COORDINATOR_TICK));
        }

        self.teardown(workers);
        self.runner.lock().take();
    }

    fn close(&self, urgent: bool) {
        if !self.phase.request(urgent, self.config.linger) {
            return;
        }

        self.cancel_listeners();
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
        self.conns
            .snapshot()
            .into_iter()
            .map(|(_, conn)| conn)
            .filter(|conn| !conn.is_closed())
            .collect()
    }
}
