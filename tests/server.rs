mod common;

use common::{BACKENDS, TIMEOUT, config, init_tracing, pattern, wait_until};

use fluentis::{Backend, Client, DisconnectReason, Error, Server};

use std::io::{Read, Write};
use std::net::{Ipv4Addr, Ipv6Addr, Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

fn connect(server: &Server) -> TcpStream {
    let stream = TcpStream::connect(server.local_addr()).expect("connect");
    stream.set_read_timeout(Some(TIMEOUT)).unwrap();
    stream.set_nodelay(true).unwrap();
    stream
}

#[test]
fn echo_round_trip() {
    init_tracing();

    for backend in BACKENDS {
        let (seen_tx, seen_rx) = mpsc::channel();
        let server = Server::builder()
            .config(config(backend))
            .on_connection(move |conn| {
                let seen = seen_tx.clone();
                conn.add_request(5, move |conn, bytes| {
                    let _ = seen.send(bytes.to_vec());
                    let _ = conn.write(bytes.to_vec());
                })
                .unwrap();
            })
            .bind("127.0.0.1:0")
            .unwrap();

        let (echo_tx, echo_rx) = mpsc::channel();
        let client = Client::builder()
            .config(config(backend))
            .on_connect(move |conn| {
                let echo = echo_tx.clone();
                conn.add_request(5, move |_, bytes| {
                    let _ = echo.send(bytes.to_vec());
                })
                .unwrap();
            })
            .connect(server.local_addr())
            .unwrap();

        client.connection().write(&b"hello"[..]).unwrap();

        assert_eq!(seen_rx.recv_timeout(TIMEOUT).unwrap(), b"hello", "{backend:?}");
        assert_eq!(echo_rx.recv_timeout(TIMEOUT).unwrap(), b"hello", "{backend:?}");

        client.close();
        server.close();
    }
}

#[test]
fn requests_are_served_in_registration_order() {
    init_tracing();

    for backend in BACKENDS {
        let (tx, rx) = mpsc::channel();
        let server = Server::builder()
            .config(config(backend))
            .on_connection(move |conn| {
                for (index, length) in [3usize, 1, 7, 5].into_iter().enumerate() {
                    let tx = tx.clone();
                    conn.add_request(length, move |_, bytes| {
                        let _ = tx.send((index, bytes.to_vec()));
                    })
                    .unwrap();
                }
            })
            .bind("127.0.0.1:0")
            .unwrap();

        let payload = pattern(16);
        let mut peer = connect(&server);
        for chunk in payload.chunks(2) {
            peer.write_all(chunk).unwrap();
            thread::sleep(Duration::from_millis(2));
        }

        let mut offset = 0;
        for (expected, length) in [3usize, 1, 7, 5].into_iter().enumerate() {
            let (index, bytes) = rx.recv_timeout(TIMEOUT).unwrap();
            assert_eq!(index, expected, "{backend:?}");
            assert_eq!(bytes, &payload[offset..offset + length], "{backend:?}");
            offset += length;
        }

        server.close_urgent();
    }
}

#[test]
fn large_write_finishes_after_peer_drains() {
    init_tracing();

    const LEN: usize = 16 * 1024 * 1024;

    for backend in BACKENDS {
        let (pending_tx, pending_rx) = mpsc::channel();
        let (done_tx, done_rx) = mpsc::channel();

        let server = Server::builder()
            .config(config(backend))
            .on_connection(move |conn| {
                let done = done_tx.clone();
                conn.write_then(pattern(LEN), move |_| {
                    let _ = done.send(());
                })
                .unwrap();
                let _ = pending_tx.send(conn.has_pending_writes());
            })
            .bind("127.0.0.1:0")
            .unwrap();

        let mut peer = connect(&server);

        assert!(pending_rx.recv_timeout(TIMEOUT).unwrap(), "{backend:?}");
        assert!(
            done_rx.recv_timeout(Duration::from_millis(200)).is_err(),
            "{backend:?}: finished before the peer read anything"
        );

        let mut received = vec![0u8; LEN];
        peer.read_exact(&mut received).unwrap();
        assert!(received == pattern(LEN), "{backend:?}: payload mismatch");

        done_rx.recv_timeout(TIMEOUT).unwrap();
        server.close();
    }
}

#[test]
fn full_buffer_is_handed_to_overflow_callback() {
    init_tracing();

    for backend in BACKENDS {
        let (tx, rx) = mpsc::channel();
        let server = Server::builder()
            .config(config(backend).buffer_size(16))
            .on_connection(move |conn| {
                let tx = tx.clone();
                conn.on_buffer_overflow(move |_, bytes| {
                    let _ = tx.send(bytes.to_vec());
                });
            })
            .bind("127.0.0.1:0")
            .unwrap();

        let payload = pattern(32);
        let mut peer = connect(&server);
        peer.write_all(&payload).unwrap();

        assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), &payload[..16], "{backend:?}");
        assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), &payload[16..], "{backend:?}");

        server.close_urgent();
    }
}

#[test]
fn racing_closes_fire_disconnect_once() {
    init_tracing();

    for backend in BACKENDS {
        let (tx, rx) = mpsc::channel();
        let server = Server::builder()
            .config(config(backend))
            .on_connection(move |conn| {
                let tx = tx.clone();
                conn.on_disconnect(move |_, reason| {
                    let _ = tx.send(reason);
                });
            })
            .bind("127.0.0.1:0")
            .unwrap();

        let peer = connect(&server);
        assert!(wait_until(|| server.connection_count() == 1), "{backend:?}");
        let conn = server.connections().remove(0);

        let closers: Vec<_> = (0..4)
            .map(|i| {
                let conn = conn.clone();
                thread::spawn(move || {
                    if i % 2 == 0 {
                        conn.close();
                    } else {
                        conn.close_urgent();
                    }
                })
            })
            .collect();
        let _ = peer.shutdown(Shutdown::Both);

        for closer in closers {
            closer.join().unwrap();
        }

        rx.recv_timeout(TIMEOUT).unwrap();
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err(), "{backend:?}");
        assert!(conn.is_closed());
        assert!(conn.write(&b"late"[..]).is_err());

        server.close();
    }
}

#[test]
fn close_notifies_server_and_peers() {
    init_tracing();

    for backend in BACKENDS {
        let (closed_tx, closed_rx) = mpsc::channel();
        let (disconnect_tx, disconnect_rx) = mpsc::channel();

        let server = Server::builder()
            .config(config(backend))
            .on_connection(move |conn| {
                let tx = disconnect_tx.clone();
                conn.on_disconnect(move |_, reason| {
                    let _ = tx.send(reason);
                });
            })
            .on_close(move |reason| {
                let _ = closed_tx.send(reason);
            })
            .bind("127.0.0.1:0")
            .unwrap();

        let mut peer = connect(&server);
        assert!(wait_until(|| server.connection_count() == 1), "{backend:?}");

        server.close();

        assert_eq!(closed_rx.recv_timeout(TIMEOUT).unwrap(), DisconnectReason::User);
        assert_eq!(disconnect_rx.recv_timeout(TIMEOUT).unwrap(), DisconnectReason::User);
        assert_eq!(server.connection_count(), 0);

        let mut buf = [0u8; 1];
        assert_eq!(peer.read(&mut buf).unwrap_or(0), 0, "{backend:?}");
    }
}

#[test]
fn graceful_close_flushes_queued_writes() {
    init_tracing();

    const LEN: usize = 2 * 1024 * 1024;

    for backend in BACKENDS {
        let server = Server::builder()
            .config(config(backend).linger(Duration::from_secs(10)))
            .on_connection(|conn| {
                conn.write(pattern(LEN)).unwrap();
            })
            .bind("127.0.0.1:0")
            .unwrap();

        let mut peer = connect(&server);
        assert!(wait_until(|| server.connection_count() == 1), "{backend:?}");

        let closer = thread::spawn(move || server.close());

        let mut received = Vec::with_capacity(LEN);
        peer.read_to_end(&mut received).unwrap();
        assert_eq!(received.len(), LEN, "{backend:?}");
        assert!(received == pattern(LEN), "{backend:?}: payload mismatch");

        closer.join().unwrap();
    }
}

#[test]
fn panicking_callback_only_closes_its_connection() {
    init_tracing();

    for backend in BACKENDS {
        let (tx, rx) = mpsc::channel();
        let server = Server::builder()
            .config(config(backend))
            .on_connection(move |conn| {
                let tx = tx.clone();
                conn.on_exception(move |_, err| {
                    let _ = tx.send(matches!(err, Error::CallbackPanicked(_)));
                });
                conn.on_read(|conn, bytes| {
                    if bytes == b"boom" {
                        panic!("handler exploded");
                    }
                    let _ = conn.write(bytes.to_vec());
                });
            })
            .bind("127.0.0.1:0")
            .unwrap();

        let mut victim = connect(&server);
        let mut survivor = connect(&server);
        assert!(wait_until(|| server.connection_count() == 2), "{backend:?}");

        victim.write_all(b"boom").unwrap();
        assert!(rx.recv_timeout(TIMEOUT).unwrap(), "{backend:?}");

        let mut buf = [0u8; 4];
        assert_eq!(victim.read(&mut buf).unwrap_or(0), 0, "{backend:?}");

        survivor.write_all(b"fine").unwrap();
        survivor.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"fine");
        assert!(wait_until(|| server.connection_count() == 1), "{backend:?}");

        server.close_urgent();
    }
}

#[test]
fn wildcard_v6_listener_is_dual_stack() {
    init_tracing();

    if TcpListener::bind((Ipv6Addr::LOCALHOST, 0)).is_err() {
        // No IPv6 on this host.
        return;
    }

    for backend in BACKENDS {
        let server = Server::builder()
            .config(config(backend))
            .on_connection(|conn| {
                conn.on_read(|conn, bytes| {
                    let _ = conn.write(bytes.to_vec());
                });
            })
            .bind("[::]:0")
            .unwrap();

        assert!(server.local_addr().is_ipv6(), "{backend:?}");
        let port = server.local_addr().port();

        for addr in [
            SocketAddr::from((Ipv4Addr::LOCALHOST, port)),
            SocketAddr::from((Ipv6Addr::LOCALHOST, port)),
        ] {
            let mut peer = TcpStream::connect(addr).unwrap();
            peer.set_read_timeout(Some(TIMEOUT)).unwrap();
            peer.write_all(b"dual").unwrap();

            let mut buf = [0u8; 4];
            peer.read_exact(&mut buf).unwrap();
            assert_eq!(&buf, b"dual", "{backend:?} over {addr}");
        }

        let (tx, rx) = mpsc::channel();
        let client = Client::builder()
            .config(config(backend))
            .on_connect(move |conn| {
                let tx = tx.clone();
                conn.add_request(4, move |_, bytes| {
                    let _ = tx.send(bytes.to_vec());
                })
                .unwrap();
            })
            .connect((Ipv6Addr::LOCALHOST, port))
            .unwrap();

        assert!(client.connection().peer_addr().is_some_and(|a| a.is_ipv6()));
        client.connection().write(&b"six!"[..]).unwrap();
        assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), b"six!", "{backend:?}");

        client.close();
        server.close_urgent();
    }
}

#[test]
fn thread_per_connection_is_never_a_fallback() {
    init_tracing();

    for backend in [Backend::Native, Backend::Portable] {
        let server = Server::builder()
            .config(config(backend))
            .on_connection(|_| {})
            .bind("127.0.0.1:0")
            .unwrap();

        assert_ne!(server.backend(), Backend::ThreadPerConnection);
        server.close();
    }

    let server = Server::builder()
        .config(config(Backend::ThreadPerConnection))
        .on_connection(|_| {})
        .bind("127.0.0.1:0")
        .unwrap();
    assert_eq!(server.backend(), Backend::ThreadPerConnection);
}

#[test]
fn bind_without_connection_callback_fails() {
    let result = Server::builder().bind("127.0.0.1:0");
    assert!(matches!(result, Err(Error::MissingCallback(_))));
}
