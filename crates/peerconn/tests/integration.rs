//! Integration tests for peer connections over TCP.

use std::io::{self, BufRead, BufReader, Read, Write};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use tracing::info_span;

use peerconn::{
    release_buffer, BufferPool, Conn, Multiaddr, PeerConn, PeerId, TcpConfig, TcpConn,
    TcpTransport,
};

fn key_peer() -> PeerId {
    PeerId::from_public_key(&SigningKey::generate(&mut OsRng).verifying_key())
}

/// Dial a loopback listener and wrap both ends.
fn connected_pair(
    client_id: &PeerId,
    server_id: &PeerId,
) -> (PeerConn<TcpConn>, PeerConn<TcpConn>) {
    let transport = TcpTransport::new(TcpConfig::default());
    let listen_addr: Multiaddr = "/ip4/127.0.0.1/tcp/0".parse().unwrap();
    let listener = transport.listen(&listen_addr).unwrap();

    let dial_span = info_span!("dial");
    let client = PeerConn::new(
        &dial_span,
        client_id.clone(),
        server_id.clone(),
        transport.dial(&listener.local_multiaddr()).unwrap(),
    );
    let accept_span = info_span!("accept");
    let server = PeerConn::new(
        &accept_span,
        server_id.clone(),
        client_id.clone(),
        listener.accept().unwrap(),
    );
    (client, server)
}

/// Exchange a line through an echo thread using pooled read buffers.
#[test]
fn test_echo_over_tcp() {
    peerconn_common::init_tracing_with_default("debug");

    let client_id = key_peer();
    let server_id = key_peer();
    let (client, server) = connected_pair(&client_id, &server_id);

    assert_eq!(client.local_peer(), server.remote_peer());
    assert_eq!(client.remote_multiaddr(), server.local_multiaddr());
    assert_eq!(client.transport().name(), "tcp");

    let echo = thread::spawn(move || {
        loop {
            let mut buf = BufferPool::global().get(1024);
            let n = match server.read(&mut buf) {
                Ok(0) | Err(_) => {
                    release_buffer(buf);
                    break;
                }
                Ok(n) => n,
            };
            (&server).write_all(&buf[..n]).unwrap();
            release_buffer(buf);
        }
        server.close()
    });

    (&client).write_all(b"hello peer\n").unwrap();
    let mut line = String::new();
    BufReader::new(&client).read_line(&mut line).unwrap();
    assert_eq!(line, "hello peer\n");

    client.close().unwrap();
    echo.join().unwrap().unwrap();
}

#[test]
fn test_read_deadline_through_peer_conn() {
    let (client, _server) = connected_pair(&PeerId::from("peerA"), &PeerId::from("peerB"));

    client
        .set_read_deadline(Some(Instant::now() + Duration::from_millis(50)))
        .unwrap();
    let mut buf = [0u8; 8];
    let err = client.read(&mut buf).unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::TimedOut);
}

#[test]
fn test_close_unblocks_reader_and_second_close_errors() {
    let (client, _server) = connected_pair(&PeerId::from("peerA"), &PeerId::from("peerB"));
    let client = Arc::new(client);

    let (tx, rx) = mpsc::channel();
    let reader = client.clone();
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = tx.send((&*reader).read_to_end(&mut buf));
    });

    thread::sleep(Duration::from_millis(50));
    client.close().unwrap();
    let err = rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::NotConnected);

    let err = client.close().unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::NotConnected);
}

#[test]
fn test_ids_differ_per_connection() {
    let a = PeerId::from("peerA");
    let b = PeerId::from("peerB");
    let (c1, s1) = connected_pair(&a, &b);
    let (c2, _s2) = connected_pair(&a, &b);

    assert_ne!(c1.id(), c2.id());
    assert_ne!(c1.id(), s1.id());
    assert!(c1.to_string().contains(c1.id()));
}
