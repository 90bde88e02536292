#![forbid(unsafe_code)]

//! Echo bytes over TCP through identity-tagged peer connections.
//!
//! `--listen` accepts connections and writes back whatever it reads.
//! `--dial` forwards stdin to the remote side and prints what comes back.

use std::io::{self, Write};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use clap::Parser;
use ed25519_dalek::SigningKey;
use peerconn::{
    release_buffer, BufferPool, Conn, Multiaddr, PeerConn, PeerId, TcpConfig, TcpConn,
    TcpTransport, TransportConn,
};
use rand::rngs::OsRng;
use tracing::{info, info_span, warn};

const READ_BUFFER_BYTES: usize = 16 * 1024;

/// Pause after a failed accept.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

#[derive(Parser, Debug)]
#[command(name = "peerconn-echo")]
#[command(about = "Echo bytes over TCP through identity-tagged peer connections")]
struct Args {
    /// Multiaddr to accept connections on, e.g. /ip4/127.0.0.1/tcp/4001
    #[arg(long, env = "PEERCONN_LISTEN", conflicts_with = "dial")]
    listen: Option<Multiaddr>,

    /// Multiaddr of an echo server to connect to
    #[arg(long, env = "PEERCONN_DIAL")]
    dial: Option<Multiaddr>,

    /// Local peer id; a key-derived id is generated when omitted
    #[arg(long, env = "PEERCONN_LOCAL_PEER")]
    local_peer: Option<PeerId>,

    /// Peer id the other side is known by
    #[arg(long, env = "PEERCONN_REMOTE_PEER", default_value = "unknown")]
    remote_peer: PeerId,

    /// Idle read timeout in milliseconds (0 disables)
    #[arg(long, default_value_t = 0)]
    read_timeout_ms: u64,

    /// Disable TCP_NODELAY
    #[arg(long, default_value_t = false)]
    no_nodelay: bool,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<()> {
    let args = Args::parse();
    peerconn_common::init_tracing_with_default(&args.log_level);

    let local = args.local_peer.clone().unwrap_or_else(|| {
        let key = SigningKey::generate(&mut OsRng);
        PeerId::from_public_key(&key.verifying_key())
    });
    info!("local peer {}", local);

    let transport = TcpTransport::new(TcpConfig {
        nodelay: !args.no_nodelay,
        ..TcpConfig::default()
    });

    match (&args.listen, &args.dial) {
        (Some(addr), _) => serve(&transport, addr, local, &args),
        (None, Some(addr)) => dial(&transport, addr, local, &args),
        (None, None) => bail!("one of --listen or --dial is required"),
    }
}

fn serve(
    transport: &Arc<TcpTransport>,
    addr: &Multiaddr,
    local: PeerId,
    args: &Args,
) -> Result<()> {
    let listener = transport.listen(addr)?;
    info!("listening on {}", listener.local_multiaddr());

    loop {
        let raw = match listener.accept() {
            Ok(raw) => raw,
            Err(e) => {
                warn!("accept failed: {}", e);
                thread::sleep(ACCEPT_RETRY_DELAY);
                continue;
            }
        };
        let span = info_span!("accept", remote_addr = %raw.remote_multiaddr());
        let conn = PeerConn::new(&span, local.clone(), args.remote_peer.clone(), raw);
        info!("accepted {}", conn);

        let idle = timeout(args.read_timeout_ms);
        thread::spawn(move || {
            if let Err(e) = echo(&conn, idle) {
                warn!("{}: {}", conn.id(), e);
            }
            if let Err(e) = conn.close() {
                warn!("{}: close failed: {}", conn.id(), e);
            }
        });
    }
}

fn echo(conn: &PeerConn<TcpConn>, idle: Option<Duration>) -> io::Result<()> {
    loop {
        conn.set_read_deadline(idle.map(|d| Instant::now() + d))?;
        let mut buf = BufferPool::global().get(READ_BUFFER_BYTES);
        let n = conn.read(&mut buf)?;
        if n == 0 {
            release_buffer(buf);
            return Ok(());
        }
        let res = io::Write::write_all(&mut &*conn, &buf[..n]);
        release_buffer(buf);
        res?;
    }
}

fn dial(
    transport: &Arc<TcpTransport>,
    addr: &Multiaddr,
    local: PeerId,
    args: &Args,
) -> Result<()> {
    let span = info_span!("dial", addr = %addr);
    let conn = Arc::new(PeerConn::new(
        &span,
        local,
        args.remote_peer.clone(),
        transport.dial(addr)?,
    ));
    info!("connected {}", conn);

    let reader = conn.clone();
    let printer = thread::spawn(move || -> io::Result<u64> {
        let stdout = io::stdout();
        let mut out = stdout.lock();
        let mut buf = [0u8; READ_BUFFER_BYTES];
        let mut copied = 0;
        loop {
            let n = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                // Our own close ends the read side.
                Err(e) if e.kind() == io::ErrorKind::NotConnected => break,
                Err(e) => return Err(e),
            };
            out.write_all(&buf[..n])?;
            copied += n as u64;
        }
        out.flush()?;
        Ok(copied)
    });

    let stdin = io::stdin();
    let sent = io::copy(&mut stdin.lock(), &mut &*conn)?;
    info!("sent {} bytes", sent);

    // Give the echo a moment to come back before tearing the connection down.
    thread::sleep(Duration::from_millis(200));
    conn.close()?;

    match printer.join() {
        Ok(Ok(received)) => info!("received {} bytes", received),
        Ok(Err(e)) => warn!("reading echo failed: {}", e),
        Err(_) => bail!("echo reader panicked"),
    }
    Ok(())
}

fn timeout(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}
