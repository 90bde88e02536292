//! Plain TCP transport over `std::net`.
//!
//! Addresses are multiaddrs of the form `/ip4/<addr>/tcp/<port>` or
//! `/ip6/<addr>/tcp/<port>`. Deadlines are absolute instants. A blocked
//! read or write waits on the socket in slices of at most `POLL_INTERVAL`,
//! re-reading its deadline and the closed flag between slices, so a deadline
//! set or a `close` issued while the call is blocked takes effect promptly.

use std::io::{self, Read, Write};
use std::net::{self, IpAddr, Shutdown, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use multiaddr::{Multiaddr, Protocol};
use peerconn_common::{Error, Result};
use serde::Deserialize;
use tracing::debug;

use super::{Transport, TransportConn};

const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;

/// Longest single wait on the socket inside a blocked read or write.
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// TCP transport settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TcpConfig {
    /// Disable Nagle's algorithm on every connection
    pub nodelay: bool,

    /// Dial timeout in milliseconds; `None` waits for the OS
    pub connect_timeout_ms: Option<u64>,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            nodelay: true,
            connect_timeout_ms: Some(DEFAULT_CONNECT_TIMEOUT_MS),
        }
    }
}

/// Convert a socket address into its `/ipX/.../tcp/...` multiaddr.
pub fn socket_addr_to_multiaddr(addr: &SocketAddr) -> Multiaddr {
    let ip = match addr.ip() {
        IpAddr::V4(ip) => Protocol::Ip4(ip),
        IpAddr::V6(ip) => Protocol::Ip6(ip),
    };
    Multiaddr::empty().with(ip).with(Protocol::Tcp(addr.port()))
}

/// Convert a `/ipX/.../tcp/...` multiaddr into a socket address.
pub fn multiaddr_to_socket_addr(addr: &Multiaddr) -> Result<SocketAddr> {
    let mut iter = addr.iter();
    let ip = match iter.next() {
        Some(Protocol::Ip4(ip)) => IpAddr::V4(ip),
        Some(Protocol::Ip6(ip)) => IpAddr::V6(ip),
        _ => {
            return Err(Error::transport(format!(
                "{addr}: expected an ip4 or ip6 component first"
            )))
        }
    };
    let port = match iter.next() {
        Some(Protocol::Tcp(port)) => port,
        _ => return Err(Error::transport(format!("{addr}: expected a tcp component"))),
    };
    if iter.next().is_some() {
        return Err(Error::transport(format!(
            "{addr}: unexpected components after tcp port"
        )));
    }
    Ok(SocketAddr::new(ip, port))
}

/// Dials and listens on TCP multiaddrs. Built through [`TcpTransport::new`].
#[derive(Debug)]
pub struct TcpTransport {
    config: TcpConfig,
}

impl TcpTransport {
    pub fn new(config: TcpConfig) -> Arc<Self> {
        Arc::new(Self { config })
    }

    pub fn config(&self) -> &TcpConfig {
        &self.config
    }

    /// Open an outbound connection to `addr`.
    pub fn dial(self: &Arc<Self>, addr: &Multiaddr) -> Result<TcpConn> {
        let socket_addr = multiaddr_to_socket_addr(addr)?;
        let stream = match self.config.connect_timeout_ms {
            Some(ms) => net::TcpStream::connect_timeout(&socket_addr, Duration::from_millis(ms))?,
            None => net::TcpStream::connect(socket_addr)?,
        };
        debug!("dialed {}", addr);
        Ok(TcpConn::from_stream(stream, self.clone())?)
    }

    /// Bind a listener on `addr`. Port 0 picks a free port.
    pub fn listen(self: &Arc<Self>, addr: &Multiaddr) -> Result<TcpListener> {
        let socket_addr = multiaddr_to_socket_addr(addr)?;
        let inner = net::TcpListener::bind(socket_addr)?;
        let local = inner.local_addr()?;
        debug!("listening on {}", socket_addr_to_multiaddr(&local));
        Ok(TcpListener {
            inner,
            local,
            transport: self.clone(),
        })
    }
}

impl Transport for TcpTransport {
    fn name(&self) -> &str {
        "tcp"
    }

    fn can_dial(&self, addr: &Multiaddr) -> bool {
        multiaddr_to_socket_addr(addr).is_ok()
    }
}

/// A bound TCP listener producing [`TcpConn`]s.
#[derive(Debug)]
pub struct TcpListener {
    inner: net::TcpListener,
    local: SocketAddr,
    transport: Arc<TcpTransport>,
}

impl TcpListener {
    /// Block until the next inbound connection is established.
    pub fn accept(&self) -> io::Result<TcpConn> {
        let (stream, remote) = self.inner.accept()?;
        debug!("accepted {}", socket_addr_to_multiaddr(&remote));
        TcpConn::from_stream(stream, self.transport.clone())
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn local_multiaddr(&self) -> Multiaddr {
        socket_addr_to_multiaddr(&self.local)
    }
}

/// An established TCP connection.
#[derive(Debug)]
pub struct TcpConn {
    stream: net::TcpStream,
    local: SocketAddr,
    remote: SocketAddr,
    transport: Arc<TcpTransport>,
    read_deadline: Mutex<Option<Instant>>,
    write_deadline: Mutex<Option<Instant>>,
    closed: AtomicBool,
}

impl TcpConn {
    fn from_stream(stream: net::TcpStream, transport: Arc<TcpTransport>) -> io::Result<Self> {
        stream.set_nodelay(transport.config.nodelay)?;
        Ok(Self {
            local: stream.local_addr()?,
            remote: stream.peer_addr()?,
            stream,
            transport,
            read_deadline: Mutex::new(None),
            write_deadline: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn check_open(&self) -> io::Result<()> {
        if self.is_closed() {
            return Err(closed_error());
        }
        Ok(())
    }
}

impl TransportConn for TcpConn {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            self.check_open()?;
            let wait = next_wait(load_deadline(&self.read_deadline))?;
            self.stream.set_read_timeout(Some(wait))?;
            match (&self.stream).read(buf) {
                // Shutdown by `close` surfaces as EOF or a socket error.
                Ok(0) | Err(_) if self.is_closed() => return Err(closed_error()),
                Err(e) if is_wait_expired(&e) => continue,
                res => return res,
            }
        }
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        loop {
            self.check_open()?;
            let wait = next_wait(load_deadline(&self.write_deadline))?;
            self.stream.set_write_timeout(Some(wait))?;
            match (&self.stream).write(buf) {
                Err(_) if self.is_closed() => return Err(closed_error()),
                Err(e) if is_wait_expired(&e) => continue,
                res => return res,
            }
        }
    }

    fn flush(&self) -> io::Result<()> {
        self.check_open()?;
        (&self.stream).flush()
    }

    fn close(&self) -> io::Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(closed_error());
        }
        // Shutting down both halves wakes any call blocked on the socket.
        match self.stream.shutdown(Shutdown::Both) {
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }

    fn set_read_deadline(&self, deadline: Option<Instant>) -> io::Result<()> {
        self.check_open()?;
        store_deadline(&self.read_deadline, deadline);
        Ok(())
    }

    fn set_write_deadline(&self, deadline: Option<Instant>) -> io::Result<()> {
        self.check_open()?;
        store_deadline(&self.write_deadline, deadline);
        Ok(())
    }

    fn local_addr(&self) -> SocketAddr {
        self.local
    }

    fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    fn local_multiaddr(&self) -> Multiaddr {
        socket_addr_to_multiaddr(&self.local)
    }

    fn remote_multiaddr(&self) -> Multiaddr {
        socket_addr_to_multiaddr(&self.remote)
    }

    fn transport(&self) -> Arc<dyn Transport> {
        self.transport.clone()
    }
}

fn load_deadline(slot: &Mutex<Option<Instant>>) -> Option<Instant> {
    match slot.lock() {
        Ok(guard) => *guard,
        Err(poisoned) => *poisoned.into_inner(),
    }
}

fn store_deadline(slot: &Mutex<Option<Instant>>, deadline: Option<Instant>) {
    match slot.lock() {
        Ok(mut guard) => *guard = deadline,
        Err(poisoned) => *poisoned.into_inner() = deadline,
    }
}

/// Socket timeout for the next wait slice; errors once the deadline passed.
fn next_wait(deadline: Option<Instant>) -> io::Result<Duration> {
    let Some(deadline) = deadline else {
        return Ok(POLL_INTERVAL);
    };
    let now = Instant::now();
    if deadline <= now {
        return Err(deadline_exceeded());
    }
    Ok((deadline - now).min(POLL_INTERVAL))
}

fn deadline_exceeded() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, "i/o deadline exceeded")
}

// Unix reports an expired socket timeout as WouldBlock, Windows as TimedOut.
fn is_wait_expired(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

fn closed_error() -> io::Error {
    io::Error::new(
        io::ErrorKind::NotConnected,
        "use of closed network connection",
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;

    fn loopback() -> Multiaddr {
        "/ip4/127.0.0.1/tcp/0".parse().unwrap()
    }

    fn connected_pair() -> (TcpConn, TcpConn) {
        let transport = TcpTransport::new(TcpConfig::default());
        let listener = transport.listen(&loopback()).unwrap();
        let client = transport.dial(&listener.local_multiaddr()).unwrap();
        let server = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn test_multiaddr_conversion() {
        let addr: SocketAddr = "10.0.0.1:4001".parse().unwrap();
        let ma = socket_addr_to_multiaddr(&addr);
        assert_eq!(ma.to_string(), "/ip4/10.0.0.1/tcp/4001");
        assert_eq!(multiaddr_to_socket_addr(&ma).unwrap(), addr);

        let v6: SocketAddr = "[::1]:9000".parse().unwrap();
        assert_eq!(socket_addr_to_multiaddr(&v6).to_string(), "/ip6/::1/tcp/9000");
    }

    #[test]
    fn test_unsupported_multiaddr() {
        let transport = TcpTransport::new(TcpConfig::default());
        let udp: Multiaddr = "/ip4/127.0.0.1/udp/4001".parse().unwrap();
        let bare: Multiaddr = "/ip4/127.0.0.1".parse().unwrap();

        assert!(!transport.can_dial(&udp));
        assert!(!transport.can_dial(&bare));
        assert!(transport.can_dial(&"/ip4/127.0.0.1/tcp/1".parse().unwrap()));
        assert!(matches!(transport.dial(&udp), Err(Error::Transport(_))));
    }

    #[test]
    fn test_dial_accept_exchange() {
        let (client, server) = connected_pair();

        assert_eq!(client.remote_addr(), server.local_addr());
        assert_eq!(client.local_multiaddr(), server.remote_multiaddr());
        assert_eq!(client.transport().name(), "tcp");

        assert_eq!(client.write(b"ping").unwrap(), 4);
        let mut buf = [0u8; 4];
        let mut read = 0;
        while read < buf.len() {
            read += server.read(&mut buf[read..]).unwrap();
        }
        assert_eq!(&buf, b"ping");
    }

    #[test]
    fn test_expired_read_deadline() {
        let (client, _server) = connected_pair();
        client
            .set_read_deadline(Some(Instant::now() - Duration::from_millis(1)))
            .unwrap();

        let mut buf = [0u8; 8];
        let err = client.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[test]
    fn test_read_deadline_fires_while_blocked() {
        let (client, _server) = connected_pair();
        client
            .set_deadline(Some(Instant::now() + Duration::from_millis(50)))
            .unwrap();

        let mut buf = [0u8; 8];
        let err = client.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);

        // Clearing the deadline makes the connection usable again.
        client.set_deadline(None).unwrap();
        assert_eq!(client.write(b"ok").unwrap(), 2);
    }

    #[test]
    fn test_double_close() {
        let (client, _server) = connected_pair();
        client.close().unwrap();

        let err = client.close().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
        assert_eq!(
            client.write(b"late").unwrap_err().kind(),
            io::ErrorKind::NotConnected
        );
        assert!(client.set_read_deadline(None).is_err());
    }

    #[test]
    fn test_close_unblocks_reader() {
        let (client, _server) = connected_pair();
        let client = Arc::new(client);

        let (tx, rx) = mpsc::channel();
        let reader = client.clone();
        thread::spawn(move || {
            let mut buf = [0u8; 16];
            let _ = tx.send(reader.read(&mut buf));
        });

        thread::sleep(Duration::from_millis(50));
        client.close().unwrap();

        let err = rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }

    #[test]
    fn test_deadline_set_while_reader_blocked() {
        let (client, _server) = connected_pair();
        let client = Arc::new(client);

        let (tx, rx) = mpsc::channel();
        let reader = client.clone();
        thread::spawn(move || {
            let mut buf = [0u8; 16];
            let _ = tx.send(reader.read(&mut buf));
        });

        thread::sleep(Duration::from_millis(50));
        client
            .set_read_deadline(Some(Instant::now() + Duration::from_millis(50)))
            .unwrap();

        let err = rx.recv_timeout(Duration::from_secs(2)).unwrap().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[test]
    fn test_expired_deadline_set_while_reader_blocked() {
        let (client, _server) = connected_pair();
        let client = Arc::new(client);

        let (tx, rx) = mpsc::channel();
        let reader = client.clone();
        thread::spawn(move || {
            let mut buf = [0u8; 16];
            let _ = tx.send(reader.read(&mut buf));
        });

        thread::sleep(Duration::from_millis(50));
        client.set_read_deadline(Some(Instant::now())).unwrap();

        let err = rx.recv_timeout(Duration::from_secs(2)).unwrap().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[test]
    fn test_cleared_deadline_keeps_reader_waiting() {
        let (client, server) = connected_pair();
        let client = Arc::new(client);
        client
            .set_read_deadline(Some(Instant::now() + Duration::from_millis(100)))
            .unwrap();

        let (tx, rx) = mpsc::channel();
        let reader = client.clone();
        thread::spawn(move || {
            let mut buf = [0u8; 16];
            let _ = tx.send(reader.read(&mut buf));
        });

        thread::sleep(Duration::from_millis(20));
        client.set_read_deadline(None).unwrap();
        thread::sleep(Duration::from_millis(200));
        assert!(rx.try_recv().is_err());

        server.write(b"late").unwrap();
        let n = rx.recv_timeout(Duration::from_secs(2)).unwrap().unwrap();
        assert_eq!(n, 4);
    }

    #[test]
    fn test_config_from_json() {
        let config: TcpConfig = serde_json::from_str(r#"{"nodelay": false}"#).unwrap();
        assert!(!config.nodelay);
        assert_eq!(config.connect_timeout_ms, Some(DEFAULT_CONNECT_TIMEOUT_MS));
    }
}
