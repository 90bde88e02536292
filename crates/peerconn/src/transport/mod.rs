//! Transport-side collaborator contracts.
//!
//! A [`TransportConn`] is an established byte-stream connection bound to
//! concrete network addresses. [`PeerConn`](crate::PeerConn) holds one and
//! forwards to it without translating results.
//!
//! Every method takes `&self` so that reads, writes and `close` can be
//! driven from different threads at once, the same way `&TcpStream`
//! implements `Read` and `Write`.

pub mod tcp;

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use multiaddr::Multiaddr;

pub use tcp::{TcpConfig, TcpConn, TcpListener, TcpTransport};

/// Handle to the transport a connection belongs to, for capability
/// inspection by upper layers.
pub trait Transport: Send + Sync + fmt::Debug {
    /// Short transport name, e.g. `"tcp"`.
    fn name(&self) -> &str;

    /// Whether this transport knows how to dial `addr`.
    fn can_dial(&self, addr: &Multiaddr) -> bool;
}

/// An established transport connection.
pub trait TransportConn: Send + Sync {
    /// Read into `buf`. Same blocking and partial-read semantics as
    /// [`io::Read::read`].
    fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write from `buf`. Same semantics as [`io::Write::write`].
    fn write(&self, buf: &[u8]) -> io::Result<usize>;

    fn flush(&self) -> io::Result<()> {
        Ok(())
    }

    /// Close the connection. Closing twice is transport-defined.
    fn close(&self) -> io::Result<()>;

    /// Set both read and write deadlines. `None` clears them.
    fn set_deadline(&self, deadline: Option<Instant>) -> io::Result<()> {
        self.set_read_deadline(deadline)?;
        self.set_write_deadline(deadline)
    }

    fn set_read_deadline(&self, deadline: Option<Instant>) -> io::Result<()>;

    fn set_write_deadline(&self, deadline: Option<Instant>) -> io::Result<()>;

    fn local_addr(&self) -> SocketAddr;

    fn remote_addr(&self) -> SocketAddr;

    fn local_multiaddr(&self) -> Multiaddr;

    fn remote_multiaddr(&self) -> Multiaddr;

    /// The transport that produced this connection.
    fn transport(&self) -> Arc<dyn Transport>;
}

macro_rules! forward_transport_conn {
    ($($ptr:ident),*) => {$(
        impl<T: TransportConn + ?Sized> TransportConn for $ptr<T> {
            fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
                (**self).read(buf)
            }

            fn write(&self, buf: &[u8]) -> io::Result<usize> {
                (**self).write(buf)
            }

            fn flush(&self) -> io::Result<()> {
                (**self).flush()
            }

            fn close(&self) -> io::Result<()> {
                (**self).close()
            }

            fn set_deadline(&self, deadline: Option<Instant>) -> io::Result<()> {
                (**self).set_deadline(deadline)
            }

            fn set_read_deadline(&self, deadline: Option<Instant>) -> io::Result<()> {
                (**self).set_read_deadline(deadline)
            }

            fn set_write_deadline(&self, deadline: Option<Instant>) -> io::Result<()> {
                (**self).set_write_deadline(deadline)
            }

            fn local_addr(&self) -> SocketAddr {
                (**self).local_addr()
            }

            fn remote_addr(&self) -> SocketAddr {
                (**self).remote_addr()
            }

            fn local_multiaddr(&self) -> Multiaddr {
                (**self).local_multiaddr()
            }

            fn remote_multiaddr(&self) -> Multiaddr {
                (**self).remote_multiaddr()
            }

            fn transport(&self) -> Arc<dyn Transport> {
                (**self).transport()
            }
        }
    )*};
}

forward_transport_conn!(Box, Arc);
