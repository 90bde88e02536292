//! Connections tagged with the identities of both endpoints.
//!
//! [`PeerConn`] wraps an established [`TransportConn`] together with the
//! local and remote [`PeerId`]s and a lifecycle span that starts when the
//! wrapper is built and finishes when it is closed. Everything else is
//! forwarded to the transport connection unchanged, errors included.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use ed25519_dalek::{SigningKey, VerifyingKey};
use multiaddr::Multiaddr;
use sha2::{Digest, Sha256};
use tracing::{debug, warn, Span};

use crate::event_log::{DialFields, EventLog, EventSpan, TracingEventLog};
use crate::identity::PeerId;
use crate::transport::{Transport, TransportConn};

/// Name used in `Display` output.
pub const CONN_TYPE_NAME: &str = "PeerConn";

/// Event name of the lifecycle span.
pub const CONN_LIFETIME_EVENT: &str = "connLifetime";

const LOG_SYSTEM: &str = "conn";

/// Number of hash bytes kept in a connection id.
const CONN_ID_BYTES: usize = 8;

static NEXT_CONN_SEQ: AtomicU64 = AtomicU64::new(0);

/// A connection between two identified peers, as seen by session and
/// multiplexing layers.
pub trait Conn: Send + Sync {
    /// Identifier unique to this connection object.
    fn id(&self) -> &str;

    fn local_peer(&self) -> &PeerId;

    fn remote_peer(&self) -> &PeerId;

    fn local_multiaddr(&self) -> Multiaddr;

    fn remote_multiaddr(&self) -> Multiaddr;

    fn local_addr(&self) -> SocketAddr;

    fn remote_addr(&self) -> SocketAddr;

    fn transport(&self) -> Arc<dyn Transport>;

    /// Private key of the local side, when a security layer provides one.
    fn local_private_key(&self) -> Option<&SigningKey>;

    /// Public key of the remote side, when a security layer provides one.
    fn remote_public_key(&self) -> Option<&VerifyingKey>;

    /// Human-readable digest of the remote's cryptographic identity.
    fn remote_identity_digest(&self) -> Option<&str>;

    fn set_deadline(&self, deadline: Option<Instant>) -> io::Result<()>;

    fn set_read_deadline(&self, deadline: Option<Instant>) -> io::Result<()>;

    fn set_write_deadline(&self, deadline: Option<Instant>) -> io::Result<()>;

    fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    fn write(&self, buf: &[u8]) -> io::Result<usize>;

    fn flush(&self) -> io::Result<()>;

    fn close(&self) -> io::Result<()>;
}

/// A single transport connection between two peers, without any security
/// or multiplexing layered on top.
pub struct PeerConn<C> {
    id: String,
    local: PeerId,
    remote: PeerId,
    conn: C,
    event: Mutex<Option<Box<dyn EventSpan>>>,
}

impl<C: TransportConn> PeerConn<C> {
    /// Wrap `conn`, recording its lifetime through `tracing`.
    ///
    /// `ctx` is the span of the operation that produced the connection; the
    /// lifetime span is opened as its child.
    pub fn new(ctx: &Span, local: PeerId, remote: PeerId, conn: C) -> Self {
        Self::with_event_log(ctx, &TracingEventLog, local, remote, conn)
    }

    /// Wrap `conn`, recording its lifetime through `event_log`.
    ///
    /// A failure to open the span is logged and otherwise ignored: the
    /// connection is fully usable without one.
    pub fn with_event_log(
        ctx: &Span,
        event_log: &dyn EventLog,
        local: PeerId,
        remote: PeerId,
        conn: C,
    ) -> Self {
        let fields = DialFields {
            system: LOG_SYSTEM,
            local_peer: local.clone(),
            remote_peer: remote.clone(),
            local_addr: conn.local_multiaddr(),
            remote_addr: conn.remote_multiaddr(),
        };

        let event = match event_log.event_begin(ctx, CONN_LIFETIME_EVENT, &fields) {
            Ok(span) => Some(span),
            Err(e) => {
                warn!(
                    "could not begin {} event for {} -> {}: {}",
                    CONN_LIFETIME_EVENT, local, remote, e
                );
                None
            }
        };

        let id = conn_id(&fields, NEXT_CONN_SEQ.fetch_add(1, Ordering::Relaxed));
        debug!("new {} {}: {} to {}", CONN_TYPE_NAME, id, local, remote);

        Self {
            id,
            local,
            remote,
            conn,
            event: Mutex::new(event),
        }
    }

    /// The wrapped transport connection.
    pub fn get_ref(&self) -> &C {
        &self.conn
    }

    /// Whether the lifecycle span is still open.
    pub fn is_event_open(&self) -> bool {
        match self.event.lock() {
            Ok(slot) => slot.is_some(),
            Err(poisoned) => poisoned.into_inner().is_some(),
        }
    }

    fn finish_event(&self) {
        let span = match self.event.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(span) = span {
            span.close();
        }
    }
}

/// Finishes the lifecycle span when dropped, so it runs on every exit path
/// of `close`, unwinding included.
struct FinishEventOnExit<'a, C: TransportConn>(&'a PeerConn<C>);

impl<C: TransportConn> Drop for FinishEventOnExit<'_, C> {
    fn drop(&mut self) {
        self.0.finish_event();
    }
}

impl<C: TransportConn> Conn for PeerConn<C> {
    fn id(&self) -> &str {
        &self.id
    }

    fn local_peer(&self) -> &PeerId {
        &self.local
    }

    fn remote_peer(&self) -> &PeerId {
        &self.remote
    }

    fn local_multiaddr(&self) -> Multiaddr {
        self.conn.local_multiaddr()
    }

    fn remote_multiaddr(&self) -> Multiaddr {
        self.conn.remote_multiaddr()
    }

    fn local_addr(&self) -> SocketAddr {
        self.conn.local_addr()
    }

    fn remote_addr(&self) -> SocketAddr {
        self.conn.remote_addr()
    }

    fn transport(&self) -> Arc<dyn Transport> {
        self.conn.transport()
    }

    fn local_private_key(&self) -> Option<&SigningKey> {
        None
    }

    fn remote_public_key(&self) -> Option<&VerifyingKey> {
        None
    }

    fn remote_identity_digest(&self) -> Option<&str> {
        None
    }

    fn set_deadline(&self, deadline: Option<Instant>) -> io::Result<()> {
        self.conn.set_deadline(deadline)
    }

    fn set_read_deadline(&self, deadline: Option<Instant>) -> io::Result<()> {
        self.conn.set_read_deadline(deadline)
    }

    fn set_write_deadline(&self, deadline: Option<Instant>) -> io::Result<()> {
        self.conn.set_write_deadline(deadline)
    }

    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.conn.read(buf)
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        self.conn.write(buf)
    }

    fn flush(&self) -> io::Result<()> {
        self.conn.flush()
    }

    fn close(&self) -> io::Result<()> {
        let _finish = FinishEventOnExit(self);
        self.conn.close()
    }
}

impl<C> Drop for PeerConn<C> {
    fn drop(&mut self) {
        let slot = match self.event.get_mut() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(span) = slot.take() {
            debug!("{} {} dropped without close", CONN_TYPE_NAME, self.id);
            span.close();
        }
    }
}

impl<C: TransportConn> io::Read for PeerConn<C> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Conn::read(&*self, buf)
    }
}

impl<C: TransportConn> io::Read for &PeerConn<C> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Conn::read(*self, buf)
    }
}

impl<C: TransportConn> io::Write for PeerConn<C> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Conn::write(&*self, buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Conn::flush(&*self)
    }
}

impl<C: TransportConn> io::Write for &PeerConn<C> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Conn::write(*self, buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Conn::flush(*self)
    }
}

impl<C: TransportConn> fmt::Display for PeerConn<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}) <-- {}[{}] --> ({}) {}",
            self.local,
            self.conn.local_multiaddr(),
            CONN_TYPE_NAME,
            self.id,
            self.conn.remote_multiaddr(),
            self.remote
        )
    }
}

impl<C> fmt::Debug for PeerConn<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(CONN_TYPE_NAME)
            .field("id", &self.id)
            .field("local", &self.local)
            .field("remote", &self.remote)
            .finish_non_exhaustive()
    }
}

/// Hash the local endpoint, the remote endpoint and the per-process sequence
/// number; the sequence number keeps ids distinct between instances.
fn conn_id(fields: &DialFields, seq: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{}/{}", fields.local_addr, fields.local_peer));
    hasher.update(b"\n");
    hasher.update(format!("{}/{}", fields.remote_addr, fields.remote_peer));
    hasher.update(seq.to_be_bytes());
    hex::encode(&hasher.finalize()[..CONN_ID_BYTES])
}
