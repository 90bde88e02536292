//! Peer-identity-aware connections.
//!
//! This crate provides:
//! - [`PeerConn`]: a transport connection tagged with the local and remote
//!   [`PeerId`], with a lifecycle span from construction to close
//! - the [`TransportConn`] / [`Transport`] contracts it wraps, and a plain
//!   TCP implementation of them
//! - [`EventLog`] sinks for lifecycle spans, defaulting to `tracing`
//! - a capacity-class [`BufferPool`] and [`release_buffer`] for read buffers
//!
//! # Design
//!
//! `PeerConn` adds no security or multiplexing. Reads, writes, deadlines
//! and close go straight to the transport connection and come back
//! unchanged, errors included. The key accessors on [`Conn`] are reserved
//! for a security layer and always return `None` here.

#![forbid(unsafe_code)]

pub mod buffer_pool;
pub mod conn;
pub mod event_log;
pub mod identity;
pub mod transport;

pub use buffer_pool::{release_buffer, release_buffer_to, BufferPool, BufferPoolConfig, BufferSink};
pub use conn::{Conn, PeerConn};
pub use event_log::{DialFields, EventLog, EventSpan, TracingEventLog};
pub use identity::PeerId;
pub use multiaddr::Multiaddr;
pub use transport::{TcpConfig, TcpConn, TcpListener, TcpTransport, Transport, TransportConn};
