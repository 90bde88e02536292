//! Lifecycle event spans.
//!
//! An [`EventLog`] opens a named, open-ended span carrying structured
//! fields and hands back an [`EventSpan`]; closing the handle records the
//! end of the interval. [`TracingEventLog`] maps this onto `tracing` spans.

use std::fmt;
use std::time::Instant;

use multiaddr::Multiaddr;
use peerconn_common::Result;
use tracing::{info_span, Span};

use crate::identity::PeerId;

/// Structured fields attached to a connection lifetime span.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialFields {
    pub system: &'static str,
    pub local_peer: PeerId,
    pub remote_peer: PeerId,
    pub local_addr: Multiaddr,
    pub remote_addr: Multiaddr,
}

/// A span that has begun and is waiting to be finished.
pub trait EventSpan: Send {
    /// Finish the span. Consumes the handle, so it cannot be finished twice.
    fn close(self: Box<Self>);
}

/// Sink for lifecycle spans.
pub trait EventLog: Send + Sync {
    /// Begin the span `event` as a child of `parent`.
    fn event_begin(
        &self,
        parent: &Span,
        event: &'static str,
        fields: &DialFields,
    ) -> Result<Box<dyn EventSpan>>;
}

/// [`EventLog`] that records spans through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventLog;

impl EventLog for TracingEventLog {
    fn event_begin(
        &self,
        parent: &Span,
        event: &'static str,
        fields: &DialFields,
    ) -> Result<Box<dyn EventSpan>> {
        let span = info_span!(
            parent: parent,
            "event",
            event,
            system = fields.system,
            local_peer = %fields.local_peer,
            remote_peer = %fields.remote_peer,
            local_addr = %fields.local_addr,
            remote_addr = %fields.remote_addr
        );
        span.in_scope(|| tracing::debug!("event begin"));
        Ok(Box::new(TracingEventSpan {
            span,
            started: Instant::now(),
        }))
    }
}

struct TracingEventSpan {
    span: Span,
    started: Instant,
}

impl fmt::Debug for TracingEventSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TracingEventSpan")
            .field("span", &self.span.id())
            .field("started", &self.started)
            .finish()
    }
}

impl EventSpan for TracingEventSpan {
    fn close(self: Box<Self>) {
        let elapsed_ms = self.started.elapsed().as_millis() as u64;
        self.span.in_scope(|| tracing::info!(elapsed_ms, "event finished"));
        // Dropping the last handle closes the span in the subscriber.
    }
}
