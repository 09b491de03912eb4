//! Typed relay events.
//!
//! Relays publish onto an unbounded mpsc channel; the correlator (and any
//! other subscriber wired to the receiver) consumes them. Events are
//! immutable once sent. Within one connection they arrive in the order the
//! relay observed the underlying bytes.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::net::connection::{ConnectionId, Side};
use crate::protocol::{Notification, Request, Response};
use crate::relay::fault::{CloseReason, FaultClass};

pub type EventSender = mpsc::UnboundedSender<Event>;
pub type EventReceiver = mpsc::UnboundedReceiver<Event>;

/// Create the relay → correlator event channel.
pub fn channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// Label placeholder for connections that have not authorized yet.
pub const UNKNOWN_WORKER: &str = "unknown";

/// Labels attached to every event of a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Labels {
    pub worker: Option<Arc<str>>,
    pub upstream: Arc<str>,
}

impl Labels {
    pub fn worker_or_unknown(&self) -> &str {
        self.worker.as_deref().unwrap_or(UNKNOWN_WORKER)
    }
}

#[derive(Debug, Clone)]
pub struct Event {
    pub at: Instant,
    pub connection: ConnectionId,
    pub labels: Labels,
    pub kind: EventKind,
}

#[derive(Debug, Clone)]
pub enum EventKind {
    /// Upstream dial succeeded and forwarding started.
    Opened {
        peer: SocketAddr,
        connect_latency: Duration,
    },
    /// Emitted exactly once per relay.
    Closed {
        reason: CloseReason,
        duration: Duration,
        bytes_sent: u64,
        bytes_received: u64,
    },
    /// Bytes read from downstream and forwarded upstream.
    BytesSent(u64),
    /// Bytes read from upstream and forwarded downstream.
    BytesReceived(u64),
    Request(Request),
    Response(Response),
    Notification(Notification),
    Error {
        side: Side,
        class: FaultClass,
        message: String,
    },
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::Opened { .. } => "opened",
            EventKind::Closed { .. } => "closed",
            EventKind::BytesSent(_) => "bytes_sent",
            EventKind::BytesReceived(_) => "bytes_received",
            EventKind::Request(_) => "request",
            EventKind::Response(_) => "response",
            EventKind::Notification(_) => "notification",
            EventKind::Error { .. } => "error",
        }
    }

    /// Byte event for a chunk read from `from`.
    pub fn transfer(from: Side, bytes: usize) -> Self {
        match from {
            Side::Downstream => EventKind::BytesSent(bytes as u64),
            Side::Upstream => EventKind::BytesReceived(bytes as u64),
        }
    }
}
