//! Transport fault classification.
//!
//! # Design Decisions
//! - Classification only picks the log level and metric label
//! - Every fault closes the one affected connection, nothing else

use std::io;

use crate::net::connection::{ConnectionId, Side};

/// Whether a transport error is routine churn or something worth a look.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultClass {
    /// Peer reset, timeout, broken pipe, refused, unreachable.
    Expected,
    Unexpected,
}

impl FaultClass {
    pub fn of(err: &io::Error) -> Self {
        use io::ErrorKind::*;
        match err.kind() {
            ConnectionReset | ConnectionAborted | ConnectionRefused | TimedOut | BrokenPipe
            | NotConnected | UnexpectedEof | HostUnreachable | NetworkUnreachable => {
                FaultClass::Expected
            }
            _ => FaultClass::Unexpected,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FaultClass::Expected => "expected",
            FaultClass::Unexpected => "unexpected",
        }
    }
}

/// Why a relay closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseReason {
    /// End of stream from one side.
    PeerClosed(Side),
    /// Read or write failure on one side.
    TransportError(Side),
    IdleTimeout,
    /// Listener shutdown.
    Shutdown,
    /// Upstream dial failed or timed out.
    ConnectFailed,
    /// Closed through [`Relay::close`](crate::relay::Relay::close).
    Local,
}

impl CloseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            CloseReason::PeerClosed(Side::Downstream) => "downstream_closed",
            CloseReason::PeerClosed(Side::Upstream) => "upstream_closed",
            CloseReason::TransportError(Side::Downstream) => "downstream_error",
            CloseReason::TransportError(Side::Upstream) => "upstream_error",
            CloseReason::IdleTimeout => "idle_timeout",
            CloseReason::Shutdown => "shutdown",
            CloseReason::ConnectFailed => "connect_failed",
            CloseReason::Local => "local",
        }
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Log a transport fault at the level its class deserves.
pub fn log_fault(connection: ConnectionId, side: Side, err: &io::Error) -> FaultClass {
    let class = FaultClass::of(err);
    match class {
        FaultClass::Expected => tracing::debug!(
            connection_id = %connection,
            side = %side,
            error = %err,
            "Transport closed by peer"
        ),
        FaultClass::Unexpected => tracing::error!(
            connection_id = %connection,
            side = %side,
            error = %err,
            kind = ?err.kind(),
            "Transport failure"
        ),
    }
    class
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routine_network_errors_are_expected() {
        for kind in [
            io::ErrorKind::ConnectionReset,
            io::ErrorKind::ConnectionRefused,
            io::ErrorKind::TimedOut,
            io::ErrorKind::BrokenPipe,
            io::ErrorKind::HostUnreachable,
        ] {
            assert_eq!(FaultClass::of(&io::Error::from(kind)), FaultClass::Expected, "{kind:?}");
        }
    }

    #[test]
    fn everything_else_is_unexpected() {
        for kind in [
            io::ErrorKind::PermissionDenied,
            io::ErrorKind::InvalidData,
            io::ErrorKind::OutOfMemory,
            io::ErrorKind::Other,
        ] {
            assert_eq!(FaultClass::of(&io::Error::from(kind)), FaultClass::Unexpected, "{kind:?}");
        }
    }

    #[test]
    fn close_reason_labels() {
        assert_eq!(CloseReason::PeerClosed(Side::Upstream).as_str(), "upstream_closed");
        assert_eq!(CloseReason::IdleTimeout.to_string(), "idle_timeout");
    }
}
