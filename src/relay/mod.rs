//! Relay subsystem.
//!
//! # Data Flow
//! ```text
//! admitted downstream socket
//!     → session.rs (dial upstream, two pumps, idle watchdog, close)
//!     → flow.rs (write with pause/resume accounting)
//!     → protocol observer per direction
//!     → events to the correlator
//!
//! transport errors → fault.rs (expected vs unexpected, close reason)
//! ```
//!
//! # Design Decisions
//! - One task per relay; both directions polled inside it
//! - At most one chunk in flight per direction; reads wait for writes
//! - Bytes are forwarded unchanged whatever the observer makes of them

pub mod fault;
pub mod flow;
pub mod session;

pub use fault::{CloseReason, FaultClass};
pub use flow::FlowStats;
pub use session::{Relay, RelaySettings};
