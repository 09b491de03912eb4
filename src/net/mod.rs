//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (accept loop, admission)
//!     → connection.rs (identity, counters, state machine)
//!     → Hand off to a relay task
//!
//! Connection States:
//!     Connecting → Active → Closing → Closed
//! ```
//!
//! # Design Decisions
//! - Admission happens before any relay or upstream dial exists
//! - Each relay tracked for graceful shutdown
//! - Listener-owned state only; several listeners can coexist in one process

pub mod connection;
pub mod listener;

pub use connection::{Connection, ConnectionId, ConnectionTracker, Side};
pub use listener::{Listener, ListenerError};
