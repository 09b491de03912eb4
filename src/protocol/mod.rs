//! Stratum observation subsystem.
//!
//! # Data Flow
//! ```text
//! Relayed chunk (either direction)
//!     → observer.rs (line accumulation, JSON parse, noise detection)
//!     → message.rs (classify into Request / Response / Notification)
//!     → relay emits the decoded message as an event
//! ```
//!
//! # Design Decisions
//! - Observation never alters or delays forwarded bytes
//! - Malformed input is recovered locally, never fails the connection
//! - Memory per direction is capped by the pending-line ceiling

pub mod message;
pub mod observer;

pub use message::{Message, Notification, Request, Response};
pub use observer::{Noise, Observation, ProtocolObserver};
