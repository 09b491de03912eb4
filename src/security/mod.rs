//! Security subsystem.
//!
//! # Data Flow
//! ```text
//! Accepted TCP connection:
//!     → admission.rs (per-source throttle, global connection cap)
//!     → rejected: socket dropped, nothing else happens
//!     → admitted: handed to a relay
//! ```
//!
//! # Design Decisions
//! - Fail closed: reject on any admission check failure
//! - Rejection is a hard TCP close with no protocol-level reply
//! - Admission state is owned by one listener, never global

pub mod admission;

pub use admission::{Admission, AdmissionLimits, Rejection};
