//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (main.rs):
//!     Load config → Validate → Logging → Metrics → Correlator → Bind listener
//!
//! Shutdown:
//!     Signal received → Stop accepting → Close relays → Wait (with deadline) → Exit
//! ```
//!
//! # Design Decisions
//! - Fail fast: config and bind errors are fatal before serving
//! - Shutdown has a deadline: stragglers are logged, not awaited forever

pub mod shutdown;
pub mod signals;

pub use shutdown::Shutdown;
