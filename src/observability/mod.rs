//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Relays produce:
//!     → events.rs (typed lifecycle / traffic / protocol events on an mpsc channel)
//!     → correlator.rs (counters, gauges, histograms, submit latency pairing)
//!     → metrics.rs (mirrored into the metrics facade, Prometheus scrape)
//!
//! Everything logs through:
//!     → logging.rs (tracing subscriber, pretty or JSON)
//! ```
//!
//! # Design Decisions
//! - Relays never wait on observability; the event channel is unbounded
//! - The correlator is the single writer of aggregate state
//! - Metric updates are cheap facade calls, no-ops without a recorder

pub mod correlator;
pub mod events;
pub mod logging;
pub mod metrics;
