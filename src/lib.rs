//! Transparent Stratum relay library.
//!
//! Accepts miner connections, relays each one byte-for-byte to a single pool,
//! and derives share, latency and traffic metrics from what passes through.

pub mod config;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod protocol;
pub mod relay;
pub mod security;

pub use config::schema::ProxyConfig;
pub use lifecycle::Shutdown;
pub use net::Listener;
pub use relay::Relay;
