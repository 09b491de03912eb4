//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the relay.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};

/// Root configuration for the stratum relay.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct ProxyConfig {
    /// Listener configuration (bind address, connection cap).
    pub listener: ListenerConfig,

    /// The single upstream pool.
    pub upstream: UpstreamConfig,

    /// Per-source connection throttling.
    pub admission: AdmissionConfig,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Forwarding buffer settings.
    pub relay: RelayConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:3333").
    pub bind_address: String,

    /// Maximum concurrent relays. Connections beyond this are rejected.
    pub max_connections: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:3333".to_string(),
            max_connections: 10_000,
        }
    }
}

/// Upstream pool configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Pool address as `host:port`. Hostnames are resolved per dial.
    pub address: String,

    /// Upstream dial timeout in seconds.
    pub connect_timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:3334".to_string(),
            connect_timeout_secs: 5,
        }
    }
}

/// Admission throttle configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Admitted connections allowed per source address within the window.
    pub max_attempts: usize,

    /// Trailing window in seconds. Zero disables the throttle.
    pub window_secs: u64,

    /// How often idle source addresses are forgotten, in seconds.
    pub sweep_interval_secs: u64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            window_secs: 5,
            sweep_interval_secs: 60,
        }
    }
}

/// Timeout configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Close a relay after this many seconds without traffic.
    pub idle_secs: u64,

    /// How long shutdown waits for relays to close, in seconds.
    pub shutdown_grace_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            idle_secs: 30 * 60,
            shutdown_grace_secs: 10,
        }
    }
}

/// Forwarding configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct RelayConfig {
    /// Read buffer per direction, the largest chunk held in flight.
    pub read_buffer_bytes: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            read_buffer_bytes: 16 * 1024,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Log output format.
    pub log_format: LogFormat,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: true,
            metrics_address: "0.0.0.0:9100".to_string(),
        }
    }
}
