//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, limits > 0, buffer bounds)
//! - Check addresses the process binds are parseable
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ProxyConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;

use thiserror::Error;

use crate::config::schema::ProxyConfig;

/// Smallest accepted read buffer.
pub const MIN_READ_BUFFER: usize = 512;
/// Largest accepted read buffer.
pub const MAX_READ_BUFFER: usize = 1024 * 1024;

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{field}: '{value}' is not a valid socket address")]
    InvalidAddress { field: &'static str, value: String },

    #[error("{field}: '{value}' must be host:port")]
    InvalidHostPort { field: &'static str, value: String },

    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("relay.read_buffer_bytes must be between {min} and {max}, got {actual}")]
    ReadBuffer { min: usize, max: usize, actual: usize },

    #[error("observability.log_level '{0}' is not one of trace, debug, info, warn, error")]
    LogLevel(String),
}

/// Check every semantic constraint, collecting all violations.
pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    check_socket_addr(&mut errors, "listener.bind_address", &config.listener.bind_address);
    if config.observability.metrics_enabled {
        check_socket_addr(&mut errors, "observability.metrics_address", &config.observability.metrics_address);
    }
    check_host_port(&mut errors, "upstream.address", &config.upstream.address);

    let positive = [
        ("listener.max_connections", config.listener.max_connections as u64),
        ("upstream.connect_timeout_secs", config.upstream.connect_timeout_secs),
        ("admission.max_attempts", config.admission.max_attempts as u64),
        ("admission.sweep_interval_secs", config.admission.sweep_interval_secs),
        ("timeouts.idle_secs", config.timeouts.idle_secs),
    ];
    for (field, value) in positive {
        if value == 0 {
            errors.push(ValidationError::Zero { field });
        }
    }

    let buffer = config.relay.read_buffer_bytes;
    if !(MIN_READ_BUFFER..=MAX_READ_BUFFER).contains(&buffer) {
        errors.push(ValidationError::ReadBuffer {
            min: MIN_READ_BUFFER,
            max: MAX_READ_BUFFER,
            actual: buffer,
        });
    }

    if !LOG_LEVELS.contains(&config.observability.log_level.to_ascii_lowercase().as_str()) {
        errors.push(ValidationError::LogLevel(config.observability.log_level.clone()));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_socket_addr(errors: &mut Vec<ValidationError>, field: &'static str, value: &str) {
    if value.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::InvalidAddress {
            field,
            value: value.to_string(),
        });
    }
}

fn check_host_port(errors: &mut Vec<ValidationError>, field: &'static str, value: &str) {
    let valid = value.parse::<SocketAddr>().is_ok()
        || value
            .rsplit_once(':')
            .is_some_and(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok_and(|p| p != 0));
    if !valid {
        errors.push(ValidationError::InvalidHostPort {
            field,
            value: value.to_string(),
        });
    }
}
