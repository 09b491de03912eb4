//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define relay metric names and histogram buckets
//! - Install the Prometheus recorder and scrape endpoint
//! - Thin `record_*` helpers over the `metrics` facade
//!
//! # Metrics
//! - `stratum_relay_connections_total` (counter): relays opened
//! - `stratum_relay_active_connections` (gauge): relays currently open
//! - `stratum_relay_connection_duration_seconds` (histogram)
//! - `stratum_relay_connect_latency_seconds` (histogram): upstream dial time
//! - `stratum_relay_bytes_sent_total` / `_bytes_received_total` (counter): by worker, upstream
//! - `stratum_relay_submits_total`, `_shares_accepted_total`, `_shares_rejected_total` (counter)
//! - `stratum_relay_request_latency_seconds` (histogram): submit → response
//! - `stratum_relay_notifications_total` (counter): by method
//! - `stratum_relay_difficulty` (gauge): by worker, upstream
//! - `stratum_relay_errors_total` (counter): by side, class
//! - `stratum_relay_rejections_total` (counter): admission rejections by reason
//!
//! Without an installed recorder every helper is a no-op.

use std::net::{AddrParseError, SocketAddr};
use std::time::Duration;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder};
use thiserror::Error;

use crate::observability::events::Labels;

pub const CONNECTIONS_TOTAL: &str = "stratum_relay_connections_total";
pub const ACTIVE_CONNECTIONS: &str = "stratum_relay_active_connections";
pub const CONNECTION_DURATION: &str = "stratum_relay_connection_duration_seconds";
pub const CONNECT_LATENCY: &str = "stratum_relay_connect_latency_seconds";
pub const BYTES_SENT: &str = "stratum_relay_bytes_sent_total";
pub const BYTES_RECEIVED: &str = "stratum_relay_bytes_received_total";
pub const SUBMITS: &str = "stratum_relay_submits_total";
pub const SHARES_ACCEPTED: &str = "stratum_relay_shares_accepted_total";
pub const SHARES_REJECTED: &str = "stratum_relay_shares_rejected_total";
pub const REQUEST_LATENCY: &str = "stratum_relay_request_latency_seconds";
pub const NOTIFICATIONS: &str = "stratum_relay_notifications_total";
pub const DIFFICULTY: &str = "stratum_relay_difficulty";
pub const ERRORS: &str = "stratum_relay_errors_total";
pub const REJECTIONS: &str = "stratum_relay_rejections_total";

pub const CONNECTION_DURATION_BUCKETS: &[f64] = &[1.0, 10.0, 60.0, 300.0, 600.0, 1800.0, 3600.0, 7200.0];
pub const CONNECT_LATENCY_BUCKETS: &[f64] = &[0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0];
pub const REQUEST_LATENCY_BUCKETS: &[f64] = &[0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.0];

/// Failure to bring up the scrape endpoint.
#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("invalid metrics address '{address}': {source}")]
    Address {
        address: String,
        source: AddrParseError,
    },

    #[error("failed to install Prometheus recorder: {0}")]
    Install(#[from] BuildError),
}

/// Install the Prometheus recorder with a scrape listener on `address`.
///
/// Must be called from within a Tokio runtime.
pub fn init_metrics(address: &str) -> Result<(), MetricsError> {
    let addr: SocketAddr = address.parse().map_err(|source| MetricsError::Address {
        address: address.to_string(),
        source,
    })?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .set_buckets_for_metric(Matcher::Full(CONNECTION_DURATION.to_string()), CONNECTION_DURATION_BUCKETS)?
        .set_buckets_for_metric(Matcher::Full(CONNECT_LATENCY.to_string()), CONNECT_LATENCY_BUCKETS)?
        .set_buckets_for_metric(Matcher::Full(REQUEST_LATENCY.to_string()), REQUEST_LATENCY_BUCKETS)?
        .install()?;

    tracing::info!(address = %addr, "Metrics endpoint listening");
    Ok(())
}

fn label_pairs(labels: &Labels) -> [(&'static str, String); 2] {
    [
        ("worker", labels.worker_or_unknown().to_string()),
        ("upstream", labels.upstream.to_string()),
    ]
}

pub fn record_opened(connect_latency: Duration) {
    counter!(CONNECTIONS_TOTAL).increment(1);
    gauge!(ACTIVE_CONNECTIONS).increment(1.0);
    histogram!(CONNECT_LATENCY).record(connect_latency.as_secs_f64());
}

pub fn record_closed(duration: Duration, reason: &'static str) {
    gauge!(ACTIVE_CONNECTIONS).decrement(1.0);
    histogram!(CONNECTION_DURATION, "reason" => reason).record(duration.as_secs_f64());
}

pub fn record_bytes_sent(labels: &Labels, bytes: u64) {
    counter!(BYTES_SENT, &label_pairs(labels)).increment(bytes);
}

pub fn record_bytes_received(labels: &Labels, bytes: u64) {
    counter!(BYTES_RECEIVED, &label_pairs(labels)).increment(bytes);
}

pub fn record_submit(labels: &Labels) {
    counter!(SUBMITS, &label_pairs(labels)).increment(1);
}

pub fn record_share(labels: &Labels, accepted: bool, latency: Duration) {
    let name = if accepted { SHARES_ACCEPTED } else { SHARES_REJECTED };
    counter!(name, &label_pairs(labels)).increment(1);
    histogram!(REQUEST_LATENCY).record(latency.as_secs_f64());
}

pub fn record_notification(method: &str) {
    counter!(NOTIFICATIONS, "method" => method.to_string()).increment(1);
}

pub fn record_difficulty(labels: &Labels, difficulty: f64) {
    gauge!(DIFFICULTY, &label_pairs(labels)).set(difficulty);
}

pub fn record_error(side: &'static str, class: &'static str) {
    counter!(ERRORS, "side" => side, "class" => class).increment(1);
}

pub fn record_rejection(reason: &'static str) {
    counter!(REJECTIONS, "reason" => reason).increment(1);
}
