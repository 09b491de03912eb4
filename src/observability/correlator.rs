//! Event correlation into aggregate metrics.
//!
//! # Responsibilities
//! - Maintain counters, gauges and histograms derived from relay events
//! - Pair `mining.submit` requests with their responses for latency
//! - Expose the aggregate state in pull form (`snapshot`)
//! - Mirror every update into the `metrics` facade
//!
//! # Design Decisions
//! - Pure observer: never feeds back into relays
//! - Latency uses event timestamps, not processing time
//! - Pending requests of a connection are dropped when it closes

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::net::connection::{ConnectionId, Side};
use crate::observability::events::{Event, EventKind, EventReceiver, Labels};
use crate::observability::metrics::{
    self, CONNECTION_DURATION_BUCKETS, CONNECT_LATENCY_BUCKETS, REQUEST_LATENCY_BUCKETS,
};
use crate::relay::fault::FaultClass;

/// Fixed-bucket histogram.
#[derive(Debug, Clone, PartialEq)]
pub struct Histogram {
    bounds: &'static [f64],
    /// Per-bucket counts; the final slot holds observations above every bound.
    buckets: Vec<u64>,
    count: u64,
    sum: f64,
}

impl Histogram {
    pub fn new(bounds: &'static [f64]) -> Self {
        Self {
            bounds,
            buckets: vec![0; bounds.len() + 1],
            count: 0,
            sum: 0.0,
        }
    }

    pub fn observe(&mut self, value: f64) {
        let slot = self
            .bounds
            .iter()
            .position(|&bound| value <= bound)
            .unwrap_or(self.bounds.len());
        self.buckets[slot] += 1;
        self.count += 1;
        self.sum += value;
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn sum(&self) -> f64 {
        self.sum
    }

    pub fn bounds(&self) -> &'static [f64] {
        self.bounds
    }

    /// Cumulative count of observations `<= bounds[i]`.
    pub fn cumulative(&self) -> Vec<u64> {
        self.buckets[..self.bounds.len()]
            .iter()
            .scan(0, |acc, &n| {
                *acc += n;
                Some(*acc)
            })
            .collect()
    }
}

/// Aggregate state derived from the event stream.
#[derive(Debug, Clone, PartialEq)]
pub struct Aggregates {
    pub active_connections: u64,
    pub connections_total: u64,
    pub connection_duration: Histogram,
    pub connect_latency: Histogram,
    pub bytes_sent: HashMap<Labels, u64>,
    pub bytes_received: HashMap<Labels, u64>,
    pub submits: HashMap<Labels, u64>,
    pub shares_accepted: HashMap<Labels, u64>,
    pub shares_rejected: HashMap<Labels, u64>,
    pub request_latency: Histogram,
    pub notifications: HashMap<String, u64>,
    pub difficulty: HashMap<Labels, f64>,
    pub errors: HashMap<(Side, FaultClass), u64>,
    /// Submits still waiting for a response.
    pub pending_requests: usize,
}

impl Default for Aggregates {
    fn default() -> Self {
        Self {
            active_connections: 0,
            connections_total: 0,
            connection_duration: Histogram::new(CONNECTION_DURATION_BUCKETS),
            connect_latency: Histogram::new(CONNECT_LATENCY_BUCKETS),
            bytes_sent: HashMap::new(),
            bytes_received: HashMap::new(),
            submits: HashMap::new(),
            shares_accepted: HashMap::new(),
            shares_rejected: HashMap::new(),
            request_latency: Histogram::new(REQUEST_LATENCY_BUCKETS),
            notifications: HashMap::new(),
            difficulty: HashMap::new(),
            errors: HashMap::new(),
            pending_requests: 0,
        }
    }
}

/// Sum a labeled counter across all label sets.
pub fn total(counter: &HashMap<Labels, u64>) -> u64 {
    counter.values().sum()
}

/// Folds relay events into [`Aggregates`].
#[derive(Debug, Default)]
pub struct Correlator {
    aggregates: Aggregates,
    open: HashSet<ConnectionId>,
    /// connection → (request id → issue time).
    pending: HashMap<ConnectionId, HashMap<String, Instant>>,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn aggregates(&self) -> &Aggregates {
        &self.aggregates
    }

    pub fn record(&mut self, event: &Event) {
        let agg = &mut self.aggregates;
        match &event.kind {
            EventKind::Opened { connect_latency, .. } => {
                if self.open.insert(event.connection) {
                    agg.active_connections += 1;
                    agg.connections_total += 1;
                    agg.connect_latency.observe(connect_latency.as_secs_f64());
                    metrics::record_opened(*connect_latency);
                }
            }
            EventKind::Closed { reason, duration, .. } => {
                // Dial failures close without ever opening.
                if self.open.remove(&event.connection) {
                    agg.active_connections -= 1;
                    agg.connection_duration.observe(duration.as_secs_f64());
                    metrics::record_closed(*duration, reason.as_str());
                }
                if let Some(stale) = self.pending.remove(&event.connection) {
                    if !stale.is_empty() {
                        tracing::debug!(
                            connection_id = %event.connection,
                            unanswered = stale.len(),
                            "Dropping unanswered submits of closed connection"
                        );
                    }
                    agg.pending_requests -= stale.len();
                }
            }
            EventKind::BytesSent(bytes) => {
                *agg.bytes_sent.entry(event.labels.clone()).or_default() += bytes;
                metrics::record_bytes_sent(&event.labels, *bytes);
            }
            EventKind::BytesReceived(bytes) => {
                *agg.bytes_received.entry(event.labels.clone()).or_default() += bytes;
                metrics::record_bytes_received(&event.labels, *bytes);
            }
            EventKind::Request(request) => {
                if !request.is_submit() {
                    return;
                }
                *agg.submits.entry(event.labels.clone()).or_default() += 1;
                metrics::record_submit(&event.labels);
                if let Some(key) = request.correlation_key() {
                    let issued = self.pending.entry(event.connection).or_default();
                    if issued.insert(key, event.at).is_none() {
                        agg.pending_requests += 1;
                    }
                }
            }
            EventKind::Response(response) => {
                let Some(key) = response.correlation_key() else {
                    return;
                };
                let Some(issued_at) = self
                    .pending
                    .get_mut(&event.connection)
                    .and_then(|issued| issued.remove(&key))
                else {
                    return;
                };
                agg.pending_requests -= 1;

                let latency = event.at.saturating_duration_since(issued_at);
                agg.request_latency.observe(latency.as_secs_f64());
                let accepted = response.is_accepted();
                let counter = if accepted {
                    &mut agg.shares_accepted
                } else {
                    &mut agg.shares_rejected
                };
                *counter.entry(event.labels.clone()).or_default() += 1;
                metrics::record_share(&event.labels, accepted, latency);
            }
            EventKind::Notification(notification) => {
                *agg.notifications.entry(notification.method.clone()).or_default() += 1;
                metrics::record_notification(&notification.method);
                if let Some(difficulty) = notification.difficulty() {
                    agg.difficulty.insert(event.labels.clone(), difficulty);
                    metrics::record_difficulty(&event.labels, difficulty);
                }
            }
            EventKind::Error { side, class, .. } => {
                *agg.errors.entry((*side, *class)).or_default() += 1;
                metrics::record_error(side.as_str(), class.as_str());
            }
        }
    }
}

/// Shared, queryable handle to a running correlator.
#[derive(Debug, Clone, Default)]
pub struct CorrelatorHandle {
    inner: Arc<Mutex<Correlator>>,
}

impl CorrelatorHandle {
    /// Point-in-time copy of the aggregate state.
    pub fn snapshot(&self) -> Aggregates {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .aggregates()
            .clone()
    }

    fn record(&self, event: &Event) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record(event);
    }
}

/// Consume `events` until every sender is gone.
pub fn spawn(mut events: EventReceiver) -> (CorrelatorHandle, JoinHandle<()>) {
    let handle = CorrelatorHandle::default();
    let worker = handle.clone();
    let task = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            tracing::trace!(connection_id = %event.connection, event = event.kind.name(), "Event");
            worker.record(&event);
        }
        tracing::debug!("Event stream closed, correlator stopping");
    });
    (handle, task)
}
