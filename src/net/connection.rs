//! Connection entity, lifecycle state and active-connection tracking.
//!
//! # Responsibilities
//! - Generate unique connection IDs for tracing and correlation
//! - Hold per-connection state (byte counters, activity, worker identity)
//! - Enforce the one-way lifecycle (Connecting → Active → Closing → Closed)
//! - Count active relays for admission and graceful shutdown

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

use crate::observability::events::Labels;

/// Global atomic counter for connection IDs.
/// Using relaxed ordering is sufficient since we only need uniqueness, not synchronization.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// One of the two transports owned by a relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    /// The accepted peer (miner).
    Downstream,
    /// The configured target (pool).
    Upstream,
}

impl Side {
    /// The transport bytes from this side are forwarded to.
    pub fn opposite(self) -> Self {
        match self {
            Side::Downstream => Side::Upstream,
            Side::Upstream => Side::Downstream,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Side::Downstream => "downstream",
            Side::Upstream => "upstream",
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Relay lifecycle state.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    /// Upstream dial in flight.
    Connecting = 0,
    /// Both transports usable, bytes flowing.
    Active = 1,
    /// Close initiated.
    Closing = 2,
    /// Terminal. No further events.
    Closed = 3,
}

impl From<u8> for RelayState {
    fn from(val: u8) -> Self {
        match val {
            0 => RelayState::Connecting,
            1 => RelayState::Active,
            2 => RelayState::Closing,
            _ => RelayState::Closed,
        }
    }
}

/// Longest worker name kept for labeling, in bytes.
pub const MAX_WORKER_NAME: usize = 128;

fn truncate_worker(name: &str) -> &str {
    if name.len() <= MAX_WORKER_NAME {
        return name;
    }
    let mut end = MAX_WORKER_NAME;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}

/// State of a single relayed connection.
///
/// Owned by the relay that created it. Counters are atomics so both
/// forwarding directions can update them without coordination.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    peer: SocketAddr,
    upstream: Arc<str>,
    created_at: Instant,
    last_activity: Mutex<Instant>,
    /// Bytes forwarded downstream → upstream.
    bytes_sent: AtomicU64,
    /// Bytes forwarded upstream → downstream.
    bytes_received: AtomicU64,
    /// Set at most once, from the first authorization request.
    worker: OnceLock<Arc<str>>,
    state: AtomicU8,
}

impl Connection {
    pub fn new(id: ConnectionId, peer: SocketAddr, upstream: Arc<str>) -> Self {
        let now = Instant::now();
        Self {
            id,
            peer,
            upstream,
            created_at: now,
            last_activity: Mutex::new(now),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            worker: OnceLock::new(),
            state: AtomicU8::new(RelayState::Connecting as u8),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn upstream(&self) -> &str {
        &self.upstream
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Time since the connection was accepted.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Account for a chunk received from `from` and mark the connection active.
    pub fn record_inbound(&self, from: Side, bytes: usize) {
        *self.last_activity.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
        let counter = match from {
            Side::Downstream => &self.bytes_sent,
            Side::Upstream => &self.bytes_received,
        };
        counter.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn last_activity(&self) -> Instant {
        *self.last_activity.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    pub fn worker(&self) -> Option<&str> {
        self.worker.get().map(|w| &**w)
    }

    /// Bind the worker identity. Returns false if one was already bound.
    ///
    /// Names are client-chosen and end up as metric labels, so they are cut
    /// to [`MAX_WORKER_NAME`] bytes on a character boundary.
    pub fn bind_worker(&self, name: &str) -> bool {
        self.worker.set(Arc::from(truncate_worker(name))).is_ok()
    }

    /// Labels for events emitted from now on.
    pub fn labels(&self) -> Labels {
        Labels {
            worker: self.worker.get().cloned(),
            upstream: Arc::clone(&self.upstream),
        }
    }

    pub fn state(&self) -> RelayState {
        RelayState::from(self.state.load(Ordering::Acquire))
    }

    /// Connecting → Active. Fails if a close already started.
    pub fn activate(&self) -> bool {
        self.state
            .compare_exchange(
                RelayState::Connecting as u8,
                RelayState::Active as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Move to Closing from any earlier state. Only the first caller wins.
    pub fn begin_close(&self) -> bool {
        self.state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |s| {
                (s < RelayState::Closing as u8).then_some(RelayState::Closing as u8)
            })
            .is_ok()
    }

    pub fn finish_close(&self) {
        self.state.store(RelayState::Closed as u8, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state(), RelayState::Closing | RelayState::Closed)
    }
}

/// Tracks active relays for admission and graceful shutdown.
#[derive(Debug, Clone, Default)]
pub struct ConnectionTracker {
    /// Current count of active relays.
    active_count: Arc<AtomicU64>,
}

impl ConnectionTracker {
    /// Create a new connection tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new active relay. Returns a guard that decrements on drop.
    pub fn track(&self, id: ConnectionId) -> ConnectionGuard {
        self.active_count.fetch_add(1, Ordering::SeqCst);
        ConnectionGuard {
            active_count: Arc::clone(&self.active_count),
            id,
        }
    }

    /// Get current active connection count.
    pub fn active_count(&self) -> u64 {
        self.active_count.load(Ordering::SeqCst)
    }

    /// Wait until all relays have finished, giving up after `deadline`.
    ///
    /// Returns true if the count reached zero in time.
    pub async fn wait_for_drain(&self, deadline: Duration) -> bool {
        let drained = async {
            while self.active_count.load(Ordering::SeqCst) > 0 {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        };
        tokio::time::timeout(deadline, drained).await.is_ok()
    }
}

/// Guard that tracks a relay's lifetime.
/// Decrements active count when dropped.
#[derive(Debug)]
pub struct ConnectionGuard {
    active_count: Arc<AtomicU64>,
    id: ConnectionId,
}

impl ConnectionGuard {
    /// Get this connection's ID.
    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.active_count.fetch_sub(1, Ordering::SeqCst);
        tracing::trace!(connection_id = %self.id, "Relay released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connection() -> Connection {
        Connection::new(
            ConnectionId::new(),
            "127.0.0.1:40000".parse().unwrap(),
            Arc::from("pool.example:3333"),
        )
    }

    #[test]
    fn long_worker_names_are_cut() {
        let conn = connection();
        let name = format!("{}é-rig", "a".repeat(MAX_WORKER_NAME - 1));
        assert!(conn.bind_worker(&name));
        let bound = conn.worker().unwrap();
        assert_eq!(bound, "a".repeat(MAX_WORKER_NAME - 1));
        assert!(bound.len() <= MAX_WORKER_NAME);

        let short = connection();
        assert!(short.bind_worker("alice.rig1"));
        assert_eq!(short.worker(), Some("alice.rig1"));
    }

    #[test]
    fn connection_id_unique() {
        let id1 = ConnectionId::new();
        let id2 = ConnectionId::new();
        assert_ne!(id1, id2);
        assert!(id2.to_string().starts_with("conn-"));
    }

    #[test]
    fn connection_tracker_counts() {
        let tracker = ConnectionTracker::new();
        assert_eq!(tracker.active_count(), 0);

        let guard1 = tracker.track(ConnectionId::new());
        assert_eq!(tracker.active_count(), 1);

        let guard2 = tracker.track(ConnectionId::new());
        assert_eq!(tracker.active_count(), 2);

        drop(guard1);
        assert_eq!(tracker.active_count(), 1);

        drop(guard2);
        assert_eq!(tracker.active_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn drain_gives_up_after_deadline() {
        let tracker = ConnectionTracker::new();
        let guard = tracker.track(ConnectionId::new());
        assert!(!tracker.wait_for_drain(Duration::from_secs(1)).await);

        drop(guard);
        assert!(tracker.wait_for_drain(Duration::from_secs(1)).await);
    }

    #[test]
    fn worker_identity_binds_once() {
        let conn = connection();
        assert_eq!(conn.worker(), None);
        assert!(conn.labels().worker.is_none());

        assert!(conn.bind_worker("alice.rig1"));
        assert!(!conn.bind_worker("mallory"));
        assert_eq!(conn.worker(), Some("alice.rig1"));
        assert_eq!(conn.labels().worker.as_deref(), Some("alice.rig1"));
    }

    #[test]
    fn byte_counters_follow_direction() {
        let conn = connection();
        conn.record_inbound(Side::Downstream, 10);
        conn.record_inbound(Side::Upstream, 3);
        conn.record_inbound(Side::Downstream, 5);
        assert_eq!(conn.bytes_sent(), 15);
        assert_eq!(conn.bytes_received(), 3);
    }

    #[test]
    fn lifecycle_is_one_way() {
        let conn = connection();
        assert_eq!(conn.state(), RelayState::Connecting);
        assert!(conn.activate());
        assert!(!conn.activate());

        assert!(conn.begin_close());
        assert!(!conn.begin_close());
        assert_eq!(conn.state(), RelayState::Closing);

        conn.finish_close();
        assert_eq!(conn.state(), RelayState::Closed);
        assert!(!conn.begin_close());
        assert!(!conn.activate());
    }

    #[test]
    fn close_before_activation_blocks_activation() {
        let conn = connection();
        assert!(conn.begin_close());
        assert!(!conn.activate());
        assert!(conn.is_closed());
    }
}
