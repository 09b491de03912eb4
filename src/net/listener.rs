//! TCP listener with admission control.
//!
//! # Responsibilities
//! - Bind to the configured address
//! - Accept incoming TCP connections
//! - Run admission (per-source throttle, max_connections) before a relay exists
//! - Spawn one relay task per admitted connection
//! - Apply hot-reloaded limits and settings to later connections
//! - Ordered shutdown: stop accepting, close relays, wait with a deadline

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::ProxyConfig;
use crate::lifecycle::Shutdown;
use crate::net::connection::{ConnectionId, ConnectionTracker};
use crate::observability::events::EventSender;
use crate::observability::metrics;
use crate::relay::{Relay, RelaySettings};
use crate::security::{Admission, AdmissionLimits};

/// Pause after a failed accept so descriptor exhaustion does not spin the loop.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Error type for listener operations.
#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("invalid bind address '{address}': {source}")]
    Address {
        address: String,
        source: std::net::AddrParseError,
    },

    #[error("failed to bind {address}: {source}")]
    Bind {
        address: SocketAddr,
        source: std::io::Error,
    },
}

/// Accepts downstream miners and relays each one to the upstream pool.
pub struct Listener {
    inner: TcpListener,
    local_addr: SocketAddr,
    admission: Admission,
    settings: RelaySettings,
    events: EventSender,
    tracker: ConnectionTracker,
    /// Broadcast to every relay this listener spawned.
    relays: Shutdown,
    sweep_interval: Duration,
    shutdown_grace: Duration,
}

impl Listener {
    /// Bind to the configured address. Failure here is fatal for the process.
    pub async fn bind(config: &ProxyConfig, events: EventSender) -> Result<Self, ListenerError> {
        let address = &config.listener.bind_address;
        let addr: SocketAddr = address.parse().map_err(|source| ListenerError::Address {
            address: address.clone(),
            source,
        })?;

        let inner = TcpListener::bind(addr)
            .await
            .map_err(|source| ListenerError::Bind { address: addr, source })?;
        let local_addr = inner
            .local_addr()
            .map_err(|source| ListenerError::Bind { address: addr, source })?;

        tracing::info!(
            address = %local_addr,
            upstream = %config.upstream.address,
            max_connections = config.listener.max_connections,
            "Listener bound"
        );

        Ok(Self {
            inner,
            local_addr,
            admission: Admission::new(AdmissionLimits::from_config(config)),
            settings: RelaySettings::from_config(config),
            events,
            tracker: ConnectionTracker::new(),
            relays: Shutdown::new(),
            sweep_interval: Duration::from_secs(config.admission.sweep_interval_secs),
            shutdown_grace: Duration::from_secs(config.timeouts.shutdown_grace_secs),
        })
    }

    /// The address actually bound (useful with port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Shared handle on the active relay count.
    pub fn tracker(&self) -> ConnectionTracker {
        self.tracker.clone()
    }

    /// Accept and relay until `shutdown` fires, then close every relay.
    ///
    /// Returns true if all relays closed within the shutdown grace period.
    pub async fn run(
        mut self,
        mut shutdown: broadcast::Receiver<()>,
        mut updates: mpsc::UnboundedReceiver<ProxyConfig>,
    ) -> bool {
        let mut sweep = tokio::time::interval_at(Instant::now() + self.sweep_interval, self.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                accepted = self.inner.accept() => match accepted {
                    Ok((stream, peer)) => self.admit(stream, peer),
                    Err(e) => {
                        tracing::warn!(error = %e, "Accept failed");
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                },
                _ = sweep.tick() => {
                    let dropped = self.admission.sweep(Instant::now());
                    tracing::trace!(
                        dropped,
                        tracked = self.admission.tracked_addresses(),
                        "Admission window swept"
                    );
                }
                Some(config) = updates.recv() => self.apply_config(&config),
                _ = shutdown.recv() => break,
            }
        }

        self.shut_down().await
    }

    fn admit(&mut self, stream: TcpStream, peer: SocketAddr) {
        let active = usize::try_from(self.tracker.active_count()).unwrap_or(usize::MAX);
        if let Err(rejection) = self.admission.check(peer.ip(), active, Instant::now()) {
            tracing::debug!(peer_addr = %peer, reason = rejection.as_str(), active, "Connection rejected");
            metrics::record_rejection(rejection.as_str());
            drop(stream);
            return;
        }

        let id = ConnectionId::new();
        let guard = self.tracker.track(id);
        let relay = Relay::new(id, peer, self.settings.clone(), self.events.clone());
        let shutdown = self.relays.subscribe();

        tracing::debug!(connection_id = %id, peer_addr = %peer, active = active + 1, "Connection admitted");

        tokio::spawn(async move {
            let _guard = guard;
            relay.serve(stream, shutdown).await;
        });
    }

    fn apply_config(&mut self, config: &ProxyConfig) {
        let limits = AdmissionLimits::from_config(config);
        if limits != self.admission.limits() {
            tracing::info!(
                max_attempts = limits.max_attempts,
                window_secs = limits.window.as_secs(),
                max_connections = limits.max_connections,
                "Admission limits updated"
            );
            self.admission.set_limits(limits);
        }

        self.settings = RelaySettings::from_config(config);
        self.shutdown_grace = Duration::from_secs(config.timeouts.shutdown_grace_secs);

        if config.listener.bind_address.parse::<SocketAddr>().ok() != Some(self.local_addr) {
            tracing::warn!(
                bind_address = %config.listener.bind_address,
                "Bind address changes take effect on restart"
            );
        }
    }

    async fn shut_down(self) -> bool {
        let Self {
            inner,
            mut admission,
            tracker,
            relays,
            shutdown_grace,
            ..
        } = self;

        drop(inner);
        admission.clear();

        let notified = relays.trigger();
        tracing::info!(
            relays = notified,
            grace_secs = shutdown_grace.as_secs(),
            "Listener stopped, closing relays"
        );

        let drained = tracker.wait_for_drain(shutdown_grace).await;
        if drained {
            tracing::info!("All relays closed");
        } else {
            tracing::warn!(remaining = tracker.active_count(), "Shutdown grace period expired with relays still open");
        }
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::events;

    fn config() -> ProxyConfig {
        let mut config = ProxyConfig::default();
        config.listener.bind_address = "127.0.0.1:0".into();
        config
    }

    #[tokio::test]
    async fn binds_ephemeral_port() {
        let (tx, _rx) = events::channel();
        let listener = Listener::bind(&config(), tx).await.unwrap();
        assert_ne!(listener.local_addr().port(), 0);
        assert_eq!(listener.tracker().active_count(), 0);
    }

    #[tokio::test]
    async fn invalid_address_is_rejected() {
        let mut config = config();
        config.listener.bind_address = "localhost".into();
        let (tx, _rx) = events::channel();
        let err = Listener::bind(&config, tx).await.err().unwrap();
        assert!(matches!(err, ListenerError::Address { .. }));
    }

    #[tokio::test]
    async fn occupied_port_is_fatal() {
        let (tx, _rx) = events::channel();
        let first = Listener::bind(&config(), tx.clone()).await.unwrap();

        let mut taken = config();
        taken.listener.bind_address = first.local_addr().to_string();
        let err = Listener::bind(&taken, tx).await.err().unwrap();
        assert!(matches!(err, ListenerError::Bind { .. }));
    }

    #[tokio::test]
    async fn reload_updates_limits() {
        let (tx, _rx) = events::channel();
        let mut listener = Listener::bind(&config(), tx).await.unwrap();

        let mut updated = config();
        updated.admission.max_attempts = 5;
        updated.listener.max_connections = 7;
        updated.timeouts.idle_secs = 60;
        listener.apply_config(&updated);

        assert_eq!(listener.admission.limits().max_attempts, 5);
        assert_eq!(listener.admission.limits().max_connections, 7);
        assert_eq!(listener.settings.idle_timeout, Duration::from_secs(60));
    }

    #[tokio::test]
    async fn run_returns_on_shutdown_with_nothing_open() {
        let (tx, _rx) = events::channel();
        let listener = Listener::bind(&config(), tx).await.unwrap();
        let shutdown = Shutdown::new();
        let (_updates_tx, updates) = mpsc::unbounded_channel();

        let task = tokio::spawn(listener.run(shutdown.subscribe(), updates));
        shutdown.trigger();
        assert!(task.await.unwrap());
    }
}
