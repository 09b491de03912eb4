//! Per-connection relay.
//!
//! # Responsibilities
//! - Dial the upstream once per accepted connection
//! - Forward bytes in both directions with independent flow control
//! - Mirror every chunk into a protocol observer and publish events
//! - Bind the worker identity from the first authorization
//! - Close on end-of-stream, transport error, idle timeout or shutdown
//!
//! # Lifecycle
//! ```text
//! Connecting ──dial ok──▶ Active ──eof/error/idle/shutdown──▶ Closing ──▶ Closed
//!      └────────────dial failed / shutdown───────────────────────┘
//! ```

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;

use crate::config::ProxyConfig;
use crate::net::connection::{Connection, ConnectionId, RelayState, Side};
use crate::observability::events::{Event, EventKind, EventSender};
use crate::protocol::{Message, Observation, ProtocolObserver};
use crate::relay::fault::{log_fault, CloseReason};
use crate::relay::flow::{forward, FlowStats};

/// Settings every relay is constructed with. Already validated.
#[derive(Debug, Clone)]
pub struct RelaySettings {
    /// Upstream `host:port`.
    pub upstream: Arc<str>,
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
    /// Size of the per-direction read buffer (one chunk).
    pub read_buffer: usize,
}

impl RelaySettings {
    pub fn from_config(config: &ProxyConfig) -> Self {
        Self {
            upstream: Arc::from(config.upstream.address.as_str()),
            connect_timeout: Duration::from_secs(config.upstream.connect_timeout_secs),
            idle_timeout: Duration::from_secs(config.timeouts.idle_secs),
            read_buffer: config.relay.read_buffer_bytes,
        }
    }
}

/// How one forwarding direction ended.
#[derive(Debug)]
enum PumpEnd {
    Eof(Side),
    Failed { side: Side, error: io::Error },
    /// A close was requested while the pump was running.
    Stopped,
}

/// Relays one downstream connection to the upstream.
pub struct Relay {
    conn: Connection,
    settings: RelaySettings,
    events: EventSender,
    close_tx: watch::Sender<bool>,
    /// Reason given by whoever won the close.
    close_reason: OnceLock<CloseReason>,
    noise_reported: AtomicBool,
    to_upstream: FlowStats,
    to_downstream: FlowStats,
}

impl Relay {
    pub fn new(id: ConnectionId, peer: SocketAddr, settings: RelaySettings, events: EventSender) -> Self {
        let conn = Connection::new(id, peer, Arc::clone(&settings.upstream));
        let (close_tx, _) = watch::channel(false);
        Self {
            conn,
            settings,
            events,
            close_tx,
            close_reason: OnceLock::new(),
            noise_reported: AtomicBool::new(false),
            to_upstream: FlowStats::default(),
            to_downstream: FlowStats::default(),
        }
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Flow-control counters for writes towards `towards`.
    pub fn flow(&self, towards: Side) -> &FlowStats {
        match towards {
            Side::Upstream => &self.to_upstream,
            Side::Downstream => &self.to_downstream,
        }
    }

    /// Dial the upstream and relay until the connection ends.
    pub async fn serve(&self, downstream: TcpStream, mut shutdown: broadcast::Receiver<()>) -> CloseReason {
        let started = Instant::now();
        let dial = tokio::time::timeout(
            self.settings.connect_timeout,
            TcpStream::connect(&*self.settings.upstream),
        );

        let upstream = tokio::select! {
            dialed = dial => match dialed {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => return self.fail_connect(e),
                Err(_) => return self.fail_connect(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "upstream connect timed out",
                )),
            },
            _ = shutdown.recv() => return self.conclude(CloseReason::Shutdown),
            () = close_requested(self.close_tx.subscribe()) => return self.conclude(CloseReason::Local),
        };

        for stream in [&downstream, &upstream] {
            if let Err(e) = stream.set_nodelay(true) {
                tracing::debug!(connection_id = %self.conn.id(), error = %e, "Failed to set TCP_NODELAY");
            }
        }

        self.run(downstream, upstream, started.elapsed(), shutdown).await
    }

    fn fail_connect(&self, error: io::Error) -> CloseReason {
        tracing::warn!(
            connection_id = %self.conn.id(),
            upstream = %self.settings.upstream,
            error = %error,
            "Upstream connect failed"
        );
        self.report_fault(Side::Upstream, &error);
        self.conclude(CloseReason::ConnectFailed)
    }

    /// Relay between two established transports until one side ends.
    pub async fn run<D, U>(
        &self,
        downstream: D,
        upstream: U,
        connect_latency: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) -> CloseReason
    where
        D: AsyncRead + AsyncWrite,
        U: AsyncRead + AsyncWrite,
    {
        if !self.conn.activate() {
            // Close requested while dialing.
            drop((downstream, upstream));
            return self.conclude(CloseReason::Local);
        }

        tracing::info!(
            connection_id = %self.conn.id(),
            peer_addr = %self.conn.peer(),
            upstream = %self.settings.upstream,
            connect_ms = connect_latency.as_millis() as u64,
            "Relay active"
        );
        self.emit(EventKind::Opened {
            peer: self.conn.peer(),
            connect_latency,
        });

        let (mut down_rd, mut down_wr) = tokio::io::split(downstream);
        let (mut up_rd, mut up_wr) = tokio::io::split(upstream);
        let close_rx = self.close_tx.subscribe();

        let reason = tokio::select! {
            end = self.pump(Side::Downstream, &mut down_rd, &mut up_wr) => self.settle(end),
            end = self.pump(Side::Upstream, &mut up_rd, &mut down_wr) => self.settle(end),
            () = self.idle_watchdog() => {
                tracing::info!(
                    connection_id = %self.conn.id(),
                    idle_secs = self.settings.idle_timeout.as_secs(),
                    "Idle timeout"
                );
                CloseReason::IdleTimeout
            }
            _ = shutdown.recv() => CloseReason::Shutdown,
            () = close_requested(close_rx) => self.requested_reason(),
        };

        // Both pumps are gone; release the transports before announcing the close.
        drop((down_rd, down_wr, up_rd, up_wr));
        self.conclude(reason)
    }

    /// Ask the relay to close. Only the first call has any effect.
    ///
    /// Forwarding stops at the next chunk boundary; the relay task then
    /// releases both transports and emits the single closed event.
    /// Returns true if this call started the close.
    pub fn close(&self, reason: CloseReason) -> bool {
        if !self.conn.begin_close() {
            return false;
        }
        let _ = self.close_reason.set(reason);
        self.close_tx.send_replace(true);
        true
    }

    fn requested_reason(&self) -> CloseReason {
        self.close_reason.get().copied().unwrap_or(CloseReason::Local)
    }

    /// Finish the close from inside the relay task, once no transport is held.
    ///
    /// Returns the reason that won, which may be an earlier request.
    fn conclude(&self, reason: CloseReason) -> CloseReason {
        let reason = if self.close(reason) {
            reason
        } else {
            self.requested_reason()
        };
        if self.conn.state() == RelayState::Closed {
            return reason;
        }

        let duration = self.conn.age();
        self.send(EventKind::Closed {
            reason,
            duration,
            bytes_sent: self.conn.bytes_sent(),
            bytes_received: self.conn.bytes_received(),
        });
        self.conn.finish_close();

        tracing::info!(
            connection_id = %self.conn.id(),
            peer_addr = %self.conn.peer(),
            worker = self.conn.worker().unwrap_or("-"),
            reason = %reason,
            duration_secs = duration.as_secs_f64(),
            bytes_sent = self.conn.bytes_sent(),
            bytes_received = self.conn.bytes_received(),
            "Relay closed"
        );
        reason
    }

    /// Forward everything read from `from` into `writer`.
    async fn pump<R, W>(&self, from: Side, reader: &mut R, writer: &mut W) -> PumpEnd
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut observer = ProtocolObserver::new(from);
        let mut buf = vec![0u8; self.settings.read_buffer];
        let stats = self.flow(from.opposite());

        loop {
            let n = match reader.read(&mut buf).await {
                Ok(0) => return PumpEnd::Eof(from),
                Ok(n) => n,
                Err(error) => return PumpEnd::Failed { side: from, error },
            };
            if self.conn.is_closed() {
                return PumpEnd::Stopped;
            }
            let chunk = &buf[..n];

            self.conn.record_inbound(from, n);
            self.emit(EventKind::transfer(from, n));
            for observation in observer.observe(chunk) {
                self.on_observation(from, observation);
            }

            if let Err(error) = forward(writer, chunk, stats).await {
                return PumpEnd::Failed {
                    side: from.opposite(),
                    error,
                };
            }
        }
    }

    fn on_observation(&self, from: Side, observation: Observation) {
        let message = match observation {
            Observation::Message(message) => message,
            Observation::Noise(noise) => {
                if !self.noise_reported.swap(true, Ordering::Relaxed) {
                    tracing::info!(
                        connection_id = %self.conn.id(),
                        side = %from,
                        kind = noise.as_str(),
                        "Non-stratum traffic on connection"
                    );
                }
                return;
            }
        };

        match message {
            Message::Request(request) => {
                if let Some(worker) = request.worker_name() {
                    if self.conn.bind_worker(worker) {
                        tracing::info!(connection_id = %self.conn.id(), worker, "Worker authorized");
                    } else {
                        tracing::debug!(
                            connection_id = %self.conn.id(),
                            bound = self.conn.worker().unwrap_or("-"),
                            attempted = worker,
                            "Ignoring repeated authorization"
                        );
                    }
                }
                self.emit(EventKind::Request(request));
            }
            Message::Response(response) => self.emit(EventKind::Response(response)),
            Message::Notification(notification) => self.emit(EventKind::Notification(notification)),
            Message::Unrecognized(_) => {
                tracing::trace!(connection_id = %self.conn.id(), side = %from, "Unrecognized JSON object");
            }
        }
    }

    fn settle(&self, end: PumpEnd) -> CloseReason {
        match end {
            PumpEnd::Eof(side) => {
                tracing::debug!(connection_id = %self.conn.id(), side = %side, "End of stream");
                CloseReason::PeerClosed(side)
            }
            PumpEnd::Failed { side, error } => {
                self.report_fault(side, &error);
                CloseReason::TransportError(side)
            }
            PumpEnd::Stopped => self.requested_reason(),
        }
    }

    fn report_fault(&self, side: Side, error: &io::Error) {
        let class = log_fault(self.conn.id(), side, error);
        self.emit(EventKind::Error {
            side,
            class,
            message: error.to_string(),
        });
    }

    /// Resolves once no bytes have arrived for the idle timeout.
    async fn idle_watchdog(&self) {
        loop {
            let deadline = self.conn.last_activity() + self.settings.idle_timeout;
            if Instant::now() >= deadline {
                return;
            }
            tokio::time::sleep_until(deadline).await;
        }
    }

    /// Publish an event. Nothing is published after the closed event.
    fn emit(&self, kind: EventKind) {
        if self.conn.state() == RelayState::Closed {
            return;
        }
        self.send(kind);
    }

    fn send(&self, kind: EventKind) {
        let event = Event {
            at: Instant::now(),
            connection: self.conn.id(),
            labels: self.conn.labels(),
            kind,
        };
        // Only fails once the correlator is gone during teardown.
        let _ = self.events.send(event);
    }
}

async fn close_requested(mut rx: watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
