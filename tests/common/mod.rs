//! Shared utilities for integration testing.

#![allow(dead_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use serde_json::{json, Value};
use stratum_relay::config::ProxyConfig;
use stratum_relay::lifecycle::Shutdown;
use stratum_relay::net::connection::ConnectionTracker;
use stratum_relay::net::Listener;
use stratum_relay::observability::correlator::{self, Aggregates, CorrelatorHandle};
use stratum_relay::observability::events;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Start an upstream that echoes every byte back.
pub async fn start_echo_upstream() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut rd, mut wr) = socket.split();
                let _ = tokio::io::copy(&mut rd, &mut wr).await;
            });
        }
    });
    addr
}

/// Start a minimal pool: answers every request with `result: true` after
/// `reply_delay`, and follows a successful `mining.authorize` with a
/// `mining.set_difficulty` notification of `difficulty`.
pub async fn start_mock_pool(reply_delay: Duration, difficulty: u64) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (rd, mut wr) = socket.into_split();
                let mut lines = BufReader::new(rd).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let Ok(request) = serde_json::from_str::<Value>(&line) else {
                        continue;
                    };
                    tokio::time::sleep(reply_delay).await;
                    let reply = json!({"id": request["id"], "result": true, "error": null});
                    if wr.write_all(format!("{reply}\n").as_bytes()).await.is_err() {
                        return;
                    }
                    if request["method"] == "mining.authorize" {
                        let notify = json!({"id": null, "method": "mining.set_difficulty", "params": [difficulty]});
                        let _ = wr.write_all(format!("{notify}\n").as_bytes()).await;
                    }
                }
            });
        }
    });
    addr
}

/// An address nothing listens on.
pub async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

/// Config pointing at `upstream`, bound to an ephemeral local port.
pub fn relay_config(upstream: SocketAddr) -> ProxyConfig {
    let mut config = ProxyConfig::default();
    config.listener.bind_address = "127.0.0.1:0".into();
    config.upstream.address = upstream.to_string();
    config.upstream.connect_timeout_secs = 2;
    config.observability.metrics_enabled = false;
    config
}

/// A listener running in the background with its own correlator.
pub struct RelayHarness {
    pub addr: SocketAddr,
    pub upstream: SocketAddr,
    pub shutdown: Shutdown,
    pub tracker: ConnectionTracker,
    pub correlator: CorrelatorHandle,
    pub updates: mpsc::UnboundedSender<ProxyConfig>,
    pub server: JoinHandle<bool>,
}

impl RelayHarness {
    pub async fn start(config: ProxyConfig) -> Self {
        let upstream = config.upstream.address.parse().unwrap();
        let (events_tx, events_rx) = events::channel();
        let (correlator, _task) = correlator::spawn(events_rx);
        let listener = Listener::bind(&config, events_tx).await.unwrap();
        let addr = listener.local_addr();
        let tracker = listener.tracker();

        let shutdown = Shutdown::new();
        let (updates, updates_rx) = mpsc::unbounded_channel();
        let server = tokio::spawn(listener.run(shutdown.subscribe(), updates_rx));

        Self {
            addr,
            upstream,
            shutdown,
            tracker,
            correlator,
            updates,
            server,
        }
    }

    pub async fn connect(&self) -> TcpStream {
        TcpStream::connect(self.addr).await.unwrap()
    }

    pub fn snapshot(&self) -> Aggregates {
        self.correlator.snapshot()
    }

    /// Poll the correlator until `condition` holds.
    pub async fn wait_for(&self, condition: impl Fn(&Aggregates) -> bool) -> Aggregates {
        let correlator = self.correlator.clone();
        wait_until(Duration::from_secs(5), move || {
            let snapshot = correlator.snapshot();
            let done = condition(&snapshot);
            async move { done }
        })
        .await;
        self.snapshot()
    }

    /// Trigger shutdown and return whether every relay closed in time.
    pub async fn stop(self) -> bool {
        self.shutdown.trigger();
        self.server.await.unwrap()
    }
}

/// Poll `check` every 10ms until it returns true. Panics after `timeout`.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let polled = async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    tokio::time::timeout(timeout, polled)
        .await
        .expect("condition not reached in time");
}

/// True if the peer closed `stream` (EOF or reset) within `timeout`.
pub async fn is_closed_by_peer(stream: &mut TcpStream, timeout: Duration) -> bool {
    let mut buf = [0u8; 64];
    match tokio::time::timeout(timeout, stream.read(&mut buf)).await {
        Ok(Ok(0)) | Ok(Err(_)) => true,
        Ok(Ok(_)) | Err(_) => false,
    }
}

/// Read one newline-terminated line.
pub async fn read_line(reader: &mut BufReader<TcpStream>) -> String {
    let mut line = String::new();
    tokio::time::timeout(Duration::from_secs(5), reader.read_line(&mut line))
        .await
        .expect("timed out waiting for a line")
        .unwrap();
    line
}
