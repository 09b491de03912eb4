//! Stratum relay (v1)
//!
//! Sits between mining clients and a pool, forwarding traffic unchanged while
//! observing the JSON-RPC stream for metrics.
//!
//! # Architecture Overview
//!
//! ```text
//!                        ┌──────────────────────────────────────────────────────┐
//!                        │                    STRATUM RELAY                     │
//!                        │                                                      │
//!     Miner              │  ┌──────────┐    ┌───────────┐    ┌─────────────┐    │
//!     ───────────────────┼─▶│   net    │───▶│ security  │───▶│    relay    │────┼──▶ Pool
//!                        │  │ listener │    │ admission │    │   session   │    │
//!     ◀──────────────────┼──│          │    └───────────┘    │  flow/fault │◀───┼─── 
//!                        │  └──────────┘                     └──────┬──────┘    │
//!                        │                                          │ chunks    │
//!                        │                                          ▼           │
//!                        │                                   ┌─────────────┐    │
//!                        │                                   │  protocol   │    │
//!                        │                                   │  observer   │    │
//!                        │                                   └──────┬──────┘    │
//!                        │                                          │ events    │
//!                        │                                          ▼           │
//!                        │  ┌─────────┐  ┌───────────┐       ┌─────────────┐    │
//!                        │  │ config  │  │ lifecycle │       │ correlator  │────┼──▶ /metrics
//!                        │  └─────────┘  └───────────┘       └─────────────┘    │
//!                        └──────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tokio::sync::mpsc;

use stratum_relay::config::watcher::ConfigWatcher;
use stratum_relay::config::{load_config, validate_config, ConfigError, ProxyConfig};
use stratum_relay::lifecycle::{signals, Shutdown};
use stratum_relay::net::Listener;
use stratum_relay::observability::{correlator, events, logging, metrics};

/// How long the correlator may take to drain events after the listener stops.
const CORRELATOR_DRAIN: Duration = Duration::from_secs(2);

#[derive(Parser, Debug)]
#[command(name = "stratum-relay", version)]
#[command(about = "Transparent Stratum relay with share and latency metrics", long_about = None)]
struct Cli {
    /// TOML configuration file. Built-in defaults are used without one.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override listener.bind_address.
    #[arg(long)]
    bind: Option<String>,

    /// Override upstream.address.
    #[arg(long)]
    upstream: Option<String>,

    /// Reload admission limits and relay settings when the config file changes.
    #[arg(long, requires = "config")]
    watch: bool,

    /// Validate the configuration and exit.
    #[arg(long)]
    check: bool,
}

/// CLI values that take precedence over the file, on startup and on reload.
#[derive(Debug, Clone, Default)]
struct Overrides {
    bind: Option<String>,
    upstream: Option<String>,
}

impl Overrides {
    fn apply(&self, config: &mut ProxyConfig) {
        if let Some(bind) = &self.bind {
            config.listener.bind_address = bind.clone();
        }
        if let Some(upstream) = &self.upstream {
            config.upstream.address = upstream.clone();
        }
    }
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            bind: self.bind.clone(),
            upstream: self.upstream.clone(),
        }
    }

    fn resolve_config(&self) -> Result<ProxyConfig, ConfigError> {
        let mut config = match &self.config {
            Some(path) => load_config(path)?,
            None => ProxyConfig::default(),
        };
        self.overrides().apply(&mut config);
        validate_config(&config).map_err(ConfigError::Validation)?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = cli.resolve_config()?;

    if cli.check {
        println!("configuration OK");
        return Ok(());
    }

    logging::init(&config.observability);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "stratum-relay starting");
    tracing::info!(
        bind_address = %config.listener.bind_address,
        upstream = %config.upstream.address,
        max_connections = config.listener.max_connections,
        idle_secs = config.timeouts.idle_secs,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        metrics::init_metrics(&config.observability.metrics_address)?;
    }

    let (events_tx, events_rx) = events::channel();
    let (aggregates, correlator_task) = correlator::spawn(events_rx);

    let (updates_tx, updates_rx) = mpsc::unbounded_channel();
    let _watcher = match (&cli.config, cli.watch) {
        (Some(path), true) => {
            let (watcher, mut reloaded) = ConfigWatcher::new(path);
            let handle = watcher.run()?;
            let overrides = cli.overrides();
            tokio::spawn(async move {
                while let Some(mut config) = reloaded.recv().await {
                    overrides.apply(&mut config);
                    if updates_tx.send(config).is_err() {
                        break;
                    }
                }
            });
            Some(handle)
        }
        _ => None,
    };

    let listener = Listener::bind(&config, events_tx).await?;
    tracing::info!(address = %listener.local_addr(), "Listening for miners");

    let shutdown = Shutdown::new();
    let server = tokio::spawn(listener.run(shutdown.subscribe(), updates_rx));

    signals::wait_for_signal().await;
    tracing::info!("Shutting down");
    shutdown.trigger();

    let drained = server.await?;

    if tokio::time::timeout(CORRELATOR_DRAIN, correlator_task).await.is_err() {
        tracing::warn!("Correlator still receiving events, skipping drain");
    }

    let totals = aggregates.snapshot();
    tracing::info!(
        drained,
        connections = totals.connections_total,
        submits = correlator::total(&totals.submits),
        accepted = correlator::total(&totals.shares_accepted),
        rejected = correlator::total(&totals.shares_rejected),
        "Shutdown complete"
    );
    Ok(())
}
