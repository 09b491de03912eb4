//! Connection admission.
//!
//! Two independent checks run before a relay is constructed: a per-source
//! sliding-window throttle and a global cap on concurrent relays. The state is
//! owned by the listener task, so no locking is involved.

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;

use crate::config::ProxyConfig;

/// Limits enforced at accept time. Already validated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionLimits {
    /// Admitted connections per source address within `window`.
    pub max_attempts: usize,
    /// Trailing throttle window. Zero disables the throttle.
    pub window: Duration,
    /// Ceiling on concurrent relays.
    pub max_connections: usize,
}

impl AdmissionLimits {
    pub fn from_config(config: &ProxyConfig) -> Self {
        Self {
            max_attempts: config.admission.max_attempts,
            window: Duration::from_secs(config.admission.window_secs),
            max_connections: config.listener.max_connections,
        }
    }
}

/// Why a connection was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("too many connection attempts from this address")]
    Throttled,
    #[error("connection limit reached")]
    OverCapacity,
}

impl Rejection {
    pub fn as_str(self) -> &'static str {
        match self {
            Rejection::Throttled => "throttled",
            Rejection::OverCapacity => "over_capacity",
        }
    }
}

/// Sliding-window throttle plus capacity check.
#[derive(Debug)]
pub struct Admission {
    limits: AdmissionLimits,
    /// Admitted attempt timestamps per source address, oldest first.
    attempts: HashMap<IpAddr, VecDeque<Instant>>,
}

impl Admission {
    pub fn new(limits: AdmissionLimits) -> Self {
        Self {
            limits,
            attempts: HashMap::new(),
        }
    }

    pub fn limits(&self) -> AdmissionLimits {
        self.limits
    }

    /// Replace the limits. Recorded attempts are kept and judged against the new window.
    pub fn set_limits(&mut self, limits: AdmissionLimits) {
        self.limits = limits;
    }

    /// Decide whether a connection from `ip` may be admitted while `active`
    /// relays are running. Only admitted attempts are recorded.
    pub fn check(&mut self, ip: IpAddr, active: usize, now: Instant) -> Result<(), Rejection> {
        let window = self.limits.window;
        if !window.is_zero() {
            if let Some(seen) = self.attempts.get_mut(&ip) {
                prune(seen, window, now);
                if seen.len() >= self.limits.max_attempts {
                    return Err(Rejection::Throttled);
                }
            }
        }

        if active >= self.limits.max_connections {
            return Err(Rejection::OverCapacity);
        }

        if !window.is_zero() {
            self.attempts.entry(ip).or_default().push_back(now);
        }
        Ok(())
    }

    /// Forget addresses with no attempt inside the window. Returns how many were dropped.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let window = self.limits.window;
        let before = self.attempts.len();
        self.attempts.retain(|_, seen| {
            prune(seen, window, now);
            !seen.is_empty()
        });
        before - self.attempts.len()
    }

    /// Number of source addresses currently remembered.
    pub fn tracked_addresses(&self) -> usize {
        self.attempts.len()
    }

    pub fn clear(&mut self) {
        self.attempts.clear();
    }
}

fn prune(seen: &mut VecDeque<Instant>, window: Duration, now: Instant) {
    while seen
        .front()
        .is_some_and(|&t| now.saturating_duration_since(t) >= window)
    {
        seen.pop_front();
    }
}
