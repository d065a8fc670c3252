//! Probe history tracker for registered servers.
//!
//! Keeps, per server (host and port), the last probe outcome, the number of
//! consecutive failures and the last observed latency. A server becomes
//! `Unhealthy` after `unhealthy_threshold` failures in a row and `Healthy`
//! again on the next success. The book is diagnostic only: it never changes
//! the registry or the current selection.
//!
//! The book is not synchronized; the controller wraps it in a `Mutex`.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use strum_macros::Display;
use tdx_common::{ProbeResult, ServerDescriptor};

/// Consecutive failures after which a server is reported unhealthy.
pub const DEFAULT_UNHEALTHY_THRESHOLD: u32 = 3;

/// Coarse health classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum HealthStatus {
    /// Never probed.
    Unknown,
    /// Last probe succeeded.
    Healthy,
    /// Failed `unhealthy_threshold` times in a row.
    Unhealthy,
}

/// Probe history of one server.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerHealth {
    /// Current classification.
    pub status: HealthStatus,
    /// Consecutive failed probes.
    pub fail_count: u32,
    /// Latency of the last successful probe.
    pub last_latency_ms: Option<u64>,
    /// Time of the last probe, UTC.
    pub last_checked: Option<DateTime<Utc>>,
}

impl Default for ServerHealth {
    fn default() -> Self {
        Self {
            status: HealthStatus::Unknown,
            fail_count: 0,
            last_latency_ms: None,
            last_checked: None,
        }
    }
}

/// Per-server probe history keyed by (host, port).
pub struct HealthBook {
    entries: HashMap<ServerDescriptor, ServerHealth>,
    unhealthy_threshold: u32,
}

impl HealthBook {
    /// Create a new book with the given failure threshold.
    pub fn new(unhealthy_threshold: u32) -> Self {
        Self {
            entries: HashMap::new(),
            unhealthy_threshold: unhealthy_threshold.max(1),
        }
    }

    /// Fold one probe result into the history of its target.
    pub fn record(&mut self, result: &ProbeResult) {
        let threshold = self.unhealthy_threshold;
        let entry = self.entries.entry(result.target.clone()).or_default();
        entry.last_checked = Some(Utc::now());

        if result.is_ok() {
            entry.status = HealthStatus::Healthy;
            entry.fail_count = 0;
            entry.last_latency_ms = result.latency_ms;
        } else {
            entry.fail_count = entry.fail_count.saturating_add(1);
            if entry.fail_count >= threshold {
                entry.status = HealthStatus::Unhealthy;
            }
        }
    }

    /// History of `server`, `Unknown` if it was never probed.
    pub fn get(&self, server: &ServerDescriptor) -> ServerHealth {
        self.entries.get(server).cloned().unwrap_or_default()
    }

    /// Drop history for servers no longer registered.
    pub fn retain_only(&mut self, servers: &[ServerDescriptor]) {
        self.entries.retain(|key, _| servers.contains(key));
    }
}

impl Default for HealthBook {
    fn default() -> Self {
        Self::new(DEFAULT_UNHEALTHY_THRESHOLD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tdx_common::ProbeOutcome;

    fn target() -> ServerDescriptor {
        ServerDescriptor::new("10.0.0.1", 7709, None).unwrap()
    }

    fn result(outcome: ProbeOutcome) -> ProbeResult {
        ProbeResult {
            target: target(),
            outcome,
            latency_ms: (outcome == ProbeOutcome::Ok).then_some(12),
            error: None,
        }
    }

    #[test]
    fn unknown_until_probed() {
        let book = HealthBook::default();
        assert_eq!(book.get(&target()).status, HealthStatus::Unknown);
    }

    #[test]
    fn unhealthy_after_threshold_and_recovers() {
        let mut book = HealthBook::new(3);
        book.record(&result(ProbeOutcome::TcpFailed));
        book.record(&result(ProbeOutcome::HandshakeFailed));
        assert_eq!(book.get(&target()).status, HealthStatus::Unknown);
        assert_eq!(book.get(&target()).fail_count, 2);

        book.record(&result(ProbeOutcome::TcpFailed));
        assert_eq!(book.get(&target()).status, HealthStatus::Unhealthy);

        book.record(&result(ProbeOutcome::Ok));
        let health = book.get(&target());
        assert_eq!(health.status, HealthStatus::Healthy);
        assert_eq!(health.fail_count, 0);
        assert_eq!(health.last_latency_ms, Some(12));
        assert!(health.last_checked.is_some());
    }

    #[test]
    fn retain_only_forgets_removed_servers() {
        let mut book = HealthBook::default();
        book.record(&result(ProbeOutcome::Ok));
        book.retain_only(&[]);
        assert_eq!(book.get(&target()), ServerHealth::default());
    }
}
