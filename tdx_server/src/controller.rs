//! Selection and failover controller.
//!
//! The controller is the sole owner of the server registry, the health book
//! and the snapshot store; HTTP handlers only translate to and from its
//! operations. Probing always runs without the registry lock: the controller
//! copies what it needs, probes, and then applies the result with a
//! compare-and-select so a list replaced mid-probe is never corrupted.
//!
//! Nothing here runs in the background. Failover is operator triggered
//! (test, then select, then optionally save).

use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{info, warn};
use serde::Serialize;
use tdx_common::{Probe, ProbeResult, Result, ServerDescriptor, TdxError};

use crate::model::health::{HealthBook, ServerHealth};
use crate::model::registry::{Registry, RegistryView};
use crate::model::snapshot::PersistedSnapshot;
use crate::persistence::SnapshotStore;

/// Registry contents plus the built-in list for reference.
#[derive(Debug, Clone, Serialize)]
pub struct ServerList {
    /// Registered servers in priority order.
    pub servers: Vec<ServerDescriptor>,
    /// Index of the current server.
    pub current_index: Option<usize>,
    /// Built-in default servers.
    pub defaults: Vec<ServerDescriptor>,
}

/// Outcome of probing one registry entry and selecting it on success.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectReport {
    /// Whether the server answered and is now current.
    pub success: bool,
    /// The probed entry.
    pub server: ServerDescriptor,
    /// Raw probe result.
    pub probe: ProbeResult,
}

/// Outcome of a failover sweep.
#[derive(Debug, Clone, Serialize)]
pub struct FailoverReport {
    /// Index that became current, if any server answered.
    pub selected_index: Option<usize>,
    /// Server that became current.
    pub server: Option<ServerDescriptor>,
    /// Every probe run, in order.
    pub attempts: Vec<ProbeResult>,
}

/// One line of the status report.
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatusEntry {
    /// Registered server.
    #[serde(flatten)]
    pub server: ServerDescriptor,
    /// Probe history.
    #[serde(flatten)]
    pub health: ServerHealth,
    /// Whether this is the current server.
    pub is_current: bool,
}

/// Service status: current server and per-server health.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    /// Current server, if any.
    pub current_server: Option<ServerDescriptor>,
    /// Number of registered servers.
    pub server_count: usize,
    /// Per-server entries in registry order.
    pub servers: Vec<ServerStatusEntry>,
}

/// Orchestrates registry, prober and persistence.
pub struct SelectionController {
    registry: Registry,
    store: SnapshotStore,
    prober: Arc<dyn Probe>,
    health: Mutex<HealthBook>,
    defaults: Vec<ServerDescriptor>,
    // Held across mutate, capture and save so disk never lags a newer durable change.
    persist_lock: Mutex<()>,
}

impl SelectionController {
    /// Seeds the registry from the saved snapshot, or from `defaults` (first
    /// one current) when nothing usable was saved. Writes nothing.
    pub fn bootstrap(
        store: SnapshotStore,
        prober: Arc<dyn Probe>,
        defaults: Vec<ServerDescriptor>,
    ) -> Result<Self> {
        let registry = Registry::new();
        match store.load() {
            Some(snapshot) => {
                info!(
                    "Restoring {} server(s) saved at {}",
                    snapshot.servers.len(),
                    snapshot.saved_at
                );
                registry.replace_all(snapshot.servers, snapshot.current_index)?;
            }
            None => {
                info!("No saved servers, using {} built-in default(s)", defaults.len());
                registry.replace_all(defaults.clone(), None)?;
            }
        }

        Ok(Self {
            registry,
            store,
            prober,
            health: Mutex::new(HealthBook::default()),
            defaults,
            persist_lock: Mutex::new(()),
        })
    }

    /// Registered servers, current index and the built-in defaults.
    pub fn get_servers(&self) -> Result<ServerList> {
        let RegistryView {
            servers,
            current_index,
        } = self.registry.list()?;
        Ok(ServerList {
            servers,
            current_index,
            defaults: self.defaults.clone(),
        })
    }

    /// Replaces the server list. Not persisted.
    pub fn set_servers(
        &self,
        servers: Vec<ServerDescriptor>,
        current_index: Option<usize>,
    ) -> Result<()> {
        self.registry.replace_all(servers, current_index)?;
        self.forget_unregistered()
    }

    /// Selects the current server. Not persisted.
    pub fn select_server(&self, index: usize) -> Result<ServerDescriptor> {
        self.registry.select_current(index)
    }

    /// Current server, `NotConfigured` if none.
    pub fn get_current_server(&self) -> Result<ServerDescriptor> {
        self.registry.current()?.ok_or(TdxError::NotConfigured)
    }

    /// Probes an arbitrary server. Never touches the registry.
    pub fn test_server(&self, target: &ServerDescriptor, timeout: Option<Duration>) -> ProbeResult {
        let timeout = timeout.unwrap_or_else(|| self.prober.default_timeout());
        let result = self.prober.probe(target, timeout);
        match result.reason() {
            None => info!(
                "Probe {} ok in {} ms",
                target,
                result.latency_ms.unwrap_or_default()
            ),
            Some(reason) => warn!(
                "Probe {} failed: {} ({})",
                target,
                reason,
                result.error.as_deref().unwrap_or("no detail")
            ),
        }
        self.record(&result);
        result
    }

    /// Probes the registry entry at `index`.
    pub fn test_registered(&self, index: usize, timeout: Option<Duration>) -> Result<ProbeResult> {
        if self.registry.len()? == 0 {
            return Err(TdxError::NotConfigured);
        }
        let target = self.registry.get(index)?;
        Ok(self.test_server(&target, timeout))
    }

    /// Makes `descriptor` the only, current server and saves immediately.
    pub fn override_with_single_server(
        &self,
        descriptor: ServerDescriptor,
    ) -> Result<PersistedSnapshot> {
        descriptor.validate()?;
        let _persist = self.persist_lock.lock()?;
        self.registry.upsert_single(descriptor)?;
        self.forget_unregistered()?;

        let snapshot = PersistedSnapshot::capture(self.registry.list()?);
        self.store.save(&snapshot)?;
        Ok(snapshot)
    }

    /// Last saved snapshot, if any.
    pub fn get_saved_config(&self) -> Option<PersistedSnapshot> {
        self.store.load()
    }

    /// Saves the live registry.
    pub fn save_current_state(&self) -> Result<PersistedSnapshot> {
        let _persist = self.persist_lock.lock()?;
        let snapshot = PersistedSnapshot::capture(self.registry.list()?);
        self.store.save(&snapshot)?;
        Ok(snapshot)
    }

    /// Probes `servers[index]` and makes it current if it answers.
    pub fn connect_server(&self, index: usize) -> Result<ConnectReport> {
        let server = self.registry.get(index)?;
        let probe = self.test_server(&server, None);
        let success = probe.is_ok() && self.registry.select_if_unchanged(index, &server)?;
        Ok(ConnectReport {
            success,
            server,
            probe,
        })
    }

    /// Probes servers after the current one in priority order, wrapping
    /// around and ending with the current one, and selects the first that
    /// answers. Not persisted.
    pub fn failover(&self) -> Result<FailoverReport> {
        let view = self.registry.list()?;
        if view.servers.is_empty() {
            return Err(TdxError::NotConfigured);
        }

        let len = view.servers.len();
        let start = view.current_index.map_or(0, |i| (i + 1) % len);
        let mut attempts = Vec::new();

        for offset in 0..len {
            let index = (start + offset) % len;
            let candidate = &view.servers[index];
            let result = self.test_server(candidate, None);
            let answered = result.is_ok();
            attempts.push(result);

            if answered && self.registry.select_if_unchanged(index, candidate)? {
                info!("Failover selected #{} {}", index, candidate);
                return Ok(FailoverReport {
                    selected_index: Some(index),
                    server: Some(candidate.clone()),
                    attempts,
                });
            }
            if answered {
                warn!("Registry changed during failover, abandoning sweep");
                break;
            }
        }

        warn!("Failover found no reachable server among {}", len);
        Ok(FailoverReport {
            selected_index: None,
            server: None,
            attempts,
        })
    }

    /// Current server plus per-server probe history.
    pub fn status(&self) -> Result<ServiceStatus> {
        let view = self.registry.list()?;
        let health = self.health.lock()?;
        let servers = view
            .servers
            .iter()
            .enumerate()
            .map(|(i, server)| ServerStatusEntry {
                server: server.clone(),
                health: health.get(server),
                is_current: view.current_index == Some(i),
            })
            .collect();

        Ok(ServiceStatus {
            current_server: view.current().cloned(),
            server_count: view.servers.len(),
            servers,
        })
    }

    fn record(&self, result: &ProbeResult) {
        match self.health.lock() {
            Ok(mut book) => book.record(result),
            Err(e) => warn!("Health book unavailable: {}", e),
        }
    }

    fn forget_unregistered(&self) -> Result<()> {
        let view = self.registry.list()?;
        self.health.lock()?.retain_only(&view.servers);
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::model::health::HealthStatus;
    use std::collections::HashMap;
    use std::fs;
    use tdx_common::ProbeOutcome;
    use tempfile::TempDir;

    /// Prober answering from a fixed table; unknown servers fail TCP.
    pub(crate) struct ScriptedProber {
        outcomes: HashMap<ServerDescriptor, ProbeOutcome>,
    }

    impl ScriptedProber {
        pub(crate) fn new(outcomes: &[(ServerDescriptor, ProbeOutcome)]) -> Arc<Self> {
            Arc::new(Self {
                outcomes: outcomes.iter().cloned().collect(),
            })
        }
    }

    impl Probe for ScriptedProber {
        fn probe(&self, target: &ServerDescriptor, _timeout: Duration) -> ProbeResult {
            let outcome = self
                .outcomes
                .get(target)
                .copied()
                .unwrap_or(ProbeOutcome::TcpFailed);
            ProbeResult {
                target: target.clone(),
                outcome,
                latency_ms: (outcome == ProbeOutcome::Ok).then_some(5),
                error: (outcome != ProbeOutcome::Ok).then(|| "scripted".to_string()),
            }
        }

        fn default_timeout(&self) -> Duration {
            Duration::from_millis(100)
        }
    }

    pub(crate) fn server(last_octet: u8) -> ServerDescriptor {
        ServerDescriptor::new(&format!("10.0.0.{}", last_octet), 7709, None).unwrap()
    }

    pub(crate) fn controller_in(
        dir: &TempDir,
        prober: Arc<dyn Probe>,
        defaults: Vec<ServerDescriptor>,
    ) -> SelectionController {
        let store = SnapshotStore::open(dir.path()).unwrap();
        SelectionController::bootstrap(store, prober, defaults).unwrap()
    }

    #[test]
    fn bootstrap_uses_defaults_without_snapshot() {
        let dir = TempDir::new().unwrap();
        let controller = controller_in(&dir, ScriptedProber::new(&[]), vec![server(1), server(2)]);
        let list = controller.get_servers().unwrap();
        assert_eq!(list.servers, vec![server(1), server(2)]);
        assert_eq!(list.current_index, Some(0));
        assert_eq!(list.defaults, vec![server(1), server(2)]);
        assert!(controller.get_saved_config().is_none());
    }

    #[test]
    fn bootstrap_restores_saved_snapshot() {
        let dir = TempDir::new().unwrap();
        {
            let controller = controller_in(&dir, ScriptedProber::new(&[]), vec![server(1)]);
            controller.set_servers(vec![server(5), server(6)], Some(1)).unwrap();
            controller.save_current_state().unwrap();
        }
        let controller = controller_in(&dir, ScriptedProber::new(&[]), vec![server(1)]);
        assert_eq!(controller.get_current_server().unwrap(), server(6));
        assert_eq!(controller.get_servers().unwrap().servers, vec![server(5), server(6)]);
    }

    #[test]
    fn corrupt_snapshot_falls_back_to_defaults() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(crate::persistence::SNAPSHOT_FILE), "{\"servers\": [").unwrap();
        let controller = controller_in(&dir, ScriptedProber::new(&[]), vec![server(1)]);
        assert_eq!(controller.get_servers().unwrap().servers, vec![server(1)]);
        assert!(controller.get_saved_config().is_none());
    }

    #[test]
    fn empty_registry_is_not_configured() {
        let dir = TempDir::new().unwrap();
        let controller = controller_in(&dir, ScriptedProber::new(&[]), Vec::new());
        assert!(matches!(controller.get_current_server(), Err(TdxError::NotConfigured)));
        assert!(matches!(controller.failover(), Err(TdxError::NotConfigured)));
        assert!(matches!(controller.test_registered(0, None), Err(TdxError::NotConfigured)));
    }

    #[test]
    fn set_and_select_do_not_persist() {
        let dir = TempDir::new().unwrap();
        let controller = controller_in(&dir, ScriptedProber::new(&[]), vec![server(1)]);
        controller.set_servers(vec![server(2), server(3)], None).unwrap();
        controller.select_server(1).unwrap();
        assert_eq!(controller.get_current_server().unwrap(), server(3));
        assert!(controller.get_saved_config().is_none());
    }

    #[test]
    fn override_is_durable() {
        let dir = TempDir::new().unwrap();
        let controller = controller_in(&dir, ScriptedProber::new(&[]), vec![server(1), server(2)]);
        controller.override_with_single_server(server(9)).unwrap();

        let list = controller.get_servers().unwrap();
        assert_eq!(list.servers, vec![server(9)]);
        assert_eq!(list.current_index, Some(0));

        let saved = controller.get_saved_config().unwrap();
        assert_eq!(saved.servers, vec![server(9)]);
        assert_eq!(saved.current_index, Some(0));
    }

    #[test]
    fn concurrent_overrides_leave_disk_matching_memory() {
        let dir = TempDir::new().unwrap();
        let controller = controller_in(&dir, ScriptedProber::new(&[]), vec![server(1)]);

        for round in 0..50u8 {
            std::thread::scope(|scope| {
                for n in 0..4u8 {
                    let controller = &controller;
                    scope.spawn(move || {
                        controller
                            .override_with_single_server(server(10 + (round % 10) * 4 + n))
                            .unwrap();
                    });
                }
                scope.spawn(|| controller.save_current_state().unwrap());
            });

            let live = controller.get_servers().unwrap();
            let saved = controller.get_saved_config().unwrap();
            assert_eq!(live.servers, saved.servers, "round {}", round);
            assert_eq!(live.current_index, saved.current_index);
        }
    }

    #[test]
    fn override_rejects_invalid_descriptor() {
        let dir = TempDir::new().unwrap();
        let controller = controller_in(&dir, ScriptedProber::new(&[]), vec![server(1)]);
        let bad = ServerDescriptor { host: " ".into(), port: 7709, label: None };
        assert!(matches!(
            controller.override_with_single_server(bad),
            Err(TdxError::Validation(_))
        ));
        assert_eq!(controller.get_servers().unwrap().servers, vec![server(1)]);
        assert!(controller.get_saved_config().is_none());
    }

    #[test]
    fn test_server_records_health_without_touching_registry() {
        let dir = TempDir::new().unwrap();
        let prober = ScriptedProber::new(&[(server(2), ProbeOutcome::HandshakeFailed)]);
        let controller = controller_in(&dir, prober, vec![server(1), server(2)]);
        let before = controller.get_servers().unwrap();

        let result = controller.test_server(&server(2), None);
        assert_eq!(result.reason(), Some(ProbeOutcome::HandshakeFailed));
        let after = controller.get_servers().unwrap();
        assert_eq!(after.servers, before.servers);
        assert_eq!(after.current_index, before.current_index);

        let status = controller.status().unwrap();
        assert_eq!(status.servers[1].health.fail_count, 1);
        assert_eq!(status.servers[0].health.status, HealthStatus::Unknown);
        assert!(status.servers[0].is_current);
    }

    #[test]
    fn connect_selects_only_reachable_servers() {
        let dir = TempDir::new().unwrap();
        let prober = ScriptedProber::new(&[(server(3), ProbeOutcome::Ok)]);
        let controller = controller_in(&dir, prober, vec![server(1), server(2), server(3)]);

        let report = controller.connect_server(1).unwrap();
        assert!(!report.success);
        assert_eq!(controller.get_current_server().unwrap(), server(1));

        let report = controller.connect_server(2).unwrap();
        assert!(report.success);
        assert_eq!(controller.get_current_server().unwrap(), server(3));

        assert!(matches!(
            controller.connect_server(3),
            Err(TdxError::OutOfRange { index: 3, len: 3 })
        ));
    }

    #[test]
    fn failover_walks_after_current_and_wraps() {
        let dir = TempDir::new().unwrap();
        let prober = ScriptedProber::new(&[
            (server(1), ProbeOutcome::Ok),
            (server(4), ProbeOutcome::Ok),
        ]);
        let controller = controller_in(&dir, prober, vec![server(1), server(2), server(3), server(4)]);
        controller.select_server(1).unwrap();

        let report = controller.failover().unwrap();
        assert_eq!(report.selected_index, Some(3));
        let probed: Vec<_> = report.attempts.iter().map(|a| a.target.clone()).collect();
        assert_eq!(probed, vec![server(3), server(4)]);

        let report = controller.failover().unwrap();
        assert_eq!(report.selected_index, Some(0));
        assert_eq!(controller.get_current_server().unwrap(), server(1));
        assert!(controller.get_saved_config().is_none());
    }

    #[test]
    fn failover_without_reachable_server_keeps_selection() {
        let dir = TempDir::new().unwrap();
        let controller = controller_in(&dir, ScriptedProber::new(&[]), vec![server(1), server(2)]);
        controller.select_server(1).unwrap();

        let report = controller.failover().unwrap();
        assert_eq!(report.selected_index, None);
        assert_eq!(report.attempts.len(), 2);
        assert_eq!(controller.get_current_server().unwrap(), server(2));
    }

    #[test]
    fn replacing_servers_drops_stale_health() {
        let dir = TempDir::new().unwrap();
        let controller = controller_in(&dir, ScriptedProber::new(&[]), vec![server(1)]);
        controller.test_server(&server(1), None);
        controller.set_servers(vec![server(1), server(2)], None).unwrap();
        assert_eq!(controller.status().unwrap().servers[0].health.fail_count, 1);

        controller.set_servers(vec![server(2)], None).unwrap();
        controller.set_servers(vec![server(1)], None).unwrap();
        assert_eq!(controller.status().unwrap().servers[0].health.fail_count, 0);
    }
}
