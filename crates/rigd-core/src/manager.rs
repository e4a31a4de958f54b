//! Hardware discovery, daemon registry, and group supervision.
//!
//! The manager owns no detection logic: an injected [`DiscoveryProbe`]
//! (external collaborator) reports what hardware is reachable, and an
//! injected [`TransportFactory`] opens the channel for each descriptor.
//! Re-running discovery reconciles rather than restarts: daemons for
//! vanished peripherals are retired, new peripherals get new daemons,
//! unchanged daemons are left alone.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use serde_json::json;
use tracing::{info, warn};

use rigd_config::AppConfig;

use crate::bus::EventBus;
use crate::daemon::{DaemonHandle, DaemonRuntime};
use crate::daemons;
use crate::peripheral::PeripheralDescriptor;
use crate::state::WorldState;
use crate::transport::{Transport, TransportError, TransportGuard};
use crate::BoxFuture;

/// Discovery failures.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    /// The probe could not enumerate any matching hardware.
    #[error("peripheral unavailable: {0}")]
    PeripheralUnavailable(String),
}

/// External hardware-detection collaborator.
///
/// Whatever it reports is authoritative; the engine performs no independent
/// detection.
pub trait DiscoveryProbe: Send + Sync {
    /// Enumerate currently reachable peripherals.
    fn probe(&self) -> BoxFuture<'_, Result<Vec<PeripheralDescriptor>, DiscoveryError>>;
}

/// Opens the physical channel for one descriptor.
pub trait TransportFactory: Send + Sync {
    /// Open a transport to the peripheral at `descriptor.address`.
    fn open<'a>(
        &'a self,
        descriptor: &'a PeripheralDescriptor,
    ) -> BoxFuture<'a, Result<Box<dyn Transport>, TransportError>>;
}

/// The live name → daemon map. Shared with the command dispatcher for
/// target resolution.
#[derive(Default)]
pub struct DaemonRegistry {
    daemons: RwLock<HashMap<String, Arc<DaemonHandle>>>,
}

impl DaemonRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a daemon by name.
    pub fn get(&self, name: &str) -> Option<Arc<DaemonHandle>> {
        self.daemons
            .read()
            .expect("registry lock poisoned")
            .get(name)
            .cloned()
    }

    /// All registered daemons.
    pub fn handles(&self) -> Vec<Arc<DaemonHandle>> {
        self.daemons
            .read()
            .expect("registry lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .daemons
            .read()
            .expect("registry lock poisoned")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    fn insert(&self, handle: Arc<DaemonHandle>) {
        self.daemons
            .write()
            .expect("registry lock poisoned")
            .insert(handle.name().to_string(), handle);
    }

    fn remove(&self, name: &str) -> Option<Arc<DaemonHandle>> {
        self.daemons
            .write()
            .expect("registry lock poisoned")
            .remove(name)
    }
}

/// What one discovery pass changed.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct DiscoverySummary {
    /// Peripherals that got a new daemon.
    pub added: Vec<String>,
    /// Daemons retired because their peripheral vanished or changed.
    pub removed: Vec<String>,
    /// Daemons left untouched.
    pub kept: Vec<String>,
}

/// Discovers hardware, builds daemons, and supervises them as a group.
pub struct DaemonManager {
    config: AppConfig,
    world: Arc<WorldState>,
    bus: EventBus,
    registry: Arc<DaemonRegistry>,
    probe: Box<dyn DiscoveryProbe>,
    transports: Box<dyn TransportFactory>,
    started: AtomicBool,
}

impl DaemonManager {
    /// Create a manager over injected collaborators.
    pub fn new(
        config: AppConfig,
        world: Arc<WorldState>,
        bus: EventBus,
        probe: Box<dyn DiscoveryProbe>,
        transports: Box<dyn TransportFactory>,
    ) -> Self {
        Self {
            config,
            world,
            bus,
            registry: Arc::new(DaemonRegistry::new()),
            probe,
            transports,
            started: AtomicBool::new(false),
        }
    }

    /// The registry, for wiring up the command dispatcher.
    pub fn registry(&self) -> Arc<DaemonRegistry> {
        Arc::clone(&self.registry)
    }

    /// Run one discovery pass and reconcile the daemon set against it.
    ///
    /// Safe to call while running: new daemons are started immediately if
    /// the group has been started; a peripheral whose transport cannot be
    /// opened is skipped (logged), never fatal.
    pub async fn discover_and_configure(&self) -> Result<DiscoverySummary, DiscoveryError> {
        let found = self.probe.probe().await?;

        let mut desired: HashMap<String, PeripheralDescriptor> = HashMap::new();
        for descriptor in found {
            if desired
                .insert(descriptor.name.clone(), descriptor.clone())
                .is_some()
            {
                warn!(name = %descriptor.name, "duplicate peripheral in probe output, keeping last");
            }
        }

        let mut summary = DiscoverySummary::default();

        // Retire daemons whose peripheral vanished or changed identity.
        for handle in self.registry.handles() {
            let keep = desired
                .get(handle.name())
                .is_some_and(|d| d == handle.descriptor());
            if keep {
                summary.kept.push(handle.name().to_string());
            } else {
                info!(daemon = %handle.name(), "retiring daemon (peripheral gone or changed)");
                handle.retire().await;
                self.registry.remove(handle.name());
                summary.removed.push(handle.name().to_string());
            }
        }

        // Build daemons for new peripherals.
        for (name, descriptor) in &desired {
            if self.registry.get(name).is_some() {
                continue;
            }
            let transport = match self.transports.open(descriptor).await {
                Ok(transport) => transport,
                Err(err) => {
                    warn!(name = %name, error = %err, "cannot open transport, skipping peripheral");
                    continue;
                }
            };
            let guard = TransportGuard::new(
                transport,
                self.config.transport.acquire_timeout(),
                self.config.transport.io_timeout(),
            );
            let driver = daemons::build_driver(descriptor);
            let handle = Arc::new(DaemonRuntime::spawn(
                driver,
                guard,
                &self.config,
                Arc::clone(&self.world),
                self.bus.clone(),
            ));
            if self.started.load(Ordering::SeqCst) {
                handle.start().await;
            }
            self.registry.insert(handle);
            summary.added.push(name.clone());
        }

        summary.added.sort();
        summary.removed.sort();
        summary.kept.sort();
        info!(
            added = summary.added.len(),
            removed = summary.removed.len(),
            kept = summary.kept.len(),
            "discovery reconciled"
        );
        self.bus.publish_as(
            "manager",
            "manager.discovery",
            json!({
                "added": summary.added,
                "removed": summary.removed,
                "kept": summary.kept,
            }),
        );
        Ok(summary)
    }

    /// Start every registered daemon. Individual connect failures leave that
    /// daemon faulted (retrying on the breaker's schedule), never fail the
    /// group.
    pub async fn start_all(&self) {
        self.started.store(true, Ordering::SeqCst);
        for handle in self.registry.handles() {
            handle.start().await;
        }
    }

    /// Cooperatively stop every registered daemon.
    pub async fn stop_all(&self) {
        self.started.store(false, Ordering::SeqCst);
        for handle in self.registry.handles() {
            handle.stop().await;
        }
    }

    /// Stop and retire everything; the manager can be dropped afterwards.
    pub async fn shutdown(&self) {
        self.started.store(false, Ordering::SeqCst);
        for handle in self.registry.handles() {
            handle.retire().await;
            self.registry.remove(handle.name());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peripheral::PeripheralKind;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;

    /// Probe whose report is shared with the test, so it can change between
    /// passes.
    #[derive(Clone)]
    struct SettableProbe {
        current: Arc<Mutex<Vec<PeripheralDescriptor>>>,
    }

    impl SettableProbe {
        fn reporting(descriptors: Vec<PeripheralDescriptor>) -> Self {
            Self {
                current: Arc::new(Mutex::new(descriptors)),
            }
        }

        fn set(&self, descriptors: Vec<PeripheralDescriptor>) {
            *self.current.lock().unwrap() = descriptors;
        }
    }

    impl DiscoveryProbe for SettableProbe {
        fn probe(&self) -> BoxFuture<'_, Result<Vec<PeripheralDescriptor>, DiscoveryError>> {
            let report = self.current.lock().unwrap().clone();
            Box::pin(async move { Ok(report) })
        }
    }

    /// Transport that answers every request with a canned reply.
    struct CannedTransport {
        reply: String,
    }

    impl Transport for CannedTransport {
        fn send_line<'a>(
            &'a mut self,
            _line: &'a str,
        ) -> BoxFuture<'a, Result<(), TransportError>> {
            Box::pin(async { Ok(()) })
        }

        fn recv_line(&mut self) -> BoxFuture<'_, Result<String, TransportError>> {
            let reply = self.reply.clone();
            Box::pin(async move { Ok(reply) })
        }
    }

    struct CannedFactory;

    impl TransportFactory for CannedFactory {
        fn open<'a>(
            &'a self,
            descriptor: &'a PeripheralDescriptor,
        ) -> BoxFuture<'a, Result<Box<dyn Transport>, TransportError>> {
            Box::pin(async move {
                if descriptor.address == "missing" {
                    return Err(TransportError::Closed);
                }
                // Parses as an RSSI and is non-empty as an info reply.
                Ok(Box::new(CannedTransport {
                    reply: "-70.0".to_string(),
                }) as Box<dyn Transport>)
            })
        }
    }

    fn radio(name: &str, address: &str) -> PeripheralDescriptor {
        PeripheralDescriptor {
            name: name.to_string(),
            kind: PeripheralKind::Radio,
            address: address.to_string(),
            capabilities: vec![],
        }
    }

    fn manager(probe: SettableProbe) -> DaemonManager {
        let mut config = AppConfig::default();
        config.daemon.poll_interval_ms = 50;
        config.transport.acquire_timeout_ms = 200;
        config.transport.io_timeout_ms = 200;
        DaemonManager::new(
            config,
            Arc::new(WorldState::new(64)),
            EventBus::new(64),
            Box::new(probe),
            Box::new(CannedFactory),
        )
    }

    #[tokio::test]
    async fn test_discovery_registers_daemons() {
        let probe = SettableProbe::reporting(vec![radio("flipper", "/dev/ttyUSB0")]);
        let manager = manager(probe);

        let summary = manager.discover_and_configure().await.unwrap();
        assert_eq!(summary.added, vec!["flipper".to_string()]);
        assert_eq!(manager.registry().names(), vec!["flipper".to_string()]);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_rediscovery_reconciles() {
        let probe = SettableProbe::reporting(vec![
            radio("flipper", "/dev/ttyUSB0"),
            radio("spare", "/dev/ttyUSB1"),
        ]);
        let manager = manager(probe.clone());

        manager.discover_and_configure().await.unwrap();
        let flipper = manager.registry().get("flipper").unwrap();
        assert_eq!(manager.registry().names().len(), 2);

        // "spare" vanishes, "beacon" appears, "flipper" is unchanged.
        probe.set(vec![
            radio("flipper", "/dev/ttyUSB0"),
            radio("beacon", "/dev/ttyUSB2"),
        ]);
        let summary = manager.discover_and_configure().await.unwrap();
        assert_eq!(summary.added, vec!["beacon".to_string()]);
        assert_eq!(summary.removed, vec!["spare".to_string()]);
        assert_eq!(summary.kept, vec!["flipper".to_string()]);
        // The unchanged daemon kept its handle rather than being rebuilt.
        assert!(Arc::ptr_eq(
            &flipper,
            &manager.registry().get("flipper").unwrap()
        ));

        // Same name, different address: the daemon is rebuilt.
        probe.set(vec![radio("flipper", "/dev/ttyUSB3")]);
        let summary = manager.discover_and_configure().await.unwrap();
        assert_eq!(summary.added, vec!["flipper".to_string()]);
        assert_eq!(summary.removed, vec!["beacon".to_string(), "flipper".to_string()]);
        assert!(!Arc::ptr_eq(
            &flipper,
            &manager.registry().get("flipper").unwrap()
        ));

        manager.shutdown().await;
        assert!(manager.registry().names().is_empty());
    }

    #[tokio::test]
    async fn test_unopenable_transport_is_skipped_not_fatal() {
        let probe = SettableProbe::reporting(vec![
            radio("good", "/dev/ttyUSB0"),
            radio("bad", "missing"),
        ]);
        let manager = manager(probe);

        let summary = manager.discover_and_configure().await.unwrap();
        assert_eq!(summary.added, vec!["good".to_string()]);
        assert!(manager.registry().get("bad").is_none());
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_start_all_tolerates_connect_failures() {
        // "bad" never gets registered (unopenable); "good" starts fine.
        let probe = SettableProbe::reporting(vec![
            radio("good", "/dev/ttyUSB0"),
            radio("bad", "missing"),
        ]);
        let manager = manager(probe);
        manager.discover_and_configure().await.unwrap();
        manager.start_all().await;

        let good = manager.registry().get("good").unwrap();
        good.wait_for(crate::daemon::DaemonState::Running).await;
        manager.stop_all().await;
        assert_eq!(good.state(), crate::daemon::DaemonState::Stopped);
        manager.shutdown().await;
    }
}
