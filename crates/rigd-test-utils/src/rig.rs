//! A fully wired orchestration fixture.
//!
//! [`TestRig`] assembles the whole engine — world state, event bus, command
//! tracker and dispatcher, daemon manager — over scripted hardware, with
//! timeouts shortened so failure paths resolve in milliseconds instead of
//! seconds.

use std::sync::Arc;

use rigd_config::AppConfig;
use rigd_core::command::{CommandDispatcher, CommandTracker};
use rigd_core::manager::DaemonManager;
use rigd_core::peripheral::{PeripheralDescriptor, PeripheralKind};
use rigd_core::{EventBus, WorldState};

use crate::probe::ScriptedProbe;
use crate::transport::MockHub;

/// The whole engine over mock hardware.
pub struct TestRig {
    pub config: AppConfig,
    pub world: Arc<WorldState>,
    pub bus: EventBus,
    pub tracker: Arc<CommandTracker>,
    pub manager: DaemonManager,
    pub dispatcher: CommandDispatcher,
    pub probe: ScriptedProbe,
    pub hub: MockHub,
}

/// A config with test-friendly timing: fast polls, short timeouts, a breaker
/// that opens after two failures and retries within 100ms.
pub fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.daemon.poll_interval_ms = 25;
    config.daemon.action_timeout_secs = 2;
    config.breaker.failure_threshold = 2;
    config.breaker.cooldown_ms = 100;
    config.breaker.max_cooldown_ms = 1_000;
    config.transport.acquire_timeout_ms = 500;
    config.transport.io_timeout_ms = 250;
    config.command.deadline_secs = 5;
    config
}

impl TestRig {
    /// Build a rig with [`test_config`] timing.
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    /// Build a rig over an explicit config.
    pub fn with_config(config: AppConfig) -> Self {
        let world = Arc::new(WorldState::new(config.bus.capacity));
        let bus = EventBus::new(config.bus.capacity);
        let tracker = Arc::new(CommandTracker::new(bus.clone(), config.command.deadline()));
        let probe = ScriptedProbe::default();
        let hub = MockHub::new();
        let manager = DaemonManager::new(
            config.clone(),
            Arc::clone(&world),
            bus.clone(),
            Box::new(probe.clone()),
            Box::new(hub.clone()),
        );
        let dispatcher = CommandDispatcher::new(manager.registry(), Arc::clone(&tracker));
        Self {
            config,
            world,
            bus,
            tracker,
            manager,
            dispatcher,
            probe,
            hub,
        }
    }

    /// Point the probe at `descriptors`, run discovery, and start everything.
    pub async fn bring_up(&self, descriptors: Vec<PeripheralDescriptor>) {
        self.probe.set(descriptors);
        self.manager
            .discover_and_configure()
            .await
            .expect("scripted discovery cannot fail");
        self.manager.start_all().await;
    }
}

impl Default for TestRig {
    fn default() -> Self {
        Self::new()
    }
}

/// A microcontroller descriptor with no extra capabilities.
pub fn mcu(name: &str, address: &str) -> PeripheralDescriptor {
    PeripheralDescriptor {
        name: name.to_string(),
        kind: PeripheralKind::Microcontroller,
        address: address.to_string(),
        capabilities: vec![],
    }
}

/// A radio descriptor with the given capabilities.
pub fn radio(name: &str, address: &str, capabilities: &[&str]) -> PeripheralDescriptor {
    PeripheralDescriptor {
        name: name.to_string(),
        kind: PeripheralKind::Radio,
        address: address.to_string(),
        capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
    }
}

/// An accelerator descriptor with the given capabilities.
pub fn accelerator(name: &str, address: &str, capabilities: &[&str]) -> PeripheralDescriptor {
    PeripheralDescriptor {
        name: name.to_string(),
        kind: PeripheralKind::Accelerator,
        address: address.to_string(),
        capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
    }
}
