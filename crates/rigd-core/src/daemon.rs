//! Generic peripheral-daemon lifecycle runner.
//!
//! One [`DaemonRuntime`] task owns each attached peripheral. Concrete
//! drivers implement [`PeripheralDriver`] — connect, poll, perform — and the
//! runner owns everything else: the `stopped → connecting → running ↔
//! faulted → stopping → stopped` lifecycle, the circuit breaker, transport
//! acquisition, writing readings into the world state, publishing events,
//! and reporting command status. Drivers specialize behavior, never
//! lifecycle.
//!
//! The runner processes actions from its queue serially, so commands
//! submitted to one daemon are performed in submission order. In-flight
//! transport operations are finished (not torn mid-byte) before a stop takes
//! effect; the transport permit's RAII release guarantees the channel is
//! freed exactly once on every path.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use rigd_config::AppConfig;

use crate::breaker::CircuitBreaker;
use crate::bus::EventBus;
use crate::command::{ActionCommand, StatusReporter};
use crate::peripheral::{PeripheralDescriptor, Reading};
use crate::state::WorldState;
use crate::transport::{TransportError, TransportGuard, TransportPermit};
use crate::BoxFuture;

/// Daemon lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DaemonState {
    Stopped,
    Connecting,
    Running,
    Faulted,
    Stopping,
}

impl fmt::Display for DaemonState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Stopped => "stopped",
            Self::Connecting => "connecting",
            Self::Running => "running",
            Self::Faulted => "faulted",
            Self::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

/// Why a driver action failed.
#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    /// The driver does not implement this action. Not a hardware fault; the
    /// breaker is not charged for it.
    #[error("unsupported action {0:?}")]
    Unsupported(String),

    /// The parameters do not fit the action. Not a hardware fault either.
    #[error("invalid parameters: {0}")]
    InvalidParams(String),

    /// The hardware operation itself failed.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl ActionError {
    fn is_hardware_fault(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

/// Result of a completed driver action.
#[derive(Debug, Default)]
pub struct ActionOutcome {
    /// Result payload reported with the `completed` status.
    pub result: Value,
    /// Readings to fold into the world state immediately (e.g. the new
    /// actuator value after a write).
    pub readings: Vec<Reading>,
}

/// Behavior of one peripheral class. Implementations are the closed driver
/// set in [`crate::daemons`]; the runner invokes every method while holding
/// the transport permit, so drivers never see an unguarded channel.
pub trait PeripheralDriver: Send {
    /// The descriptor this driver was built for.
    fn descriptor(&self) -> &PeripheralDescriptor;

    /// Open/identify the peripheral.
    fn connect<'a>(
        &'a mut self,
        permit: &'a mut TransportPermit,
    ) -> BoxFuture<'a, Result<(), TransportError>>;

    /// Read the current values.
    fn poll<'a>(
        &'a mut self,
        permit: &'a mut TransportPermit,
    ) -> BoxFuture<'a, Result<Vec<Reading>, TransportError>>;

    /// Perform one dispatched action.
    fn perform<'a>(
        &'a mut self,
        permit: &'a mut TransportPermit,
        action: &'a str,
        params: &'a Value,
    ) -> BoxFuture<'a, Result<ActionOutcome, ActionError>>;
}

/// A dispatched action on its way to a daemon.
pub struct ActionRequest {
    pub command: ActionCommand,
    pub reporter: StatusReporter,
}

#[derive(Debug)]
enum Control {
    Start,
    Stop,
    Shutdown,
}

/// Handle to a running daemon task.
///
/// Held by the manager's registry; dropping the last handle shuts the task
/// down.
pub struct DaemonHandle {
    descriptor: PeripheralDescriptor,
    control_tx: mpsc::Sender<Control>,
    action_tx: mpsc::Sender<ActionRequest>,
    state_rx: watch::Receiver<DaemonState>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl DaemonHandle {
    /// Daemon name (the peripheral name).
    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    /// The descriptor the daemon was built from.
    pub fn descriptor(&self) -> &PeripheralDescriptor {
        &self.descriptor
    }

    /// Current lifecycle state.
    pub fn state(&self) -> DaemonState {
        *self.state_rx.borrow()
    }

    /// Ask the daemon to start. No-op if already started.
    pub async fn start(&self) {
        let _ = self.control_tx.send(Control::Start).await;
    }

    /// Request a cooperative stop and wait until the daemon reports stopped.
    /// Safe to call in any state, including faulted or connecting.
    pub async fn stop(&self) {
        let _ = self.control_tx.send(Control::Stop).await;
        self.wait_for(DaemonState::Stopped).await;
    }

    /// Stop the daemon and end its task. Used on deregistration.
    pub async fn retire(&self) {
        let _ = self.control_tx.send(Control::Shutdown).await;
        let task = self.task.lock().await.take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    /// Wait until the daemon reaches `target`.
    pub async fn wait_for(&self, target: DaemonState) {
        let mut rx = self.state_rx.clone();
        loop {
            if *rx.borrow_and_update() == target {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Subscribe to lifecycle-state changes.
    pub fn state_changes(&self) -> watch::Receiver<DaemonState> {
        self.state_rx.clone()
    }

    /// Queue an action without blocking on hardware. On a full or closed
    /// queue the request is returned so the caller can fail it.
    pub(crate) fn dispatch(&self, request: ActionRequest) -> Result<(), ActionRequest> {
        self.action_tx.try_send(request).map_err(|err| match err {
            mpsc::error::TrySendError::Full(r) | mpsc::error::TrySendError::Closed(r) => r,
        })
    }
}

enum Session {
    Stopped,
    Shutdown,
}

enum Run {
    Faulted,
    Stopped,
    Shutdown,
}

#[derive(PartialEq)]
enum OpResult {
    Ok,
    Faulted,
}

/// The generic runner owning one peripheral's lifecycle.
pub struct DaemonRuntime {
    name: String,
    driver: Box<dyn PeripheralDriver>,
    guard: TransportGuard,
    breaker: CircuitBreaker,
    world: Arc<WorldState>,
    bus: EventBus,
    poll_interval: Duration,
    action_timeout: Duration,
    state_tx: watch::Sender<DaemonState>,
    control_rx: mpsc::Receiver<Control>,
    action_rx: mpsc::Receiver<ActionRequest>,
}

impl DaemonRuntime {
    /// Spawn the runner task for one driver and return its handle.
    ///
    /// The daemon starts in `stopped` and does nothing until
    /// [`DaemonHandle::start`].
    pub fn spawn(
        driver: Box<dyn PeripheralDriver>,
        guard: TransportGuard,
        config: &AppConfig,
        world: Arc<WorldState>,
        bus: EventBus,
    ) -> DaemonHandle {
        let descriptor = driver.descriptor().clone();
        let (control_tx, control_rx) = mpsc::channel(4);
        let (action_tx, action_rx) = mpsc::channel(32);
        let (state_tx, state_rx) = watch::channel(DaemonState::Stopped);

        let runtime = Self {
            name: descriptor.name.clone(),
            driver,
            guard,
            breaker: CircuitBreaker::new(config.breaker.clone()),
            world,
            bus,
            poll_interval: config.daemon.poll_interval(),
            action_timeout: config.daemon.action_timeout(),
            state_tx,
            control_rx,
            action_rx,
        };
        let task = tokio::spawn(runtime.run());

        DaemonHandle {
            descriptor,
            control_tx,
            action_tx,
            state_rx,
            task: Mutex::new(Some(task)),
        }
    }

    async fn run(mut self) {
        self.mirror_status(DaemonState::Stopped);
        loop {
            // Stopped: wait for a control command.
            match self.control_rx.recv().await {
                Some(Control::Start) => {}
                Some(Control::Stop) => {
                    self.set_state(DaemonState::Stopped);
                    continue;
                }
                Some(Control::Shutdown) | None => break,
            }
            match self.session().await {
                Session::Stopped => {
                    self.drain_pending_actions("daemon stopped");
                    self.set_state(DaemonState::Stopped);
                }
                Session::Shutdown => break,
            }
        }
        self.drain_pending_actions("daemon shut down");
        self.set_state(DaemonState::Stopped);
        debug!(daemon = %self.name, "runner exited");
    }

    /// One started session: connect (with breaker-paced retries) and run
    /// until stopped or shut down.
    async fn session(&mut self) -> Session {
        loop {
            self.set_state(DaemonState::Connecting);
            if let Err(retry_in) = self.connect_once().await {
                self.set_state(DaemonState::Faulted);
                match self.faulted_wait(retry_in).await {
                    Some(session) => return session,
                    None => continue,
                }
            }

            self.set_state(DaemonState::Running);
            match self.running_loop().await {
                Run::Faulted => {
                    self.set_state(DaemonState::Faulted);
                    continue;
                }
                Run::Stopped => {
                    self.set_state(DaemonState::Stopping);
                    return Session::Stopped;
                }
                Run::Shutdown => {
                    self.set_state(DaemonState::Stopping);
                    return Session::Shutdown;
                }
            }
        }
    }

    /// Attempt one connect, reporting the delay to wait before retrying on
    /// failure.
    async fn connect_once(&mut self) -> Result<(), Duration> {
        if let Err(open) = self.breaker.preflight() {
            return Err(open.retry_in.max(Duration::from_millis(10)));
        }
        let result = async {
            let mut permit = self.guard.acquire().await?;
            self.driver.connect(&mut permit).await
        }
        .await;
        match result {
            Ok(()) => {
                self.breaker.record_success();
                info!(daemon = %self.name, "connected");
                Ok(())
            }
            Err(err) => {
                warn!(daemon = %self.name, error = %err, "connect failed");
                self.breaker.record_failure();
                Err(self.poll_interval)
            }
        }
    }

    /// Faulted: wait out the retry delay, failing incoming actions fast.
    /// Returns `Some` if the session should end.
    async fn faulted_wait(&mut self, delay: Duration) -> Option<Session> {
        let deadline = tokio::time::sleep(delay);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => return None,
                ctrl = self.control_rx.recv() => match ctrl {
                    Some(Control::Start) => {}
                    Some(Control::Stop) => return Some(Session::Stopped),
                    Some(Control::Shutdown) | None => return Some(Session::Shutdown),
                },
                Some(request) = self.action_rx.recv() => {
                    request.reporter.acknowledged();
                    request
                        .reporter
                        .failed(format!("peripheral unavailable: {} is faulted", self.name));
                }
            }
        }
    }

    async fn running_loop(&mut self) -> Run {
        let mut poll_tick = tokio::time::interval(self.poll_interval);
        poll_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                ctrl = self.control_rx.recv() => match ctrl {
                    Some(Control::Start) => {}
                    Some(Control::Stop) => return Run::Stopped,
                    Some(Control::Shutdown) | None => return Run::Shutdown,
                },
                Some(request) = self.action_rx.recv() => {
                    if self.handle_action(request).await == OpResult::Faulted {
                        return Run::Faulted;
                    }
                }
                _ = poll_tick.tick() => {
                    if self.handle_poll().await == OpResult::Faulted {
                        return Run::Faulted;
                    }
                }
            }
        }
    }

    async fn handle_poll(&mut self) -> OpResult {
        if self.breaker.preflight().is_err() {
            return OpResult::Faulted;
        }
        let result = async {
            let mut permit = self.guard.acquire().await?;
            self.driver.poll(&mut permit).await
        }
        .await;
        match result {
            Ok(readings) => {
                self.breaker.record_success();
                self.apply_readings(readings);
                OpResult::Ok
            }
            Err(err) => {
                warn!(daemon = %self.name, error = %err, "poll failed");
                self.breaker.record_failure();
                self.mirror_status(DaemonState::Running);
                if self.breaker.state() == crate::breaker::BreakerState::Open {
                    OpResult::Faulted
                } else {
                    OpResult::Ok
                }
            }
        }
    }

    async fn handle_action(&mut self, request: ActionRequest) -> OpResult {
        let ActionRequest { command, reporter } = request;
        // Acknowledge promptly, before the physical operation completes.
        reporter.acknowledged();

        if let Err(open) = self.breaker.preflight() {
            reporter.failed(format!(
                "transport failure: circuit open, retry in {:?}",
                open.retry_in
            ));
            return OpResult::Faulted;
        }

        debug!(daemon = %self.name, action = %command.action, id = %command.id, "performing action");
        let op = async {
            let mut permit = self.guard.acquire().await.map_err(ActionError::from)?;
            self.driver
                .perform(&mut permit, &command.action, &command.params)
                .await
        };
        match tokio::time::timeout(self.action_timeout, op).await {
            Ok(Ok(outcome)) => {
                self.breaker.record_success();
                self.apply_readings(outcome.readings);
                reporter.completed(outcome.result);
                OpResult::Ok
            }
            Ok(Err(err)) => {
                let hardware = err.is_hardware_fault();
                reporter.failed(err.to_string());
                if hardware {
                    warn!(daemon = %self.name, id = %command.id, error = %err, "action failed");
                    self.breaker.record_failure();
                    self.mirror_status(DaemonState::Running);
                    if self.breaker.state() == crate::breaker::BreakerState::Open {
                        return OpResult::Faulted;
                    }
                }
                OpResult::Ok
            }
            Err(_) => {
                warn!(daemon = %self.name, id = %command.id, "action timed out on hardware");
                self.breaker.record_failure();
                reporter.failed(format!(
                    "transport failure: action exceeded {:?}",
                    self.action_timeout
                ));
                self.mirror_status(DaemonState::Running);
                if self.breaker.state() == crate::breaker::BreakerState::Open {
                    OpResult::Faulted
                } else {
                    OpResult::Ok
                }
            }
        }
    }

    fn apply_readings(&self, readings: Vec<Reading>) {
        for reading in readings {
            self.world.set(&reading.path, reading.value.clone());
            self.bus.publish_as(
                &self.name,
                &format!("reading.{}", self.name),
                json!({ "path": reading.path, "value": reading.value }),
            );
        }
    }

    fn drain_pending_actions(&mut self, reason: &str) {
        while let Ok(request) = self.action_rx.try_recv() {
            request.reporter.acknowledged();
            request.reporter.failed(reason.to_string());
        }
    }

    fn set_state(&self, state: DaemonState) {
        if *self.state_tx.borrow() == state {
            return;
        }
        self.state_tx.send_replace(state);
        info!(daemon = %self.name, state = %state, "daemon state");
        self.mirror_status(state);
        self.bus.publish_as(
            &self.name,
            &format!("daemon.{}.state", self.name),
            json!(state),
        );
    }

    /// Mirror lifecycle + breaker status into the world state.
    fn mirror_status(&self, state: DaemonState) {
        self.world.set(
            &format!("{}.status", self.name),
            json!({ "state": state, "breaker": self.breaker.snapshot() }),
        );
    }
}
