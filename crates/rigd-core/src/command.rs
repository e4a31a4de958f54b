//! Command dispatch and lifecycle tracking.
//!
//! The dispatcher turns `(target, action, params)` into a tracked
//! [`ActionCommand`] and hands it to the target daemon without ever blocking
//! on hardware. The tracker owns every [`CommandStatus`] record; daemons
//! report through [`StatusReporter`] handles and all transitions are
//! monotonic forward — a terminal record never changes again, regressions
//! are dropped and logged. Every transition is pushed through the event bus
//! (`command.<state>` topics) and through a per-command watch handle, so
//! consumers never need to poll.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::bus::EventBus;
use crate::daemon::ActionRequest;
use crate::manager::DaemonRegistry;

/// Globally unique, monotonically increasing command identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct CommandId(u64);

impl CommandId {
    /// Raw sequence number.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cmd-{}", self.0)
    }
}

/// A tracked request for a daemon to perform a hardware action.
/// Immutable after creation.
#[derive(Debug, Clone)]
pub struct ActionCommand {
    pub id: CommandId,
    pub target: String,
    pub action: String,
    pub params: Value,
    pub issued_at: SystemTime,
}

/// Command lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandState {
    Initiated,
    Acknowledged,
    Completed,
    Failed,
    TimedOut,
}

impl CommandState {
    /// Whether this state ends the lifecycle.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::TimedOut)
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Initiated => "initiated",
            Self::Acknowledged => "acknowledged",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
        }
    }
}

impl fmt::Display for CommandState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle record for one command.
#[derive(Debug, Clone, Serialize)]
pub struct CommandStatus {
    pub id: CommandId,
    pub target: String,
    pub action: String,
    pub state: CommandState,
    pub last_updated: SystemTime,
    /// Result payload, set on `completed`.
    pub result: Option<Value>,
    /// Error detail, set on `failed` / `timed_out`.
    pub error: Option<String>,
}

struct Tracked {
    status: CommandStatus,
    watch_tx: watch::Sender<CommandStatus>,
}

/// Owner of all command lifecycle records.
pub struct CommandTracker {
    records: Mutex<HashMap<CommandId, Tracked>>,
    next_id: AtomicU64,
    bus: EventBus,
    deadline: Duration,
}

impl CommandTracker {
    /// Create a tracker publishing transitions on `bus`, with the given
    /// terminal-state deadline.
    pub fn new(bus: EventBus, deadline: Duration) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            bus,
            deadline,
        }
    }

    /// Allocate a fresh command and its `initiated` record.
    pub fn create(&self, target: String, action: String, params: Value) -> ActionCommand {
        let id = CommandId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let command = ActionCommand {
            id,
            target,
            action,
            params,
            issued_at: SystemTime::now(),
        };
        let status = CommandStatus {
            id,
            target: command.target.clone(),
            action: command.action.clone(),
            state: CommandState::Initiated,
            last_updated: command.issued_at,
            result: None,
            error: None,
        };
        let (watch_tx, _) = watch::channel(status.clone());
        self.records.lock().expect("tracker lock poisoned").insert(
            id,
            Tracked {
                status: status.clone(),
                watch_tx,
            },
        );
        self.publish(&status);
        command
    }

    /// Reporter handle for one command, given to the target daemon.
    pub fn reporter(self: &Arc<Self>, id: CommandId) -> StatusReporter {
        StatusReporter {
            tracker: Arc::clone(self),
            id,
        }
    }

    /// Arm the timeout watchdog: if the command has not reached a terminal
    /// state when the deadline elapses, it becomes `timed_out` — still
    /// queryable, never silently dropped.
    pub fn arm_deadline(self: &Arc<Self>, id: CommandId) {
        let tracker = Arc::clone(self);
        let deadline = self.deadline;
        tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            if tracker.transition(
                id,
                CommandState::TimedOut,
                None,
                Some(format!("no terminal status within {deadline:?}")),
            ) {
                warn!(id = %id, "command timed out");
            }
        });
    }

    /// Apply a forward transition. Returns whether it was applied.
    pub fn transition(
        &self,
        id: CommandId,
        state: CommandState,
        result: Option<Value>,
        error: Option<String>,
    ) -> bool {
        let mut records = self.records.lock().expect("tracker lock poisoned");
        let Some(tracked) = records.get_mut(&id) else {
            debug!(id = %id, "transition for unknown command ignored");
            return false;
        };
        let current = tracked.status.state;
        let forward = !current.is_terminal()
            && match state {
                CommandState::Initiated => false,
                CommandState::Acknowledged => current == CommandState::Initiated,
                CommandState::Completed | CommandState::Failed | CommandState::TimedOut => true,
            };
        if !forward {
            debug!(id = %id, from = %current, to = %state, "non-forward transition dropped");
            return false;
        }

        tracked.status.state = state;
        tracked.status.last_updated = SystemTime::now();
        tracked.status.result = result;
        tracked.status.error = error;
        let status = tracked.status.clone();
        tracked.watch_tx.send_replace(status.clone());
        drop(records);

        info!(id = %id, state = %state, "command transition");
        self.publish(&status);
        true
    }

    fn publish(&self, status: &CommandStatus) {
        self.bus.publish_as(
            "tracker",
            &format!("command.{}", status.state.as_str()),
            json!({
                "id": status.id,
                "target": status.target,
                "action": status.action,
                "state": status.state,
                "error": status.error,
            }),
        );
    }

    /// Current status. `None` is the defined answer for an id that was never
    /// submitted.
    pub fn get_status(&self, id: CommandId) -> Option<CommandStatus> {
        let records = self.records.lock().expect("tracker lock poisoned");
        records.get(&id).map(|t| t.status.clone())
    }

    /// Future-style handle on one command's status transitions.
    pub fn watch(&self, id: CommandId) -> Option<watch::Receiver<CommandStatus>> {
        let records = self.records.lock().expect("tracker lock poisoned");
        records.get(&id).map(|t| t.watch_tx.subscribe())
    }

    /// All commands not yet in a terminal state.
    pub fn list_active(&self) -> Vec<CommandStatus> {
        let records = self.records.lock().expect("tracker lock poisoned");
        let mut active: Vec<CommandStatus> = records
            .values()
            .filter(|t| !t.status.state.is_terminal())
            .map(|t| t.status.clone())
            .collect();
        active.sort_by_key(|s| s.id);
        active
    }
}

/// Handle a daemon uses to report one command's status.
pub struct StatusReporter {
    tracker: Arc<CommandTracker>,
    id: CommandId,
}

impl StatusReporter {
    /// Report prompt acknowledgement, before the physical operation
    /// completes.
    pub fn acknowledged(&self) {
        self.tracker
            .transition(self.id, CommandState::Acknowledged, None, None);
    }

    /// Report successful completion with a result payload.
    pub fn completed(&self, result: Value) {
        self.tracker
            .transition(self.id, CommandState::Completed, Some(result), None);
    }

    /// Report terminal failure with an error detail.
    pub fn failed(&self, error: String) {
        self.tracker
            .transition(self.id, CommandState::Failed, None, Some(error));
    }
}

/// Errors surfaced to the command submitter.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// The target daemon was never discovered or has been stopped.
    #[error("daemon not found: {0}")]
    TargetMissing(String),
}

/// Routes action requests to daemons and tracks them to a terminal state.
///
/// The dispatcher never blocks on hardware: it resolves the target, creates
/// the record, queues the request, arms the watchdog, and returns.
pub struct CommandDispatcher {
    registry: Arc<DaemonRegistry>,
    tracker: Arc<CommandTracker>,
}

impl CommandDispatcher {
    /// Create a dispatcher over the live daemon registry.
    pub fn new(registry: Arc<DaemonRegistry>, tracker: Arc<CommandTracker>) -> Self {
        Self { registry, tracker }
    }

    /// Submit an action to `target`.
    ///
    /// Returns the fresh command id; the caller follows progress via
    /// [`get_status`](Self::get_status), [`watch`](Self::watch), or
    /// `command.*` bus events. A daemon whose action queue is unavailable
    /// fails the command terminally rather than blocking the submitter.
    pub fn submit(
        &self,
        target: &str,
        action: &str,
        params: Value,
    ) -> Result<CommandId, DispatchError> {
        let handle = self
            .registry
            .get(target)
            .ok_or_else(|| DispatchError::TargetMissing(target.to_string()))?;
        if handle.state() == crate::daemon::DaemonState::Stopped {
            return Err(DispatchError::TargetMissing(target.to_string()));
        }

        let command = self
            .tracker
            .create(target.to_string(), action.to_string(), params);
        let id = command.id;
        self.tracker.arm_deadline(id);

        let request = ActionRequest {
            command,
            reporter: self.tracker.reporter(id),
        };
        if let Err(request) = handle.dispatch(request) {
            warn!(id = %id, target, "action queue unavailable");
            request.reporter.failed("action queue unavailable".into());
        }
        Ok(id)
    }

    /// Current status of a command; `None` for ids never submitted.
    pub fn get_status(&self, id: CommandId) -> Option<CommandStatus> {
        self.tracker.get_status(id)
    }

    /// Future-style handle on one command's status.
    pub fn watch(&self, id: CommandId) -> Option<watch::Receiver<CommandStatus>> {
        self.tracker.watch(id)
    }

    /// All non-terminal commands.
    pub fn list_active(&self) -> Vec<CommandStatus> {
        self.tracker.list_active()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn tracker() -> Arc<CommandTracker> {
        Arc::new(CommandTracker::new(
            EventBus::new(64),
            Duration::from_millis(100),
        ))
    }

    #[test]
    fn test_distinct_ids_under_concurrency() {
        let tracker = tracker();
        let mut handles = Vec::new();
        for _ in 0..8 {
            let tracker = tracker.clone();
            handles.push(std::thread::spawn(move || {
                (0..100)
                    .map(|_| {
                        tracker
                            .create("d".into(), "a".into(), Value::Null)
                            .id
                            .as_u64()
                    })
                    .collect::<Vec<_>>()
            }));
        }
        let mut all: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 800);
    }

    #[test]
    fn test_unknown_id_is_defined_not_fatal() {
        let tracker = tracker();
        assert!(tracker.get_status(CommandId(999)).is_none());
        assert!(tracker.watch(CommandId(999)).is_none());
    }

    #[test]
    fn test_transitions_are_forward_only() {
        let tracker = tracker();
        let id = tracker.create("d".into(), "a".into(), Value::Null).id;

        assert!(tracker.transition(id, CommandState::Acknowledged, None, None));
        assert!(tracker.transition(id, CommandState::Completed, Some(json!(1)), None));
        // Terminal records never change again.
        assert!(!tracker.transition(id, CommandState::Failed, None, Some("late".into())));
        assert!(!tracker.transition(id, CommandState::Acknowledged, None, None));

        let status = tracker.get_status(id).unwrap();
        assert_eq!(status.state, CommandState::Completed);
        assert_eq!(status.result, Some(json!(1)));
    }

    #[test]
    fn test_ack_only_from_initiated() {
        let tracker = tracker();
        let id = tracker.create("d".into(), "a".into(), Value::Null).id;
        assert!(tracker.transition(id, CommandState::Acknowledged, None, None));
        assert!(!tracker.transition(id, CommandState::Acknowledged, None, None));
    }

    #[test]
    fn test_list_active_excludes_terminal() {
        let tracker = tracker();
        let a = tracker.create("d".into(), "a".into(), Value::Null).id;
        let b = tracker.create("d".into(), "b".into(), Value::Null).id;
        tracker.transition(a, CommandState::Completed, None, None);

        let active = tracker.list_active();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, b);
    }

    #[tokio::test]
    async fn test_watchdog_times_out_pending_commands() {
        let tracker = tracker();
        let id = tracker.create("d".into(), "a".into(), Value::Null).id;
        tracker.arm_deadline(id);
        tracker.transition(id, CommandState::Acknowledged, None, None);

        let mut rx = tracker.watch(id).unwrap();
        loop {
            rx.changed().await.unwrap();
            let status = rx.borrow().clone();
            if status.state.is_terminal() {
                assert_eq!(status.state, CommandState::TimedOut);
                assert!(status.error.unwrap().contains("no terminal status"));
                break;
            }
        }
        // Still queryable after timing out.
        assert_eq!(
            tracker.get_status(id).unwrap().state,
            CommandState::TimedOut
        );
    }

    #[tokio::test]
    async fn test_watchdog_spares_completed_commands() {
        let tracker = tracker();
        let id = tracker.create("d".into(), "a".into(), Value::Null).id;
        tracker.arm_deadline(id);
        tracker.transition(id, CommandState::Completed, None, None);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(
            tracker.get_status(id).unwrap().state,
            CommandState::Completed
        );
    }

    #[tokio::test]
    async fn test_transitions_published_on_bus() {
        let bus = EventBus::new(64);
        let tracker = Arc::new(CommandTracker::new(bus.clone(), Duration::from_secs(5)));
        let mut sub = bus.subscribe("command.*");

        let id = tracker.create("d".into(), "a".into(), Value::Null).id;
        tracker.transition(id, CommandState::Acknowledged, None, None);
        tracker.transition(id, CommandState::Failed, None, Some("nope".into()));

        assert_eq!(sub.next_event().await.unwrap().topic, "command.initiated");
        assert_eq!(
            sub.next_event().await.unwrap().topic,
            "command.acknowledged"
        );
        let failed = sub.next_event().await.unwrap();
        assert_eq!(failed.topic, "command.failed");
        assert_eq!(failed.payload["error"], json!("nope"));
    }
}
