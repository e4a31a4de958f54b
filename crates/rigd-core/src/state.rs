//! Shared world state — the versioned, path-addressed store of latest values.
//!
//! Every sensor reading, inferred feature, and status field lives here under
//! a dot-delimited path (`flipper.scan_count`, `coral.latest_features`).
//! Daemons hold no authoritative copies; consumers read snapshots or follow
//! a change stream. The store is always constructed explicitly and passed in
//! (`Arc<WorldState>`) — there is no ambient singleton, so tests get a fresh
//! store each.

use std::collections::HashMap;
use std::sync::RwLock;

use serde_json::Value;
use tokio::sync::broadcast;
use tracing::debug;

/// One change notification from [`WorldState::subscribe_changes`].
#[derive(Debug, Clone)]
pub struct ChangeNotice {
    /// Full path that was written.
    pub path: String,
    /// The new value.
    pub value: Value,
    /// Per-path version after the write (starts at 1).
    pub version: u64,
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    version: u64,
}

/// Versioned key-path store holding the latest known value per path.
///
/// Writes replace the whole value at a path atomically and bump that path's
/// version counter; readers always observe either the previous or the new
/// value, never a partial composite. All reads return clones, so mutating a
/// returned value never affects the store.
pub struct WorldState {
    entries: RwLock<HashMap<String, Entry>>,
    changes: broadcast::Sender<ChangeNotice>,
}

impl WorldState {
    /// Create an empty store with the given change-stream buffer capacity.
    ///
    /// A slow change subscriber lags (oldest notices dropped) rather than
    /// blocking writers; the per-path versions make any loss observable as a
    /// gap.
    pub fn new(change_capacity: usize) -> Self {
        let (changes, _) = broadcast::channel(change_capacity.max(2));
        Self {
            entries: RwLock::new(HashMap::new()),
            changes,
        }
    }

    /// Atomically replace the value at `path` and bump its version.
    ///
    /// Returns the new version.
    pub fn set(&self, path: &str, value: Value) -> u64 {
        let version = {
            let mut entries = self.entries.write().expect("world state lock poisoned");
            let entry = entries.entry(path.to_string()).or_insert(Entry {
                value: Value::Null,
                version: 0,
            });
            entry.version += 1;
            entry.value = value.clone();
            entry.version
        };

        // Fire-and-forget: no receivers is fine.
        let _ = self.changes.send(ChangeNotice {
            path: path.to_string(),
            value,
            version,
        });

        version
    }

    /// Latest value at `path`, or `None` if never written.
    pub fn get(&self, path: &str) -> Option<Value> {
        let entries = self.entries.read().expect("world state lock poisoned");
        entries.get(path).map(|e| e.value.clone())
    }

    /// Latest value and version at `path`.
    pub fn get_versioned(&self, path: &str) -> Option<(Value, u64)> {
        let entries = self.entries.read().expect("world state lock poisoned");
        entries.get(path).map(|e| (e.value.clone(), e.version))
    }

    /// Resolve a dotted path, descending into nested JSON mappings.
    ///
    /// The longest stored prefix of `path` is located first, then any
    /// remaining segments are resolved through object fields of its value.
    /// Returns `None` (never an error) on any missing segment.
    pub fn get_nested(&self, path: &str) -> Option<Value> {
        let entries = self.entries.read().expect("world state lock poisoned");
        if let Some(entry) = entries.get(path) {
            return Some(entry.value.clone());
        }

        // Try successively shorter stored prefixes, longest first.
        let segments: Vec<&str> = path.split('.').collect();
        for split in (1..segments.len()).rev() {
            let prefix = segments[..split].join(".");
            if let Some(entry) = entries.get(&prefix) {
                let mut current = &entry.value;
                for segment in &segments[split..] {
                    match current {
                        Value::Object(map) => current = map.get(*segment)?,
                        _ => return None,
                    }
                }
                return Some(current.clone());
            }
        }
        None
    }

    /// All paths currently present, sorted.
    pub fn paths(&self) -> Vec<String> {
        let entries = self.entries.read().expect("world state lock poisoned");
        let mut paths: Vec<String> = entries.keys().cloned().collect();
        paths.sort();
        paths
    }

    /// Subscribe to change notices for paths under `prefix`.
    ///
    /// Each call returns a fresh stream starting at the next write; past
    /// changes are not replayed. An empty prefix matches every path.
    pub fn subscribe_changes(&self, prefix: &str) -> ChangeStream {
        ChangeStream {
            rx: self.changes.subscribe(),
            prefix: prefix.to_string(),
        }
    }
}

/// A stream of [`ChangeNotice`]s under one path prefix.
pub struct ChangeStream {
    rx: broadcast::Receiver<ChangeNotice>,
    prefix: String,
}

impl ChangeStream {
    /// Next matching change, or `None` once the store is dropped.
    ///
    /// If this subscriber fell behind, the oldest notices are skipped and a
    /// debug event is logged; version gaps reveal the loss to the consumer.
    pub async fn next(&mut self) -> Option<ChangeNotice> {
        loop {
            match self.rx.recv().await {
                Ok(notice) => {
                    if path_matches(&self.prefix, &notice.path) {
                        return Some(notice);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!(skipped = n, prefix = %self.prefix, "change stream lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

fn path_matches(prefix: &str, path: &str) -> bool {
    if prefix.is_empty() {
        return true;
    }
    path == prefix
        || (path.len() > prefix.len()
            && path.starts_with(prefix)
            && path.as_bytes()[prefix.len()] == b'.')
}
