//! Peripheral identity types and sensor readings.

use std::fmt;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Capability tag: the peripheral can run frequency scans.
pub const CAP_SCAN: &str = "can-scan";
/// Capability tag: the peripheral can drive actuators.
pub const CAP_ACTUATE: &str = "can-actuate";
/// Capability tag: the peripheral can run on-device inference.
pub const CAP_INFER: &str = "can-infer";

/// The closed set of supported peripheral classes.
///
/// Discovery maps every reachable device onto one of these; there is no
/// open-ended runtime type inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeripheralKind {
    /// Serial-attached microcontroller speaking the line wire protocol.
    Microcontroller,
    /// RF/radio instrument.
    Radio,
    /// USB neural-inference accelerator.
    Accelerator,
}

impl PeripheralKind {
    /// Parse a kind from its config-file spelling.
    pub fn from_config(kind: &str) -> Option<Self> {
        match kind {
            "microcontroller" => Some(Self::Microcontroller),
            "radio" => Some(Self::Radio),
            "accelerator" => Some(Self::Accelerator),
            _ => None,
        }
    }
}

impl fmt::Display for PeripheralKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Microcontroller => "microcontroller",
            Self::Radio => "radio",
            Self::Accelerator => "accelerator",
        };
        f.write_str(s)
    }
}

/// Identity of one discovered peripheral.
///
/// Immutable once discovered; re-discovery replaces the descriptor wholesale
/// (the manager stops and rebuilds the daemon on any change).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeripheralDescriptor {
    /// Unique name; doubles as the daemon name and world-state namespace.
    pub name: String,
    /// Peripheral class.
    pub kind: PeripheralKind,
    /// Transport address (serial port or bus path).
    pub address: String,
    /// Capability tags (e.g. [`CAP_SCAN`]).
    #[serde(default)]
    pub capabilities: Vec<String>,
}

impl PeripheralDescriptor {
    /// Whether this peripheral carries the given capability tag.
    pub fn has_capability(&self, tag: &str) -> bool {
        self.capabilities.iter().any(|c| c == tag)
    }
}

/// A single value produced by a daemon, destined for the world state.
#[derive(Debug, Clone)]
pub struct Reading {
    /// Dot-delimited world-state path (e.g. `flipper.scan_count`).
    pub path: String,
    /// The value.
    pub value: Value,
    /// When the value was read from hardware.
    pub timestamp: SystemTime,
    /// Name of the daemon that produced it.
    pub source: String,
}

impl Reading {
    /// Create a reading timestamped now.
    pub fn new(path: impl Into<String>, value: Value, source: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            value,
            timestamp: SystemTime::now(),
            source: source.into(),
        }
    }
}
