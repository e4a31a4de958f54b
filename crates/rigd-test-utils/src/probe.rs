//! Discovery probe with a test-controlled report.

use std::sync::{Arc, Mutex};

use rigd_core::manager::{DiscoveryError, DiscoveryProbe};
use rigd_core::peripheral::PeripheralDescriptor;
use rigd_core::BoxFuture;

/// A probe whose report the test sets; every clone shares it, so the report
/// can change between discovery passes.
#[derive(Clone)]
pub struct ScriptedProbe {
    report: Arc<Mutex<Result<Vec<PeripheralDescriptor>, String>>>,
}

impl Default for ScriptedProbe {
    fn default() -> Self {
        Self {
            report: Arc::new(Mutex::new(Ok(Vec::new()))),
        }
    }
}

impl ScriptedProbe {
    /// A probe initially reporting `descriptors`.
    pub fn reporting(descriptors: Vec<PeripheralDescriptor>) -> Self {
        let probe = Self::default();
        probe.set(descriptors);
        probe
    }

    /// Replace the report for subsequent probes.
    pub fn set(&self, descriptors: Vec<PeripheralDescriptor>) {
        *self.report.lock().expect("probe lock poisoned") = Ok(descriptors);
    }

    /// Make subsequent probes fail with `reason`.
    pub fn fail_with(&self, reason: &str) {
        *self.report.lock().expect("probe lock poisoned") = Err(reason.to_string());
    }
}

impl DiscoveryProbe for ScriptedProbe {
    fn probe(&self) -> BoxFuture<'_, Result<Vec<PeripheralDescriptor>, DiscoveryError>> {
        let report = self.report.lock().expect("probe lock poisoned").clone();
        Box::pin(async move { report.map_err(DiscoveryError::PeripheralUnavailable) })
    }
}
