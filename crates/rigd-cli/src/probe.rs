//! Config-backed discovery probe.
//!
//! The engine treats discovery as an external collaborator; in the CLI that
//! collaborator is the operator's `[[peripherals]]` config section. An entry
//! whose device node is absent is reported as unavailable and skipped, so a
//! rig with one unplugged sensor still comes up.

use std::path::Path;

use tracing::warn;

use rigd_config::PeripheralEntry;
use rigd_core::manager::{DiscoveryError, DiscoveryProbe};
use rigd_core::peripheral::{PeripheralDescriptor, PeripheralKind};
use rigd_core::BoxFuture;

/// Maps `[[peripherals]]` entries to descriptors, filtered by device presence.
pub struct ConfigProbe {
    entries: Vec<PeripheralEntry>,
}

impl ConfigProbe {
    /// Probe over the configured peripheral list.
    pub fn new(entries: Vec<PeripheralEntry>) -> Self {
        Self { entries }
    }
}

impl DiscoveryProbe for ConfigProbe {
    fn probe(&self) -> BoxFuture<'_, Result<Vec<PeripheralDescriptor>, DiscoveryError>> {
        Box::pin(async move {
            let mut found = Vec::new();
            for entry in &self.entries {
                // Config validation rejects unknown kinds up front; this only
                // fires when the probe is fed an unvalidated config.
                let Some(kind) = PeripheralKind::from_config(&entry.kind) else {
                    warn!(name = %entry.name, kind = %entry.kind, "unknown peripheral kind, skipping");
                    continue;
                };
                if !Path::new(&entry.address).exists() {
                    warn!(
                        name = %entry.name,
                        address = %entry.address,
                        "device node absent, skipping"
                    );
                    continue;
                }
                found.push(PeripheralDescriptor {
                    name: entry.name.clone(),
                    kind,
                    address: entry.address.clone(),
                    capabilities: entry.capabilities.clone(),
                });
            }
            Ok(found)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn entry(name: &str, kind: &str, address: &str) -> PeripheralEntry {
        PeripheralEntry {
            name: name.to_string(),
            kind: kind.to_string(),
            address: address.to_string(),
            capabilities: vec![],
        }
    }

    #[tokio::test]
    async fn test_absent_device_nodes_are_skipped() {
        let dir = tempfile::TempDir::new().unwrap();
        let present = dir.path().join("ttyUSB0");
        tokio::fs::write(&present, "").await.unwrap();

        let probe = ConfigProbe::new(vec![
            entry("pico", "microcontroller", present.to_str().unwrap()),
            entry("ghost", "radio", "/nonexistent/ttyUSB9"),
        ]);
        let found = probe.probe().await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "pico");
        assert_eq!(found[0].kind, PeripheralKind::Microcontroller);
    }

    #[tokio::test]
    async fn test_unknown_kind_is_skipped() {
        let dir = tempfile::TempDir::new().unwrap();
        let present = dir.path().join("ttyUSB0");
        tokio::fs::write(&present, "").await.unwrap();

        let probe = ConfigProbe::new(vec![entry("odd", "toaster", present.to_str().unwrap())]);
        assert!(probe.probe().await.unwrap().is_empty());
    }
}
