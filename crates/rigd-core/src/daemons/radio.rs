//! Driver for the RF/radio instrument.
//!
//! The instrument speaks a simple request/reply envelope over its serial
//! console:
//!
//! ```text
//! -> info                     <- one identification line
//! -> rssi                     <- current RSSI in dBm, e.g. "-71.5"
//! -> scan:<start_hz>:<end_hz> <- HIT:<freq_hz>:<rssi> (zero or more)
//!                             <- SCAN_DONE:<hit_count>
//! ```
//!
//! A frequency scan runs for multiple seconds; the runner acknowledges the
//! command promptly and the submitter follows progress through the tracker,
//! so nothing upstream blocks while the sweep runs.

use std::time::Duration;

use serde_json::{json, Value};
use tracing::debug;

use crate::daemon::{ActionError, ActionOutcome, PeripheralDriver};
use crate::peripheral::{PeripheralDescriptor, Reading, CAP_SCAN};
use crate::transport::{TransportError, TransportPermit};
use crate::BoxFuture;

/// A sweep can sit on one band for a while before the next hit; scan replies
/// get a looser read timeout than ordinary request/reply traffic.
const SCAN_REPLY_TIMEOUT: Duration = Duration::from_secs(10);

/// RF instrument driver.
pub struct RadioDriver {
    descriptor: PeripheralDescriptor,
    model: Option<String>,
    announced: bool,
    scan_count: u64,
}

impl RadioDriver {
    /// Create a driver for one descriptor.
    pub fn new(descriptor: PeripheralDescriptor) -> Self {
        Self {
            descriptor,
            model: None,
            announced: false,
            scan_count: 0,
        }
    }

    async fn run_scan(
        &mut self,
        permit: &mut TransportPermit,
        start_hz: u64,
        end_hz: u64,
    ) -> Result<ActionOutcome, ActionError> {
        let source = self.descriptor.name.clone();
        permit
            .send_line(&format!("scan:{start_hz}:{end_hz}"))
            .await?;

        let mut hits: Vec<Value> = Vec::new();
        loop {
            let line = permit.recv_line_within(SCAN_REPLY_TIMEOUT).await?;
            if let Some(rest) = line.strip_prefix("HIT:") {
                let (freq, rssi) = rest.split_once(':').ok_or_else(|| {
                    TransportError::Protocol(format!("malformed hit line {line:?}"))
                })?;
                let freq: u64 = freq.parse().map_err(|_| {
                    TransportError::Protocol(format!("bad frequency in {line:?}"))
                })?;
                let rssi: f64 = rssi
                    .parse()
                    .map_err(|_| TransportError::Protocol(format!("bad rssi in {line:?}")))?;
                hits.push(json!({ "freq_hz": freq, "rssi": rssi }));
            } else if let Some(count) = line.strip_prefix("SCAN_DONE:") {
                let reported: usize = count.parse().map_err(|_| {
                    TransportError::Protocol(format!("bad hit count in {line:?}"))
                })?;
                if reported != hits.len() {
                    debug!(
                        daemon = %source,
                        reported,
                        seen = hits.len(),
                        "scan hit count mismatch"
                    );
                }
                break;
            } else {
                return Err(
                    TransportError::Protocol(format!("unexpected scan line {line:?}")).into(),
                );
            }
        }

        self.scan_count += 1;
        let summary = json!({
            "start_hz": start_hz,
            "end_hz": end_hz,
            "hits": hits,
        });
        Ok(ActionOutcome {
            result: summary.clone(),
            readings: vec![
                Reading::new(
                    format!("{source}.scan_count"),
                    json!(self.scan_count),
                    &source,
                ),
                Reading::new(format!("{source}.last_scan"), summary, &source),
            ],
        })
    }
}

impl PeripheralDriver for RadioDriver {
    fn descriptor(&self) -> &PeripheralDescriptor {
        &self.descriptor
    }

    fn connect<'a>(
        &'a mut self,
        permit: &'a mut TransportPermit,
    ) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move {
            let line = permit.request("info").await?;
            if line.trim().is_empty() {
                return Err(TransportError::Protocol("empty info reply".into()));
            }
            self.model = Some(line.trim().to_string());
            self.announced = false;
            Ok(())
        })
    }

    fn poll<'a>(
        &'a mut self,
        permit: &'a mut TransportPermit,
    ) -> BoxFuture<'a, Result<Vec<Reading>, TransportError>> {
        Box::pin(async move {
            let source = self.descriptor.name.clone();
            let mut readings = Vec::new();
            if !self.announced {
                if let Some(model) = &self.model {
                    readings.push(Reading::new(
                        format!("{source}.model"),
                        json!(model),
                        &source,
                    ));
                }
                self.announced = true;
            }
            let line = permit.request("rssi").await?;
            let rssi: f64 = line
                .trim()
                .parse()
                .map_err(|_| TransportError::Protocol(format!("bad rssi reply {line:?}")))?;
            readings.push(Reading::new(format!("{source}.rssi"), json!(rssi), &source));
            Ok(readings)
        })
    }

    fn perform<'a>(
        &'a mut self,
        permit: &'a mut TransportPermit,
        action: &'a str,
        params: &'a Value,
    ) -> BoxFuture<'a, Result<ActionOutcome, ActionError>> {
        Box::pin(async move {
            match action {
                "scan" => {
                    if !self.descriptor.has_capability(CAP_SCAN) {
                        return Err(ActionError::Unsupported("scan".into()));
                    }
                    let start_hz = params["start_hz"].as_u64().ok_or_else(|| {
                        ActionError::InvalidParams("missing start_hz".into())
                    })?;
                    let end_hz = params["end_hz"]
                        .as_u64()
                        .ok_or_else(|| ActionError::InvalidParams("missing end_hz".into()))?;
                    if end_hz <= start_hz {
                        return Err(ActionError::InvalidParams(
                            "end_hz must be greater than start_hz".into(),
                        ));
                    }
                    self.run_scan(permit, start_hz, end_hz).await
                }
                other => Err(ActionError::Unsupported(other.to_string())),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemons::testing::permit_over;
    use crate::peripheral::PeripheralKind;
    use pretty_assertions::assert_eq;

    fn driver(capabilities: &[&str]) -> RadioDriver {
        RadioDriver::new(PeripheralDescriptor {
            name: "flipper".into(),
            kind: PeripheralKind::Radio,
            address: "/dev/ttyUSB0".into(),
            capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
        })
    }

    #[tokio::test]
    async fn test_connect_then_first_poll_announces_model() {
        let mut driver = driver(&[]);
        let (mut permit, _) = permit_over(&["radio-mk2", "-71.5", "-70.0"]).await;
        driver.connect(&mut permit).await.unwrap();

        let readings = driver.poll(&mut permit).await.unwrap();
        let paths: Vec<&str> = readings.iter().map(|r| r.path.as_str()).collect();
        assert_eq!(paths, ["flipper.model", "flipper.rssi"]);
        assert_eq!(readings[1].value, json!(-71.5));

        // Announced once only.
        let readings = driver.poll(&mut permit).await.unwrap();
        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].path, "flipper.rssi");
    }

    #[tokio::test]
    async fn test_scan_collects_hits() {
        let mut driver = driver(&[CAP_SCAN]);
        let (mut permit, sent) = permit_over(&[
            "HIT:315000000:-42.0",
            "HIT:318500000:-60.5",
            "SCAN_DONE:2",
        ])
        .await;

        let outcome = driver
            .perform(
                &mut permit,
                "scan",
                &json!({ "start_hz": 300_000_000u64, "end_hz": 348_000_000u64 }),
            )
            .await
            .unwrap();
        assert_eq!(
            sent.lock().unwrap().as_slice(),
            ["scan:300000000:348000000"]
        );
        assert_eq!(outcome.result["hits"][0]["freq_hz"], json!(315_000_000u64));
        let paths: Vec<&str> = outcome.readings.iter().map(|r| r.path.as_str()).collect();
        assert_eq!(paths, ["flipper.scan_count", "flipper.last_scan"]);
        assert_eq!(outcome.readings[0].value, json!(1));
    }

    #[tokio::test]
    async fn test_scan_hit_count_mismatch_is_tolerated() {
        let mut driver = driver(&[CAP_SCAN]);
        let (mut permit, _) = permit_over(&["HIT:315000000:-42.0", "SCAN_DONE:3"]).await;

        let outcome = driver
            .perform(
                &mut permit,
                "scan",
                &json!({ "start_hz": 1_000u64, "end_hz": 2_000u64 }),
            )
            .await
            .unwrap();
        assert_eq!(outcome.result["hits"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_scan_requires_capability() {
        let mut driver = driver(&[]);
        let (mut permit, _) = permit_over(&[]).await;
        let err = driver
            .perform(
                &mut permit,
                "scan",
                &json!({ "start_hz": 1u64, "end_hz": 2u64 }),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ActionError::Unsupported(_)));
    }

    #[tokio::test]
    async fn test_scan_validates_range() {
        let mut driver = driver(&[CAP_SCAN]);
        let (mut permit, _) = permit_over(&[]).await;
        let err = driver
            .perform(
                &mut permit,
                "scan",
                &json!({ "start_hz": 2_000u64, "end_hz": 1_000u64 }),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ActionError::InvalidParams(_)));
    }
}
