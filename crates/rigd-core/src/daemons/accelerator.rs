//! Driver for the USB-attached inference accelerator.
//!
//! The accelerator's bridge firmware exposes a line console:
//!
//! ```text
//! -> version         <- one firmware-version line
//! -> features        <- latest feature vector as one JSON line
//! -> infer:<input>   <- inference result as one JSON line
//! ```
//!
//! The engine does no inference itself; it only moves the device's feature
//! output into the world state (`<name>.latest_features`) for downstream
//! consumers.

use serde_json::{json, Value};

use crate::daemon::{ActionError, ActionOutcome, PeripheralDriver};
use crate::peripheral::{PeripheralDescriptor, Reading, CAP_INFER};
use crate::transport::{TransportError, TransportPermit};
use crate::BoxFuture;

/// Inference-accelerator driver.
pub struct AcceleratorDriver {
    descriptor: PeripheralDescriptor,
    firmware: Option<String>,
    announced: bool,
}

impl AcceleratorDriver {
    /// Create a driver for one descriptor.
    pub fn new(descriptor: PeripheralDescriptor) -> Self {
        Self {
            descriptor,
            firmware: None,
            announced: false,
        }
    }

    fn parse_json_line(line: &str) -> Result<Value, TransportError> {
        serde_json::from_str(line.trim())
            .map_err(|err| TransportError::Protocol(format!("bad JSON reply: {err}")))
    }
}

impl PeripheralDriver for AcceleratorDriver {
    fn descriptor(&self) -> &PeripheralDescriptor {
        &self.descriptor
    }

    fn connect<'a>(
        &'a mut self,
        permit: &'a mut TransportPermit,
    ) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move {
            let line = permit.request("version").await?;
            if line.trim().is_empty() {
                return Err(TransportError::Protocol("empty version reply".into()));
            }
            self.firmware = Some(line.trim().to_string());
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
                if let Some(firmware) = &self.firmware {
                    readings.push(Reading::new(
                        format!("{source}.firmware"),
                        json!(firmware),
                        &source,
                    ));
                }
                self.announced = true;
            }
            let line = permit.request("features").await?;
            let features = Self::parse_json_line(&line)?;
            readings.push(Reading::new(
                format!("{source}.latest_features"),
                features,
                &source,
            ));
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
                "infer" => {
                    if !self.descriptor.has_capability(CAP_INFER) {
                        return Err(ActionError::Unsupported("infer".into()));
                    }
                    let input = params["input"]
                        .as_str()
                        .ok_or_else(|| ActionError::InvalidParams("missing input".into()))?;
                    if input.contains('\n') {
                        return Err(ActionError::InvalidParams(
                            "input must be a single line".into(),
                        ));
                    }
                    let source = self.descriptor.name.clone();
                    let line = permit.request(&format!("infer:{input}")).await?;
                    let result = Self::parse_json_line(&line).map_err(ActionError::Transport)?;
                    Ok(ActionOutcome {
                        result: result.clone(),
                        readings: vec![Reading::new(
                            format!("{source}.last_inference"),
                            json!({ "input": input, "result": result }),
                            &source,
                        )],
                    })
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

    fn driver(capabilities: &[&str]) -> AcceleratorDriver {
        AcceleratorDriver::new(PeripheralDescriptor {
            name: "coral".into(),
            kind: PeripheralKind::Accelerator,
            address: "/dev/bus/usb/001/004".into(),
            capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
        })
    }

    #[tokio::test]
    async fn test_poll_parses_feature_vector() {
        let mut driver = driver(&[]);
        let (mut permit, _) = permit_over(&["v2.1", r#"{"person": 0.92, "edges": 0.4}"#]).await;
        driver.connect(&mut permit).await.unwrap();

        let readings = driver.poll(&mut permit).await.unwrap();
        let paths: Vec<&str> = readings.iter().map(|r| r.path.as_str()).collect();
        assert_eq!(paths, ["coral.firmware", "coral.latest_features"]);
        assert_eq!(readings[1].value["person"], json!(0.92));
    }

    #[tokio::test]
    async fn test_garbage_features_are_a_protocol_violation() {
        let mut driver = driver(&[]);
        let (mut permit, _) = permit_over(&["v2.1", "not json"]).await;
        driver.connect(&mut permit).await.unwrap();

        let err = driver.poll(&mut permit).await.unwrap_err();
        assert!(matches!(err, TransportError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_infer_action() {
        let mut driver = driver(&[CAP_INFER]);
        let (mut permit, sent) = permit_over(&[r#"{"label": "cat", "score": 0.97}"#]).await;

        let outcome = driver
            .perform(&mut permit, "infer", &json!({ "input": "frame-17" }))
            .await
            .unwrap();
        assert_eq!(sent.lock().unwrap().as_slice(), ["infer:frame-17"]);
        assert_eq!(outcome.result["label"], json!("cat"));
        assert_eq!(outcome.readings[0].path, "coral.last_inference");
    }

    #[tokio::test]
    async fn test_infer_requires_capability_and_single_line_input() {
        let mut no_cap = driver(&[]);
        let (mut permit, _) = permit_over(&[]).await;
        let err = no_cap
            .perform(&mut permit, "infer", &json!({ "input": "x" }))
            .await
            .unwrap_err();
        assert!(matches!(err, ActionError::Unsupported(_)));

        let mut with_cap = driver(&[CAP_INFER]);
        let err = with_cap
            .perform(&mut permit, "infer", &json!({ "input": "a\nb" }))
            .await
            .unwrap_err();
        assert!(matches!(err, ActionError::InvalidParams(_)));
    }
}
