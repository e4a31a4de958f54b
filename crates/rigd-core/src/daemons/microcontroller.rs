//! Driver for serial-attached microcontrollers speaking the line protocol
//! (see [`crate::transport::wire`]).
//!
//! On connect the firmware is asked to enumerate its pins (`discover`);
//! every poll reads the sensor and button pins, and the `write` action
//! drives actuator pins. Firmware-reported `ERROR:` replies on a single pin
//! are skipped with a warning; malformed lines fail the whole operation and
//! count against the breaker.

use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::daemon::{ActionError, ActionOutcome, PeripheralDriver};
use crate::peripheral::{PeripheralDescriptor, Reading};
use crate::transport::wire::{self, DeviceReply};
use crate::transport::{TransportError, TransportPermit};
use crate::BoxFuture;

/// One pin the firmware reported during discovery.
#[derive(Debug, Clone)]
struct DevicePin {
    name: String,
    pin: u32,
    kind: String,
}

/// Microcontroller-class driver.
pub struct MicrocontrollerDriver {
    descriptor: PeripheralDescriptor,
    pins: Vec<DevicePin>,
    announced: bool,
}

impl MicrocontrollerDriver {
    /// Create a driver for one descriptor.
    pub fn new(descriptor: PeripheralDescriptor) -> Self {
        Self {
            descriptor,
            pins: Vec::new(),
            announced: false,
        }
    }

    async fn discover_pins(
        &mut self,
        permit: &mut TransportPermit,
    ) -> Result<(), TransportError> {
        permit.send_line(wire::discover_request()).await?;
        let mut pins = Vec::new();
        loop {
            let line = match permit.recv_line().await {
                Ok(line) => line,
                // Bare firmwares omit DISCOVER_DONE; the read timeout ends
                // enumeration.
                Err(TransportError::Failure(err))
                    if err.kind() == std::io::ErrorKind::TimedOut =>
                {
                    break;
                }
                Err(err) => return Err(err),
            };
            match wire::parse_reply(&line)? {
                DeviceReply::Peripheral { name, pin, kind } => {
                    pins.push(DevicePin { name, pin, kind });
                }
                DeviceReply::DiscoverDone => break,
                DeviceReply::Error { reason } => {
                    return Err(TransportError::Protocol(format!(
                        "device rejected discover: {reason}"
                    )));
                }
                other => {
                    return Err(TransportError::Protocol(format!(
                        "unexpected reply during discover: {other:?}"
                    )));
                }
            }
        }
        debug!(daemon = %self.descriptor.name, pins = pins.len(), "discovered pins");
        self.pins = pins;
        self.announced = false;
        Ok(())
    }

    fn value_as_json(raw: &str) -> Value {
        if let Ok(n) = raw.parse::<i64>() {
            json!(n)
        } else if let Ok(f) = raw.parse::<f64>() {
            json!(f)
        } else {
            json!(raw)
        }
    }
}

impl PeripheralDriver for MicrocontrollerDriver {
    fn descriptor(&self) -> &PeripheralDescriptor {
        &self.descriptor
    }

    fn connect<'a>(
        &'a mut self,
        permit: &'a mut TransportPermit,
    ) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(self.discover_pins(permit))
    }

    fn poll<'a>(
        &'a mut self,
        permit: &'a mut TransportPermit,
    ) -> BoxFuture<'a, Result<Vec<Reading>, TransportError>> {
        Box::pin(async move {
            let source = self.descriptor.name.clone();
            let mut readings = Vec::new();

            if !self.announced {
                let listing: Vec<Value> = self
                    .pins
                    .iter()
                    .map(|p| json!({ "name": p.name, "pin": p.pin, "type": p.kind }))
                    .collect();
                readings.push(Reading::new(
                    format!("{source}.peripherals"),
                    json!(listing),
                    &source,
                ));
                self.announced = true;
            }

            for pin in self.pins.iter().filter(|p| p.kind != "actuator") {
                let reply = permit.request(&wire::read_request(&pin.name)).await?;
                match wire::parse_reply(&reply)? {
                    DeviceReply::SensorValue { name, value } => {
                        readings.push(Reading::new(format!("{name}.value"), json!(value), &source));
                    }
                    DeviceReply::ButtonState { name, pressed } => {
                        readings.push(Reading::new(
                            format!("{name}.value"),
                            json!(pressed),
                            &source,
                        ));
                    }
                    DeviceReply::Error { reason } => {
                        warn!(daemon = %source, pin = %pin.name, reason, "read rejected");
                    }
                    other => {
                        return Err(TransportError::Protocol(format!(
                            "unexpected reply to read: {other:?}"
                        )));
                    }
                }
            }
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
            let source = self.descriptor.name.clone();
            match action {
                "write" => {
                    let target = params["target"]
                        .as_str()
                        .ok_or_else(|| ActionError::InvalidParams("missing target".into()))?;
                    let value = match &params["value"] {
                        Value::String(s) => s.clone(),
                        Value::Null => {
                            return Err(ActionError::InvalidParams("missing value".into()))
                        }
                        other => other.to_string(),
                    };

                    let reply = permit.request(&wire::write_request(target, &value)).await?;
                    match wire::parse_reply(&reply).map_err(ActionError::Transport)? {
                        DeviceReply::WriteOk { name, value } => {
                            let written = Self::value_as_json(&value);
                            Ok(ActionOutcome {
                                result: json!({ "name": name, "value": written }),
                                readings: vec![Reading::new(
                                    format!("{name}.value"),
                                    written,
                                    &source,
                                )],
                            })
                        }
                        DeviceReply::Error { reason } => Err(ActionError::InvalidParams(format!(
                            "device rejected write: {reason}"
                        ))),
                        other => Err(ActionError::Transport(TransportError::Protocol(format!(
                            "unexpected reply to write: {other:?}"
                        )))),
                    }
                }
                "read" => {
                    let target = params["target"]
                        .as_str()
                        .ok_or_else(|| ActionError::InvalidParams("missing target".into()))?;
                    let reply = permit.request(&wire::read_request(target)).await?;
                    match wire::parse_reply(&reply).map_err(ActionError::Transport)? {
                        DeviceReply::SensorValue { name, value } => Ok(ActionOutcome {
                            result: json!(value),
                            readings: vec![Reading::new(
                                format!("{name}.value"),
                                json!(value),
                                &source,
                            )],
                        }),
                        DeviceReply::ButtonState { name, pressed } => Ok(ActionOutcome {
                            result: json!(pressed),
                            readings: vec![Reading::new(
                                format!("{name}.value"),
                                json!(pressed),
                                &source,
                            )],
                        }),
                        DeviceReply::Error { reason } => Err(ActionError::InvalidParams(format!(
                            "device rejected read: {reason}"
                        ))),
                        other => Err(ActionError::Transport(TransportError::Protocol(format!(
                            "unexpected reply to read: {other:?}"
                        )))),
                    }
                }
                other => Err(ActionError::Unsupported(other.to_string())),
            }
        })
    }
}
