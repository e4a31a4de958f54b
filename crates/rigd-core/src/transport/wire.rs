//! Line-oriented wire protocol spoken by microcontroller-class peripherals.
//!
//! Newline-terminated ASCII, self-describing replies:
//!
//! ```text
//! -> discover
//! <- PERIPHERAL:<name>:<pin>:<type>      (zero or more)
//! <- DISCOVER_DONE                        (optional terminator)
//! -> read:<name>
//! <- SENSOR_VALUE:<name>:<value>  |  BUTTON_STATE:<name>:<0|1>
//! -> write:<name>:<value>
//! <- WRITE_OK:<name>:<value>
//! <- ERROR:<reason>                       (any invalid request)
//! ```
//!
//! Firmwares that omit `DISCOVER_DONE` terminate enumeration via the read
//! timeout instead. Anything that does not parse is a
//! [`TransportError::Protocol`]; the daemon counts it as one failed
//! operation and moves on.

use super::TransportError;

/// One parsed reply line from a peripheral.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceReply {
    /// `PERIPHERAL:<name>:<pin>:<type>` — one discovered pin.
    Peripheral {
        name: String,
        pin: u32,
        kind: String,
    },
    /// `DISCOVER_DONE` — end of discovery enumeration.
    DiscoverDone,
    /// `SENSOR_VALUE:<name>:<value>`.
    SensorValue { name: String, value: f64 },
    /// `BUTTON_STATE:<name>:<0|1>`.
    ButtonState { name: String, pressed: bool },
    /// `WRITE_OK:<name>:<value>`.
    WriteOk { name: String, value: String },
    /// `ERROR:<reason>` — the device rejected the request.
    Error { reason: String },
}

/// The `discover` request line.
pub fn discover_request() -> &'static str {
    "discover"
}

/// The `read:<name>` request line.
pub fn read_request(name: &str) -> String {
    format!("read:{name}")
}

/// The `write:<name>:<value>` request line.
pub fn write_request(name: &str, value: &str) -> String {
    format!("write:{name}:{value}")
}

/// Parse one reply line.
pub fn parse_reply(line: &str) -> Result<DeviceReply, TransportError> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line == "DISCOVER_DONE" {
        return Ok(DeviceReply::DiscoverDone);
    }

    let (tag, rest) = line
        .split_once(':')
        .ok_or_else(|| violation(line, "missing ':' separator"))?;

    match tag {
        "PERIPHERAL" => {
            let mut parts = rest.splitn(3, ':');
            let name = nonempty(parts.next(), line, "name")?;
            let pin = parts
                .next()
                .and_then(|p| p.parse::<u32>().ok())
                .ok_or_else(|| violation(line, "bad pin number"))?;
            let kind = nonempty(parts.next(), line, "type")?;
            Ok(DeviceReply::Peripheral { name, pin, kind })
        }
        "SENSOR_VALUE" => {
            let (name, value) = rest
                .split_once(':')
                .ok_or_else(|| violation(line, "missing value"))?;
            if name.is_empty() {
                return Err(violation(line, "empty name"));
            }
            let value = value
                .parse::<f64>()
                .map_err(|_| violation(line, "non-numeric value"))?;
            if !value.is_finite() {
                return Err(violation(line, "non-finite value"));
            }
            Ok(DeviceReply::SensorValue {
                name: name.to_string(),
                value,
            })
        }
        "BUTTON_STATE" => {
            let (name, value) = rest
                .split_once(':')
                .ok_or_else(|| violation(line, "missing value"))?;
            if name.is_empty() {
                return Err(violation(line, "empty name"));
            }
            let pressed = match value {
                "0" => false,
                "1" => true,
                _ => return Err(violation(line, "button value must be 0 or 1")),
            };
            Ok(DeviceReply::ButtonState {
                name: name.to_string(),
                pressed,
            })
        }
        "WRITE_OK" => {
            let (name, value) = rest
                .split_once(':')
                .ok_or_else(|| violation(line, "missing value"))?;
            if name.is_empty() {
                return Err(violation(line, "empty name"));
            }
            Ok(DeviceReply::WriteOk {
                name: name.to_string(),
                value: value.to_string(),
            })
        }
        "ERROR" => Ok(DeviceReply::Error {
            reason: rest.to_string(),
        }),
        _ => Err(violation(line, "unknown reply tag")),
    }
}

fn violation(line: &str, why: &str) -> TransportError {
    TransportError::Protocol(format!("{why} in {line:?}"))
}

fn nonempty(part: Option<&str>, line: &str, what: &str) -> Result<String, TransportError> {
    match part {
        Some(s) if !s.is_empty() => Ok(s.to_string()),
        _ => Err(violation(line, &format!("missing {what}"))),
    }
}
