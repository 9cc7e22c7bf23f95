//! Structured object telemetry.
//!
//! Same key set as the text format. PID gains arrive either as
//! `"pid": [{"kp":..,"ki":..,"kd":..}, ...]` or as flattened `pidN_kp` keys;
//! the array wins when both are present. Every field is checked on its own
//! and skipped if it is missing or not an integer that fits.
//!
//! Unparseable bytes are a framing fault. Valid JSON whose top level is not
//! an object is a field fault: the datagram was intact but carried no keys.

use super::{CodecError, WireCodec, WireFormat};
use crate::telemetry::{TelemetryUpdate, ACTUATOR_COUNT};
use serde::Serialize;
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

fn int_field<T: TryFrom<i64>>(object: &Map<String, Value>, key: &str) -> Option<T> {
    object
        .get(key)
        .and_then(Value::as_i64)
        .and_then(|v| T::try_from(v).ok())
}

#[derive(Serialize)]
struct WirePid {
    #[serde(skip_serializing_if = "Option::is_none")]
    kp: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ki: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    kd: Option<u8>,
}

#[derive(Serialize)]
struct WireObject {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    roll: Option<i16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pitch: Option<i16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    yaw: Option<i16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    x: Option<i16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    y: Option<i16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    z: Option<i16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    batt: Option<u8>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pid: Vec<WirePid>,
}

impl From<&TelemetryUpdate> for WireObject {
    fn from(update: &TelemetryUpdate) -> Self {
        // Trailing actuators with nothing to say are left off the array.
        let used = update
            .pid
            .iter()
            .rposition(|p| !p.is_empty())
            .map_or(0, |last| last + 1);

        Self {
            id: update.unit_id,
            roll: update.roll,
            pitch: update.pitch,
            yaw: update.yaw,
            x: update.x,
            y: update.y,
            z: update.z,
            batt: update.battery,
            pid: update.pid[..used]
                .iter()
                .map(|p| WirePid {
                    kp: p.kp,
                    ki: p.ki,
                    kd: p.kd,
                })
                .collect(),
        }
    }
}

impl WireCodec for JsonCodec {
    fn format(&self) -> WireFormat {
        WireFormat::Json
    }

    fn decode_into(&self, payload: &[u8], update: &mut TelemetryUpdate) -> Result<(), CodecError> {
        let value: Value = serde_json::from_slice(payload)
            .map_err(|e| CodecError::Malformed(format!("invalid JSON: {e}")))?;
        let object = match value {
            Value::Object(object) => object,
            Value::Array(_) => return Err(CodecError::NotAnObject("array")),
            Value::String(_) => return Err(CodecError::NotAnObject("string")),
            Value::Number(_) => return Err(CodecError::NotAnObject("number")),
            Value::Bool(_) => return Err(CodecError::NotAnObject("bool")),
            Value::Null => return Err(CodecError::NotAnObject("null")),
        };

        macro_rules! take {
            ($field:expr, $key:literal) => {
                if let Some(v) = int_field(&object, $key) {
                    $field = Some(v);
                }
            };
        }
        take!(update.unit_id, "id");
        take!(update.roll, "roll");
        take!(update.pitch, "pitch");
        take!(update.yaw, "yaw");
        take!(update.x, "x");
        take!(update.y, "y");
        take!(update.z, "z");
        take!(update.battery, "batt");

        if let Some(Value::Array(entries)) = object.get("pid") {
            for (pid, entry) in update.pid.iter_mut().zip(entries.iter()) {
                let Value::Object(gains) = entry else {
                    continue;
                };
                if let Some(v) = int_field(gains, "kp") {
                    pid.kp = Some(v);
                }
                if let Some(v) = int_field(gains, "ki") {
                    pid.ki = Some(v);
                }
                if let Some(v) = int_field(gains, "kd") {
                    pid.kd = Some(v);
                }
            }
        } else {
            for actuator in 0..ACTUATOR_COUNT {
                let pid = &mut update.pid[actuator];
                if let Some(v) = int_field(&object, &format!("pid{actuator}_kp")) {
                    pid.kp = Some(v);
                }
                if let Some(v) = int_field(&object, &format!("pid{actuator}_ki")) {
                    pid.ki = Some(v);
                }
                if let Some(v) = int_field(&object, &format!("pid{actuator}_kd")) {
                    pid.kd = Some(v);
                }
            }
        }

        Ok(())
    }

    fn encode(&self, update: &TelemetryUpdate) -> Result<Vec<Vec<u8>>, CodecError> {
        if update.is_empty() {
            return Ok(Vec::new());
        }
        let bytes = serde_json::to_vec(&WireObject::from(update))
            .map_err(|e| CodecError::Malformed(e.to_string()))?;
        Ok(vec![bytes])
    }
}
