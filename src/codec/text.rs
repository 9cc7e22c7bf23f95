//! Comma-separated `key=value` telemetry, e.g. `id=1,x=100,y=200,batt=12`.

use super::{parse_pid_key, CodecError, WireCodec, WireFormat};
use crate::telemetry::TelemetryUpdate;
use std::fmt::Write as _;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Default)]
pub struct TextCodec;

fn parse_value<T: FromStr>(key: &str, value: &str) -> Result<T, CodecError> {
    value.parse().map_err(|_| CodecError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

impl WireCodec for TextCodec {
    fn format(&self) -> WireFormat {
        WireFormat::Text
    }

    /// Tokens are applied left to right; the first unparseable value stops
    /// decoding and earlier tokens stay applied. Unknown keys and tokens
    /// without `=` are skipped.
    fn decode_into(&self, payload: &[u8], update: &mut TelemetryUpdate) -> Result<(), CodecError> {
        let text = std::str::from_utf8(payload)
            .map_err(|e| CodecError::Malformed(format!("payload is not UTF-8: {e}")))?;
        let text = text.trim_end_matches(|c: char| c == '\0' || c.is_whitespace());

        for token in text.split(',') {
            let Some((key, value)) = token.split_once('=') else {
                continue;
            };
            let (key, value) = (key.trim(), value.trim());

            match key {
                "id" => update.unit_id = Some(parse_value(key, value)?),
                "roll" => update.roll = Some(parse_value(key, value)?),
                "pitch" => update.pitch = Some(parse_value(key, value)?),
                "yaw" => update.yaw = Some(parse_value(key, value)?),
                "x" => update.x = Some(parse_value(key, value)?),
                "y" => update.y = Some(parse_value(key, value)?),
                "z" => update.z = Some(parse_value(key, value)?),
                "batt" => update.battery = Some(parse_value(key, value)?),
                _ => {
                    if let Some((actuator, gain)) = parse_pid_key(key) {
                        let gain_value = Some(parse_value(key, value)?);
                        let pid = &mut update.pid[actuator];
                        match gain {
                            "kp" => pid.kp = gain_value,
                            "ki" => pid.ki = gain_value,
                            _ => pid.kd = gain_value,
                        }
                    }
                }
            }
        }

        Ok(())
    }

    fn encode(&self, update: &TelemetryUpdate) -> Result<Vec<Vec<u8>>, CodecError> {
        if update.is_empty() {
            return Ok(Vec::new());
        }

        let mut tokens: Vec<String> = Vec::with_capacity(update.field_count());
        let mut push = |key: &str, value: Option<i64>| {
            if let Some(v) = value {
                tokens.push(format!("{key}={v}"));
            }
        };
        push("id", update.unit_id.map(i64::from));
        push("roll", update.roll.map(i64::from));
        push("pitch", update.pitch.map(i64::from));
        push("yaw", update.yaw.map(i64::from));
        push("x", update.x.map(i64::from));
        push("y", update.y.map(i64::from));
        push("z", update.z.map(i64::from));
        push("batt", update.battery.map(i64::from));

        let mut key = String::with_capacity(8);
        for (actuator, pid) in update.pid.iter().enumerate() {
            for (gain, value) in [("kp", pid.kp), ("ki", pid.ki), ("kd", pid.kd)] {
                key.clear();
                let _ = write!(key, "pid{actuator}_{gain}");
                push(&key, value.map(i64::from));
            }
        }

        Ok(vec![tokens.join(",").into_bytes()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trailing_nul_and_newline_are_ignored() {
        let update = TextCodec.decode(b"batt=9\n\0\0").unwrap();
        assert_eq!(update.battery, Some(9));
    }

    #[test]
    fn test_out_of_range_value_is_a_field_fault() {
        let err = TextCodec.decode(b"batt=300").unwrap_err();
        assert!(!err.is_framing());
    }
}
