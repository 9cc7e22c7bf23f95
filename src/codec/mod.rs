pub mod binary;
pub mod json;
pub mod text;

pub use binary::{BinaryCodec, Channel, ChecksumMode, Frame};
pub use json::JsonCodec;
pub use text::TextCodec;

use crate::telemetry::TelemetryUpdate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireFormat {
    Binary,
    Text,
    Json,
}

impl WireFormat {
    pub const ALL: [WireFormat; 3] = [WireFormat::Text, WireFormat::Json, WireFormat::Binary];

    pub fn as_str(self) -> &'static str {
        match self {
            WireFormat::Binary => "binary",
            WireFormat::Text => "text",
            WireFormat::Json => "json",
        }
    }

    /// Port each format's listener is deployed on.
    pub fn default_port(self) -> u16 {
        match self {
            WireFormat::Text => 8888,
            WireFormat::Json => 8889,
            WireFormat::Binary => 8890,
        }
    }
}

impl fmt::Display for WireFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WireFormat {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "binary" | "bin" => Ok(WireFormat::Binary),
            "text" | "string" => Ok(WireFormat::Text),
            "json" | "object" => Ok(WireFormat::Json),
            other => Err(CodecError::UnknownFormat(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("bad frame header {0:02X?}")]
    BadHeader([u8; 2]),
    #[error("bad frame trailer 0x{0:02X}")]
    BadTrailer(u8),
    #[error("checksum mismatch: computed 0x{expected:02X}, frame carries 0x{actual:02X}")]
    ChecksumMismatch { expected: u8, actual: u8 },
    #[error("channel 0x{status:02X} expects {expected} payload bytes, LEN says {actual}")]
    LengthMismatch { status: u8, expected: usize, actual: usize },
    #[error("frame truncated: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },
    #[error("{0} bytes after frame trailer")]
    TrailingBytes(usize),
    #[error("payload of {0} bytes exceeds frame limit")]
    PayloadTooLarge(usize),
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("payload is valid JSON but not an object: {0}")]
    NotAnObject(&'static str),
    #[error("invalid value {value:?} for key {key:?}")]
    InvalidValue { key: String, value: String },
    #[error("{0} channel needs all of its fields to encode")]
    IncompleteChannel(&'static str),
    #[error("unknown wire format {0:?}")]
    UnknownFormat(String),
}

impl CodecError {
    /// Framing faults reject the whole message; field faults keep the
    /// fields decoded before the bad one.
    pub fn is_framing(&self) -> bool {
        !matches!(
            self,
            CodecError::InvalidValue { .. } | CodecError::NotAnObject(_)
        )
    }
}

/// Decode/encode strategy a transport and store are built around.
pub trait WireCodec: fmt::Debug + Send + Sync {
    fn format(&self) -> WireFormat;

    /// Writes every field decoded from `payload` into `update`. On a field
    /// fault the fields written so far stay in `update`.
    fn decode_into(&self, payload: &[u8], update: &mut TelemetryUpdate) -> Result<(), CodecError>;

    /// Encodes `update` into the datagrams needed to carry it. An empty
    /// update yields no datagrams.
    fn encode(&self, update: &TelemetryUpdate) -> Result<Vec<Vec<u8>>, CodecError>;

    /// True when one update may span several datagrams, so a unit id seen
    /// in one datagram has to address the ones that follow it.
    fn splits_updates(&self) -> bool {
        false
    }

    fn decode(&self, payload: &[u8]) -> Result<TelemetryUpdate, CodecError> {
        let mut update = TelemetryUpdate::default();
        self.decode_into(payload, &mut update)?;
        Ok(update)
    }
}

/// Codec for `format` with a byte-exact binary checksum.
pub fn codec_for(format: WireFormat) -> Arc<dyn WireCodec> {
    codec_with_checksum(format, ChecksumMode::Strict)
}

/// Like [`codec_for`]; `checksum` only affects the binary format.
pub fn codec_with_checksum(format: WireFormat, checksum: ChecksumMode) -> Arc<dyn WireCodec> {
    match format {
        WireFormat::Binary => Arc::new(BinaryCodec::new(checksum)),
        WireFormat::Text => Arc::new(TextCodec),
        WireFormat::Json => Arc::new(JsonCodec),
    }
}

/// Parses `pid{n}_{kp|ki|kd}` into (actuator, gain name).
pub(crate) fn parse_pid_key(key: &str) -> Option<(usize, &str)> {
    let rest = key.strip_prefix("pid")?;
    let (index, gain) = rest.split_once('_')?;
    let actuator: usize = index.parse().ok()?;
    if actuator >= crate::telemetry::ACTUATOR_COUNT || index.len() != 1 {
        return None;
    }
    match gain {
        "kp" | "ki" | "kd" => Some((actuator, gain)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pid_key_parsing() {
        assert_eq!(parse_pid_key("pid0_kp"), Some((0, "kp")));
        assert_eq!(parse_pid_key("pid3_kd"), Some((3, "kd")));
        assert_eq!(parse_pid_key("pid4_kp"), None);
        assert_eq!(parse_pid_key("pid0_kx"), None);
        assert_eq!(parse_pid_key("pid_kp"), None);
        assert_eq!(parse_pid_key("pid+1_kp"), None);
    }

    #[test]
    fn test_format_parsing() {
        assert_eq!("binary".parse::<WireFormat>().unwrap(), WireFormat::Binary);
        assert_eq!("JSON".parse::<WireFormat>().unwrap(), WireFormat::Json);
        assert!("yaml".parse::<WireFormat>().is_err());
    }
}
