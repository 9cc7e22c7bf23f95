//! Fixed-header binary telemetry frame.
//!
//! ```text
//! [0xEE][0xEE][STATUS][LEN][PAYLOAD ... LEN bytes][CHECKSUM][0xFF]
//! ```
//!
//! CHECKSUM is `(STATUS + LEN + sum(PAYLOAD)) mod 256`, compared byte-exact
//! unless [`ChecksumMode::AcceptComplement`] is configured. Multi-byte fields
//! are big-endian; position uses the 16-bit signed variant.

use super::{CodecError, WireCodec, WireFormat};
use crate::telemetry::{Attitude, PidGains, Position, TelemetryUpdate, ACTUATOR_COUNT};
use heapless::Vec as BoundedVec;
use serde::{Deserialize, Serialize};
use static_assertions::const_assert_eq;

pub const FRAME_HEADER: [u8; 2] = [0xEE, 0xEE];
pub const FRAME_TRAILER: u8 = 0xFF;
/// Header, STATUS, LEN, CHECKSUM and trailer.
pub const FRAME_OVERHEAD: usize = 6;
pub const MAX_PAYLOAD_LEN: usize = u8::MAX as usize;
pub const MAX_FRAME_LEN: usize = FRAME_OVERHEAD + MAX_PAYLOAD_LEN;

const_assert_eq!(FRAME_OVERHEAD, FRAME_HEADER.len() + 4);

pub const STATUS_ATTITUDE: u8 = 0x00;
pub const STATUS_POSITION: u8 = 0x01;
pub const STATUS_BATTERY: u8 = 0x02;
pub const STATUS_UNIT_ID: u8 = 0x03;
/// Actuators 1-4 occupy 0x04..=0x07.
pub const STATUS_PID_BASE: u8 = 0x04;

const TRIPLE_I16_LEN: usize = 6;
const PID_LEN: usize = 3;

pub type FramePayload = BoundedVec<u8, MAX_PAYLOAD_LEN>;

pub fn checksum(status: u8, payload: &[u8]) -> u8 {
    payload
        .iter()
        .fold(status.wrapping_add(payload.len() as u8), |acc, b| acc.wrapping_add(*b))
}

/// How a carried checksum byte is compared against the computed sum.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChecksumMode {
    /// Byte-exact against the additive sum.
    #[default]
    Strict,
    /// Also accepts the two's complement of the sum, for units whose frame
    /// body sums to zero. Weaker: a flipped top bit of 0x40 or 0xC0 slips
    /// through.
    AcceptComplement,
}

impl ChecksumMode {
    pub fn matches(self, computed: u8, carried: u8) -> bool {
        match self {
            ChecksumMode::Strict => carried == computed,
            ChecksumMode::AcceptComplement => {
                carried == computed || carried == computed.wrapping_neg()
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub status: u8,
    pub payload: FramePayload,
}

impl Frame {
    pub fn new(status: u8, payload: &[u8]) -> Result<Self, CodecError> {
        let payload = FramePayload::from_slice(payload)
            .map_err(|_| CodecError::PayloadTooLarge(payload.len()))?;
        Ok(Self { status, payload })
    }

    pub fn checksum(&self) -> u8 {
        checksum(self.status, &self.payload)
    }

    pub fn encoded_len(&self) -> usize {
        FRAME_OVERHEAD + self.payload.len()
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.reserve(self.encoded_len());
        out.extend_from_slice(&FRAME_HEADER);
        out.push(self.status);
        out.push(self.payload.len() as u8);
        out.extend_from_slice(&self.payload);
        out.push(self.checksum());
        out.push(FRAME_TRAILER);
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        self.encode_into(&mut out);
        out
    }

    /// Validates header, length, checksum and trailer with a byte-exact
    /// checksum. Any failure rejects the whole datagram.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        Self::decode_with(bytes, ChecksumMode::Strict)
    }

    pub fn decode_with(bytes: &[u8], mode: ChecksumMode) -> Result<Self, CodecError> {
        if bytes.len() < 4 {
            return Err(CodecError::Truncated {
                needed: FRAME_OVERHEAD,
                available: bytes.len(),
            });
        }
        if bytes[..2] != FRAME_HEADER {
            return Err(CodecError::BadHeader([bytes[0], bytes[1]]));
        }

        let status = bytes[2];
        let len = usize::from(bytes[3]);
        let total = FRAME_OVERHEAD + len;
        if bytes.len() < total {
            return Err(CodecError::Truncated {
                needed: total,
                available: bytes.len(),
            });
        }

        let payload = &bytes[4..4 + len];
        let computed = checksum(status, payload);
        let carried = bytes[4 + len];
        if !mode.matches(computed, carried) {
            return Err(CodecError::ChecksumMismatch {
                expected: computed,
                actual: carried,
            });
        }

        let trailer = bytes[5 + len];
        if trailer != FRAME_TRAILER {
            return Err(CodecError::BadTrailer(trailer));
        }
        if bytes.len() > total {
            return Err(CodecError::TrailingBytes(bytes.len() - total));
        }

        Self::new(status, payload)
    }
}

/// Semantic content of one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Channel {
    Attitude(Attitude),
    Position(Position),
    Battery(u8),
    UnitId(u8),
    /// `actuator` is zero-based.
    Pid { actuator: usize, gains: PidGains },
    /// Well-framed but carries no field this bridge understands.
    Unknown(u8),
}

impl Channel {
    /// Payload length a status byte requires, `None` for unknown channels.
    pub fn expected_len(status: u8) -> Option<usize> {
        match status {
            STATUS_ATTITUDE | STATUS_POSITION => Some(TRIPLE_I16_LEN),
            STATUS_BATTERY | STATUS_UNIT_ID => Some(1),
            s if is_pid_status(s) => Some(PID_LEN),
            _ => None,
        }
    }

    pub fn from_frame(frame: &Frame) -> Result<Self, CodecError> {
        let p = &frame.payload;
        if let Some(expected) = Self::expected_len(frame.status) {
            if p.len() != expected {
                return Err(CodecError::LengthMismatch {
                    status: frame.status,
                    expected,
                    actual: p.len(),
                });
            }
        }

        let channel = match frame.status {
            STATUS_ATTITUDE => {
                let [roll, pitch, yaw] = read_triple(p);
                Channel::Attitude(Attitude { roll, pitch, yaw })
            }
            STATUS_POSITION => {
                let [x, y, z] = read_triple(p);
                Channel::Position(Position { x, y, z })
            }
            STATUS_BATTERY => Channel::Battery(p[0]),
            STATUS_UNIT_ID => Channel::UnitId(p[0]),
            s if is_pid_status(s) => Channel::Pid {
                actuator: usize::from(s - STATUS_PID_BASE),
                gains: PidGains {
                    kp: p[0],
                    ki: p[1],
                    kd: p[2],
                },
            },
            other => Channel::Unknown(other),
        };
        Ok(channel)
    }

    pub fn to_frame(&self) -> Result<Frame, CodecError> {
        match *self {
            Channel::Attitude(a) => Frame::new(STATUS_ATTITUDE, &write_triple([a.roll, a.pitch, a.yaw])),
            Channel::Position(p) => Frame::new(STATUS_POSITION, &write_triple([p.x, p.y, p.z])),
            Channel::Battery(level) => Frame::new(STATUS_BATTERY, &[level]),
            Channel::UnitId(id) => Frame::new(STATUS_UNIT_ID, &[id]),
            Channel::Pid { actuator, gains } if actuator < ACTUATOR_COUNT => Frame::new(
                STATUS_PID_BASE + actuator as u8,
                &[gains.kp, gains.ki, gains.kd],
            ),
            Channel::Pid { .. } => Err(CodecError::Malformed("PID actuator out of range".into())),
            Channel::Unknown(status) => Frame::new(status, &[]),
        }
    }

    pub fn apply_to(&self, update: &mut TelemetryUpdate) {
        match *self {
            Channel::Attitude(a) => *update = update.with_attitude(a),
            Channel::Position(p) => *update = update.with_position(p),
            Channel::Battery(level) => update.battery = Some(level),
            Channel::UnitId(id) => update.unit_id = Some(id),
            Channel::Pid { actuator, gains } => *update = update.with_pid(actuator, gains),
            Channel::Unknown(_) => {}
        }
    }

    /// Splits `update` into one channel per frame. Attitude, position and
    /// PID go out as whole triples, so a partially filled triple is refused.
    pub fn from_update(update: &TelemetryUpdate) -> Result<Vec<Channel>, CodecError> {
        let mut channels = Vec::new();

        if let Some(id) = update.unit_id {
            channels.push(Channel::UnitId(id));
        }
        match (update.attitude(), update.roll.or(update.pitch).or(update.yaw)) {
            (Some(a), _) => channels.push(Channel::Attitude(a)),
            (None, Some(_)) => return Err(CodecError::IncompleteChannel("attitude")),
            (None, None) => {}
        }
        match (update.position(), update.x.or(update.y).or(update.z)) {
            (Some(p), _) => channels.push(Channel::Position(p)),
            (None, Some(_)) => return Err(CodecError::IncompleteChannel("position")),
            (None, None) => {}
        }
        if let Some(level) = update.battery {
            channels.push(Channel::Battery(level));
        }
        for (actuator, pid) in update.pid.iter().enumerate() {
            if pid.is_empty() {
                continue;
            }
            let gains = pid.complete().ok_or(CodecError::IncompleteChannel("pid"))?;
            channels.push(Channel::Pid { actuator, gains });
        }

        Ok(channels)
    }
}

fn is_pid_status(status: u8) -> bool {
    (STATUS_PID_BASE..STATUS_PID_BASE + ACTUATOR_COUNT as u8).contains(&status)
}

fn read_triple(p: &[u8]) -> [i16; 3] {
    [
        i16::from_be_bytes([p[0], p[1]]),
        i16::from_be_bytes([p[2], p[3]]),
        i16::from_be_bytes([p[4], p[5]]),
    ]
}

fn write_triple(values: [i16; 3]) -> [u8; TRIPLE_I16_LEN] {
    let mut out = [0u8; TRIPLE_I16_LEN];
    for (chunk, value) in out.chunks_exact_mut(2).zip(values) {
        chunk.copy_from_slice(&value.to_be_bytes());
    }
    out
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BinaryCodec {
    checksum: ChecksumMode,
}

impl BinaryCodec {
    pub fn new(checksum: ChecksumMode) -> Self {
        Self { checksum }
    }

    pub fn checksum_mode(&self) -> ChecksumMode {
        self.checksum
    }

    pub fn decode_channel(&self, payload: &[u8]) -> Result<Channel, CodecError> {
        Channel::from_frame(&Frame::decode_with(payload, self.checksum)?)
    }
}

impl WireCodec for BinaryCodec {
    fn format(&self) -> WireFormat {
        WireFormat::Binary
    }

    fn splits_updates(&self) -> bool {
        true
    }

    fn decode_into(&self, payload: &[u8], update: &mut TelemetryUpdate) -> Result<(), CodecError> {
        self.decode_channel(payload)?.apply_to(update);
        Ok(())
    }

    fn encode(&self, update: &TelemetryUpdate) -> Result<Vec<Vec<u8>>, CodecError> {
        Channel::from_update(update)?
            .iter()
            .map(|channel| channel.to_frame().map(|frame| frame.encode()))
            .collect()
    }
}
