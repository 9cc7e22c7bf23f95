use crate::codec::{CodecError, WireCodec};
use crate::registry::{DeviceRegistry, Endpoint, RegistryError};
use crate::transport::RawMessage;
use serde::{Deserialize, Serialize};
use static_assertions::const_assert;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace};

/// Number of actuators carrying an independent PID gain triple.
pub const ACTUATOR_COUNT: usize = 4;

/// Identities 0..=254 are assignable; 0xFF is the "invalid / not found" sentinel.
pub const MAX_UNITS: usize = 255;

/// Records held per listener unless configured otherwise.
pub const DEFAULT_UNIT_CAPACITY: usize = 10;

const_assert!(MAX_UNITS <= u8::MAX as usize);
const_assert!(DEFAULT_UNIT_CAPACITY <= MAX_UNITS);

/// 8-bit handle assigned to a registered field unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnitId(pub u8);

impl UnitId {
    pub const INVALID: UnitId = UnitId(0xFF);
    pub const MAX: UnitId = UnitId(0xFE);

    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }

    pub fn index(self) -> usize {
        usize::from(self.0)
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "unit-{}", self.0)
        } else {
            write!(f, "unit-invalid")
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attitude {
    pub roll: i16,
    pub pitch: i16,
    pub yaw: i16,
}

/// Position on the 16-bit signed wire variant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub x: i16,
    pub y: i16,
    pub z: i16,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PidGains {
    pub kp: u8,
    pub ki: u8,
    pub kd: u8,
}

/// Mutable per-unit state, updated incrementally by decoded messages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    pub unit_id: u8,
    pub attitude: Attitude,
    pub position: Position,
    pub battery: u8,
    pub pid: [PidGains; ACTUATOR_COUNT],
}

impl TelemetryRecord {
    pub fn new(unit: UnitId) -> Self {
        Self {
            unit_id: unit.0,
            ..Self::default()
        }
    }

    /// Applies every field present in `update`, leaving the rest untouched.
    /// Returns the number of fields written.
    pub fn apply(&mut self, update: &TelemetryUpdate) -> usize {
        let mut written = 0;

        let mut set_u8 = |slot: &mut u8, value: Option<u8>| {
            if let Some(v) = value {
                *slot = v;
                written += 1;
            }
        };
        set_u8(&mut self.unit_id, update.unit_id);
        set_u8(&mut self.battery, update.battery);
        for (gains, pid) in self.pid.iter_mut().zip(update.pid.iter()) {
            set_u8(&mut gains.kp, pid.kp);
            set_u8(&mut gains.ki, pid.ki);
            set_u8(&mut gains.kd, pid.kd);
        }

        let mut set_i16 = |slot: &mut i16, value: Option<i16>| {
            if let Some(v) = value {
                *slot = v;
                written += 1;
            }
        };
        set_i16(&mut self.attitude.roll, update.roll);
        set_i16(&mut self.attitude.pitch, update.pitch);
        set_i16(&mut self.attitude.yaw, update.yaw);
        set_i16(&mut self.position.x, update.x);
        set_i16(&mut self.position.y, update.y);
        set_i16(&mut self.position.z, update.z);

        written
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PidUpdate {
    pub kp: Option<u8>,
    pub ki: Option<u8>,
    pub kd: Option<u8>,
}

impl PidUpdate {
    pub fn is_empty(&self) -> bool {
        self.kp.is_none() && self.ki.is_none() && self.kd.is_none()
    }

    pub fn complete(&self) -> Option<PidGains> {
        Some(PidGains {
            kp: self.kp?,
            ki: self.ki?,
            kd: self.kd?,
        })
    }
}

impl From<PidGains> for PidUpdate {
    fn from(gains: PidGains) -> Self {
        Self {
            kp: Some(gains.kp),
            ki: Some(gains.ki),
            kd: Some(gains.kd),
        }
    }
}

/// The subset of record fields carried by one wire message.
///
/// Decoders fill this in field by field; a message never replaces a whole
/// record, it only overwrites what it encodes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryUpdate {
    pub unit_id: Option<u8>,
    pub roll: Option<i16>,
    pub pitch: Option<i16>,
    pub yaw: Option<i16>,
    pub x: Option<i16>,
    pub y: Option<i16>,
    pub z: Option<i16>,
    pub battery: Option<u8>,
    pub pid: [PidUpdate; ACTUATOR_COUNT],
}

impl TelemetryUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_unit_id(mut self, unit_id: u8) -> Self {
        self.unit_id = Some(unit_id);
        self
    }

    pub fn with_attitude(mut self, attitude: Attitude) -> Self {
        self.roll = Some(attitude.roll);
        self.pitch = Some(attitude.pitch);
        self.yaw = Some(attitude.yaw);
        self
    }

    pub fn with_position(mut self, position: Position) -> Self {
        self.x = Some(position.x);
        self.y = Some(position.y);
        self.z = Some(position.z);
        self
    }

    pub fn with_battery(mut self, battery: u8) -> Self {
        self.battery = Some(battery);
        self
    }

    /// Out-of-range actuator indices are ignored.
    pub fn with_pid(mut self, actuator: usize, gains: PidGains) -> Self {
        if let Some(slot) = self.pid.get_mut(actuator) {
            *slot = gains.into();
        }
        self
    }

    pub fn attitude(&self) -> Option<Attitude> {
        Some(Attitude {
            roll: self.roll?,
            pitch: self.pitch?,
            yaw: self.yaw?,
        })
    }

    pub fn position(&self) -> Option<Position> {
        Some(Position {
            x: self.x?,
            y: self.y?,
            z: self.z?,
        })
    }

    pub fn field_count(&self) -> usize {
        let scalars = [
            self.unit_id.is_some(),
            self.roll.is_some(),
            self.pitch.is_some(),
            self.yaw.is_some(),
            self.x.is_some(),
            self.y.is_some(),
            self.z.is_some(),
            self.battery.is_some(),
        ];
        let pid = self
            .pid
            .iter()
            .flat_map(|p| [p.kp.is_some(), p.ki.is_some(), p.kd.is_some()]);
        scalars.into_iter().chain(pid).filter(|present| *present).count()
    }

    pub fn is_empty(&self) -> bool {
        self.field_count() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FaultKind {
    Framing,
    Field,
    Unaddressable,
    OutOfRange,
}

#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("decode failed: {0}")]
    Codec(#[from] CodecError),
    #[error("no unit id in message and source is unregistrable: {0}")]
    Unaddressable(#[from] RegistryError),
    #[error("{unit} outside store capacity {capacity}")]
    UnitOutOfRange { unit: UnitId, capacity: usize },
}

impl ApplyError {
    pub fn kind(&self) -> FaultKind {
        match self {
            ApplyError::Codec(e) if e.is_framing() => FaultKind::Framing,
            ApplyError::Codec(_) => FaultKind::Field,
            ApplyError::Unaddressable(_) => FaultKind::Unaddressable,
            ApplyError::UnitOutOfRange { .. } => FaultKind::OutOfRange,
        }
    }
}

/// One message that failed to apply cleanly during a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageFault {
    pub sequence: u64,
    pub source: Endpoint,
    pub kind: FaultKind,
    pub detail: String,
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyReport {
    pub processed: usize,
    pub applied: usize,
    /// Decoded cleanly but carried no fields (e.g. unknown binary channel).
    pub ignored: usize,
    pub faults: Vec<MessageFault>,
}

impl ApplyReport {
    pub fn is_clean(&self) -> bool {
        self.faults.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    pub messages_processed: u64,
    pub messages_applied: u64,
    pub framing_faults: u64,
    pub field_faults: u64,
    pub unaddressable: u64,
    pub out_of_range: u64,
}

/// Fixed-capacity set of per-unit records fed by one wire format.
#[derive(Debug)]
pub struct TelemetryStore {
    codec: Arc<dyn WireCodec>,
    records: Vec<TelemetryRecord>,
    /// Unit last named by each source, for codecs that split updates.
    bindings: HashMap<Endpoint, UnitId>,
    stats: StoreStats,
}

impl TelemetryStore {
    pub fn new(capacity: usize, codec: Arc<dyn WireCodec>) -> Self {
        let capacity = capacity.min(MAX_UNITS);
        let records = (0..capacity)
            .map(|slot| TelemetryRecord::new(UnitId(slot as u8)))
            .collect();

        Self {
            codec,
            records,
            bindings: HashMap::new(),
            stats: StoreStats::default(),
        }
    }

    pub fn codec(&self) -> &Arc<dyn WireCodec> {
        &self.codec
    }

    pub fn capacity(&self) -> usize {
        self.records.len()
    }

    /// Processes `messages` strictly in order. A failing message is reported
    /// and skipped; it never aborts the rest of the batch.
    pub fn apply<I>(&mut self, messages: I, registry: &mut DeviceRegistry) -> ApplyReport
    where
        I: IntoIterator<Item = RawMessage>,
    {
        let mut report = ApplyReport::default();

        for message in messages {
            report.processed += 1;
            match self.apply_message(&message, registry) {
                Ok(Some(_)) => report.applied += 1,
                Ok(None) => report.ignored += 1,
                Err(e) => {
                    debug!(
                        sequence = message.sequence,
                        source = %message.source,
                        "dropping message: {}",
                        e
                    );
                    report.faults.push(MessageFault {
                        sequence: message.sequence,
                        source: message.source.clone(),
                        kind: e.kind(),
                        detail: e.to_string(),
                        payload: message.payload.clone(),
                    });
                }
            }
        }

        trace!(
            processed = report.processed,
            applied = report.applied,
            faults = report.faults.len(),
            "batch applied"
        );
        report
    }

    /// Decodes one message and applies it to the addressed record.
    ///
    /// Addressing is explicit when the message carries a unit id, otherwise
    /// it falls back to the identity the registry holds for the source
    /// endpoint. For codecs that split one update over several datagrams an
    /// explicit id also binds the source, and later id-less datagrams from
    /// it go to the bound unit until another id arrives.
    ///
    /// Framing faults leave every record untouched; a field fault keeps
    /// whatever fields were decoded before it.
    pub fn apply_message(
        &mut self,
        message: &RawMessage,
        registry: &mut DeviceRegistry,
    ) -> Result<Option<UnitId>, ApplyError> {
        self.stats.messages_processed += 1;

        let mut update = TelemetryUpdate::default();
        let decoded = self.codec.decode_into(&message.payload, &mut update);
        if let Err(e) = &decoded {
            if e.is_framing() {
                self.stats.framing_faults += 1;
                return Err(ApplyError::Codec(e.clone()));
            }
        }

        let registered = registry.try_register(&message.source);

        if update.is_empty() {
            return match decoded {
                Ok(()) => Ok(None),
                Err(e) => {
                    self.stats.field_faults += 1;
                    Err(e.into())
                }
            };
        }

        let unit = match (update.unit_id, self.bindings.get(&message.source), registered) {
            (Some(explicit), _, _) => UnitId(explicit),
            (None, Some(bound), _) => *bound,
            (None, None, Ok(unit)) => unit,
            (None, None, Err(e)) => {
                self.stats.unaddressable += 1;
                return Err(e.into());
            }
        };

        let capacity = self.records.len();
        let Some(record) = self.records.get_mut(unit.index()) else {
            self.stats.out_of_range += 1;
            return Err(ApplyError::UnitOutOfRange { unit, capacity });
        };
        record.apply(&update);

        if update.unit_id.is_some() && self.codec.splits_updates() {
            self.bindings.insert(message.source.clone(), unit);
        }

        match decoded {
            Ok(()) => {
                self.stats.messages_applied += 1;
                Ok(Some(unit))
            }
            Err(e) => {
                self.stats.field_faults += 1;
                Err(e.into())
            }
        }
    }

    /// Unit an earlier explicit id bound `source` to, if any.
    pub fn bound_unit(&self, source: &Endpoint) -> Option<UnitId> {
        self.bindings.get(source).copied()
    }

    /// Drops the binding for `source`; its id-less datagrams go back to the
    /// registry identity.
    pub fn forget_source(&mut self, source: &Endpoint) -> Option<UnitId> {
        self.bindings.remove(source)
    }

    pub fn record(&self, unit: UnitId) -> Option<&TelemetryRecord> {
        self.records.get(unit.index())
    }

    /// Copy of the current state of `unit`, for publish-style sinks.
    pub fn snapshot(&self, unit: UnitId) -> Option<TelemetryRecord> {
        self.record(unit).copied()
    }

    pub fn records(&self) -> &[TelemetryRecord] {
        &self.records
    }

    pub fn stats(&self) -> &StoreStats {
        &self.stats
    }
}
