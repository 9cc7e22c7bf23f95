//! # Swarm Bridge
//!
//! Receives telemetry from a swarm of field units over UDP in one of three
//! wire formats, keeps an identity registry keyed by each unit's network
//! endpoint, and maintains a fixed-capacity table of per-unit telemetry
//! records.
//!
//! ## Features
//!
//! - **Wire codecs**: framed binary, comma-separated `key=value` text and
//!   structured JSON objects behind one [`codec::WireCodec`] trait
//! - **UDP transport**: background receive thread with a drainable queue or
//!   a push callback, plus best-effort sends back to units
//! - **Device registry**: O(1) endpoint-to-identity bijection with
//!   idempotent registration
//! - **Telemetry store**: partial updates applied in arrival order with
//!   per-message fault isolation
//!
//! ## Quick Start
//!
//! ```rust
//! use swarm_bridge::codec::{BinaryCodec, WireCodec};
//! use swarm_bridge::telemetry::{Position, TelemetryUpdate};
//!
//! let update = TelemetryUpdate::new().with_position(Position { x: 100, y: 200, z: 50 });
//! let frames = BinaryCodec::default().encode(&update).unwrap();
//! assert_eq!(BinaryCodec::default().decode(&frames[0]).unwrap(), update);
//! ```
//!
//! ## Architecture
//!
//! - [`bridge`] - per-listener orchestrator driven by a fixed-rate tick
//! - [`transport`] - UDP socket, receive loop and inbound queue
//! - [`codec`] - wire format decoders and encoders
//! - [`registry`] - endpoint to unit identity mapping
//! - [`telemetry`] - record types and the telemetry store
//! - [`config`] - listener and runtime configuration

#![deny(warnings)]
#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::return_self_not_must_use)]

pub mod bridge;
pub mod codec;
pub mod config;
pub mod registry;
pub mod telemetry;
pub mod transport;

pub use bridge::{BridgeError, BridgeState, SwarmBridge};
pub use codec::{codec_for, codec_with_checksum, ChecksumMode, CodecError, WireCodec, WireFormat};
pub use config::{BridgeConfig, ConfigError, ListenerConfig};
pub use registry::{DeviceRegistry, Endpoint, RegistryEntry, RegistryError};
pub use telemetry::{
    ApplyReport, TelemetryRecord, TelemetryStore, TelemetryUpdate, UnitId,
};
pub use transport::{RawMessage, TransportError, TransportStatus, UdpTransport};
