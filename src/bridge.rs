use crate::codec::{codec_with_checksum, WireFormat};
use crate::config::{BridgeConfig, ListenerConfig};
use crate::registry::{DeviceRegistry, RegistryError};
use crate::telemetry::{ApplyReport, TelemetryRecord, TelemetryStore, TelemetryUpdate, UnitId};
use crate::transport::{TransportError, TransportStatus, UdpTransport};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("{0} is not registered")]
    UnknownUnit(UnitId),
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BridgeState {
    pub running: bool,
    pub uptime_seconds: u64,
    pub tick_count: u64,
    pub messages_applied: u64,
    pub faults: u64,
    pub registered_units: usize,
    pub transport_restarts: u32,
    pub last_error: Option<String>,
}

/// One listener's pipeline: transport feeding a registry and a telemetry
/// store, advanced by calling [`SwarmBridge::update`] at a fixed rate.
#[derive(Debug)]
pub struct SwarmBridge {
    format: WireFormat,
    transport: UdpTransport,
    registry: DeviceRegistry,
    store: TelemetryStore,
    state: BridgeState,
    start_time: Instant,
}

impl SwarmBridge {
    pub fn new(listener: &ListenerConfig, config: &BridgeConfig) -> Self {
        let codec = codec_with_checksum(listener.format, config.checksum_mode);
        Self {
            format: listener.format,
            transport: UdpTransport::new(config.transport_config(listener), codec.clone()),
            registry: DeviceRegistry::new(),
            store: TelemetryStore::new(listener.unit_capacity, codec),
            state: BridgeState::default(),
            start_time: Instant::now(),
        }
    }

    /// Marks the bridge running and starts its transport. A bind failure is
    /// returned but leaves the bridge running; the next tick retries.
    pub fn start(&mut self) -> Result<(), BridgeError> {
        self.state.running = true;
        self.start_time = Instant::now();

        if let Err(e) = self.transport.start() {
            self.state.last_error = Some(e.to_string());
            return Err(e.into());
        }
        info!(format = %self.format, addr = ?self.transport.local_addr(), "bridge started");
        Ok(())
    }

    pub fn stop(&mut self) {
        self.state.running = false;
        self.transport.stop();
        info!(format = %self.format, ticks = self.state.tick_count, "bridge stopped");
    }

    /// One tick: drain everything queued since the last tick and apply it in
    /// arrival order. Returns `Ok(None)` while stopped.
    pub fn update(&mut self) -> Result<Option<ApplyReport>, BridgeError> {
        if !self.state.running {
            return Ok(None);
        }

        self.state.tick_count += 1;
        self.state.uptime_seconds = self.start_time.elapsed().as_secs();

        if self.transport.status() != TransportStatus::Running {
            self.restart_transport()?;
        }

        let messages = self.transport.drain();
        let report = self.store.apply(messages, &mut self.registry);

        self.state.messages_applied += report.applied as u64;
        self.state.faults += report.faults.len() as u64;
        self.state.registered_units = self.registry.len();
        if let Some(fault) = report.faults.last() {
            self.state.last_error = Some(fault.detail.clone());
        }

        Ok(Some(report))
    }

    fn restart_transport(&mut self) -> Result<(), BridgeError> {
        match self.transport.start() {
            Ok(()) => {
                self.state.transport_restarts += 1;
                warn!(format = %self.format, "transport restarted");
                Ok(())
            }
            Err(e) => {
                self.state.last_error = Some(e.to_string());
                Err(e.into())
            }
        }
    }

    /// Encodes `update` and sends it to the endpoint registered for `unit`.
    pub fn send_update(&self, unit: UnitId, update: &TelemetryUpdate) -> Result<usize, BridgeError> {
        let entry = self
            .registry
            .lookup(unit)
            .ok_or(BridgeError::UnknownUnit(unit))?;

        match self.transport.send_update(update, &entry.endpoint) {
            Ok(sent) => {
                debug!(%unit, endpoint = %entry.endpoint, bytes = sent, "update sent");
                Ok(sent)
            }
            Err(e) => {
                warn!(%unit, endpoint = %entry.endpoint, "send failed: {}", e);
                Err(e.into())
            }
        }
    }

    pub fn snapshot(&self, unit: UnitId) -> Option<TelemetryRecord> {
        self.store.snapshot(unit)
    }

    /// Records of every unit the registry currently knows and the store can hold.
    pub fn registered_records(&self) -> Vec<TelemetryRecord> {
        self.registry
            .iter()
            .filter_map(|entry| self.store.snapshot(entry.unit))
            .collect()
    }

    pub fn records(&self) -> &[TelemetryRecord] {
        self.store.records()
    }

    pub fn format(&self) -> WireFormat {
        self.format
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut DeviceRegistry {
        &mut self.registry
    }

    pub fn store(&self) -> &TelemetryStore {
        &self.store
    }

    pub fn transport(&self) -> &UdpTransport {
        &self.transport
    }

    pub fn get_state(&self) -> &BridgeState {
        &self.state
    }

    pub fn status_line(&self) -> String {
        let stats = self.store.stats();
        let addr = self
            .transport
            .local_addr()
            .map_or_else(|| self.transport.config().bind_addr.clone(), |a| a.to_string());
        format!(
            "[{}] {} {:?} units={} applied={} framing={} field={} unaddressable={} out_of_range={} ticks={}",
            self.format,
            addr,
            self.transport.status(),
            self.registry.len(),
            stats.messages_applied,
            stats.framing_faults,
            stats.field_faults,
            stats.unaddressable,
            stats.out_of_range,
            self.state.tick_count,
        )
    }
}
