use crate::codec::{ChecksumMode, WireFormat};
use crate::telemetry::{DEFAULT_UNIT_CAPACITY, MAX_UNITS};
use crate::transport::{
    TransportConfig, DEFAULT_POLL_INTERVAL, DEFAULT_RECV_BUFFER_SIZE, DEFAULT_SHUTDOWN_TIMEOUT,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0";
pub const DEFAULT_TICK_RATE_HZ: u32 = 10;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("no listeners configured")]
    NoListeners,
    #[error("listener {format} on port {port}: unit capacity must be 1..={max}, got {capacity}")]
    UnitCapacity {
        format: WireFormat,
        port: u16,
        capacity: usize,
        max: usize,
    },
    #[error("tick rate must be at least 1 Hz")]
    ZeroTickRate,
    #[error("receive buffer size must be non-zero")]
    ZeroBufferSize,
    #[error("poll interval must be non-zero")]
    ZeroPollInterval,
    #[error("port {0} is used by more than one listener")]
    DuplicatePort(u16),
}

/// One UDP endpoint dedicated to a single wire format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerConfig {
    pub format: WireFormat,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    pub port: u16,
    #[serde(default = "default_unit_capacity")]
    pub unit_capacity: usize,
}

impl ListenerConfig {
    pub fn new(format: WireFormat, port: u16) -> Self {
        Self {
            format,
            bind_address: default_bind_address(),
            port,
            unit_capacity: DEFAULT_UNIT_CAPACITY,
        }
    }

    /// Listener on the format's deployed port.
    pub fn for_format(format: WireFormat) -> Self {
        Self::new(format, format.default_port())
    }

    /// `host:port` for the socket layer. IPv6 literals are bracketed.
    pub fn bind_addr(&self) -> String {
        match self.bind_address.parse::<IpAddr>() {
            Ok(ip) => SocketAddr::new(ip, self.port).to_string(),
            Err(_) => format!("{}:{}", self.bind_address, self.port),
        }
    }
}

fn default_bind_address() -> String {
    DEFAULT_BIND_ADDRESS.to_string()
}

fn default_unit_capacity() -> usize {
    DEFAULT_UNIT_CAPACITY
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub listeners: Vec<ListenerConfig>,
    pub tick_rate_hz: u32,
    pub recv_buffer_size: usize,
    pub poll_interval_ms: u64,
    pub shutdown_timeout_ms: u64,
    /// Binary frame checksum acceptance. Strict unless a deployment opts in.
    pub checksum_mode: ChecksumMode,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            listeners: WireFormat::ALL
                .iter()
                .map(|format| ListenerConfig::for_format(*format))
                .collect(),
            tick_rate_hz: DEFAULT_TICK_RATE_HZ,
            recv_buffer_size: DEFAULT_RECV_BUFFER_SIZE,
            poll_interval_ms: DEFAULT_POLL_INTERVAL.as_millis() as u64,
            shutdown_timeout_ms: DEFAULT_SHUTDOWN_TIMEOUT.as_millis() as u64,
            checksum_mode: ChecksumMode::default(),
        }
    }
}

impl BridgeConfig {
    /// Parses and validates a JSON config. Missing keys take defaults.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listeners.is_empty() {
            return Err(ConfigError::NoListeners);
        }
        if self.tick_rate_hz == 0 {
            return Err(ConfigError::ZeroTickRate);
        }
        if self.recv_buffer_size == 0 {
            return Err(ConfigError::ZeroBufferSize);
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::ZeroPollInterval);
        }

        let mut ports = HashSet::with_capacity(self.listeners.len());
        for listener in &self.listeners {
            if listener.unit_capacity == 0 || listener.unit_capacity > MAX_UNITS {
                return Err(ConfigError::UnitCapacity {
                    format: listener.format,
                    port: listener.port,
                    capacity: listener.unit_capacity,
                    max: MAX_UNITS,
                });
            }
            // Port 0 asks the OS for an ephemeral port, so several may coexist.
            if listener.port != 0 && !ports.insert(listener.port) {
                return Err(ConfigError::DuplicatePort(listener.port));
            }
        }
        Ok(())
    }

    pub fn tick_period(&self) -> Duration {
        Duration::from_secs(1) / self.tick_rate_hz.max(1)
    }

    pub fn transport_config(&self, listener: &ListenerConfig) -> TransportConfig {
        TransportConfig {
            bind_addr: listener.bind_addr(),
            recv_buffer_size: self.recv_buffer_size,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            shutdown_timeout: Duration::from_millis(self.shutdown_timeout_ms),
        }
    }

    pub fn listener(&self, format: WireFormat) -> Option<&ListenerConfig> {
        self.listeners.iter().find(|l| l.format == format)
    }
}
