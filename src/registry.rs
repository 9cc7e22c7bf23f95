use crate::telemetry::{UnitId, MAX_UNITS};
use arrayvec::ArrayString;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::{self, Write as _};
use std::net::{IpAddr, SocketAddr};
use thiserror::Error;
use tracing::{debug, info};

pub const INITIAL_CAPACITY: usize = 4;
/// Longest `ip:port` key: a full IPv6 literal plus port fits comfortably.
pub const MAX_ENDPOINT_KEY_LEN: usize = 64;

pub type EndpointKey = ArrayString<MAX_ENDPOINT_KEY_LEN>;

/// Network origin of a message: (IP string, port).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub ip: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self { ip: ip.into(), port }
    }

    /// Combined `ip:port` hashing key. Rejects an empty IP, port 0 and
    /// keys that do not fit the fixed buffer.
    pub fn key(&self) -> Result<EndpointKey, RegistryError> {
        if self.ip.is_empty() || self.port == 0 {
            return Err(RegistryError::InvalidEndpoint(self.clone()));
        }
        let mut key = EndpointKey::new();
        write!(key, "{}:{}", self.ip, self.port)
            .map_err(|_| RegistryError::InvalidEndpoint(self.clone()))?;
        Ok(key)
    }

    pub fn socket_addr(&self) -> Option<SocketAddr> {
        let ip: IpAddr = self.ip.parse().ok()?;
        Some(SocketAddr::new(ip, self.port))
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub endpoint: Endpoint,
    pub unit: UnitId,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("invalid endpoint {0}")]
    InvalidEndpoint(Endpoint),
    #[error("all 255 unit identities are in use")]
    Full,
}

#[derive(Debug, Clone)]
struct Slot {
    entry: RegistryEntry,
    key: EndpointKey,
}

/// Bijection between endpoints and unit identities.
///
/// Entries live densely in a growable array; two hash indices give O(1)
/// lookup by endpoint key and by identity. Anything that moves entries
/// (growth, removal) rebuilds both indices from the array.
#[derive(Debug)]
pub struct DeviceRegistry {
    slots: Vec<Slot>,
    capacity: usize,
    by_endpoint: HashMap<EndpointKey, UnitId>,
    by_unit: HashMap<UnitId, usize>,
    next_id: u8,
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::with_capacity(INITIAL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: Vec::with_capacity(capacity),
            capacity,
            by_endpoint: HashMap::with_capacity(capacity),
            by_unit: HashMap::with_capacity(capacity),
            next_id: 0,
        }
    }

    /// Returns the identity for `endpoint`, assigning a fresh one on first
    /// sight. Invalid input or a full registry yields [`UnitId::INVALID`].
    pub fn register(&mut self, endpoint: &Endpoint) -> UnitId {
        self.try_register(endpoint).unwrap_or(UnitId::INVALID)
    }

    pub fn try_register(&mut self, endpoint: &Endpoint) -> Result<UnitId, RegistryError> {
        let key = endpoint.key()?;
        if let Some(&unit) = self.by_endpoint.get(&key) {
            return Ok(unit);
        }

        let unit = self.allocate_id()?;
        if self.slots.len() == self.capacity {
            self.grow();
        }

        let slot = self.slots.len();
        self.slots.push(Slot {
            entry: RegistryEntry {
                endpoint: endpoint.clone(),
                unit,
            },
            key,
        });
        self.by_endpoint.insert(key, unit);
        self.by_unit.insert(unit, slot);

        info!(%unit, %endpoint, "unit registered");
        Ok(unit)
    }

    pub fn lookup(&self, unit: UnitId) -> Option<&RegistryEntry> {
        let slot = *self.by_unit.get(&unit)?;
        self.slots.get(slot).map(|s| &s.entry)
    }

    pub fn lookup_endpoint(&self, endpoint: &Endpoint) -> Option<UnitId> {
        let key = endpoint.key().ok()?;
        self.by_endpoint.get(&key).copied()
    }

    /// Removes `unit`, shifting later entries left to keep storage dense.
    pub fn remove(&mut self, unit: UnitId) -> bool {
        let Some(slot) = self.by_unit.remove(&unit) else {
            return false;
        };
        let removed = self.slots.remove(slot);
        self.by_endpoint.remove(&removed.key);
        self.rebuild_indices();

        info!(%unit, endpoint = %removed.entry.endpoint, "unit removed");
        true
    }

    pub fn remove_endpoint(&mut self, endpoint: &Endpoint) -> Option<UnitId> {
        let unit = self.lookup_endpoint(endpoint)?;
        self.remove(unit).then_some(unit)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn iter(&self) -> impl Iterator<Item = &RegistryEntry> {
        self.slots.iter().map(|s| &s.entry)
    }

    /// Checks that every live identity and endpoint resolves to exactly one
    /// slot and that no index entry points at a missing slot.
    pub fn indices_consistent(&self) -> bool {
        if self.by_unit.len() != self.slots.len() || self.by_endpoint.len() != self.slots.len() {
            return false;
        }
        self.slots.iter().enumerate().all(|(slot, s)| {
            self.by_unit.get(&s.entry.unit) == Some(&slot)
                && self.by_endpoint.get(&s.key) == Some(&s.entry.unit)
        })
    }

    /// Next identity from the counter, skipping identities still live once
    /// the counter has wrapped.
    fn allocate_id(&mut self) -> Result<UnitId, RegistryError> {
        if self.slots.len() >= MAX_UNITS {
            return Err(RegistryError::Full);
        }
        for _ in 0..MAX_UNITS {
            let candidate = UnitId(self.next_id);
            self.next_id = if self.next_id >= UnitId::MAX.0 {
                0
            } else {
                self.next_id + 1
            };
            if !self.by_unit.contains_key(&candidate) {
                return Ok(candidate);
            }
        }
        Err(RegistryError::Full)
    }

    fn grow(&mut self) {
        let new_capacity = self.capacity * 2;
        let mut slots = Vec::with_capacity(new_capacity);
        slots.append(&mut self.slots);
        self.slots = slots;
        self.capacity = new_capacity;
        self.rebuild_indices();
        debug!(capacity = new_capacity, "registry grown");
    }

    fn rebuild_indices(&mut self) {
        self.by_endpoint.clear();
        self.by_unit.clear();
        for (slot, s) in self.slots.iter().enumerate() {
            self.by_endpoint.insert(s.key, s.entry.unit);
            self.by_unit.insert(s.entry.unit, slot);
        }
    }
}
