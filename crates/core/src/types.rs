use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::TopologyError;

/// Signal strength value meaning "not measured"
pub const SIGNAL_UNKNOWN: i32 = -1;

/// Current unix time in seconds
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Role a device plays in the fabric
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeviceRole {
    /// The single coordinating node
    PrimaryBase,
    /// A node that forwards traffic for others
    Gateway,
    /// A plain member
    #[default]
    Node,
}

impl DeviceRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PrimaryBase => "primary_base",
            Self::Gateway => "gateway",
            Self::Node => "node",
        }
    }
}

impl fmt::Display for DeviceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceRole {
    type Err = TopologyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "primary_base" => Ok(Self::PrimaryBase),
            "gateway" => Ok(Self::Gateway),
            "node" => Ok(Self::Node),
            other => Err(TopologyError::InvalidField {
                field: "role",
                reason: format!("unknown role '{}'", other),
            }),
        }
    }
}

/// Link technology used to reach a device.
///
/// Every variant is carried over TCP; the radio-specific variants only
/// change the dialled port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionType {
    #[default]
    Wifi,
    Bluetooth,
    WifiDirect,
    Mesh,
    Hotspot,
}

impl ConnectionType {
    pub const ALL: [ConnectionType; 5] = [
        Self::Wifi,
        Self::Bluetooth,
        Self::WifiDirect,
        Self::Mesh,
        Self::Hotspot,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Wifi => "wifi",
            Self::Bluetooth => "bluetooth",
            Self::WifiDirect => "wifi_direct",
            Self::Mesh => "mesh",
            Self::Hotspot => "hotspot",
        }
    }

    /// Offset added to a device's port when dialling over this link
    pub fn port_offset(&self) -> u16 {
        match self {
            Self::Bluetooth => 1000,
            _ => 0,
        }
    }

    /// Whether a session over this link is wrapped in TLS when TLS is configured
    pub fn supports_tls(&self) -> bool {
        matches!(self, Self::Wifi | Self::Hotspot)
    }
}

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConnectionType {
    type Err = TopologyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "wifi" => Ok(Self::Wifi),
            "bluetooth" => Ok(Self::Bluetooth),
            "wifi_direct" => Ok(Self::WifiDirect),
            "mesh" => Ok(Self::Mesh),
            "hotspot" => Ok(Self::Hotspot),
            other => Err(TopologyError::InvalidField {
                field: "connection_type",
                reason: format!("unknown connection type '{}'", other),
            }),
        }
    }
}

/// Runtime metrics tracked per device
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceMetrics {
    pub latency_ms: f64,
    pub requests_per_sec: f64,
    /// Percentage of failed sends, 0..=100
    pub error_rate: f64,
    /// Unix seconds of the last observed activity
    pub last_activity: u64,
    #[serde(default)]
    pub custom: HashMap<String, f64>,
}

/// One network peer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    pub name: String,
    pub role: DeviceRole,
    #[serde(default)]
    pub mac: String,
    pub ip: String,
    pub port: u16,
    #[serde(default)]
    pub connection_type: ConnectionType,
    /// Coarse estimate in -1..=100, -1 when unknown
    pub signal_strength: i32,
    pub online: bool,
    pub last_seen: u64,
    pub registered_at: u64,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub metrics: DeviceMetrics,
}

impl Device {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        role: DeviceRole,
        ip: impl Into<String>,
        port: u16,
    ) -> Self {
        let now = unix_now();
        Self {
            id: id.into(),
            name: name.into(),
            role,
            mac: String::new(),
            ip: ip.into(),
            port,
            connection_type: ConnectionType::default(),
            signal_strength: SIGNAL_UNKNOWN,
            online: false,
            last_seen: now,
            registered_at: now,
            metadata: HashMap::new(),
            metrics: DeviceMetrics::default(),
        }
    }

    pub fn with_mac(mut self, mac: impl Into<String>) -> Self {
        self.mac = mac.into();
        self
    }

    pub fn with_connection_type(mut self, connection_type: ConnectionType) -> Self {
        self.connection_type = connection_type;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Set the signal estimate, clamped to -1..=100
    pub fn set_signal_strength(&mut self, strength: i32) {
        self.signal_strength = strength.clamp(SIGNAL_UNKNOWN, 100);
    }

    /// Port to dial for the given link type
    pub fn dial_port(&self, connection_type: ConnectionType) -> u16 {
        self.port.saturating_add(connection_type.port_offset())
    }

    /// `ip:port` for the given link type
    pub fn dial_address(&self, connection_type: ConnectionType) -> String {
        format!("{}:{}", self.ip, self.dial_port(connection_type))
    }

    pub fn set_online(&mut self, online: bool) {
        self.online = online;
        self.last_seen = unix_now();
    }

    /// Check required fields before the device enters a topology
    pub fn validate(&self) -> crate::Result<()> {
        if self.id.trim().is_empty() {
            return Err(TopologyError::InvalidField {
                field: "id",
                reason: "must not be empty".to_string(),
            });
        }
        if self.ip.trim().is_empty() {
            return Err(TopologyError::InvalidField {
                field: "ip",
                reason: "must not be empty".to_string(),
            });
        }
        Ok(())
    }
}

/// A logical edge between two devices
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConnection {
    pub id: String,
    pub source_device_id: String,
    pub target_device_id: String,
    pub connection_type: ConnectionType,
    pub is_active: bool,
    pub latency_ms: f64,
    /// Estimated bandwidth in bytes/sec
    pub bandwidth: u64,
    pub error_rate: f64,
    pub established_at: u64,
    pub last_heartbeat: u64,
}

impl DeviceConnection {
    pub fn new(
        id: impl Into<String>,
        source_device_id: impl Into<String>,
        target_device_id: impl Into<String>,
        connection_type: ConnectionType,
    ) -> Self {
        let now = unix_now();
        Self {
            id: id.into(),
            source_device_id: source_device_id.into(),
            target_device_id: target_device_id.into(),
            connection_type,
            is_active: true,
            latency_ms: 0.0,
            bandwidth: 0,
            error_rate: 0.0,
            established_at: now,
            last_heartbeat: now,
        }
    }

    /// Whether `device_id` is one of the endpoints
    pub fn touches(&self, device_id: &str) -> bool {
        self.source_device_id == device_id || self.target_device_id == device_id
    }

    /// The other endpoint, if `device_id` is one of them
    pub fn peer_of(&self, device_id: &str) -> Option<&str> {
        if self.source_device_id == device_id {
            Some(&self.target_device_id)
        } else if self.target_device_id == device_id {
            Some(&self.source_device_id)
        } else {
            None
        }
    }
}

/// A symbolic name bound to an address and service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsRecord {
    pub name: String,
    pub ip: String,
    pub port: u16,
    pub service: String,
    #[serde(default)]
    pub owner: String,
    pub created_at: u64,
    pub updated_at: u64,
}

impl DnsRecord {
    pub fn new(
        name: impl Into<String>,
        ip: impl Into<String>,
        port: u16,
        service: impl Into<String>,
    ) -> Self {
        let now = unix_now();
        Self {
            name: name.into(),
            ip: ip.into(),
            port,
            service: service.into(),
            owner: String::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    /// `ip:port`
    pub fn address(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

/// Intent to reach `target_id` through `intermediate_id`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayRoute {
    pub id: String,
    pub source_id: String,
    pub target_id: String,
    pub intermediate_id: String,
    pub priority: i32,
    pub active: bool,
    pub created_at: u64,
    /// Topology connections backing this route (source-intermediate, intermediate-target)
    #[serde(default)]
    pub connection_ids: Vec<String>,
}

impl RelayRoute {
    pub fn new(
        id: impl Into<String>,
        source_id: impl Into<String>,
        target_id: impl Into<String>,
        intermediate_id: impl Into<String>,
        priority: i32,
    ) -> Self {
        Self {
            id: id.into(),
            source_id: source_id.into(),
            target_id: target_id.into(),
            intermediate_id: intermediate_id.into(),
            priority,
            active: false,
            created_at: unix_now(),
            connection_ids: Vec::new(),
        }
    }

    /// Whether any endpoint of the route is `device_id`
    pub fn involves(&self, device_id: &str) -> bool {
        self.source_id == device_id
            || self.target_id == device_id
            || self.intermediate_id == device_id
    }
}
