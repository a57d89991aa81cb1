//! Configuration types

use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use nexa_core::{
    DeviceRole, DEFAULT_ADMIN_PORT, DEFAULT_AUTHORITY_PORT, DEFAULT_CHAT_PORT,
    DEFAULT_DASHBOARD_PORT, DEFAULT_DISCOVERY_PORT, DEFAULT_DNS_UDP_PORT, DEFAULT_GATEWAY_PORT,
    DEFAULT_STORAGE_PORT, DEFAULT_UPSTREAM_RESOLVER, MANAGED_SUFFIXES,
};

use crate::{default_config_dir, default_settings_path, Result, SettingsError};

/// Main settings structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub node: NodeSettings,

    #[serde(default)]
    pub network: NetworkSettings,

    #[serde(default)]
    pub dns: DnsSettings,

    #[serde(default)]
    pub gateway: GatewaySettings,

    #[serde(default)]
    pub tls: TlsSettings,

    /// Custom settings file path (not serialized)
    #[serde(skip)]
    config_path: Option<PathBuf>,
}

impl Settings {
    /// Load settings from the default path, or create defaults
    pub fn load_or_default() -> Result<Self> {
        Self::load_from(&default_settings_path())
    }

    /// Load settings from a specific path, or create defaults
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut settings = if path.exists() {
            let content = std::fs::read_to_string(path).map_err(SettingsError::ReadError)?;
            let settings: Settings =
                serde_json::from_str(&content).map_err(SettingsError::ParseError)?;
            info!("Loaded settings from {:?}", path);
            settings
        } else {
            Self::default()
        };
        settings.config_path = Some(path.to_path_buf());
        Ok(settings)
    }

    /// Save settings to the configured path
    pub fn save(&self) -> Result<()> {
        let path = self.config_path.clone().unwrap_or_else(default_settings_path);
        self.save_to(&path)
    }

    /// Save settings to a specific path
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(SettingsError::CreateDirError)?;
            }
        }

        let content = serde_json::to_string_pretty(self).map_err(SettingsError::ParseError)?;
        std::fs::write(path, content).map_err(SettingsError::WriteError)?;
        info!("Saved settings to {:?}", path);
        Ok(())
    }

    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    /// Directory relative paths in the settings resolve against
    pub fn base_dir(&self) -> PathBuf {
        self.config_path
            .as_deref()
            .and_then(Path::parent)
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(default_config_dir)
    }

    /// Location of the DNS records file
    pub fn records_path(&self) -> PathBuf {
        self.resolve_path(&self.dns.records_file)
    }

    pub fn resolve_path(&self, path: &str) -> PathBuf {
        let path = Path::new(path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir().join(path)
        }
    }

    /// Reject values that would only fail later, at bind time
    pub fn validate(&self) -> Result<()> {
        fn invalid(field: &str, reason: impl Into<String>) -> SettingsError {
            SettingsError::Invalid {
                field: field.to_string(),
                reason: reason.into(),
            }
        }

        if self.node.id.trim().is_empty() {
            return Err(invalid("node.id", "must not be empty"));
        }
        self.node
            .advertise_ip
            .parse::<IpAddr>()
            .map_err(|e| invalid("node.advertise_ip", e.to_string()))?;
        self.network
            .broadcast_addr
            .parse::<IpAddr>()
            .map_err(|e| invalid("network.broadcast_addr", e.to_string()))?;
        self.dns
            .upstream
            .parse::<SocketAddr>()
            .map_err(|e| invalid("dns.upstream", e.to_string()))?;
        if self.gateway.request_timeout_secs == 0 {
            return Err(invalid("gateway.request_timeout_secs", "must be at least 1"));
        }
        if self.dns.suffixes.iter().any(|s| !s.starts_with('.') || s.len() < 2) {
            return Err(invalid("dns.suffixes", "suffixes look like \".n\""));
        }
        if self.tls.cert_path.is_some() != self.tls.key_path.is_some() {
            return Err(invalid("tls", "cert_path and key_path must be set together"));
        }
        Ok(())
    }
}

/// Identity of this node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSettings {
    #[serde(default = "default_node_id")]
    pub id: String,

    #[serde(default = "default_node_name")]
    pub name: String,

    #[serde(default)]
    pub role: DeviceRole,

    #[serde(default)]
    pub mac: String,

    /// Address announced to peers and returned for wildcard names
    #[serde(default = "default_advertise_ip")]
    pub advertise_ip: String,
}

fn default_node_id() -> String {
    format!("node-{}", hex::encode(rand::random::<[u8; 4]>()))
}

fn default_node_name() -> String {
    "nexa-node".to_string()
}

fn default_advertise_ip() -> String {
    "127.0.0.1".to_string()
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            id: default_node_id(),
            name: default_node_name(),
            role: DeviceRole::default(),
            mac: String::new(),
            advertise_ip: default_advertise_ip(),
        }
    }
}

/// Discovery, sessions and health monitoring
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSettings {
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,

    #[serde(default = "default_broadcast_addr")]
    pub broadcast_addr: String,

    #[serde(default = "default_true")]
    pub discovery_enabled: bool,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_heartbeat")]
    pub heartbeat_interval_secs: u64,

    #[serde(default = "default_reconnect_wait")]
    pub reconnect_wait_secs: u64,

    #[serde(default = "default_monitor_interval")]
    pub monitor_interval_secs: u64,

    #[serde(default = "default_health_timeout")]
    pub health_timeout_secs: u64,

    #[serde(default = "default_expansion_interval")]
    pub expansion_interval_secs: u64,
}

fn default_discovery_port() -> u16 {
    DEFAULT_DISCOVERY_PORT
}

fn default_broadcast_addr() -> String {
    "255.255.255.255".to_string()
}

fn default_true() -> bool {
    true
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_max_retries() -> u32 {
    3
}

fn default_heartbeat() -> u64 {
    30
}

fn default_reconnect_wait() -> u64 {
    5
}

fn default_monitor_interval() -> u64 {
    30
}

fn default_health_timeout() -> u64 {
    120
}

fn default_expansion_interval() -> u64 {
    10
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            discovery_port: default_discovery_port(),
            broadcast_addr: default_broadcast_addr(),
            discovery_enabled: true,
            connect_timeout_secs: default_connect_timeout(),
            max_retries: default_max_retries(),
            heartbeat_interval_secs: default_heartbeat(),
            reconnect_wait_secs: default_reconnect_wait(),
            monitor_interval_secs: default_monitor_interval(),
            health_timeout_secs: default_health_timeout(),
            expansion_interval_secs: default_expansion_interval(),
        }
    }
}

impl NetworkSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn reconnect_wait(&self) -> Duration {
        Duration::from_secs(self.reconnect_wait_secs)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_secs(self.health_timeout_secs)
    }

    pub fn expansion_interval(&self) -> Duration {
        Duration::from_secs(self.expansion_interval_secs)
    }
}

/// Name Authority and DNS responders
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsSettings {
    #[serde(default = "default_authority_port")]
    pub authority_port: u16,

    /// Standard DNS listener; 0 disables it
    #[serde(default = "default_udp_port")]
    pub udp_port: u16,

    #[serde(default = "default_true")]
    pub mdns_enabled: bool,

    #[serde(default = "default_upstream")]
    pub upstream: String,

    /// Relative paths resolve against the settings directory
    #[serde(default = "default_records_file")]
    pub records_file: String,

    #[serde(default = "default_suffixes")]
    pub suffixes: Vec<String>,

    #[serde(default = "default_metrics_interval")]
    pub metrics_interval_secs: u64,
}

fn default_authority_port() -> u16 {
    DEFAULT_AUTHORITY_PORT
}

fn default_udp_port() -> u16 {
    DEFAULT_DNS_UDP_PORT
}

fn default_upstream() -> String {
    DEFAULT_UPSTREAM_RESOLVER.to_string()
}

fn default_records_file() -> String {
    "dns_records.json".to_string()
}

fn default_suffixes() -> Vec<String> {
    MANAGED_SUFFIXES.iter().map(|s| s.to_string()).collect()
}

fn default_metrics_interval() -> u64 {
    2
}

impl Default for DnsSettings {
    fn default() -> Self {
        Self {
            authority_port: default_authority_port(),
            udp_port: default_udp_port(),
            mdns_enabled: true,
            upstream: default_upstream(),
            records_file: default_records_file(),
            suffixes: default_suffixes(),
            metrics_interval_secs: default_metrics_interval(),
        }
    }
}

impl DnsSettings {
    pub fn metrics_interval(&self) -> Duration {
        Duration::from_secs(self.metrics_interval_secs.max(1))
    }
}

/// HTTP gateway
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewaySettings {
    #[serde(default = "default_gateway_port")]
    pub port: u16,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Path backend name -> base URL
    #[serde(default = "default_backends")]
    pub backends: BTreeMap<String, String>,

    /// Host -> base URL; empty means `<backend>.nexa` / `<backend>.n`
    #[serde(default)]
    pub aliases: BTreeMap<String, String>,
}

fn default_gateway_port() -> u16 {
    DEFAULT_GATEWAY_PORT
}

fn default_request_timeout() -> u64 {
    60
}

fn default_backends() -> BTreeMap<String, String> {
    [
        ("admin", DEFAULT_ADMIN_PORT),
        ("storage", DEFAULT_STORAGE_PORT),
        ("chat", DEFAULT_CHAT_PORT),
        ("dashboard", DEFAULT_DASHBOARD_PORT),
    ]
    .into_iter()
    .map(|(name, port)| (name.to_string(), format!("http://127.0.0.1:{}", port)))
    .collect()
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            port: default_gateway_port(),
            request_timeout_secs: default_request_timeout(),
            backends: default_backends(),
            aliases: BTreeMap::new(),
        }
    }
}

impl GatewaySettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// PEM paths. Server side needs cert and key; client side needs the CA.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsSettings {
    #[serde(default)]
    pub cert_path: Option<String>,

    #[serde(default)]
    pub key_path: Option<String>,

    #[serde(default)]
    pub ca_path: Option<String>,

    /// Name checked against the server certificate
    #[serde(default)]
    pub server_name: Option<String>,
}

impl TlsSettings {
    pub fn server_enabled(&self) -> bool {
        self.cert_path.is_some() && self.key_path.is_some()
    }
}
