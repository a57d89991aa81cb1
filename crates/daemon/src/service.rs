//! Node service: builds every subsystem from settings and owns their lifetimes

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use nexa_core::{Device, DeviceRole};
use nexa_dns::{
    bootstrap_records, AuthorityConfig, AuthorityHandle, AuthorityServer, DnsRegistry,
    DnsResponder, MetricsReporter, NameAuthority, NameResolver,
};
use nexa_gateway::{default_aliases, GatewayConfig, GatewayHandle, GatewayServer, GatewayState};
use nexa_network::tls::{load_acceptor, load_client_tls};
use nexa_network::{
    ConnectionConfig, DeviceDiscovery, DiscoveryConfig, MonitorConfig, NetworkManager,
};
use nexa_relay::{ExpansionConfig, ExpansionManager};
use nexa_settings::Settings;

use crate::{DaemonError, Result};

/// Addresses a started node is reachable on
#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub device_id: String,
    pub authority_addr: SocketAddr,
    pub gateway_addr: SocketAddr,
    /// `None` when the UDP 53 responder is off or failed to bind
    pub dns_addr: Option<SocketAddr>,
    pub mdns: bool,
}

struct Running {
    status: NodeStatus,
    authority: AuthorityHandle,
    gateway: GatewayHandle,
    reporter: MetricsReporter,
    responders: Vec<Arc<DnsResponder>>,
}

pub struct NodeService {
    settings: Settings,
    advertise_ip: IpAddr,
    local_device: Device,
    network: Arc<NetworkManager>,
    authority: Arc<NameAuthority>,
    expansion: Arc<ExpansionManager>,
    running: Mutex<Option<Running>>,
}

impl NodeService {
    /// Build every subsystem without binding any socket
    pub fn new(settings: Settings) -> Result<Self> {
        settings.validate()?;
        let advertise_ip: IpAddr =
            settings
                .node
                .advertise_ip
                .parse()
                .map_err(|e: std::net::AddrParseError| DaemonError::InvalidSetting {
                    field: "node.advertise_ip",
                    reason: e.to_string(),
                })?;

        let local_device = local_device(&settings);

        let client_tls = match &settings.tls.ca_path {
            Some(ca) => {
                let server_name = settings.tls.server_name.as_deref().unwrap_or("localhost");
                Some(load_client_tls(&settings.resolve_path(ca), server_name)?)
            }
            None => None,
        };
        let network = Arc::new(NetworkManager::with_monitor(
            ConnectionConfig {
                local_id: local_device.id.clone(),
                timeout: settings.network.connect_timeout(),
                max_retries: settings.network.max_retries,
                heartbeat_interval: settings.network.heartbeat_interval(),
                reconnect_wait: settings.network.reconnect_wait(),
                tls: client_tls,
                ..Default::default()
            },
            MonitorConfig {
                interval: settings.network.monitor_interval(),
                timeout: settings.network.health_timeout(),
            },
        ));

        let registry = Arc::new(DnsRegistry::open(settings.records_path())?);
        let authority = Arc::new(NameAuthority::new(
            registry,
            AuthorityConfig {
                suffixes: settings.dns.suffixes.clone(),
                gateway_ip: settings.node.advertise_ip.clone(),
                gateway_port: settings.gateway.port,
            },
        ));

        let mut expansion = ExpansionManager::new(
            network.clone(),
            local_device.clone(),
            ExpansionConfig {
                interval: settings.network.expansion_interval(),
                ..Default::default()
            },
        );
        if settings.network.discovery_enabled {
            let broadcast_addr = settings.network.broadcast_addr.parse().map_err(
                |e: std::net::AddrParseError| DaemonError::InvalidSetting {
                    field: "network.broadcast_addr",
                    reason: e.to_string(),
                },
            )?;
            let discovery = DeviceDiscovery::new(DiscoveryConfig {
                port: settings.network.discovery_port,
                broadcast_addr,
                local_ip: Some(advertise_ip),
                local_device_id: Some(local_device.id.clone()),
            });
            expansion = expansion.with_discovery(Arc::new(discovery));
        }

        Ok(Self {
            settings,
            advertise_ip,
            local_device,
            network,
            authority,
            expansion: Arc::new(expansion),
            running: Mutex::new(None),
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn local_device(&self) -> &Device {
        &self.local_device
    }

    pub fn network(&self) -> &Arc<NetworkManager> {
        &self.network
    }

    pub fn authority(&self) -> &Arc<NameAuthority> {
        &self.authority
    }

    pub fn expansion(&self) -> &Arc<ExpansionManager> {
        &self.expansion
    }

    pub fn status(&self) -> Option<NodeStatus> {
        self.running.lock().as_ref().map(|r| r.status.clone())
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Bind listeners and start background loops
    pub async fn start(&self) -> Result<NodeStatus> {
        if self.is_running() {
            return Err(DaemonError::AlreadyRunning);
        }

        let seeded = self
            .authority
            .registry()
            .seed(bootstrap_records(&self.settings.node.advertise_ip))?;
        if seeded > 0 {
            info!("Seeded {} bootstrap name(s)", seeded);
        }

        let authority_addr = SocketAddr::new(
            IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            self.settings.dns.authority_port,
        );
        let mut authority_server = AuthorityServer::bind(authority_addr, self.authority.clone()).await?;
        if let (Some(cert), Some(key)) = (&self.settings.tls.cert_path, &self.settings.tls.key_path) {
            let acceptor = load_acceptor(&self.settings.resolve_path(cert), &self.settings.resolve_path(key))?;
            authority_server = authority_server.with_tls(acceptor);
            info!("Name Authority TLS enabled");
        }

        let gateway_addr = SocketAddr::new(
            IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            self.settings.gateway.port,
        );
        let resolver: Arc<dyn NameResolver> = self.authority.clone();
        let state = GatewayState::new(gateway_config(&self.settings), resolver, self.expansion.clone())?;
        let gateway_server = GatewayServer::bind(gateway_addr, state).await?;
        let gateway_port = gateway_server.local_addr()?.port();

        self.register_self(gateway_port)?;

        let authority = authority_server.spawn()?;
        let gateway = gateway_server.spawn()?;

        let mut responders = Vec::new();
        let mut dns_addr = None;
        if let Some(responder) = self.start_unicast_responder() {
            dns_addr = responder.local_addr().ok();
            responders.push(responder);
        }
        let mut mdns = false;
        if let Some(responder) = self.start_mdns_responder() {
            mdns = true;
            responders.push(responder);
        }

        let reporter = self
            .authority
            .start_metrics_reporter(self.network.clone(), self.settings.dns.metrics_interval());
        self.network.start_monitoring();
        self.expansion.start().await;

        let status = NodeStatus {
            device_id: self.local_device.id.clone(),
            authority_addr: authority.local_addr(),
            gateway_addr: gateway.local_addr(),
            dns_addr,
            mdns,
        };
        info!(
            "Node {} started (authority {}, gateway {})",
            status.device_id, status.authority_addr, status.gateway_addr
        );

        *self.running.lock() = Some(Running {
            status: status.clone(),
            authority,
            gateway,
            reporter,
            responders,
        });
        Ok(status)
    }

    fn register_self(&self, gateway_port: u16) -> Result<()> {
        let mut device = self.local_device.clone();
        device.port = gateway_port;
        if device.role == DeviceRole::PrimaryBase {
            self.network.register_primary_base(device)?;
        } else {
            self.network.register_device(device)?;
        }
        Ok(())
    }

    fn start_unicast_responder(&self) -> Option<Arc<DnsResponder>> {
        let port = self.settings.dns.udp_port;
        if port == 0 {
            debug!("UDP DNS responder disabled");
            return None;
        }
        let upstream: SocketAddr = match self.settings.dns.upstream.parse() {
            Ok(addr) => addr,
            Err(e) => {
                warn!("UDP DNS responder disabled, bad upstream: {}", e);
                return None;
            }
        };
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
        match DnsResponder::bind_unicast(addr, upstream, self.settings.dns.suffixes.clone()) {
            Ok(responder) => {
                let responder = Arc::new(responder);
                responder.start();
                Some(responder)
            }
            Err(e) => {
                warn!("UDP DNS responder disabled: {}", e);
                None
            }
        }
    }

    fn start_mdns_responder(&self) -> Option<Arc<DnsResponder>> {
        if !self.settings.dns.mdns_enabled {
            return None;
        }
        match DnsResponder::bind_mdns(self.settings.dns.suffixes.clone()) {
            Ok(responder) => {
                let responder = Arc::new(responder);
                responder.start();
                Some(responder)
            }
            Err(e) => {
                warn!("mDNS responder disabled: {}", e);
                None
            }
        }
    }

    /// Stop everything started by [`start`](Self::start). Safe to call repeatedly.
    pub async fn shutdown(&self) {
        let Some(running) = self.running.lock().take() else {
            return;
        };
        info!("Shutting down node {}", running.status.device_id);

        self.expansion.stop();
        running.reporter.stop();
        for responder in &running.responders {
            responder.stop();
        }
        running.gateway.shutdown();
        running.gateway.join().await;
        running.authority.shutdown();
        running.authority.join().await;
        self.network.shutdown().await;
        info!("Node stopped");
    }

    /// Advertised address as seen by peers
    pub fn advertise_ip(&self) -> IpAddr {
        self.advertise_ip
    }
}

fn local_device(settings: &Settings) -> Device {
    let ip = &settings.node.advertise_ip;
    let mut device = if settings.node.role == DeviceRole::PrimaryBase {
        Device::new(
            &settings.node.id,
            &settings.node.name,
            DeviceRole::PrimaryBase,
            ip,
            settings.gateway.port,
        )
    } else {
        let id = format!("gateway-{}", ip);
        Device::new(&id, &settings.node.name, DeviceRole::Gateway, ip, settings.gateway.port)
    };
    device.mac = settings.node.mac.clone();
    device.online = true;
    device
}

fn gateway_config(settings: &Settings) -> GatewayConfig {
    let backends: HashMap<String, String> = settings
        .gateway
        .backends
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    let aliases = if settings.gateway.aliases.is_empty() {
        default_aliases(&backends)
    } else {
        settings
            .gateway
            .aliases
            .iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v.clone()))
            .collect()
    };
    GatewayConfig {
        port: settings.gateway.port,
        advertise_ip: settings.node.advertise_ip.clone(),
        request_timeout: settings.gateway.request_timeout(),
        backends,
        aliases,
        suffixes: settings.dns.suffixes.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use nexa_dns::AuthorityClient;

    fn ephemeral_settings(dir: &Path) -> Settings {
        let mut settings = Settings::load_from(&dir.join("settings.json")).unwrap();
        settings.node.id = "node-local".to_string();
        settings.network.discovery_enabled = false;
        settings.dns.authority_port = 0;
        settings.dns.udp_port = 0;
        settings.dns.mdns_enabled = false;
        settings.gateway.port = 0;
        settings
    }

    fn loopback(addr: SocketAddr) -> String {
        format!("127.0.0.1:{}", addr.port())
    }

    #[tokio::test]
    async fn test_start_serves_authority_and_gateway() {
        let dir = tempfile::tempdir().unwrap();
        let node = NodeService::new(ephemeral_settings(dir.path())).unwrap();
        let status = node.start().await.unwrap();
        assert_eq!(status.device_id, "gateway-127.0.0.1");
        assert!(status.dns_addr.is_none());
        assert!(!status.mdns);

        let client = AuthorityClient::new(loopback(status.authority_addr));
        assert_eq!(client.ping().await.unwrap(), 5);
        let admin = client.lookup("admin.nexa").await.unwrap().unwrap();
        assert_eq!(admin.address(), "127.0.0.1:8080");

        let url = format!("http://{}/health", loopback(status.gateway_addr));
        let response = reqwest::get(&url).await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);

        let device = node.network().get_device("gateway-127.0.0.1").unwrap();
        assert_eq!(device.role, DeviceRole::Gateway);
        assert_eq!(device.port, status.gateway_addr.port());

        node.shutdown().await;
        node.shutdown().await;
        assert!(!node.is_running());
        assert!(dir.path().join("dns_records.json").exists());
    }

    #[tokio::test]
    async fn test_primary_base_registration() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = ephemeral_settings(dir.path());
        settings.node.role = DeviceRole::PrimaryBase;
        let node = NodeService::new(settings).unwrap();
        let status = node.start().await.unwrap();
        assert_eq!(status.device_id, "node-local");
        let topology = node.network().get_topology();
        assert_eq!(topology.primary_base_id.as_deref(), Some("node-local"));
        node.shutdown().await;
    }

    #[test]
    fn test_gateway_config_from_settings() {
        let mut settings = Settings::default();
        let config = gateway_config(&settings);
        assert_eq!(config.aliases.len(), 8);
        assert_eq!(config.backends["admin"], "http://127.0.0.1:8080");

        settings
            .gateway
            .aliases
            .insert("Wiki.N".to_string(), "http://10.0.0.2:80".to_string());
        let config = gateway_config(&settings);
        assert_eq!(config.aliases.len(), 1);
        assert_eq!(config.aliases["wiki.n"], "http://10.0.0.2:80");
    }

    // ==================== NEGATIVE TESTS ====================

    #[tokio::test]
    async fn test_start_twice_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let node = NodeService::new(ephemeral_settings(dir.path())).unwrap();
        node.start().await.unwrap();
        assert!(matches!(node.start().await, Err(DaemonError::AlreadyRunning)));
        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_authority_bind_failure_is_fatal() {
        let taken = tokio::net::TcpListener::bind("0.0.0.0:0").await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let mut settings = ephemeral_settings(dir.path());
        settings.dns.authority_port = taken.local_addr().unwrap().port();

        let node = NodeService::new(settings).unwrap();
        assert!(matches!(node.start().await, Err(DaemonError::Dns(_))));
        assert!(!node.is_running());
    }

    #[test]
    fn test_invalid_settings_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = ephemeral_settings(dir.path());
        settings.node.advertise_ip = "nowhere".to_string();
        assert!(matches!(NodeService::new(settings), Err(DaemonError::Settings(_))));
    }

    #[test]
    fn test_corrupt_records_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("dns_records.json"), "not json").unwrap();
        assert!(matches!(
            NodeService::new(ephemeral_settings(dir.path())),
            Err(DaemonError::Dns(_))
        ));
    }
}
