//! Network expansion
//!
//! Registers peers found by discovery, records relay routes, and every
//! tick looks for online non-primary devices with no live connection. Each
//! one is routed to the primary base through the first online gateway (by
//! id) that itself has a live connection. Selection is greedy, not optimal.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use nexa_core::{
    ConnectionType, Device, DeviceRole, RelayRoute, TopologyError, DEFAULT_EXPANSION_INTERVAL,
};
use nexa_network::{
    DeviceDiscovery, DiscoveryBeacon, DiscoveryResponse, NetworkError, NetworkManager,
};

use crate::routes::RouteTable;
use crate::{RelayError, Result};

/// Command name carried to the intermediate device
pub const RELAY_COMMAND: &str = "relay_message";

/// Discovery events buffered before the consumer falls behind
const DISCOVERY_EVENT_QUEUE: usize = 64;

#[derive(Debug, Clone)]
pub struct ExpansionConfig {
    /// Auto-heal tick
    pub interval: Duration,
    /// Link types announced in our beacon and tried, in order, on new peers
    pub supported_connections: Vec<ConnectionType>,
    /// Link type recorded for relay legs
    pub relay_connection_type: ConnectionType,
}

impl Default for ExpansionConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_EXPANSION_INTERVAL,
            supported_connections: vec![
                ConnectionType::Wifi,
                ConnectionType::Bluetooth,
                ConnectionType::WifiDirect,
                ConnectionType::Mesh,
            ],
            relay_connection_type: ConnectionType::Mesh,
        }
    }
}

/// Relay routes and topology healing on top of a [`NetworkManager`]
pub struct ExpansionManager {
    network: Arc<NetworkManager>,
    discovery: Option<Arc<DeviceDiscovery>>,
    local_device: Device,
    config: ExpansionConfig,
    routes: RwLock<RouteTable>,
    loop_stop: Mutex<Option<watch::Sender<bool>>>,
    discovery_task: Mutex<Option<JoinHandle<()>>>,
}

impl ExpansionManager {
    pub fn new(network: Arc<NetworkManager>, local_device: Device, config: ExpansionConfig) -> Self {
        Self {
            network,
            discovery: None,
            local_device,
            config,
            routes: RwLock::new(RouteTable::new()),
            loop_stop: Mutex::new(None),
            discovery_task: Mutex::new(None),
        }
    }

    pub fn with_discovery(mut self, discovery: Arc<DeviceDiscovery>) -> Self {
        self.discovery = Some(discovery);
        self
    }

    pub fn network(&self) -> &Arc<NetworkManager> {
        &self.network
    }

    pub fn discovery(&self) -> Option<&Arc<DeviceDiscovery>> {
        self.discovery.as_ref()
    }

    /// Start discovery and the auto-heal loop.
    ///
    /// A discovery bind failure is logged and discovery stays off; the rest
    /// of the node keeps running.
    pub async fn start(self: &Arc<Self>) {
        if let Some(discovery) = &self.discovery {
            let (tx, rx) = mpsc::channel(DISCOVERY_EVENT_QUEUE);
            discovery.set_event_sender(tx);
            match discovery.start() {
                Ok(addr) => {
                    let task = tokio::spawn(consume_discoveries(Arc::downgrade(self), rx));
                    *self.discovery_task.lock() = Some(task);
                    debug!("Expansion consuming discovery events from {}", addr);
                    if let Err(e) = self.broadcast_discovery().await {
                        warn!("Initial discovery broadcast failed: {}", e);
                    }
                }
                Err(e) => warn!("Discovery disabled: {}", e),
            }
        }
        self.start_loop();
        info!("Network expansion started");
    }

    fn start_loop(self: &Arc<Self>) {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        {
            let mut slot = self.loop_stop.lock();
            if slot.is_some() {
                return;
            }
            *slot = Some(stop_tx);
        }
        let manager = Arc::downgrade(self);
        let period = self.config.interval.max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    _ = ticker.tick() => {
                        let Some(manager) = manager.upgrade() else { break };
                        let healed = manager.maintain().await;
                        if !healed.is_empty() {
                            info!("Auto-heal created {} relay route(s)", healed.len());
                        }
                    }
                }
            }
            debug!("Expansion loop stopped");
        });
    }

    /// Stop the loop and discovery. Safe to call repeatedly.
    pub fn stop(&self) {
        if let Some(tx) = self.loop_stop.lock().take() {
            let _ = tx.send(true);
        }
        if let Some(task) = self.discovery_task.lock().take() {
            task.abort();
        }
        if let Some(discovery) = &self.discovery {
            discovery.stop();
        }
    }

    pub fn is_running(&self) -> bool {
        self.loop_stop.lock().is_some()
    }

    /// Register a newly discovered peer and connect over the first link
    /// type that works. Returns the connected device, if any.
    pub async fn on_device_discovered(&self, response: DiscoveryResponse) -> Result<Option<Device>> {
        let device = response.to_device();
        let id = device.id.clone();
        match self.network.register_device(device) {
            Ok(()) => {}
            Err(NetworkError::Topology(TopologyError::DuplicateDevice(_))) => {
                debug!("Discovered device {} already registered", id);
            }
            Err(e) => return Err(e.into()),
        }
        if self.network.handler(&id).is_some_and(|h| h.is_connected()) {
            return Ok(self.network.get_device(&id));
        }

        let mut candidates = response.beacon.supported_connections.clone();
        if candidates.is_empty() {
            candidates.push(ConnectionType::default());
        }
        for connection_type in candidates {
            match self.network.connect_device(&id, connection_type).await {
                Ok(device) => {
                    info!("Connected to discovered device {} via {}", id, connection_type);
                    return Ok(Some(device));
                }
                Err(e) => debug!("Connecting {} via {} failed: {}", id, connection_type, e),
            }
        }
        warn!("Could not connect to discovered device {}", id);
        Ok(None)
    }

    /// Record a route from `source_id` to `target_id` through `intermediate_id`.
    ///
    /// All three devices must exist, otherwise nothing is recorded. If a
    /// backing connection cannot be created the route is still recorded,
    /// inactive, and `ConnectionsFailed` tells the caller to retry or remove it.
    pub fn create_relay_route(
        &self,
        source_id: &str,
        target_id: &str,
        intermediate_id: &str,
        priority: i32,
    ) -> Result<RelayRoute> {
        if intermediate_id == source_id || intermediate_id == target_id {
            return Err(RelayError::InvalidRoute(
                "intermediate must differ from source and target".to_string(),
            ));
        }
        if source_id == target_id {
            return Err(RelayError::InvalidRoute(
                "source and target must differ".to_string(),
            ));
        }
        for id in [source_id, target_id, intermediate_id] {
            if self.network.get_device(id).is_none() {
                return Err(RelayError::DeviceNotFound(id.to_string()));
            }
        }

        let route_id = format!("relay-{}", uuid::Uuid::new_v4());
        let mut route = RelayRoute::new(&route_id, source_id, target_id, intermediate_id, priority);
        let mut failures = Vec::new();
        for (from, to) in [(source_id, intermediate_id), (intermediate_id, target_id)] {
            match self
                .network
                .create_connection(from, to, self.config.relay_connection_type)
            {
                Ok(conn) => route.connection_ids.push(conn.id),
                Err(e) => failures.push(format!("{} -> {}: {}", from, to, e)),
            }
        }
        route.active = failures.is_empty();
        self.routes.write().insert(route.clone());

        if failures.is_empty() {
            info!(
                "Created relay route {}: {} -> {} -> {} (priority {})",
                route_id, source_id, intermediate_id, target_id, priority
            );
            Ok(route)
        } else {
            warn!("Relay route {} incomplete: {}", route_id, failures.join("; "));
            Err(RelayError::ConnectionsFailed {
                route_id,
                reason: failures.join("; "),
            })
        }
    }

    /// Remove a route and the connections backing it
    pub fn remove_relay_route(&self, route_id: &str) -> Result<RelayRoute> {
        let route = self
            .routes
            .write()
            .remove(route_id)
            .ok_or_else(|| RelayError::RouteNotFound(route_id.to_string()))?;
        for conn_id in &route.connection_ids {
            if let Err(e) = self.network.remove_connection(conn_id) {
                debug!("Connection {} of route {} already gone: {}", conn_id, route_id, e);
            }
        }
        info!("Removed relay route {}", route_id);
        Ok(route)
    }

    pub fn relay_route(&self, route_id: &str) -> Option<RelayRoute> {
        self.routes.read().get(route_id).cloned()
    }

    pub fn relay_routes(&self) -> Vec<RelayRoute> {
        self.routes.read().list()
    }

    /// Ask the route's intermediate to forward `payload` to the target
    pub async fn relay_message(&self, route_id: &str, payload: serde_json::Value) -> Result<()> {
        let route = self
            .relay_route(route_id)
            .ok_or_else(|| RelayError::RouteNotFound(route_id.to_string()))?;
        if !route.active {
            return Err(RelayError::RouteInactive(route_id.to_string()));
        }
        let mut args = HashMap::new();
        args.insert("route_id".to_string(), serde_json::json!(route.id));
        args.insert("source_id".to_string(), serde_json::json!(route.source_id));
        args.insert("target_id".to_string(), serde_json::json!(route.target_id));
        args.insert("payload".to_string(), payload);
        self.network
            .send_command_to_device(&route.intermediate_id, RELAY_COMMAND, args)
            .await?;
        Ok(())
    }

    /// One auto-heal pass. Returns the routes created.
    pub async fn maintain(&self) -> Vec<RelayRoute> {
        let topology = self.network.get_topology();
        let Some(primary) = topology.primary_base() else {
            return Vec::new();
        };

        let mut gateways: Vec<&Device> = topology
            .devices
            .values()
            .filter(|d| d.role == DeviceRole::Gateway && d.online)
            .filter(|d| topology.active_connection_count(&d.id) > 0)
            .collect();
        gateways.sort_by(|a, b| a.id.cmp(&b.id));

        let mut isolated: Vec<&Device> = topology.isolated_devices();
        isolated.sort_by(|a, b| a.id.cmp(&b.id));

        let mut created = Vec::new();
        for device in isolated {
            let Some(gateway) = gateways.iter().find(|g| g.id != device.id) else {
                debug!("No gateway available to heal {}", device.id);
                continue;
            };
            match self.create_relay_route(&device.id, &primary.id, &gateway.id, 1) {
                Ok(route) => created.push(route),
                Err(e) => warn!("Auto-heal for {} failed: {}", device.id, e),
            }
        }
        created
    }

    /// Announce the local device on the discovery channel
    pub async fn broadcast_discovery(&self) -> Result<()> {
        let discovery = self
            .discovery
            .as_ref()
            .ok_or(NetworkError::NotRunning("discovery"))?;
        let beacon =
            DiscoveryBeacon::from_device(&self.local_device, self.config.supported_connections.clone());
        discovery.broadcast(&beacon).await?;
        Ok(())
    }

    /// Topology, routes, stats and discovered peers as one JSON document
    pub fn serialize_network_state(&self) -> serde_json::Value {
        let discovered = self
            .discovery
            .as_ref()
            .map(|d| d.discovered_devices())
            .unwrap_or_default();
        serde_json::json!({
            "local_device": self.local_device,
            "topology": self.network.get_topology(),
            "relay_routes": self.relay_routes(),
            "stats": self.network.network_stats(),
            "discovered": discovered,
        })
    }
}

async fn consume_discoveries(
    manager: Weak<ExpansionManager>,
    mut rx: mpsc::Receiver<DiscoveryResponse>,
) {
    while let Some(response) = rx.recv().await {
        let Some(manager) = manager.upgrade() else { break };
        let id = response.beacon.device_id.clone();
        if let Err(e) = manager.on_device_discovered(response).await {
            warn!("Handling discovered device {} failed: {}", id, e);
        }
    }
}
