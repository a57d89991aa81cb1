//! Network Manager
//!
//! Owns the topology and the live connection handlers. All topology access
//! goes through [`SharedTopology`], which only exposes closure-scoped lock
//! guards so no caller can hold the lock across an await point.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use nexa_core::{
    unix_now, ConnectionType, Device, DeviceConnection, DeviceRole, NetworkTopology,
    TopologyStats, DEFAULT_HEALTH_TIMEOUT, DEFAULT_MONITOR_INTERVAL,
};

use crate::connection::{ConnectionConfig, ConnectionHandler, DeviceStatusSink};
use crate::protocol::Envelope;
use crate::{NetworkError, Result};

/// Event channel depth
const EVENT_CHANNEL_SIZE: usize = 64;

/// Topology behind a single read-write lock
#[derive(Clone, Default)]
pub struct SharedTopology(Arc<RwLock<NetworkTopology>>);

impl SharedTopology {
    pub fn new(topology: NetworkTopology) -> Self {
        Self(Arc::new(RwLock::new(topology)))
    }

    pub fn read<R>(&self, f: impl FnOnce(&NetworkTopology) -> R) -> R {
        f(&self.0.read())
    }

    pub fn write<R>(&self, f: impl FnOnce(&mut NetworkTopology) -> R) -> R {
        f(&mut self.0.write())
    }

    /// Copy of the whole topology
    pub fn snapshot(&self) -> NetworkTopology {
        self.0.read().clone()
    }
}

impl DeviceStatusSink for SharedTopology {
    fn set_online(&self, device_id: &str, online: bool) {
        self.write(|t| {
            if !t.set_online(device_id, online) {
                debug!("Status update for unknown device {}", device_id);
            }
        });
    }

    fn record_latency(&self, device_id: &str, latency: Duration) {
        self.write(|t| {
            let _ = t.update_device(device_id, |d| {
                d.metrics.latency_ms = latency.as_secs_f64() * 1000.0;
                d.metrics.last_activity = unix_now();
            });
        });
    }

    fn record_error_rate(&self, device_id: &str, error_rate: f64) {
        self.write(|t| {
            let _ = t.update_device(device_id, |d| {
                d.metrics.error_rate = error_rate;
                d.metrics.last_activity = unix_now();
            });
        });
    }
}

/// Device lifecycle notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkEvent {
    DeviceConnected(String),
    DeviceDisconnected(String),
    /// Dropped by the health monitor
    DeviceEvicted(String),
}

/// Health monitor timing
#[derive(Debug, Clone, Copy)]
pub struct MonitorConfig {
    pub interval: Duration,
    /// Handlers idle longer than this are evicted
    pub timeout: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_MONITOR_INTERVAL,
            timeout: DEFAULT_HEALTH_TIMEOUT,
        }
    }
}

/// Topology counters plus live session count
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkStats {
    #[serde(flatten)]
    pub topology: TopologyStats,
    pub live_sessions: usize,
    pub service_count: usize,
}

/// Orchestrates topology, handlers and health monitoring
pub struct NetworkManager {
    topology: SharedTopology,
    handlers: RwLock<HashMap<String, Arc<ConnectionHandler>>>,
    config: ConnectionConfig,
    monitor_config: MonitorConfig,
    monitor_stop: Mutex<Option<watch::Sender<bool>>>,
    events: broadcast::Sender<NetworkEvent>,
    id_counter: AtomicU64,
}

impl NetworkManager {
    pub fn new(config: ConnectionConfig) -> Self {
        Self::with_monitor(config, MonitorConfig::default())
    }

    pub fn with_monitor(config: ConnectionConfig, monitor_config: MonitorConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        Self {
            topology: SharedTopology::new(NetworkTopology::new()),
            handlers: RwLock::new(HashMap::new()),
            config,
            monitor_config,
            monitor_stop: Mutex::new(None),
            events,
            id_counter: AtomicU64::new(0),
        }
    }

    /// Id used for this node on the wire
    pub fn local_id(&self) -> &str {
        &self.config.local_id
    }

    pub fn connection_config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Subscribe to device lifecycle events.
    ///
    /// Receivers must keep up; a lagging receiver loses the oldest events.
    pub fn subscribe(&self) -> broadcast::Receiver<NetworkEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: NetworkEvent) {
        let _ = self.events.send(event);
    }

    pub fn register_primary_base(&self, device: Device) -> Result<()> {
        let id = device.id.clone();
        self.topology.write(|t| t.register_primary_base(device))?;
        info!("Registered primary base {}", id);
        Ok(())
    }

    /// Fails on a duplicate id without touching the existing entry
    pub fn register_device(&self, device: Device) -> Result<()> {
        let id = device.id.clone();
        let role = device.role;
        self.topology.write(|t| t.register_device(device))?;
        info!("Registered device {} ({})", id, role);
        Ok(())
    }

    /// Explicitly remove a device, closing its session first
    pub async fn remove_device(&self, id: &str) -> Result<Device> {
        let handler = self.handlers.write().remove(id);
        if let Some(handler) = handler {
            handler.disconnect().await;
            self.emit(NetworkEvent::DeviceDisconnected(id.to_string()));
        }
        let device = self.topology.write(|t| t.remove_device(id))?;
        info!("Removed device {}", id);
        Ok(device)
    }

    pub fn get_device(&self, id: &str) -> Option<Device> {
        self.topology.read(|t| t.device(id).cloned())
    }

    /// Open a session to a registered device and start its heartbeat
    pub async fn connect_device(&self, id: &str, connection_type: ConnectionType) -> Result<Device> {
        let device = self
            .get_device(id)
            .ok_or_else(|| nexa_core::TopologyError::DeviceNotFound(id.to_string()))?;

        let existing = self.handlers.read().get(id).cloned();
        if let Some(handler) = existing {
            if handler.is_connected() && handler.connection_type() == connection_type {
                return Ok(device);
            }
            self.handlers.write().remove(id);
            handler.disconnect().await;
        }

        let config = ConnectionConfig {
            connection_type,
            ..self.config.clone()
        };
        let sink: Arc<dyn DeviceStatusSink> = Arc::new(self.topology.clone());
        let handler = ConnectionHandler::new(&device, config, sink);
        handler.connect().await?;
        handler.start_heartbeat();

        let replaced = self.handlers.write().insert(id.to_string(), handler);
        if let Some(old) = replaced {
            old.disconnect().await;
        }
        self.topology.write(|t| {
            let _ = t.update_device(id, |d| d.connection_type = connection_type);
        });
        self.emit(NetworkEvent::DeviceConnected(id.to_string()));

        self.get_device(id)
            .ok_or_else(|| NetworkError::Topology(nexa_core::TopologyError::DeviceNotFound(id.to_string())))
    }

    pub async fn disconnect_device(&self, id: &str) -> Result<()> {
        let handler = self
            .handlers
            .write()
            .remove(id)
            .ok_or_else(|| NetworkError::NotConnected(id.to_string()))?;
        handler.disconnect().await;
        self.topology.set_online(id, false);
        self.emit(NetworkEvent::DeviceDisconnected(id.to_string()));
        Ok(())
    }

    pub fn handler(&self, id: &str) -> Option<Arc<ConnectionHandler>> {
        self.handlers.read().get(id).cloned()
    }

    /// Ids of devices with a live session
    pub fn connected_handler_ids(&self) -> Vec<String> {
        self.handlers
            .read()
            .iter()
            .filter(|(_, h)| h.is_connected())
            .map(|(id, _)| id.clone())
            .collect()
    }

    fn next_connection_id(&self, source: &str, target: &str) -> String {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let seq = self.id_counter.fetch_add(1, Ordering::Relaxed);
        let mut hasher = Sha256::new();
        hasher.update(source.as_bytes());
        hasher.update(b"|");
        hasher.update(target.as_bytes());
        hasher.update(b"|");
        hasher.update(nanos.to_le_bytes());
        hasher.update(seq.to_le_bytes());
        hex::encode(&hasher.finalize()[..16])
    }

    /// Record a logical edge. Fails with no side effects if an endpoint is unknown.
    pub fn create_connection(
        &self,
        source_id: &str,
        target_id: &str,
        connection_type: ConnectionType,
    ) -> Result<DeviceConnection> {
        let id = self.next_connection_id(source_id, target_id);
        let connection = DeviceConnection::new(id, source_id, target_id, connection_type);
        self.topology.write(|t| t.add_connection(connection.clone()))?;
        debug!(
            "Created connection {} ({} -> {} via {})",
            connection.id, source_id, target_id, connection_type
        );
        Ok(connection)
    }

    pub fn remove_connection(&self, id: &str) -> Result<DeviceConnection> {
        let connection = self.topology.write(|t| t.remove_connection(id))?;
        debug!("Removed connection {}", id);
        Ok(connection)
    }

    /// Send a command envelope over the device's session
    pub async fn send_command_to_device(
        &self,
        id: &str,
        command: &str,
        args: HashMap<String, serde_json::Value>,
    ) -> Result<()> {
        let handler = self
            .handler(id)
            .ok_or_else(|| NetworkError::NotConnected(id.to_string()))?;
        handler
            .send_message(&Envelope::command(id, command, args))
            .await
    }

    /// Send `payload` to every connected device.
    ///
    /// Returns the number of devices reached. If any send fails, every
    /// failure is reported together in [`NetworkError::BroadcastFailed`].
    pub async fn broadcast_message<T: Serialize + Sync>(&self, payload: &T) -> Result<usize> {
        let handlers: Vec<_> = self
            .handlers
            .read()
            .iter()
            .map(|(id, h)| (id.clone(), h.clone()))
            .collect();

        let sends = handlers.iter().map(|(id, handler)| async move {
            (id.clone(), handler.send_message(payload).await)
        });
        let results = futures::future::join_all(sends).await;

        let total = results.len();
        let failures: Vec<(String, String)> = results
            .into_iter()
            .filter_map(|(id, result)| result.err().map(|e| (id, e.to_string())))
            .collect();

        if failures.is_empty() {
            Ok(total)
        } else {
            warn!("Broadcast failed for {}/{} devices", failures.len(), total);
            Err(NetworkError::BroadcastFailed { failures })
        }
    }

    /// Copy of the topology; never the live maps
    pub fn get_topology(&self) -> NetworkTopology {
        self.topology.snapshot()
    }

    pub fn connected_devices(&self) -> Vec<Device> {
        self.topology
            .read(|t| t.connected_devices().into_iter().cloned().collect())
    }

    pub fn devices_by_role(&self, role: DeviceRole) -> Vec<Device> {
        self.topology
            .read(|t| t.devices_by_role(role).into_iter().cloned().collect())
    }

    /// Publish metrics for an external service
    pub fn update_service_metrics(&self, service: &str, metrics: HashMap<String, f64>) {
        self.topology.write(|t| t.set_service_metrics(service, metrics));
    }

    /// Update a device's signal estimate
    pub fn update_signal_strength(&self, id: &str, strength: i32) -> Result<()> {
        self.topology
            .write(|t| t.update_device(id, |d| d.set_signal_strength(strength)))?;
        Ok(())
    }

    pub fn network_stats(&self) -> NetworkStats {
        let (topology, service_count) =
            self.topology.read(|t| (t.stats(), t.service_metrics.len()));
        NetworkStats {
            topology,
            live_sessions: self.connected_handler_ids().len(),
            service_count,
        }
    }

    /// Evict every handler idle longer than the health timeout at `now`.
    ///
    /// Returns the evicted device ids. Other devices are left untouched.
    pub async fn check_device_health(&self, now: Instant) -> Vec<String> {
        let timeout = self.monitor_config.timeout;
        let stale: Vec<(String, Arc<ConnectionHandler>)> = {
            let mut handlers = self.handlers.write();
            let ids: Vec<String> = handlers
                .iter()
                .filter(|(_, h)| h.idle_for(now) > timeout)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| handlers.remove(&id).map(|h| (id, h)))
                .collect()
        };

        let mut evicted = Vec::with_capacity(stale.len());
        for (id, handler) in stale {
            handler.disconnect().await;
            self.topology.set_online(&id, false);
            info!("Device {} timed out, marked offline", id);
            self.emit(NetworkEvent::DeviceEvicted(id.clone()));
            evicted.push(id);
        }
        evicted
    }

    /// Start the periodic health monitor. A second call is a no-op.
    pub fn start_monitoring(self: &Arc<Self>) {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        {
            let mut slot = self.monitor_stop.lock();
            if slot.is_some() {
                return;
            }
            *slot = Some(stop_tx);
        }

        let manager = Arc::downgrade(self);
        let period = self.monitor_config.interval.max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    _ = ticker.tick() => {
                        let Some(manager) = manager.upgrade() else { break };
                        let evicted = manager.check_device_health(Instant::now()).await;
                        if !evicted.is_empty() {
                            debug!("Health check evicted {:?}", evicted);
                        }
                    }
                }
            }
            debug!("Health monitor stopped");
        });
        info!("Health monitor started ({:?} interval)", period);
    }

    /// Safe to call repeatedly
    pub fn stop_monitoring(&self) {
        if let Some(tx) = self.monitor_stop.lock().take() {
            let _ = tx.send(true);
            info!("Health monitor stopped");
        }
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitor_stop.lock().is_some()
    }

    /// Stop monitoring and close every session
    pub async fn shutdown(&self) {
        self.stop_monitoring();
        let handlers: Vec<_> = self.handlers.write().drain().collect();
        for (id, handler) in handlers {
            handler.disconnect().await;
            self.topology.set_online(&id, false);
        }
    }

    /// Status sink writing into this manager's topology
    pub fn status_sink(&self) -> Arc<dyn DeviceStatusSink> {
        Arc::new(self.topology.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn node(id: &str, port: u16) -> Device {
        Device::new(id, id, DeviceRole::Node, "127.0.0.1", port)
    }

    fn test_config() -> ConnectionConfig {
        ConnectionConfig {
            local_id: "manager".to_string(),
            timeout: Duration::from_secs(2),
            max_retries: 1,
            heartbeat_interval: Duration::from_secs(60),
            reconnect_wait: Duration::from_millis(10),
            ..Default::default()
        }
    }

    /// Accepts connections and keeps them open until the test ends
    async fn spawn_peer() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });
        port
    }

    #[test]
    fn test_register_and_get_device() {
        let manager = NetworkManager::new(test_config());
        manager.register_device(node("a", 1)).unwrap();
        assert_eq!(manager.get_device("a").unwrap().id, "a");
        assert!(manager.get_device("b").is_none());
    }

    #[test]
    fn test_primary_base() {
        let manager = NetworkManager::new(test_config());
        manager.register_primary_base(node("base", 1413)).unwrap();
        let topo = manager.get_topology();
        assert_eq!(topo.primary_base().unwrap().id, "base");
        assert_eq!(manager.devices_by_role(DeviceRole::PrimaryBase).len(), 1);
    }

    #[test]
    fn test_create_connection_ids_unique() {
        let manager = NetworkManager::new(test_config());
        manager.register_device(node("a", 1)).unwrap();
        manager.register_device(node("b", 2)).unwrap();

        let mut ids = std::collections::HashSet::new();
        for _ in 0..50 {
            let conn = manager.create_connection("a", "b", ConnectionType::Mesh).unwrap();
            assert_eq!(conn.id.len(), 32);
            assert!(ids.insert(conn.id));
        }
        assert_eq!(manager.get_topology().connections.len(), 50);
    }

    #[test]
    fn test_remove_connection() {
        let manager = NetworkManager::new(test_config());
        manager.register_device(node("a", 1)).unwrap();
        manager.register_device(node("b", 2)).unwrap();
        let conn = manager.create_connection("a", "b", ConnectionType::Wifi).unwrap();
        manager.remove_connection(&conn.id).unwrap();
        assert!(manager.get_topology().connections.is_empty());
    }

    #[test]
    fn test_topology_snapshot_is_a_copy() {
        let manager = NetworkManager::new(test_config());
        manager.register_device(node("a", 1)).unwrap();
        let mut snapshot = manager.get_topology();
        snapshot.devices.clear();
        assert!(manager.get_device("a").is_some());
    }

    #[test]
    fn test_service_metrics_and_stats() {
        let manager = NetworkManager::new(test_config());
        manager.register_device(node("a", 1)).unwrap();
        let mut metrics = HashMap::new();
        metrics.insert("active_records".to_string(), 3.0);
        manager.update_service_metrics("dns", metrics);

        let stats = manager.network_stats();
        assert_eq!(stats.topology.total_devices, 1);
        assert_eq!(stats.service_count, 1);
        assert_eq!(stats.live_sessions, 0);

        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["total_devices"], 1);
    }

    #[tokio::test]
    async fn test_connect_and_disconnect_device() {
        let port = spawn_peer().await;
        let manager = NetworkManager::new(test_config());
        manager.register_device(node("a", port)).unwrap();
        let mut events = manager.subscribe();

        let device = manager.connect_device("a", ConnectionType::Mesh).await.unwrap();
        assert!(device.online);
        assert_eq!(device.connection_type, ConnectionType::Mesh);
        assert_eq!(events.recv().await.unwrap(), NetworkEvent::DeviceConnected("a".into()));
        assert_eq!(manager.connected_devices().len(), 1);

        manager.disconnect_device("a").await.unwrap();
        assert!(!manager.get_device("a").unwrap().online);
        assert_eq!(events.recv().await.unwrap(), NetworkEvent::DeviceDisconnected("a".into()));
    }

    #[tokio::test]
    async fn test_send_command() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let manager = NetworkManager::new(test_config());
        manager.register_device(node("a", port)).unwrap();
        manager.connect_device("a", ConnectionType::Wifi).await.unwrap();
        let (socket, _) = listener.accept().await.unwrap();
        let mut reader = crate::protocol::FrameReader::new(socket);

        let mut args = HashMap::new();
        args.insert("mode".to_string(), serde_json::json!("fast"));
        manager.send_command_to_device("a", "reboot", args).await.unwrap();

        let frame = reader.read_frame().await.unwrap();
        match Envelope::from_bytes(&frame).unwrap() {
            Envelope::Command(cmd) => {
                assert_eq!(cmd.command, "reboot");
                assert_eq!(cmd.args["mode"], "fast");
            }
            other => panic!("unexpected envelope {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_session() {
        let manager = NetworkManager::new(test_config());
        for id in ["a", "b", "c"] {
            let port = spawn_peer().await;
            manager.register_device(node(id, port)).unwrap();
            manager.connect_device(id, ConnectionType::Wifi).await.unwrap();
        }
        let reached = manager
            .broadcast_message(&serde_json::json!({"hello": "all"}))
            .await
            .unwrap();
        assert_eq!(reached, 3);
    }

    #[tokio::test]
    async fn test_broadcast_with_no_sessions() {
        let manager = NetworkManager::new(test_config());
        assert_eq!(manager.broadcast_message(&"x").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_health_check_eviction_leaves_others_unchanged() {
        let manager = NetworkManager::new(test_config());
        let port = spawn_peer().await;
        manager.register_device(node("stale", port)).unwrap();
        manager.connect_device("stale", ConnectionType::Wifi).await.unwrap();

        let other_port = spawn_peer().await;
        manager.register_device(node("fresh", other_port)).unwrap();
        manager.connect_device("fresh", ConnectionType::Wifi).await.unwrap();
        manager.register_device(node("offline", 1)).unwrap();

        let stale_seen = manager.handler("stale").unwrap().last_message_time();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let fresh = manager.handler("fresh").unwrap();
        fresh.send_message(&"keepalive").await.unwrap();
        let fresh_seen = fresh.last_message_time();
        assert!(fresh_seen > stale_seen);

        // Pick a point where only "stale" has been idle past the timeout
        let timeout = Duration::from_secs(120);
        let now = stale_seen + timeout + (fresh_seen - stale_seen) / 2;
        let evicted = manager.check_device_health(now).await;

        assert_eq!(evicted, vec!["stale".to_string()]);
        assert!(!manager.get_device("stale").unwrap().online);
        assert!(manager.get_device("fresh").unwrap().online);
        assert!(!manager.get_device("offline").unwrap().online);
        assert!(manager.handler("stale").is_none());
        assert!(manager.handler("fresh").is_some());
    }

    #[tokio::test]
    async fn test_monitoring_start_stop_idempotent() {
        let manager = Arc::new(NetworkManager::with_monitor(
            test_config(),
            MonitorConfig {
                interval: Duration::from_millis(10),
                timeout: Duration::from_secs(120),
            },
        ));
        manager.start_monitoring();
        manager.start_monitoring();
        assert!(manager.is_monitoring());
        tokio::time::sleep(Duration::from_millis(30)).await;
        manager.stop_monitoring();
        manager.stop_monitoring();
        assert!(!manager.is_monitoring());
    }

    #[tokio::test]
    async fn test_concurrent_registration_no_lost_updates() {
        let manager = Arc::new(NetworkManager::new(test_config()));
        let tasks: Vec<_> = (0..32)
            .map(|i| {
                let manager = manager.clone();
                tokio::spawn(async move { manager.register_device(node(&format!("n{}", i), 1)) })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(manager.get_topology().devices.len(), 32);
    }

    #[tokio::test]
    async fn test_remove_device_closes_session() {
        let port = spawn_peer().await;
        let manager = NetworkManager::new(test_config());
        manager.register_device(node("a", port)).unwrap();
        manager.connect_device("a", ConnectionType::Wifi).await.unwrap();

        let handler = manager.handler("a").unwrap();
        manager.remove_device("a").await.unwrap();
        assert!(handler.is_closed());
        assert!(manager.get_device("a").is_none());
    }

    // ==================== NEGATIVE TESTS ====================

    #[test]
    fn test_duplicate_registration_keeps_first() {
        let manager = NetworkManager::new(test_config());
        manager.register_device(node("a", 1)).unwrap();
        let err = manager
            .register_device(Device::new("a", "other", DeviceRole::Gateway, "10.9.9.9", 2))
            .unwrap_err();
        assert!(matches!(err, NetworkError::Topology(_)));
        let kept = manager.get_device("a").unwrap();
        assert_eq!(kept.ip, "127.0.0.1");
        assert_eq!(kept.role, DeviceRole::Node);
    }

    #[test]
    fn test_second_primary_base_rejected() {
        let manager = NetworkManager::new(test_config());
        manager.register_primary_base(node("base", 1)).unwrap();
        assert!(manager.register_primary_base(node("base2", 1)).is_err());
        assert!(manager.get_device("base2").is_none());
    }

    #[test]
    fn test_create_connection_unknown_endpoint() {
        let manager = NetworkManager::new(test_config());
        manager.register_device(node("a", 1)).unwrap();
        let before = manager.get_topology();
        assert!(manager.create_connection("a", "ghost", ConnectionType::Wifi).is_err());
        assert!(manager.create_connection("ghost", "a", ConnectionType::Wifi).is_err());
        let after = manager.get_topology();
        assert!(after.connections.is_empty());
        assert_eq!(before.updated_at, after.updated_at);
    }

    #[tokio::test]
    async fn test_connect_unknown_device() {
        let manager = NetworkManager::new(test_config());
        let err = manager.connect_device("ghost", ConnectionType::Wifi).await.unwrap_err();
        assert!(matches!(err, NetworkError::Topology(_)));
    }

    #[tokio::test]
    async fn test_disconnect_without_session() {
        let manager = NetworkManager::new(test_config());
        manager.register_device(node("a", 1)).unwrap();
        assert!(matches!(
            manager.disconnect_device("a").await,
            Err(NetworkError::NotConnected(_))
        ));
    }

    #[tokio::test]
    async fn test_command_to_unconnected_device() {
        let manager = NetworkManager::new(test_config());
        manager.register_device(node("a", 1)).unwrap();
        let err = manager
            .send_command_to_device("a", "noop", HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, NetworkError::NotConnected(_)));
    }

    #[tokio::test]
    async fn test_broadcast_reports_every_failure() {
        let manager = NetworkManager::new(test_config());
        for id in ["a", "b", "c"] {
            let port = spawn_peer().await;
            manager.register_device(node(id, port)).unwrap();
            manager.connect_device(id, ConnectionType::Wifi).await.unwrap();
        }
        // Two sessions die; their handlers stay registered
        manager.handler("a").unwrap().disconnect().await;
        manager.handler("b").unwrap().disconnect().await;

        match manager.broadcast_message(&"hello").await {
            Err(NetworkError::BroadcastFailed { failures }) => {
                let mut ids: Vec<_> = failures.into_iter().map(|(id, _)| id).collect();
                ids.sort();
                assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
            }
            other => panic!("expected aggregate failure, got {:?}", other),
        }
    }
}
