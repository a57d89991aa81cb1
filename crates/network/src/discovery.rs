//! UDP device discovery
//!
//! Devices announce themselves with a JSON beacon sent to the broadcast
//! address. The listener keeps the latest response per device id and emits
//! an event the first time a device is seen.
//!
//! Discovery is unauthenticated: anything on the broadcast domain can
//! announce itself.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

use nexa_core::{unix_now, ConnectionType, Device, DeviceRole, DEFAULT_DISCOVERY_PORT};

use crate::socket::bind_udp;
use crate::{NetworkError, Result};

/// Largest datagram read
const DISCOVERY_BUFFER_SIZE: usize = 4096;
/// How often the listener wakes up to check for shutdown
const READ_DEADLINE: Duration = Duration::from_secs(5);

/// Announcement sent by a device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryBeacon {
    pub device_id: String,
    pub device_name: String,
    pub role: DeviceRole,
    #[serde(default)]
    pub mac: String,
    pub ip_address: String,
    pub port: u16,
    #[serde(default)]
    pub supported_connections: Vec<ConnectionType>,
    pub timestamp: u64,
}

impl DiscoveryBeacon {
    pub fn from_device(device: &Device, supported_connections: Vec<ConnectionType>) -> Self {
        Self {
            device_id: device.id.clone(),
            device_name: device.name.clone(),
            role: device.role,
            mac: device.mac.clone(),
            ip_address: device.ip.clone(),
            port: device.port,
            supported_connections,
            timestamp: unix_now(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// A received beacon plus what the listener inferred about it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryResponse {
    #[serde(flatten)]
    pub beacon: DiscoveryBeacon,
    pub signal_strength: i32,
    pub received_at: u64,
}

impl DiscoveryResponse {
    /// Device entry for the topology
    pub fn to_device(&self) -> Device {
        let b = &self.beacon;
        let mut device = Device::new(&b.device_id, &b.device_name, b.role, &b.ip_address, b.port)
            .with_mac(&b.mac);
        if let Some(first) = b.supported_connections.first() {
            device.connection_type = *first;
        }
        device.set_signal_strength(self.signal_strength);
        device
    }
}

/// Coarse signal estimate from addressing alone.
///
/// Loopback reads as strongest, then same /24, then private ranges.
pub fn estimate_signal_strength(local: Option<IpAddr>, peer: IpAddr) -> i32 {
    if peer.is_loopback() {
        return 100;
    }
    if let (Some(IpAddr::V4(local)), IpAddr::V4(peer)) = (local, peer) {
        if local.octets()[..3] == peer.octets()[..3] {
            return 75;
        }
    }
    match peer {
        IpAddr::V4(v4) if v4.is_private() || v4.is_link_local() => 50,
        _ => 25,
    }
}

/// Estimated distance in metres for a signal strength
pub fn estimate_distance(signal_strength: i32) -> f64 {
    match signal_strength {
        s if s >= 80 => 5.0,
        s if s >= 60 => 20.0,
        s if s >= 40 => 50.0,
        _ => 100.0,
    }
}

/// Whether a device with this signal is within `radius` metres
pub fn is_within_radius(signal_strength: i32, radius: f64) -> bool {
    estimate_distance(signal_strength) <= radius
}

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Listen port; 0 picks an ephemeral port
    pub port: u16,
    /// Destination for outgoing beacons
    pub broadcast_addr: IpAddr,
    /// Own address, used for the signal heuristic
    pub local_ip: Option<IpAddr>,
    /// Beacons carrying this id are ignored
    pub local_device_id: Option<String>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_DISCOVERY_PORT,
            broadcast_addr: IpAddr::V4(Ipv4Addr::BROADCAST),
            local_ip: None,
            local_device_id: None,
        }
    }
}

type DiscoveredMap = Arc<RwLock<HashMap<String, DiscoveryResponse>>>;

/// UDP beacon listener and sender
pub struct DeviceDiscovery {
    config: DiscoveryConfig,
    socket: Mutex<Option<Arc<UdpSocket>>>,
    discovered: DiscoveredMap,
    event_tx: Mutex<Option<mpsc::Sender<DiscoveryResponse>>>,
    stop_tx: Mutex<Option<watch::Sender<bool>>>,
}

impl DeviceDiscovery {
    pub fn new(config: DiscoveryConfig) -> Self {
        Self {
            config,
            socket: Mutex::new(None),
            discovered: Arc::new(RwLock::new(HashMap::new())),
            event_tx: Mutex::new(None),
            stop_tx: Mutex::new(None),
        }
    }

    /// Receive each newly seen device on `tx`.
    ///
    /// Events are dropped when the channel is full; the listener never waits
    /// on the receiver.
    pub fn set_event_sender(&self, tx: mpsc::Sender<DiscoveryResponse>) {
        *self.event_tx.lock() = Some(tx);
    }

    pub fn is_running(&self) -> bool {
        self.socket.lock().is_some()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.lock().as_ref().and_then(|s| s.local_addr().ok())
    }

    /// Bind the listener and spawn the receive loop
    pub fn start(&self) -> Result<SocketAddr> {
        if let Some(addr) = self.local_addr() {
            return Ok(addr);
        }
        let bind_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), self.config.port);
        let socket = Arc::new(bind_udp(bind_addr, true)?);
        let local_addr = socket.local_addr()?;

        let (stop_tx, stop_rx) = watch::channel(false);
        *self.stop_tx.lock() = Some(stop_tx);
        *self.socket.lock() = Some(socket.clone());

        let listener = Listener {
            socket,
            discovered: self.discovered.clone(),
            event_tx: self.event_tx.lock().clone(),
            local_ip: self.config.local_ip,
            local_device_id: self.config.local_device_id.clone(),
        };
        tokio::spawn(listener.run(stop_rx));

        info!("Discovery listening on {}", local_addr);
        Ok(local_addr)
    }

    /// Stop the listener. Safe to call repeatedly.
    pub fn stop(&self) {
        if let Some(tx) = self.stop_tx.lock().take() {
            let _ = tx.send(true);
        }
        if self.socket.lock().take().is_some() {
            info!("Discovery stopped");
        }
    }

    /// Send a beacon to the broadcast address on the listen port
    pub async fn broadcast(&self, beacon: &DiscoveryBeacon) -> Result<()> {
        let socket = self
            .socket
            .lock()
            .clone()
            .ok_or(NetworkError::NotRunning("discovery"))?;
        let port = socket.local_addr()?.port();
        let target = SocketAddr::new(self.config.broadcast_addr, port);
        let payload = beacon.to_bytes()?;
        socket.send_to(&payload, target).await?;
        debug!("Broadcast beacon for {} to {}", beacon.device_id, target);
        Ok(())
    }

    pub fn discovered_devices(&self) -> Vec<DiscoveryResponse> {
        self.discovered.read().values().cloned().collect()
    }

    pub fn discovered_device(&self, id: &str) -> Option<DiscoveryResponse> {
        self.discovered.read().get(id).cloned()
    }

    pub fn clear_discovered(&self) {
        self.discovered.write().clear();
    }

    /// Devices whose estimated distance is within `radius` metres
    pub fn devices_within(&self, radius: f64) -> Vec<DiscoveryResponse> {
        self.discovered
            .read()
            .values()
            .filter(|r| is_within_radius(r.signal_strength, radius))
            .cloned()
            .collect()
    }
}

impl Drop for DeviceDiscovery {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Listener {
    socket: Arc<UdpSocket>,
    discovered: DiscoveredMap,
    event_tx: Option<mpsc::Sender<DiscoveryResponse>>,
    local_ip: Option<IpAddr>,
    local_device_id: Option<String>,
}

impl Listener {
    async fn run(self, mut stop_rx: watch::Receiver<bool>) {
        let mut buf = vec![0u8; DISCOVERY_BUFFER_SIZE];
        loop {
            tokio::select! {
                _ = stop_rx.changed() => break,
                received = tokio::time::timeout(READ_DEADLINE, self.socket.recv_from(&mut buf)) => {
                    match received {
                        Err(_) => continue,
                        Ok(Ok((len, from))) => self.handle_datagram(&buf[..len], from),
                        Ok(Err(e)) => {
                            warn!("Discovery receive error: {}", e);
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    }
                }
            }
        }
        debug!("Discovery listener exited");
    }

    fn handle_datagram(&self, data: &[u8], from: SocketAddr) {
        let beacon = match DiscoveryBeacon::from_bytes(data) {
            Ok(b) => b,
            Err(_) => {
                trace!("Dropping non-beacon datagram from {}", from);
                return;
            }
        };
        if self.local_device_id.as_deref() == Some(beacon.device_id.as_str()) {
            return;
        }

        let response = DiscoveryResponse {
            signal_strength: estimate_signal_strength(self.local_ip, from.ip()),
            received_at: unix_now(),
            beacon,
        };
        let id = response.beacon.device_id.clone();
        let is_new = self
            .discovered
            .write()
            .insert(id.clone(), response.clone())
            .is_none();

        if is_new {
            info!("Discovered device {} at {}", id, from);
            if let Some(tx) = &self.event_tx {
                if let Err(e) = tx.try_send(response) {
                    warn!("Dropping discovery event for {}: {}", id, e);
                }
            }
        }
    }
}
