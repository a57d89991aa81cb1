//! Network topology aggregate
//!
//! Holds every known device, the logical connections between them and
//! per-service metrics. Every mutation bumps `updated_at`.
//!
//! Connections whose endpoints no longer exist are kept but never counted
//! as active, so callers can always walk the edge map without checking
//! endpoint presence first.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::{unix_now, Device, DeviceConnection, DeviceRole, Result, TopologyError};

/// Summary counters over a topology snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TopologyStats {
    pub total_devices: usize,
    pub online_devices: usize,
    pub total_connections: usize,
    pub active_connections: usize,
    pub relay_capable_devices: usize,
    pub has_primary_base: bool,
    pub timestamp: u64,
}

/// In-memory graph of devices and connections
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkTopology {
    /// Id of the primary base, if one is registered
    pub primary_base_id: Option<String>,
    pub devices: HashMap<String, Device>,
    pub connections: HashMap<String, DeviceConnection>,
    /// service name -> metric name -> value
    pub service_metrics: HashMap<String, HashMap<String, f64>>,
    pub updated_at: u64,
}

impl NetworkTopology {
    pub fn new() -> Self {
        Self {
            updated_at: unix_now(),
            ..Default::default()
        }
    }

    fn touch(&mut self) {
        self.updated_at = unix_now();
    }

    /// Register the single primary base
    pub fn register_primary_base(&mut self, mut device: Device) -> Result<()> {
        device.validate()?;
        if let Some(existing) = &self.primary_base_id {
            return Err(TopologyError::PrimaryBaseExists(existing.clone()));
        }
        if self.devices.contains_key(&device.id) {
            return Err(TopologyError::DuplicateDevice(device.id));
        }
        device.role = DeviceRole::PrimaryBase;
        self.primary_base_id = Some(device.id.clone());
        self.devices.insert(device.id.clone(), device);
        self.touch();
        Ok(())
    }

    /// Register a device; fails without mutation if the id is taken
    pub fn register_device(&mut self, device: Device) -> Result<()> {
        if device.role == DeviceRole::PrimaryBase {
            return self.register_primary_base(device);
        }
        device.validate()?;
        if self.devices.contains_key(&device.id) {
            return Err(TopologyError::DuplicateDevice(device.id));
        }
        self.devices.insert(device.id.clone(), device);
        self.touch();
        Ok(())
    }

    /// Remove a device. Edges touching it are deactivated, not deleted.
    pub fn remove_device(&mut self, id: &str) -> Result<Device> {
        let device = self
            .devices
            .remove(id)
            .ok_or_else(|| TopologyError::DeviceNotFound(id.to_string()))?;
        if self.primary_base_id.as_deref() == Some(id) {
            self.primary_base_id = None;
        }
        for conn in self.connections.values_mut() {
            if conn.touches(id) {
                conn.is_active = false;
            }
        }
        self.touch();
        Ok(device)
    }

    pub fn device(&self, id: &str) -> Option<&Device> {
        self.devices.get(id)
    }

    pub fn contains_device(&self, id: &str) -> bool {
        self.devices.contains_key(id)
    }

    /// Apply `f` to a device in place
    pub fn update_device<F>(&mut self, id: &str, f: F) -> Result<()>
    where
        F: FnOnce(&mut Device),
    {
        let device = self
            .devices
            .get_mut(id)
            .ok_or_else(|| TopologyError::DeviceNotFound(id.to_string()))?;
        f(device);
        self.touch();
        Ok(())
    }

    /// Flip a device's online flag. Returns false if the device is unknown.
    pub fn set_online(&mut self, id: &str, online: bool) -> bool {
        self.update_device(id, |d| d.set_online(online)).is_ok()
    }

    pub fn primary_base(&self) -> Option<&Device> {
        self.primary_base_id
            .as_deref()
            .and_then(|id| self.devices.get(id))
    }

    /// Add a logical connection between two registered devices
    pub fn add_connection(&mut self, connection: DeviceConnection) -> Result<()> {
        for endpoint in [&connection.source_device_id, &connection.target_device_id] {
            if !self.devices.contains_key(endpoint) {
                return Err(TopologyError::DeviceNotFound(endpoint.clone()));
            }
        }
        if self.connections.contains_key(&connection.id) {
            return Err(TopologyError::DuplicateConnection(connection.id));
        }
        self.connections.insert(connection.id.clone(), connection);
        self.touch();
        Ok(())
    }

    pub fn remove_connection(&mut self, id: &str) -> Result<DeviceConnection> {
        let conn = self
            .connections
            .remove(id)
            .ok_or_else(|| TopologyError::ConnectionNotFound(id.to_string()))?;
        self.touch();
        Ok(conn)
    }

    pub fn connection(&self, id: &str) -> Option<&DeviceConnection> {
        self.connections.get(id)
    }

    /// Whether a connection is active and both its endpoints still exist
    pub fn is_connection_live(&self, conn: &DeviceConnection) -> bool {
        conn.is_active
            && self.devices.contains_key(&conn.source_device_id)
            && self.devices.contains_key(&conn.target_device_id)
    }

    /// Number of live connections touching a device
    pub fn active_connection_count(&self, device_id: &str) -> usize {
        self.connections
            .values()
            .filter(|c| c.touches(device_id) && self.is_connection_live(c))
            .count()
    }

    /// Online devices
    pub fn connected_devices(&self) -> Vec<&Device> {
        self.devices.values().filter(|d| d.online).collect()
    }

    pub fn devices_by_role(&self, role: DeviceRole) -> Vec<&Device> {
        self.devices.values().filter(|d| d.role == role).collect()
    }

    /// Online, non-primary devices with no live connection
    pub fn isolated_devices(&self) -> Vec<&Device> {
        self.devices
            .values()
            .filter(|d| d.online && d.role != DeviceRole::PrimaryBase)
            .filter(|d| self.active_connection_count(&d.id) == 0)
            .collect()
    }

    /// Replace the metrics published for one service
    pub fn set_service_metrics(&mut self, service: &str, metrics: HashMap<String, f64>) {
        self.service_metrics.insert(service.to_string(), metrics);
        self.touch();
    }

    pub fn stats(&self) -> TopologyStats {
        TopologyStats {
            total_devices: self.devices.len(),
            online_devices: self.devices.values().filter(|d| d.online).count(),
            total_connections: self.connections.len(),
            active_connections: self
                .connections
                .values()
                .filter(|c| self.is_connection_live(c))
                .count(),
            relay_capable_devices: self
                .devices
                .values()
                .filter(|d| d.role == DeviceRole::Gateway && d.online)
                .count(),
            has_primary_base: self.primary_base_id.is_some(),
            timestamp: unix_now(),
        }
    }
}
