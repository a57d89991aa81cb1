//! Persistent name registry
//!
//! Records live in one map behind a read-write lock. Every successful
//! mutation rewrites the JSON file (`name -> record`) before returning, so a
//! restart reloads exactly what callers were told was stored.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use nexa_core::{
    unix_now, DnsRecord, DEFAULT_ADMIN_PORT, DEFAULT_CHAT_PORT, DEFAULT_DASHBOARD_PORT,
    DEFAULT_SERVER_PORT, DEFAULT_STORAGE_PORT,
};

use crate::{DnsError, Result};

/// Names for the built-in services, seeded at startup when missing
pub fn bootstrap_records(ip: &str) -> Vec<DnsRecord> {
    [
        ("test.nexa", DEFAULT_SERVER_PORT, "web"),
        ("admin.nexa", DEFAULT_ADMIN_PORT, "admin"),
        ("storage.nexa", DEFAULT_STORAGE_PORT, "storage"),
        ("chat.nexa", DEFAULT_CHAT_PORT, "chat"),
        ("dashboard.nexa", DEFAULT_DASHBOARD_PORT, "dashboard"),
    ]
    .into_iter()
    .map(|(name, port, service)| DnsRecord::new(name, ip, port, service).with_owner("system"))
    .collect()
}

/// Canonical form used as the map key
pub fn normalize_name(name: &str) -> String {
    name.trim().trim_end_matches('.').to_ascii_lowercase()
}

fn validate(record: &DnsRecord) -> Result<()> {
    if record.name.is_empty() || record.name.chars().any(char::is_whitespace) {
        return Err(DnsError::InvalidRecord(format!("invalid name '{}'", record.name)));
    }
    if record.ip.parse::<IpAddr>().is_err() {
        return Err(DnsError::InvalidRecord(format!("invalid IP address '{}'", record.ip)));
    }
    if record.port == 0 {
        return Err(DnsError::InvalidRecord("port must be between 1 and 65535".to_string()));
    }
    if record.service.is_empty() || record.service.chars().any(char::is_whitespace) {
        return Err(DnsError::InvalidRecord(format!("invalid service '{}'", record.service)));
    }
    Ok(())
}

pub struct DnsRegistry {
    path: Option<PathBuf>,
    records: RwLock<HashMap<String, DnsRecord>>,
}

impl DnsRegistry {
    /// Registry that never touches disk
    pub fn in_memory() -> Self {
        Self {
            path: None,
            records: RwLock::new(HashMap::new()),
        }
    }

    /// Load records from `path`. A missing file starts an empty registry;
    /// an unreadable one is an error rather than being silently replaced.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let records = if path.exists() {
            let contents = std::fs::read_to_string(&path)?;
            let loaded: HashMap<String, DnsRecord> = serde_json::from_str(&contents)?;
            loaded
                .into_values()
                .map(|mut r| {
                    r.name = normalize_name(&r.name);
                    (r.name.clone(), r)
                })
                .collect()
        } else {
            debug!("No records file at {}, starting empty", path.display());
            HashMap::new()
        };
        info!("Loaded {} DNS record(s) from {}", records.len(), path.display());
        Ok(Self {
            path: Some(path),
            records: RwLock::new(records),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Insert every record whose name is absent. Existing entries are never
    /// overwritten. Returns how many were added.
    pub fn seed(&self, records: Vec<DnsRecord>) -> Result<usize> {
        let mut map = self.records.write();
        let mut added = 0;
        for mut record in records {
            record.name = normalize_name(&record.name);
            validate(&record)?;
            if !map.contains_key(&record.name) {
                map.insert(record.name.clone(), record);
                added += 1;
            }
        }
        if added > 0 {
            self.persist(&map)?;
            info!("Seeded {} bootstrap DNS record(s)", added);
        }
        Ok(added)
    }

    /// Insert or replace a record. On a save failure the previous entry is
    /// restored.
    pub fn register(&self, mut record: DnsRecord) -> Result<DnsRecord> {
        record.name = normalize_name(&record.name);
        validate(&record)?;

        let mut map = self.records.write();
        if let Some(existing) = map.get(&record.name) {
            record.created_at = existing.created_at;
        }
        record.updated_at = unix_now();
        let previous = map.insert(record.name.clone(), record.clone());
        if let Err(e) = self.persist(&map) {
            match previous {
                Some(prev) => map.insert(record.name.clone(), prev),
                None => map.remove(&record.name),
            };
            return Err(e);
        }
        debug!("Registered {} -> {}", record.name, record.address());
        Ok(record)
    }

    /// Replace an existing record's address and service
    pub fn update(&self, mut record: DnsRecord) -> Result<DnsRecord> {
        record.name = normalize_name(&record.name);
        validate(&record)?;

        let mut map = self.records.write();
        let existing = map
            .get(&record.name)
            .cloned()
            .ok_or_else(|| DnsError::NotFound(record.name.clone()))?;
        record.created_at = existing.created_at;
        if record.owner.is_empty() {
            record.owner = existing.owner.clone();
        }
        record.updated_at = unix_now();
        map.insert(record.name.clone(), record.clone());
        if let Err(e) = self.persist(&map) {
            map.insert(record.name.clone(), existing);
            return Err(e);
        }
        Ok(record)
    }

    pub fn delete(&self, name: &str) -> Result<DnsRecord> {
        let name = normalize_name(name);
        let mut map = self.records.write();
        let removed = map
            .remove(&name)
            .ok_or_else(|| DnsError::NotFound(name.clone()))?;
        if let Err(e) = self.persist(&map) {
            map.insert(name, removed);
            return Err(e);
        }
        Ok(removed)
    }

    pub fn resolve(&self, name: &str) -> Option<DnsRecord> {
        self.records.read().get(&normalize_name(name)).cloned()
    }

    /// Registered names, sorted
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.records.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// All records, sorted by name
    pub fn records(&self) -> Vec<DnsRecord> {
        let mut records: Vec<DnsRecord> = self.records.read().values().cloned().collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        records
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    fn persist(&self, records: &HashMap<String, DnsRecord>) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let persist_err = |reason: String| DnsError::Persist {
            path: path.display().to_string(),
            reason,
        };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| persist_err(e.to_string()))?;
            }
        }
        let contents =
            serde_json::to_string_pretty(records).map_err(|e| persist_err(e.to_string()))?;

        // Write-then-rename so a crash never leaves a truncated file
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, contents).map_err(|e| persist_err(e.to_string()))?;
        std::fs::rename(&tmp, path).map_err(|e| {
            warn!("Failed to replace {}: {}", path.display(), e);
            persist_err(e.to_string())
        })
    }
}
