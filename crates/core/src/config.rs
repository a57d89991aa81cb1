//! Well-known ports, suffixes and timing defaults

use std::time::Duration;

/// Gateway HTTP port
pub const DEFAULT_GATEWAY_PORT: u16 = 8000;
/// Admin backend port
pub const DEFAULT_ADMIN_PORT: u16 = 8080;
/// File storage backend port
pub const DEFAULT_STORAGE_PORT: u16 = 8081;
/// Chat backend port
pub const DEFAULT_CHAT_PORT: u16 = 8082;
/// Dashboard backend port
pub const DEFAULT_DASHBOARD_PORT: u16 = 7000;
/// Core protocol server port
pub const DEFAULT_SERVER_PORT: u16 = 1413;
/// Name Authority text protocol port
pub const DEFAULT_AUTHORITY_PORT: u16 = 1112;
/// Standard DNS port
pub const DEFAULT_DNS_UDP_PORT: u16 = 53;
/// UDP discovery port
pub const DEFAULT_DISCOVERY_PORT: u16 = 9999;

/// mDNS multicast group and port
pub const MDNS_GROUP: [u8; 4] = [224, 0, 0, 251];
pub const MDNS_PORT: u16 = 5353;

/// Public resolver used for names outside the managed suffixes
pub const DEFAULT_UPSTREAM_RESOLVER: &str = "8.8.8.8:53";

/// Top-level labels handled by the Name Authority and the Gateway
pub const MANAGED_SUFFIXES: [&str; 2] = [".n", ".nexa"];

/// Largest frame accepted on a device connection (10 MB)
pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_RECONNECT_WAIT: Duration = Duration::from_secs(5);

/// Health monitor tick and eviction threshold
pub const DEFAULT_MONITOR_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_HEALTH_TIMEOUT: Duration = Duration::from_secs(120);

/// Relay auto-heal tick
pub const DEFAULT_EXPANSION_INTERVAL: Duration = Duration::from_secs(10);

/// Idle limit on a Name Authority connection
pub const AUTHORITY_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Gateway per-request timeout
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Returns true when `name` ends in one of the managed suffixes.
///
/// Comparison is case-insensitive and ignores a trailing root dot.
pub fn has_managed_suffix(name: &str) -> bool {
    let name = name.trim_end_matches('.').to_ascii_lowercase();
    MANAGED_SUFFIXES
        .iter()
        .any(|suffix| name.len() > suffix.len() && name.ends_with(suffix))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_managed_suffix() {
        assert!(has_managed_suffix("demo.n"));
        assert!(has_managed_suffix("demo.nexa"));
        assert!(has_managed_suffix("Deep.Sub.NEXA"));
        assert!(has_managed_suffix("demo.n."));
    }

    #[test]
    fn test_unmanaged_suffix() {
        assert!(!has_managed_suffix("example.com"));
        assert!(!has_managed_suffix("demo.net"));
        assert!(!has_managed_suffix("nexa"));
        assert!(!has_managed_suffix(".n"));
        assert!(!has_managed_suffix(""));
    }

    #[test]
    fn test_frame_limit() {
        assert_eq!(MAX_FRAME_SIZE, 10_485_760);
    }
}
