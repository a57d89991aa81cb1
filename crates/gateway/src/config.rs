//! Gateway configuration

use std::collections::HashMap;
use std::time::Duration;

use nexa_core::{
    DEFAULT_ADMIN_PORT, DEFAULT_CHAT_PORT, DEFAULT_DASHBOARD_PORT, DEFAULT_GATEWAY_PORT,
    DEFAULT_REQUEST_TIMEOUT, DEFAULT_STORAGE_PORT, MANAGED_SUFFIXES,
};

/// Path prefixes forwarded to a fixed backend
pub const PATH_BACKENDS: [&str; 4] = ["admin", "storage", "chat", "dashboard"];

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub port: u16,
    /// Address reported by `/api/status`
    pub advertise_ip: String,
    pub request_timeout: Duration,
    /// Backend name -> base URL, used for `/admin`, `/storage`, ...
    pub backends: HashMap<String, String>,
    /// Host name -> base URL, matched before asking the name authority
    pub aliases: HashMap<String, String>,
    pub suffixes: Vec<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        let backends: HashMap<String, String> = [
            ("admin", DEFAULT_ADMIN_PORT),
            ("storage", DEFAULT_STORAGE_PORT),
            ("chat", DEFAULT_CHAT_PORT),
            ("dashboard", DEFAULT_DASHBOARD_PORT),
        ]
        .into_iter()
        .map(|(name, port)| (name.to_string(), format!("http://127.0.0.1:{}", port)))
        .collect();

        Self {
            port: DEFAULT_GATEWAY_PORT,
            advertise_ip: "127.0.0.1".to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            aliases: default_aliases(&backends),
            backends,
            suffixes: MANAGED_SUFFIXES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// `<backend>.nexa` and `<backend>.n` for every backend
pub fn default_aliases(backends: &HashMap<String, String>) -> HashMap<String, String> {
    backends
        .iter()
        .flat_map(|(name, url)| {
            MANAGED_SUFFIXES
                .iter()
                .map(move |suffix| (format!("{}{}", name, suffix), url.clone()))
        })
        .collect()
}
