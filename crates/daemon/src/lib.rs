//! Nexa Daemon
//!
//! Runs one node: network manager, relay expansion, name authority, DNS
//! responders and the HTTP gateway, wired from a [`Settings`] file.
//!
//! ## Startup policy
//!
//! - Fatal: settings validation, records file, authority listener, gateway listener
//! - Logged and skipped: discovery, UDP 53 responder, mDNS responder

mod service;

pub use service::{NodeService, NodeStatus};

use nexa_settings::Settings;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("Settings error: {0}")]
    Settings(#[from] nexa_settings::SettingsError),

    #[error("Network error: {0}")]
    Network(#[from] nexa_network::NetworkError),

    #[error("DNS error: {0}")]
    Dns(#[from] nexa_dns::DnsError),

    #[error("Gateway error: {0}")]
    Gateway(#[from] nexa_gateway::GatewayError),

    #[error("Topology error: {0}")]
    Topology(#[from] nexa_core::TopologyError),

    #[error("Invalid setting {field}: {reason}")]
    InvalidSetting { field: &'static str, reason: String },

    #[error("Already running")]
    AlreadyRunning,

    #[error("Not running")]
    NotRunning,
}

pub type Result<T> = std::result::Result<T, DaemonError>;

/// Build a node from `settings` and run it until ctrl-c
pub async fn run_node(settings: Settings) -> Result<()> {
    let node = NodeService::new(settings)?;
    let status = node.start().await?;
    tracing::info!(
        "Node {} up: authority {}, gateway {}",
        status.device_id,
        status.authority_addr,
        status.gateway_addr
    );

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    } else {
        tracing::info!("Received shutdown signal");
    }

    node.shutdown().await;
    Ok(())
}
