//! Nexa CLI
//!
//! Run a node, talk to a Name Authority, or query a gateway.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::info;

use nexa_core::DnsRecord;
use nexa_daemon::run_node;
use nexa_dns::AuthorityClient;
use nexa_logging::LogLevel;
use nexa_network::tls::load_client_tls;
use nexa_settings::{default_settings_path, Settings};

/// Nexa - local service mesh with `.n` names
#[derive(Parser)]
#[command(name = "nexa")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a full node (authority, DNS, gateway, network)
    Node {
        /// Settings file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Talk to a Name Authority
    Dns {
        /// Authority address
        #[arg(short, long, default_value = "127.0.0.1:1112")]
        authority: String,

        /// CA certificate; enables TLS
        #[arg(long)]
        ca: Option<PathBuf>,

        /// Name expected on the authority's certificate
        #[arg(long, default_value = "localhost")]
        server_name: String,

        #[command(subcommand)]
        action: DnsAction,
    },

    /// Show a gateway's status
    Status {
        /// Gateway base URL
        #[arg(short, long, default_value = "http://127.0.0.1:8000")]
        gateway: String,
    },

    /// Show a gateway's network topology
    Topology {
        /// Gateway base URL
        #[arg(short, long, default_value = "http://127.0.0.1:8000")]
        gateway: String,
    },

    /// Write a default settings file
    InitConfig {
        /// Destination (defaults to ~/.nexa/settings.json)
        #[arg(short, long)]
        path: Option<PathBuf>,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand)]
enum DnsAction {
    /// Check the authority is alive
    Ping,
    /// Resolve a name
    Resolve { name: String },
    /// Register a name
    Register {
        name: String,
        ip: String,
        port: u16,
        #[arg(default_value = "web")]
        service: String,
    },
    /// Replace an existing name
    Update {
        name: String,
        ip: String,
        port: u16,
        #[arg(default_value = "web")]
        service: String,
    },
    /// Remove a name
    Delete { name: String },
    /// List registered names
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        LogLevel::Debug
    } else if matches!(cli.command, Commands::Node { .. }) {
        LogLevel::Info
    } else {
        LogLevel::Warn
    };
    let _ = nexa_logging::try_init(level);

    match cli.command {
        Commands::Node { config } => node(config).await?,
        Commands::Dns {
            authority,
            ca,
            server_name,
            action,
        } => {
            let mut client = AuthorityClient::new(authority);
            if let Some(ca) = ca {
                client = client.with_tls(load_client_tls(&ca, &server_name)?);
            }
            dns(&client, action).await?;
        }
        Commands::Status { gateway } => status(&gateway).await?,
        Commands::Topology { gateway } => topology(&gateway).await?,
        Commands::InitConfig { path, force } => init_config(path, force)?,
    }

    Ok(())
}

async fn node(config: Option<PathBuf>) -> Result<()> {
    let path = config.unwrap_or_else(default_settings_path);
    let settings = Settings::load_from(&path)
        .with_context(|| format!("loading settings from {}", path.display()))?;
    info!("Running node with settings {}", path.display());
    run_node(settings).await?;
    Ok(())
}

// ============================================================================
// Name Authority
// ============================================================================

async fn dns(client: &AuthorityClient, action: DnsAction) -> Result<()> {
    match action {
        DnsAction::Ping => {
            let records = client.ping().await?;
            println!("PONG from {} ({} records)", client.addr(), records);
        }
        DnsAction::Resolve { name } => match client.lookup(&name).await? {
            Some(resolution) if resolution.wildcard => {
                println!("{} -> {} (wildcard)", name, resolution.address());
            }
            Some(resolution) => {
                println!("{} -> {} [{}]", name, resolution.address(), resolution.service);
            }
            None => bail!("{} not found", name),
        },
        DnsAction::Register {
            name,
            ip,
            port,
            service,
        } => {
            client
                .register_record(&DnsRecord::new(&name, &ip, port, &service).with_owner("cli"))
                .await?;
            println!("Registered {} -> {}:{}", name, ip, port);
        }
        DnsAction::Update {
            name,
            ip,
            port,
            service,
        } => {
            client
                .update(&DnsRecord::new(&name, &ip, port, &service).with_owner("cli"))
                .await?;
            println!("Updated {} -> {}:{}", name, ip, port);
        }
        DnsAction::Delete { name } => {
            client.delete(&name).await?;
            println!("Deleted {}", name);
        }
        DnsAction::List => {
            let names = client.list().await?;
            if names.is_empty() {
                println!("No names registered");
            }
            for name in names {
                println!("{}", name);
            }
        }
    }
    Ok(())
}

// ============================================================================
// Gateway
// ============================================================================

async fn get_json(gateway: &str, path: &str) -> Result<Value> {
    let url = format!("{}{}", gateway.trim_end_matches('/'), path);
    let response = reqwest::get(&url)
        .await
        .with_context(|| format!("requesting {}", url))?;
    if !response.status().is_success() {
        bail!("{} returned {}", url, response.status());
    }
    Ok(response.json().await?)
}

async fn status(gateway: &str) -> Result<()> {
    let status = get_json(gateway, "/api/status").await?;

    println!("Nexa Gateway Status");
    println!("===================");
    println!("State:  {}", status["status"].as_str().unwrap_or("unknown"));
    println!("Address: {}:{}", status["ip"].as_str().unwrap_or("?"), status["port"]);
    println!("Uptime: {}s", status["uptime"]);
    if let Some(services) = status["services"].as_object() {
        println!("Services:");
        for (name, url) in services {
            println!("  /{:<10} {}", name, url.as_str().unwrap_or(""));
        }
    }
    if let Some(stats) = status.get("network_stats") {
        println!(
            "Devices: {} ({} online), connections: {}",
            stats["total_devices"], stats["online_devices"], stats["total_connections"]
        );
    }
    Ok(())
}

async fn topology(gateway: &str) -> Result<()> {
    let topology = get_json(gateway, "/api/network/topology").await?;
    println!("{}", serde_json::to_string_pretty(&topology)?);
    Ok(())
}

fn init_config(path: Option<PathBuf>, force: bool) -> Result<()> {
    let path = path.unwrap_or_else(default_settings_path);
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    Settings::default().save_to(&path)?;
    println!("Wrote default settings to {}", path.display());
    Ok(())
}
