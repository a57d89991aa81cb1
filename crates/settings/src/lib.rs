//! Nexa Settings
//!
//! Node configuration stored as a JSON file, one section per subsystem.
//!
//! ## Usage
//!
//! ```no_run
//! use nexa_settings::Settings;
//!
//! let mut settings = Settings::load_or_default()?;
//! settings.gateway.port = 8080;
//! settings.save()?;
//! # Ok::<(), nexa_settings::SettingsError>(())
//! ```

mod config;

pub use config::{
    DnsSettings, GatewaySettings, NetworkSettings, NodeSettings, Settings, TlsSettings,
};

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("Failed to read settings: {0}")]
    ReadError(std::io::Error),

    #[error("Failed to write settings: {0}")]
    WriteError(std::io::Error),

    #[error("Failed to parse settings: {0}")]
    ParseError(serde_json::Error),

    #[error("Failed to create config directory: {0}")]
    CreateDirError(std::io::Error),

    #[error("Invalid setting {field}: {reason}")]
    Invalid { field: String, reason: String },
}

pub type Result<T> = std::result::Result<T, SettingsError>;

/// `$HOME/.nexa`, or `./.nexa` when no home directory is set
pub fn default_config_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".nexa")
}

/// Get the default settings file path
pub fn default_settings_path() -> PathBuf {
    default_config_dir().join("settings.json")
}
