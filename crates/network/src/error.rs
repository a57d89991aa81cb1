use thiserror::Error;

use nexa_core::TopologyError;

#[derive(Error, Debug)]
pub enum NetworkError {
    #[error(transparent)]
    Topology(#[from] TopologyError),

    #[error("Device not connected: {0}")]
    NotConnected(String),

    #[error("Device already connected: {0}")]
    AlreadyConnected(String),

    #[error("Connection handler closed: {0}")]
    HandlerClosed(String),

    #[error("Failed to connect to {address}: {reason}")]
    ConnectFailed { address: String, reason: String },

    #[error("Reconnect to {device_id} failed after {attempts} attempts")]
    ReconnectExhausted { device_id: String, attempts: u32 },

    #[error("Frame length {0} exceeds limit")]
    FrameTooLarge(usize),

    #[error("Zero-length frame")]
    EmptyFrame,

    #[error("Timeout")]
    Timeout,

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("{0} is not running")]
    NotRunning(&'static str),

    #[error("Broadcast failed for {} device(s)", failures.len())]
    BroadcastFailed { failures: Vec<(String, String)> },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl NetworkError {
    /// Malformed or oversized input that must close the session
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, Self::FrameTooLarge(_) | Self::EmptyFrame)
    }
}

pub type Result<T> = std::result::Result<T, NetworkError>;
