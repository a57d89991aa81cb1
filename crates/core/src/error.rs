use thiserror::Error;

/// Validation failures raised by topology mutations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TopologyError {
    #[error("Device already registered: {0}")]
    DuplicateDevice(String),

    #[error("Primary base already registered: {0}")]
    PrimaryBaseExists(String),

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Connection already exists: {0}")]
    DuplicateConnection(String),

    #[error("Connection not found: {0}")]
    ConnectionNotFound(String),

    #[error("Invalid field {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

pub type Result<T> = std::result::Result<T, TopologyError>;
