use thiserror::Error;

#[derive(Error, Debug)]
pub enum DnsError {
    #[error("Name not found: {0}")]
    NotFound(String),

    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    #[error("Failed to save records to {path}: {reason}")]
    Persist { path: String, reason: String },

    #[error("Malformed DNS message: {0}")]
    Malformed(String),

    #[error("Authority replied {code}: {message}")]
    Rejected { code: u16, message: String },

    #[error("Invalid authority response: {0}")]
    InvalidResponse(String),

    #[error("Failed to bind {addr}: {reason}")]
    Bind { addr: String, reason: String },

    #[error(transparent)]
    Network(#[from] nexa_network::NetworkError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DnsError>;
