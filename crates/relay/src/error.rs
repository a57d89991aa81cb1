use thiserror::Error;

use nexa_network::NetworkError;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Relay route not found: {0}")]
    RouteNotFound(String),

    #[error("Relay route {0} is not active")]
    RouteInactive(String),

    #[error("Invalid relay route: {0}")]
    InvalidRoute(String),

    #[error("Relay route {route_id} recorded but its connections failed: {reason}")]
    ConnectionsFailed { route_id: String, reason: String },
}

pub type Result<T> = std::result::Result<T, RelayError>;
