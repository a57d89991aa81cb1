use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

use nexa_dns::DnsError;
use nexa_network::NetworkError;
use nexa_relay::RelayError;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Failed to bind {addr}: {reason}")]
    Bind { addr: String, reason: String },

    #[error("Invalid proxy target {0}")]
    InvalidTarget(String),

    #[error("Upstream request failed: {0}")]
    Upstream(#[from] reqwest::Error),

    #[error("Request body rejected: {0}")]
    Body(String),

    #[error("Failed to build response: {0}")]
    Response(#[from] axum::http::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, GatewayError>;

/// Error body for the JSON API: `{"error": "<message>"}`
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(serde_json::json!({ "error": self.message }))).into_response()
    }
}

impl From<RelayError> for ApiError {
    fn from(e: RelayError) -> Self {
        Self::bad_request(e.to_string())
    }
}

impl From<NetworkError> for ApiError {
    fn from(e: NetworkError) -> Self {
        Self::bad_request(e.to_string())
    }
}

impl From<DnsError> for ApiError {
    fn from(e: DnsError) -> Self {
        Self::bad_request(e.to_string())
    }
}
