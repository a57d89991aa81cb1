//! JSON API handlers

use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use serde::Deserialize;
use serde_json::{json, Value};

use nexa_core::{ConnectionType, DnsRecord};

use crate::error::ApiError;
use crate::server::GatewayState;

type ApiResult<T> = std::result::Result<T, ApiError>;

pub async fn index(State(state): State<GatewayState>) -> Json<Value> {
    let mut aliases: Vec<&String> = state.config.aliases.keys().collect();
    aliases.sort();
    Json(json!({
        "service": "nexa-gateway",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": [
            "/health",
            "/api/status",
            "/api/register-site",
            "/api/network/topology",
            "/api/network/stats",
            "/api/network/devices",
            "/api/network/relay",
            "/api/network/connect/{device_id}",
            "/api/network/disconnect/{device_id}",
        ],
        "proxies": crate::config::PATH_BACKENDS.iter().map(|n| format!("/{}", n)).collect::<Vec<_>>(),
        "aliases": aliases,
    }))
}

pub async fn health() -> Json<Value> {
    Json(json!({ "status": "healthy" }))
}

pub async fn status(State(state): State<GatewayState>) -> Json<Value> {
    let network = state.expansion.network();
    Json(json!({
        "status": "online",
        "ip": state.config.advertise_ip,
        "port": state.config.port,
        "uptime": state.started_at.elapsed().as_secs(),
        "services": state.config.backends,
        "network_stats": network.network_stats(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct RegisterSite {
    pub name: String,
    pub ip: String,
    pub port: u16,
    #[serde(default = "default_site_service")]
    pub service: String,
}

fn default_site_service() -> String {
    "web".to_string()
}

pub async fn register_site(
    State(state): State<GatewayState>,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let site: RegisterSite = serde_json::from_slice(&body)
        .map_err(|e| ApiError::bad_request(format!("Invalid request body: {}", e)))?;
    let record = DnsRecord::new(&site.name, &site.ip, site.port, &site.service).with_owner("gateway");
    state.resolver.register(record).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "status": "registered", "name": site.name.to_ascii_lowercase() })),
    ))
}

pub async fn topology(State(state): State<GatewayState>) -> Response {
    Json(state.expansion.network().get_topology()).into_response()
}

pub async fn stats(State(state): State<GatewayState>) -> Response {
    Json(state.expansion.network().network_stats()).into_response()
}

pub async fn devices(State(state): State<GatewayState>) -> Response {
    let topology = state.expansion.network().get_topology();
    let mut devices: Vec<_> = topology.devices.into_values().collect();
    devices.sort_by(|a, b| a.id.cmp(&b.id));
    Json(devices).into_response()
}

#[derive(Debug, Deserialize)]
pub struct CreateRelay {
    pub source_id: String,
    pub target_id: String,
    pub intermediate_id: String,
    #[serde(default = "default_priority")]
    pub priority: i32,
}

fn default_priority() -> i32 {
    1
}

pub async fn create_relay(
    State(state): State<GatewayState>,
    body: Bytes,
) -> ApiResult<(StatusCode, Response)> {
    let req: CreateRelay = serde_json::from_slice(&body)
        .map_err(|e| ApiError::bad_request(format!("Invalid request body: {}", e)))?;
    let route = state.expansion.create_relay_route(
        &req.source_id,
        &req.target_id,
        &req.intermediate_id,
        req.priority,
    )?;
    Ok((StatusCode::CREATED, Json(route).into_response()))
}

pub async fn list_relays(State(state): State<GatewayState>) -> Response {
    Json(state.expansion.relay_routes()).into_response()
}

pub async fn delete_relay(
    State(state): State<GatewayState>,
    Path(route_id): Path<String>,
) -> ApiResult<Json<Value>> {
    state.expansion.remove_relay_route(&route_id)?;
    Ok(Json(json!({ "status": "deleted", "route_id": route_id })))
}

#[derive(Debug, Default, Deserialize)]
pub struct ConnectDevice {
    #[serde(default)]
    pub connection_type: ConnectionType,
}

pub async fn connect_device(
    State(state): State<GatewayState>,
    Path(device_id): Path<String>,
    body: Bytes,
) -> ApiResult<Response> {
    let params: ConnectDevice = if body.iter().all(u8::is_ascii_whitespace) {
        ConnectDevice::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ApiError::bad_request(format!("Invalid request body: {}", e)))?
    };
    let device = state
        .expansion
        .network()
        .connect_device(&device_id, params.connection_type)
        .await?;
    Ok(Json(device).into_response())
}

pub async fn disconnect_device(
    State(state): State<GatewayState>,
    Path(device_id): Path<String>,
) -> ApiResult<Json<Value>> {
    state.expansion.network().disconnect_device(&device_id).await?;
    Ok(Json(json!({ "status": "disconnected", "device_id": device_id })))
}

pub async fn not_found(req: Request) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": "Route not found", "path": req.uri().path() })),
    )
        .into_response()
}
