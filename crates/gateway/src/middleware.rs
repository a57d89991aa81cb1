//! Gateway middleware: real client address, CORS and host-based routing

use std::net::{IpAddr, SocketAddr};

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::{debug, warn};

use nexa_dns::is_managed_name;

use crate::server::GatewayState;

/// Client address after proxy headers are taken into account
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RealIp(pub IpAddr);

fn header_ip(req: &Request, name: &str) -> Option<IpAddr> {
    let value = req.headers().get(name)?.to_str().ok()?;
    value.split(',').next()?.trim().parse().ok()
}

/// `X-Forwarded-For` (first hop), then `X-Real-IP`, then the socket peer
pub fn client_ip(req: &Request) -> Option<IpAddr> {
    header_ip(req, "x-forwarded-for")
        .or_else(|| header_ip(req, "x-real-ip"))
        .or_else(|| {
            req.extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip())
        })
}

pub async fn real_ip(mut req: Request, next: Next) -> Response {
    if let Some(ip) = client_ip(&req) {
        req.extensions_mut().insert(RealIp(ip));
    }
    next.run(req).await
}

/// Permissive CORS. Preflight requests are answered here.
pub async fn cors(req: Request, next: Next) -> Response {
    let mut response = if req.method() == Method::OPTIONS {
        StatusCode::OK.into_response()
    } else {
        next.run(req).await
    };
    let headers = response.headers_mut();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, PUT, DELETE, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type"),
    );
    response
}

/// Lower-cased host without port, from `Host` or the request URI
pub fn request_host(req: &Request) -> Option<String> {
    let raw = req
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| req.uri().host())?;
    if raw.starts_with('[') {
        return None;
    }
    let host = raw.split(':').next()?.trim().trim_end_matches('.');
    (!host.is_empty()).then(|| host.to_ascii_lowercase())
}

/// Route `.n` / `.nexa` hosts: static aliases first, then the name
/// authority. Wildcard answers and misses fall through to path routing.
pub async fn host_routing(State(state): State<GatewayState>, req: Request, next: Next) -> Response {
    let Some(host) = request_host(&req) else {
        return next.run(req).await;
    };
    if !is_managed_name(&host, &state.config.suffixes) {
        return next.run(req).await;
    }

    if let Some(target) = state.config.aliases.get(&host) {
        debug!("Host {} matched alias {}", host, target);
        return state.proxies.get(&host, target).forward(req, None).await;
    }

    match state.resolver.resolve(&host).await {
        Ok(Some(resolution)) if !resolution.wildcard => {
            let target = format!("http://{}", resolution.address());
            debug!("Host {} resolved to {}", host, target);
            state.proxies.get(&host, &target).forward(req, None).await
        }
        Ok(_) => next.run(req).await,
        Err(e) => {
            warn!("Resolving {} failed: {}", host, e);
            next.run(req).await
        }
    }
}
