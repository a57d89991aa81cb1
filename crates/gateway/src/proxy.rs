//! Reverse proxy
//!
//! Forwards a request to a fixed base URL and streams the reply back. Any
//! failure to reach the backend becomes `503 Service Unavailable`; requests
//! are never retried.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::Request;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use parking_lot::RwLock;
use tracing::{debug, error};

use crate::middleware::RealIp;
use crate::{GatewayError, Result};

/// Largest request body buffered for forwarding
pub const MAX_PROXY_BODY: usize = 10 * 1024 * 1024;

const HOP_BY_HOP: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
];

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
}

fn copy_headers(from: &HeaderMap) -> HeaderMap {
    let mut to = HeaderMap::with_capacity(from.len());
    for (name, value) in from {
        if !is_hop_by_hop(name) {
            to.append(name.clone(), value.clone());
        }
    }
    to
}

/// Path and query to send upstream, with `strip_prefix` removed
pub fn rewrite_path(path_and_query: &str, strip_prefix: Option<&str>) -> String {
    let rest = match strip_prefix {
        Some(prefix) => path_and_query.strip_prefix(prefix).unwrap_or(path_and_query),
        None => path_and_query,
    };
    if rest.starts_with('/') {
        rest.to_string()
    } else {
        format!("/{}", rest)
    }
}

pub struct ReverseProxy {
    name: String,
    target: String,
    client: reqwest::Client,
}

impl ReverseProxy {
    pub fn new(name: impl Into<String>, target: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            name: name.into(),
            target: target.into().trim_end_matches('/').to_string(),
            client,
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Forward `req`, answering 503 if the backend cannot be reached
    pub async fn forward(&self, req: Request, strip_prefix: Option<&str>) -> Response {
        match self.try_forward(req, strip_prefix).await {
            Ok(response) => response,
            Err(GatewayError::Body(reason)) => {
                debug!("Rejected body for {}: {}", self.name, reason);
                (StatusCode::PAYLOAD_TOO_LARGE, "Payload Too Large").into_response()
            }
            Err(e) => {
                error!("Proxy error to {}: {}", self.name, e);
                (StatusCode::SERVICE_UNAVAILABLE, "Service Unavailable").into_response()
            }
        }
    }

    async fn try_forward(&self, req: Request, strip_prefix: Option<&str>) -> Result<Response> {
        let (parts, body) = req.into_parts();
        let path = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let url = format!("{}{}", self.target, rewrite_path(path, strip_prefix));

        let mut headers = copy_headers(&parts.headers);
        if let Some(RealIp(ip)) = parts.extensions.get::<RealIp>() {
            if let Ok(value) = HeaderValue::from_str(&ip.to_string()) {
                headers.insert("x-forwarded-for", value);
            }
        }
        if let Some(host) = parts.headers.get(axum::http::header::HOST) {
            headers.insert("x-forwarded-host", host.clone());
        }

        let body = axum::body::to_bytes(body, MAX_PROXY_BODY)
            .await
            .map_err(|e| GatewayError::Body(e.to_string()))?;

        debug!("Proxying {} {} -> {}", parts.method, path, url);
        let upstream = self
            .client
            .request(parts.method, &url)
            .headers(headers)
            .body(body)
            .send()
            .await?;

        let mut builder = Response::builder().status(upstream.status());
        if let Some(out) = builder.headers_mut() {
            *out = copy_headers(upstream.headers());
        }
        Ok(builder.body(Body::from_stream(upstream.bytes_stream()))?)
    }
}

/// Proxies keyed by target URL, built on first use
pub struct ProxyCache {
    client: reqwest::Client,
    proxies: RwLock<HashMap<String, Arc<ReverseProxy>>>,
}

impl ProxyCache {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self::with_client(client))
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self {
            client,
            proxies: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, name: &str, target: &str) -> Arc<ReverseProxy> {
        let key = target.trim_end_matches('/');
        if let Some(proxy) = self.proxies.read().get(key) {
            return proxy.clone();
        }
        self.proxies
            .write()
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(ReverseProxy::new(name, key, self.client.clone())))
            .clone()
    }

    pub fn len(&self) -> usize {
        self.proxies.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.proxies.read().is_empty()
    }
}
