//! Router assembly and the HTTP listener

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Request, State};
use axum::middleware;
use axum::routing::{any, delete, get, post};
use axum::Router;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tower::ServiceBuilder;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use nexa_dns::NameResolver;
use nexa_relay::ExpansionManager;

use crate::api;
use crate::config::{GatewayConfig, PATH_BACKENDS};
use crate::middleware::{cors, host_routing, real_ip};
use crate::proxy::ProxyCache;
use crate::{GatewayError, Result};

/// Shared handler state
#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<GatewayConfig>,
    pub resolver: Arc<dyn NameResolver>,
    pub expansion: Arc<ExpansionManager>,
    pub proxies: Arc<ProxyCache>,
    pub started_at: Instant,
}

impl GatewayState {
    pub fn new(
        config: GatewayConfig,
        resolver: Arc<dyn NameResolver>,
        expansion: Arc<ExpansionManager>,
    ) -> Result<Self> {
        Ok(Self {
            config: Arc::new(config),
            resolver,
            expansion,
            proxies: Arc::new(ProxyCache::new()?),
            started_at: Instant::now(),
        })
    }
}

async fn proxy_backend(state: GatewayState, name: &'static str, req: Request) -> axum::response::Response {
    let prefix = format!("/{}", name);
    match state.config.backends.get(name) {
        Some(target) => state.proxies.get(name, target).forward(req, Some(&prefix)).await,
        None => api::not_found(req).await,
    }
}

/// Full router with the middleware chain, outermost first: request id,
/// tracing, real IP, panic recovery, timeout, CORS, host routing.
pub fn router(state: GatewayState) -> Router {
    let network = Router::new()
        .route("/topology", get(api::topology))
        .route("/stats", get(api::stats))
        .route("/devices", get(api::devices))
        .route("/relay", post(api::create_relay).get(api::list_relays))
        .route("/relay/{route_id}", delete(api::delete_relay))
        .route("/connect/{device_id}", post(api::connect_device))
        .route("/disconnect/{device_id}", delete(api::disconnect_device));

    let mut router = Router::new()
        .route("/", get(api::index))
        .route("/health", get(api::health))
        .route("/api/status", get(api::status))
        .route("/api/register-site", post(api::register_site))
        .nest("/api/network", network);

    for name in PATH_BACKENDS {
        let handler = move |State(state): State<GatewayState>, req: Request| proxy_backend(state, name, req);
        router = router
            .route(&format!("/{}", name), any(handler))
            .route(&format!("/{}/{{*rest}}", name), any(handler));
    }

    let timeout = state.config.request_timeout;
    router
        .fallback(api::not_found)
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                .layer(PropagateRequestIdLayer::x_request_id())
                .layer(TraceLayer::new_for_http())
                .layer(middleware::from_fn(real_ip))
                .layer(CatchPanicLayer::new())
                .layer(TimeoutLayer::new(timeout))
                .layer(middleware::from_fn(cors))
                .layer(middleware::from_fn_with_state(state.clone(), host_routing)),
        )
        .with_state(state)
}

pub struct GatewayServer {
    listener: TcpListener,
    state: GatewayState,
}

impl GatewayServer {
    /// Bind the HTTP listener. Failure here is fatal for the node.
    pub async fn bind(addr: SocketAddr, state: GatewayState) -> Result<Self> {
        let listener = TcpListener::bind(addr).await.map_err(|e| GatewayError::Bind {
            addr: addr.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self { listener, state })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until `shutdown` flips
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let addr = self.local_addr()?;
        info!("Gateway listening on http://{}", addr);
        let app = router(self.state).into_make_service_with_connect_info::<SocketAddr>();
        axum::serve(self.listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.changed().await;
            })
            .await?;
        info!("Gateway stopped");
        Ok(())
    }

    pub fn spawn(self) -> Result<GatewayHandle> {
        let addr = self.local_addr()?;
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            if let Err(e) = self.run(stop_rx).await {
                error!("Gateway server error: {}", e);
            }
        });
        Ok(GatewayHandle {
            addr,
            stop: Mutex::new(Some(stop_tx)),
            task: Mutex::new(Some(task)),
        })
    }
}

pub struct GatewayHandle {
    addr: SocketAddr,
    stop: Mutex<Option<watch::Sender<bool>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl GatewayHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn shutdown(&self) {
        if let Some(tx) = self.stop.lock().take() {
            let _ = tx.send(true);
        }
    }

    pub async fn join(&self) {
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl Drop for GatewayHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::StatusCode;
    use nexa_core::{Device, DeviceRole, DnsRecord};
    use nexa_dns::{AuthorityConfig, DnsRegistry, NameAuthority};
    use nexa_network::{ConnectionConfig, NetworkManager};
    use nexa_relay::ExpansionConfig;
    use serde_json::Value;
    use tower::ServiceExt;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct Fixture {
        state: GatewayState,
        authority: Arc<NameAuthority>,
    }

    fn fixture(config: GatewayConfig) -> Fixture {
        let authority = Arc::new(NameAuthority::new(
            Arc::new(DnsRegistry::in_memory()),
            AuthorityConfig {
                gateway_port: config.port,
                ..Default::default()
            },
        ));
        let network = Arc::new(NetworkManager::new(ConnectionConfig {
            local_id: "gateway-test".to_string(),
            max_retries: 0,
            ..Default::default()
        }));
        let expansion = Arc::new(ExpansionManager::new(
            network,
            Device::new("gateway-test", "gateway-test", DeviceRole::Gateway, "127.0.0.1", config.port),
            ExpansionConfig::default(),
        ));
        let state = GatewayState::new(config, authority.clone(), expansion).unwrap();
        Fixture { state, authority }
    }

    async fn call(state: &GatewayState, req: axum::http::Request<Body>) -> (StatusCode, axum::http::HeaderMap, Vec<u8>) {
        let response = router(state.clone()).oneshot(req).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, headers, body.to_vec())
    }

    fn get_req(uri: &str, host: Option<&str>) -> axum::http::Request<Body> {
        let mut builder = axum::http::Request::builder().uri(uri);
        if let Some(host) = host {
            builder = builder.header("host", host);
        }
        builder.body(Body::empty()).unwrap()
    }

    fn json_req(method: &str, uri: &str, body: Value) -> axum::http::Request<Body> {
        axum::http::Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let fx = fixture(GatewayConfig::default());
        let (status, headers, body) = call(&fx.state, get_req("/health", None)).await;
        assert_eq!(status, StatusCode::OK);
        let json: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "healthy");
        assert!(headers.contains_key("x-request-id"));
        assert_eq!(headers["access-control-allow-origin"], "*");
    }

    #[tokio::test]
    async fn test_status() {
        let fx = fixture(GatewayConfig::default());
        let (status, _, body) = call(&fx.state, get_req("/api/status", None)).await;
        assert_eq!(status, StatusCode::OK);
        let json: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "online");
        assert_eq!(json["port"], 8000);
        assert_eq!(json["services"]["chat"], "http://127.0.0.1:8082");
    }

    #[tokio::test]
    async fn test_preflight_answered() {
        let fx = fixture(GatewayConfig::default());
        let req = axum::http::Request::builder()
            .method("OPTIONS")
            .uri("/api/network/relay")
            .body(Body::empty())
            .unwrap();
        let (status, headers, _) = call(&fx.state, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            headers["access-control-allow-methods"],
            "GET, POST, PUT, DELETE, OPTIONS"
        );
    }

    #[tokio::test]
    async fn test_host_routing_to_registered_name() {
        let backend = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/hello"))
            .respond_with(ResponseTemplate::new(200).set_body_string("from demo"))
            .mount(&backend)
            .await;

        let fx = fixture(GatewayConfig::default());
        fx.authority
            .registry()
            .register(DnsRecord::new("demo.n", "127.0.0.1", backend.address().port(), "custom"))
            .unwrap();

        let (status, _, body) = call(&fx.state, get_req("/hello", Some("Demo.N:8000"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"from demo");
        assert_eq!(fx.state.proxies.len(), 1);

        call(&fx.state, get_req("/hello", Some("demo.n"))).await;
        assert_eq!(fx.state.proxies.len(), 1);
    }

    #[tokio::test]
    async fn test_alias_routing() {
        let backend = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/panel"))
            .respond_with(ResponseTemplate::new(200).set_body_string("admin"))
            .mount(&backend)
            .await;

        let mut config = GatewayConfig::default();
        config.aliases.insert("admin.nexa".to_string(), backend.uri());
        let fx = fixture(config);

        let (status, _, body) = call(&fx.state, get_req("/panel", Some("admin.nexa"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"admin");
    }

    #[tokio::test]
    async fn test_path_routing_strips_prefix() {
        let backend = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/files/a.txt"))
            .respond_with(ResponseTemplate::new(200).set_body_string("file"))
            .mount(&backend)
            .await;

        let mut config = GatewayConfig::default();
        config.backends.insert("storage".to_string(), backend.uri());
        let fx = fixture(config);

        let (status, _, body) = call(&fx.state, get_req("/storage/files/a.txt", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"file");
    }

    #[tokio::test]
    async fn test_register_site() {
        let fx = fixture(GatewayConfig::default());
        let req = json_req(
            "POST",
            "/api/register-site",
            serde_json::json!({"name": "Blog.n", "ip": "10.0.0.8", "port": 8088, "service": "blog"}),
        );
        let (status, _, body) = call(&fx.state, req).await;
        assert_eq!(status, StatusCode::CREATED);
        let json: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["name"], "blog.n");
        assert_eq!(fx.authority.lookup("blog.n").unwrap().address(), "10.0.0.8:8088");
    }

    #[tokio::test]
    async fn test_relay_lifecycle() {
        let fx = fixture(GatewayConfig::default());
        let network = fx.state.expansion.network();
        for id in ["a", "b", "c"] {
            network
                .register_device(Device::new(id, id, DeviceRole::Node, "127.0.0.1", 1))
                .unwrap();
        }

        let req = json_req(
            "POST",
            "/api/network/relay",
            serde_json::json!({"source_id": "a", "target_id": "c", "intermediate_id": "b"}),
        );
        let (status, _, body) = call(&fx.state, req).await;
        assert_eq!(status, StatusCode::CREATED);
        let route: Value = serde_json::from_slice(&body).unwrap();
        let route_id = route["id"].as_str().unwrap().to_string();
        assert_eq!(route["priority"], 1);

        let (_, _, body) = call(&fx.state, get_req("/api/network/relay", None)).await;
        let routes: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(routes.as_array().unwrap().len(), 1);

        let (_, _, body) = call(&fx.state, get_req("/api/network/stats", None)).await;
        let stats: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(stats["total_connections"], 2);

        let req = axum::http::Request::builder()
            .method("DELETE")
            .uri(format!("/api/network/relay/{}", route_id))
            .body(Body::empty())
            .unwrap();
        let (status, _, _) = call(&fx.state, req).await;
        assert_eq!(status, StatusCode::OK);
        assert!(fx.state.expansion.relay_routes().is_empty());
    }

    #[tokio::test]
    async fn test_devices_listing() {
        let fx = fixture(GatewayConfig::default());
        fx.state
            .expansion
            .network()
            .register_device(Device::new("n1", "n1", DeviceRole::Node, "10.0.0.1", 1413))
            .unwrap();
        let (status, _, body) = call(&fx.state, get_req("/api/network/devices", None)).await;
        assert_eq!(status, StatusCode::OK);
        let devices: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(devices[0]["id"], "n1");
    }

    #[tokio::test]
    async fn test_server_binds_and_stops() {
        let fx = fixture(GatewayConfig::default());
        let server = GatewayServer::bind("127.0.0.1:0".parse().unwrap(), fx.state.clone())
            .await
            .unwrap();
        let handle = server.spawn().unwrap();
        let url = format!("http://{}/health", handle.local_addr());
        let response = reqwest::get(&url).await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        handle.shutdown();
        handle.shutdown();
        handle.join().await;
    }

    // ==================== NEGATIVE TESTS ====================

    #[tokio::test]
    async fn test_unknown_route_404() {
        let fx = fixture(GatewayConfig::default());
        let (status, _, body) = call(&fx.state, get_req("/nope", None)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let json: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"], "Route not found");
        assert_eq!(json["path"], "/nope");
    }

    #[tokio::test]
    async fn test_wildcard_host_falls_through() {
        let fx = fixture(GatewayConfig::default());
        let (status, _, body) = call(&fx.state, get_req("/anything", Some("unknown.nexa"))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let json: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"], "Route not found");
        assert!(fx.state.proxies.is_empty());

        // Normal routes still work under a wildcard host
        let (status, _, _) = call(&fx.state, get_req("/health", Some("unknown.nexa"))).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_dead_backend_is_503() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let fx = fixture(GatewayConfig::default());
        fx.authority
            .registry()
            .register(DnsRecord::new("down.n", "127.0.0.1", port, "custom"))
            .unwrap();
        let (status, _, body) = call(&fx.state, get_req("/", Some("down.n"))).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body, b"Service Unavailable");

        // The gateway keeps serving other requests
        let (status, _, _) = call(&fx.state, get_req("/health", None)).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_relay_with_missing_device_is_400() {
        let fx = fixture(GatewayConfig::default());
        let req = json_req(
            "POST",
            "/api/network/relay",
            serde_json::json!({"source_id": "a", "target_id": "b", "intermediate_id": "ghost"}),
        );
        let (status, _, body) = call(&fx.state, req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let json: Value = serde_json::from_slice(&body).unwrap();
        assert!(json["error"].as_str().unwrap().contains("not found"));
        assert!(fx.state.expansion.relay_routes().is_empty());
    }

    #[tokio::test]
    async fn test_connect_unknown_device_is_400() {
        let fx = fixture(GatewayConfig::default());
        let req = axum::http::Request::builder()
            .method("POST")
            .uri("/api/network/connect/ghost")
            .body(Body::empty())
            .unwrap();
        let (status, _, body) = call(&fx.state, req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let json: Value = serde_json::from_slice(&body).unwrap();
        assert!(json["error"].is_string());
    }

    #[tokio::test]
    async fn test_register_site_bad_body() {
        let fx = fixture(GatewayConfig::default());
        let req = json_req("POST", "/api/register-site", serde_json::json!({"name": "x.n"}));
        let (status, _, _) = call(&fx.state, req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let req = json_req(
            "POST",
            "/api/register-site",
            serde_json::json!({"name": "x.n", "ip": "nope", "port": 80}),
        );
        let (status, _, _) = call(&fx.state, req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_disconnect_unknown_device_is_400() {
        let fx = fixture(GatewayConfig::default());
        let req = axum::http::Request::builder()
            .method("DELETE")
            .uri("/api/network/disconnect/ghost")
            .body(Body::empty())
            .unwrap();
        let (status, _, _) = call(&fx.state, req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_bind_conflict_is_fatal() {
        let fx = fixture(GatewayConfig::default());
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap();
        assert!(matches!(
            GatewayServer::bind(addr, fx.state.clone()).await,
            Err(GatewayError::Bind { .. })
        ));
    }
}
