//! Nexa Gateway
//!
//! HTTP entry point of a node. Requests are routed in this order:
//!
//! 1. Host header: static aliases (`admin.nexa`, ...) then names registered
//!    with the name authority (`demo.n` -> `http://ip:port`)
//! 2. Fixed path prefixes (`/admin`, `/storage`, `/chat`, `/dashboard`),
//!    forwarded with the prefix stripped
//! 3. The JSON management API under `/api`
//!
//! Backends that cannot be reached yield `503 Service Unavailable`.

mod api;
mod config;
mod error;
mod middleware;
mod proxy;
mod server;

pub use config::{default_aliases, GatewayConfig, PATH_BACKENDS};
pub use error::{ApiError, GatewayError, Result};
pub use middleware::{client_ip, request_host, RealIp};
pub use proxy::{rewrite_path, ProxyCache, ReverseProxy, MAX_PROXY_BODY};
pub use server::{router, GatewayHandle, GatewayServer, GatewayState};
