//! Name authority
//!
//! Answers the line protocol against a [`DnsRegistry`] and provides the
//! in-process [`NameResolver`] the gateway uses. Names under a managed
//! suffix always resolve: a miss falls back to a wildcard answer that points
//! at the gateway's own HTTP port.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, warn};

use nexa_core::{DnsRecord, DEFAULT_GATEWAY_PORT, MANAGED_SUFFIXES};
use nexa_network::NetworkManager;

use crate::protocol::{
    Request, Response, STATUS_BAD_REQUEST, STATUS_CREATED, STATUS_NOT_FOUND, STATUS_OK,
    STATUS_SERVER_ERROR,
};
use crate::registry::{normalize_name, DnsRegistry};
use crate::{DnsError, Result};

/// Service name reported for wildcard answers
pub const WILDCARD_SERVICE: &str = "gateway";

/// Trailing RESOLVED body field that tags a synthesized answer
pub const WILDCARD_MARKER: &str = "wildcard";

/// Service name under which query metrics are published
pub const METRICS_SERVICE: &str = "dns";

/// Whether `name` sits under one of `suffixes` with at least one label before it
pub fn is_managed_name(name: &str, suffixes: &[String]) -> bool {
    let name = normalize_name(name);
    suffixes.iter().any(|suffix| {
        let suffix = suffix.to_ascii_lowercase();
        name.len() > suffix.len() && name.ends_with(&suffix)
    })
}

/// Address a name resolved to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub ip: String,
    pub port: u16,
    pub service: String,
    /// Synthesized from the managed suffix rather than a registered record
    pub wildcard: bool,
}

impl Resolution {
    pub fn address(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    /// `ip:port|service=<service>`, the RESOLVED body. Synthesized answers
    /// carry a trailing `|wildcard` marker.
    pub fn to_body(&self) -> String {
        let mut body = format!("{}:{}|service={}", self.ip, self.port, self.service);
        if self.wildcard {
            body.push('|');
            body.push_str(WILDCARD_MARKER);
        }
        body
    }

    pub fn parse_body(body: &str) -> Option<Self> {
        let (address, rest) = body.split_once("|service=")?;
        let (ip, port) = address.rsplit_once(':')?;
        let mut fields = rest.split('|');
        let service = fields.next().unwrap_or_default().to_string();
        let wildcard = fields.any(|field| field == WILDCARD_MARKER);
        Some(Self {
            ip: ip.to_string(),
            port: port.parse().ok()?,
            service,
            wildcard,
        })
    }
}

impl From<DnsRecord> for Resolution {
    fn from(record: DnsRecord) -> Self {
        Self {
            ip: record.ip,
            port: record.port,
            service: record.service,
            wildcard: false,
        }
    }
}

/// Name lookup and registration, local or remote
#[async_trait]
pub trait NameResolver: Send + Sync {
    async fn resolve(&self, name: &str) -> Result<Option<Resolution>>;
    async fn register(&self, record: DnsRecord) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct AuthorityConfig {
    pub suffixes: Vec<String>,
    /// Address handed out in wildcard answers
    pub gateway_ip: String,
    pub gateway_port: u16,
}

impl Default for AuthorityConfig {
    fn default() -> Self {
        Self {
            suffixes: MANAGED_SUFFIXES.iter().map(|s| s.to_string()).collect(),
            gateway_ip: "127.0.0.1".to_string(),
            gateway_port: DEFAULT_GATEWAY_PORT,
        }
    }
}

pub struct NameAuthority {
    registry: Arc<DnsRegistry>,
    config: AuthorityConfig,
    queries: AtomicU64,
}

impl NameAuthority {
    pub fn new(registry: Arc<DnsRegistry>, config: AuthorityConfig) -> Self {
        Self {
            registry,
            config,
            queries: AtomicU64::new(0),
        }
    }

    pub fn registry(&self) -> &Arc<DnsRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &AuthorityConfig {
        &self.config
    }

    pub fn is_managed(&self, name: &str) -> bool {
        is_managed_name(name, &self.config.suffixes)
    }

    /// Registered record first, then the wildcard for managed names
    pub fn lookup(&self, name: &str) -> Option<Resolution> {
        if let Some(record) = self.registry.resolve(name) {
            return Some(record.into());
        }
        if self.is_managed(name) {
            return Some(Resolution {
                ip: self.config.gateway_ip.clone(),
                port: self.config.gateway_port,
                service: WILDCARD_SERVICE.to_string(),
                wildcard: true,
            });
        }
        None
    }

    /// Answer one request line. Blank lines produce no response.
    pub fn handle_line(&self, line: &str) -> Option<Response> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        self.queries.fetch_add(1, Ordering::Relaxed);
        let response = match Request::parse(line) {
            Ok(request) => self.handle(request),
            Err(response) => response,
        };
        debug!("{} -> {}", line, response);
        Some(response)
    }

    pub fn handle(&self, request: Request) -> Response {
        match request {
            Request::Ping => Response::ok(
                STATUS_OK,
                "PONG",
                format!("Records: {}", self.registry.len()),
            ),
            Request::Resolve { name } => match self.lookup(&name) {
                Some(resolution) => Response::ok(STATUS_OK, "RESOLVED", resolution.to_body()),
                None => Response::error(STATUS_NOT_FOUND, "Name not found"),
            },
            Request::Register(record) => match self.registry.register(record) {
                Ok(record) => Response::ok(STATUS_CREATED, "REGISTERED", record.name),
                Err(e) => store_error(e),
            },
            Request::Update(record) => match self.registry.update(record) {
                Ok(record) => Response::ok(STATUS_OK, "UPDATED", record.name),
                Err(e) => store_error(e),
            },
            Request::Delete { name } => match self.registry.delete(&name) {
                Ok(record) => Response::ok(STATUS_OK, "DELETED", record.name),
                Err(e) => store_error(e),
            },
            Request::List => Response::ok(STATUS_OK, "LIST", self.registry.list().join(",")),
        }
    }

    /// Queries answered since the last call
    pub fn take_query_count(&self) -> u64 {
        self.queries.swap(0, Ordering::Relaxed)
    }

    /// Publish query rate and record count under the `dns` service
    pub fn publish_metrics(&self, network: &NetworkManager, period: Duration) {
        let queries = self.take_query_count();
        let secs = period.as_secs_f64().max(f64::EPSILON);
        let mut metrics = HashMap::new();
        metrics.insert("queries_per_sec".to_string(), queries as f64 / secs);
        metrics.insert("active_records".to_string(), self.registry.len() as f64);
        // 1 = ready
        metrics.insert("status".to_string(), 1.0);
        network.update_service_metrics(METRICS_SERVICE, metrics);
    }

    /// Spawn the periodic metrics publisher
    pub fn start_metrics_reporter(
        self: &Arc<Self>,
        network: Arc<NetworkManager>,
        period: Duration,
    ) -> MetricsReporter {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let authority = Arc::clone(self);
        let period = period.max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    _ = ticker.tick() => authority.publish_metrics(&network, period),
                }
            }
            debug!("DNS metrics reporter stopped");
        });
        MetricsReporter {
            stop: Mutex::new(Some(stop_tx)),
        }
    }
}

fn store_error(e: DnsError) -> Response {
    match e {
        DnsError::NotFound(_) => Response::error(STATUS_NOT_FOUND, "Name not found"),
        DnsError::InvalidRecord(reason) => Response::error(STATUS_BAD_REQUEST, reason),
        e => {
            warn!("Name store failure: {}", e);
            Response::error(STATUS_SERVER_ERROR, "Failed to save record")
        }
    }
}

#[async_trait]
impl NameResolver for NameAuthority {
    async fn resolve(&self, name: &str) -> Result<Option<Resolution>> {
        self.queries.fetch_add(1, Ordering::Relaxed);
        Ok(self.lookup(name))
    }

    async fn register(&self, record: DnsRecord) -> Result<()> {
        self.registry.register(record)?;
        Ok(())
    }
}

/// Handle to the metrics task; stops it on drop
pub struct MetricsReporter {
    stop: Mutex<Option<watch::Sender<bool>>>,
}

impl MetricsReporter {
    pub fn stop(&self) {
        if let Some(tx) = self.stop.lock().take() {
            let _ = tx.send(true);
        }
    }
}

impl Drop for MetricsReporter {
    fn drop(&mut self) {
        self.stop();
    }
}
