//! Name authority client
//!
//! Each request opens a fresh connection, sends one line and reads one
//! reply.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::debug;

use nexa_core::DnsRecord;
use nexa_network::tls::ClientTls;
use nexa_network::NetworkError;

use crate::authority::{NameResolver, Resolution};
use crate::protocol::{Request, Response, STATUS_NOT_FOUND};
use crate::{DnsError, Result};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct AuthorityClient {
    addr: String,
    tls: Option<ClientTls>,
    timeout: Duration,
}

impl AuthorityClient {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            tls: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_tls(mut self, tls: ClientTls) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Send one request and return the parsed reply, whatever its code
    pub async fn send(&self, request: &Request) -> Result<Response> {
        let line = request.to_line();
        tokio::time::timeout(self.timeout, self.send_line(&line))
            .await
            .map_err(|_| DnsError::Network(NetworkError::Timeout))?
    }

    async fn send_line(&self, line: &str) -> Result<Response> {
        let tcp = TcpStream::connect(&self.addr).await.map_err(|e| {
            DnsError::Network(NetworkError::ConnectFailed {
                address: self.addr.clone(),
                reason: e.to_string(),
            })
        })?;
        let _ = tcp.set_nodelay(true);

        match &self.tls {
            Some(tls) => {
                let stream = tls
                    .connector()
                    .connect(tls.server_name()?, tcp)
                    .await
                    .map_err(|e| NetworkError::Tls(format!("handshake with {}: {}", self.addr, e)))?;
                exchange(stream, line).await
            }
            None => exchange(tcp, line).await,
        }
    }

    /// Send and turn any non-2xx reply into [`DnsError::Rejected`]
    async fn expect_success(&self, request: &Request) -> Result<Response> {
        let response = self.send(request).await?;
        if response.is_success() {
            Ok(response)
        } else {
            Err(DnsError::Rejected {
                code: response.code,
                message: response.body,
            })
        }
    }

    /// Number of records the authority holds
    pub async fn ping(&self) -> Result<usize> {
        let response = self.expect_success(&Request::Ping).await?;
        response
            .body
            .trim_start_matches("Records:")
            .trim()
            .parse()
            .map_err(|_| DnsError::InvalidResponse(response.to_string()))
    }

    /// `None` when the authority answers 404
    pub async fn lookup(&self, name: &str) -> Result<Option<Resolution>> {
        let response = self
            .send(&Request::Resolve { name: name.to_string() })
            .await?;
        match response.code {
            STATUS_NOT_FOUND => Ok(None),
            _ if response.is_success() => Resolution::parse_body(&response.body)
                .map(Some)
                .ok_or_else(|| DnsError::InvalidResponse(response.to_string())),
            code => Err(DnsError::Rejected { code, message: response.body }),
        }
    }

    pub async fn register_record(&self, record: &DnsRecord) -> Result<()> {
        self.expect_success(&Request::Register(record.clone())).await?;
        Ok(())
    }

    pub async fn update(&self, record: &DnsRecord) -> Result<()> {
        self.expect_success(&Request::Update(record.clone())).await?;
        Ok(())
    }

    pub async fn delete(&self, name: &str) -> Result<()> {
        self.expect_success(&Request::Delete { name: name.to_string() })
            .await?;
        Ok(())
    }

    pub async fn list(&self) -> Result<Vec<String>> {
        let response = self.expect_success(&Request::List).await?;
        Ok(response
            .body
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect())
    }
}

async fn exchange<S>(stream: S, line: &str) -> Result<Response>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (reader, mut writer) = tokio::io::split(stream);
    debug!("Sending: {}", line);
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;

    let mut reader = BufReader::new(reader);
    let mut reply = String::new();
    reader.read_line(&mut reply).await?;
    debug!("Received: {}", reply.trim_end());
    Response::parse(&reply).ok_or_else(|| DnsError::InvalidResponse(reply.trim_end().to_string()))
}

#[async_trait]
impl NameResolver for AuthorityClient {
    async fn resolve(&self, name: &str) -> Result<Option<Resolution>> {
        self.lookup(name).await
    }

    async fn register(&self, record: DnsRecord) -> Result<()> {
        self.register_record(&record).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authority::{AuthorityConfig, NameAuthority};
    use crate::registry::DnsRegistry;
    use crate::server::{AuthorityHandle, AuthorityServer};
    use std::sync::Arc;

    async fn start() -> (AuthorityHandle, AuthorityClient) {
        let authority = Arc::new(NameAuthority::new(
            Arc::new(DnsRegistry::in_memory()),
            AuthorityConfig::default(),
        ));
        let handle = AuthorityServer::bind("127.0.0.1:0".parse().unwrap(), authority)
            .await
            .unwrap()
            .spawn()
            .unwrap();
        let client = AuthorityClient::new(handle.local_addr().to_string());
        (handle, client)
    }

    #[tokio::test]
    async fn test_client_round_trip() {
        let (_handle, client) = start().await;
        assert_eq!(client.ping().await.unwrap(), 0);

        client
            .register_record(&DnsRecord::new("demo.n", "10.0.0.5", 9090, "custom"))
            .await
            .unwrap();
        let found = client.lookup("demo.n").await.unwrap().unwrap();
        assert_eq!(found.address(), "10.0.0.5:9090");
        assert!(!found.wildcard);
        assert_eq!(client.list().await.unwrap(), vec!["demo.n"]);
        assert_eq!(client.ping().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_client_update_delete() {
        let (_handle, client) = start().await;
        client
            .register_record(&DnsRecord::new("demo.n", "10.0.0.5", 9090, "custom"))
            .await
            .unwrap();
        client
            .update(&DnsRecord::new("demo.n", "10.0.0.6", 80, "web"))
            .await
            .unwrap();
        assert_eq!(
            client.lookup("demo.n").await.unwrap().unwrap().address(),
            "10.0.0.6:80"
        );
        client.delete("demo.n").await.unwrap();
        assert!(client.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_client_wildcard_flag() {
        let (_handle, client) = start().await;
        let found = NameResolver::resolve(&client, "anything.nexa").await.unwrap().unwrap();
        assert!(found.wildcard);
    }

    // ==================== NEGATIVE TESTS ====================

    #[tokio::test]
    async fn test_client_not_found() {
        let (_handle, client) = start().await;
        assert!(client.lookup("example.com").await.unwrap().is_none());
        assert!(matches!(
            client.delete("ghost.n").await,
            Err(DnsError::Rejected { code: 404, .. })
        ));
    }

    #[tokio::test]
    async fn test_client_rejected_register() {
        let (_handle, client) = start().await;
        let err = client
            .register_record(&DnsRecord::new("bad.n", "not-an-ip", 80, "web"))
            .await
            .unwrap_err();
        assert!(matches!(err, DnsError::Rejected { code: 400, .. }));
    }

    #[tokio::test]
    async fn test_client_unreachable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let client = AuthorityClient::new(addr.to_string());
        assert!(matches!(
            client.ping().await,
            Err(DnsError::Network(NetworkError::ConnectFailed { .. }))
        ));
    }
}
