//! TCP/TLS listener for the name authority line protocol

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use nexa_core::AUTHORITY_IDLE_TIMEOUT;

use crate::authority::NameAuthority;
use crate::protocol::{Response, STATUS_BAD_REQUEST};
use crate::{DnsError, Result};

/// Longest request line accepted before the connection is dropped
pub const MAX_LINE_LEN: usize = 4096;

const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

pub struct AuthorityServer {
    listener: TcpListener,
    authority: Arc<NameAuthority>,
    acceptor: Option<TlsAcceptor>,
    idle_timeout: Duration,
}

impl AuthorityServer {
    /// Bind the listener. Failure here is fatal for the node.
    pub async fn bind(addr: SocketAddr, authority: Arc<NameAuthority>) -> Result<Self> {
        let listener = TcpListener::bind(addr).await.map_err(|e| DnsError::Bind {
            addr: addr.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            listener,
            authority,
            acceptor: None,
            idle_timeout: AUTHORITY_IDLE_TIMEOUT,
        })
    }

    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.acceptor = Some(acceptor);
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `shutdown` flips, one task per connection
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let tls = if self.acceptor.is_some() { " (TLS)" } else { "" };
        match self.listener.local_addr() {
            Ok(addr) => info!("Name authority listening on {}{}", addr, tls),
            Err(e) => debug!("Name authority address unavailable: {}", e),
        }

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let _ = stream.set_nodelay(true);
                            let authority = self.authority.clone();
                            let acceptor = self.acceptor.clone();
                            let idle = self.idle_timeout;
                            tokio::spawn(async move {
                                let outcome = match acceptor {
                                    Some(acceptor) => {
                                        match tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await {
                                            Ok(Ok(tls)) => handle_connection(tls, authority, idle).await,
                                            Ok(Err(e)) => Err(e.into()),
                                            Err(_) => Err(DnsError::Io(std::io::Error::new(
                                                std::io::ErrorKind::TimedOut,
                                                "TLS handshake timed out",
                                            ))),
                                        }
                                    }
                                    None => handle_connection(stream, authority, idle).await,
                                };
                                if let Err(e) = outcome {
                                    warn!("Authority connection {} ended: {}", peer, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown.changed() => {
                    info!("Name authority shutting down");
                    break;
                }
            }
        }
    }

    /// Run on a background task
    pub fn spawn(self) -> Result<AuthorityHandle> {
        let addr = self.local_addr()?;
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(self.run(stop_rx));
        Ok(AuthorityHandle {
            addr,
            stop: Mutex::new(Some(stop_tx)),
            task: Mutex::new(Some(task)),
        })
    }
}

/// Serve request lines until EOF, idle timeout or a protocol violation
pub async fn handle_connection<S>(
    stream: S,
    authority: Arc<NameAuthority>,
    idle_timeout: Duration,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(reader);
    let mut raw = Vec::with_capacity(256);

    loop {
        raw.clear();
        let mut limited = (&mut reader).take(MAX_LINE_LEN as u64 + 1);
        let bytes_read = match tokio::time::timeout(idle_timeout, limited.read_until(b'\n', &mut raw)).await {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                debug!("Authority connection idle, closing");
                return Ok(());
            }
        };
        if bytes_read == 0 {
            return Ok(());
        }
        if bytes_read > MAX_LINE_LEN && raw.last() != Some(&b'\n') {
            warn!("Request line over {} bytes, closing connection", MAX_LINE_LEN);
            let reply = Response::error(STATUS_BAD_REQUEST, "Line too long");
            writer.write_all(format!("{}\n", reply).as_bytes()).await?;
            writer.flush().await?;
            return Ok(());
        }

        let line = match std::str::from_utf8(&raw) {
            Ok(line) => line,
            Err(e) => {
                warn!("Request line is not valid UTF-8: {}", e);
                let reply = Response::error(STATUS_BAD_REQUEST, "Invalid UTF-8");
                writer.write_all(format!("{}\n", reply).as_bytes()).await?;
                writer.flush().await?;
                continue;
            }
        };

        if let Some(response) = authority.handle_line(line) {
            writer.write_all(format!("{}\n", response).as_bytes()).await?;
            writer.flush().await?;
        }
    }
}

/// Handle to a spawned authority listener
pub struct AuthorityHandle {
    addr: SocketAddr,
    stop: Mutex<Option<watch::Sender<bool>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl AuthorityHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting. Connections already open finish on their own.
    pub fn shutdown(&self) {
        if let Some(tx) = self.stop.lock().take() {
            let _ = tx.send(true);
        }
    }

    /// Wait for the accept loop to exit
    pub async fn join(&self) {
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl Drop for AuthorityHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
