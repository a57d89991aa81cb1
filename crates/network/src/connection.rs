//! Connection Handler
//!
//! Owns one framed TCP or TLS session to one device. Frames are written
//! either directly (`send_message`) or through an outbound queue drained by
//! a per-session send loop (`queue_message`). Failures on either path mark
//! the device offline and are reported on an error channel that the
//! heartbeat task consumes to drive reconnection.
//!
//! Reconnection is bounded: `max_retries` attempts with a linear backoff of
//! `reconnect_wait * attempt`. Once exhausted the handler is closed for good
//! and the device stays offline.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use nexa_core::{
    ConnectionType, Device, DEFAULT_CONNECT_TIMEOUT, DEFAULT_HEARTBEAT_INTERVAL,
    DEFAULT_MAX_RETRIES, DEFAULT_RECONNECT_WAIT,
};

use crate::protocol::{write_frame, Envelope, FrameReader};
use crate::tls::ClientTls;
use crate::{NetworkError, Result};

/// Outbound queue depth per session
const OUTBOUND_QUEUE_SIZE: usize = 256;
/// Pending transport errors kept for the reconnect supervisor
const ERROR_QUEUE_SIZE: usize = 16;

/// Byte stream a session runs over
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> Transport for T {}

type BoxedTransport = Box<dyn Transport>;

/// Receives device state changes made by a handler.
///
/// Keeps handlers independent of the topology's locking.
pub trait DeviceStatusSink: Send + Sync {
    fn set_online(&self, device_id: &str, online: bool);
    fn record_latency(&self, device_id: &str, latency: Duration);
    fn record_error_rate(&self, device_id: &str, error_rate: f64);
}

/// Session parameters
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Id this node puts on heartbeats and pings
    pub local_id: String,
    pub connection_type: ConnectionType,
    pub timeout: Duration,
    pub max_retries: u32,
    pub heartbeat_interval: Duration,
    pub reconnect_wait: Duration,
    /// TLS for link types that support it
    pub tls: Option<ClientTls>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            local_id: "local".to_string(),
            connection_type: ConnectionType::Wifi,
            timeout: DEFAULT_CONNECT_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            reconnect_wait: DEFAULT_RECONNECT_WAIT,
            tls: None,
        }
    }
}

struct HandlerState {
    connected: bool,
    /// Set by `disconnect()` or exhausted retries; the handler is never reused
    closed: bool,
    last_message: Instant,
    messages_sent: u64,
    errors: u64,
    session_stop: Option<watch::Sender<bool>>,
    heartbeat_stop: Option<watch::Sender<bool>>,
}

/// Framed session to one device
pub struct ConnectionHandler {
    device_id: String,
    ip: String,
    port: u16,
    signal_strength: i32,
    config: ConnectionConfig,
    sink: Arc<dyn DeviceStatusSink>,
    state: Mutex<HandlerState>,
    reader: tokio::sync::Mutex<Option<FrameReader<ReadHalf<BoxedTransport>>>>,
    writer: tokio::sync::Mutex<Option<WriteHalf<BoxedTransport>>>,
    outbound_tx: mpsc::Sender<Vec<u8>>,
    outbound_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>>,
    error_tx: mpsc::Sender<String>,
    error_rx: Mutex<Option<mpsc::Receiver<String>>>,
}

impl ConnectionHandler {
    pub fn new(
        device: &Device,
        config: ConnectionConfig,
        sink: Arc<dyn DeviceStatusSink>,
    ) -> Arc<Self> {
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_SIZE);
        let (error_tx, error_rx) = mpsc::channel(ERROR_QUEUE_SIZE);
        Arc::new(Self {
            device_id: device.id.clone(),
            ip: device.ip.clone(),
            port: device.dial_port(config.connection_type),
            signal_strength: device.signal_strength,
            config,
            sink,
            state: Mutex::new(HandlerState {
                connected: false,
                closed: false,
                last_message: Instant::now(),
                messages_sent: 0,
                errors: 0,
                session_stop: None,
                heartbeat_stop: None,
            }),
            reader: tokio::sync::Mutex::new(None),
            writer: tokio::sync::Mutex::new(None),
            outbound_tx,
            outbound_rx: Arc::new(tokio::sync::Mutex::new(outbound_rx)),
            error_tx,
            error_rx: Mutex::new(Some(error_rx)),
        })
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    pub fn connection_type(&self) -> ConnectionType {
        self.config.connection_type
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn last_message_time(&self) -> Instant {
        self.state.lock().last_message
    }

    /// Time since the last successful send or receive, as seen at `now`
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_message_time())
    }

    /// Failed sends as a percentage of all sends
    pub fn error_rate(&self) -> f64 {
        let state = self.state.lock();
        if state.messages_sent == 0 {
            0.0
        } else {
            state.errors as f64 / state.messages_sent as f64 * 100.0
        }
    }

    async fn dial(&self) -> Result<BoxedTransport> {
        let address = self.address();
        let tcp = tokio::time::timeout(self.config.timeout, TcpStream::connect(&address))
            .await
            .map_err(|_| NetworkError::ConnectFailed {
                address: address.clone(),
                reason: "timed out".to_string(),
            })?
            .map_err(|e| NetworkError::ConnectFailed {
                address: address.clone(),
                reason: e.to_string(),
            })?;
        let _ = tcp.set_nodelay(true);

        match &self.config.tls {
            Some(tls) if self.config.connection_type.supports_tls() => {
                let server_name = tls.server_name()?;
                let stream = tokio::time::timeout(
                    self.config.timeout,
                    tls.connector().connect(server_name, tcp),
                )
                .await
                .map_err(|_| NetworkError::Tls(format!("handshake with {} timed out", address)))?
                .map_err(|e| NetworkError::Tls(format!("handshake with {}: {}", address, e)))?;
                Ok(Box::new(stream))
            }
            _ => Ok(Box::new(tcp)),
        }
    }

    /// Open the session and mark the device online
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        {
            let state = self.state.lock();
            if state.closed {
                return Err(NetworkError::HandlerClosed(self.device_id.clone()));
            }
            if state.connected {
                return Err(NetworkError::AlreadyConnected(self.device_id.clone()));
            }
        }

        let stream = self.dial().await?;
        self.open_session(stream).await
    }

    /// Install a dialed stream. A `disconnect()` that raced the dial wins and
    /// the stream is dropped.
    async fn open_session(self: &Arc<Self>, stream: BoxedTransport) -> Result<()> {
        if self.is_closed() {
            return Err(NetworkError::HandlerClosed(self.device_id.clone()));
        }
        let (read_half, write_half) = tokio::io::split(stream);
        *self.reader.lock().await = Some(FrameReader::new(read_half));
        *self.writer.lock().await = Some(write_half);

        let (stop_tx, stop_rx) = watch::channel(false);
        let closed = {
            let mut state = self.state.lock();
            if !state.closed {
                state.connected = true;
                state.last_message = Instant::now();
                state.session_stop = Some(stop_tx);
            }
            state.closed
        };
        if closed {
            self.writer.lock().await.take();
            self.reader.lock().await.take();
            debug!("Dropping session to {}: closed during connect", self.device_id);
            return Err(NetworkError::HandlerClosed(self.device_id.clone()));
        }
        self.sink.set_online(&self.device_id, true);

        let handler = self.clone();
        tokio::spawn(async move { handler.send_loop(stop_rx).await });

        info!(
            "Connected to device {} at {} via {}",
            self.device_id,
            self.address(),
            self.config.connection_type
        );
        Ok(())
    }

    /// Stop all tasks and close the socket. Safe to call more than once.
    pub async fn disconnect(&self) {
        let (session_stop, heartbeat_stop, was_connected) = {
            let mut state = self.state.lock();
            let was_connected = state.connected;
            state.connected = false;
            state.closed = true;
            (state.session_stop.take(), state.heartbeat_stop.take(), was_connected)
        };
        if let Some(tx) = session_stop {
            let _ = tx.send(true);
        }
        if let Some(tx) = heartbeat_stop {
            let _ = tx.send(true);
        }

        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        self.reader.lock().await.take();

        if was_connected {
            self.sink.set_online(&self.device_id, false);
            info!("Disconnected from device {}", self.device_id);
        }
    }

    /// Serialize `payload` to JSON and write it as one frame
    pub async fn send_message<T: Serialize>(&self, payload: &T) -> Result<()> {
        let bytes = serde_json::to_vec(payload)?;
        self.write_bytes(&bytes).await
    }

    /// Serialize `payload` and hand it to the session's send loop
    pub fn queue_message<T: Serialize>(&self, payload: &T) -> Result<()> {
        if !self.is_connected() {
            return Err(NetworkError::NotConnected(self.device_id.clone()));
        }
        let bytes = serde_json::to_vec(payload)?;
        self.outbound_tx.try_send(bytes).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => NetworkError::Io(std::io::Error::new(
                std::io::ErrorKind::WouldBlock,
                "outbound queue full",
            )),
            mpsc::error::TrySendError::Closed(_) => {
                NetworkError::NotConnected(self.device_id.clone())
            }
        })
    }

    async fn write_bytes(&self, bytes: &[u8]) -> Result<()> {
        if !self.is_connected() {
            return Err(NetworkError::NotConnected(self.device_id.clone()));
        }
        let result = {
            let mut guard = self.writer.lock().await;
            match guard.as_mut() {
                Some(writer) => write_frame(writer, bytes).await,
                None => Err(NetworkError::NotConnected(self.device_id.clone())),
            }
        };

        match &result {
            Ok(()) => self.record_send(true),
            Err(NetworkError::NotConnected(_)) => {}
            Err(e) if e.is_protocol_violation() => self.record_send(false),
            Err(e) => {
                self.record_send(false);
                self.handle_connection_error(e);
            }
        }
        result
    }

    /// Read one frame, waiting at most `timeout`.
    ///
    /// A timeout leaves the session intact. Oversized or zero-length frames
    /// and transport failures close it.
    pub async fn receive_message(&self, timeout: Duration) -> Result<Vec<u8>> {
        let mut stop_rx = {
            let state = self.state.lock();
            match (&state.session_stop, state.connected) {
                (Some(tx), true) => tx.subscribe(),
                _ => return Err(NetworkError::NotConnected(self.device_id.clone())),
            }
        };

        let result = {
            let mut guard = self.reader.lock().await;
            let reader = guard
                .as_mut()
                .ok_or_else(|| NetworkError::NotConnected(self.device_id.clone()))?;
            tokio::select! {
                read = tokio::time::timeout(timeout, reader.read_frame()) => match read {
                    Ok(result) => result,
                    Err(_) => return Err(NetworkError::Timeout),
                },
                _ = stop_rx.changed() => Err(NetworkError::NotConnected(self.device_id.clone())),
            }
        };

        match &result {
            Ok(_) => self.state.lock().last_message = Instant::now(),
            Err(NetworkError::NotConnected(_)) => {}
            Err(e) => {
                if e.is_protocol_violation() {
                    warn!("Protocol violation from {}: {}", self.device_id, e);
                }
                self.handle_connection_error(e);
            }
        }
        result
    }

    /// Receive and decode one [`Envelope`]
    pub async fn receive_envelope(&self, timeout: Duration) -> Result<Envelope> {
        let bytes = self.receive_message(timeout).await?;
        Envelope::from_bytes(&bytes)
    }

    /// Time taken to write a ping frame.
    ///
    /// No reply is awaited, so this is a send latency and not a round trip.
    pub async fn measure_send_latency(&self) -> Result<Duration> {
        let start = Instant::now();
        self.send_message(&Envelope::ping(&self.config.local_id)).await?;
        let latency = start.elapsed();
        self.sink.record_latency(&self.device_id, latency);
        Ok(latency)
    }

    pub async fn send_heartbeat(&self) -> Result<()> {
        self.send_message(&Envelope::heartbeat(&self.config.local_id, self.signal_strength))
            .await
    }

    fn record_send(&self, ok: bool) {
        let rate = {
            let mut state = self.state.lock();
            state.messages_sent += 1;
            if ok {
                state.last_message = Instant::now();
            } else {
                state.errors += 1;
            }
            state.errors as f64 / state.messages_sent as f64 * 100.0
        };
        self.sink.record_error_rate(&self.device_id, rate);
    }

    /// Tear down the current session after a transport failure
    fn handle_connection_error(&self, err: &NetworkError) {
        let session_stop = {
            let mut state = self.state.lock();
            if !state.connected {
                return;
            }
            state.connected = false;
            state.session_stop.take()
        };
        if let Some(tx) = session_stop {
            let _ = tx.send(true);
        }
        if let Ok(mut writer) = self.writer.try_lock() {
            writer.take();
        }
        if let Ok(mut reader) = self.reader.try_lock() {
            reader.take();
        }
        self.sink.set_online(&self.device_id, false);
        warn!("Connection to {} lost: {}", self.device_id, err);
        let _ = self.error_tx.try_send(err.to_string());
    }

    /// Retry the session with linear backoff.
    ///
    /// On exhaustion the handler is closed and the device left offline.
    pub async fn attempt_reconnect(self: &Arc<Self>) -> Result<()> {
        for attempt in 1..=self.config.max_retries {
            if self.is_closed() {
                return Err(NetworkError::HandlerClosed(self.device_id.clone()));
            }
            let wait = self.config.reconnect_wait * attempt;
            debug!(
                "Reconnecting to {} (attempt {}/{}) in {:?}",
                self.device_id, attempt, self.config.max_retries, wait
            );
            tokio::time::sleep(wait).await;

            match self.connect().await {
                Ok(()) | Err(NetworkError::AlreadyConnected(_)) => {
                    info!("Reconnected to {} on attempt {}", self.device_id, attempt);
                    return Ok(());
                }
                Err(e @ NetworkError::HandlerClosed(_)) => return Err(e),
                Err(e) => debug!("Reconnect attempt {} to {} failed: {}", attempt, self.device_id, e),
            }
        }

        let heartbeat_stop = {
            let mut state = self.state.lock();
            state.connected = false;
            state.closed = true;
            state.heartbeat_stop.take()
        };
        if let Some(tx) = heartbeat_stop {
            let _ = tx.send(true);
        }
        self.sink.set_online(&self.device_id, false);
        error!(
            "Giving up on {} after {} reconnect attempts",
            self.device_id, self.config.max_retries
        );
        Err(NetworkError::ReconnectExhausted {
            device_id: self.device_id.clone(),
            attempts: self.config.max_retries,
        })
    }

    /// Spawn the heartbeat task. A second call is a no-op.
    pub fn start_heartbeat(self: &Arc<Self>) {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        {
            let mut state = self.state.lock();
            if state.heartbeat_stop.is_some() || state.closed {
                return;
            }
            state.heartbeat_stop = Some(stop_tx);
        }
        let mut error_rx = self.error_rx.lock().take();
        let handler = self.clone();
        let period = self.config.heartbeat_interval.max(Duration::from_millis(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    _ = ticker.tick() => {
                        if handler.is_connected() {
                            if let Err(e) = handler.send_heartbeat().await {
                                debug!("Heartbeat to {} failed: {}", handler.device_id, e);
                            } else {
                                continue;
                            }
                        }
                        if handler.attempt_reconnect().await.is_err() {
                            break;
                        }
                    }
                    Some(reason) = next_error(&mut error_rx) => {
                        debug!("Transport error on {}: {}", handler.device_id, reason);
                        if !handler.is_connected() && handler.attempt_reconnect().await.is_err() {
                            break;
                        }
                    }
                }
            }
            debug!("Heartbeat for {} stopped", handler.device_id);
        });
    }

    /// Stop the heartbeat task without closing the session
    pub fn stop_heartbeat(&self) {
        if let Some(tx) = self.state.lock().heartbeat_stop.take() {
            let _ = tx.send(true);
        }
    }

    async fn send_loop(self: Arc<Self>, mut stop_rx: watch::Receiver<bool>) {
        let outbound = self.outbound_rx.clone();
        let mut queue = outbound.lock().await;
        loop {
            tokio::select! {
                _ = stop_rx.changed() => break,
                next = queue.recv() => match next {
                    Some(bytes) => {
                        if let Err(e) = self.write_bytes(&bytes).await {
                            debug!("Queued send to {} failed: {}", self.device_id, e);
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
    }
}

async fn next_error(rx: &mut Option<mpsc::Receiver<String>>) -> Option<String> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
