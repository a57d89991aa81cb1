//! UDP responders for standard DNS and mDNS
//!
//! Queries for managed names are answered locally with the address of the
//! interface that received them. The unicast responder forwards everything
//! else verbatim to the upstream resolver and relays the reply unchanged.
//! The mDNS responder only ever answers managed names.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use nexa_core::{MDNS_GROUP, MDNS_PORT};
use nexa_network::{bind_multicast, bind_udp, local_ip_for};

use crate::authority::is_managed_name;
use crate::wire::DnsMessage;
use crate::{DnsError, Result};

/// TTL on synthesized answers
pub const ANSWER_TTL: u32 = 60;

const MAX_PACKET: usize = 4096;
const DEFAULT_FORWARD_TIMEOUT: Duration = Duration::from_secs(5);

/// What to do with one inbound packet
#[derive(Debug, PartialEq, Eq)]
pub enum Disposition {
    /// Send these bytes back
    Answer(Vec<u8>),
    /// Relay the raw packet upstream
    Forward,
    Ignore,
}

/// Decide how to handle `packet` received from `peer`
pub fn classify(packet: &[u8], peer: SocketAddr, suffixes: &[String]) -> Disposition {
    let query = match DnsMessage::decode(packet) {
        Ok(q) => q,
        Err(e) => {
            debug!("Dropping malformed query from {}: {}", peer, e);
            return Disposition::Ignore;
        }
    };
    if query.header.is_response() {
        return Disposition::Ignore;
    }
    let Some(name) = query.question_name() else {
        return Disposition::Ignore;
    };
    if !is_managed_name(name, suffixes) {
        return Disposition::Forward;
    }

    let local = match local_ip_for(peer.ip()) {
        Ok(IpAddr::V4(ip)) => ip,
        Ok(IpAddr::V6(_)) | Err(_) => Ipv4Addr::LOCALHOST,
    };
    match DnsMessage::answer(&query, local, ANSWER_TTL).encode() {
        Ok(bytes) => Disposition::Answer(bytes),
        Err(e) => {
            warn!("Failed to encode answer for {}: {}", name, e);
            Disposition::Ignore
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponderMode {
    /// Port 53 style: answer managed names, proxy the rest
    Unicast { upstream: SocketAddr },
    /// Multicast group member answering managed names only
    Multicast,
}

pub struct DnsResponder {
    socket: Arc<UdpSocket>,
    mode: ResponderMode,
    suffixes: Vec<String>,
    forward_timeout: Duration,
    stop: Mutex<Option<watch::Sender<bool>>>,
}

impl DnsResponder {
    pub fn bind_unicast(addr: SocketAddr, upstream: SocketAddr, suffixes: Vec<String>) -> Result<Self> {
        let socket = bind_udp(addr, false).map_err(|e| DnsError::Bind {
            addr: addr.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self::from_socket(socket, ResponderMode::Unicast { upstream }, suffixes))
    }

    pub fn bind_mdns(suffixes: Vec<String>) -> Result<Self> {
        let group = Ipv4Addr::from(MDNS_GROUP);
        let socket = bind_multicast(group, MDNS_PORT).map_err(|e| DnsError::Bind {
            addr: format!("{}:{}", group, MDNS_PORT),
            reason: e.to_string(),
        })?;
        Ok(Self::from_socket(socket, ResponderMode::Multicast, suffixes))
    }

    fn from_socket(socket: UdpSocket, mode: ResponderMode, suffixes: Vec<String>) -> Self {
        Self {
            socket: Arc::new(socket),
            mode,
            suffixes,
            forward_timeout: DEFAULT_FORWARD_TIMEOUT,
            stop: Mutex::new(None),
        }
    }

    pub fn with_forward_timeout(mut self, timeout: Duration) -> Self {
        self.forward_timeout = timeout;
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn is_running(&self) -> bool {
        self.stop.lock().is_some()
    }

    /// Spawn the receive loop. A second call is a no-op.
    pub fn start(self: &Arc<Self>) {
        let (stop_tx, stop_rx) = watch::channel(false);
        {
            let mut slot = self.stop.lock();
            if slot.is_some() {
                return;
            }
            *slot = Some(stop_tx);
        }
        match self.local_addr() {
            Ok(addr) => info!("DNS responder ({:?}) listening on {}", self.mode, addr),
            Err(e) => debug!("DNS responder address unavailable: {}", e),
        }
        let responder = Arc::clone(self);
        tokio::spawn(async move { responder.run(stop_rx).await });
    }

    pub fn stop(&self) {
        if let Some(tx) = self.stop.lock().take() {
            let _ = tx.send(true);
        }
    }

    async fn run(self: Arc<Self>, mut stop_rx: watch::Receiver<bool>) {
        let mut buf = vec![0u8; MAX_PACKET];
        loop {
            let (len, peer) = tokio::select! {
                _ = stop_rx.changed() => break,
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok(r) => r,
                    Err(e) => {
                        debug!("DNS receive error: {}", e);
                        continue;
                    }
                },
            };
            let packet = &buf[..len];
            match classify(packet, peer, &self.suffixes) {
                Disposition::Answer(reply) => {
                    let dest = self.reply_destination(packet, peer);
                    if let Err(e) = self.socket.send_to(&reply, dest).await {
                        debug!("Failed to answer {}: {}", dest, e);
                    }
                }
                Disposition::Forward => {
                    if let ResponderMode::Unicast { upstream } = self.mode {
                        tokio::spawn(forward(
                            Arc::clone(&self.socket),
                            packet.to_vec(),
                            peer,
                            upstream,
                            self.forward_timeout,
                        ));
                    }
                }
                Disposition::Ignore => {}
            }
        }
        debug!("DNS responder stopped");
    }

    fn reply_destination(&self, packet: &[u8], peer: SocketAddr) -> SocketAddr {
        match self.mode {
            ResponderMode::Unicast { .. } => peer,
            ResponderMode::Multicast => {
                let wants_unicast = DnsMessage::decode(packet)
                    .ok()
                    .and_then(|m| m.questions.first().map(|q| q.wants_unicast()))
                    .unwrap_or(false);
                // Legacy resolvers query from an ephemeral port and expect a unicast reply
                if wants_unicast || peer.port() != MDNS_PORT {
                    peer
                } else {
                    SocketAddr::from((Ipv4Addr::from(MDNS_GROUP), MDNS_PORT))
                }
            }
        }
    }
}

impl Drop for DnsResponder {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Relay one raw query upstream and its raw reply back to `peer`
async fn forward(
    socket: Arc<UdpSocket>,
    query: Vec<u8>,
    peer: SocketAddr,
    upstream: SocketAddr,
    timeout: Duration,
) {
    let bind: SocketAddr = match upstream {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (std::net::Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    let result = async {
        let upstream_socket = UdpSocket::bind(bind).await?;
        upstream_socket.send_to(&query, upstream).await?;
        let mut buf = vec![0u8; MAX_PACKET];
        let (len, _) = tokio::time::timeout(timeout, upstream_socket.recv_from(&mut buf))
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "upstream timed out"))??;
        buf.truncate(len);
        Ok::<_, std::io::Error>(buf)
    }
    .await;

    match result {
        Ok(reply) => {
            if let Err(e) = socket.send_to(&reply, peer).await {
                debug!("Failed to relay upstream reply to {}: {}", peer, e);
            }
        }
        Err(e) => debug!("Forwarding query from {} to {} failed: {}", peer, upstream, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn suffixes() -> Vec<String> {
        vec![".n".to_string(), ".nexa".to_string()]
    }

    fn loopback_peer() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    #[test]
    fn test_managed_name_answered_locally() {
        let query = DnsMessage::query_a(9, "demo.n").encode().unwrap();
        match classify(&query, loopback_peer(), &suffixes()) {
            Disposition::Answer(bytes) => {
                let reply = DnsMessage::decode(&bytes).unwrap();
                assert_eq!(reply.header.id, 9);
                assert_eq!(reply.answers[0].ipv4(), Some(Ipv4Addr::LOCALHOST));
                assert_eq!(reply.answers[0].ttl, ANSWER_TTL);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_other_names_forwarded() {
        let query = DnsMessage::query_a(9, "example.com").encode().unwrap();
        assert_eq!(classify(&query, loopback_peer(), &suffixes()), Disposition::Forward);
    }

    #[tokio::test]
    async fn test_unicast_responder_answers() {
        let upstream: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let responder = Arc::new(
            DnsResponder::bind_unicast("127.0.0.1:0".parse().unwrap(), upstream, suffixes()).unwrap(),
        );
        let addr = responder.local_addr().unwrap();
        responder.start();

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let query = DnsMessage::query_a(77, "site.nexa").encode().unwrap();
        client.send_to(&query, addr).await.unwrap();

        let mut buf = [0u8; 512];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let reply = DnsMessage::decode(&buf[..len]).unwrap();
        assert_eq!(reply.header.id, 77);
        assert_eq!(reply.answers[0].ipv4(), Some(Ipv4Addr::LOCALHOST));
        responder.stop();
        responder.stop();
    }

    #[tokio::test]
    async fn test_forwarded_reply_relayed_unchanged() {
        // Fake upstream that answers with a fixed payload
        let upstream = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            if let Ok((len, from)) = upstream.recv_from(&mut buf).await {
                let mut reply = buf[..len].to_vec();
                reply[2] |= 0x80;
                reply.extend_from_slice(b"tail");
                let _ = upstream.send_to(&reply, from).await;
            }
        });

        let responder = Arc::new(
            DnsResponder::bind_unicast("127.0.0.1:0".parse().unwrap(), upstream_addr, suffixes())
                .unwrap(),
        );
        let addr = responder.local_addr().unwrap();
        responder.start();

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let query = DnsMessage::query_a(5, "example.com").encode().unwrap();
        client.send_to(&query, addr).await.unwrap();

        let mut buf = [0u8; 512];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert!(buf[..len].ends_with(b"tail"));
        assert_eq!(&buf[..2], &query[..2]);
    }

    // ==================== NEGATIVE TESTS ====================

    #[test]
    fn test_garbage_ignored() {
        assert_eq!(classify(&[1, 2, 3], loopback_peer(), &suffixes()), Disposition::Ignore);
    }

    #[test]
    fn test_responses_ignored() {
        let query = DnsMessage::query_a(1, "demo.n");
        let reply = DnsMessage::answer(&query, Ipv4Addr::LOCALHOST, 1).encode().unwrap();
        assert_eq!(classify(&reply, loopback_peer(), &suffixes()), Disposition::Ignore);
    }

    #[tokio::test]
    async fn test_unbindable_address_is_reported() {
        let upstream: SocketAddr = "127.0.0.1:9".parse().unwrap();
        // Documentation range, never assigned to a local interface
        let foreign: SocketAddr = "203.0.113.1:0".parse().unwrap();
        assert!(matches!(
            DnsResponder::bind_unicast(foreign, upstream, suffixes()),
            Err(DnsError::Bind { .. })
        ));
    }
}
