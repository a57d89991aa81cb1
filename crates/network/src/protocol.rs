//! Device session wire protocol
//!
//! Every frame is a 4-byte little-endian length followed by a JSON payload.
//! Lengths outside `(0, MAX_FRAME_SIZE]` are protocol violations.
//!
//! Payloads sent by the fabric itself are [`Envelope`] values, tagged by a
//! `type` field: `heartbeat`, `ping`, `command` or `data`.

use std::collections::HashMap;

use bytes::{Buf, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use nexa_core::{unix_now, MAX_FRAME_SIZE};

use crate::{NetworkError, Result};

/// Length prefix size
pub const FRAME_HEADER_LEN: usize = 4;

/// Periodic liveness message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub device_id: String,
    pub timestamp: u64,
    pub status: String,
    pub signal_strength: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub available_memory: Option<u64>,
}

/// Latency probe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ping {
    pub device_id: String,
    /// Send time in unix nanoseconds
    pub sent_at_nanos: u128,
}

/// Instruction for a remote device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub device_id: String,
    pub timestamp: u64,
    pub command: String,
    #[serde(default)]
    pub args: HashMap<String, serde_json::Value>,
}

/// Free-form application payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataMessage {
    pub device_id: String,
    pub timestamp: u64,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Messages exchanged on a device session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    Heartbeat(Heartbeat),
    Ping(Ping),
    Command(Command),
    Data(DataMessage),
}

impl Envelope {
    pub fn heartbeat(device_id: &str, signal_strength: i32) -> Self {
        Self::Heartbeat(Heartbeat {
            device_id: device_id.to_string(),
            timestamp: unix_now(),
            status: "online".to_string(),
            signal_strength,
            available_memory: None,
        })
    }

    pub fn ping(device_id: &str) -> Self {
        let sent_at_nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        Self::Ping(Ping {
            device_id: device_id.to_string(),
            sent_at_nanos,
        })
    }

    pub fn command(
        device_id: &str,
        command: &str,
        args: HashMap<String, serde_json::Value>,
    ) -> Self {
        Self::Command(Command {
            device_id: device_id.to_string(),
            timestamp: unix_now(),
            command: command.to_string(),
            args,
        })
    }

    pub fn data(device_id: &str, data: serde_json::Value) -> Self {
        Self::Data(DataMessage {
            device_id: device_id.to_string(),
            timestamp: unix_now(),
            data,
            error: None,
        })
    }

    /// Serialize to JSON bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Deserialize from JSON bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

fn check_frame_len(len: usize) -> Result<()> {
    if len == 0 {
        return Err(NetworkError::EmptyFrame);
    }
    if len > MAX_FRAME_SIZE {
        return Err(NetworkError::FrameTooLarge(len));
    }
    Ok(())
}

/// Prefix `payload` with its little-endian length
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>> {
    check_frame_len(payload.len())?;
    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Split one complete frame off the front of `buf`.
///
/// Returns `Ok(None)` when more bytes are needed. The length is validated
/// as soon as the header is available, before the payload arrives.
pub fn decode_frame(buf: &mut BytesMut) -> Result<Option<Vec<u8>>> {
    if buf.len() < FRAME_HEADER_LEN {
        return Ok(None);
    }
    let mut header = [0u8; FRAME_HEADER_LEN];
    header.copy_from_slice(&buf[..FRAME_HEADER_LEN]);
    let len = u32::from_le_bytes(header) as usize;
    check_frame_len(len)?;

    let total = FRAME_HEADER_LEN + len;
    if buf.len() < total {
        buf.reserve(total - buf.len());
        return Ok(None);
    }
    buf.advance(FRAME_HEADER_LEN);
    Ok(Some(buf.split_to(len).to_vec()))
}

/// Write one frame and flush
pub async fn write_frame<W: AsyncWrite + Unpin + ?Sized>(writer: &mut W, payload: &[u8]) -> Result<()> {
    let frame = encode_frame(payload)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Buffered frame reader.
///
/// `read_frame` is cancel-safe: bytes read before a cancelled call stay in
/// the buffer, so a timed-out read never misaligns the stream.
pub struct FrameReader<R> {
    inner: R,
    buf: BytesMut,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(8 * 1024),
        }
    }

    pub async fn read_frame(&mut self) -> Result<Vec<u8>> {
        loop {
            if let Some(frame) = decode_frame(&mut self.buf)? {
                return Ok(frame);
            }
            let n = self.inner.read_buf(&mut self.buf).await?;
            if n == 0 {
                return Err(NetworkError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed by peer",
                )));
            }
        }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_frame_layout() {
        let frame = encode_frame(b"hello").unwrap();
        assert_eq!(&frame[..4], &[5, 0, 0, 0]);
        assert_eq!(&frame[4..], b"hello");
    }

    #[test]
    fn test_decode_waits_for_full_frame() {
        let frame = encode_frame(b"abcdef").unwrap();
        let mut buf = BytesMut::new();

        buf.extend_from_slice(&frame[..2]);
        assert!(decode_frame(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&frame[2..7]);
        assert!(decode_frame(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&frame[7..]);
        assert_eq!(decode_frame(&mut buf).unwrap().unwrap(), b"abcdef");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_two_frames_back_to_back() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encode_frame(b"one").unwrap());
        buf.extend_from_slice(&encode_frame(b"two").unwrap());
        assert_eq!(decode_frame(&mut buf).unwrap().unwrap(), b"one");
        assert_eq!(decode_frame(&mut buf).unwrap().unwrap(), b"two");
        assert!(decode_frame(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_envelope_tagging() {
        let hb = Envelope::heartbeat("node-1", 80);
        let value: serde_json::Value = serde_json::from_slice(&hb.to_bytes().unwrap()).unwrap();
        assert_eq!(value["type"], "heartbeat");
        assert_eq!(value["device_id"], "node-1");
        assert_eq!(value["status"], "online");
        assert!(value.get("available_memory").is_none());

        let mut args = HashMap::new();
        args.insert("target".to_string(), serde_json::json!("node-2"));
        let cmd = Envelope::command("node-1", "relay_message", args);
        let back = Envelope::from_bytes(&cmd.to_bytes().unwrap()).unwrap();
        assert_eq!(back, cmd);
    }

    #[test]
    fn test_ping_carries_nanos() {
        match Envelope::ping("node-1") {
            Envelope::Ping(p) => assert!(p.sent_at_nanos > 0),
            other => panic!("unexpected envelope {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_frame_reader_over_duplex() {
        let (mut client, server) = tokio::io::duplex(64);
        let mut reader = FrameReader::new(server);

        write_frame(&mut client, b"first").await.unwrap();
        write_frame(&mut client, b"second").await.unwrap();

        assert_eq!(reader.read_frame().await.unwrap(), b"first");
        assert_eq!(reader.read_frame().await.unwrap(), b"second");
    }

    #[tokio::test]
    async fn test_frame_reader_survives_cancelled_read() {
        let (mut client, server) = tokio::io::duplex(64);
        let mut reader = FrameReader::new(server);

        // Half a frame arrives, then the read times out
        let frame = encode_frame(b"payload").unwrap();
        tokio::io::AsyncWriteExt::write_all(&mut client, &frame[..6]).await.unwrap();
        let timed_out = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            reader.read_frame(),
        )
        .await;
        assert!(timed_out.is_err());

        tokio::io::AsyncWriteExt::write_all(&mut client, &frame[6..]).await.unwrap();
        assert_eq!(reader.read_frame().await.unwrap(), b"payload");
    }

    // ==================== NEGATIVE TESTS ====================

    #[test]
    fn test_encode_rejects_empty_payload() {
        assert!(matches!(encode_frame(b""), Err(NetworkError::EmptyFrame)));
    }

    #[test]
    fn test_decode_rejects_zero_length() {
        let mut buf = BytesMut::from(&[0u8, 0, 0, 0][..]);
        assert!(matches!(decode_frame(&mut buf), Err(NetworkError::EmptyFrame)));
    }

    #[test]
    fn test_decode_rejects_oversized_before_payload() {
        let len = (MAX_FRAME_SIZE as u32 + 1).to_le_bytes();
        let mut buf = BytesMut::from(&len[..]);
        let err = decode_frame(&mut buf).unwrap_err();
        assert!(err.is_protocol_violation());
        assert!(matches!(err, NetworkError::FrameTooLarge(n) if n == MAX_FRAME_SIZE + 1));
    }

    #[test]
    fn test_max_frame_is_accepted() {
        let len = (MAX_FRAME_SIZE as u32).to_le_bytes();
        let mut buf = BytesMut::from(&len[..]);
        assert!(decode_frame(&mut buf).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reader_reports_eof() {
        let (client, server) = tokio::io::duplex(64);
        drop(client);
        let mut reader = FrameReader::new(server);
        assert!(matches!(reader.read_frame().await, Err(NetworkError::Io(_))));
    }

    #[test]
    fn test_unknown_envelope_type_rejected() {
        assert!(Envelope::from_bytes(br#"{"type":"gossip","device_id":"x"}"#).is_err());
    }
}
