//! Nexa Network
//!
//! Device sessions, discovery and topology orchestration.
//!
//! ## Components
//!
//! - **ConnectionHandler**: one framed TCP/TLS session per device, with
//!   heartbeat and bounded reconnect
//! - **DeviceDiscovery**: UDP broadcast beacons
//! - **NetworkManager**: owns the topology and all handlers, runs the
//!   health monitor
//!
//! ## Wire format
//!
//! `[u32 little-endian length][JSON payload]`, length in `(0, 10 MB]`.

mod connection;
mod discovery;
mod error;
mod manager;
mod protocol;
mod socket;
pub mod tls;

pub use connection::{ConnectionConfig, ConnectionHandler, DeviceStatusSink, Transport};
pub use discovery::{
    estimate_distance, estimate_signal_strength, is_within_radius, DeviceDiscovery,
    DiscoveryBeacon, DiscoveryConfig, DiscoveryResponse,
};
pub use error::{NetworkError, Result};
pub use manager::{MonitorConfig, NetworkEvent, NetworkManager, NetworkStats, SharedTopology};
pub use protocol::{
    decode_frame, encode_frame, write_frame, Command, DataMessage, Envelope, FrameReader,
    Heartbeat, Ping, FRAME_HEADER_LEN,
};
pub use socket::{bind_multicast, bind_udp, local_ip, local_ip_for};
