//! Nexa DNS
//!
//! The name authority behind `.n` / `.nexa` service names.
//!
//! ## Components
//!
//! - **DnsRegistry**: name -> record map, persisted as JSON on every change
//! - **NameAuthority**: line-protocol handler and in-process resolver with
//!   wildcard fallback for managed names
//! - **AuthorityServer** / **AuthorityClient**: the TCP/TLS line protocol
//! - **DnsResponder**: standard DNS on UDP 53 and mDNS on 224.0.0.251:5353
//!
//! ## Line protocol
//!
//! ```text
//! PING                                   -> 200 PONG Records: <n>
//! RESOLVE <name>                         -> 200 RESOLVED <ip>:<port>|service=<svc>
//! REGISTER <name> <ip> <port> <service>  -> 201 REGISTERED <name>
//! UPDATE <name> <ip> <port> <service>    -> 200 UPDATED <name>
//! DELETE <name>                          -> 200 DELETED <name>
//! LIST                                   -> 200 LIST <name>,<name>,...
//! ```

mod authority;
mod client;
mod error;
mod protocol;
mod registry;
mod responder;
mod server;
pub mod wire;

pub use authority::{
    is_managed_name, AuthorityConfig, MetricsReporter, NameAuthority, NameResolver, Resolution,
    METRICS_SERVICE, WILDCARD_MARKER, WILDCARD_SERVICE,
};
pub use client::AuthorityClient;
pub use error::{DnsError, Result};
pub use protocol::{Request, Response};
pub use registry::{bootstrap_records, normalize_name, DnsRegistry};
pub use responder::{classify, Disposition, DnsResponder, ResponderMode, ANSWER_TTL};
pub use server::{handle_connection, AuthorityHandle, AuthorityServer, MAX_LINE_LEN};
