//! Nexa Relay
//!
//! Multi-hop relay routes for devices without a direct path to the primary
//! base, plus the periodic loop that heals isolated devices through an
//! online gateway.

mod error;
mod expansion;
mod routes;

pub use error::{RelayError, Result};
pub use expansion::{ExpansionConfig, ExpansionManager, RELAY_COMMAND};
pub use routes::RouteTable;
