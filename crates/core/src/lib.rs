//! Nexa Core Types
//!
//! Data model shared by every Nexa crate: devices, logical connections,
//! the topology aggregate, name records and relay routes.

mod config;
mod error;
mod topology;
mod types;

pub use config::*;
pub use error::*;
pub use topology::*;
pub use types::*;
