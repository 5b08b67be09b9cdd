//! rampart-relay: HTTP client for the rampart message relay
//!
//! Implements [`rampart_core::RelayTransport`] over the relay's REST API:
//! the key package directory, per-device message queues with explicit
//! acknowledgement, and published group info for external joins.

pub mod client;
pub mod config;
pub mod error;
pub mod records;

pub use client::RelayClient;
pub use config::RelayConfig;
pub use error::{Error, Result};
