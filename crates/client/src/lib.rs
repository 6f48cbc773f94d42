//! wsmux client library.
//!
//! Link this into any process that wants upstream WebSocket streams through
//! the local broker. The first operation attaches to (or spawns) the broker
//! and registers; a background poller thread delivers server events to the
//! [`ClientHandler`] the application supplies.

pub mod client;
pub mod error;
pub mod handler;
mod poller;

pub use client::{ClientConfig, ProxyClient};
pub use error::{ClientError, Result};
pub use handler::ClientHandler;

/// Channel bitmask values, re-exported for subscription calls.
pub use common::wire::channels;
