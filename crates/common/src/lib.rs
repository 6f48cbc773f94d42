//! Shared IPC substrate for the wsmux broker and its clients.
//!
//! Both roles link this crate: the wire-format message frames, the named
//! shared-memory ring queues they travel through, the owner word that elects
//! the single live broker, and the process/clock helpers both heartbeat
//! protocols rely on.

pub mod clock;
pub mod error;
pub mod owner;
pub mod process;
pub mod ring;
pub mod shm;
pub mod wire;

pub use error::{Error, Result};
pub use owner::OwnerWord;
pub use ring::RingQueue;

/// Default name prefix for the shared objects.
pub const DEFAULT_PREFIX: &str = "wsmux";

/// Interval between heartbeat frames, either direction.
pub const HEARTBEAT_INTERVAL_MS: u64 = 500;

/// Client-side: broker is declared lost after this much silence on S→C.
pub const HEARTBEAT_TIMEOUT_MS: u64 = 15_000;

/// Broker-side: a client is evicted after this much silence on C→S.
pub const CLIENT_TIMEOUT_MS: u64 = 30_000;

/// Client→server ring backing size in bytes.
pub const CLIENT_QUEUE_SIZE: u32 = 1 << 16;

/// Default server→client ring backing size in bytes (16 MiB).
pub const DEFAULT_SERVER_QUEUE_SIZE: u32 = 1 << 24;

/// Grace window after the last client unregisters before the broker exits.
pub const SHUTDOWN_GRACE_MS: u64 = 60_000;

/// Name of the client→server ring segment.
pub fn client_queue_name(prefix: &str) -> String {
    format!("{prefix}_client_server")
}

/// Name of the server→client ring segment.
pub fn server_queue_name(prefix: &str) -> String {
    format!("{prefix}_server_client")
}

/// Name of the owner-word segment.
pub fn owner_name(prefix: &str) -> String {
    format!("{prefix}_shm_owner")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_names_carry_prefix() {
        assert_eq!(client_queue_name("wsmux"), "wsmux_client_server");
        assert_eq!(server_queue_name("wsmux"), "wsmux_server_client");
        assert_eq!(owner_name("alt"), "alt_shm_owner");
    }
}
