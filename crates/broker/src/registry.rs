//! Registered-client bookkeeping.
//!
//! One record per client PID. Any message from a client refreshes its
//! heartbeat timestamp; silence beyond the timeout gets it evicted by the
//! sweep in the event loop.

use common::CLIENT_TIMEOUT_MS;
use std::collections::HashMap;
use tracing::info;

/// Broker-side record of one registered client process.
#[derive(Debug)]
pub struct ClientRecord {
    pub pid: u64,
    pub name: String,
    pub last_heartbeat_ms: u64,
}

/// Clients keyed by PID.
#[derive(Default)]
pub struct ClientTable {
    clients: HashMap<u64, ClientRecord>,
}

impl ClientTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or refresh a record at registration time.
    pub fn register(&mut self, pid: u64, name: &str, now: u64) {
        let record = self.clients.entry(pid).or_insert_with(|| {
            info!(pid, name, "client registered");
            ClientRecord {
                pid,
                name: name.to_string(),
                last_heartbeat_ms: now,
            }
        });
        record.name = name.to_string();
        record.last_heartbeat_ms = now;
    }

    /// Refresh the heartbeat timestamp of a known client. Returns whether
    /// the PID is registered; unknown PIDs are not created here.
    pub fn touch(&mut self, pid: u64, now: u64) -> bool {
        match self.clients.get_mut(&pid) {
            Some(record) => {
                record.last_heartbeat_ms = now;
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, pid: u64) -> Option<ClientRecord> {
        self.clients.remove(&pid)
    }

    pub fn contains(&self, pid: u64) -> bool {
        self.clients.contains_key(&pid)
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// PIDs silent for longer than the client timeout.
    pub fn stale(&self, now: u64) -> Vec<u64> {
        self.clients
            .values()
            .filter(|c| now.saturating_sub(c.last_heartbeat_ms) > CLIENT_TIMEOUT_MS)
            .map(|c| c.pid)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_then_touch_refreshes() {
        let mut table = ClientTable::new();
        table.register(7, "t1", 1_000);
        assert!(table.touch(7, 2_000));
        assert!(!table.touch(8, 2_000));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn stale_respects_the_timeout() {
        let mut table = ClientTable::new();
        table.register(1, "fresh", 100_000);
        table.register(2, "old", 50_000);
        let stale = table.stale(100_000 + CLIENT_TIMEOUT_MS);
        assert_eq!(stale, vec![2]);
    }

    #[test]
    fn re_registration_updates_in_place() {
        let mut table = ClientTable::new();
        table.register(7, "first", 1_000);
        table.register(7, "second", 2_000);
        assert_eq!(table.len(), 1);
        let stale = table.stale(2_500);
        assert!(stale.is_empty());
    }
}
