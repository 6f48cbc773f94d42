//! Upstream connection records and their dual index.
//!
//! A connection is keyed twice: by its 64-bit id and by the (url, key) pair
//! that deduplicates it. The two indices move together through a single
//! insert/remove surface so they cannot drift apart.

use std::collections::{HashMap, HashSet};

/// Lifecycle of one upstream WebSocket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

/// Per-symbol interest within one connection, reference-counted by client
/// PID and masked by channel bits.
#[derive(Debug)]
pub struct Subscription {
    pub channels: u8,
    pub clients: HashSet<u64>,
}

/// Broker state for one upstream WebSocket.
#[derive(Debug)]
pub struct Connection {
    pub id: u64,
    pub url: String,
    pub key: String,
    pub state: ConnState,
    pub clients: HashSet<u64>,
    pub subscriptions: HashMap<String, Subscription>,
}

impl Connection {
    pub fn new(id: u64, url: String, key: String) -> Self {
        Self {
            id,
            url,
            key,
            state: ConnState::Connecting,
            clients: HashSet::new(),
            subscriptions: HashMap::new(),
        }
    }

    /// Detach a client from the connection and from every subscription it
    /// holds. Returns the connection's client set emptied by this call.
    pub fn detach_client(&mut self, pid: u64) -> bool {
        self.clients.remove(&pid);
        self.subscriptions.retain(|_, sub| {
            sub.clients.remove(&pid);
            !sub.clients.is_empty()
        });
        self.clients.is_empty()
    }
}

/// The dual-indexed connection registry.
#[derive(Default)]
pub struct ConnectionTable {
    by_id: HashMap<u64, Connection>,
    by_key: HashMap<(String, String), u64>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, conn: Connection) {
        self.by_key
            .insert((conn.url.clone(), conn.key.clone()), conn.id);
        self.by_id.insert(conn.id, conn);
    }

    /// Remove a connection from both indices. The key index entry is only
    /// removed if it still points at this id; a replacement connection for
    /// the same key may already have claimed it.
    pub fn remove(&mut self, id: u64) -> Option<Connection> {
        let conn = self.by_id.remove(&id)?;
        let key = (conn.url.clone(), conn.key.clone());
        if self.by_key.get(&key) == Some(&id) {
            self.by_key.remove(&key);
        }
        Some(conn)
    }

    pub fn get(&self, id: u64) -> Option<&Connection> {
        self.by_id.get(&id)
    }

    pub fn get_mut(&mut self, id: u64) -> Option<&mut Connection> {
        self.by_id.get_mut(&id)
    }

    pub fn id_for_key(&self, url: &str, key: &str) -> Option<u64> {
        self.by_key.get(&(url.to_string(), key.to_string())).copied()
    }

    pub fn ids(&self) -> Vec<u64> {
        self.by_id.keys().copied().collect()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Connection> {
        self.by_id.values_mut()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Both indices agree: every key entry resolves to a live record with
    /// that key, and every record is reachable through some index path.
    #[cfg(test)]
    pub fn assert_consistent(&self) {
        for ((url, key), id) in &self.by_key {
            let conn = self.by_id.get(id).expect("key index points at live id");
            assert_eq!(&conn.url, url);
            assert_eq!(&conn.key, key);
        }
        for (id, conn) in &self.by_id {
            assert_eq!(conn.id, *id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn(id: u64, url: &str, key: &str) -> Connection {
        Connection::new(id, url.to_string(), key.to_string())
    }

    #[test]
    fn dual_index_stays_consistent() {
        let mut table = ConnectionTable::new();
        table.insert(conn(10, "wss://x.test/v1", "K"));
        table.insert(conn(11, "wss://y.test/v1", "K"));
        table.assert_consistent();
        assert_eq!(table.id_for_key("wss://x.test/v1", "K"), Some(10));

        table.remove(10);
        table.assert_consistent();
        assert_eq!(table.id_for_key("wss://x.test/v1", "K"), None);
        assert_eq!(table.id_for_key("wss://y.test/v1", "K"), Some(11));
    }

    #[test]
    fn key_reuse_during_teardown_keeps_the_new_mapping() {
        let mut table = ConnectionTable::new();
        let mut old = conn(10, "wss://x.test/v1", "K");
        old.state = ConnState::Disconnecting;
        table.insert(old);
        // A fresh connection for the same key replaces the key entry while
        // the old record drains.
        table.insert(conn(11, "wss://x.test/v1", "K"));
        assert_eq!(table.id_for_key("wss://x.test/v1", "K"), Some(11));

        // The old record's erasure must not evict the replacement.
        table.remove(10);
        table.assert_consistent();
        assert_eq!(table.id_for_key("wss://x.test/v1", "K"), Some(11));
    }

    #[test]
    fn detach_client_scrubs_subscriptions() {
        let mut c = conn(10, "wss://x.test/v1", "K");
        c.clients.extend([1, 2]);
        c.subscriptions.insert(
            "AAPL".to_string(),
            Subscription {
                channels: 1,
                clients: [1, 2].into_iter().collect(),
            },
        );
        c.subscriptions.insert(
            "MSFT".to_string(),
            Subscription {
                channels: 1,
                clients: [1].into_iter().collect(),
            },
        );

        assert!(!c.detach_client(1));
        // MSFT lost its only holder; AAPL keeps client 2.
        assert!(!c.subscriptions.contains_key("MSFT"));
        assert_eq!(c.subscriptions["AAPL"].clients.len(), 1);

        assert!(c.detach_client(2));
        assert!(c.subscriptions.is_empty());
    }
}
