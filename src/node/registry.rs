//! Name → connection map of a node.
//!
//! Every operation takes the lock once, so a check-evict-insert sequence is
//! atomic with respect to other connections.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::connection::{Connection, ConnectionId};

/// Registry of handshaken peers keyed by logical name.
#[derive(Default)]
pub struct PeerRegistry {
    peers: Mutex<HashMap<String, Connection>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connection registered under `name`.
    pub fn get(&self, name: &str) -> Option<Connection> {
        self.peers.lock().get(name).cloned()
    }

    /// Register `connection` under `name`.
    ///
    /// Returns the previous holder of the name if it was a different
    /// connection. The caller is responsible for disconnecting it.
    pub fn insert(&self, name: String, connection: Connection) -> Option<Connection> {
        let id = connection.id();
        self.peers
            .lock()
            .insert(name, connection)
            .filter(|previous| previous.id() != id)
    }

    /// Remove `name`, but only while it still maps to connection `id`.
    pub fn remove(&self, name: &str, id: ConnectionId) -> bool {
        let mut peers = self.peers.lock();
        match peers.get(name) {
            Some(current) if current.id() == id => {
                peers.remove(name);
                true
            }
            _ => false,
        }
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.peers.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Every registered peer.
    pub fn snapshot(&self) -> Vec<(String, Connection)> {
        self.peers
            .lock()
            .iter()
            .map(|(name, connection)| (name.clone(), connection.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.peers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.lock().is_empty()
    }
}
