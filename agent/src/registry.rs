//! Concurrency-safe store of known peers, keyed by node name. No ordering
//! guarantees are made over `range` — callers that need determinism sort
//! the result themselves.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::types::Peer;

#[derive(Default)]
pub struct PeerRegistry {
    peers: RwLock<HashMap<String, Peer>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self { peers: RwLock::new(HashMap::new()) }
    }

    pub fn store(&self, node_name: &str, peer: Peer) {
        self.peers.write().unwrap().insert(node_name.to_string(), peer);
    }

    pub fn delete(&self, node_name: &str) -> Option<Peer> {
        self.peers.write().unwrap().remove(node_name)
    }

    pub fn load(&self, node_name: &str) -> Option<Peer> {
        self.peers.read().unwrap().get(node_name).cloned()
    }

    pub fn range(&self) -> Vec<(String, Peer)> {
        self.peers
            .read()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Node names currently tracked, excluding `exclude` (used to drop the
    /// local node from a peer set before programming FDB/route state).
    pub fn names_excluding(&self, exclude: &str) -> Vec<String> {
        self.peers
            .read()
            .unwrap()
            .keys()
            .filter(|name| name.as_str() != exclude)
            .cloned()
            .collect()
    }
}
