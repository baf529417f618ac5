//! Peer registry — known peer identities and relay servers.
//!
//! A [`PeerRegistry`] is an immutable snapshot, normally built from the node
//! directory. It is read concurrently by every exchange without locking;
//! reloading the directory means building a new registry and installing it
//! as a whole (see [`Engine::install_registry`](crate::engine::Engine::install_registry)).

use crate::signing::PublicKey;

use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// Default signalling host when the directory names none.
pub const DEFAULT_SIGNALING_HOST: &str = "0.peerjs.com";
/// Default signalling port.
pub const DEFAULT_SIGNALING_PORT: u16 = 443;
/// Default signalling path.
pub const DEFAULT_SIGNALING_PATH: &str = "/";

/// A known remote node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerIdentity {
    /// Unique node ID.
    pub id: String,
    /// Key the node must prove possession of.
    pub public_key: PublicKey,
}

impl PeerIdentity {
    pub fn new(id: impl Into<String>, public_key: PublicKey) -> Self {
        Self {
            id: id.into(),
            public_key,
        }
    }
}

/// A relay-assistance (ICE) server for transports that need one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelayServer {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl RelayServer {
    pub fn new(url: impl Into<String>, credential: Option<String>) -> Self {
        Self {
            url: url.into(),
            credential,
        }
    }

    /// The server as a transport ICE entry (`{url, credential?}`).
    pub fn to_ice_json(&self) -> Value {
        match &self.credential {
            Some(credential) => json!({ "url": self.url, "credential": credential }),
            None => json!({ "url": self.url }),
        }
    }
}

/// Where the transport's signalling service lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SignalingServer {
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl Default for SignalingServer {
    fn default() -> Self {
        Self {
            host: DEFAULT_SIGNALING_HOST.to_string(),
            port: DEFAULT_SIGNALING_PORT,
            path: DEFAULT_SIGNALING_PATH.to_string(),
        }
    }
}

/// Immutable snapshot of known peers and relay servers.
#[derive(Debug, Clone, Default)]
pub struct PeerRegistry {
    peers: HashMap<String, Arc<PeerIdentity>>,
    relays: Vec<RelayServer>,
    signaling: SignalingServer,
}

impl PeerRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or replace) a peer.
    pub fn with_peer(mut self, identity: PeerIdentity) -> Self {
        self.peers
            .insert(identity.id.clone(), Arc::new(identity));
        self
    }

    /// Add a relay server.
    pub fn with_relay(mut self, relay: RelayServer) -> Self {
        self.relays.push(relay);
        self
    }

    /// Set the signalling endpoint.
    pub fn with_signaling(mut self, signaling: SignalingServer) -> Self {
        self.signaling = signaling;
        self
    }

    /// Look up a peer by ID.
    pub fn get_peer(&self, node_id: &str) -> Option<Arc<PeerIdentity>> {
        self.peers.get(node_id).cloned()
    }

    /// Whether `node_id` is known.
    pub fn contains(&self, node_id: &str) -> bool {
        self.peers.contains_key(node_id)
    }

    /// All peers, sorted by ID.
    pub fn all_peers(&self) -> Vec<Arc<PeerIdentity>> {
        let mut peers: Vec<_> = self.peers.values().cloned().collect();
        peers.sort_by(|a, b| a.id.cmp(&b.id));
        peers
    }

    /// Relay servers in directory order.
    pub fn relays(&self) -> &[RelayServer] {
        &self.relays
    }

    /// Signalling endpoint.
    pub fn signaling(&self) -> &SignalingServer {
        &self.signaling
    }

    /// Total number of peers.
    pub fn total_count(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signing::test_keys::keys;

    fn make_peer(node_id: &str, key: usize) -> PeerIdentity {
        PeerIdentity::new(node_id, keys(key).public_key().clone())
    }

    #[test]
    fn test_add_and_get_peer() {
        let registry = PeerRegistry::new().with_peer(make_peer("node-1", 0));

        let retrieved = registry.get_peer("node-1").unwrap();
        assert_eq!(retrieved.id, "node-1");
        assert_eq!(&retrieved.public_key, keys(0).public_key());
        assert!(registry.get_peer("node-2").is_none());
        assert!(registry.contains("node-1"));
    }

    #[test]
    fn test_replace_peer() {
        let registry = PeerRegistry::new()
            .with_peer(make_peer("node-1", 0))
            .with_peer(make_peer("node-1", 1));
        assert_eq!(registry.total_count(), 1);
        assert_eq!(
            &registry.get_peer("node-1").unwrap().public_key,
            keys(1).public_key()
        );
    }

    #[test]
    fn test_all_peers_sorted() {
        let registry = PeerRegistry::new()
            .with_peer(make_peer("node-b", 0))
            .with_peer(make_peer("node-a", 1));
        let ids: Vec<_> = registry.all_peers().iter().map(|p| p.id.clone()).collect();
        assert_eq!(ids, vec!["node-a", "node-b"]);
    }

    #[test]
    fn test_empty_defaults() {
        let registry = PeerRegistry::new();
        assert!(registry.is_empty());
        assert!(registry.relays().is_empty());
        assert_eq!(registry.signaling().host, "0.peerjs.com");
        assert_eq!(registry.signaling().port, 443);
        assert_eq!(registry.signaling().path, "/");
    }

    #[test]
    fn test_relay_ice_json() {
        let plain = RelayServer::new("stun:stun.example.org", None);
        assert_eq!(plain.to_ice_json(), json!({"url": "stun:stun.example.org"}));

        let with_secret = RelayServer::new("turn:turn.example.org", Some("s3cret".into()));
        assert_eq!(
            with_secret.to_ice_json(),
            json!({"url": "turn:turn.example.org", "credential": "s3cret"})
        );
    }
}
