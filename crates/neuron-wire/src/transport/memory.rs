//! In-process transport: nodes in one [`MemoryNetwork`] dial each other by
//! id over unbounded channels. Used by tests and local demos.

use super::{Connection, Link, Transport, TransportEvent};
use crate::error::WireError;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// A shared in-process network of listening endpoints.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    listeners: Arc<DashMap<String, mpsc::UnboundedSender<Connection>>>,
}

impl MemoryNetwork {
    /// Create an empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `node_id` and return its transport and inbound stream.
    ///
    /// Registering the same id again replaces the previous listener.
    pub fn endpoint(
        &self,
        node_id: &str,
    ) -> (MemoryTransport, mpsc::UnboundedReceiver<Connection>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.insert(node_id.to_string(), tx);
        let transport = MemoryTransport {
            node_id: node_id.to_string(),
            network: self.clone(),
        };
        (transport, rx)
    }

    /// Remove `node_id` from the network; later dials to it fail.
    pub fn remove(&self, node_id: &str) {
        self.listeners.remove(node_id);
    }
}

/// One node's view of a [`MemoryNetwork`].
#[derive(Clone)]
pub struct MemoryTransport {
    node_id: String,
    network: MemoryNetwork,
}

impl MemoryTransport {
    /// The id this endpoint dials from.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn dial(&self, peer_id: &str) -> Result<Connection, WireError> {
        let listener = self
            .network
            .listeners
            .get(peer_id)
            .map(|l| l.clone())
            .ok_or_else(|| WireError::Transport(format!("peer `{peer_id}` is unreachable")))?;

        let (local, remote) = connection_pair(&self.node_id, peer_id);
        listener
            .send(remote)
            .map_err(|_| WireError::Transport(format!("peer `{peer_id}` stopped listening")))?;
        debug!(from = %self.node_id, to = %peer_id, "memory connection established");
        Ok(local)
    }
}

/// Build both ends of a connection. Each end has already seen `Open`.
///
/// The first connection is held by `dialer` and points at `acceptor`.
pub fn connection_pair(dialer: &str, acceptor: &str) -> (Connection, Connection) {
    let (dialer_tx, dialer_rx) = mpsc::unbounded_channel();
    let (acceptor_tx, acceptor_rx) = mpsc::unbounded_channel();
    let closed = Arc::new(AtomicBool::new(false));

    let dialer_link = MemoryLink {
        local: dialer_tx.clone(),
        remote: acceptor_tx.clone(),
        closed: Arc::clone(&closed),
    };
    let acceptor_link = MemoryLink {
        local: acceptor_tx.clone(),
        remote: dialer_tx.clone(),
        closed,
    };
    let _ = dialer_tx.send(TransportEvent::Open);
    let _ = acceptor_tx.send(TransportEvent::Open);

    (
        Connection {
            peer_id: acceptor.to_string(),
            link: Arc::new(dialer_link),
            events: dialer_rx,
        },
        Connection {
            peer_id: dialer.to_string(),
            link: Arc::new(acceptor_link),
            events: acceptor_rx,
        },
    )
}

struct MemoryLink {
    local: mpsc::UnboundedSender<TransportEvent>,
    remote: mpsc::UnboundedSender<TransportEvent>,
    closed: Arc<AtomicBool>,
}

impl Link for MemoryLink {
    fn send(&self, frame: Value) -> Result<(), WireError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(WireError::Transport("memory link closed".to_string()));
        }
        self.remote
            .send(TransportEvent::Data(frame))
            .map_err(|_| WireError::Transport("memory link closed".to_string()))
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.remote.send(TransportEvent::Closed);
        let _ = self.local.send(TransportEvent::Closed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_dial_and_exchange() {
        let network = MemoryNetwork::new();
        let (a, _a_in) = network.endpoint("a");
        let (_b, mut b_in) = network.endpoint("b");

        let mut outbound = a.dial("b").await.unwrap();
        let mut inbound = b_in.recv().await.unwrap();
        assert_eq!(outbound.peer_id, "b");
        assert_eq!(inbound.peer_id, "a");

        assert_eq!(outbound.events.recv().await, Some(TransportEvent::Open));
        assert_eq!(inbound.events.recv().await, Some(TransportEvent::Open));

        outbound.link.send(json!({"out": "x"})).unwrap();
        assert_eq!(
            inbound.events.recv().await,
            Some(TransportEvent::Data(json!({"out": "x"})))
        );

        inbound.link.close();
        assert_eq!(outbound.events.recv().await, Some(TransportEvent::Closed));
        assert_eq!(inbound.events.recv().await, Some(TransportEvent::Closed));
        assert!(outbound.link.send(json!({})).is_err());
    }

    #[tokio::test]
    async fn test_dial_unknown_peer() {
        let network = MemoryNetwork::new();
        let (a, _a_in) = network.endpoint("a");
        let err = a.dial("nobody").await.unwrap_err();
        assert!(matches!(err, WireError::Transport(_)));
    }
}
