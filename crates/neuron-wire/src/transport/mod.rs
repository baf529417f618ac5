//! Transport substrate seam.
//!
//! The protocol engine does not negotiate connections itself. A
//! [`Transport`] dials peers by id and yields a [`Connection`]: a link for
//! sending JSON units plus a stream of [`TransportEvent`]s (open, data,
//! closed). Inbound connections are handed to the engine by whoever owns the
//! listening side.

pub mod memory;
pub mod tcp;

use crate::error::WireError;

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Events raised by a transport connection, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The connection is ready for traffic.
    Open,
    /// An inbound unit. May be anything; the channel filters noise.
    Data(Value),
    /// The connection is gone. No events follow.
    Closed,
}

/// Sending half of a connection.
pub trait Link: Send + Sync + 'static {
    /// Queue one unit for delivery. Never blocks.
    fn send(&self, frame: Value) -> Result<(), WireError>;

    /// Tear the connection down. Both ends observe [`TransportEvent::Closed`].
    fn close(&self);
}

/// One duplex connection to a remote peer.
pub struct Connection {
    /// Remote peer id as established by the transport.
    pub peer_id: String,
    pub link: Arc<dyn Link>,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer_id", &self.peer_id)
            .finish_non_exhaustive()
    }
}

/// Dials peers by id.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open a connection to `peer_id`.
    async fn dial(&self, peer_id: &str) -> Result<Connection, WireError>;
}
