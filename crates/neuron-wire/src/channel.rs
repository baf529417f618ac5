//! Channel adapter — one duplex transport connection to one peer.
//!
//! Tracks the connect/open state, refuses to send unless open, and turns the
//! transport's raw inbound units into [`Message`]s. Units that are not
//! protocol traffic are dropped here without surfacing anywhere.

use crate::error::WireError;
use crate::message::Message;
use crate::transport::{Connection, Link, TransportEvent};

use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::trace;

/// Connection state of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Open,
}

/// Per-peer wrapper around a transport connection.
pub struct Channel {
    peer_id: String,
    state: watch::Sender<ChannelState>,
    link: Mutex<Option<Arc<dyn Link>>>,
}

impl Channel {
    /// A disconnected channel to `peer_id`.
    pub fn new(peer_id: impl Into<String>) -> Self {
        let (state, _) = watch::channel(ChannelState::Disconnected);
        Self {
            peer_id: peer_id.into(),
            state,
            link: Mutex::new(None),
        }
    }

    /// Remote peer id.
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// Current state.
    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    /// Mark the channel as connecting, before a transport is available.
    pub fn begin_connecting(&self) {
        self.state.send_replace(ChannelState::Connecting);
    }

    /// Attach a transport connection and suspend until it signals open.
    ///
    /// Returns the inbound message stream. Fails if the transport closes
    /// before opening or does not open within `timeout`.
    pub async fn open(&self, conn: Connection, timeout: Duration) -> Result<Inbound, WireError> {
        self.begin_connecting();
        let Connection {
            link, mut events, ..
        } = conn;

        let opened = tokio::time::timeout(timeout, async {
            loop {
                match events.recv().await {
                    Some(TransportEvent::Open) => return true,
                    Some(TransportEvent::Data(_)) => {
                        trace!(peer = %self.peer_id, "dropping data received before open");
                    }
                    Some(TransportEvent::Closed) | None => return false,
                }
            }
        })
        .await;

        match opened {
            Ok(true) => {
                *self.link.lock().unwrap_or_else(|e| e.into_inner()) = Some(link);
                self.state.send_replace(ChannelState::Open);
                Ok(Inbound {
                    peer_id: self.peer_id.clone(),
                    events,
                })
            }
            Ok(false) => {
                self.state.send_replace(ChannelState::Disconnected);
                Err(WireError::ChannelClosed {
                    peer: self.peer_id.clone(),
                })
            }
            Err(_) => {
                link.close();
                self.state.send_replace(ChannelState::Disconnected);
                Err(WireError::Transport(format!(
                    "channel to `{}` did not open within {:?}",
                    self.peer_id, timeout
                )))
            }
        }
    }

    /// Suspend until another task finishes opening this channel.
    pub async fn wait_open(&self, timeout: Duration) -> Result<(), WireError> {
        let mut rx = self.state.subscribe();
        let settled = tokio::time::timeout(timeout, rx.wait_for(|s| *s != ChannelState::Connecting))
            .await
            .map_err(|_| {
                WireError::Transport(format!(
                    "channel to `{}` did not open within {:?}",
                    self.peer_id, timeout
                ))
            })?;
        match settled.map(|s| *s) {
            Ok(ChannelState::Open) => Ok(()),
            _ => Err(WireError::NotConnected {
                peer: self.peer_id.clone(),
            }),
        }
    }

    /// Fail fast unless the channel is open.
    pub fn ensure_open(&self) -> Result<Arc<dyn Link>, WireError> {
        let link = self.link.lock().unwrap_or_else(|e| e.into_inner());
        match (&*link, self.state()) {
            (Some(link), ChannelState::Open) => Ok(Arc::clone(link)),
            _ => Err(WireError::NotConnected {
                peer: self.peer_id.clone(),
            }),
        }
    }

    /// Send one message. Never queues on a closed channel.
    pub fn send(&self, msg: &Message) -> Result<(), WireError> {
        let link = self.ensure_open()?;
        link.send(msg.to_value()?)
    }

    /// Close the transport connection and mark the channel disconnected.
    pub fn close(&self) {
        let link = self.link.lock().unwrap_or_else(|e| e.into_inner()).take();
        self.state.send_replace(ChannelState::Disconnected);
        if let Some(link) = link {
            link.close();
        }
    }
}

/// Inbound messages of an open channel.
pub struct Inbound {
    peer_id: String,
    events: mpsc::UnboundedReceiver<TransportEvent>,
}

impl Inbound {
    /// Next protocol message, or `None` once the transport closes.
    pub async fn recv(&mut self) -> Option<Message> {
        loop {
            match self.events.recv().await? {
                TransportEvent::Data(value) => match Message::from_value(value) {
                    Some(msg) => return Some(msg),
                    None => trace!(peer = %self.peer_id, "ignoring non-protocol unit"),
                },
                TransportEvent::Open => {}
                TransportEvent::Closed => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::connection_pair;
    use serde_json::json;

    #[tokio::test]
    async fn test_send_requires_open() {
        let channel = Channel::new("b");
        assert_eq!(channel.state(), ChannelState::Disconnected);
        let err = channel.send(&Message::open("c1")).unwrap_err();
        assert!(matches!(err, WireError::NotConnected { .. }));
    }

    #[tokio::test]
    async fn test_open_send_and_filter() {
        let (local, remote) = connection_pair("a", "b");
        let channel_a = Channel::new("b");
        let channel_b = Channel::new("a");
        let _inbound_a = channel_a
            .open(local, Duration::from_secs(1))
            .await
            .unwrap();
        let mut inbound_b = channel_b
            .open(remote, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(channel_a.state(), ChannelState::Open);

        // Noise is dropped before the next real message.
        let link = channel_a.ensure_open().unwrap();
        link.send(json!("just a string")).unwrap();
        link.send(json!({"type": "open"})).unwrap();
        channel_a.send(&Message::open("c1")).unwrap();

        let msg = inbound_b.recv().await.unwrap();
        assert_eq!(msg.out_id.as_deref(), Some("c1"));

        channel_a.close();
        assert_eq!(channel_a.state(), ChannelState::Disconnected);
        assert!(inbound_b.recv().await.is_none());
        assert!(channel_a.send(&Message::open("c2")).is_err());
    }

    #[tokio::test]
    async fn test_inbound_ends_on_remote_close() {
        let (local, remote) = connection_pair("a", "b");
        remote.link.close();
        drop(remote);
        let channel = Channel::new("b");
        let mut inbound = channel.open(local, Duration::from_secs(1)).await.unwrap();
        assert!(inbound.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_wait_open_observes_other_opener() {
        let channel = Arc::new(Channel::new("b"));
        channel.begin_connecting();

        let waiter = {
            let channel = Arc::clone(&channel);
            tokio::spawn(async move { channel.wait_open(Duration::from_secs(1)).await })
        };

        let (local, _remote) = connection_pair("a", "b");
        let _inbound = channel.open(local, Duration::from_secs(1)).await.unwrap();
        waiter.await.unwrap().unwrap();
    }
}
