//! Correlation table — matches replies to the exchanges waiting for them.
//!
//! Every exchange leg is tagged with a correlation id. The side that
//! originates a leg registers a waiter under its id; the reply echoes the
//! id in its `in` field. Replies may arrive before the waiter registers, so
//! unclaimed replies are buffered for one later claim. Each id is delivered
//! at most once: a reply for an id that was already resolved or buffered is
//! dropped.
//!
//! Memory is bounded. At most [`MAX_BUFFERED_REPLIES`] unclaimed replies are
//! kept (least recently buffered evicted first), and the last
//! [`MAX_CONSUMED_IDS`] consumed ids are remembered for duplicate
//! suppression.

use crate::error::WireError;
use crate::message::Message;

use lru::LruCache;
use rand::RngCore;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::trace;

/// Maximum unclaimed replies buffered per connection.
pub const MAX_BUFFERED_REPLIES: usize = 256;

/// Number of consumed ids remembered per connection.
pub const MAX_CONSUMED_IDS: usize = 1024;

const BUFFERED_CAPACITY: NonZeroUsize = match NonZeroUsize::new(MAX_BUFFERED_REPLIES) {
    Some(n) => n,
    None => panic!("MAX_BUFFERED_REPLIES must be non-zero"),
};

const CONSUMED_CAPACITY: NonZeroUsize = match NonZeroUsize::new(MAX_CONSUMED_IDS) {
    Some(n) => n,
    None => panic!("MAX_CONSUMED_IDS must be non-zero"),
};

/// Generate a correlation id: 16 lowercase hex characters.
pub fn generate_id() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Outcome of [`CorrelationTable::deliver`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Handed to a registered waiter.
    Resolved,
    /// No waiter yet; kept for a later claim.
    Buffered,
    /// Duplicate, uncorrelated, or arrived after close.
    Dropped,
}

struct TableState {
    waiters: HashMap<String, oneshot::Sender<Message>>,
    buffered: LruCache<String, Message>,
    consumed: LruCache<String, ()>,
    closed: bool,
}

impl TableState {
    fn knows(&self, id: &str) -> bool {
        self.waiters.contains_key(id) || self.buffered.contains(id) || self.consumed.contains(id)
    }
}

/// Per-connection correlation table.
pub struct CorrelationTable {
    peer_id: String,
    state: Arc<Mutex<TableState>>,
}

impl CorrelationTable {
    /// Create an empty table for the connection to `peer_id`.
    pub fn new(peer_id: impl Into<String>) -> Self {
        Self {
            peer_id: peer_id.into(),
            state: Arc::new(Mutex::new(TableState {
                waiters: HashMap::new(),
                buffered: LruCache::new(BUFFERED_CAPACITY),
                consumed: LruCache::new(CONSUMED_CAPACITY),
                closed: false,
            })),
        }
    }

    /// A fresh id not currently pending, buffered or recently consumed here.
    pub fn next_id(&self) -> String {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            let id = generate_id();
            if !state.knows(&id) {
                return id;
            }
        }
    }

    /// Register interest in the reply to `id`.
    ///
    /// If the reply is already buffered the returned handle resolves
    /// immediately. Fails if `id` already has a waiter or was consumed.
    pub fn register(&self, id: &str) -> Result<PendingReply, WireError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.closed {
            return Err(WireError::ChannelClosed {
                peer: self.peer_id.clone(),
            });
        }
        if state.waiters.contains_key(id) || state.consumed.contains(id) {
            return Err(WireError::DuplicateCorrelation(id.to_string()));
        }

        let slot = match state.buffered.pop(id) {
            Some(msg) => {
                state.consumed.put(id.to_string(), ());
                trace!(peer = %self.peer_id, id, "claimed buffered reply");
                Slot::Ready(msg)
            }
            None => {
                let (tx, rx) = oneshot::channel();
                state.waiters.insert(id.to_string(), tx);
                Slot::Waiting(rx)
            }
        };

        Ok(PendingReply {
            id: id.to_string(),
            peer_id: self.peer_id.clone(),
            state: Arc::clone(&self.state),
            slot: Some(slot),
        })
    }

    /// Wait up to `timeout` for the reply to `id`.
    pub async fn await_reply(&self, id: &str, timeout: Duration) -> Result<Message, WireError> {
        self.register(id)?.wait(timeout).await
    }

    /// Route an inbound reply by its `in` id.
    pub fn deliver(&self, msg: Message) -> Delivery {
        let Some(id) = msg.in_id.clone() else {
            return Delivery::Dropped;
        };
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.closed || state.consumed.contains(&id) || state.buffered.contains(&id) {
            trace!(peer = %self.peer_id, id, "dropping duplicate reply");
            return Delivery::Dropped;
        }

        if let Some(waiter) = state.waiters.remove(&id) {
            state.consumed.put(id.clone(), ());
            return match waiter.send(msg) {
                Ok(()) => Delivery::Resolved,
                // The waiter gave up between timeout and cleanup.
                Err(_) => Delivery::Dropped,
            };
        }

        if let Some((evicted, _)) = state.buffered.push(id.clone(), msg) {
            if evicted != id {
                trace!(peer = %self.peer_id, id = %evicted, "evicted unclaimed reply");
            }
        }
        Delivery::Buffered
    }

    /// Fail every waiter and discard buffered replies. Terminal.
    pub fn close(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.closed = true;
        // Dropping the senders wakes waiters with a closed-channel error.
        state.waiters.clear();
        state.buffered.clear();
    }

    /// Number of registered waiters.
    pub fn pending_count(&self) -> usize {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.waiters.len()
    }

    /// Number of buffered, unclaimed replies.
    pub fn buffered_count(&self) -> usize {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.buffered.len()
    }
}

enum Slot {
    Ready(Message),
    Waiting(oneshot::Receiver<Message>),
}

/// A registered interest in one reply. Dropping it removes the waiter.
pub struct PendingReply {
    id: String,
    peer_id: String,
    state: Arc<Mutex<TableState>>,
    slot: Option<Slot>,
}

impl PendingReply {
    /// The correlation id being awaited.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait up to `timeout` for the reply.
    pub async fn wait(mut self, timeout: Duration) -> Result<Message, WireError> {
        match self.slot.take() {
            Some(Slot::Ready(msg)) => Ok(msg),
            Some(Slot::Waiting(rx)) => match tokio::time::timeout(timeout, rx).await {
                Ok(Ok(msg)) => Ok(msg),
                Ok(Err(_)) => Err(WireError::ChannelClosed {
                    peer: self.peer_id.clone(),
                }),
                Err(_) => Err(WireError::Timeout {
                    peer: self.peer_id.clone(),
                    correlation: self.id.clone(),
                }),
            },
            None => Err(WireError::DuplicateCorrelation(self.id.clone())),
        }
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        // Release our receiver first so the sender reports closed.
        self.slot.take();
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state
            .waiters
            .get(&self.id)
            .is_some_and(|waiter| waiter.is_closed())
        {
            state.waiters.remove(&self.id);
        }
    }
}
