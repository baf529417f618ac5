//! Protocol engine — authenticated request/response between nodes.
//!
//! An [`Engine`] keeps the live [`PeerConnection`]s to each remote node.
//! Every request runs a fresh challenge-response exchange on one of them:
//!
//! 1. requester → `{type: open, self: node, out: c1}`
//! 2. responder → `{type: response, in: c1, out: s1, signature: sign(c1)}`
//! 3. requester verifies the signature with the responder's directory key
//! 4. requester → `{type: request, in: s1, out: c2, self: node, data, signature: sign(s1)}`
//! 5. responder verifies, redeems `s1` once, runs the [`RequestHandler`]
//! 6. responder → `{type: response, in: c2, data, signature: sign(c2)}`
//!
//! Signatures are always checked against the identity the connection is
//! bound to (the peer it was dialed to or accepted from), never against a
//! self-declared field. Inbound traffic that fails any check is dropped
//! without a reply.
//!
//! Inbound connections are always adopted, so two nodes dialing each other
//! at once end up with two working channels. A connection only counts as
//! the peer once it has completed a verified exchange; until then it never
//! blocks another connection and is the first to be evicted.

use crate::channel::{Channel, ChannelState, Inbound};
use crate::correlation::{generate_id, CorrelationTable};
use crate::error::{ErrorKind, WireError};
use crate::message::{Message, MessageType};
use crate::registry::{PeerIdentity, PeerRegistry};
use crate::signing::NodeKeys;
use crate::transport::{Connection, Transport};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use lru::LruCache;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Challenges a responder keeps outstanding per connection.
pub const MAX_ISSUED_CHALLENGES: usize = 64;

/// Live connections kept per remote node.
pub const MAX_CONNECTIONS_PER_PEER: usize = 4;

const ISSUED_CAPACITY: NonZeroUsize = match NonZeroUsize::new(MAX_ISSUED_CHALLENGES) {
    Some(n) => n,
    None => panic!("MAX_ISSUED_CHALLENGES must be non-zero"),
};

/// Configuration for an [`Engine`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// This node's unique ID.
    pub node_id: String,
    /// Default bound on each correlated-reply await.
    pub reply_timeout: Duration,
    /// Bound on a transport connection becoming ready.
    pub open_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            node_id: uuid::Uuid::new_v4().to_string(),
            reply_timeout: Duration::from_secs(30),
            open_timeout: Duration::from_secs(15),
        }
    }
}

/// Produces response payloads for authenticated requests.
///
/// Called once per request, after the requester's signature has been
/// verified. Whatever it returns is sent back as the response `data`.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle_request(&self, peer_id: &str, payload: Option<Value>) -> Value;
}

/// Answers every request with `null`.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullHandler;

#[async_trait]
impl RequestHandler for NullHandler {
    async fn handle_request(&self, _peer_id: &str, _payload: Option<Value>) -> Value {
        Value::Null
    }
}

/// Requester-side progress of one exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExchangeState {
    Idle,
    OpenSent,
    ChallengeReceived,
    RequestSent,
    Authenticated,
    Rejected,
}

struct Exchange<'a> {
    peer_id: &'a str,
    state: ExchangeState,
}

impl<'a> Exchange<'a> {
    fn new(peer_id: &'a str) -> Self {
        Self {
            peer_id,
            state: ExchangeState::Idle,
        }
    }

    fn advance(&mut self, next: ExchangeState) {
        debug!(peer = %self.peer_id, from = ?self.state, to = ?next, "exchange");
        self.state = next;
    }
}

/// Which side opened a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Dialed by this node.
    Outbound,
    /// Accepted from the remote node.
    Inbound,
}

/// Live connection to one remote node.
pub struct PeerConnection {
    identity: Arc<PeerIdentity>,
    direction: Direction,
    channel: Channel,
    table: CorrelationTable,
    /// Challenges issued to this peer and not yet redeemed.
    issued: Mutex<LruCache<String, ()>>,
    authenticated: AtomicBool,
    connected_at: Mutex<Option<DateTime<Utc>>>,
}

impl PeerConnection {
    fn new(identity: Arc<PeerIdentity>, direction: Direction) -> Self {
        Self {
            channel: Channel::new(identity.id.clone()),
            table: CorrelationTable::new(identity.id.clone()),
            identity,
            direction,
            issued: Mutex::new(LruCache::new(ISSUED_CAPACITY)),
            authenticated: AtomicBool::new(false),
            connected_at: Mutex::new(None),
        }
    }

    /// Remote node ID.
    pub fn peer_id(&self) -> &str {
        &self.identity.id
    }

    /// The identity this connection verifies signatures against.
    pub fn identity(&self) -> &Arc<PeerIdentity> {
        &self.identity
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn state(&self) -> ChannelState {
        self.channel.state()
    }

    /// Whether the peer has completed at least one verified exchange.
    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::Acquire)
    }

    pub fn connected_at(&self) -> Option<DateTime<Utc>> {
        *self.connected_at.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Snapshot for status reporting.
    pub fn status(&self) -> PeerStatus {
        PeerStatus {
            peer_id: self.identity.id.clone(),
            direction: self.direction,
            state: self.state(),
            authenticated: self.is_authenticated(),
            connected_at: self.connected_at(),
            pending_replies: self.table.pending_count(),
            connections: 1,
        }
    }

    fn mark_connected(&self) {
        *self.connected_at.lock().unwrap_or_else(|e| e.into_inner()) = Some(Utc::now());
    }

    fn issue_challenge(&self) -> String {
        let challenge = generate_id();
        self.issued
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .put(challenge.clone(), ());
        challenge
    }

    /// Consume an issued challenge. False if unknown or already redeemed.
    fn redeem_challenge(&self, challenge: &str) -> bool {
        self.issued
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop(challenge)
            .is_some()
    }

    fn mark_closed(&self) {
        self.authenticated.store(false, Ordering::Release);
        self.table.close();
        self.channel.close();
        self.issued.lock().unwrap_or_else(|e| e.into_inner()).clear();
        *self.connected_at.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }
}

impl fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerConnection")
            .field("peer_id", &self.peer_id())
            .field("direction", &self.direction)
            .field("state", &self.state())
            .field("authenticated", &self.is_authenticated())
            .finish_non_exhaustive()
    }
}

/// Serializable view of the connection a request to a peer would use.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeerStatus {
    pub peer_id: String,
    pub direction: Direction,
    pub state: ChannelState,
    pub authenticated: bool,
    pub connected_at: Option<DateTime<Utc>>,
    pub pending_replies: usize,
    /// Live connections to this peer, in either direction.
    pub connections: usize,
}

/// The connection a request should run on, best first: a proven channel,
/// then one we dialed, then one the peer dialed.
fn preferred(conns: &[Arc<PeerConnection>]) -> Option<Arc<PeerConnection>> {
    conns
        .iter()
        .filter_map(|conn| {
            let rank = match (conn.state(), conn.is_authenticated(), conn.direction) {
                (ChannelState::Open, true, _) => 0,
                (ChannelState::Open, false, Direction::Outbound) => 1,
                (ChannelState::Connecting, _, Direction::Outbound) => 2,
                (ChannelState::Open, false, Direction::Inbound) => 3,
                _ => return None,
            };
            Some((rank, conn))
        })
        .min_by_key(|(rank, _)| *rank)
        .map(|(_, conn)| Arc::clone(conn))
}

struct EngineInner {
    config: EngineConfig,
    keys: Arc<NodeKeys>,
    registry: RwLock<Arc<PeerRegistry>>,
    transport: Arc<dyn Transport>,
    handler: Arc<dyn RequestHandler>,
    peers: DashMap<String, Vec<Arc<PeerConnection>>>,
}

/// The protocol engine. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        keys: Arc<NodeKeys>,
        registry: PeerRegistry,
        transport: Arc<dyn Transport>,
        handler: Arc<dyn RequestHandler>,
    ) -> Self {
        info!(
            node_id = %config.node_id,
            peers = registry.total_count(),
            "Neuron engine started"
        );
        Self {
            inner: Arc::new(EngineInner {
                config,
                keys,
                registry: RwLock::new(Arc::new(registry)),
                transport,
                handler,
                peers: DashMap::new(),
            }),
        }
    }

    /// This node's ID.
    pub fn node_id(&self) -> &str {
        &self.inner.config.node_id
    }

    /// The current registry snapshot.
    pub fn registry(&self) -> Arc<PeerRegistry> {
        Arc::clone(&self.inner.registry.read().unwrap_or_else(|e| e.into_inner()))
    }

    /// Replace the registry snapshot.
    ///
    /// Existing connections keep the identity they were opened with; new
    /// connections use the new snapshot.
    pub fn install_registry(&self, registry: PeerRegistry) {
        let peers = registry.total_count();
        *self.inner.registry.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(registry);
        info!(peers, "Installed peer registry");
    }

    /// Open (or reuse) a connection to `peer_id`.
    ///
    /// Reuses an open connection in either direction when there is one.
    /// Concurrent callers share one dial.
    pub async fn connect(&self, peer_id: &str) -> Result<Arc<PeerConnection>, WireError> {
        let identity = self
            .registry()
            .get_peer(peer_id)
            .ok_or_else(|| WireError::UnknownPeer(peer_id.to_string()))?;

        let (conn, fresh) = {
            let mut conns = self.inner.peers.entry(peer_id.to_string()).or_default();
            conns.retain(|c| c.state() != ChannelState::Disconnected);
            match preferred(&conns) {
                Some(conn) => (conn, false),
                None => {
                    let conn = Arc::new(PeerConnection::new(identity, Direction::Outbound));
                    conn.channel.begin_connecting();
                    conns.push(Arc::clone(&conn));
                    (conn, true)
                }
            }
        };

        let open_timeout = self.inner.config.open_timeout;
        if !fresh {
            conn.channel.wait_open(open_timeout).await?;
            return Ok(conn);
        }

        info!(peer = %peer_id, "Connecting to peer");
        let opened = match self.inner.transport.dial(peer_id).await {
            Ok(transport_conn) => conn.channel.open(transport_conn, open_timeout).await,
            Err(e) => Err(e),
        };
        match opened {
            Ok(inbound) => {
                conn.mark_connected();
                self.spawn_pump(Arc::clone(&conn), inbound);
                info!(peer = %peer_id, "Channel open");
                Ok(conn)
            }
            Err(e) => {
                warn!(peer = %peer_id, error = %e, "Failed to connect to peer");
                self.drop_connection(&conn);
                Err(e)
            }
        }
    }

    /// Send an authenticated request and wait for the verified response.
    pub async fn request(&self, peer_id: &str, data: Value) -> Result<Value, WireError> {
        self.request_with_timeout(peer_id, data, self.inner.config.reply_timeout)
            .await
    }

    /// [`request`](Self::request) with an explicit bound on each reply.
    ///
    /// An exchange that fails on an inbound connection the peer never proved
    /// is retried once on a connection of our own.
    pub async fn request_with_timeout(
        &self,
        peer_id: &str,
        data: Value,
        timeout: Duration,
    ) -> Result<Value, WireError> {
        let conn = self.connect(peer_id).await?;
        let unproven = conn.direction == Direction::Inbound && !conn.is_authenticated();
        match self.exchange(&conn, data.clone(), timeout).await {
            Err(e) if unproven && !conn.is_authenticated() => {
                debug!(peer = %peer_id, error = %e, "Dropping unproven inbound connection and retrying");
                self.drop_connection(&conn);
                let conn = self.connect(peer_id).await?;
                self.exchange(&conn, data, timeout).await
            }
            result => result,
        }
    }

    /// Run one exchange on `conn`, tracing every step including failure.
    async fn exchange(
        &self,
        conn: &Arc<PeerConnection>,
        data: Value,
        timeout: Duration,
    ) -> Result<Value, WireError> {
        let mut exchange = Exchange::new(conn.peer_id());
        match self.run_exchange(conn, &mut exchange, data, timeout).await {
            Ok(value) => {
                conn.authenticated.store(true, Ordering::Release);
                exchange.advance(ExchangeState::Authenticated);
                Ok(value)
            }
            Err(e) => {
                exchange.advance(ExchangeState::Rejected);
                if matches!(e.kind(), ErrorKind::Authenticity | ErrorKind::Protocol) {
                    warn!(peer = %conn.peer_id(), error = %e, "Closing connection that failed verification");
                    self.drop_connection(conn);
                }
                Err(e)
            }
        }
    }

    async fn run_exchange(
        &self,
        conn: &PeerConnection,
        exchange: &mut Exchange<'_>,
        data: Value,
        timeout: Duration,
    ) -> Result<Value, WireError> {
        let peer_id = conn.peer_id();

        let c1 = conn.table.next_id();
        let pending = conn.table.register(&c1)?;
        conn.channel.send(&Message::open(&c1))?;
        exchange.advance(ExchangeState::OpenSent);

        let reply = pending.wait(timeout).await?;
        let (Some(answered), Some(challenge), Some(signature)) = (
            reply.in_id.as_deref(),
            reply.out_id.as_deref(),
            reply.signature.as_deref(),
        ) else {
            return Err(WireError::Malformed {
                peer: peer_id.to_string(),
                reason: "open reply requires string `in`, `out` and `signature`".to_string(),
            });
        };
        if !conn.identity.public_key.verify(answered.as_bytes(), signature) {
            warn!(peer = %peer_id, "Open reply signature did not verify");
            return Err(WireError::Authenticity {
                peer: peer_id.to_string(),
            });
        }
        exchange.advance(ExchangeState::ChallengeReceived);

        let c2 = conn.table.next_id();
        let pending = conn.table.register(&c2)?;
        let signature = self.inner.keys.sign(challenge.as_bytes())?;
        conn.channel
            .send(&Message::request(challenge, &c2, data, signature))?;
        exchange.advance(ExchangeState::RequestSent);

        let reply = pending.wait(timeout).await?;
        let (Some(answered), Some(signature)) =
            (reply.in_id.as_deref(), reply.signature.as_deref())
        else {
            return Err(WireError::Malformed {
                peer: peer_id.to_string(),
                reason: "response requires string `in` and `signature`".to_string(),
            });
        };
        if !conn.identity.public_key.verify(answered.as_bytes(), signature) {
            warn!(peer = %peer_id, "Response signature did not verify");
            return Err(WireError::Authenticity {
                peer: peer_id.to_string(),
            });
        }
        Ok(reply.data.unwrap_or(Value::Null))
    }

    /// Adopt an inbound transport connection.
    ///
    /// Connections from nodes missing from the registry are closed. When a
    /// peer already has [`MAX_CONNECTIONS_PER_PEER`] connections, the oldest
    /// unauthenticated inbound one is evicted; if every one is proven, the
    /// new connection is closed instead.
    pub async fn accept(&self, conn: Connection) -> Result<Arc<PeerConnection>, WireError> {
        let peer_id = conn.peer_id.clone();
        let Some(identity) = self.registry().get_peer(&peer_id) else {
            warn!(peer = %peer_id, "Rejecting connection from unknown node");
            conn.link.close();
            return Err(WireError::UnknownPeer(peer_id));
        };

        let peer = Arc::new(PeerConnection::new(identity, Direction::Inbound));
        peer.channel.begin_connecting();
        {
            let mut conns = self.inner.peers.entry(peer_id.clone()).or_default();
            conns.retain(|c| c.state() != ChannelState::Disconnected);
            if conns.len() >= MAX_CONNECTIONS_PER_PEER {
                let unproven = conns
                    .iter()
                    .position(|c| c.direction == Direction::Inbound && !c.is_authenticated());
                match unproven {
                    Some(index) => {
                        debug!(peer = %peer_id, "Evicting unauthenticated inbound connection");
                        conns.remove(index).mark_closed();
                    }
                    None => {
                        debug!(peer = %peer_id, "Connection limit reached; closing inbound connection");
                        conn.link.close();
                        return Err(WireError::Transport(format!(
                            "too many connections from `{peer_id}`"
                        )));
                    }
                }
            }
            conns.push(Arc::clone(&peer));
        }

        match peer.channel.open(conn, self.inner.config.open_timeout).await {
            Ok(inbound) => {
                peer.mark_connected();
                self.spawn_pump(Arc::clone(&peer), inbound);
                info!(peer = %peer_id, "Accepted connection");
                Ok(peer)
            }
            Err(e) => {
                self.drop_connection(&peer);
                Err(e)
            }
        }
    }

    /// Accept every connection arriving on `incoming`.
    pub fn serve(&self, mut incoming: mpsc::UnboundedReceiver<Connection>) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            while let Some(conn) = incoming.recv().await {
                let engine = engine.clone();
                tokio::spawn(async move {
                    if let Err(e) = engine.accept(conn).await {
                        debug!(error = %e, "Inbound connection not adopted");
                    }
                });
            }
            debug!("Inbound connection stream ended");
        })
    }

    /// Close every connection to `peer_id`. Returns false if there was none.
    pub fn disconnect(&self, peer_id: &str) -> bool {
        match self.inner.peers.remove(peer_id) {
            Some((_, conns)) if !conns.is_empty() => {
                for conn in &conns {
                    conn.mark_closed();
                }
                info!(peer = %peer_id, connections = conns.len(), "Disconnected");
                true
            }
            _ => false,
        }
    }

    /// Status of the connection a request to `peer_id` would use, if any.
    pub fn peer_status(&self, peer_id: &str) -> Option<PeerStatus> {
        let conns = self.inner.peers.get(peer_id)?;
        let conn = preferred(&conns).or_else(|| conns.first().cloned())?;
        Some(PeerStatus {
            connections: conns.len(),
            ..conn.status()
        })
    }

    /// Status of every peer with an open connection, sorted by peer ID.
    pub fn connected_peers(&self) -> Vec<PeerStatus> {
        let mut peers: Vec<_> = self
            .inner
            .peers
            .iter()
            .filter_map(|entry| {
                let conns = entry.value();
                preferred(conns).map(|conn| PeerStatus {
                    connections: conns.len(),
                    ..conn.status()
                })
            })
            .filter(|status| status.state == ChannelState::Open)
            .collect();
        peers.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        peers
    }

    /// Close `conn` and stop tracking it.
    fn drop_connection(&self, conn: &Arc<PeerConnection>) {
        conn.mark_closed();
        self.forget(conn);
    }

    fn forget(&self, conn: &Arc<PeerConnection>) {
        if let Some(mut conns) = self.inner.peers.get_mut(conn.peer_id()) {
            conns.retain(|c| !Arc::ptr_eq(c, conn));
        }
        self.inner
            .peers
            .remove_if(conn.peer_id(), |_, conns| conns.is_empty());
    }

    /// One task per channel: routes inbound messages until the channel closes.
    fn spawn_pump(&self, conn: Arc<PeerConnection>, mut inbound: Inbound) {
        let weak: Weak<EngineInner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            while let Some(msg) = inbound.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                Engine { inner }.route(&conn, msg);
            }
            conn.mark_closed();
            if let Some(inner) = weak.upgrade() {
                Engine { inner }.forget(&conn);
            }
            info!(peer = %conn.peer_id(), direction = ?conn.direction, "Channel closed");
        });
    }

    fn route(&self, conn: &Arc<PeerConnection>, msg: Message) {
        match msg.kind {
            MessageType::Response => {
                let outcome = conn.table.deliver(msg);
                trace!(peer = %conn.peer_id(), ?outcome, "response routed");
            }
            MessageType::Open if msg.out_id.is_some() => self.respond_open(conn, &msg),
            MessageType::Request if msg.out_id.is_some() && msg.from_node() => {
                let engine = self.clone();
                let conn = Arc::clone(conn);
                tokio::spawn(async move { engine.respond_request(&conn, msg).await });
            }
            _ => trace!(peer = %conn.peer_id(), kind = ?msg.kind, "dropping unroutable message"),
        }
    }

    /// Answer an `open`: prove our identity and issue a challenge.
    fn respond_open(&self, conn: &PeerConnection, msg: &Message) {
        let Some(c1) = msg.out_id.as_deref() else {
            return;
        };
        let signature = match self.inner.keys.sign(c1.as_bytes()) {
            Ok(signature) => signature,
            Err(e) => {
                warn!(peer = %conn.peer_id(), error = %e, "Failed to sign open reply");
                return;
            }
        };
        let challenge = conn.issue_challenge();
        if let Err(e) = conn
            .channel
            .send(&Message::open_reply(c1, &challenge, signature))
        {
            debug!(peer = %conn.peer_id(), error = %e, "Failed to send open reply");
        }
    }

    /// Verify a request and, if it checks out, answer it.
    async fn respond_request(&self, conn: &PeerConnection, msg: Message) {
        let peer_id = conn.peer_id();
        let (Some(challenge), Some(c2), Some(signature)) = (
            msg.in_id.as_deref(),
            msg.out_id.as_deref(),
            msg.signature.as_deref(),
        ) else {
            debug!(peer = %peer_id, "Dropping request without challenge or signature");
            return;
        };
        if !conn.identity.public_key.verify(challenge.as_bytes(), signature) {
            debug!(peer = %peer_id, "Dropping request with bad signature");
            return;
        }
        if !conn.redeem_challenge(challenge) {
            debug!(peer = %peer_id, "Dropping request for unknown or redeemed challenge");
            return;
        }
        conn.authenticated.store(true, Ordering::Release);

        let result = self
            .inner
            .handler
            .handle_request(peer_id, msg.data.clone())
            .await;
        let signature = match self.inner.keys.sign(c2.as_bytes()) {
            Ok(signature) => signature,
            Err(e) => {
                warn!(peer = %peer_id, error = %e, "Failed to sign response");
                return;
            }
        };
        if let Err(e) = conn.channel.send(&Message::response(c2, result, signature)) {
            debug!(peer = %peer_id, error = %e, "Failed to send response");
        }
    }
}
