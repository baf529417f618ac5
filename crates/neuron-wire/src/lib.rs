//! Neuron wire protocol — authenticated request/response between nodes.
//!
//! Nodes look each other up in a signed-key directory, then exchange
//! correlated JSON messages over any duplex transport. Every request is
//! preceded by an RSA challenge-response handshake in both directions.
//!
//! ## Architecture
//!
//! - **DirectoryClient**: Fetches the node directory and builds a registry
//! - **PeerRegistry**: Immutable snapshot of known node identities
//! - **Engine**: Drives the handshake and request state machine per peer
//! - **Channel**: Per-peer wrapper over a transport connection
//! - **CorrelationTable**: Matches replies to the exchanges awaiting them
//! - **RequestHandler**: Trait for producing responses to authenticated requests
//! - **Transport**: Seam for the substrate (in-memory and TCP provided)

pub mod channel;
pub mod correlation;
pub mod directory;
pub mod engine;
pub mod error;
pub mod message;
pub mod registry;
pub mod signing;
pub mod transport;

pub use channel::{Channel, ChannelState};
pub use correlation::{CorrelationTable, Delivery};
pub use directory::{Directory, DirectoryClient, DEFAULT_DISCOVERY_URL};
pub use engine::{
    Direction, Engine, EngineConfig, NullHandler, PeerConnection, PeerStatus, RequestHandler,
};
pub use error::{ErrorKind, WireError};
pub use message::{Message, MessageType};
pub use registry::{PeerIdentity, PeerRegistry, RelayServer, SignalingServer};
pub use signing::{NodeKeys, PublicKey};
pub use transport::{Connection, Link, Transport, TransportEvent};
