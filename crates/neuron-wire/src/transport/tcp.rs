//! TCP transport: length-prefixed JSON frames over plain TCP.
//!
//! The dialer's first frame names itself (`{"peer": "<node id>"}`); the
//! acceptor reports that id as the connection's remote peer. This plays the
//! part a signalling server plays for browser transports. It is not an
//! identity proof: the protocol handshake verifies keys on top of it.

use super::{Connection, Link, Transport, TransportEvent};
use crate::error::WireError;
use crate::message::{decode_frame, decode_length, encode_frame, MAX_FRAME_SIZE};

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

/// How long an accepted socket may take to identify itself.
const HELLO_TIMEOUT: Duration = Duration::from_secs(5);

/// Dials peers by id using a static address book.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    node_id: String,
    addresses: HashMap<String, SocketAddr>,
}

impl TcpTransport {
    /// Create a transport that identifies as `node_id`.
    pub fn new(node_id: impl Into<String>, addresses: HashMap<String, SocketAddr>) -> Self {
        Self {
            node_id: node_id.into(),
            addresses,
        }
    }

    /// Bind a listener. Returns the bound address, the inbound connection
    /// stream, and the accept task.
    pub async fn listen(
        &self,
        addr: SocketAddr,
    ) -> Result<
        (
            SocketAddr,
            mpsc::UnboundedReceiver<Connection>,
            tokio::task::JoinHandle<()>,
        ),
        WireError,
    > {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!("TCP transport: listening on {} (node_id={})", local_addr, self.node_id);

        let (tx, rx) = mpsc::unbounded_channel();
        let accept_handle = tokio::spawn(accept_loop(listener, tx));
        Ok((local_addr, rx, accept_handle))
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn dial(&self, peer_id: &str) -> Result<Connection, WireError> {
        let addr = self
            .addresses
            .get(peer_id)
            .copied()
            .ok_or_else(|| WireError::Transport(format!("no address known for `{peer_id}`")))?;
        debug!("TCP transport: connecting to {} at {}", peer_id, addr);

        let stream = TcpStream::connect(addr).await?;
        let (reader, mut writer) = stream.into_split();
        write_frame(&mut writer, &json!({ "peer": self.node_id })).await?;
        Ok(spawn_connection(peer_id.to_string(), reader, writer))
    }
}

/// Internal accept loop — runs in a spawned task.
async fn accept_loop(listener: TcpListener, incoming: mpsc::UnboundedSender<Connection>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                debug!("TCP transport: accepted connection from {}", addr);
                let tx = incoming.clone();
                tokio::spawn(async move {
                    match identify(stream).await {
                        Ok(conn) => {
                            if tx.send(conn).is_err() {
                                debug!("TCP transport: no consumer for inbound connections");
                            }
                        }
                        Err(e) => debug!("TCP transport: dropped {} before hello: {}", addr, e),
                    }
                });
                if incoming.is_closed() {
                    return;
                }
            }
            Err(e) => {
                error!("TCP transport: accept error: {}", e);
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

/// Read the hello frame from a fresh socket.
async fn identify(stream: TcpStream) -> Result<Connection, WireError> {
    let (mut reader, writer) = stream.into_split();
    let hello = tokio::time::timeout(HELLO_TIMEOUT, read_frame(&mut reader))
        .await
        .map_err(|_| WireError::Transport("hello timed out".to_string()))??;
    let peer_id = hello
        .get("peer")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| WireError::Transport("hello frame without peer id".to_string()))?
        .to_string();
    Ok(spawn_connection(peer_id, reader, writer))
}

/// Wire a socket's halves to a [`Connection`]: a writer task draining the
/// link's queue and a reader task raising events.
fn spawn_connection<R, W>(peer_id: String, mut reader: R, mut writer: W) -> Connection
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Outgoing>();
    let _ = event_tx.send(TransportEvent::Open);

    let writer_peer = peer_id.clone();
    tokio::spawn(async move {
        while let Some(Outgoing::Frame(frame)) = out_rx.recv().await {
            if let Err(e) = write_frame(&mut writer, &frame).await {
                warn!("TCP transport: write to {} failed: {}", writer_peer, e);
                break;
            }
        }
        let _ = writer.shutdown().await;
    });

    let reader_events = event_tx.clone();
    let reader_peer = peer_id.clone();
    let reader_task = tokio::spawn(async move {
        loop {
            match read_frame(&mut reader).await {
                Ok(frame) => {
                    if reader_events.send(TransportEvent::Data(frame)).is_err() {
                        break;
                    }
                }
                Err(WireError::ChannelClosed { .. }) => break,
                Err(e) => {
                    debug!("TCP transport: connection with {} ended: {}", reader_peer, e);
                    break;
                }
            }
        }
        let _ = reader_events.send(TransportEvent::Closed);
    });

    let link = TcpLink {
        outgoing: out_tx,
        events: event_tx,
        reader: reader_task.abort_handle(),
    };
    Connection {
        peer_id,
        link: Arc::new(link),
        events: event_rx,
    }
}

enum Outgoing {
    Frame(Value),
    Shutdown,
}

struct TcpLink {
    outgoing: mpsc::UnboundedSender<Outgoing>,
    events: mpsc::UnboundedSender<TransportEvent>,
    reader: AbortHandle,
}

impl Link for TcpLink {
    fn send(&self, frame: Value) -> Result<(), WireError> {
        self.outgoing
            .send(Outgoing::Frame(frame))
            .map_err(|_| WireError::Transport("TCP connection closed".to_string()))
    }

    fn close(&self) {
        let _ = self.outgoing.send(Outgoing::Shutdown);
        if self.reader.is_finished() {
            return;
        }
        self.reader.abort();
        let _ = self.events.send(TransportEvent::Closed);
    }
}

impl Drop for TcpLink {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Write a frame (4-byte length + JSON).
pub async fn write_frame<W>(writer: &mut W, frame: &Value) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    let bytes = encode_frame(frame)?;
    if bytes.len() - 4 > MAX_FRAME_SIZE as usize {
        return Err(WireError::MessageTooLarge {
            size: (bytes.len() - 4) as u32,
            max: MAX_FRAME_SIZE,
        });
    }
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a frame (4-byte length + JSON). Clean EOF maps to `ChannelClosed`.
pub async fn read_frame<R>(reader: &mut R) -> Result<Value, WireError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(WireError::ChannelClosed {
                peer: String::new(),
            });
        }
        Err(e) => return Err(WireError::Io(e)),
    }

    let len = decode_length(&header);
    if len > MAX_FRAME_SIZE {
        return Err(WireError::MessageTooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        });
    }

    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;

    Ok(decode_frame(&body)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_roundtrip_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, &json!({"type": "open", "out": "c1"}))
            .await
            .unwrap();
        let frame = read_frame(&mut b).await.unwrap();
        assert_eq!(frame["out"], "c1");
    }

    #[tokio::test]
    async fn test_read_frame_rejects_oversized() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&(MAX_FRAME_SIZE + 1).to_be_bytes())
            .await
            .unwrap();
        let err = read_frame(&mut b).await.unwrap_err();
        assert!(matches!(err, WireError::MessageTooLarge { .. }));
    }

    #[tokio::test]
    async fn test_read_frame_eof() {
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);
        let err = read_frame(&mut b).await.unwrap_err();
        assert!(matches!(err, WireError::ChannelClosed { .. }));
    }

    #[tokio::test]
    async fn test_dial_and_accept() {
        let acceptor = TcpTransport::new("node-b", HashMap::new());
        let (addr, mut incoming, _task) =
            acceptor.listen("127.0.0.1:0".parse().unwrap()).await.unwrap();

        let mut book = HashMap::new();
        book.insert("node-b".to_string(), addr);
        let dialer = TcpTransport::new("node-a", book);

        let mut outbound = dialer.dial("node-b").await.unwrap();
        let mut inbound = incoming.recv().await.unwrap();
        assert_eq!(inbound.peer_id, "node-a");
        assert_eq!(outbound.events.recv().await, Some(TransportEvent::Open));
        assert_eq!(inbound.events.recv().await, Some(TransportEvent::Open));

        outbound.link.send(json!({"type": "open", "out": "c1"})).unwrap();
        match inbound.events.recv().await {
            Some(TransportEvent::Data(frame)) => assert_eq!(frame["out"], "c1"),
            other => panic!("Expected data, got {other:?}"),
        }

        outbound.link.close();
        assert_eq!(outbound.events.recv().await, Some(TransportEvent::Closed));
    }

    #[tokio::test]
    async fn test_accept_loop_serves_successive_dials() {
        let acceptor = TcpTransport::new("node-b", HashMap::new());
        let (addr, mut incoming, accept_task) =
            acceptor.listen("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let mut book = HashMap::new();
        book.insert("node-b".to_string(), addr);

        for id in ["node-a", "node-c"] {
            let _outbound = TcpTransport::new(id, book.clone())
                .dial("node-b")
                .await
                .unwrap();
            assert_eq!(incoming.recv().await.unwrap().peer_id, id);
        }

        // Nobody left to hand connections to: the loop exits after its next accept.
        drop(incoming);
        let _late = TcpTransport::new("node-d", book)
            .dial("node-b")
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(2), accept_task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_dial_without_address() {
        let dialer = TcpTransport::new("node-a", HashMap::new());
        let err = dialer.dial("node-z").await.unwrap_err();
        assert!(matches!(err, WireError::Transport(_)));
    }
}
