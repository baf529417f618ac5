//! Directory client — fetches the node directory over HTTP.
//!
//! The directory is a JSON document listing known nodes with their public
//! keys, relay (ICE) servers, and the signalling endpoint:
//!
//! ```json
//! { "host": "signal.example.org", "port": 443, "path": "/",
//!   "iceServers": [{ "url": "stun:stun.example.org", "secret": null }],
//!   "nodes": [{ "id": "node-a", "publicKey": "<base64 SPKI DER>" }] }
//! ```
//!
//! Every field is optional; missing or wrong-typed fields fall back to
//! defaults. The document is the root of trust for peer public keys.

use crate::error::WireError;
use crate::registry::{PeerIdentity, PeerRegistry, RelayServer, SignalingServer};
use crate::signing::PublicKey;

use serde_json::Value;
use std::time::Duration;
use tracing::{info, warn};

/// Directory consulted when none is configured.
pub const DEFAULT_DISCOVERY_URL: &str = "https://liveg.tech/nodes.json";

/// Fetch timeout for the directory.
const FETCH_TIMEOUT_SECS: u64 = 10;

/// A parsed node directory.
#[derive(Debug, Clone, Default)]
pub struct Directory {
    pub signaling: SignalingServer,
    pub relays: Vec<RelayServer>,
    pub nodes: Vec<PeerIdentity>,
}

impl Directory {
    /// Interpret a directory document leniently.
    pub fn from_json(doc: &Value) -> Self {
        let mut signaling = SignalingServer::default();
        if let Some(host) = doc.get("host").and_then(Value::as_str) {
            signaling.host = host.to_string();
        }
        if let Some(port) = doc
            .get("port")
            .and_then(Value::as_u64)
            .and_then(|p| u16::try_from(p).ok())
        {
            signaling.port = port;
        }
        if let Some(path) = doc.get("path").and_then(Value::as_str) {
            signaling.path = path.to_string();
        }

        let relays = doc
            .get("iceServers")
            .and_then(Value::as_array)
            .map(|servers| {
                servers
                    .iter()
                    .filter_map(|server| {
                        let url = server.get("url").and_then(Value::as_str)?;
                        let secret = server
                            .get("secret")
                            .and_then(Value::as_str)
                            .map(String::from);
                        Some(RelayServer::new(url, secret))
                    })
                    .collect()
            })
            .unwrap_or_default();

        let nodes = doc
            .get("nodes")
            .and_then(Value::as_array)
            .map(|nodes| nodes.iter().filter_map(parse_node).collect())
            .unwrap_or_default();

        Self {
            signaling,
            relays,
            nodes,
        }
    }

    /// Build a registry snapshot from this directory.
    pub fn into_registry(self) -> PeerRegistry {
        let registry = PeerRegistry::new().with_signaling(self.signaling);
        let registry = self
            .relays
            .into_iter()
            .fold(registry, |registry, relay| registry.with_relay(relay));
        self.nodes
            .into_iter()
            .fold(registry, |registry, node| registry.with_peer(node))
    }
}

fn parse_node(node: &Value) -> Option<PeerIdentity> {
    let Some(id) = node.get("id").and_then(Value::as_str).filter(|id| !id.is_empty()) else {
        warn!("Directory: skipping node entry without an id");
        return None;
    };
    let Some(encoded) = node.get("publicKey").and_then(Value::as_str) else {
        warn!(node = %id, "Directory: skipping node without a public key");
        return None;
    };
    match PublicKey::from_base64(encoded) {
        Ok(public_key) => Some(PeerIdentity::new(id, public_key)),
        Err(e) => {
            warn!(node = %id, error = %e, "Directory: skipping node with unusable public key");
            None
        }
    }
}

/// HTTP client for the node directory.
#[derive(Debug, Clone)]
pub struct DirectoryClient {
    http: reqwest::Client,
    url: String,
}

impl DirectoryClient {
    /// Create a client for the directory at `url`.
    pub fn new(url: impl Into<String>) -> Result<Self, WireError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(FETCH_TIMEOUT_SECS))
            .build()
            .map_err(|e| WireError::Directory(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            url: url.into(),
        })
    }

    /// Directory URL.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// GET and parse the directory.
    pub async fn fetch(&self) -> Result<Directory, WireError> {
        let resp = self
            .http
            .get(&self.url)
            .send()
            .await
            .map_err(|e| WireError::Directory(format!("GET {} failed: {e}", self.url)))?;

        if !resp.status().is_success() {
            return Err(WireError::Directory(format!(
                "GET {} returned HTTP {}",
                self.url,
                resp.status()
            )));
        }

        let doc: Value = resp
            .json()
            .await
            .map_err(|e| WireError::Directory(format!("Invalid JSON from {}: {e}", self.url)))?;
        let directory = Directory::from_json(&doc);
        info!(
            url = %self.url,
            nodes = directory.nodes.len(),
            relays = directory.relays.len(),
            "Fetched node directory"
        );
        Ok(directory)
    }

    /// Fetch the directory and build a registry snapshot.
    pub async fn fetch_registry(&self) -> Result<PeerRegistry, WireError> {
        Ok(self.fetch().await?.into_registry())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signing::test_keys::keys;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_full_document() {
        let key = keys(0).public_key().to_base64().to_string();
        let doc = json!({
            "host": "signal.example.org",
            "port": 9000,
            "path": "/peers",
            "iceServers": [
                {"url": "stun:stun.example.org"},
                {"url": "turn:turn.example.org", "secret": "pw"}
            ],
            "nodes": [{"id": "node-a", "publicKey": key}]
        });
        let directory = Directory::from_json(&doc);
        assert_eq!(directory.signaling.host, "signal.example.org");
        assert_eq!(directory.signaling.port, 9000);
        assert_eq!(directory.signaling.path, "/peers");
        assert_eq!(directory.relays.len(), 2);
        assert_eq!(directory.relays[1].credential.as_deref(), Some("pw"));

        let registry = directory.into_registry();
        assert_eq!(registry.total_count(), 1);
        assert_eq!(
            &registry.get_peer("node-a").unwrap().public_key,
            keys(0).public_key()
        );
        assert_eq!(registry.relays().len(), 2);
    }

    #[test]
    fn test_missing_nodes_is_empty_registry() {
        let registry = Directory::from_json(&json!({"host": "h"})).into_registry();
        assert!(registry.is_empty());
        assert_eq!(registry.signaling().host, "h");
    }

    #[test]
    fn test_wrong_types_fall_back() {
        let directory = Directory::from_json(&json!({
            "host": 5,
            "port": "443",
            "path": [],
            "iceServers": {"url": "x"},
            "nodes": "none"
        }));
        assert_eq!(directory.signaling, SignalingServer::default());
        assert!(directory.relays.is_empty());
        assert!(directory.nodes.is_empty());

        let directory = Directory::from_json(&json!({"port": 70000}));
        assert_eq!(directory.signaling.port, 443);

        let directory = Directory::from_json(&json!([1, 2]));
        assert!(directory.nodes.is_empty());
    }

    #[test]
    fn test_bad_node_entries_skipped() {
        let key = keys(1).public_key().to_base64().to_string();
        let directory = Directory::from_json(&json!({
            "nodes": [
                {"id": "ok", "publicKey": key},
                {"publicKey": key},
                {"id": "no-key"},
                {"id": "bad-key", "publicKey": "AAAA"},
                {"id": "", "publicKey": key}
            ],
            "iceServers": [{"secret": "orphan"}]
        }));
        assert_eq!(directory.nodes.len(), 1);
        assert_eq!(directory.nodes[0].id, "ok");
        assert!(directory.relays.is_empty());
    }

    /// Serve one canned HTTP response on a local port.
    async fn serve_once(status: &'static str, body: String) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            let _ = stream.read(&mut buf).await;
            let resp = format!(
                "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            stream.write_all(resp.as_bytes()).await.unwrap();
            let _ = stream.shutdown().await;
        });
        format!("http://{addr}/nodes.json")
    }

    #[tokio::test]
    async fn test_fetch_registry() {
        let key = keys(2).public_key().to_base64().to_string();
        let body = json!({"nodes": [{"id": "node-c", "publicKey": key}]}).to_string();
        let url = serve_once("200 OK", body).await;

        let client = DirectoryClient::new(url).unwrap();
        let registry = client.fetch_registry().await.unwrap();
        assert!(registry.contains("node-c"));
    }

    #[tokio::test]
    async fn test_fetch_http_error() {
        let url = serve_once("500 Internal Server Error", "{}".to_string()).await;
        let client = DirectoryClient::new(url).unwrap();
        let err = client.fetch().await.unwrap_err();
        assert!(matches!(err, WireError::Directory(_)));
    }

    #[tokio::test]
    async fn test_fetch_invalid_json() {
        let url = serve_once("200 OK", "not json".to_string()).await;
        let client = DirectoryClient::new(url).unwrap();
        let err = client.fetch().await.unwrap_err();
        assert!(matches!(err, WireError::Directory(_)));
    }
}
