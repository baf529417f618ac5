//! Directory, serve and request commands.

use crate::cmd::{config_path, load_config_or_exit, runtime};
use crate::config::NeuronConfig;
use crate::ui;
use neuron_wire::transport::tcp::TcpTransport;
use neuron_wire::{
    DirectoryClient, Engine, ErrorKind, NodeKeys, NullHandler, PeerRegistry, RequestHandler,
};

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// How often `serve` re-fetches the directory.
const DIRECTORY_REFRESH: Duration = Duration::from_secs(300);

/// Answers every request with the payload it carried.
struct EchoHandler {
    node_id: String,
}

#[async_trait]
impl RequestHandler for EchoHandler {
    async fn handle_request(&self, peer_id: &str, payload: Option<Value>) -> Value {
        info!(peer = %peer_id, "Answering request");
        json!({ "node": self.node_id, "echo": payload })
    }
}

fn directory_client_or_exit(url: &str) -> DirectoryClient {
    DirectoryClient::new(url).unwrap_or_else(|e| {
        ui::error(&e.to_string());
        std::process::exit(1);
    })
}

async fn fetch_registry_or_exit(client: &DirectoryClient) -> PeerRegistry {
    match client.fetch_registry().await {
        Ok(registry) => registry,
        Err(e) => {
            ui::error_with_fix(
                &e.to_string(),
                "Check network access, or set discovery_url in the config",
            );
            std::process::exit(1);
        }
    }
}

/// Key pair and TCP address book, or exit.
fn identity_or_exit(cfg: &NeuronConfig) -> (NodeKeys, HashMap<String, SocketAddr>) {
    let keys = cfg.node_keys().unwrap_or_else(|e| {
        ui::error_with_fix(&e.to_string(), "Run `neuron init` to generate a key pair");
        std::process::exit(1);
    });
    let addresses = cfg.peer_addresses().unwrap_or_else(|e| {
        ui::error_with_fix(&e.to_string(), "Fix the [peers] table in the config");
        std::process::exit(1);
    });
    (keys, addresses)
}

pub fn cmd_discover(config: Option<PathBuf>, json: bool) {
    let cfg = load_config_or_exit(&config_path(config));
    let client = directory_client_or_exit(&cfg.discovery_url);
    let rt = runtime();
    let registry = rt.block_on(fetch_registry_or_exit(&client));

    if json {
        let nodes: Vec<Value> = registry
            .all_peers()
            .iter()
            .map(|peer| json!({ "id": peer.id, "publicKey": peer.public_key.to_base64() }))
            .collect();
        let doc = json!({
            "signaling": registry.signaling(),
            "relays": registry.relays(),
            "nodes": nodes,
        });
        println!(
            "{}",
            serde_json::to_string_pretty(&doc).unwrap_or_else(|_| doc.to_string())
        );
        return;
    }

    let signaling = registry.signaling();
    ui::section("Directory");
    ui::kv("Source", client.url());
    ui::kv(
        "Signaling",
        &format!("{}:{}{}", signaling.host, signaling.port, signaling.path),
    );
    ui::blank();

    ui::section(&format!("Relays ({})", registry.relays().len()));
    for relay in registry.relays() {
        let auth = if relay.credential.is_some() {
            " (authenticated)"
        } else {
            ""
        };
        println!("    {}{auth}", relay.url);
    }
    ui::blank();

    ui::section(&format!("Nodes ({})", registry.total_count()));
    if registry.is_empty() {
        ui::hint("The directory lists no nodes");
    }
    for peer in registry.all_peers() {
        ui::peer_line(&peer.id, peer.public_key.to_base64());
    }
}

pub fn cmd_serve(config: Option<PathBuf>, listen: Option<SocketAddr>) {
    let cfg = load_config_or_exit(&config_path(config));
    let (keys, addresses) = identity_or_exit(&cfg);
    let engine_config = cfg.engine_config();
    let listen_addr = listen.unwrap_or(cfg.listen_addr);
    let client = directory_client_or_exit(&cfg.discovery_url);

    let rt = runtime();
    rt.block_on(async move {
        let registry = fetch_registry_or_exit(&client).await;
        let node_id = engine_config.node_id.clone();
        let transport = TcpTransport::new(node_id.clone(), addresses);
        let (bound, incoming, _accept) = transport.listen(listen_addr).await.unwrap_or_else(|e| {
            ui::error_with_fix(
                &format!("Failed to listen on {listen_addr}: {e}"),
                "Pick another address with --listen",
            );
            std::process::exit(1);
        });

        let engine = Engine::new(
            engine_config,
            Arc::new(keys),
            registry,
            Arc::new(transport),
            Arc::new(EchoHandler {
                node_id: node_id.clone(),
            }),
        );
        let server = engine.serve(incoming);

        ui::success("Neuron node is serving");
        ui::kv("Node", &node_id);
        ui::kv("Listening", &bound.to_string());
        ui::kv("Known nodes", &engine.registry().total_count().to_string());
        ui::hint("Press Ctrl+C to stop");

        let refresher = {
            let engine = engine.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(DIRECTORY_REFRESH);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    match client.fetch_registry().await {
                        Ok(registry) => engine.install_registry(registry),
                        Err(e) => warn!(error = %e, "Directory refresh failed; keeping previous registry"),
                    }
                }
            })
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Shutting down"),
            _ = server => warn!("Listener stopped"),
        }
        refresher.abort();
        for peer in engine.connected_peers() {
            engine.disconnect(&peer.peer_id);
        }
    });
}

pub fn cmd_request(config: Option<PathBuf>, peer: &str, data: &str, timeout: Option<u64>) {
    let cfg = load_config_or_exit(&config_path(config));
    let (keys, addresses) = identity_or_exit(&cfg);
    let engine_config = cfg.engine_config();
    let timeout = Duration::from_secs(timeout.unwrap_or(cfg.reply_timeout_secs));
    let payload =
        serde_json::from_str::<Value>(data).unwrap_or_else(|_| Value::String(data.to_string()));
    let client = directory_client_or_exit(&cfg.discovery_url);

    let rt = runtime();
    rt.block_on(async move {
        let registry = fetch_registry_or_exit(&client).await;
        if !registry.contains(peer) {
            ui::error_with_fix(
                &format!("Node `{peer}` is not in the directory"),
                "Run `neuron discover` to list known nodes",
            );
            std::process::exit(1);
        }

        let transport = TcpTransport::new(engine_config.node_id.clone(), addresses);
        let engine = Engine::new(
            engine_config,
            Arc::new(keys),
            registry,
            Arc::new(transport),
            Arc::new(NullHandler),
        );

        match engine.request_with_timeout(peer, payload, timeout).await {
            Ok(value) => {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&value).unwrap_or_else(|_| value.to_string())
                );
                engine.disconnect(peer);
            }
            Err(e) => {
                let fix = match e.kind() {
                    ErrorKind::Channel => {
                        "Check the node is running and its address is listed under [peers]"
                    }
                    ErrorKind::Authenticity => {
                        "The node could not prove its identity; do not trust this endpoint"
                    }
                    ErrorKind::Timeout => "Retry with a longer --timeout",
                    ErrorKind::Protocol => "The node sent an incomplete reply",
                    ErrorKind::Other => "Check the directory and key configuration",
                };
                ui::error_with_fix(&e.to_string(), fix);
                std::process::exit(1);
            }
        }
    });
}
