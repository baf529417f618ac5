//! Node configuration — `~/.neuron/config.toml`.
//!
//! The file is created with defaults on first use. Identity properties
//! (the node's fixed name and RSA key pair) are generated once and then
//! persisted, so a node keeps its identity across restarts.

use neuron_wire::{EngineConfig, NodeKeys, WireError, DEFAULT_DISCOVERY_URL};

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::info;

/// Alphabet for generated name suffixes.
const NAME_KEY_ALPHABET: &[u8] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-_";

/// Length of the random suffix in a generated fixed name.
const NAME_KEY_LENGTH: usize = 16;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("No configuration file found at {0}, please create one")]
    NotFound(PathBuf),
    #[error("Couldn't access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Couldn't parse configuration file {path}; ensure that format is correct: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("Couldn't serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("Node has no key pair; run `neuron init` first")]
    MissingKeys,
    #[error("Invalid key material: {0}")]
    Keys(#[from] WireError),
    #[error("Invalid address `{addr}` for peer `{peer}`")]
    PeerAddress { peer: String, addr: String },
}

/// This node's RSA key pair, base64 DER.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeysConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private: Option<String>,
}

/// Top-level node configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NeuronConfig {
    /// Stable node name, also used as the node ID on the network.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fixed_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_operator: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_identifier: Option<String>,
    /// Where to fetch the node directory from.
    pub discovery_url: String,
    /// TCP address `neuron serve` listens on.
    pub listen_addr: SocketAddr,
    /// Bound on each reply await, in seconds.
    pub reply_timeout_secs: u64,
    pub keys: KeysConfig,
    /// TCP address book: node ID to `host:port`.
    pub peers: BTreeMap<String, String>,
}

impl Default for NeuronConfig {
    fn default() -> Self {
        Self {
            fixed_name: None,
            node_operator: None,
            node_identifier: None,
            discovery_url: DEFAULT_DISCOVERY_URL.to_string(),
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 4100)),
            reply_timeout_secs: 30,
            keys: KeysConfig::default(),
            peers: BTreeMap::new(),
        }
    }
}

/// What [`NeuronConfig::generate_properties`] filled in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GeneratedProperties {
    pub fixed_name: bool,
    pub keys: bool,
}

impl GeneratedProperties {
    pub fn any(&self) -> bool {
        self.fixed_name || self.keys
    }
}

/// `~/.neuron/config.toml`.
pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".neuron")
        .join("config.toml")
}

/// Write a default configuration file, creating parent directories.
pub fn create(path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| ConfigError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    write(path, &NeuronConfig::default())?;
    info!(path = %path.display(), "Configuration created");
    Ok(())
}

/// Load an existing configuration file.
pub fn load(path: &Path) -> Result<NeuronConfig, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let config = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    info!(path = %path.display(), "Configuration loaded");
    Ok(config)
}

/// Create the file if missing, then load it.
pub fn init(path: &Path) -> Result<NeuronConfig, ConfigError> {
    if !path.exists() {
        create(path)?;
    }
    load(path)
}

fn write(path: &Path, config: &NeuronConfig) -> Result<(), ConfigError> {
    let contents = toml::to_string_pretty(config)?;
    std::fs::write(path, contents).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Random name suffix drawn from [`NAME_KEY_ALPHABET`].
fn generate_key(length: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..length)
        .map(|_| NAME_KEY_ALPHABET[rng.gen_range(0..NAME_KEY_ALPHABET.len())] as char)
        .collect()
}

impl NeuronConfig {
    /// Overwrite an existing configuration file.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        write(path, self)?;
        info!(path = %path.display(), "Configuration saved");
        Ok(())
    }

    /// Fill in a fixed name and key pair where missing, then save.
    pub fn generate_properties(&mut self, path: &Path) -> Result<GeneratedProperties, ConfigError> {
        let mut generated = GeneratedProperties::default();

        if self.fixed_name.as_deref().map_or(true, str::is_empty) {
            let name = format!(
                "neuron_{}_{}_{}",
                self.node_operator.as_deref().unwrap_or("liveg"),
                self.node_identifier.as_deref().unwrap_or("xx-test1"),
                generate_key(NAME_KEY_LENGTH)
            );
            info!(name = %name, "Generated node fixed name");
            self.fixed_name = Some(name);
            generated.fixed_name = true;
        }

        if self.keys.public.is_none() || self.keys.private.is_none() {
            let keys = NodeKeys::generate()?;
            self.keys = KeysConfig {
                public: Some(keys.public_key().to_base64().to_string()),
                private: Some(keys.private_key_base64()?),
            };
            info!("Generated public and private keys");
            generated.keys = true;
        }

        self.save(path)?;
        Ok(generated)
    }

    /// Node ID on the network: the fixed name, or a random one.
    pub fn node_id(&self) -> String {
        match self.fixed_name.as_deref() {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => uuid::Uuid::new_v4().to_string(),
        }
    }

    /// This node's key pair.
    pub fn node_keys(&self) -> Result<NodeKeys, ConfigError> {
        let private = self.keys.private.as_deref().ok_or(ConfigError::MissingKeys)?;
        Ok(NodeKeys::from_base64(private)?)
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            node_id: self.node_id(),
            reply_timeout: Duration::from_secs(self.reply_timeout_secs),
            ..Default::default()
        }
    }

    /// Resolve the `[peers]` address book.
    pub fn peer_addresses(&self) -> Result<HashMap<String, SocketAddr>, ConfigError> {
        self.peers
            .iter()
            .map(|(peer, addr)| {
                let resolved = addr
                    .to_socket_addrs()
                    .ok()
                    .and_then(|mut addrs| addrs.next())
                    .ok_or_else(|| ConfigError::PeerAddress {
                        peer: peer.clone(),
                        addr: addr.clone(),
                    })?;
                Ok((peer.clone(), resolved))
            })
            .collect()
    }
}
