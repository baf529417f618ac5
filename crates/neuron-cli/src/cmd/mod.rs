//! Command implementations.

pub mod init;
pub mod network;

use crate::config::{self, NeuronConfig};
use crate::ui;
use std::path::{Path, PathBuf};

/// Resolve `--config` against the default location.
pub fn config_path(config: Option<PathBuf>) -> PathBuf {
    config.unwrap_or_else(config::default_config_path)
}

/// Load the config or exit with a hint to run `neuron init`.
pub fn load_config_or_exit(path: &Path) -> NeuronConfig {
    match config::load(path) {
        Ok(config) => config,
        Err(e) => {
            ui::error_with_fix(&e.to_string(), "Run `neuron init` to create a configuration");
            std::process::exit(1);
        }
    }
}

/// Build a Tokio runtime or exit.
pub fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Runtime::new().unwrap_or_else(|e| {
        ui::error(&format!("Failed to start async runtime: {e}"));
        std::process::exit(1);
    })
}
