//! Init and key generation.

use crate::cmd::config_path;
use crate::config;
use crate::ui;
use neuron_wire::NodeKeys;
use std::path::PathBuf;

pub fn cmd_init(config: Option<PathBuf>) {
    let path = config_path(config);

    let mut cfg = config::init(&path).unwrap_or_else(|e| {
        ui::error_with_fix(
            &e.to_string(),
            &format!("Check permissions on {}", path.display()),
        );
        std::process::exit(1);
    });

    ui::step("Generating node properties (this may take a moment)");
    let generated = cfg.generate_properties(&path).unwrap_or_else(|e| {
        ui::error(&format!("Failed to generate node properties: {e}"));
        std::process::exit(1);
    });

    ui::blank();
    if generated.any() {
        ui::success("Neuron initialized");
    } else {
        ui::success("Configuration is already complete");
    }
    ui::kv("Config", &path.display().to_string());
    ui::kv("Node name", cfg.fixed_name.as_deref().unwrap_or("-"));
    if generated.keys {
        ui::kv_ok("Keys", "generated");
    } else {
        ui::kv("Keys", "kept");
    }
    ui::blank();
    ui::next_steps(&[
        "List nodes:      neuron discover",
        "Start serving:   neuron serve",
    ]);
}

pub fn cmd_keygen() {
    let keys = NodeKeys::generate().unwrap_or_else(|e| {
        ui::error(&e.to_string());
        std::process::exit(1);
    });
    let private = keys.private_key_base64().unwrap_or_else(|e| {
        ui::error(&e.to_string());
        std::process::exit(1);
    });

    ui::section("Key pair");
    ui::kv("Public", keys.public_key().to_base64());
    ui::kv("Private", &private);
    ui::blank();
    ui::hint("Store these under [keys] in the config to use them as this node's identity");
}
