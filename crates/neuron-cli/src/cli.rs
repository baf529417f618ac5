//! Clap CLI definitions for Neuron.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub const AFTER_HELP: &str = "\
\x1b[1;36mExamples:\x1b[0m
  neuron init                              Create config, node name and key pair
  neuron discover                          List nodes in the directory
  neuron serve                             Answer authenticated requests
  neuron request <node> '{\"op\":\"ping\"}'    Send one authenticated request

\x1b[1;36mQuick Start:\x1b[0m
  1. neuron init                Set up identity
  2. neuron serve               Start answering requests";

/// Neuron — authenticated request/response between network nodes.
#[derive(Parser)]
#[command(
    name = "neuron",
    version,
    about = "Neuron node tool",
    after_help = AFTER_HELP,
)]
pub struct Cli {
    /// Path to config file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize Neuron (create config and generate node identity).
    Init,
    /// Fetch the node directory and list known nodes and relays.
    Discover {
        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Listen for peers and answer their requests.
    Serve {
        /// Override the configured listen address.
        #[arg(long)]
        listen: Option<std::net::SocketAddr>,
    },
    /// Send one authenticated request to a node and print the response.
    Request {
        /// Node ID of the responder.
        peer: String,
        /// JSON payload (a bare word is sent as a string).
        data: String,
        /// Reply timeout in seconds.
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Generate and print a fresh key pair.
    Keygen,
}
