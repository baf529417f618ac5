//! Neuron CLI — run a node or send requests to one.

mod cli;
mod cmd;
mod config;
mod ui;

use crate::cli::*;
use clap::Parser;

fn init_tracing_stderr() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_tracing_stderr();

    match cli.command {
        Commands::Init => cmd::init::cmd_init(cli.config),
        Commands::Keygen => cmd::init::cmd_keygen(),
        Commands::Discover { json } => cmd::network::cmd_discover(cli.config, json),
        Commands::Serve { listen } => cmd::network::cmd_serve(cli.config, listen),
        Commands::Request {
            peer,
            data,
            timeout,
        } => cmd::network::cmd_request(cli.config, &peer, &data, timeout),
    }
}
