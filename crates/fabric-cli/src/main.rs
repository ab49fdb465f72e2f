//! Fabric CLI: run and poke at nodes of the Fabric overlay.

mod cli;
mod cmd;
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
        Commands::Start { listen, peers, id } => cmd::node::cmd_start(cli.config, listen, peers, id),
        Commands::Send {
            peer,
            kind,
            payload,
            wait_ms,
        } => cmd::node::cmd_send(&peer, &kind, &payload, wait_ms),
        Commands::Encode { kind, payload } => cmd::codec::cmd_encode(&kind, &payload),
        Commands::Decode { hex, unverified } => cmd::codec::cmd_decode(&hex, unverified),
    }
}
