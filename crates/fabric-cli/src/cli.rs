//! Clap CLI definitions for Fabric.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub const AFTER_HELP: &str = "\
\x1b[1;36mExamples:\x1b[0m
  fabric start                              Run a node with ~/.fabric/config.toml
  fabric start --listen 0.0.0.0:7000 \\
      --peer 10.0.0.2:7777                   Run a node and join a seed
  fabric send --peer 10.0.0.2:7777 --type PeerMessage '{\"type\":\"chat\"}'
  fabric encode 'Hello, world!'             Print a Generic frame as hex
  fabric decode <hex>                       Inspect a frame";

/// Fabric: peer-to-peer overlay speaking the AMP wire protocol.
#[derive(Parser)]
#[command(
    name = "fabric",
    version,
    about = "Fabric peer-to-peer overlay node",
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
    /// Run a swarm node until Ctrl+C.
    Start {
        /// Listen address (overrides config).
        #[arg(long)]
        listen: Option<String>,
        /// Seed peer address; repeatable.
        #[arg(long = "peer")]
        peers: Vec<String>,
        /// Fixed node id (random if unset).
        #[arg(long)]
        id: Option<String>,
    },
    /// Connect to a peer, send one message, and print what comes back.
    Send {
        /// Peer address (host:port).
        #[arg(long)]
        peer: String,
        /// Message type name.
        #[arg(long = "type", default_value = "Generic")]
        kind: String,
        /// Payload (UTF-8 text).
        payload: String,
        /// How long to wait for replies, in milliseconds.
        #[arg(long, default_value_t = 1000)]
        wait_ms: u64,
    },
    /// Encode a message and print the frame as hex.
    Encode {
        /// Message type name.
        #[arg(long = "type", default_value = "Generic")]
        kind: String,
        /// Payload (UTF-8 text).
        payload: String,
    },
    /// Decode a hex frame and print its fields.
    Decode {
        /// Frame bytes as hex.
        hex: String,
        /// Skip the payload hash check.
        #[arg(long)]
        unverified: bool,
    },
}
