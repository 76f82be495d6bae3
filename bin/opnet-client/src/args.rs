//! Command-line arguments.

use std::path::PathBuf;

use clap::Parser;

/// The OP_NET indexer and peer node.
#[derive(Debug, Parser)]
#[command(name = "opnet-client", version)]
pub(crate) struct Args {
    /// Path to the TOML configuration file.
    #[arg(long, short = 'c')]
    pub(crate) config: Option<PathBuf>,

    /// Override the RPC listen port.
    #[arg(long)]
    pub(crate) rpc_port: Option<u16>,

    /// Override the WebSocket listen port.
    #[arg(long)]
    pub(crate) ws_port: Option<u16>,

    /// Override the P2P listen port.
    #[arg(long)]
    pub(crate) p2p_port: Option<u16>,

    /// Reindex plugin state from this block height at startup.
    #[arg(long)]
    pub(crate) reindex_from_block: Option<u64>,
}
