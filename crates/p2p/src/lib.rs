//! OP_NET peer-to-peer layer: framed reusable streams, peer sessions with
//! authentication, the blacklist, block-witness gossip and mempool relay.

pub mod blacklist;
pub mod framed;
pub mod gossip;
pub mod manager;
pub mod mempool;
pub mod peer;
pub mod wire;

pub use blacklist::{Blacklist, BlacklistConfig, BlacklistKey};
pub use framed::{FramedStream, StreamConfig, StreamHandle};
pub use gossip::{InboundWitness, WitnessGossip};
pub use manager::{InboundStream, StreamKey, StreamManager, Transport};
pub use mempool::{MempoolRelay, TxVerifier};
pub use peer::{
    PeerAuthenticator, PeerEvent, PeerId, PeerInfo, PeerManager, PeerManagerConfig,
    PeerManagerHandle, PeerSnapshot,
};
pub use wire::{DisconnectReason, IdentifyInfo, IndexerMode, P2pMessage, ProtocolId};

use thiserror::Error;

/// Errors surfaced by the P2P layer.
#[derive(Debug, Error)]
pub enum P2pError {
    /// Outbound queue for a stream is full.
    #[error("outbound queue full for {0}")]
    QueueFull(String),

    /// The stream is closed.
    #[error("stream closed: {0}")]
    StreamClosed(String),

    /// Dialing a peer failed.
    #[error("dial failed: {0}")]
    DialFailed(String),

    /// Frame exceeds the per-message cap.
    #[error("message of {got} bytes exceeds cap {cap}")]
    Oversized { got: usize, cap: usize },

    /// Wire payload failed to decode.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// The peer is blacklisted.
    #[error("peer blacklisted")]
    Blacklisted,

    #[error("db: {0}")]
    Db(#[from] opnet_db::DbError),
}
