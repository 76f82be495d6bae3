//! Interface to the external Bitcoin RPC node.
//!
//! The concrete JSON-RPC client lives outside this workspace; the node is
//! written against [`L1Client`] so tests can drive the sync pipeline with
//! the deterministic [`test_utils::TestL1Client`].

pub mod test_utils;

use async_trait::async_trait;
use opnet_primitives::Buf32;
use thiserror::Error;

/// Raw header fields as the RPC node reports them, before any OP_NET
/// processing.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct RawHeaderInfo {
    pub height: u64,
    pub hash: Buf32,
    pub prev_blockhash: Option<Buf32>,
    pub merkle_root: Buf32,
    pub time: u32,
    pub median_time: u32,
    pub bits: u32,
    pub nonce: u32,
    pub version: i32,
    pub tx_count: u32,
}

/// Errors from the L1 RPC surface.
#[derive(Debug, Error)]
pub enum L1ClientError {
    /// The node does not know the requested hash.
    #[error("unknown block hash {0}")]
    UnknownBlock(Buf32),

    /// Transport-level failure, retryable.
    #[error("rpc transport error: {0}")]
    Transport(String),

    /// The node returned something structurally invalid.
    #[error("malformed rpc response: {0}")]
    Malformed(String),
}

/// Minimal view of the Bitcoin RPC node the indexer needs.
#[cfg_attr(feature = "test-utils", mockall::automock)]
#[async_trait]
pub trait L1Client: Send + Sync {
    /// Block hashes for heights `start..start + count`. A `None` entry
    /// means the node has no block at that height yet.
    async fn get_block_hashes(
        &self,
        start: u64,
        count: u64,
    ) -> Result<Vec<Option<Buf32>>, L1ClientError>;

    async fn get_block_header(&self, hash: Buf32) -> Result<RawHeaderInfo, L1ClientError>;

    /// Current best height the RPC node knows.
    async fn get_chain_height(&self) -> Result<u64, L1ClientError>;
}
