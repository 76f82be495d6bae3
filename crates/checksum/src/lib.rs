//! Per-block OP_NET checksum commitments.
//!
//! Every block's checksum root chains over its predecessor's, so the whole
//! history collapses into one 32-byte value at the tip. The engine here
//! recomputes that chain during IBD; the merkle trees are shared with the
//! steady-state indexer.

pub mod engine;
pub mod receipt;
pub mod tree;

pub use engine::{
    ChecksumEngine, ChecksumOutcome, CheckpointHook, NoCheckpoint, DB_WRITE_BATCH, PRELOAD_BATCH,
};
pub use receipt::{ibd_receipt_root, ReceiptTree};
pub use tree::{verify_proof, ChecksumLeaves, ChecksumTree};

use opnet_db::DbError;
use thiserror::Error;

/// Errors fatal to a checksum computation.
#[derive(Debug, Error)]
pub enum ChecksumError {
    /// A header the range needs is not in the store.
    #[error("missing header at height {0}")]
    MissingHeader(u64),

    /// Stored checksum data is structurally invalid.
    #[error("corrupt checksum data at height {0}: {1}")]
    Corrupt(u64, String),

    #[error("db: {0}")]
    Db(#[from] DbError),
}
