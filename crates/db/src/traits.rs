//! Database interface consumed by the node. Implementations must be safe
//! to share across tasks.

use async_trait::async_trait;
use opnet_primitives::{Buf32, L1BlockCommitment};

use crate::{
    errors::DbError,
    types::{
        ChecksumUpdate, ContractRecord, EpochRecord, HeaderRecord, IbdProgress,
        TransactionRecord, UtxoRecord, WitnessRecord,
    },
};

/// Block header persistence.
#[cfg_attr(feature = "test-utils", mockall::automock)]
#[async_trait]
pub trait HeaderDatabase: Send + Sync {
    /// Headers for heights in `[start, end]`, ascending. Missing heights
    /// are skipped, not errors.
    async fn header_range(&self, start: u64, end: u64) -> Result<Vec<HeaderRecord>, DbError>;

    async fn header_at(&self, height: u64) -> Result<Option<HeaderRecord>, DbError>;

    async fn header_by_hash(&self, hash: Buf32) -> Result<Option<HeaderRecord>, DbError>;

    /// Inserts or replaces a batch of headers.
    async fn put_headers(&self, headers: Vec<HeaderRecord>) -> Result<(), DbError>;

    /// Applies checksum backfills as one batched write. Every referenced
    /// height must exist.
    async fn apply_checksum_updates(&self, updates: Vec<ChecksumUpdate>) -> Result<(), DbError>;

    /// Highest stored header, if any.
    async fn chain_tip(&self) -> Result<Option<L1BlockCommitment>, DbError>;

    /// Deletes every header with height strictly greater than `height`.
    /// Used by reorg rewind.
    async fn rewind_to(&self, height: u64) -> Result<(), DbError>;
}

/// Block witness persistence.
#[cfg_attr(feature = "test-utils", mockall::automock)]
#[async_trait]
pub trait WitnessDatabase: Send + Sync {
    /// Inserts a witness unless one with the same `(block_number,
    /// identity)` already exists. Returns whether it was inserted.
    async fn insert_witness(&self, witness: WitnessRecord) -> Result<bool, DbError>;

    async fn witnesses_at(&self, block_number: u64) -> Result<Vec<WitnessRecord>, DbError>;

    /// Number of distinct trusted identities attested for a block.
    async fn trusted_identity_count(&self, block_number: u64) -> Result<usize, DbError>;
}

/// Epoch persistence.
#[cfg_attr(feature = "test-utils", mockall::automock)]
#[async_trait]
pub trait EpochDatabase: Send + Sync {
    async fn put_epoch(&self, epoch: EpochRecord) -> Result<(), DbError>;

    async fn epoch(&self, number: u64) -> Result<Option<EpochRecord>, DbError>;

    async fn latest_finalized_epoch(&self) -> Result<Option<EpochRecord>, DbError>;
}

/// IBD checkpoint persistence.
#[cfg_attr(feature = "test-utils", mockall::automock)]
#[async_trait]
pub trait ProgressDatabase: Send + Sync {
    async fn load_progress(&self) -> Result<Option<IbdProgress>, DbError>;

    async fn store_progress(&self, progress: IbdProgress) -> Result<(), DbError>;
}

/// Transaction lookups consumed by the plugin blockchain API.
#[cfg_attr(feature = "test-utils", mockall::automock)]
#[async_trait]
pub trait TransactionDatabase: Send + Sync {
    async fn transaction(&self, txid: Buf32) -> Result<Option<TransactionRecord>, DbError>;

    async fn transactions_by_block(
        &self,
        block_height: u64,
    ) -> Result<Vec<TransactionRecord>, DbError>;

    async fn put_transactions(&self, txs: Vec<TransactionRecord>) -> Result<(), DbError>;
}

/// Contract and UTXO lookups consumed by the plugin blockchain API.
#[cfg_attr(feature = "test-utils", mockall::automock)]
#[async_trait]
pub trait ContractDatabase: Send + Sync {
    async fn contract(&self, address: Buf32) -> Result<Option<ContractRecord>, DbError>;

    async fn contract_storage(
        &self,
        address: Buf32,
        pointer: Buf32,
    ) -> Result<Option<Buf32>, DbError>;

    async fn utxos_by_script(&self, script_pubkey: Vec<u8>) -> Result<Vec<UtxoRecord>, DbError>;
}

/// The full database bundle the node is wired with.
pub trait NodeDatabase:
    HeaderDatabase
    + WitnessDatabase
    + EpochDatabase
    + ProgressDatabase
    + TransactionDatabase
    + ContractDatabase
{
}

impl<T> NodeDatabase for T where
    T: HeaderDatabase
        + WitnessDatabase
        + EpochDatabase
        + ProgressDatabase
        + TransactionDatabase
        + ContractDatabase
{
}
