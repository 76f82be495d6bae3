//! Stored record types.

use borsh::{BorshDeserialize, BorshSerialize};
use opnet_primitives::{Buf32, L1BlockCommitment};
use serde::{Deserialize, Serialize};

/// Merkle inclusion proof for one leaf of a block's checksum tree.
#[derive(Clone, Eq, PartialEq, Debug, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct ChecksumProof {
    /// Leaf index within the checksum tree.
    pub position: u32,
    /// Sibling hashes from leaf to root.
    pub hashes: Vec<Buf32>,
}

/// A block header plus the OP_NET commitments backfilled by the checksum
/// engine.
///
/// Created by the header downloader with every checksum field unset.
/// Mutated exactly once by the checksum engine, then immutable except for
/// reorg rewinds which delete the record outright.
#[derive(Clone, Eq, PartialEq, Debug, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct HeaderRecord {
    pub height: u64,
    pub hash: Buf32,
    /// `None` only for the genesis block.
    pub prev_blockhash: Option<Buf32>,
    pub merkle_root: Buf32,
    pub time: u32,
    pub median_time: u32,
    pub bits: u32,
    pub nonce: u32,
    pub version: i32,
    pub tx_count: u32,

    // Backfilled by the checksum engine.
    pub checksum_root: Option<Buf32>,
    pub checksum_proofs: Vec<ChecksumProof>,
    pub prev_checksum: Option<Buf32>,
    pub storage_root: Option<Buf32>,
    pub receipt_root: Option<Buf32>,
    pub gas_used: u64,
    pub gas_limit: u64,
}

impl HeaderRecord {
    /// Creates a header record with no checksum data yet.
    #[allow(clippy::too_many_arguments, reason = "mirrors the header fields")]
    pub fn new(
        height: u64,
        hash: Buf32,
        prev_blockhash: Option<Buf32>,
        merkle_root: Buf32,
        time: u32,
        median_time: u32,
        bits: u32,
        nonce: u32,
        version: i32,
        tx_count: u32,
    ) -> Self {
        Self {
            height,
            hash,
            prev_blockhash,
            merkle_root,
            time,
            median_time,
            bits,
            nonce,
            version,
            tx_count,
            checksum_root: None,
            checksum_proofs: Vec::new(),
            prev_checksum: None,
            storage_root: None,
            receipt_root: None,
            gas_used: 0,
            gas_limit: 0,
        }
    }

    pub fn commitment(&self) -> L1BlockCommitment {
        L1BlockCommitment::new(self.height, self.hash)
    }

    pub fn has_checksum(&self) -> bool {
        self.checksum_root.is_some()
    }
}

/// Checksum fields for one height, applied as a single batched update.
#[derive(Clone, Eq, PartialEq, Debug, BorshSerialize, BorshDeserialize)]
pub struct ChecksumUpdate {
    pub height: u64,
    pub checksum_root: Buf32,
    pub checksum_proofs: Vec<ChecksumProof>,
    pub prev_checksum: Buf32,
    pub storage_root: Buf32,
    pub receipt_root: Buf32,
}

/// A signed attestation that a block's checksum root is valid.
#[derive(Clone, Eq, PartialEq, Debug, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct WitnessRecord {
    pub block_number: u64,
    pub signature: Vec<u8>,
    pub public_key: Vec<u8>,
    pub timestamp: u64,
    pub proofs: Option<Vec<Vec<u8>>>,
    /// Hash of the issuer's long-term key.
    pub identity: Buf32,
    pub trusted: bool,
}

/// Finalization unit covering `blocks_per_epoch` consecutive blocks.
#[derive(Clone, Eq, PartialEq, Debug, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct EpochRecord {
    pub epoch_number: u64,
    pub blocks_per_epoch: u64,
    /// Identities of the witnesses contributing to finalization.
    pub witness_identities: Vec<Buf32>,
    /// Aggregated commitment over the epoch's checksum roots.
    pub commitment: Buf32,
    pub finalized: bool,
}

impl EpochRecord {
    /// First block height covered, inclusive.
    pub fn start_height(&self) -> u64 {
        self.epoch_number * self.blocks_per_epoch
    }

    /// Last block height covered, inclusive.
    pub fn end_height(&self) -> u64 {
        (self.epoch_number + 1) * self.blocks_per_epoch - 1
    }
}

/// Phases of the initial block download pipeline, in execution order.
#[derive(
    Copy,
    Clone,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    Debug,
    BorshSerialize,
    BorshDeserialize,
    Serialize,
    Deserialize,
)]
pub enum IbdPhase {
    HeaderDownload,
    ChecksumGeneration,
    WitnessSync,
    EpochFinalization,
}

impl std::fmt::Display for IbdPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::HeaderDownload => "header_download",
            Self::ChecksumGeneration => "checksum_generation",
            Self::WitnessSync => "witness_sync",
            Self::EpochFinalization => "epoch_finalization",
        };
        f.write_str(s)
    }
}

/// Per-phase work counters carried in the progress record.
#[derive(
    Copy, Clone, Eq, PartialEq, Debug, Default, BorshSerialize, BorshDeserialize, Serialize,
    Deserialize,
)]
pub struct IbdCounters {
    pub headers_downloaded: u64,
    pub checksums_computed: u64,
    pub witnesses_synced: u64,
    pub epochs_finalized: u64,
}

/// Persisted IBD checkpoint. A restart resumes at `current_height` of the
/// recorded phase, never before it.
#[derive(
    Copy, Clone, Eq, PartialEq, Debug, BorshSerialize, BorshDeserialize, Serialize, Deserialize,
)]
pub struct IbdProgress {
    pub phase: IbdPhase,
    pub start_height: u64,
    pub current_height: u64,
    pub target_height: u64,
    pub counters: IbdCounters,
    /// Unix millis of the last persisted checkpoint.
    pub last_checkpoint_at: u64,
}

/// A transaction as stored for lookups; full script/witness data stays in
/// the raw bytes.
#[derive(Clone, Eq, PartialEq, Debug, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub txid: Buf32,
    pub block_height: u64,
    pub index_in_block: u32,
    pub raw: Vec<u8>,
}

/// An unspent (or spent-marked) transaction output.
#[derive(Clone, Eq, PartialEq, Debug, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct UtxoRecord {
    pub txid: Buf32,
    pub vout: u32,
    pub value: u64,
    pub script_pubkey: Vec<u8>,
    pub height: u64,
    pub spent: bool,
}

/// Deployed contract, as exposed to the plugin blockchain API.
#[derive(Clone, Eq, PartialEq, Debug, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct ContractRecord {
    pub address: Buf32,
    pub bytecode_hash: Buf32,
    pub deployed_height: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_epoch_bounds() {
        let epoch = EpochRecord {
            epoch_number: 3,
            blocks_per_epoch: 5,
            witness_identities: vec![],
            commitment: Buf32::zero(),
            finalized: false,
        };
        assert_eq!(epoch.start_height(), 15);
        assert_eq!(epoch.end_height(), 19);
    }

    #[test]
    fn test_new_header_has_no_checksum() {
        let h = HeaderRecord::new(
            7,
            Buf32::new([1; 32]),
            Some(Buf32::new([2; 32])),
            Buf32::new([3; 32]),
            0,
            0,
            0,
            0,
            2,
            1,
        );
        assert!(!h.has_checksum());
        assert_eq!(h.commitment().height(), 7);
    }
}
