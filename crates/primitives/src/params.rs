//! Chain-specific parameters, immutable for the lifetime of the node.

use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_BLOCKS_PER_EPOCH, DEFAULT_MIN_WITNESSES};

/// Bitcoin network the node follows.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkId {
    Mainnet,
    Testnet,
    Regtest,
}

impl std::fmt::Display for NetworkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Mainnet => "mainnet",
            Self::Testnet => "testnet",
            Self::Regtest => "regtest",
        };
        f.write_str(s)
    }
}

/// Consensus parameters. Shared as `Arc<Params>`; never mutated after
/// startup.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Params {
    network: NetworkId,
    chain_id: u64,
    blocks_per_epoch: u64,
    min_witnesses: usize,
    /// Minimum total trusted keys required for a valid authority set.
    min_trusted_keys: usize,
    /// Maximum keys drawn from a single trusted entity when selecting a
    /// validator subset.
    max_keys_per_entity: usize,
    /// Minimum number of distinct entities a validator subset must span.
    min_entities: usize,
    /// Trusted-authority key-set version in force.
    authority_version: u16,
    protocol_version_min: u16,
    protocol_version_max: u16,
}

impl Params {
    #[allow(clippy::too_many_arguments, reason = "plain constructor")]
    pub fn new(
        network: NetworkId,
        chain_id: u64,
        blocks_per_epoch: u64,
        min_witnesses: usize,
        min_trusted_keys: usize,
        max_keys_per_entity: usize,
        min_entities: usize,
        authority_version: u16,
    ) -> Self {
        Self {
            network,
            chain_id,
            blocks_per_epoch,
            min_witnesses,
            min_trusted_keys,
            max_keys_per_entity,
            min_entities,
            authority_version,
            protocol_version_min: 1,
            protocol_version_max: 1,
        }
    }

    /// Regtest parameters used by tests and local development.
    pub fn regtest() -> Self {
        Self::new(
            NetworkId::Regtest,
            0,
            DEFAULT_BLOCKS_PER_EPOCH,
            DEFAULT_MIN_WITNESSES,
            3,
            2,
            2,
            1,
        )
    }

    pub fn network(&self) -> NetworkId {
        self.network
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub fn blocks_per_epoch(&self) -> u64 {
        self.blocks_per_epoch
    }

    pub fn min_witnesses(&self) -> usize {
        self.min_witnesses
    }

    pub fn min_trusted_keys(&self) -> usize {
        self.min_trusted_keys
    }

    pub fn max_keys_per_entity(&self) -> usize {
        self.max_keys_per_entity
    }

    pub fn min_entities(&self) -> usize {
        self.min_entities
    }

    pub fn authority_version(&self) -> u16 {
        self.authority_version
    }

    pub fn protocol_version_min(&self) -> u16 {
        self.protocol_version_min
    }

    pub fn protocol_version_max(&self) -> u16 {
        self.protocol_version_max
    }
}
