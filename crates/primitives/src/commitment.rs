//! Chain position commitments.

use std::fmt;

use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};

use crate::buf::Buf32;

/// Reference to an L1 block by height and block id.
#[derive(
    Copy,
    Clone,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    Default,
    Debug,
    BorshSerialize,
    BorshDeserialize,
    Serialize,
    Deserialize,
)]
pub struct L1BlockCommitment {
    height: u64,
    blkid: Buf32,
}

impl L1BlockCommitment {
    pub fn new(height: u64, blkid: Buf32) -> Self {
        Self { height, blkid }
    }

    pub fn height(&self) -> u64 {
        self.height
    }

    pub fn blkid(&self) -> &Buf32 {
        &self.blkid
    }
}

impl fmt::Display for L1BlockCommitment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.height, self.blkid)
    }
}

/// Reference to an epoch by number and the last block height it covers.
#[derive(
    Copy,
    Clone,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    Default,
    Debug,
    BorshSerialize,
    BorshDeserialize,
    Serialize,
    Deserialize,
)]
pub struct EpochCommitment {
    epoch: u64,
    last_height: u64,
}

impl EpochCommitment {
    pub fn new(epoch: u64, last_height: u64) -> Self {
        Self { epoch, last_height }
    }

    /// Computes the epoch commitment covering a given height.
    pub fn containing_height(height: u64, blocks_per_epoch: u64) -> Self {
        let epoch = height / blocks_per_epoch;
        Self {
            epoch,
            last_height: (epoch + 1) * blocks_per_epoch - 1,
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Last block height covered by this epoch, inclusive.
    pub fn last_height(&self) -> u64 {
        self.last_height
    }

    /// First block height covered by this epoch.
    pub fn first_height(&self, blocks_per_epoch: u64) -> u64 {
        self.last_height + 1 - blocks_per_epoch
    }
}

impl fmt::Display for EpochCommitment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "epoch {} (..={})", self.epoch, self.last_height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_epoch_containing_height() {
        let ec = EpochCommitment::containing_height(0, 5);
        assert_eq!(ec.epoch(), 0);
        assert_eq!(ec.last_height(), 4);
        assert_eq!(ec.first_height(5), 0);

        let ec = EpochCommitment::containing_height(4, 5);
        assert_eq!(ec.epoch(), 0);

        let ec = EpochCommitment::containing_height(5, 5);
        assert_eq!(ec.epoch(), 1);
        assert_eq!(ec.last_height(), 9);
        assert_eq!(ec.first_height(5), 5);
    }
}
