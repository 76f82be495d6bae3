//! Convenience re-exports.

pub use crate::{
    buf::Buf32,
    commitment::{EpochCommitment, L1BlockCommitment},
    constants::*,
    hash::{hash_pair, sha256, sha256d},
    params::{NetworkId, Params},
};
