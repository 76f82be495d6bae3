//! Trusted-authority key management.
//!
//! Witnesses and other authority-scoped artifacts are only as good as the
//! key set that signs them. This crate owns loading and validating those
//! sets, selecting constrained validator subsets, and verifying signatures
//! against the active set.

pub mod manager;
pub mod set;
pub mod shuffle;

pub use manager::{AcceptAllUpgrades, AuthorityManager, ConsensusUpgradePolicy, SignatureMatch};
pub use set::{AuthorityKeySet, TrustedEntity, TrustedKey};
pub use shuffle::secure_shuffle;

use thiserror::Error;

/// Signature verification seam. Concrete cryptography is provided by the
/// embedding binary.
pub trait SignatureVerifier: Send + Sync {
    /// Returns whether `signature` over `message` verifies under
    /// `public_key`.
    fn verify(&self, message: &[u8], signature: &[u8], public_key: &[u8]) -> bool;
}

/// Canonical byte string a block witness signs: the little-endian block
/// number followed by the 32-byte checksum root.
pub fn witness_message(block_number: u64, checksum_root: &opnet_primitives::Buf32) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + 32);
    out.extend_from_slice(&block_number.to_le_bytes());
    out.extend_from_slice(checksum_root.as_ref());
    out
}

/// Errors from authority-set handling.
#[derive(Debug, Error)]
pub enum AuthorityError {
    /// A key triple failed its self-signature check.
    #[error("invalid self-signature for entity {0}")]
    InvalidSelfSignature(String),

    /// The same long-term key appears under two entities.
    #[error("duplicate long-term key across entities")]
    DuplicateKey,

    /// Fewer valid keys than the consensus minimum.
    #[error("key set too small: {got} < {min}")]
    TooFewKeys { got: usize, min: usize },

    /// Constraint selection cannot satisfy the minima.
    #[error("cannot satisfy validator constraints: {0}")]
    ConstraintsUnsatisfiable(String),

    /// No key set loaded for the requested version.
    #[error("no key set for authority version {0}")]
    UnknownVersion(u16),

    /// The upgrade policy refused the new consensus version.
    #[error("consensus upgrade to version {0} refused")]
    UpgradeRefused(u16),
}
