//! Hashing helpers over sha2.

use sha2::{Digest, Sha256};

use crate::buf::Buf32;

/// Computes a single SHA-256 over the input.
pub fn sha256(data: &[u8]) -> Buf32 {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let out: [u8; 32] = hasher.finalize().into();
    Buf32::new(out)
}

/// Computes a double SHA-256, as Bitcoin does for block and tx ids.
pub fn sha256d(data: &[u8]) -> Buf32 {
    sha256(sha256(data).as_ref())
}

/// Hashes the concatenation of two 32-byte nodes.
pub fn hash_pair(left: &Buf32, right: &Buf32) -> Buf32 {
    let mut hasher = Sha256::new();
    hasher.update(left.as_ref());
    hasher.update(right.as_ref());
    let out: [u8; 32] = hasher.finalize().into();
    Buf32::new(out)
}
