//! Keyed receipt tree.
//!
//! During IBD (pre-OP_NET blocks) the tree carries exactly two synthetic
//! entries: the previous block checksum under the highest storage key, and
//! a version marker one key below it.

use opnet_primitives::{
    hash_pair, sha256, Buf32, RECEIPT_MARKER_ADDRESS, RECEIPT_MAX_KEY, RECEIPT_MAX_KEY_MINUS_ONE,
    RECEIPT_VERSION_MARKER, ZERO_CHECKSUM,
};
use sha2::{Digest, Sha256};

/// Merkle tree over `(address, key) -> value` entries. Entries are sorted
/// by `(address, key)` before hashing so insertion order is irrelevant.
/// Once frozen, the tree is immutable.
#[derive(Clone, Debug, Default)]
pub struct ReceiptTree {
    entries: Vec<(Buf32, Buf32, Vec<u8>)>,
    frozen_root: Option<Buf32>,
}

impl ReceiptTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an entry. Returns `false` (and ignores the entry) once the
    /// tree is frozen.
    pub fn insert(&mut self, address: Buf32, key: Buf32, value: Vec<u8>) -> bool {
        if self.frozen_root.is_some() {
            return false;
        }
        self.entries.push((address, key, value));
        true
    }

    /// Freezes the tree and returns the root. The root of an empty tree is
    /// the zero hash.
    pub fn freeze(&mut self) -> Buf32 {
        if let Some(root) = self.frozen_root {
            return root;
        }

        self.entries.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));
        let mut level: Vec<Buf32> = self
            .entries
            .iter()
            .map(|(addr, key, value)| leaf_hash(addr, key, value))
            .collect();

        let root = if level.is_empty() {
            ZERO_CHECKSUM
        } else {
            while level.len() > 1 {
                level = level
                    .chunks(2)
                    .map(|c| hash_pair(&c[0], c.get(1).unwrap_or(&c[0])))
                    .collect();
            }
            level[0]
        };

        self.frozen_root = Some(root);
        root
    }
}

fn leaf_hash(address: &Buf32, key: &Buf32, value: &[u8]) -> Buf32 {
    let mut hasher = Sha256::new();
    hasher.update(address.as_ref());
    hasher.update(key.as_ref());
    hasher.update(value);
    let out: [u8; 32] = hasher.finalize().into();
    Buf32::new(out)
}

/// Receipt root for an IBD block given its predecessor's checksum.
///
/// The checksum entry carries the 32 raw bytes of `prev_checksum`, except
/// at the chain start where the value is *empty* (zero length, not 32 zero
/// bytes). The version marker byte is load-bearing.
pub fn ibd_receipt_root(prev_checksum: &Buf32) -> Buf32 {
    let checksum_value = if prev_checksum.is_zero() {
        Vec::new()
    } else {
        prev_checksum.as_ref().to_vec()
    };

    let mut tree = ReceiptTree::new();
    tree.insert(RECEIPT_MARKER_ADDRESS, RECEIPT_MAX_KEY, checksum_value);
    tree.insert(
        RECEIPT_MARKER_ADDRESS,
        RECEIPT_MAX_KEY_MINUS_ONE,
        vec![RECEIPT_VERSION_MARKER],
    );
    tree.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_order_irrelevant() {
        let a1 = Buf32::new([1; 32]);
        let a2 = Buf32::new([2; 32]);
        let k = Buf32::new([9; 32]);

        let mut t1 = ReceiptTree::new();
        t1.insert(a1, k, vec![1]);
        t1.insert(a2, k, vec![2]);

        let mut t2 = ReceiptTree::new();
        t2.insert(a2, k, vec![2]);
        t2.insert(a1, k, vec![1]);

        assert_eq!(t1.freeze(), t2.freeze());
    }

    #[test]
    fn test_frozen_rejects_inserts() {
        let mut tree = ReceiptTree::new();
        tree.insert(Buf32::zero(), Buf32::zero(), vec![]);
        let root = tree.freeze();
        assert!(!tree.insert(Buf32::new([1; 32]), Buf32::zero(), vec![1]));
        assert_eq!(tree.freeze(), root);
    }

    #[test]
    fn test_empty_tree_root_is_zero() {
        assert_eq!(ReceiptTree::new().freeze(), ZERO_CHECKSUM);
    }

    /// Pins the chain-start rule: a zero prev_checksum contributes an
    /// empty value, which is NOT the same tree as 32 zero bytes.
    #[test]
    fn test_zero_prev_checksum_uses_empty_value() {
        let genesis_root = ibd_receipt_root(&ZERO_CHECKSUM);

        let mut with_zero_bytes = ReceiptTree::new();
        with_zero_bytes.insert(RECEIPT_MARKER_ADDRESS, RECEIPT_MAX_KEY, vec![0u8; 32]);
        with_zero_bytes.insert(
            RECEIPT_MARKER_ADDRESS,
            RECEIPT_MAX_KEY_MINUS_ONE,
            vec![RECEIPT_VERSION_MARKER],
        );

        assert_ne!(genesis_root, with_zero_bytes.freeze());
    }

    /// Pins the version marker byte: bumping it changes the root.
    #[test]
    fn test_version_marker_is_load_bearing() {
        let prev = Buf32::new([5; 32]);
        let canonical = ibd_receipt_root(&prev);

        let mut bumped = ReceiptTree::new();
        bumped.insert(RECEIPT_MARKER_ADDRESS, RECEIPT_MAX_KEY, prev.as_ref().to_vec());
        bumped.insert(RECEIPT_MARKER_ADDRESS, RECEIPT_MAX_KEY_MINUS_ONE, vec![0x02]);

        assert_ne!(canonical, bumped.freeze());
    }

    #[test]
    fn test_distinct_prev_checksums_distinct_roots() {
        assert_ne!(
            ibd_receipt_root(&Buf32::new([1; 32])),
            ibd_receipt_root(&Buf32::new([2; 32]))
        );
    }
}
