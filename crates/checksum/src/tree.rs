//! The six-leaf checksum merkle tree.

use opnet_db::ChecksumProof;
use opnet_primitives::{hash_pair, sha256, Buf32, ZERO_CHECKSUM};

/// Number of leaves in a block checksum tree.
pub const CHECKSUM_LEAF_COUNT: usize = 6;

/// The six committed values, in leaf order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChecksumLeaves {
    /// Previous block hash, or zero for genesis.
    pub prev_blockhash: Buf32,
    /// Previous block's checksum root, or zero at the chain start.
    pub prev_checksum: Buf32,
    pub blockhash: Buf32,
    pub merkle_root: Buf32,
    pub storage_root: Buf32,
    pub receipt_root: Buf32,
}

impl ChecksumLeaves {
    fn leaves(&self) -> [Buf32; CHECKSUM_LEAF_COUNT] {
        [
            self.prev_blockhash,
            self.prev_checksum,
            self.blockhash,
            self.merkle_root,
            self.storage_root,
            self.receipt_root,
        ]
    }
}

/// Computed tree: root plus one inclusion proof per leaf.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChecksumTree {
    root: Buf32,
    proofs: Vec<ChecksumProof>,
}

impl ChecksumTree {
    /// Builds the tree. Leaves are hashed before aggregation; an odd node
    /// at any level is paired with itself.
    pub fn compute(leaves: &ChecksumLeaves) -> Self {
        let raw = leaves.leaves();
        let mut level: Vec<Buf32> = raw.iter().map(|l| sha256(l.as_ref())).collect();

        // Sibling path per original leaf, updated level by level.
        let mut paths: Vec<Vec<Buf32>> = vec![Vec::new(); raw.len()];
        let mut positions: Vec<usize> = (0..raw.len()).collect();

        while level.len() > 1 {
            let mut next = Vec::with_capacity(level.len().div_ceil(2));
            for chunk in level.chunks(2) {
                let left = chunk[0];
                let right = *chunk.get(1).unwrap_or(&chunk[0]);
                next.push(hash_pair(&left, &right));
            }

            for (leaf, pos) in positions.iter_mut().enumerate() {
                let sibling_idx = *pos ^ 1;
                let sibling = *level.get(sibling_idx).unwrap_or(&level[*pos]);
                paths[leaf].push(sibling);
                *pos /= 2;
            }
            level = next;
        }

        let proofs = paths
            .into_iter()
            .enumerate()
            .map(|(i, hashes)| ChecksumProof {
                position: i as u32,
                hashes,
            })
            .collect();

        Self {
            root: level[0],
            proofs,
        }
    }

    pub fn root(&self) -> Buf32 {
        self.root
    }

    pub fn proofs(&self) -> &[ChecksumProof] {
        &self.proofs
    }

    pub fn into_parts(self) -> (Buf32, Vec<ChecksumProof>) {
        (self.root, self.proofs)
    }
}

/// Checks a leaf value against a root using its proof.
pub fn verify_proof(leaf: &Buf32, proof: &ChecksumProof, root: &Buf32) -> bool {
    let mut acc = sha256(leaf.as_ref());
    let mut pos = proof.position as usize;
    for sibling in &proof.hashes {
        acc = if pos % 2 == 0 {
            hash_pair(&acc, sibling)
        } else {
            hash_pair(sibling, &acc)
        };
        pos /= 2;
    }
    acc == *root
}

/// Leaf set for a block, zero-filling the previous block hash at genesis.
pub fn leaves_for_block(
    prev_blockhash: Option<Buf32>,
    prev_checksum: Buf32,
    blockhash: Buf32,
    merkle_root: Buf32,
    storage_root: Buf32,
    receipt_root: Buf32,
) -> ChecksumLeaves {
    ChecksumLeaves {
        prev_blockhash: prev_blockhash.unwrap_or(ZERO_CHECKSUM),
        prev_checksum,
        blockhash,
        merkle_root,
        storage_root,
        receipt_root,
    }
}
