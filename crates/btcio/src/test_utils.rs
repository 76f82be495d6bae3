//! Deterministic L1 client for tests.

use std::collections::HashMap;

use async_trait::async_trait;
use opnet_primitives::{sha256, Buf32};
use parking_lot::Mutex;

use crate::{L1Client, L1ClientError, RawHeaderInfo};

/// Serves a synthetic chain of `length` blocks with deterministic hashes.
/// Hash of height `h` is `sha256("block:{seed}:{h}")`, so independent
/// instances with the same seed agree.
#[derive(Debug)]
pub struct TestL1Client {
    headers: HashMap<Buf32, RawHeaderInfo>,
    hashes: Vec<Buf32>,
    /// Heights for which `get_block_hashes` reports `None`, simulating an
    /// RPC node that has not caught up.
    holes: Mutex<Vec<u64>>,
}

impl TestL1Client {
    pub fn new(seed: u64, length: u64) -> Self {
        let mut headers = HashMap::new();
        let mut hashes = Vec::with_capacity(length as usize);
        let mut prev: Option<Buf32> = None;

        for height in 0..length {
            let hash = block_hash(seed, height);
            let info = RawHeaderInfo {
                height,
                hash,
                prev_blockhash: prev,
                merkle_root: sha256(format!("merkle:{seed}:{height}").as_bytes()),
                time: 1_700_000_000 + height as u32 * 600,
                median_time: 1_700_000_000 + height as u32 * 600,
                bits: 0x1d00ffff,
                nonce: height as u32,
                version: 2,
                tx_count: 1,
            };
            headers.insert(hash, info);
            hashes.push(hash);
            prev = Some(hash);
        }

        Self {
            headers,
            hashes,
            holes: Mutex::new(Vec::new()),
        }
    }

    pub fn punch_hole(&self, height: u64) {
        self.holes.lock().push(height);
    }
}

/// Deterministic hash for a synthetic block.
pub fn block_hash(seed: u64, height: u64) -> Buf32 {
    sha256(format!("block:{seed}:{height}").as_bytes())
}

#[async_trait]
impl L1Client for TestL1Client {
    async fn get_block_hashes(
        &self,
        start: u64,
        count: u64,
    ) -> Result<Vec<Option<Buf32>>, L1ClientError> {
        let holes = self.holes.lock();
        Ok((start..start + count)
            .map(|h| {
                if holes.contains(&h) {
                    None
                } else {
                    self.hashes.get(h as usize).copied()
                }
            })
            .collect())
    }

    async fn get_block_header(&self, hash: Buf32) -> Result<RawHeaderInfo, L1ClientError> {
        self.headers
            .get(&hash)
            .cloned()
            .ok_or(L1ClientError::UnknownBlock(hash))
    }

    async fn get_chain_height(&self) -> Result<u64, L1ClientError> {
        Ok(self.hashes.len().saturating_sub(1) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_chain_links_up() {
        let client = TestL1Client::new(1, 4);
        let hashes = client.get_block_hashes(0, 4).await.unwrap();
        assert_eq!(hashes.len(), 4);

        let h1 = client.get_block_header(hashes[1].unwrap()).await.unwrap();
        assert_eq!(h1.prev_blockhash, Some(hashes[0].unwrap()));
        assert_eq!(client.get_chain_height().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_holes_surface_as_none() {
        let client = TestL1Client::new(1, 4);
        client.punch_hole(2);
        let hashes = client.get_block_hashes(0, 4).await.unwrap();
        assert!(hashes[2].is_none());
        assert!(hashes[3].is_some());
    }
}
