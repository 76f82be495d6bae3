//! Mempool transaction relay with process-wide de-duplication.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use opnet_primitives::Buf32;
use parking_lot::Mutex;
use tracing::debug;

/// How often the known-id set is cleared.
pub const KNOWN_IDS_CLEAR_INTERVAL: Duration = Duration::from_secs(10);

/// External transaction verifier seam. Returns the computed transaction id
/// when the raw bytes verify, `None` otherwise.
#[async_trait]
pub trait TxVerifier: Send + Sync {
    async fn verify(&self, raw: &[u8]) -> Option<Buf32>;
}

/// De-duplicates mempool identifiers so the same transaction is not
/// re-broadcast within the clear window.
#[derive(Debug, Default)]
pub struct MempoolRelay {
    known: Mutex<HashSet<Buf32>>,
}

impl MempoolRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks an id as seen. Returns `false` if it was already known.
    pub fn mark_known(&self, id: Buf32) -> bool {
        self.known.lock().insert(id)
    }

    pub fn is_known(&self, id: &Buf32) -> bool {
        self.known.lock().contains(id)
    }

    /// Cleared on a fixed cadence by the owning loop.
    pub fn clear(&self) {
        let mut known = self.known.lock();
        debug!(count = known.len(), "clearing known mempool ids");
        known.clear();
    }

    pub fn len(&self) -> usize {
        self.known.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.known.lock().is_empty()
    }

    /// Full inbound path: drop known ids, verify the raw transaction, and
    /// only accept when the verifier's computed id matches the advertised
    /// one. Returns the id to re-broadcast.
    pub async fn process_inbound(
        &self,
        verifier: &dyn TxVerifier,
        id: Buf32,
        raw: &[u8],
    ) -> Option<Buf32> {
        if self.is_known(&id) {
            return None;
        }

        let computed = verifier.verify(raw).await?;
        if computed != id {
            debug!(advertised = %id, %computed, "mempool tx id mismatch");
            return None;
        }

        // Whoever wins the mark owns the rebroadcast.
        self.mark_known(id).then_some(id)
    }
}

#[cfg(test)]
mod tests {
    use opnet_primitives::sha256;

    use super::*;

    /// Computes ids as sha256 of the raw bytes; rejects empty payloads.
    struct HashVerifier;

    #[async_trait]
    impl TxVerifier for HashVerifier {
        async fn verify(&self, raw: &[u8]) -> Option<Buf32> {
            (!raw.is_empty()).then(|| sha256(raw))
        }
    }

    #[tokio::test]
    async fn test_accepts_then_dedups() {
        let relay = MempoolRelay::new();
        let raw = b"tx-bytes";
        let id = sha256(raw);

        assert_eq!(relay.process_inbound(&HashVerifier, id, raw).await, Some(id));
        // Re-broadcast of the same id within the window: no-op.
        assert_eq!(relay.process_inbound(&HashVerifier, id, raw).await, None);
        assert_eq!(relay.len(), 1);
    }

    #[tokio::test]
    async fn test_id_mismatch_rejected() {
        let relay = MempoolRelay::new();
        let wrong_id = sha256(b"other");
        assert_eq!(
            relay.process_inbound(&HashVerifier, wrong_id, b"tx-bytes").await,
            None
        );
        assert!(relay.is_empty());
    }

    #[tokio::test]
    async fn test_failed_verification_rejected() {
        let relay = MempoolRelay::new();
        assert_eq!(
            relay.process_inbound(&HashVerifier, Buf32::zero(), b"").await,
            None
        );
    }

    #[tokio::test]
    async fn test_clear_forgets_ids() {
        let relay = MempoolRelay::new();
        let raw = b"tx";
        let id = sha256(raw);
        relay.process_inbound(&HashVerifier, id, raw).await.unwrap();

        relay.clear();
        assert!(relay.is_empty());
        assert_eq!(relay.process_inbound(&HashVerifier, id, raw).await, Some(id));
    }
}
