//! Sequential checksum chain computation over a stored header range.

use std::{collections::VecDeque, sync::Arc};

use async_trait::async_trait;
use opnet_db::{ChecksumUpdate, HeaderDatabase, HeaderRecord};
use opnet_primitives::{Buf32, EMPTY_STORAGE_ROOT, ZERO_CHECKSUM};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    receipt::ibd_receipt_root,
    tree::{leaves_for_block, ChecksumTree},
    ChecksumError,
};

/// Headers fetched from the store per preload range query.
pub const PRELOAD_BATCH: u64 = 1000;

/// Buffered checksum updates flushed as one batched write.
pub const DB_WRITE_BATCH: usize = 500;

/// Checkpoint policy callback, implemented by the IBD progress tracker.
/// `save` is only invoked after buffered updates have been flushed, so a
/// persisted checkpoint never runs ahead of completed work.
#[async_trait]
pub trait CheckpointHook: Send + Sync {
    fn should_save(&self, height: u64) -> bool;

    async fn save(&self, height: u64) -> Result<(), ChecksumError>;
}

/// No-op hook for callers that manage checkpoints themselves.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCheckpoint;

#[async_trait]
impl CheckpointHook for NoCheckpoint {
    fn should_save(&self, _height: u64) -> bool {
        false
    }

    async fn save(&self, _height: u64) -> Result<(), ChecksumError> {
        Ok(())
    }
}

/// Outcome of a range computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumOutcome {
    /// Whole range processed; carries the final checksum root.
    Completed { tip_checksum: Buf32 },
    /// Cancelled mid-range. Buffered updates were discarded; the last
    /// persisted checkpoint is the resume point.
    Aborted { next_height: u64 },
}

/// Drives the strictly-sequential checksum chain over `[start, target)`.
#[derive(Debug)]
pub struct ChecksumEngine<D> {
    db: Arc<D>,
}

impl<D: HeaderDatabase> ChecksumEngine<D> {
    pub fn new(db: Arc<D>) -> Self {
        Self { db }
    }

    /// Seeds the chain for a computation starting at `start`: the stored
    /// checksum of `start - 1`, or the zero checksum when absent.
    async fn seed(&self, start: u64) -> Result<Buf32, ChecksumError> {
        if start == 0 {
            return Ok(ZERO_CHECKSUM);
        }
        match self.db.header_at(start - 1).await? {
            Some(h) => Ok(h.checksum_root.unwrap_or(ZERO_CHECKSUM)),
            None => Ok(ZERO_CHECKSUM),
        }
    }

    /// Computes and persists checksums for every height in `[start,
    /// target)`, ascending. Resumable: recomputation from any checkpoint
    /// is byte-identical because every input is already persisted.
    pub async fn compute_range(
        &self,
        start: u64,
        target: u64,
        cancel: &CancellationToken,
        hook: &dyn CheckpointHook,
    ) -> Result<ChecksumOutcome, ChecksumError> {
        let mut prev_checksum = self.seed(start).await?;
        let mut preload: VecDeque<HeaderRecord> = VecDeque::new();
        let mut pending: Vec<ChecksumUpdate> = Vec::with_capacity(DB_WRITE_BATCH);

        info!(start, target, "computing checksum chain");

        for height in start..target {
            // Cancellation may not corrupt the checkpoint: pending work is
            // simply dropped and re-derived on resume.
            if cancel.is_cancelled() {
                debug!(height, "checksum computation cancelled");
                return Ok(ChecksumOutcome::Aborted {
                    next_height: height,
                });
            }

            let header = match preload.pop_front() {
                Some(h) if h.height == height => h,
                _ => {
                    let upper = (height + PRELOAD_BATCH).min(target) - 1;
                    let batch = self.db.header_range(height, upper).await?;
                    preload = batch.into();
                    preload
                        .pop_front()
                        .filter(|h| h.height == height)
                        .ok_or(ChecksumError::MissingHeader(height))?
                }
            };

            let storage_root = EMPTY_STORAGE_ROOT;
            let receipt_root = ibd_receipt_root(&prev_checksum);

            let leaves = leaves_for_block(
                header.prev_blockhash,
                prev_checksum,
                header.hash,
                header.merkle_root,
                storage_root,
                receipt_root,
            );
            let (root, proofs) = ChecksumTree::compute(&leaves).into_parts();

            pending.push(ChecksumUpdate {
                height,
                checksum_root: root,
                checksum_proofs: proofs,
                prev_checksum,
                storage_root,
                receipt_root,
            });

            if pending.len() >= DB_WRITE_BATCH {
                self.flush(&mut pending).await?;
            }

            if hook.should_save(height) {
                self.flush(&mut pending).await?;
                hook.save(height).await?;
            }

            prev_checksum = root;
        }

        self.flush(&mut pending).await?;

        Ok(ChecksumOutcome::Completed {
            tip_checksum: prev_checksum,
        })
    }

    async fn flush(&self, pending: &mut Vec<ChecksumUpdate>) -> Result<(), ChecksumError> {
        if pending.is_empty() {
            return Ok(());
        }
        let batch = std::mem::take(pending);
        debug!(count = batch.len(), "flushing checksum updates");
        self.db.apply_checksum_updates(batch).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use opnet_db::MemDb;
    use opnet_primitives::sha256;

    use super::*;

    fn make_header(height: u64, prev: Option<Buf32>) -> HeaderRecord {
        let hash = sha256(format!("h:{height}").as_bytes());
        HeaderRecord::new(
            height,
            hash,
            prev,
            sha256(format!("m:{height}").as_bytes()),
            0,
            0,
            0,
            0,
            2,
            1,
        )
    }

    async fn seeded_db(count: u64) -> Arc<MemDb> {
        let db = Arc::new(MemDb::new());
        let mut prev = None;
        let mut headers = Vec::new();
        for h in 0..count {
            let header = make_header(h, prev);
            prev = Some(header.hash);
            headers.push(header);
        }
        db.put_headers(headers).await.unwrap();
        db
    }

    #[tokio::test]
    async fn test_chain_links_and_recompute_is_identical() {
        let db = seeded_db(20).await;
        let engine = ChecksumEngine::new(db.clone());
        let cancel = CancellationToken::new();

        let out = engine
            .compute_range(0, 20, &cancel, &NoCheckpoint)
            .await
            .unwrap();
        let ChecksumOutcome::Completed { tip_checksum } = out else {
            panic!("expected completion");
        };

        // Every block's stored prev_checksum equals its predecessor's root.
        let headers = db.header_range(0, 19).await.unwrap();
        assert_eq!(headers[0].prev_checksum, Some(ZERO_CHECKSUM));
        for pair in headers.windows(2) {
            assert_eq!(pair[1].prev_checksum, pair[0].checksum_root);
        }
        assert_eq!(headers[19].checksum_root, Some(tip_checksum));

        // Recomputing from scratch on a fresh store yields identical bytes.
        let db2 = seeded_db(20).await;
        let engine2 = ChecksumEngine::new(db2.clone());
        engine2
            .compute_range(0, 20, &cancel, &NoCheckpoint)
            .await
            .unwrap();
        let headers2 = db2.header_range(0, 19).await.unwrap();
        assert_eq!(headers, headers2);
    }

    #[tokio::test]
    async fn test_resume_mid_range_matches_single_run() {
        let full = seeded_db(50).await;
        let engine = ChecksumEngine::new(full.clone());
        let cancel = CancellationToken::new();
        engine
            .compute_range(0, 50, &cancel, &NoCheckpoint)
            .await
            .unwrap();

        // Split run: [0, 23) then resume [23, 50) seeding from height 22.
        let split = seeded_db(50).await;
        let split_engine = ChecksumEngine::new(split.clone());
        split_engine
            .compute_range(0, 23, &cancel, &NoCheckpoint)
            .await
            .unwrap();
        split_engine
            .compute_range(23, 50, &cancel, &NoCheckpoint)
            .await
            .unwrap();

        assert_eq!(
            full.header_range(0, 49).await.unwrap(),
            split.header_range(0, 49).await.unwrap()
        );
    }

    #[tokio::test]
    async fn test_missing_header_is_fatal() {
        let db = Arc::new(MemDb::new());
        db.put_headers(vec![make_header(0, None)]).await.unwrap();
        let engine = ChecksumEngine::new(db);
        let cancel = CancellationToken::new();

        let err = engine
            .compute_range(0, 3, &cancel, &NoCheckpoint)
            .await
            .unwrap_err();
        assert!(matches!(err, ChecksumError::MissingHeader(1)));
    }

    #[tokio::test]
    async fn test_cancellation_discards_pending() {
        let db = seeded_db(10).await;
        let engine = ChecksumEngine::new(db.clone());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let out = engine
            .compute_range(0, 10, &cancel, &NoCheckpoint)
            .await
            .unwrap();
        assert_eq!(out, ChecksumOutcome::Aborted { next_height: 0 });
        assert!(!db.header_at(0).await.unwrap().unwrap().has_checksum());
    }

    #[tokio::test]
    async fn test_seed_from_persisted_predecessor() {
        let db = seeded_db(10).await;
        let engine = ChecksumEngine::new(db.clone());
        let cancel = CancellationToken::new();

        engine
            .compute_range(0, 5, &cancel, &NoCheckpoint)
            .await
            .unwrap();
        let root4 = db.header_at(4).await.unwrap().unwrap().checksum_root;

        engine
            .compute_range(5, 10, &cancel, &NoCheckpoint)
            .await
            .unwrap();
        let h5 = db.header_at(5).await.unwrap().unwrap();
        assert_eq!(h5.prev_checksum, root4);
    }
}
