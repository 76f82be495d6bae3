//! Phase 3: witness synchronization from peers.

use std::sync::Arc;

use async_trait::async_trait;
use opnet_authority::{witness_message, AuthorityManager};
use opnet_db::{
    HeaderDatabase, IbdPhase, ProgressDatabase, WitnessDatabase, WitnessRecord,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{progress::ProgressTracker, SyncError};

use super::PhaseOutcome;

/// Source of candidate witnesses for a block. The P2P layer implements
/// this over its authenticated peers; peers may answer with any subset.
#[async_trait]
pub trait WitnessProvider: Send + Sync {
    async fn request_witnesses(&self, block_number: u64)
        -> Result<Vec<WitnessRecord>, SyncError>;
}

/// Provider used when the node runs without peers; every request yields
/// nothing, which is a legal (if lonely) sync.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPeers;

#[async_trait]
impl WitnessProvider for NoPeers {
    async fn request_witnesses(
        &self,
        _block_number: u64,
    ) -> Result<Vec<WitnessRecord>, SyncError> {
        Ok(Vec::new())
    }
}

/// Requests witnesses per block, validates them against the trusted set
/// and persists the survivors.
pub struct WitnessSyncPhase<D, W> {
    db: Arc<D>,
    authority: Arc<AuthorityManager>,
    provider: Arc<W>,
    tracker: Arc<ProgressTracker<D>>,
    min_witnesses: usize,
}

impl<D, W> WitnessSyncPhase<D, W>
where
    D: HeaderDatabase + WitnessDatabase + ProgressDatabase + 'static,
    W: WitnessProvider,
{
    pub fn new(
        db: Arc<D>,
        authority: Arc<AuthorityManager>,
        provider: Arc<W>,
        tracker: Arc<ProgressTracker<D>>,
        min_witnesses: usize,
    ) -> Self {
        Self {
            db,
            authority,
            provider,
            tracker,
            min_witnesses,
        }
    }

    pub async fn run(
        &self,
        start: u64,
        target: u64,
        cancel: &CancellationToken,
    ) -> Result<PhaseOutcome, SyncError> {
        info!(start, target, "syncing block witnesses");
        let mut synced: u64 = 0;

        for height in start..target {
            if cancel.is_cancelled() {
                return Ok(PhaseOutcome::Aborted);
            }

            if self.db.trusted_identity_count(height).await? >= self.min_witnesses {
                continue;
            }

            let checksum_root = self
                .db
                .header_at(height)
                .await?
                .and_then(|h| h.checksum_root)
                .ok_or(SyncError::Db(opnet_db::DbError::MissingHeader(height)))?;

            let candidates = self.provider.request_witnesses(height).await?;
            let message = witness_message(height, &checksum_root);

            for mut witness in candidates {
                if witness.block_number != height {
                    warn!(height, got = witness.block_number, "out-of-range witness");
                    continue;
                }
                let Some(matched) =
                    self.authority.verify_trusted_signature(&message, &witness.signature)
                else {
                    debug!(height, "witness signature not in trusted set");
                    continue;
                };

                witness.identity = matched.identity;
                witness.trusted = true;
                if self.db.insert_witness(witness).await? {
                    synced += 1;
                }
            }

            if self.tracker.should_save_checkpoint(height) {
                self.tracker
                    .update_progress(IbdPhase::WitnessSync, height + 1, |c| {
                        c.witnesses_synced += synced;
                    })
                    .await?;
                synced = 0;
            }
        }

        self.tracker
            .update_progress(IbdPhase::WitnessSync, target, |c| {
                c.witnesses_synced += synced;
            })
            .await?;

        Ok(PhaseOutcome::Completed)
    }
}
