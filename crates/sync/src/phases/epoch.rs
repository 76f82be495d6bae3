//! Phase 4: epoch finalization.

use std::{collections::BTreeSet, sync::Arc};

use opnet_db::{
    EpochDatabase, EpochRecord, HeaderDatabase, IbdPhase, ProgressDatabase, WitnessDatabase,
};
use opnet_primitives::{hash_pair, Buf32, EpochCommitment, Params};
use opnet_status::{NodeEvent, StatusChannel};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{progress::ProgressTracker, SyncError};

use super::PhaseOutcome;

/// Finalizes every epoch fully covered by the synced range: aggregates the
/// epoch's checksum roots into one commitment, attaches the contributing
/// witness identities and persists the record.
pub struct EpochFinalizationPhase<D> {
    db: Arc<D>,
    tracker: Arc<ProgressTracker<D>>,
    status: StatusChannel,
    params: Arc<Params>,
}

impl<D> EpochFinalizationPhase<D>
where
    D: HeaderDatabase + WitnessDatabase + EpochDatabase + ProgressDatabase + 'static,
{
    pub fn new(
        db: Arc<D>,
        tracker: Arc<ProgressTracker<D>>,
        status: StatusChannel,
        params: Arc<Params>,
    ) -> Self {
        Self {
            db,
            tracker,
            status,
            params,
        }
    }

    pub async fn run(
        &self,
        target: u64,
        cancel: &CancellationToken,
    ) -> Result<PhaseOutcome, SyncError> {
        let per_epoch = self.params.blocks_per_epoch();
        let full_epochs = target / per_epoch;
        info!(target, full_epochs, "finalizing epochs");

        for epoch in 0..full_epochs {
            if cancel.is_cancelled() {
                return Ok(PhaseOutcome::Aborted);
            }

            // Already finalized in an earlier run; nothing to redo.
            if let Some(existing) = self.db.epoch(epoch).await? {
                if existing.finalized {
                    continue;
                }
            }

            let record = self.finalize_epoch(epoch, per_epoch).await?;
            let last_height = record.end_height();
            self.db.put_epoch(record).await?;

            self.status.publish(NodeEvent::EpochFinalized(EpochCommitment::new(
                epoch,
                last_height,
            )));
            debug!(epoch, last_height, "epoch finalized");

            if self.tracker.should_save_checkpoint(last_height) {
                self.tracker
                    .update_progress(IbdPhase::EpochFinalization, last_height, |c| {
                        c.epochs_finalized = epoch + 1;
                    })
                    .await?;
            }
        }

        self.tracker
            .update_progress(
                IbdPhase::EpochFinalization,
                target.saturating_sub(1),
                |c| {
                    c.epochs_finalized = full_epochs;
                },
            )
            .await?;

        Ok(PhaseOutcome::Completed)
    }

    async fn finalize_epoch(&self, epoch: u64, per_epoch: u64) -> Result<EpochRecord, SyncError> {
        let start = epoch * per_epoch;
        let end = start + per_epoch - 1;

        let headers = self.db.header_range(start, end).await?;
        if headers.len() != per_epoch as usize {
            return Err(SyncError::EpochInconsistent(
                epoch,
                format!("{} of {per_epoch} headers present", headers.len()),
            ));
        }

        // Fold the chained checksum roots into one epoch commitment.
        let mut commitment = Buf32::zero();
        for header in &headers {
            let root = header.checksum_root.ok_or_else(|| {
                SyncError::EpochInconsistent(
                    epoch,
                    format!("height {} missing checksum", header.height),
                )
            })?;
            commitment = hash_pair(&commitment, &root);
        }

        // Distinct trusted identities across the epoch's blocks.
        let mut identities = BTreeSet::new();
        for height in start..=end {
            for witness in self.db.witnesses_at(height).await? {
                if witness.trusted {
                    identities.insert(witness.identity);
                }
            }
        }

        Ok(EpochRecord {
            epoch_number: epoch,
            blocks_per_epoch: per_epoch,
            witness_identities: identities.into_iter().collect(),
            commitment,
            finalized: true,
        })
    }
}
