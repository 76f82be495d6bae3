//! Phase 2: strictly sequential checksum chain generation.

use std::sync::Arc;

use opnet_checksum::{ChecksumEngine, ChecksumOutcome};
use opnet_db::{HeaderDatabase, IbdPhase, ProgressDatabase};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{
    progress::{ChecksumCheckpointHook, ProgressTracker},
    SyncError,
};

use super::PhaseOutcome;

/// Thin wrapper giving the checksum engine its checkpoint policy.
pub struct ChecksumGenerationPhase<D> {
    engine: ChecksumEngine<D>,
    tracker: Arc<ProgressTracker<D>>,
}

impl<D> ChecksumGenerationPhase<D>
where
    D: HeaderDatabase + ProgressDatabase + 'static,
{
    pub fn new(db: Arc<D>, tracker: Arc<ProgressTracker<D>>) -> Self {
        Self {
            engine: ChecksumEngine::new(db),
            tracker,
        }
    }

    pub async fn run(
        &self,
        start: u64,
        target: u64,
        cancel: &CancellationToken,
    ) -> Result<PhaseOutcome, SyncError> {
        let hook = ChecksumCheckpointHook::new(self.tracker.clone());

        match self.engine.compute_range(start, target, cancel, &hook).await? {
            ChecksumOutcome::Completed { tip_checksum } => {
                info!(target, %tip_checksum, "checksum chain complete");
                self.tracker
                    .update_progress(IbdPhase::ChecksumGeneration, target, |c| {
                        c.checksums_computed = target;
                    })
                    .await?;
                Ok(PhaseOutcome::Completed)
            }
            ChecksumOutcome::Aborted { .. } => Ok(PhaseOutcome::Aborted),
        }
    }
}
