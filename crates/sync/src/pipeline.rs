//! The four-phase IBD orchestrator.

use std::sync::Arc;

use opnet_authority::AuthorityManager;
use opnet_btcio::L1Client;
use opnet_db::{IbdPhase, NodeDatabase};
use opnet_primitives::Params;
use opnet_status::StatusChannel;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::{
    config::SyncConfig,
    phases::{
        checksum::ChecksumGenerationPhase, epoch::EpochFinalizationPhase,
        headers::HeaderDownloadPhase, witness::WitnessSyncPhase, PhaseOutcome,
    },
    progress::ProgressTracker,
    SyncError, WitnessProvider,
};

/// Everything the pipeline needs, wired once by the binary.
pub struct SyncContext<C, D, W> {
    pub client: Arc<C>,
    pub db: Arc<D>,
    pub authority: Arc<AuthorityManager>,
    pub witnesses: Arc<W>,
    pub status: StatusChannel,
    pub params: Arc<Params>,
    pub config: SyncConfig,
}

/// How a pipeline run ended.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PipelineOutcome {
    /// All phases done; the node may enter steady state.
    Completed,
    /// Cancelled; resume from the persisted checkpoint.
    Aborted,
}

fn ordinal(phase: IbdPhase) -> u8 {
    match phase {
        IbdPhase::HeaderDownload => 0,
        IbdPhase::ChecksumGeneration => 1,
        IbdPhase::WitnessSync => 2,
        IbdPhase::EpochFinalization => 3,
    }
}

/// Runs the phases in order, resuming from the recorded checkpoint. On a
/// phase failure the failing phase is recorded in the error and the
/// pipeline exits without advancing.
pub struct SyncPipeline<C, D, W> {
    ctx: SyncContext<C, D, W>,
}

impl<C, D, W> SyncPipeline<C, D, W>
where
    C: L1Client + 'static,
    D: NodeDatabase + 'static,
    W: WitnessProvider + 'static,
{
    pub fn new(ctx: SyncContext<C, D, W>) -> Self {
        Self { ctx }
    }

    pub async fn run(&self, cancel: &CancellationToken) -> Result<PipelineOutcome, SyncError> {
        let ctx = &self.ctx;
        let target = ctx.client.get_chain_height().await? + 1;

        let tracker = Arc::new(
            ProgressTracker::load_or_init(
                ctx.db.clone(),
                0,
                target,
                ctx.config.checkpoint_interval_blocks,
                ctx.config.checkpoint_interval,
            )
            .await?,
        );

        let recorded = tracker.progress();

        // A completed pipeline run is a no-op: not a single write.
        if recorded.phase == IbdPhase::EpochFinalization
            && recorded.target_height == target
            && recorded.current_height + 1 >= target
        {
            info!(target, "IBD already complete");
            self.publish_status().await?;
            return Ok(PipelineOutcome::Completed);
        }

        let from = ordinal(recorded.phase);
        info!(target, resume_phase = %recorded.phase, "starting IBD");

        if from <= ordinal(IbdPhase::HeaderDownload) {
            let start = tracker
                .enter_phase(IbdPhase::HeaderDownload, 0, target)
                .await?;
            let phase = HeaderDownloadPhase::new(
                ctx.client.clone(),
                ctx.db.clone(),
                tracker.clone(),
                ctx.config.clone(),
            );
            match self
                .run_phase(IbdPhase::HeaderDownload, phase.run(start, target, cancel))
                .await?
            {
                PhaseOutcome::Aborted => return Ok(PipelineOutcome::Aborted),
                PhaseOutcome::Completed => {}
            }
        }

        if from <= ordinal(IbdPhase::ChecksumGeneration) {
            let start = tracker
                .enter_phase(IbdPhase::ChecksumGeneration, 0, target)
                .await?;
            let phase = ChecksumGenerationPhase::new(ctx.db.clone(), tracker.clone());
            match self
                .run_phase(
                    IbdPhase::ChecksumGeneration,
                    phase.run(start, target, cancel),
                )
                .await?
            {
                PhaseOutcome::Aborted => return Ok(PipelineOutcome::Aborted),
                PhaseOutcome::Completed => {}
            }
        }

        if from <= ordinal(IbdPhase::WitnessSync) {
            let start = tracker.enter_phase(IbdPhase::WitnessSync, 0, target).await?;
            let phase = WitnessSyncPhase::new(
                ctx.db.clone(),
                ctx.authority.clone(),
                ctx.witnesses.clone(),
                tracker.clone(),
                ctx.params.min_witnesses(),
            );
            match self
                .run_phase(IbdPhase::WitnessSync, phase.run(start, target, cancel))
                .await?
            {
                PhaseOutcome::Aborted => return Ok(PipelineOutcome::Aborted),
                PhaseOutcome::Completed => {}
            }
        }

        {
            tracker
                .enter_phase(IbdPhase::EpochFinalization, 0, target)
                .await?;
            let phase = EpochFinalizationPhase::new(
                ctx.db.clone(),
                tracker.clone(),
                ctx.status.clone(),
                ctx.params.clone(),
            );
            match self
                .run_phase(IbdPhase::EpochFinalization, phase.run(target, cancel))
                .await?
            {
                PhaseOutcome::Aborted => return Ok(PipelineOutcome::Aborted),
                PhaseOutcome::Completed => {}
            }
        }

        self.publish_status().await?;
        info!(target, "IBD complete, handing off to steady state");
        Ok(PipelineOutcome::Completed)
    }

    async fn run_phase(
        &self,
        phase: IbdPhase,
        fut: impl std::future::Future<Output = Result<PhaseOutcome, SyncError>>,
    ) -> Result<PhaseOutcome, SyncError> {
        match fut.await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                error!(%phase, %e, "IBD phase failed");
                Err(e.in_phase(phase))
            }
        }
    }

    async fn publish_status(&self) -> Result<(), SyncError> {
        let tip = self.ctx.db.chain_tip().await?;
        let latest_epoch = self.ctx.db.latest_finalized_epoch().await?;
        self.ctx.status.update_chain_status(|s| {
            s.tip = tip;
            s.checksum_height = tip.map(|t| t.height());
            s.finalized_epoch = latest_epoch
                .as_ref()
                .map(|e| opnet_primitives::EpochCommitment::new(e.epoch_number, e.end_height()));
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use opnet_authority::{
        witness_message, AuthorityKeySet, SignatureVerifier, TrustedEntity, TrustedKey,
    };
    use opnet_btcio::test_utils::TestL1Client;
    use opnet_db::{
        EpochDatabase, HeaderDatabase, MemDb, ProgressDatabase, WitnessDatabase, WitnessRecord,
    };
    use opnet_primitives::NetworkId;

    use super::*;
    use crate::phases::witness::NoPeers;

    /// Accepts signatures of the form `sig = message || public_key`.
    #[derive(Debug, Default)]
    struct StubVerifier;

    impl SignatureVerifier for StubVerifier {
        fn verify(&self, message: &[u8], signature: &[u8], public_key: &[u8]) -> bool {
            let mut expect = message.to_vec();
            expect.extend_from_slice(public_key);
            signature == expect
        }
    }

    fn make_key(tag: u8) -> TrustedKey {
        let public_key = vec![tag; 8];
        let opnet_key = vec![tag.wrapping_add(100); 8];
        let mut self_signature = public_key.clone();
        self_signature.extend_from_slice(&opnet_key);
        TrustedKey {
            public_key,
            opnet_key,
            self_signature,
        }
    }

    fn test_authority() -> Arc<AuthorityManager> {
        let entities = vec![
            TrustedEntity {
                name: "alpha".into(),
                keys: vec![make_key(1), make_key(2)],
            },
            TrustedEntity {
                name: "beta".into(),
                keys: vec![make_key(3)],
            },
        ];
        let set =
            AuthorityKeySet::load(1, 0, NetworkId::Regtest, entities, &StubVerifier, 3).unwrap();
        Arc::new(AuthorityManager::new(set, Arc::new(StubVerifier), 2, 3, 2))
    }

    fn make_ctx<W: WitnessProvider>(
        client: Arc<TestL1Client>,
        db: Arc<MemDb>,
        witnesses: Arc<W>,
    ) -> SyncContext<TestL1Client, MemDb, W> {
        let mut config = SyncConfig::default();
        config.worker_count = 2;
        config.batch_size = 10;
        SyncContext {
            client,
            db,
            authority: test_authority(),
            witnesses,
            status: StatusChannel::new(),
            params: Arc::new(Params::regtest()),
            config,
        }
    }

    /// Scenario: cold IBD from genesis to 100 with no peers offering
    /// witnesses, then an idempotent re-run.
    #[tokio::test]
    async fn test_cold_ibd_then_noop_rerun() {
        let client = Arc::new(TestL1Client::new(42, 100));
        let db = Arc::new(MemDb::new());
        let pipeline = SyncPipeline::new(make_ctx(client, db.clone(), Arc::new(NoPeers)));
        let cancel = CancellationToken::new();

        let out = pipeline.run(&cancel).await.unwrap();
        assert_eq!(out, PipelineOutcome::Completed);

        // Final checkpoint: epoch finalization at current=99, target=100.
        let progress = db.load_progress().await.unwrap().unwrap();
        assert_eq!(progress.phase, IbdPhase::EpochFinalization);
        assert_eq!(progress.current_height, 99);
        assert_eq!(progress.target_height, 100);
        assert_eq!(progress.counters.headers_downloaded, 100);
        assert_eq!(progress.counters.checksums_computed, 100);
        assert_eq!(progress.counters.witnesses_synced, 0);
        assert_eq!(progress.counters.epochs_finalized, 20);

        // Every block is chained.
        let headers = db.header_range(0, 99).await.unwrap();
        assert_eq!(headers.len(), 100);
        assert!(headers.iter().all(|h| h.has_checksum()));
        for pair in headers.windows(2) {
            assert_eq!(pair[1].prev_checksum, pair[0].checksum_root);
        }

        // All 20 epochs finalized despite zero witnesses.
        let last = db.latest_finalized_epoch().await.unwrap().unwrap();
        assert_eq!(last.epoch_number, 19);
        assert!(last.witness_identities.is_empty());

        // Re-run: not a single additional write.
        let writes = db.write_count();
        let out = pipeline.run(&cancel).await.unwrap();
        assert_eq!(out, PipelineOutcome::Completed);
        assert_eq!(db.write_count(), writes);
    }

    /// Scenario: crash mid-checksum at height 42, resume, and end with
    /// byte-identical chain state.
    #[tokio::test]
    async fn test_resume_after_crash_mid_checksum() {
        let cancel = CancellationToken::new();

        // Reference run.
        let client = Arc::new(TestL1Client::new(9, 100));
        let reference_db = Arc::new(MemDb::new());
        SyncPipeline::new(make_ctx(client.clone(), reference_db.clone(), Arc::new(NoPeers)))
            .run(&cancel)
            .await
            .unwrap();

        // Crashed run: headers complete, checksums stop at height 42.
        let db = Arc::new(MemDb::new());
        let tracker = Arc::new(
            ProgressTracker::load_or_init(
                db.clone(),
                0,
                100,
                1000,
                std::time::Duration::from_secs(3600),
            )
            .await
            .unwrap(),
        );
        let mut config = SyncConfig::default();
        config.worker_count = 2;
        config.batch_size = 10;
        HeaderDownloadPhase::new(client.clone(), db.clone(), tracker.clone(), config)
            .run(0, 100, &cancel)
            .await
            .unwrap();
        tracker
            .enter_phase(IbdPhase::ChecksumGeneration, 0, 42)
            .await
            .unwrap();
        ChecksumGenerationPhase::new(db.clone(), tracker.clone())
            .run(0, 42, &cancel)
            .await
            .unwrap();

        let progress = db.load_progress().await.unwrap().unwrap();
        assert_eq!(progress.phase, IbdPhase::ChecksumGeneration);
        assert_eq!(progress.current_height, 42);

        // Restart resumes at 42 and completes.
        let out = SyncPipeline::new(make_ctx(client, db.clone(), Arc::new(NoPeers)))
            .run(&cancel)
            .await
            .unwrap();
        assert_eq!(out, PipelineOutcome::Completed);

        assert_eq!(
            reference_db.header_range(0, 99).await.unwrap(),
            db.header_range(0, 99).await.unwrap()
        );
    }

    /// Peers serving validly signed witnesses: they are verified, stored
    /// under the derived identity and folded into epoch records.
    #[tokio::test]
    async fn test_witnesses_from_peers_are_persisted() {
        struct SigningPeers {
            db: Arc<MemDb>,
        }

        #[async_trait]
        impl WitnessProvider for SigningPeers {
            async fn request_witnesses(
                &self,
                block_number: u64,
            ) -> Result<Vec<WitnessRecord>, SyncError> {
                let root = self
                    .db
                    .header_at(block_number)
                    .await?
                    .and_then(|h| h.checksum_root)
                    .expect("checksums precede witness sync");
                let message = witness_message(block_number, &root);

                // Keys 1 and 3 sign; key 9 is untrusted noise.
                Ok([1u8, 3, 9]
                    .iter()
                    .map(|tag| {
                        let public_key = vec![*tag; 8];
                        let mut signature = message.clone();
                        signature.extend_from_slice(&public_key);
                        WitnessRecord {
                            block_number,
                            signature,
                            public_key,
                            timestamp: 0,
                            proofs: None,
                            identity: opnet_primitives::Buf32::zero(),
                            trusted: false,
                        }
                    })
                    .collect())
            }
        }

        let client = Arc::new(TestL1Client::new(3, 10));
        let db = Arc::new(MemDb::new());
        let provider = Arc::new(SigningPeers { db: db.clone() });
        let pipeline = SyncPipeline::new(make_ctx(client, db.clone(), provider));
        let cancel = CancellationToken::new();

        pipeline.run(&cancel).await.unwrap();

        // Two trusted witnesses per block; the untrusted one dropped.
        for height in 0..10 {
            assert_eq!(db.trusted_identity_count(height).await.unwrap(), 2);
        }
        let epoch = db.epoch(0).await.unwrap().unwrap();
        assert_eq!(epoch.witness_identities.len(), 2);
        assert!(epoch.finalized);
    }

    /// Cancellation before any work leaves the initial checkpoint intact.
    #[tokio::test]
    async fn test_abort_preserves_checkpoint() {
        let client = Arc::new(TestL1Client::new(5, 50));
        let db = Arc::new(MemDb::new());
        let pipeline = SyncPipeline::new(make_ctx(client, db.clone(), Arc::new(NoPeers)));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let out = pipeline.run(&cancel).await.unwrap();
        assert_eq!(out, PipelineOutcome::Aborted);

        let progress = db.load_progress().await.unwrap().unwrap();
        assert_eq!(progress.phase, IbdPhase::HeaderDownload);
        assert_eq!(progress.current_height, 0);
    }
}
