use opnet_btcio::L1ClientError;
use opnet_checksum::ChecksumError;
use opnet_db::{DbError, IbdPhase};
use thiserror::Error;

/// Errors fatal to a sync phase or the whole pipeline.
#[derive(Debug, Error)]
pub enum SyncError {
    /// A header batch could not be completed even after retries.
    #[error("header batch [{start}, {end}] incomplete: {reason}")]
    IncompleteBatch {
        start: u64,
        end: u64,
        reason: String,
    },

    /// A phase failed; recorded by the orchestrator before exiting.
    #[error("phase {phase} failed: {source}")]
    PhaseFailed {
        phase: IbdPhase,
        #[source]
        source: Box<SyncError>,
    },

    /// Epoch data disagrees with the stored chain.
    #[error("epoch {0} inconsistent: {1}")]
    EpochInconsistent(u64, String),

    #[error("l1 client: {0}")]
    L1(#[from] L1ClientError),

    #[error("checksum: {0}")]
    Checksum(#[from] ChecksumError),

    #[error("db: {0}")]
    Db(#[from] DbError),

    /// Peer-facing witness transport failed.
    #[error("witness transport: {0}")]
    WitnessTransport(String),
}

impl SyncError {
    pub fn in_phase(self, phase: IbdPhase) -> Self {
        Self::PhaseFailed {
            phase,
            source: Box::new(self),
        }
    }
}
