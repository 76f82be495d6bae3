//! Individual pipeline phases.

pub mod checksum;
pub mod epoch;
pub mod headers;
pub mod witness;

/// How a phase ended. Failure travels separately as `SyncError`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PhaseOutcome {
    Completed,
    /// Cancelled; the last persisted checkpoint is the resume point.
    Aborted,
}
