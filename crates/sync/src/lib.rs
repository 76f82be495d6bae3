//! Initial block download: the four-phase pipeline that brings a cold
//! node to the chain tip.
//!
//! Phases run strictly in order (header download, checksum generation,
//! witness sync, epoch finalization), each checkpointed so a restart
//! resumes where the last one stopped.

pub mod config;
pub mod errors;
pub mod phases;
pub mod pipeline;
pub mod progress;

pub use config::SyncConfig;
pub use errors::SyncError;
pub use phases::witness::WitnessProvider;
pub use pipeline::{PipelineOutcome, SyncContext, SyncPipeline};
pub use progress::ProgressTracker;
