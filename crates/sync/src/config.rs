//! Sync pipeline knobs.

use std::time::Duration;

use opnet_common::RetryPolicy;

/// Tuning for the IBD pipeline. Defaults are sized for a typical bitcoind
/// over a LAN.
#[derive(Clone, Debug)]
pub struct SyncConfig {
    /// Concurrent header-download batches.
    pub worker_count: usize,
    /// Heights per header-download batch.
    pub batch_size: u64,
    /// Checkpoint at least every this many blocks.
    pub checkpoint_interval_blocks: u64,
    /// Checkpoint at least this often in wall time.
    pub checkpoint_interval: Duration,
    /// Retry policy for L1 RPC calls.
    pub retry: RetryPolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            batch_size: 250,
            checkpoint_interval_blocks: 1000,
            checkpoint_interval: Duration::from_secs(5),
            retry: RetryPolicy::default(),
        }
    }
}
