//! Phase 1: parallel header download.

use std::sync::Arc;

use opnet_btcio::L1Client;
use opnet_common::{with_retry, RetryPolicy};
use opnet_db::{HeaderDatabase, HeaderRecord, IbdPhase, ProgressDatabase};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{config::SyncConfig, progress::ProgressTracker, SyncError};

use super::PhaseOutcome;

/// Downloads headers for `[start, target)` in concurrent batches. Each
/// batch resolves hashes with one RPC call, fetches headers per hash with
/// bounded retry, sorts by height, and persists independently.
pub struct HeaderDownloadPhase<C, D> {
    client: Arc<C>,
    db: Arc<D>,
    tracker: Arc<ProgressTracker<D>>,
    config: SyncConfig,
}

impl<C, D> HeaderDownloadPhase<C, D>
where
    C: L1Client + 'static,
    D: HeaderDatabase + ProgressDatabase + 'static,
{
    pub fn new(
        client: Arc<C>,
        db: Arc<D>,
        tracker: Arc<ProgressTracker<D>>,
        config: SyncConfig,
    ) -> Self {
        Self {
            client,
            db,
            tracker,
            config,
        }
    }

    pub async fn run(
        &self,
        start: u64,
        target: u64,
        cancel: &CancellationToken,
    ) -> Result<PhaseOutcome, SyncError> {
        info!(start, target, "downloading headers");
        let group_span = self.config.worker_count as u64 * self.config.batch_size;
        let mut next = start;
        let mut downloaded: u64 = 0;

        while next < target {
            if cancel.is_cancelled() {
                return Ok(PhaseOutcome::Aborted);
            }

            let group_end = (next + group_span).min(target);
            let mut workers: JoinSet<Result<u64, SyncError>> = JoinSet::new();

            let mut batch_start = next;
            while batch_start < group_end {
                let batch_end = (batch_start + self.config.batch_size).min(group_end);
                let client = self.client.clone();
                let db = self.db.clone();
                let retry = self.config.retry;
                workers.spawn(fetch_batch(
                    client,
                    db,
                    retry,
                    batch_start,
                    batch_end - batch_start,
                ));
                batch_start = batch_end;
            }

            while let Some(joined) = workers.join_next().await {
                let count = joined.map_err(|e| SyncError::IncompleteBatch {
                    start: next,
                    end: group_end - 1,
                    reason: format!("worker panicked: {e}"),
                })??;
                downloaded += count;
            }

            next = group_end;

            // All batches below `next` have persisted, so the checkpoint
            // cannot run ahead of completed work.
            if self.tracker.should_save_checkpoint(next) {
                self.tracker
                    .update_progress(IbdPhase::HeaderDownload, next, |c| {
                        c.headers_downloaded = downloaded
                    })
                    .await?;
            }
            debug!(next, target, "header group complete");
        }

        self.tracker
            .update_progress(IbdPhase::HeaderDownload, target, |c| {
                c.headers_downloaded = downloaded
            })
            .await?;

        Ok(PhaseOutcome::Completed)
    }
}

/// One batch: `count` consecutive heights from `start`. Any unresolved
/// hash or failed header fetch fails the whole phase.
async fn fetch_batch<C, D>(
    client: Arc<C>,
    db: Arc<D>,
    retry: RetryPolicy,
    start: u64,
    count: u64,
) -> Result<u64, SyncError>
where
    C: L1Client,
    D: HeaderDatabase,
{
    let hashes = with_retry(retry, "get_block_hashes", || {
        client.get_block_hashes(start, count)
    })
    .await?;

    if hashes.len() != count as usize {
        return Err(SyncError::IncompleteBatch {
            start,
            end: start + count - 1,
            reason: format!("expected {count} hashes, got {}", hashes.len()),
        });
    }

    let mut headers = Vec::with_capacity(count as usize);
    for (offset, hash) in hashes.into_iter().enumerate() {
        let height = start + offset as u64;
        let hash = hash.ok_or_else(|| SyncError::IncompleteBatch {
            start,
            end: start + count - 1,
            reason: format!("no hash for height {height}"),
        })?;

        let info = with_retry(retry, "get_block_header", || client.get_block_header(hash)).await?;

        headers.push(HeaderRecord::new(
            height,
            info.hash,
            info.prev_blockhash,
            info.merkle_root,
            info.time,
            info.median_time,
            info.bits,
            info.nonce,
            info.version,
            info.tx_count,
        ));
    }

    headers.sort_by_key(|h| h.height);
    db.put_headers(headers).await?;
    Ok(count)
}
