//! Hook events dispatched to plugin workers.

use futures::future::join_all;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::{errors::PluginError, worker::PluginWorker};

/// Named hook points. `Reorg` and `ReindexRequired` are blocking: the
/// dispatcher waits for every plugin and any failure aborts the caller.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum HookType {
    BlockPreProcess,
    BlockPostProcess,
    BlockChange,
    EpochChange,
    EpochFinalized,
    MempoolTx,
    Reorg,
    ReindexRequired,
    PurgeBlocks,
}

impl HookType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BlockPreProcess => "BLOCK_PRE_PROCESS",
            Self::BlockPostProcess => "BLOCK_POST_PROCESS",
            Self::BlockChange => "BLOCK_CHANGE",
            Self::EpochChange => "EPOCH_CHANGE",
            Self::EpochFinalized => "EPOCH_FINALIZED",
            Self::MempoolTx => "MEMPOOL_TX",
            Self::Reorg => "REORG",
            Self::ReindexRequired => "REINDEX_REQUIRED",
            Self::PurgeBlocks => "PURGE_BLOCKS",
        }
    }

    /// Blocking hooks gate the caller on every plugin's completion.
    pub fn is_blocking(&self) -> bool {
        matches!(self, Self::Reorg | Self::ReindexRequired)
    }
}

/// What a `REINDEX_REQUIRED` dispatch asks a plugin to do.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ReindexAction {
    None,
    /// Discard plugin state above `purge_to_block`.
    Purge { purge_to_block: u64 },
    /// Catch up from `sync_from` to `sync_to`.
    Sync { sync_from: u64, sync_to: u64 },
}

/// Concrete hook payloads.
#[derive(Clone, Debug)]
pub enum HookEvent {
    BlockPreProcess { height: u64 },
    BlockPostProcess { height: u64 },
    BlockChange { height: u64 },
    EpochChange { epoch: u64 },
    EpochFinalized { epoch: u64, last_height: u64 },
    MempoolTx { id: String },
    Reorg { from_block: u64, to_block: u64, reason: String },
    ReindexRequired { action: ReindexAction },
    PurgeBlocks { from: u64, to: Option<u64> },
}

impl HookEvent {
    pub fn hook_type(&self) -> HookType {
        match self {
            Self::BlockPreProcess { .. } => HookType::BlockPreProcess,
            Self::BlockPostProcess { .. } => HookType::BlockPostProcess,
            Self::BlockChange { .. } => HookType::BlockChange,
            Self::EpochChange { .. } => HookType::EpochChange,
            Self::EpochFinalized { .. } => HookType::EpochFinalized,
            Self::MempoolTx { .. } => HookType::MempoolTx,
            Self::Reorg { .. } => HookType::Reorg,
            Self::ReindexRequired { .. } => HookType::ReindexRequired,
            Self::PurgeBlocks { .. } => HookType::PurgeBlocks,
        }
    }
}

/// Fans one event out to the given workers (already filtered to plugins
/// that declared the hook permission).
///
/// Blocking hooks await every worker and surface the first failure;
/// non-blocking hooks still await completion but only log failures.
#[derive(Debug, Default)]
pub struct HookDispatcher;

impl HookDispatcher {
    /// Runs every target and returns each plugin's individual result.
    pub async fn dispatch_collect(
        targets: &[(String, Arc<dyn PluginWorker>)],
        event: &HookEvent,
    ) -> Vec<(String, Result<(), PluginError>)> {
        let hook = event.hook_type();
        debug!(hook = hook.as_str(), targets = targets.len(), "dispatching hook");

        join_all(targets.iter().map(|(id, worker)| async move {
            (id.clone(), worker.dispatch_hook(event).await)
        }))
        .await
    }

    /// Fans out and applies the blocking policy: blocking hooks surface
    /// the first failure, non-blocking hooks only log.
    pub async fn dispatch(
        targets: &[(String, Arc<dyn PluginWorker>)],
        event: &HookEvent,
    ) -> Result<(), PluginError> {
        let hook = event.hook_type();
        for (id, result) in Self::dispatch_collect(targets, event).await {
            if let Err(e) = result {
                if hook.is_blocking() {
                    return Err(PluginError::HookFailed {
                        plugin: id,
                        reason: e.to_string(),
                    });
                }
                warn!(plugin = %id, hook = hook.as_str(), %e, "hook handler failed");
            }
        }
        Ok(())
    }
}
