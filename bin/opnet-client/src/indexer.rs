//! Steady-state indexing: follows the chain tip after IBD completes.

use std::{sync::Arc, time::Duration};

use opnet_btcio::L1Client;
use opnet_checksum::{ChecksumEngine, NoCheckpoint};
use opnet_db::{EpochRecord, HeaderRecord, NodeDatabase, WitnessRecord};
use opnet_p2p::PeerManagerHandle;
use opnet_plugin::{HookEvent, PluginManager};
use opnet_primitives::{hash_pair, Buf32, EpochCommitment, L1BlockCommitment, Params};
use opnet_status::{NodeEvent, StatusChannel};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use opnet_authority::witness_message;

use crate::dev_crypto::dev_sign;

/// How far back a reorg scan walks before giving up.
const MAX_REORG_DEPTH: u64 = 100;

/// Identity used to produce this node's own witnesses, when it is a
/// validator.
#[derive(Clone, Debug)]
pub(crate) struct ValidatorIdentity {
    pub(crate) public_key: Vec<u8>,
    pub(crate) opnet_key: Vec<u8>,
}

pub(crate) struct IndexerCtx<C, D> {
    pub(crate) client: Arc<C>,
    pub(crate) db: Arc<D>,
    pub(crate) status: StatusChannel,
    pub(crate) params: Arc<Params>,
    pub(crate) p2p: Option<PeerManagerHandle>,
    pub(crate) plugins: Arc<Mutex<PluginManager>>,
    pub(crate) validator: Option<ValidatorIdentity>,
    pub(crate) poll_interval: Duration,
}

/// Polls the RPC node and indexes every new block in order. Reorg hook
/// dispatch is blocking and totally ordered with subsequent indexing.
pub(crate) async fn indexer_task<C, D>(
    ctx: IndexerCtx<C, D>,
    cancel: CancellationToken,
) -> anyhow::Result<()>
where
    C: L1Client + 'static,
    D: NodeDatabase + 'static,
{
    info!("steady-state indexer running");
    let engine = ChecksumEngine::new(ctx.db.clone());

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("indexer shutting down");
                return Ok(());
            }
            _ = tokio::time::sleep(ctx.poll_interval) => {}
        }

        let remote_height = match ctx.client.get_chain_height().await {
            Ok(height) => height,
            Err(e) => {
                warn!(%e, "chain height poll failed");
                continue;
            }
        };

        let mut next = match ctx.db.chain_tip().await? {
            Some(tip) => tip.height() + 1,
            None => 0,
        };

        while next <= remote_height && !cancel.is_cancelled() {
            match index_block(&ctx, &engine, next, &cancel).await {
                Ok(IndexStep::Indexed) => next += 1,
                Ok(IndexStep::Rewound(fork)) => next = fork + 1,
                Err(e) => {
                    error!(height = next, %e, "block indexing failed");
                    return Err(e);
                }
            }
        }
    }
}

enum IndexStep {
    Indexed,
    /// A reorg rewound the local chain to this height.
    Rewound(u64),
}

async fn index_block<C, D>(
    ctx: &IndexerCtx<C, D>,
    engine: &ChecksumEngine<D>,
    height: u64,
    cancel: &CancellationToken,
) -> anyhow::Result<IndexStep>
where
    C: L1Client + 'static,
    D: NodeDatabase + 'static,
{
    let hashes = ctx.client.get_block_hashes(height, 1).await?;
    let Some(hash) = hashes.first().copied().flatten() else {
        // The node answered the height poll but has no hash yet.
        return Ok(IndexStep::Indexed);
    };
    let info = ctx.client.get_block_header(hash).await?;

    // Reorg detection: the new block must extend our stored tip.
    if height > 0 {
        let local_prev = ctx.db.header_at(height - 1).await?.map(|h| h.hash);
        if local_prev.is_some() && info.prev_blockhash != local_prev {
            let fork = find_fork_point(ctx, height - 1).await?;
            handle_reorg(ctx, fork, height).await?;
            return Ok(IndexStep::Rewound(fork));
        }
    }

    ctx.plugins
        .lock()
        .await
        .dispatch_hook(&HookEvent::BlockPreProcess { height })
        .await
        .ok();

    let record = HeaderRecord::new(
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
    );
    ctx.db.put_headers(vec![record]).await?;

    engine
        .compute_range(height, height + 1, cancel, &NoCheckpoint)
        .await?;

    let commitment = L1BlockCommitment::new(height, info.hash);
    ctx.status.update_chain_status(|s| {
        s.tip = Some(commitment);
        s.checksum_height = Some(height);
    });
    ctx.status.publish(NodeEvent::NewBlock(commitment));
    debug!(height, "indexed block");

    produce_own_witness(ctx, height).await?;

    if let Some(p2p) = &ctx.p2p {
        p2p.notify_block_indexed(height).await;
    }

    {
        let mut plugins = ctx.plugins.lock().await;
        plugins
            .dispatch_hook(&HookEvent::BlockPostProcess { height })
            .await
            .ok();
        plugins
            .dispatch_hook(&HookEvent::BlockChange { height })
            .await
            .ok();
    }

    finalize_epoch_if_due(ctx, height).await?;

    Ok(IndexStep::Indexed)
}

/// Walks back from `from` until the stored hash agrees with the RPC
/// node's chain.
async fn find_fork_point<C, D>(ctx: &IndexerCtx<C, D>, from: u64) -> anyhow::Result<u64>
where
    C: L1Client + 'static,
    D: NodeDatabase + 'static,
{
    let floor = from.saturating_sub(MAX_REORG_DEPTH);
    let mut height = from;
    loop {
        let local = ctx.db.header_at(height).await?.map(|h| h.hash);
        let remote = ctx
            .client
            .get_block_hashes(height, 1)
            .await?
            .first()
            .copied()
            .flatten();
        if local.is_some() && local == remote {
            return Ok(height);
        }
        if height == floor {
            anyhow::bail!("reorg deeper than {MAX_REORG_DEPTH} blocks");
        }
        height -= 1;
    }
}

/// Blocking reorg protocol: every plugin acknowledges before any state is
/// rewound or any further block is indexed.
async fn handle_reorg<C, D>(ctx: &IndexerCtx<C, D>, fork: u64, seen_at: u64) -> anyhow::Result<()>
where
    C: L1Client + 'static,
    D: NodeDatabase + 'static,
{
    warn!(fork, seen_at, "chain reorg detected");

    ctx.plugins
        .lock()
        .await
        .dispatch_hook(&HookEvent::Reorg {
            from_block: fork + 1,
            to_block: seen_at,
            reason: "chain reorganization".into(),
        })
        .await
        .map_err(|e| anyhow::anyhow!("reorg hook aborted: {e}"))?;

    ctx.db.rewind_to(fork).await?;
    ctx.status.update_chain_status(|s| {
        s.tip = None;
        s.checksum_height = Some(fork);
    });
    Ok(())
}

/// Signs and broadcasts this node's own witness when it is a validator.
async fn produce_own_witness<C, D>(ctx: &IndexerCtx<C, D>, height: u64) -> anyhow::Result<()>
where
    C: L1Client + 'static,
    D: NodeDatabase + 'static,
{
    let Some(validator) = &ctx.validator else {
        return Ok(());
    };
    let Some(checksum_root) = ctx.db.header_at(height).await?.and_then(|h| h.checksum_root)
    else {
        return Ok(());
    };

    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let message = witness_message(height, &checksum_root);
    let witness = WitnessRecord {
        block_number: height,
        signature: dev_sign(&validator.public_key, &message),
        public_key: validator.public_key.clone(),
        timestamp,
        proofs: None,
        identity: opnet_primitives::sha256(&validator.opnet_key),
        trusted: true,
    };

    ctx.db.insert_witness(witness.clone()).await?;
    if let Some(p2p) = &ctx.p2p {
        p2p.broadcast_witness(witness).await;
    }
    Ok(())
}

/// Finalizes the epoch ending at `height`, if any.
async fn finalize_epoch_if_due<C, D>(ctx: &IndexerCtx<C, D>, height: u64) -> anyhow::Result<()>
where
    C: L1Client + 'static,
    D: NodeDatabase + 'static,
{
    let per_epoch = ctx.params.blocks_per_epoch();
    if (height + 1) % per_epoch != 0 {
        return Ok(());
    }
    let epoch = height / per_epoch;
    if ctx.db.epoch(epoch).await?.is_some_and(|e| e.finalized) {
        return Ok(());
    }

    let start = epoch * per_epoch;
    let headers = ctx.db.header_range(start, height).await?;
    if headers.len() != per_epoch as usize {
        warn!(epoch, "epoch span incomplete, deferring finalization");
        return Ok(());
    }

    let mut commitment = Buf32::zero();
    let mut identities = std::collections::BTreeSet::new();
    for header in &headers {
        let Some(root) = header.checksum_root else {
            warn!(epoch, height = header.height, "missing checksum, deferring");
            return Ok(());
        };
        commitment = hash_pair(&commitment, &root);
        for witness in ctx.db.witnesses_at(header.height).await? {
            if witness.trusted {
                identities.insert(witness.identity);
            }
        }
    }

    ctx.db
        .put_epoch(EpochRecord {
            epoch_number: epoch,
            blocks_per_epoch: per_epoch,
            witness_identities: identities.into_iter().collect(),
            commitment,
            finalized: true,
        })
        .await?;

    let epoch_commitment = EpochCommitment::new(epoch, height);
    ctx.status.update_chain_status(|s| {
        s.finalized_epoch = Some(epoch_commitment);
    });
    ctx.status.publish(NodeEvent::EpochFinalized(epoch_commitment));

    let mut plugins = ctx.plugins.lock().await;
    plugins
        .dispatch_hook(&HookEvent::EpochChange { epoch })
        .await
        .ok();
    plugins
        .dispatch_hook(&HookEvent::EpochFinalized {
            epoch,
            last_height: height,
        })
        .await
        .ok();

    info!(epoch, last_height = height, "epoch finalized");
    Ok(())
}
