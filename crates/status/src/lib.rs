//! Node status broadcasting.
//!
//! One `StatusChannel` is created at startup and shared by every
//! subsystem: the sync pipeline and steady-state indexer publish, the
//! WebSocket fan-out, plugin hooks and RPC read.

use opnet_primitives::{Buf32, EpochCommitment, L1BlockCommitment};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};

/// Capacity of the event fan-out. Slow consumers observe `Lagged` rather
/// than blocking publishers.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Where the node currently stands relative to the chain.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainSyncStatus {
    /// Best header the node has stored.
    pub tip: Option<L1BlockCommitment>,
    /// Highest height with a computed checksum chain.
    pub checksum_height: Option<u64>,
    /// Latest finalized epoch.
    pub finalized_epoch: Option<EpochCommitment>,
}

/// Events fanned out to subscribers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NodeEvent {
    NewBlock(L1BlockCommitment),
    EpochFinalized(EpochCommitment),
    MempoolTx(Buf32),
}

/// Cloneable status hub.
#[derive(Debug, Clone)]
pub struct StatusChannel {
    chain_tx: watch::Sender<ChainSyncStatus>,
    event_tx: broadcast::Sender<NodeEvent>,
}

impl StatusChannel {
    pub fn new() -> Self {
        let (chain_tx, _) = watch::channel(ChainSyncStatus::default());
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { chain_tx, event_tx }
    }

    pub fn chain_status(&self) -> ChainSyncStatus {
        *self.chain_tx.borrow()
    }

    pub fn watch_chain_status(&self) -> watch::Receiver<ChainSyncStatus> {
        self.chain_tx.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<NodeEvent> {
        self.event_tx.subscribe()
    }

    /// Updates the chain status in place.
    pub fn update_chain_status(&self, f: impl FnOnce(&mut ChainSyncStatus)) {
        self.chain_tx.send_modify(f);
    }

    /// Publishes an event. Dropped silently when nobody listens.
    pub fn publish(&self, event: NodeEvent) {
        let _ = self.event_tx.send(event);
    }
}

impl Default for StatusChannel {
    fn default() -> Self {
        Self::new()
    }
}
