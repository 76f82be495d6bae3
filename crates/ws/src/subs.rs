//! Subscription bookkeeping and notification fan-out.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;
use prost::Message;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use opnet_status::NodeEvent;

use crate::{
    opcodes::Opcode,
    proto,
    session::OutFrame,
};

/// Server-assigned client identifier.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct ClientId(pub u64);

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "client:{}", self.0)
    }
}

/// Subscription topics.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum Topic {
    Blocks,
    Epochs,
    Mempool,
}

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Blocks => "blocks",
            Self::Epochs => "epochs",
            Self::Mempool => "mempool",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "blocks" => Some(Self::Blocks),
            "epochs" => Some(Self::Epochs),
            "mempool" => Some(Self::Mempool),
            _ => None,
        }
    }
}

/// What the writer task receives.
#[derive(Debug)]
pub enum WriterMsg {
    Frame(Vec<u8>),
    Close(u16),
}

/// Byte-accounted outbound queue for one client. Responses wait for
/// capacity; notifications are dropped when the client is saturated.
#[derive(Clone, Debug)]
pub struct ClientSink {
    tx: mpsc::Sender<WriterMsg>,
    buffered: Arc<AtomicUsize>,
    max_backpressure: usize,
}

impl ClientSink {
    pub fn new(tx: mpsc::Sender<WriterMsg>, max_backpressure: usize) -> Self {
        Self {
            tx,
            buffered: Arc::new(AtomicUsize::new(0)),
            max_backpressure,
        }
    }

    pub fn buffered(&self) -> usize {
        self.buffered.load(Ordering::SeqCst)
    }

    pub fn is_saturated(&self) -> bool {
        self.buffered() >= self.max_backpressure
    }

    /// Queues a response frame, waiting for channel capacity.
    pub async fn send(&self, frame: Vec<u8>) -> bool {
        let len = frame.len();
        self.buffered.fetch_add(len, Ordering::SeqCst);
        if self.tx.send(WriterMsg::Frame(frame)).await.is_err() {
            self.buffered.fetch_sub(len, Ordering::SeqCst);
            return false;
        }
        true
    }

    /// Best-effort notification. Returns `false` when skipped because the
    /// client's buffer is saturated or the queue is full.
    pub fn try_notify(&self, frame: Vec<u8>) -> bool {
        let len = frame.len();
        if self.buffered() + len > self.max_backpressure {
            return false;
        }
        self.buffered.fetch_add(len, Ordering::SeqCst);
        if self.tx.try_send(WriterMsg::Frame(frame)).is_err() {
            self.buffered.fetch_sub(len, Ordering::SeqCst);
            return false;
        }
        true
    }

    /// Requests a close frame.
    pub async fn close(&self, code: u16) {
        let _ = self.tx.send(WriterMsg::Close(code)).await;
    }

    /// Called by the writer after a frame is flushed; works as the drain
    /// signal that un-saturates the client.
    pub fn mark_written(&self, len: usize) {
        self.buffered.fetch_sub(len, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct SubsInner {
    topics: HashMap<Topic, HashSet<ClientId>>,
    sinks: HashMap<ClientId, ClientSink>,
}

/// Per-topic subscriber sets keyed by client id.
#[derive(Default)]
pub struct SubscriptionManager {
    inner: Mutex<SubsInner>,
}

impl std::fmt::Debug for SubscriptionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionManager").finish_non_exhaustive()
    }
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_client(&self, id: ClientId, sink: ClientSink) {
        self.inner.lock().sinks.insert(id, sink);
    }

    /// Forgets the client and every subscription it held.
    pub fn unregister_client(&self, id: ClientId) {
        let mut inner = self.inner.lock();
        inner.sinks.remove(&id);
        for subscribers in inner.topics.values_mut() {
            subscribers.remove(&id);
        }
    }

    pub fn subscribe(&self, id: ClientId, topic: Topic) {
        self.inner.lock().topics.entry(topic).or_default().insert(id);
    }

    pub fn unsubscribe(&self, id: ClientId, topic: Topic) {
        if let Some(subscribers) = self.inner.lock().topics.get_mut(&topic) {
            subscribers.remove(&id);
        }
    }

    pub fn is_subscribed(&self, id: ClientId, topic: Topic) -> bool {
        self.inner
            .lock()
            .topics
            .get(&topic)
            .is_some_and(|s| s.contains(&id))
    }

    /// Builds the notification frame once and fans it out to every
    /// subscriber whose buffer has room. Returns the delivery count.
    pub fn fan_out(&self, event: &NodeEvent) -> usize {
        let (topic, frame) = match event {
            NodeEvent::NewBlock(block) => (
                Topic::Blocks,
                OutFrame::new(
                    Opcode::NewBlockNotification,
                    proto::NewBlockNotification {
                        height: block.height(),
                        hash: format!("{:?}", block.blkid()),
                    }
                    .encode_to_vec(),
                ),
            ),
            NodeEvent::EpochFinalized(epoch) => (
                Topic::Epochs,
                OutFrame::new(
                    Opcode::EpochFinalizedNotification,
                    proto::EpochFinalizedNotification {
                        epoch_number: epoch.epoch(),
                        last_height: epoch.last_height(),
                    }
                    .encode_to_vec(),
                ),
            ),
            NodeEvent::MempoolTx(id) => (
                Topic::Mempool,
                OutFrame::new(
                    Opcode::MempoolTxNotification,
                    proto::MempoolTxNotification {
                        id: format!("{id:?}"),
                    }
                    .encode_to_vec(),
                ),
            ),
        };

        let encoded = frame.encode();
        let inner = self.inner.lock();
        let Some(subscribers) = inner.topics.get(&topic) else {
            return 0;
        };

        let mut delivered = 0;
        for client in subscribers {
            let Some(sink) = inner.sinks.get(client) else {
                continue;
            };
            if sink.try_notify(encoded.clone()) {
                delivered += 1;
            } else {
                trace!(%client, "skipping saturated subscriber");
            }
        }
        delivered
    }
}

/// Bridges node events into subscriber notifications until cancelled.
pub async fn notification_task(
    subs: Arc<SubscriptionManager>,
    mut events: broadcast::Receiver<NodeEvent>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => match event {
                Ok(event) => {
                    let delivered = subs.fan_out(&event);
                    debug!(?event, delivered, "notification fan-out");
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!(lagged = n, "notification stream lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}
