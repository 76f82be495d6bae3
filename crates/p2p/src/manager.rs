//! Reusable stream bookkeeping per `(peer, protocol)`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::{mpsc, Mutex},
};
use tracing::{debug, warn};

use crate::{
    framed::{FramedStream, StreamConfig, StreamHandle},
    peer::PeerId,
    wire::ProtocolId,
    P2pError,
};

/// Stream-multiplexing transport seam. The binary wires a TCP-backed
/// implementation; tests use in-memory duplex pipes.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    type Io: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Opens a fresh outbound stream to `peer` for `protocol`.
    async fn dial(&self, peer: &PeerId, protocol: ProtocolId) -> Result<Self::Io, P2pError>;
}

/// A stream opened by the remote side, handed to the manager by the
/// transport's listener.
#[derive(Debug)]
pub struct InboundStream<T> {
    pub peer: PeerId,
    pub remote_addr: String,
    pub protocol: ProtocolId,
    pub connection_id: u64,
    pub io: T,
}

/// Map key: outbound streams are unique per `(peer, protocol)`; inbound
/// streams additionally carry the transport connection id.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct StreamKey {
    pub peer: PeerId,
    pub protocol: ProtocolId,
    pub connection_id: Option<u64>,
}

impl std::fmt::Display for StreamKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.connection_id {
            Some(conn) => write!(f, "{}::{}::{}", self.peer, self.protocol, conn),
            None => write!(f, "{}::{}", self.peer, self.protocol),
        }
    }
}

#[derive(Debug, Default)]
struct ManagerState {
    outbound: HashMap<StreamKey, StreamHandle>,
    inbound: HashMap<StreamKey, StreamHandle>,
    pending_dials: HashSet<StreamKey>,
}

/// Owns every live stream. Outbound sends reuse the existing stream and
/// redial exactly once on failure before surfacing the error.
pub struct StreamManager<T: Transport> {
    transport: Arc<T>,
    config: StreamConfig,
    state: Mutex<ManagerState>,
    deliver_tx: mpsc::Sender<(PeerId, ProtocolId, Bytes)>,
}

impl<T: Transport> std::fmt::Debug for StreamManager<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamManager").finish_non_exhaustive()
    }
}

impl<T: Transport> StreamManager<T> {
    /// Creates the manager and the receiver on which every inbound
    /// application message is delivered, tagged with its origin.
    pub fn new(
        transport: Arc<T>,
        config: StreamConfig,
    ) -> (Arc<Self>, mpsc::Receiver<(PeerId, ProtocolId, Bytes)>) {
        let (deliver_tx, deliver_rx) = mpsc::channel(1024);
        (
            Arc::new(Self {
                transport,
                config,
                state: Mutex::new(ManagerState::default()),
                deliver_tx,
            }),
            deliver_rx,
        )
    }

    /// Sends one message on the peer's reusable outbound stream, dialing
    /// it if absent. A dead stream is dropped and redialed once.
    pub async fn send_message(
        &self,
        peer: &PeerId,
        protocol: ProtocolId,
        bytes: Bytes,
    ) -> Result<(), P2pError> {
        let key = StreamKey {
            peer: peer.clone(),
            protocol,
            connection_id: None,
        };

        let mut state = self.state.lock().await;

        if let Some(handle) = state.outbound.get(&key) {
            if !handle.is_closed() {
                match handle.try_send(bytes.clone()) {
                    Ok(()) => return Ok(()),
                    Err(P2pError::StreamClosed(_)) => {
                        debug!(%key, "outbound stream died, redialing");
                    }
                    Err(e) => return Err(e),
                }
            }
            state.outbound.remove(&key);
        }

        // Single redial attempt; the lock is held, so concurrent senders
        // join this dial instead of racing their own.
        state.pending_dials.insert(key.clone());
        let dialed = self.transport.dial(peer, protocol).await;
        state.pending_dials.remove(&key);

        let io = dialed.map_err(|e| {
            warn!(%key, %e, "dial failed");
            e
        })?;
        let handle = self.adopt(key.clone(), io, false).await;
        let result = handle.try_send(bytes);
        state.outbound.insert(key, handle);
        result
    }

    /// Registers a stream the remote side opened.
    pub async fn adopt_inbound(&self, inbound: InboundStream<T::Io>) {
        let key = StreamKey {
            peer: inbound.peer,
            protocol: inbound.protocol,
            connection_id: Some(inbound.connection_id),
        };
        let handle = self.adopt(key.clone(), inbound.io, true).await;
        self.state.lock().await.inbound.insert(key, handle);
    }

    async fn adopt(&self, key: StreamKey, io: T::Io, _inbound: bool) -> StreamHandle {
        let (handle, mut rx) = FramedStream::spawn(io, self.config, key.to_string());

        // Forward inbound frames tagged with their origin.
        let deliver_tx = self.deliver_tx.clone();
        let peer = key.peer.clone();
        let protocol = key.protocol;
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if deliver_tx.send((peer.clone(), protocol, frame)).await.is_err() {
                    break;
                }
            }
        });

        handle
    }

    /// Closes and forgets every stream belonging to a peer.
    pub async fn drop_peer(&self, peer: &PeerId) {
        let mut state = self.state.lock().await;
        state.outbound.retain(|k, h| {
            if &k.peer == peer {
                h.close();
                false
            } else {
                true
            }
        });
        state.inbound.retain(|k, h| {
            if &k.peer == peer {
                h.close();
                false
            } else {
                true
            }
        });
    }

    /// Live outbound stream count, for diagnostics.
    pub async fn outbound_len(&self) -> usize {
        self.state.lock().await.outbound.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use opnet_primitives::Buf32;
    use parking_lot::Mutex as SyncMutex;
    use tokio::io::DuplexStream;

    use super::*;

    /// Transport over in-memory pipes; remote ends are captured for
    /// inspection.
    struct DuplexTransport {
        dials: AtomicUsize,
        remotes: SyncMutex<Vec<(ProtocolId, StreamHandle, mpsc::Receiver<Bytes>)>>,
    }

    impl DuplexTransport {
        fn new() -> Self {
            Self {
                dials: AtomicUsize::new(0),
                remotes: SyncMutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Transport for DuplexTransport {
        type Io = DuplexStream;

        async fn dial(&self, _peer: &PeerId, protocol: ProtocolId) -> Result<Self::Io, P2pError> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            let (local, remote) = tokio::io::duplex(64 * 1024);
            let (handle, rx) =
                FramedStream::spawn(remote, StreamConfig::default(), "remote".into());
            self.remotes.lock().push((protocol, handle, rx));
            Ok(local)
        }
    }

    fn peer(tag: u8) -> PeerId {
        PeerId::new(Buf32::new([tag; 32]))
    }

    #[tokio::test]
    async fn test_outbound_stream_is_reused() {
        let transport = Arc::new(DuplexTransport::new());
        let (manager, _rx) = StreamManager::new(transport.clone(), StreamConfig::default());
        let p = peer(1);

        manager
            .send_message(&p, ProtocolId::Witness, Bytes::from_static(b"one"))
            .await
            .unwrap();
        manager
            .send_message(&p, ProtocolId::Witness, Bytes::from_static(b"two"))
            .await
            .unwrap();

        assert_eq!(transport.dials.load(Ordering::SeqCst), 1);

        let mut remotes = transport.remotes.lock();
        let (_, _, rx) = &mut remotes[0];
        assert_eq!(&rx.recv().await.unwrap()[..], b"one");
        assert_eq!(&rx.recv().await.unwrap()[..], b"two");
    }

    #[tokio::test]
    async fn test_distinct_protocols_get_distinct_streams() {
        let transport = Arc::new(DuplexTransport::new());
        let (manager, _rx) = StreamManager::new(transport.clone(), StreamConfig::default());
        let p = peer(1);

        manager
            .send_message(&p, ProtocolId::Witness, Bytes::from_static(b"w"))
            .await
            .unwrap();
        manager
            .send_message(&p, ProtocolId::Mempool, Bytes::from_static(b"m"))
            .await
            .unwrap();

        assert_eq!(transport.dials.load(Ordering::SeqCst), 2);
        assert_eq!(manager.outbound_len().await, 2);
    }

    #[tokio::test]
    async fn test_dead_stream_redialed_once() {
        let transport = Arc::new(DuplexTransport::new());
        let (manager, _rx) = StreamManager::new(transport.clone(), StreamConfig::default());
        let p = peer(2);

        manager
            .send_message(&p, ProtocolId::Witness, Bytes::from_static(b"one"))
            .await
            .unwrap();

        // Kill the remote side so the local stream task exits.
        {
            let mut remotes = transport.remotes.lock();
            let (_, handle, _) = &mut remotes[0];
            handle.close();
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        manager
            .send_message(&p, ProtocolId::Witness, Bytes::from_static(b"two"))
            .await
            .unwrap();
        assert_eq!(transport.dials.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_inbound_messages_are_tagged() {
        let transport = Arc::new(DuplexTransport::new());
        let (manager, mut rx) = StreamManager::new(transport.clone(), StreamConfig::default());

        let (local, remote) = tokio::io::duplex(64 * 1024);
        manager
            .adopt_inbound(InboundStream {
                peer: peer(9),
                remote_addr: "10.0.0.9:0".into(),
                protocol: ProtocolId::Mempool,
                connection_id: 4,
                io: local,
            })
            .await;

        let (remote_handle, _remote_rx) =
            FramedStream::spawn(remote, StreamConfig::default(), "remote".into());
        remote_handle.try_send(Bytes::from_static(b"tx")).unwrap();

        let (from, protocol, frame) = rx.recv().await.unwrap();
        assert_eq!(from, peer(9));
        assert_eq!(protocol, ProtocolId::Mempool);
        assert_eq!(&frame[..], b"tx");
    }
}
