//! Peer sessions: identify, authentication gating, message dispatch.

use std::{
    collections::HashMap,
    fmt,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use opnet_db::{HeaderDatabase, WitnessDatabase, WitnessRecord};
use opnet_primitives::{Buf32, Params};
use rand::{rngs::OsRng, RngCore};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    blacklist::{Blacklist, BlacklistConfig, BlacklistKey},
    gossip::{InboundWitness, WitnessGossip},
    manager::{StreamManager, Transport},
    mempool::{MempoolRelay, TxVerifier, KNOWN_IDS_CLEAR_INTERVAL},
    wire::{DisconnectReason, IdentifyInfo, IndexerMode, P2pMessage, ProtocolId},
    InboundStream, P2pError,
};

/// Stable peer identity: hash of the peer's long-term key.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct PeerId(Buf32);

impl PeerId {
    pub fn new(id: Buf32) -> Self {
        Self(id)
    }

    pub fn inner(&self) -> &Buf32 {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer:{}", self.0)
    }
}

/// Application-level authentication seam. Concrete signatures live outside
/// this crate.
pub trait PeerAuthenticator: Send + Sync {
    /// Identify info this node advertises.
    fn local_info(&self) -> IdentifyInfo;

    /// Signs a remote challenge with the local identity key. Returns
    /// `(identity_key, signature)`.
    fn sign_challenge(&self, nonce: &[u8; 32]) -> (Vec<u8>, Vec<u8>);

    /// Verifies a peer's answer to our challenge.
    fn verify_challenge(&self, identity_key: &[u8], nonce: &[u8; 32], signature: &[u8]) -> bool;
}

/// Session state for one connected peer.
#[derive(Clone, Debug)]
pub struct PeerInfo {
    pub id: PeerId,
    pub remote_addr: String,
    pub agent: String,
    pub protocol_version: u16,
    pub mode: IndexerMode,
    pub identity: Buf32,
    pub handshake_done: bool,
    pub authenticated: bool,
    pub disconnect_attempts: u32,
}

#[derive(Debug)]
struct PeerState {
    info: PeerInfo,
    /// Challenge we issued and still expect an answer to.
    pending_nonce: Option<[u8; 32]>,
    /// Unsolicited/out-of-range witness strikes.
    bad_witness_strikes: u32,
}

/// Events pushed by the transport listener.
#[derive(Debug)]
pub enum PeerEvent<Io> {
    Connected { peer: PeerId, addr: String },
    InboundStream(InboundStream<Io>),
    Disconnected { peer: PeerId },
}

/// Snapshot for diagnostics and tests.
#[derive(Debug, Clone)]
pub struct PeerSnapshot {
    pub connected: Vec<PeerInfo>,
    pub blacklist_len: usize,
}

enum PeerCommand {
    BroadcastWitness(WitnessRecord),
    RequestWitnesses {
        block_number: u64,
        reply: oneshot::Sender<Vec<WitnessRecord>>,
    },
    /// Block `h` finished indexing: solicit witnesses for `h-1` and `h`.
    NotifyBlockIndexed(u64),
    BroadcastMempoolTx {
        id: Buf32,
        raw: Vec<u8>,
    },
    Disconnect {
        peer: PeerId,
        reason: DisconnectReason,
    },
    Snapshot(oneshot::Sender<PeerSnapshot>),
}

enum InternalEvent {
    WitnessCollectDone(u64),
}

/// Manager tuning.
#[derive(Clone, Copy, Debug)]
pub struct PeerManagerConfig {
    /// How long a witness request collects responses before replying.
    pub witness_request_window: Duration,
    /// Blacklist sweep cadence.
    pub sweep_interval: Duration,
    /// Witness strikes before a peer is treated as misbehaving.
    pub max_witness_strikes: u32,
}

impl Default for PeerManagerConfig {
    fn default() -> Self {
        Self {
            witness_request_window: Duration::from_millis(500),
            sweep_interval: Duration::from_secs(60),
            max_witness_strikes: 3,
        }
    }
}

/// Cloneable handle other subsystems talk to the P2P loop through.
#[derive(Clone, Debug)]
pub struct PeerManagerHandle {
    cmd_tx: mpsc::Sender<PeerCommand>,
}

impl PeerManagerHandle {
    pub async fn broadcast_witness(&self, witness: WitnessRecord) {
        let _ = self.cmd_tx.send(PeerCommand::BroadcastWitness(witness)).await;
    }

    pub async fn broadcast_mempool_tx(&self, id: Buf32, raw: Vec<u8>) {
        let _ = self
            .cmd_tx
            .send(PeerCommand::BroadcastMempoolTx { id, raw })
            .await;
    }

    pub async fn notify_block_indexed(&self, height: u64) {
        let _ = self
            .cmd_tx
            .send(PeerCommand::NotifyBlockIndexed(height))
            .await;
    }

    /// Requests witnesses for a block from every authenticated non-light
    /// peer, collecting answers for the configured window.
    pub async fn request_witnesses(&self, block_number: u64) -> Result<Vec<WitnessRecord>, P2pError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(PeerCommand::RequestWitnesses {
                block_number,
                reply,
            })
            .await
            .map_err(|_| P2pError::StreamClosed("peer manager".into()))?;
        rx.await
            .map_err(|_| P2pError::StreamClosed("peer manager".into()))
    }

    pub async fn disconnect_peer(&self, peer: PeerId, reason: DisconnectReason) {
        let _ = self.cmd_tx.send(PeerCommand::Disconnect { peer, reason }).await;
    }

    pub async fn snapshot(&self) -> Option<PeerSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx.send(PeerCommand::Snapshot(tx)).await.ok()?;
        rx.await.ok()
    }
}

#[async_trait]
impl opnet_sync::WitnessProvider for PeerManagerHandle {
    async fn request_witnesses(
        &self,
        block_number: u64,
    ) -> Result<Vec<WitnessRecord>, opnet_sync::SyncError> {
        PeerManagerHandle::request_witnesses(self, block_number)
            .await
            .map_err(|e| opnet_sync::SyncError::WitnessTransport(e.to_string()))
    }
}

struct WitnessCollect {
    collected: Vec<WitnessRecord>,
    replies: Vec<oneshot::Sender<Vec<WitnessRecord>>>,
}

/// The P2P event loop. Owns peer sessions, the blacklist, the mempool
/// de-dup set and witness gossip.
pub struct PeerManager<T: Transport, D> {
    streams: Arc<StreamManager<T>>,
    deliver_rx: mpsc::Receiver<(PeerId, ProtocolId, Bytes)>,
    events_rx: mpsc::Receiver<PeerEvent<T::Io>>,
    cmd_rx: mpsc::Receiver<PeerCommand>,
    internal_tx: mpsc::Sender<InternalEvent>,
    internal_rx: mpsc::Receiver<InternalEvent>,

    peers: HashMap<PeerId, PeerState>,
    blacklist: Blacklist,
    relay: Arc<MempoolRelay>,
    gossip: WitnessGossip<D>,
    authenticator: Arc<dyn PeerAuthenticator>,
    tx_verifier: Arc<dyn TxVerifier>,
    params: Arc<Params>,
    config: PeerManagerConfig,
    pending_witness: HashMap<u64, WitnessCollect>,
}

impl<T, D> PeerManager<T, D>
where
    T: Transport,
    D: HeaderDatabase + WitnessDatabase + 'static,
{
    #[allow(clippy::too_many_arguments, reason = "wired once in the binary")]
    pub fn new(
        streams: Arc<StreamManager<T>>,
        deliver_rx: mpsc::Receiver<(PeerId, ProtocolId, Bytes)>,
        db: Arc<D>,
        authority: Arc<opnet_authority::AuthorityManager>,
        authenticator: Arc<dyn PeerAuthenticator>,
        tx_verifier: Arc<dyn TxVerifier>,
        params: Arc<Params>,
        config: PeerManagerConfig,
        blacklist_config: BlacklistConfig,
    ) -> (Self, PeerManagerHandle, mpsc::Sender<PeerEvent<T::Io>>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let (events_tx, events_rx) = mpsc::channel(256);
        let (internal_tx, internal_rx) = mpsc::channel(64);
        let min_witnesses = params.min_witnesses();

        let manager = Self {
            streams,
            deliver_rx,
            events_rx,
            cmd_rx,
            internal_tx,
            internal_rx,
            peers: HashMap::new(),
            blacklist: Blacklist::new(blacklist_config),
            relay: Arc::new(MempoolRelay::new()),
            gossip: WitnessGossip::new(db, authority, min_witnesses),
            authenticator,
            tx_verifier,
            params,
            config,
            pending_witness: HashMap::new(),
        };

        (manager, PeerManagerHandle { cmd_tx }, events_tx)
    }

    /// Runs until cancelled.
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut sweep = tokio::time::interval(self.config.sweep_interval);
        let mut mempool_clear = tokio::time::interval(KNOWN_IDS_CLEAR_INTERVAL);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("p2p manager shutting down");
                    break;
                }
                Some(event) = self.events_rx.recv() => self.handle_event(event).await,
                Some((peer, protocol, frame)) = self.deliver_rx.recv() => {
                    self.handle_frame(peer, protocol, frame).await;
                }
                Some(cmd) = self.cmd_rx.recv() => self.handle_command(cmd).await,
                Some(internal) = self.internal_rx.recv() => self.handle_internal(internal),
                _ = sweep.tick() => self.blacklist.sweep(),
                _ = mempool_clear.tick() => self.relay.clear(),
            }
        }
    }

    async fn handle_event(&mut self, event: PeerEvent<T::Io>) {
        match event {
            PeerEvent::Connected { peer, addr } => self.handle_connected(peer, addr).await,
            PeerEvent::InboundStream(inbound) => {
                let gate = BlacklistKey::Peer(inbound.peer.clone());
                let addr_gate = BlacklistKey::Address(strip_port(&inbound.remote_addr));
                if self.blacklist.is_blacklisted(&gate) || self.blacklist.is_blacklisted(&addr_gate)
                {
                    debug!(peer = %inbound.peer, "dropping stream from blacklisted peer");
                    return;
                }
                self.streams.adopt_inbound(inbound).await;
            }
            PeerEvent::Disconnected { peer } => {
                self.peers.remove(&peer);
                self.streams.drop_peer(&peer).await;
            }
        }
    }

    async fn handle_connected(&mut self, peer: PeerId, addr: String) {
        // Capacity circuit-breaker: flood-drop without session setup.
        if self.blacklist.over_capacity() {
            warn!(%peer, "blacklist over capacity, flood-dropping connection");
            return;
        }
        if self
            .blacklist
            .is_blacklisted(&BlacklistKey::Peer(peer.clone()))
            || self
                .blacklist
                .is_blacklisted(&BlacklistKey::Address(strip_port(&addr)))
        {
            debug!(%peer, %addr, "rejecting blacklisted peer");
            return;
        }

        let mut nonce = [0u8; 32];
        OsRng.fill_bytes(&mut nonce);

        self.peers.insert(
            peer.clone(),
            PeerState {
                info: PeerInfo {
                    id: peer.clone(),
                    remote_addr: addr,
                    agent: String::new(),
                    protocol_version: 0,
                    mode: IndexerMode::Full,
                    identity: Buf32::zero(),
                    handshake_done: false,
                    authenticated: false,
                    disconnect_attempts: 0,
                },
                pending_nonce: Some(nonce),
                bad_witness_strikes: 0,
            },
        );

        self.send_to(&peer, ProtocolId::Session, &P2pMessage::AuthChallenge { nonce })
            .await;
    }

    async fn handle_frame(&mut self, peer: PeerId, protocol: ProtocolId, frame: Bytes) {
        let message = match P2pMessage::decode(&frame) {
            Ok(m) => m,
            Err(e) => {
                warn!(%peer, %e, "malformed frame");
                self.disconnect(&peer, DisconnectReason::ProtocolViolation).await;
                return;
            }
        };

        match (protocol, message) {
            (ProtocolId::Session, msg) => self.handle_session_message(peer, msg).await,
            // Everything else is authenticated-only.
            (_, msg) => {
                if !self.is_authenticated(&peer) {
                    warn!(%peer, "message before authentication");
                    self.disconnect(&peer, DisconnectReason::ProtocolViolation).await;
                    return;
                }
                match (protocol, msg) {
                    (ProtocolId::Witness, msg) => self.handle_witness_message(peer, msg).await,
                    (ProtocolId::Mempool, P2pMessage::MempoolTx { id, raw }) => {
                        self.handle_mempool_tx(peer, id, raw).await;
                    }
                    (ProtocolId::Discovery, P2pMessage::DiscoveryRequest) => {
                        let addrs = self
                            .peers
                            .values()
                            .filter(|p| p.info.authenticated)
                            .map(|p| p.info.remote_addr.clone())
                            .collect();
                        self.send_to(&peer, ProtocolId::Discovery, &P2pMessage::DiscoveryResponse { addrs })
                            .await;
                    }
                    (ProtocolId::Discovery, P2pMessage::DiscoveryResponse { addrs }) => {
                        debug!(%peer, count = addrs.len(), "peer discovery answer");
                    }
                    (protocol, _) => {
                        warn!(%peer, %protocol, "unexpected message for protocol");
                        self.disconnect(&peer, DisconnectReason::ProtocolViolation).await;
                    }
                }
            }
        }
    }

    async fn handle_session_message(&mut self, peer: PeerId, msg: P2pMessage) {
        match msg {
            P2pMessage::AuthChallenge { nonce } => {
                // We are the connecting side: answer with our identity.
                let (identity_key, signature) = self.authenticator.sign_challenge(&nonce);
                let info = self.authenticator.local_info();
                self.send_to(
                    &peer,
                    ProtocolId::Session,
                    &P2pMessage::AuthResponse {
                        info,
                        identity_key,
                        signature,
                    },
                )
                .await;
            }
            P2pMessage::AuthResponse {
                info,
                identity_key,
                signature,
            } => self.handle_auth_response(peer, info, identity_key, signature).await,
            P2pMessage::AuthAck { info } => {
                if let Some(state) = self.peers.get_mut(&peer) {
                    state.info.agent = info.agent;
                    state.info.handshake_done = true;
                    state.info.authenticated = true;
                    info!(%peer, "outbound session authenticated");
                }
            }
            P2pMessage::Disconnect { reason } => {
                debug!(%peer, ?reason, "peer disconnected us");
                self.peers.remove(&peer);
                self.streams.drop_peer(&peer).await;
            }
            _ => {
                self.disconnect(&peer, DisconnectReason::ProtocolViolation).await;
            }
        }
    }

    async fn handle_auth_response(
        &mut self,
        peer: PeerId,
        info: IdentifyInfo,
        identity_key: Vec<u8>,
        signature: Vec<u8>,
    ) {
        let Some(state) = self.peers.get_mut(&peer) else {
            return;
        };
        let Some(nonce) = state.pending_nonce.take() else {
            self.disconnect(&peer, DisconnectReason::ProtocolViolation).await;
            return;
        };

        // Wrong chain or network is a permanent offence.
        if info.chain_id != self.params.chain_id()
            || info.network != self.params.network().to_string()
        {
            warn!(%peer, chain = info.chain_id, network = %info.network, "peer on different chain");
            self.disconnect(&peer, DisconnectReason::InvalidChain).await;
            return;
        }

        if info.protocol_version < self.params.protocol_version_min()
            || info.protocol_version > self.params.protocol_version_max()
        {
            self.disconnect(&peer, DisconnectReason::ProtocolViolation).await;
            return;
        }

        if !self
            .authenticator
            .verify_challenge(&identity_key, &nonce, &signature)
        {
            warn!(%peer, "challenge verification failed");
            self.disconnect(&peer, DisconnectReason::AuthenticationFailed).await;
            return;
        }

        let state = self.peers.get_mut(&peer).expect("peer state present");
        state.info.agent = info.agent.clone();
        state.info.protocol_version = info.protocol_version;
        state.info.mode = info.mode;
        state.info.identity = info.identity;
        state.info.handshake_done = true;
        state.info.authenticated = true;
        info!(%peer, agent = %info.agent, "peer authenticated");

        let local = self.authenticator.local_info();
        self.send_to(&peer, ProtocolId::Session, &P2pMessage::AuthAck { info: local })
            .await;
    }

    async fn handle_witness_message(&mut self, peer: PeerId, msg: P2pMessage) {
        match msg {
            P2pMessage::WitnessRequest { block_number } => {
                match self.gossip.serve_request(block_number).await {
                    Ok(witnesses) => {
                        self.send_to(
                            &peer,
                            ProtocolId::Witness,
                            &P2pMessage::WitnessResponse {
                                block_number,
                                witnesses,
                            },
                        )
                        .await;
                    }
                    Err(e) => warn!(%peer, %e, "failed to serve witness request"),
                }
            }
            P2pMessage::WitnessResponse {
                block_number,
                witnesses,
            } => {
                if let Some(collect) = self.pending_witness.get_mut(&block_number) {
                    collect.collected.extend(witnesses);
                } else {
                    for witness in witnesses {
                        self.process_witness_from(&peer, witness).await;
                    }
                }
            }
            P2pMessage::BlockWitness(witness) => {
                self.process_witness_from(&peer, witness).await;
            }
            _ => {
                self.disconnect(&peer, DisconnectReason::ProtocolViolation).await;
            }
        }
    }

    async fn process_witness_from(&mut self, peer: &PeerId, witness: WitnessRecord) {
        match self.gossip.process_inbound(witness).await {
            Ok(InboundWitness::Stored { complete }) => {
                if complete {
                    debug!(%peer, "block witness-complete");
                }
            }
            Ok(InboundWitness::Duplicate) => {}
            Ok(InboundWitness::UnknownBlock) => {
                let strikes = {
                    let Some(state) = self.peers.get_mut(peer) else {
                        return;
                    };
                    state.bad_witness_strikes += 1;
                    state.bad_witness_strikes
                };
                if strikes >= self.config.max_witness_strikes {
                    self.disconnect(peer, DisconnectReason::BadBehavior).await;
                }
            }
            Ok(InboundWitness::InvalidSignature) => {
                // Forged witnesses are unforgivable.
                self.disconnect(peer, DisconnectReason::BadSignature).await;
            }
            Err(e) => warn!(%peer, %e, "witness processing failed"),
        }
    }

    async fn handle_mempool_tx(&mut self, peer: PeerId, id: Buf32, raw: Vec<u8>) {
        let Some(rebroadcast) = self
            .relay
            .process_inbound(self.tx_verifier.as_ref(), id, &raw)
            .await
        else {
            return;
        };

        let bytes = Bytes::from(P2pMessage::MempoolTx { id: rebroadcast, raw }.encode());
        let targets: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|(other, s)| **other != peer && s.info.authenticated)
            .map(|(other, _)| other.clone())
            .collect();
        for target in targets {
            if let Err(e) = self
                .streams
                .send_message(&target, ProtocolId::Mempool, bytes.clone())
                .await
            {
                debug!(peer = %target, %e, "mempool rebroadcast failed");
            }
        }
    }

    async fn handle_command(&mut self, cmd: PeerCommand) {
        match cmd {
            PeerCommand::BroadcastWitness(witness) => {
                // Serialized once; identical bytes to every peer.
                let bytes = WitnessGossip::<D>::encode_broadcast(&witness);
                let targets = self.authenticated_peers(true);
                for target in targets {
                    if let Err(e) = self
                        .streams
                        .send_message(&target, ProtocolId::Witness, bytes.clone())
                        .await
                    {
                        debug!(peer = %target, %e, "witness broadcast failed");
                    }
                }
            }
            PeerCommand::RequestWitnesses {
                block_number,
                reply,
            } => {
                let entry = self
                    .pending_witness
                    .entry(block_number)
                    .or_insert_with(|| WitnessCollect {
                        collected: Vec::new(),
                        replies: Vec::new(),
                    });
                entry.replies.push(reply);

                self.solicit_witnesses(block_number).await;

                let internal = self.internal_tx.clone();
                let window = self.config.witness_request_window;
                tokio::spawn(async move {
                    tokio::time::sleep(window).await;
                    let _ = internal
                        .send(InternalEvent::WitnessCollectDone(block_number))
                        .await;
                });
            }
            PeerCommand::NotifyBlockIndexed(height) => {
                // Ask for the freshly indexed block and its predecessor.
                if let Some(prev) = height.checked_sub(1) {
                    self.solicit_witnesses(prev).await;
                }
                self.solicit_witnesses(height).await;
            }
            PeerCommand::BroadcastMempoolTx { id, raw } => {
                if self.relay.mark_known(id) {
                    let bytes = Bytes::from(P2pMessage::MempoolTx { id, raw }.encode());
                    let targets = self.authenticated_peers(true);
                    for target in targets {
                        let _ = self
                            .streams
                            .send_message(&target, ProtocolId::Mempool, bytes.clone())
                            .await;
                    }
                }
            }
            PeerCommand::Disconnect { peer, reason } => self.disconnect(&peer, reason).await,
            PeerCommand::Snapshot(tx) => {
                let _ = tx.send(PeerSnapshot {
                    connected: self.peers.values().map(|s| s.info.clone()).collect(),
                    blacklist_len: self.blacklist.len(),
                });
            }
        }
    }

    fn handle_internal(&mut self, event: InternalEvent) {
        match event {
            InternalEvent::WitnessCollectDone(block_number) => {
                if let Some(collect) = self.pending_witness.remove(&block_number) {
                    for reply in collect.replies {
                        let _ = reply.send(collect.collected.clone());
                    }
                }
            }
        }
    }

    /// Sends a witness request to every authenticated non-light peer.
    async fn solicit_witnesses(&mut self, block_number: u64) {
        let bytes = Bytes::from(P2pMessage::WitnessRequest { block_number }.encode());
        let targets = self.authenticated_peers(false);
        for target in targets {
            if let Err(e) = self
                .streams
                .send_message(&target, ProtocolId::Witness, bytes.clone())
                .await
            {
                debug!(peer = %target, %e, "witness request failed");
            }
        }
    }

    /// Authenticated peers; optionally including light nodes.
    fn authenticated_peers(&self, include_light: bool) -> Vec<PeerId> {
        self.peers
            .iter()
            .filter(|(_, s)| {
                s.info.authenticated && (include_light || s.info.mode == IndexerMode::Full)
            })
            .map(|(id, _)| id.clone())
            .collect()
    }

    fn is_authenticated(&self, peer: &PeerId) -> bool {
        self.peers
            .get(peer)
            .is_some_and(|s| s.info.authenticated)
    }

    async fn send_to(&self, peer: &PeerId, protocol: ProtocolId, msg: &P2pMessage) {
        let bytes = Bytes::from(msg.encode());
        if let Err(e) = self.streams.send_message(peer, protocol, bytes).await {
            debug!(%peer, %protocol, %e, "send failed");
        }
    }

    /// Disconnects a peer, blacklisting per the reason: permanent reasons
    /// and failed authentication blacklist the id and the host address.
    async fn disconnect(&mut self, peer: &PeerId, reason: DisconnectReason) {
        self.send_to(peer, ProtocolId::Session, &P2pMessage::Disconnect { reason })
            .await;

        let addr = self.peers.remove(peer).map(|s| s.info.remote_addr);
        self.streams.drop_peer(peer).await;

        if reason.is_permanent() || reason == DisconnectReason::AuthenticationFailed {
            self.blacklist
                .report(BlacklistKey::Peer(peer.clone()), reason);
            if let Some(addr) = addr {
                self.blacklist
                    .report(BlacklistKey::Address(strip_port(&addr)), reason);
            }
        }
        info!(%peer, ?reason, "peer disconnected");
    }
}

/// Blacklist addresses by host, not by ephemeral port.
fn strip_port(addr: &str) -> String {
    match addr.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host.to_string(),
        _ => addr.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use opnet_authority::{AuthorityKeySet, SignatureVerifier, TrustedEntity, TrustedKey};
    use opnet_db::MemDb;
    use opnet_primitives::{sha256, NetworkId};
    use parking_lot::Mutex as SyncMutex;
    use tokio::io::DuplexStream;

    use super::*;
    use crate::framed::{FramedStream, StreamConfig, StreamHandle};

    struct DuplexTransport {
        dials: AtomicUsize,
        remotes: SyncMutex<HashMap<(PeerId, ProtocolId), (StreamHandle, mpsc::Receiver<Bytes>)>>,
    }

    impl DuplexTransport {
        fn new() -> Self {
            Self {
                dials: AtomicUsize::new(0),
                remotes: SyncMutex::new(HashMap::new()),
            }
        }

        fn remote_recv(
            &self,
            peer: &PeerId,
            protocol: ProtocolId,
        ) -> Option<(StreamHandle, mpsc::Receiver<Bytes>)> {
            self.remotes.lock().remove(&(peer.clone(), protocol))
        }
    }

    #[async_trait]
    impl Transport for DuplexTransport {
        type Io = DuplexStream;

        async fn dial(&self, peer: &PeerId, protocol: ProtocolId) -> Result<Self::Io, P2pError> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            let (local, remote) = tokio::io::duplex(256 * 1024);
            let (handle, rx) = FramedStream::spawn(remote, StreamConfig::default(), "remote".into());
            self.remotes.lock().insert((peer.clone(), protocol), (handle, rx));
            Ok(local)
        }
    }

    #[derive(Debug, Default)]
    struct StubSigVerifier;

    impl SignatureVerifier for StubSigVerifier {
        fn verify(&self, message: &[u8], signature: &[u8], public_key: &[u8]) -> bool {
            let mut expect = message.to_vec();
            expect.extend_from_slice(public_key);
            signature == expect
        }
    }

    fn test_authority() -> Arc<opnet_authority::AuthorityManager> {
        let key = {
            let public_key = vec![1u8; 8];
            let opnet_key = vec![101u8; 8];
            let mut self_signature = public_key.clone();
            self_signature.extend_from_slice(&opnet_key);
            TrustedKey {
                public_key,
                opnet_key,
                self_signature,
            }
        };
        let set = AuthorityKeySet::load(
            1,
            0,
            NetworkId::Regtest,
            vec![TrustedEntity {
                name: "alpha".into(),
                keys: vec![key],
            }],
            &StubSigVerifier,
            1,
        )
        .unwrap();
        Arc::new(opnet_authority::AuthorityManager::new(
            set,
            Arc::new(StubSigVerifier),
            1,
            1,
            1,
        ))
    }

    /// Challenge answers of the form `sig = nonce || identity_key`.
    struct TestAuthenticator;

    impl PeerAuthenticator for TestAuthenticator {
        fn local_info(&self) -> IdentifyInfo {
            IdentifyInfo {
                agent: "opnet-test/0.1".into(),
                protocol_version: 1,
                chain_id: 0,
                network: "regtest".into(),
                mode: IndexerMode::Full,
                identity: sha256(b"local"),
            }
        }

        fn sign_challenge(&self, nonce: &[u8; 32]) -> (Vec<u8>, Vec<u8>) {
            let key = b"local-identity".to_vec();
            let mut sig = nonce.to_vec();
            sig.extend_from_slice(&key);
            (key, sig)
        }

        fn verify_challenge(
            &self,
            identity_key: &[u8],
            nonce: &[u8; 32],
            signature: &[u8],
        ) -> bool {
            let mut expect = nonce.to_vec();
            expect.extend_from_slice(identity_key);
            signature == expect
        }
    }

    struct NeverVerifier;

    #[async_trait]
    impl TxVerifier for NeverVerifier {
        async fn verify(&self, _raw: &[u8]) -> Option<Buf32> {
            None
        }
    }

    fn peer(tag: u8) -> PeerId {
        PeerId::new(Buf32::new([tag; 32]))
    }

    struct Rig {
        handle: PeerManagerHandle,
        events_tx: mpsc::Sender<PeerEvent<DuplexStream>>,
        transport: Arc<DuplexTransport>,
        cancel: CancellationToken,
    }

    async fn spawn_manager() -> Rig {
        let transport = Arc::new(DuplexTransport::new());
        let (streams, deliver_rx) =
            StreamManager::new(transport.clone(), StreamConfig::default());
        let db = Arc::new(MemDb::new());

        let (manager, handle, events_tx) = PeerManager::new(
            streams,
            deliver_rx,
            db,
            test_authority(),
            Arc::new(TestAuthenticator),
            Arc::new(NeverVerifier),
            Arc::new(Params::regtest()),
            PeerManagerConfig {
                witness_request_window: Duration::from_millis(250),
                ..Default::default()
            },
            BlacklistConfig::default(),
        );

        let cancel = CancellationToken::new();
        tokio::spawn(manager.run(cancel.clone()));

        Rig {
            handle,
            events_tx,
            transport,
            cancel,
        }
    }

    /// Walks a remote peer through challenge/response until authenticated.
    async fn connect_and_authenticate(rig: &Rig, p: &PeerId) -> (StreamHandle, mpsc::Receiver<Bytes>) {
        rig.events_tx
            .send(PeerEvent::Connected {
                peer: p.clone(),
                addr: "10.0.0.5:48100".into(),
            })
            .await
            .unwrap();

        // The manager dials a session stream and sends its challenge.
        let (session_handle, mut session_rx) = loop {
            if let Some(pair) = rig.transport.remote_recv(p, ProtocolId::Session) {
                break pair;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        };

        let challenge = session_rx.recv().await.unwrap();
        let P2pMessage::AuthChallenge { nonce } = P2pMessage::decode(&challenge).unwrap() else {
            panic!("expected auth challenge");
        };

        let auth = TestAuthenticator;
        let (identity_key, signature) = auth.sign_challenge(&nonce);
        let response = P2pMessage::AuthResponse {
            info: auth.local_info(),
            identity_key,
            signature,
        };
        session_handle
            .try_send(Bytes::from(response.encode()))
            .unwrap();

        let ack = session_rx.recv().await.unwrap();
        assert!(matches!(
            P2pMessage::decode(&ack).unwrap(),
            P2pMessage::AuthAck { .. }
        ));

        (session_handle, session_rx)
    }

    #[tokio::test]
    async fn test_challenge_response_authenticates_peer() {
        let rig = spawn_manager().await;
        let p = peer(5);

        let _session = connect_and_authenticate(&rig, &p).await;

        let snapshot = rig.handle.snapshot().await.unwrap();
        assert_eq!(snapshot.connected.len(), 1);
        assert!(snapshot.connected[0].authenticated);
        assert!(snapshot.connected[0].handshake_done);

        rig.cancel.cancel();
    }

    #[tokio::test]
    async fn test_wrong_chain_is_permanently_blacklisted() {
        let rig = spawn_manager().await;
        let p = peer(6);

        rig.events_tx
            .send(PeerEvent::Connected {
                peer: p.clone(),
                addr: "10.0.0.6:48100".into(),
            })
            .await
            .unwrap();

        let (session_handle, mut session_rx) = loop {
            if let Some(pair) = rig.transport.remote_recv(&p, ProtocolId::Session) {
                break pair;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        };
        let challenge = session_rx.recv().await.unwrap();
        let P2pMessage::AuthChallenge { nonce } = P2pMessage::decode(&challenge).unwrap() else {
            panic!("expected auth challenge");
        };

        let auth = TestAuthenticator;
        let (identity_key, signature) = auth.sign_challenge(&nonce);
        let mut info = auth.local_info();
        info.chain_id = 999;
        session_handle
            .try_send(Bytes::from(
                P2pMessage::AuthResponse {
                    info,
                    identity_key,
                    signature,
                }
                .encode(),
            ))
            .unwrap();

        // Disconnect lands on the same session stream.
        let disconnect = session_rx.recv().await.unwrap();
        assert!(matches!(
            P2pMessage::decode(&disconnect).unwrap(),
            P2pMessage::Disconnect {
                reason: DisconnectReason::InvalidChain
            }
        ));

        let snapshot = rig.handle.snapshot().await.unwrap();
        assert!(snapshot.connected.is_empty());
        assert_eq!(snapshot.blacklist_len, 2); // peer id + address

        // Reconnection attempts are rejected outright.
        rig.events_tx
            .send(PeerEvent::Connected {
                peer: p.clone(),
                addr: "10.0.0.6:48200".into(),
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let snapshot = rig.handle.snapshot().await.unwrap();
        assert!(snapshot.connected.is_empty());

        rig.cancel.cancel();
    }

    #[tokio::test]
    async fn test_witness_request_collects_responses() {
        let rig = spawn_manager().await;
        let p = peer(7);
        let _session = connect_and_authenticate(&rig, &p).await;

        // Run the request and answer it from the remote side.
        let handle = rig.handle.clone();
        let request_task =
            tokio::spawn(async move { handle.request_witnesses(12).await.unwrap() });

        let (witness_handle, mut witness_rx) = loop {
            if let Some(pair) = rig.transport.remote_recv(&p, ProtocolId::Witness) {
                break pair;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        };

        let req = witness_rx.recv().await.unwrap();
        assert!(matches!(
            P2pMessage::decode(&req).unwrap(),
            P2pMessage::WitnessRequest { block_number: 12 }
        ));

        let witness = WitnessRecord {
            block_number: 12,
            signature: vec![1],
            public_key: vec![2],
            timestamp: 0,
            proofs: None,
            identity: Buf32::zero(),
            trusted: false,
        };
        witness_handle
            .try_send(Bytes::from(
                P2pMessage::WitnessResponse {
                    block_number: 12,
                    witnesses: vec![witness.clone()],
                }
                .encode(),
            ))
            .unwrap();

        let collected = request_task.await.unwrap();
        assert_eq!(collected, vec![witness]);

        rig.cancel.cancel();
    }

    #[tokio::test]
    async fn test_pre_auth_witness_message_disconnects() {
        let rig = spawn_manager().await;
        let p = peer(8);

        rig.events_tx
            .send(PeerEvent::Connected {
                peer: p.clone(),
                addr: "10.0.0.8:48100".into(),
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Push a witness frame through an inbound stream without
        // authenticating first.
        let (local, remote) = tokio::io::duplex(64 * 1024);
        rig.events_tx
            .send(PeerEvent::InboundStream(InboundStream {
                peer: p.clone(),
                remote_addr: "10.0.0.8:48100".into(),
                protocol: ProtocolId::Witness,
                connection_id: 1,
                io: local,
            }))
            .await
            .unwrap();
        let (remote_handle, _remote_rx) =
            FramedStream::spawn(remote, StreamConfig::default(), "remote".into());
        remote_handle
            .try_send(Bytes::from(
                P2pMessage::WitnessRequest { block_number: 1 }.encode(),
            ))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        let snapshot = rig.handle.snapshot().await.unwrap();
        assert!(snapshot.connected.is_empty());

        rig.cancel.cancel();
    }
}
