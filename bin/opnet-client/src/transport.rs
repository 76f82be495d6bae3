//! TCP-backed stream transport for the P2P layer.
//!
//! A stream carries one hello frame (`StreamHello`, borsh, u32-LE length
//! prefix) naming the dialer's peer id and the protocol, then switches to
//! the framed message protocol owned by `opnet-p2p`.

use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
    sync::Arc,
};

use async_trait::async_trait;
use borsh::{BorshDeserialize, BorshSerialize};
use opnet_p2p::{InboundStream, P2pError, PeerEvent, PeerId, ProtocolId};
use opnet_primitives::Buf32;
use parking_lot::RwLock;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(BorshSerialize, BorshDeserialize)]
struct StreamHello {
    peer: Buf32,
    protocol: ProtocolId,
}

async fn write_hello(stream: &mut TcpStream, hello: &StreamHello) -> std::io::Result<()> {
    let bytes = borsh::to_vec(hello).expect("hello encoding");
    stream.write_all(&(bytes.len() as u32).to_le_bytes()).await?;
    stream.write_all(&bytes).await?;
    stream.flush().await
}

async fn read_hello(stream: &mut TcpStream) -> std::io::Result<StreamHello> {
    let mut len_bytes = [0u8; 4];
    stream.read_exact(&mut len_bytes).await?;
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > 1024 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "hello frame too large",
        ));
    }
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    borsh::from_slice(&buf)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

/// Dials peers from a shared address book.
pub(crate) struct TcpTransport {
    local_id: Buf32,
    address_book: RwLock<HashMap<PeerId, String>>,
}

impl TcpTransport {
    pub(crate) fn new(local_id: Buf32) -> Arc<Self> {
        Arc::new(Self {
            local_id,
            address_book: RwLock::new(HashMap::new()),
        })
    }

    pub(crate) fn add_peer(&self, peer: PeerId, addr: String) {
        self.address_book.write().insert(peer, addr);
    }
}

#[async_trait]
impl opnet_p2p::Transport for TcpTransport {
    type Io = TcpStream;

    async fn dial(&self, peer: &PeerId, protocol: ProtocolId) -> Result<Self::Io, P2pError> {
        let addr = self
            .address_book
            .read()
            .get(peer)
            .cloned()
            .ok_or_else(|| P2pError::DialFailed(format!("no known address for {peer}")))?;

        let mut stream = TcpStream::connect(&addr)
            .await
            .map_err(|e| P2pError::DialFailed(format!("{addr}: {e}")))?;

        write_hello(
            &mut stream,
            &StreamHello {
                peer: self.local_id,
                protocol,
            },
        )
        .await
        .map_err(|e| P2pError::DialFailed(format!("hello to {addr}: {e}")))?;

        debug!(%peer, %protocol, %addr, "dialed outbound stream");
        Ok(stream)
    }
}

/// Accepts inbound streams and feeds them to the peer manager.
pub(crate) async fn listener_task(
    listener: TcpListener,
    events_tx: mpsc::Sender<PeerEvent<TcpStream>>,
    cancel: CancellationToken,
) {
    info!(addr = ?listener.local_addr().ok(), "p2p listening");
    let next_conn = AtomicU64::new(1);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => {
                let Ok((mut stream, addr)) = accepted else { continue };
                let hello = match read_hello(&mut stream).await {
                    Ok(hello) => hello,
                    Err(e) => {
                        warn!(%addr, %e, "bad stream hello");
                        continue;
                    }
                };

                let peer = PeerId::new(hello.peer);
                let connection_id = next_conn.fetch_add(1, Ordering::SeqCst);

                // First stream from a peer also announces the connection.
                if hello.protocol == ProtocolId::Session {
                    let _ = events_tx
                        .send(PeerEvent::Connected {
                            peer: peer.clone(),
                            addr: addr.to_string(),
                        })
                        .await;
                }

                let _ = events_tx
                    .send(PeerEvent::InboundStream(InboundStream {
                        peer,
                        remote_addr: addr.to_string(),
                        protocol: hello.protocol,
                        connection_id,
                        io: stream,
                    }))
                    .await;
            }
        }
    }
}
