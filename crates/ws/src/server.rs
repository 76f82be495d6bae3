//! WebSocket server wiring: accept loop, per-connection tasks,
//! notification fan-out.

use std::sync::{
    atomic::{AtomicU64, AtomicUsize, Ordering},
    Arc,
};

use futures::{SinkExt, StreamExt};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc,
};
use tokio_tungstenite::tungstenite::{
    handshake::server::{ErrorResponse, Request, Response},
    http::StatusCode,
    protocol::{frame::coding::CloseCode, CloseFrame},
    Message,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use opnet_status::StatusChannel;

use crate::{
    proto,
    registry::OpcodeRegistry,
    session::{ClientSession, FrameAction, OutFrame, SessionConfig},
    subs::{notification_task, ClientId, ClientSink, SubscriptionManager, WriterMsg},
    WsErrorCode,
};

/// Server knobs.
#[derive(Clone, Debug)]
pub struct WsServerConfig {
    /// URI path clients must request.
    pub path: String,
    pub session: SessionConfig,
}

impl Default for WsServerConfig {
    fn default() -> Self {
        Self {
            path: "/api/v1/ws".to_string(),
            session: SessionConfig::default(),
        }
    }
}

/// The binary WebSocket API server.
pub struct WsServer {
    registry: Arc<OpcodeRegistry>,
    subs: Arc<SubscriptionManager>,
    status: StatusChannel,
    config: WsServerConfig,
    next_client: AtomicU64,
}

impl std::fmt::Debug for WsServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsServer").finish_non_exhaustive()
    }
}

impl WsServer {
    pub fn new(
        registry: Arc<OpcodeRegistry>,
        subs: Arc<SubscriptionManager>,
        status: StatusChannel,
        config: WsServerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            subs,
            status,
            config,
            next_client: AtomicU64::new(1),
        })
    }

    /// Accepts connections until cancelled. The caller owns the listener
    /// so it can bind to an ephemeral port first.
    pub async fn run(self: Arc<Self>, listener: TcpListener, cancel: CancellationToken) {
        info!(addr = ?listener.local_addr().ok(), path = %self.config.path, "ws server listening");

        // Bridge node events to subscribers.
        tokio::spawn(notification_task(
            self.subs.clone(),
            self.status.subscribe_events(),
            cancel.clone(),
        ));

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => {
                    let Ok((stream, addr)) = accepted else { continue };
                    debug!(%addr, "inbound ws connection");
                    let server = self.clone();
                    tokio::spawn(async move {
                        server.handle_connection(stream).await;
                    });
                }
            }
        }
        info!("ws server stopped");
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream) {
        let path = self.config.path.clone();
        let callback = move |req: &Request, resp: Response| {
            if req.uri().path() == path {
                Ok(resp)
            } else {
                let mut error = ErrorResponse::new(Some("not found".to_string()));
                *error.status_mut() = StatusCode::NOT_FOUND;
                Err(error)
            }
        };

        let ws = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
            Ok(ws) => ws,
            Err(e) => {
                debug!(%e, "ws handshake rejected");
                return;
            }
        };

        let client_id = ClientId(self.next_client.fetch_add(1, Ordering::SeqCst));
        let mut session = ClientSession::new(
            client_id,
            self.config.session.clone(),
            self.status.clone(),
        );

        let (writer_tx, mut writer_rx) = mpsc::channel::<WriterMsg>(64);
        let sink = ClientSink::new(writer_tx, self.config.session.max_backpressure());
        self.subs.register_client(client_id, sink.clone());

        let (mut ws_tx, mut ws_rx) = ws.split();

        // Writer: the only task touching the socket's send half.
        let writer_sink = sink.clone();
        let writer = tokio::spawn(async move {
            while let Some(msg) = writer_rx.recv().await {
                match msg {
                    WriterMsg::Frame(frame) => {
                        let len = frame.len();
                        if ws_tx.send(Message::Binary(frame)).await.is_err() {
                            break;
                        }
                        // Drained: frees backpressure budget.
                        writer_sink.mark_written(len);
                    }
                    WriterMsg::Close(code) => {
                        let _ = ws_tx
                            .send(Message::Close(Some(CloseFrame {
                                code: CloseCode::from(code),
                                reason: "".into(),
                            })))
                            .await;
                        break;
                    }
                }
            }
        });

        let pending = Arc::new(AtomicUsize::new(0));
        let max_pending = self.config.session.max_pending_requests;

        while let Some(message) = ws_rx.next().await {
            let data = match message {
                Ok(Message::Binary(data)) => data,
                Ok(Message::Close(_)) => break,
                Ok(_) => continue,
                Err(e) => {
                    debug!(%client_id, %e, "ws read error");
                    break;
                }
            };

            match session.process_frame(&data) {
                FrameAction::Respond(frame) => {
                    if !sink.send(frame.encode()).await {
                        break;
                    }
                }
                FrameAction::RespondAndClose(frame, code) => {
                    let _ = sink.send(frame.encode()).await;
                    sink.close(code).await;
                    break;
                }
                FrameAction::Dispatch { opcode, payload } => {
                    if pending.load(Ordering::SeqCst) >= max_pending {
                        let request_id = proto::decode::<proto::RequestIdProbe>(&payload)
                            .ok()
                            .and_then(|p| p.request_id)
                            .filter(|id| *id >= 0)
                            .unwrap_or(0);
                        let frame =
                            OutFrame::error(request_id, WsErrorCode::TooManyPendingRequests);
                        let _ = sink.send(frame.encode()).await;
                        continue;
                    }

                    let Some(handler) = self.registry.lookup(opcode) else {
                        warn!(?opcode, "request opcode without handler");
                        let _ = sink
                            .send(OutFrame::error(0, WsErrorCode::NotImplemented).encode())
                            .await;
                        continue;
                    };

                    pending.fetch_add(1, Ordering::SeqCst);
                    let pending = pending.clone();
                    let sink = sink.clone();
                    tokio::spawn(async move {
                        let frame = match handler.handle(client_id, &payload).await {
                            Ok(outcome) => OutFrame::new(outcome.opcode, outcome.payload),
                            Err(e) => OutFrame::error(e.request_id, e.code),
                        };
                        let _ = sink.send(frame.encode()).await;
                        pending.fetch_sub(1, Ordering::SeqCst);
                    });
                }
            }
        }

        self.subs.unregister_client(client_id);
        // Let the writer flush queued frames (close frames included)
        // before tearing the connection down.
        drop(sink);
        let _ = tokio::time::timeout(std::time::Duration::from_secs(5), writer).await;
        debug!(%client_id, "ws connection closed");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use opnet_db::MemDb;
    use opnet_primitives::{Buf32, L1BlockCommitment};
    use opnet_status::NodeEvent;
    use prost::Message as _;

    use super::*;
    use crate::{handlers::build_registry, opcodes::Opcode};

    async fn start_server(status: StatusChannel) -> (String, CancellationToken) {
        let db = Arc::new(MemDb::new());
        let subs = Arc::new(SubscriptionManager::new());
        let registry = Arc::new(build_registry(db, status.clone(), subs.clone()));
        let server = WsServer::new(registry, subs, status, WsServerConfig::default());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        tokio::spawn(server.run(listener, cancel.clone()));

        (format!("ws://{addr}/api/v1/ws"), cancel)
    }

    fn frame(opcode: Opcode, payload: Vec<u8>) -> Message {
        Message::Binary(OutFrame::new(opcode, payload).encode())
    }

    async fn next_binary(
        ws: &mut (impl futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
              + Unpin),
    ) -> Vec<u8> {
        loop {
            match ws.next().await.expect("stream ended").expect("ws error") {
                Message::Binary(data) => return data,
                _ => continue,
            }
        }
    }

    /// Scenario: ping pre-handshake, handshake, subscribe, then receive a
    /// block notification.
    #[tokio::test]
    async fn test_handshake_and_block_subscription() {
        let status = StatusChannel::new();
        status.update_chain_status(|s| {
            s.tip = Some(L1BlockCommitment::new(10, Buf32::new([1; 32])))
        });
        let (url, cancel) = start_server(status.clone()).await;

        let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

        // Ping needs no handshake.
        ws.send(frame(
            Opcode::Ping,
            proto::Ping { nonce: 4 }.encode_to_vec(),
        ))
        .await
        .unwrap();
        let pong = next_binary(&mut ws).await;
        assert_eq!(pong[0], u8::from(Opcode::Pong));

        // Handshake.
        ws.send(frame(
            Opcode::Handshake,
            proto::HandshakeRequest {
                protocol_version: 1,
                client_name: "t".into(),
                client_version: "0".into(),
            }
            .encode_to_vec(),
        ))
        .await
        .unwrap();
        let ack = next_binary(&mut ws).await;
        assert_eq!(ack[0], u8::from(Opcode::HandshakeAck));
        let ack: proto::HandshakeAck = proto::decode(&ack[1..]).unwrap();
        assert_eq!(ack.block_height, 10);

        // Subscribe to blocks.
        ws.send(frame(
            Opcode::SubscribeBlocks,
            proto::SubscribeRequest {
                request_id: Some(1),
            }
            .encode_to_vec(),
        ))
        .await
        .unwrap();
        let sub_ack = next_binary(&mut ws).await;
        assert_eq!(sub_ack[0], u8::from(Opcode::SubscribeAck));

        // A block change notification reaches the subscriber.
        status.publish(NodeEvent::NewBlock(L1BlockCommitment::new(
            11,
            Buf32::new([2; 32]),
        )));
        let notification = next_binary(&mut ws).await;
        assert_eq!(notification[0], u8::from(Opcode::NewBlockNotification));
        let n: proto::NewBlockNotification = proto::decode(&notification[1..]).unwrap();
        assert_eq!(n.height, 11);

        cancel.cancel();
    }

    /// Scenario: any non-ping opcode before handshake earns an error and a
    /// 1002 close.
    #[tokio::test]
    async fn test_pre_handshake_request_closed_1002() {
        let (url, cancel) = start_server(StatusChannel::new()).await;
        let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

        ws.send(frame(
            Opcode::GetChainTip,
            proto::GetChainTipRequest {
                request_id: Some(1),
            }
            .encode_to_vec(),
        ))
        .await
        .unwrap();

        let error = next_binary(&mut ws).await;
        assert_eq!(error[0], u8::from(Opcode::Error));
        let e: proto::ErrorResponse = proto::decode(&error[1..]).unwrap();
        assert_eq!(e.code, u32::from(WsErrorCode::HandshakeRequired));

        // The server closes with 1002.
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(Some(cf)))) => {
                    assert_eq!(u16::from(cf.code), 1002);
                    break;
                }
                Some(Ok(_)) => continue,
                Some(Err(_)) | None => break,
            }
        }

        cancel.cancel();
    }

    /// The wrong path is refused during the HTTP upgrade.
    #[tokio::test]
    async fn test_wrong_path_rejected() {
        let (url, cancel) = start_server(StatusChannel::new()).await;
        let bad_url = url.replace("/api/v1/ws", "/live");

        assert!(tokio_tungstenite::connect_async(&bad_url).await.is_err());
        cancel.cancel();
    }

    /// Requests after handshake get exactly one correlated response.
    #[tokio::test]
    async fn test_request_response_correlation() {
        let status = StatusChannel::new();
        status.update_chain_status(|s| {
            s.tip = Some(L1BlockCommitment::new(77, Buf32::new([7; 32])))
        });
        let (url, cancel) = start_server(status).await;
        let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

        ws.send(frame(
            Opcode::Handshake,
            proto::HandshakeRequest {
                protocol_version: 1,
                client_name: "corr".into(),
                client_version: "0".into(),
            }
            .encode_to_vec(),
        ))
        .await
        .unwrap();
        next_binary(&mut ws).await;

        ws.send(frame(
            Opcode::GetChainTip,
            proto::GetChainTipRequest {
                request_id: Some(1234),
            }
            .encode_to_vec(),
        ))
        .await
        .unwrap();

        let response = next_binary(&mut ws).await;
        assert_eq!(response[0], u8::from(Opcode::ChainTipResponse));
        let tip: proto::ChainTipResponse = proto::decode(&response[1..]).unwrap();
        assert_eq!(tip.request_id, 1234);
        assert_eq!(tip.height, 77);

        cancel.cancel();
    }
}
