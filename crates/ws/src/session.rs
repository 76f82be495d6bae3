//! Per-connection protocol state machine.
//!
//! The session is sans-IO: it consumes raw frames and yields actions for
//! the connection task to execute. Everything protocol-visible (handshake
//! gating, opcode parsing, the ping fast-path) lives here, so it is
//! testable without sockets.

use bytes::Bytes;
use prost::Message;
use uuid::Uuid;

use crate::{
    errors::WsErrorCode,
    opcodes::Opcode,
    proto,
    subs::ClientId,
};

use opnet_status::StatusChannel;

/// Close code for protocol errors (pre-handshake traffic).
pub const CLOSE_PROTOCOL_ERROR: u16 = 1002;
/// Close code for policy violations.
pub const CLOSE_POLICY: u16 = 1008;

/// Per-connection protocol limits.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub max_payload: usize,
    pub max_pending_requests: usize,
    pub protocol_version_min: u32,
    pub protocol_version_max: u32,
    pub max_client_name_len: usize,
    pub server_version: String,
    pub chain_id: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_payload: 1024 * 1024,
            max_pending_requests: 16,
            protocol_version_min: 1,
            protocol_version_max: 1,
            max_client_name_len: 64,
            server_version: env!("CARGO_PKG_VERSION").to_string(),
            chain_id: 0,
        }
    }
}

impl SessionConfig {
    /// Outbound buffer bound: twice the payload cap.
    pub fn max_backpressure(&self) -> usize {
        2 * self.max_payload
    }
}

/// A frame to send: `opcode || payload`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutFrame {
    pub opcode: Opcode,
    pub payload: Vec<u8>,
}

impl OutFrame {
    pub fn new(opcode: Opcode, payload: Vec<u8>) -> Self {
        Self { opcode, payload }
    }

    pub fn error(request_id: i64, code: WsErrorCode) -> Self {
        let payload = proto::ErrorResponse {
            request_id,
            code: code.into(),
            message: code.message().to_string(),
        }
        .encode_to_vec();
        Self::new(Opcode::Error, payload)
    }

    /// Wire bytes: one opcode byte followed by the protobuf payload.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + self.payload.len());
        out.push(u8::from(self.opcode));
        out.extend_from_slice(&self.payload);
        out
    }
}

/// What the connection task should do with the frame it fed in.
#[derive(Debug)]
pub enum FrameAction {
    Respond(OutFrame),
    RespondAndClose(OutFrame, u16),
    /// Run the registered handler for this request opcode, subject to the
    /// pending-request limit.
    Dispatch { opcode: Opcode, payload: Bytes },
}

/// Connection states. `Closed` is handled by the connection task dropping
/// the socket; the session only distinguishes pre- and post-handshake.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum SessionState {
    Connected,
    Handshaked,
}

/// The protocol state machine for one client.
#[derive(Debug)]
pub struct ClientSession {
    id: ClientId,
    config: SessionConfig,
    status: StatusChannel,
    state: SessionState,
    client_name: Option<String>,
    client_version: Option<String>,
}

impl ClientSession {
    pub fn new(id: ClientId, config: SessionConfig, status: StatusChannel) -> Self {
        Self {
            id,
            config,
            status,
            state: SessionState::Connected,
            client_name: None,
            client_version: None,
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn handshake_done(&self) -> bool {
        self.state == SessionState::Handshaked
    }

    pub fn client_name(&self) -> Option<&str> {
        self.client_name.as_deref()
    }

    /// Session id derived deterministically from the client id.
    pub fn session_id(&self) -> String {
        Uuid::new_v5(&Uuid::NAMESPACE_OID, &self.id.0.to_le_bytes()).to_string()
    }

    /// Feeds one inbound binary frame through the state machine.
    pub fn process_frame(&mut self, frame: &[u8]) -> FrameAction {
        let Some((&opcode_byte, payload)) = frame.split_first() else {
            return FrameAction::RespondAndClose(
                OutFrame::error(0, WsErrorCode::MalformedMessage),
                CLOSE_POLICY,
            );
        };

        if payload.len() > self.config.max_payload {
            return FrameAction::RespondAndClose(
                OutFrame::error(0, WsErrorCode::MalformedMessage),
                CLOSE_POLICY,
            );
        }

        let Ok(opcode) = Opcode::try_from(opcode_byte) else {
            return FrameAction::RespondAndClose(
                OutFrame::error(0, WsErrorCode::UnknownOpcode),
                CLOSE_POLICY,
            );
        };

        if !opcode.is_request() {
            // Clients never send response opcodes.
            return FrameAction::RespondAndClose(
                OutFrame::error(0, WsErrorCode::UnknownOpcode),
                CLOSE_POLICY,
            );
        }

        match opcode {
            Opcode::Ping => self.handle_ping(payload),
            Opcode::Handshake => self.handle_handshake(payload),
            _ if self.state == SessionState::Connected => FrameAction::RespondAndClose(
                OutFrame::error(0, WsErrorCode::HandshakeRequired),
                CLOSE_PROTOCOL_ERROR,
            ),
            _ => FrameAction::Dispatch {
                opcode,
                payload: Bytes::copy_from_slice(payload),
            },
        }
    }

    /// Ping is answered in any state, handshake or not.
    fn handle_ping(&self, payload: &[u8]) -> FrameAction {
        match proto::decode::<proto::Ping>(payload) {
            Ok(ping) => FrameAction::Respond(OutFrame::new(
                Opcode::Pong,
                proto::Pong { nonce: ping.nonce }.encode_to_vec(),
            )),
            Err(code) => {
                FrameAction::RespondAndClose(OutFrame::error(0, code), CLOSE_POLICY)
            }
        }
    }

    fn handle_handshake(&mut self, payload: &[u8]) -> FrameAction {
        if self.state == SessionState::Handshaked {
            return FrameAction::Respond(OutFrame::error(
                0,
                WsErrorCode::HandshakeAlreadyCompleted,
            ));
        }

        let request = match proto::decode::<proto::HandshakeRequest>(payload) {
            Ok(r) => r,
            Err(code) => {
                return FrameAction::RespondAndClose(OutFrame::error(0, code), CLOSE_POLICY)
            }
        };

        if request.protocol_version < self.config.protocol_version_min
            || request.protocol_version > self.config.protocol_version_max
        {
            return FrameAction::Respond(OutFrame::error(
                0,
                WsErrorCode::UnsupportedProtocolVersion,
            ));
        }

        if request.client_name.is_empty()
            || request.client_name.len() > self.config.max_client_name_len
        {
            return FrameAction::Respond(OutFrame::error(0, WsErrorCode::InvalidParams));
        }

        self.state = SessionState::Handshaked;
        self.client_name = Some(request.client_name);
        self.client_version = Some(request.client_version);

        let block_height = self
            .status
            .chain_status()
            .tip
            .map(|t| t.height())
            .unwrap_or(0);

        let ack = proto::HandshakeAck {
            protocol_version: self.config.protocol_version_max,
            session_id: self.session_id(),
            server_version: self.config.server_version.clone(),
            block_height,
            chain_id: self.config.chain_id,
        };
        FrameAction::Respond(OutFrame::new(Opcode::HandshakeAck, ack.encode_to_vec()))
    }
}
