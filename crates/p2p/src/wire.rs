//! Wire messages exchanged between OP_NET peers.
//!
//! Every application message is borsh-encoded and carried in one frame.
//! The single byte `0x01` at the framing layer is an ACK and never
//! reaches this module.

use borsh::{BorshDeserialize, BorshSerialize};
use opnet_db::WitnessRecord;
use opnet_primitives::Buf32;

use crate::P2pError;

/// Single-byte acknowledgement at the framing layer.
pub const ACK_BYTE: u8 = 0x01;

/// Protocols a peer pair can open streams for. Each `(peer, protocol)`
/// owns at most one reusable stream per direction.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, BorshSerialize, BorshDeserialize)]
pub enum ProtocolId {
    /// Authentication handshake and session control.
    Session,
    /// Block witness request/serve and broadcast.
    Witness,
    /// Mempool transaction relay.
    Mempool,
    /// Peer discovery exchange.
    Discovery,
}

impl ProtocolId {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Session => "/opnet/session/1",
            Self::Witness => "/opnet/witness/1",
            Self::Mempool => "/opnet/mempool/1",
            Self::Discovery => "/opnet/discovery/1",
        }
    }
}

impl std::fmt::Display for ProtocolId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a peer is being disconnected. A subset of reasons is permanent:
/// those blacklist both the peer id and its remote address.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, BorshSerialize, BorshDeserialize)]
pub enum DisconnectReason {
    BadChecksum,
    BadSignature,
    BadBehavior,
    InvalidChain,
    AuthenticationFailed,
    ProtocolViolation,
    Reconnecting,
    Shutdown,
}

impl DisconnectReason {
    /// Permanent reasons never expire from the blacklist.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Self::BadChecksum | Self::BadSignature | Self::BadBehavior | Self::InvalidChain
        )
    }
}

/// Node operating mode advertised during identify.
#[derive(Copy, Clone, Eq, PartialEq, Debug, BorshSerialize, BorshDeserialize)]
pub enum IndexerMode {
    Full,
    Light,
}

/// Identify payload sent with the authentication handshake.
#[derive(Clone, Eq, PartialEq, Debug, BorshSerialize, BorshDeserialize)]
pub struct IdentifyInfo {
    pub agent: String,
    pub protocol_version: u16,
    pub chain_id: u64,
    pub network: String,
    pub mode: IndexerMode,
    /// Hash of the peer's long-term identity key.
    pub identity: Buf32,
}

/// Application messages.
#[derive(Clone, Eq, PartialEq, Debug, BorshSerialize, BorshDeserialize)]
pub enum P2pMessage {
    /// Server-issued challenge a connecting peer must sign.
    AuthChallenge { nonce: [u8; 32] },
    /// Challenge answer: identify data plus a signature over the nonce
    /// under the peer's identity key.
    AuthResponse {
        info: IdentifyInfo,
        identity_key: Vec<u8>,
        signature: Vec<u8>,
    },
    /// Authentication accepted; the session is live.
    AuthAck { info: IdentifyInfo },

    /// Ask for all known witnesses of a block.
    WitnessRequest { block_number: u64 },
    /// Any subset of known witnesses for the requested block.
    WitnessResponse {
        block_number: u64,
        witnesses: Vec<WitnessRecord>,
    },
    /// Unsolicited broadcast of a freshly produced witness.
    BlockWitness(WitnessRecord),

    /// Mempool transaction relay.
    MempoolTx { id: Buf32, raw: Vec<u8> },

    /// Ask the peer for other peers it knows.
    DiscoveryRequest,
    DiscoveryResponse { addrs: Vec<String> },

    /// Closing with a reason code.
    Disconnect { reason: DisconnectReason },
}

impl P2pMessage {
    pub fn encode(&self) -> Vec<u8> {
        borsh::to_vec(self).expect("p2p message encoding is infallible")
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, P2pError> {
        borsh::from_slice(bytes).map_err(|e| P2pError::Malformed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let msg = P2pMessage::WitnessRequest { block_number: 77 };
        let bytes = msg.encode();
        assert_eq!(P2pMessage::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(P2pMessage::decode(&[0xfe, 0xff, 0x00]).is_err());
    }

    #[test]
    fn test_permanent_reasons() {
        assert!(DisconnectReason::BadSignature.is_permanent());
        assert!(DisconnectReason::InvalidChain.is_permanent());
        assert!(!DisconnectReason::Reconnecting.is_permanent());
        assert!(!DisconnectReason::Shutdown.is_permanent());
    }
}
