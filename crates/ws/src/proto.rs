//! Protobuf payload schemas, defined with prost derives. The schemas are
//! bundled with the server; clients generate from the same definitions.

use prost::Message;

use crate::errors::WsErrorCode;

/// Decodes a payload, mapping failures to the protocol error code.
pub fn decode<M: Message + Default>(payload: &[u8]) -> Result<M, WsErrorCode> {
    M::decode(payload).map_err(|_| WsErrorCode::MalformedMessage)
}

/// Partial view decoding only the correlation id; every request schema
/// reserves field 1 for it, so this decodes against any of them.
#[derive(Clone, PartialEq, Eq, Message)]
pub struct RequestIdProbe {
    #[prost(int64, optional, tag = "1")]
    pub request_id: Option<i64>,
}

#[derive(Clone, PartialEq, Eq, Message)]
pub struct Ping {
    #[prost(uint64, tag = "1")]
    pub nonce: u64,
}

#[derive(Clone, PartialEq, Eq, Message)]
pub struct Pong {
    #[prost(uint64, tag = "1")]
    pub nonce: u64,
}

#[derive(Clone, PartialEq, Eq, Message)]
pub struct HandshakeRequest {
    #[prost(uint32, tag = "1")]
    pub protocol_version: u32,
    #[prost(string, tag = "2")]
    pub client_name: String,
    #[prost(string, tag = "3")]
    pub client_version: String,
}

#[derive(Clone, PartialEq, Eq, Message)]
pub struct HandshakeAck {
    #[prost(uint32, tag = "1")]
    pub protocol_version: u32,
    #[prost(string, tag = "2")]
    pub session_id: String,
    #[prost(string, tag = "3")]
    pub server_version: String,
    #[prost(uint64, tag = "4")]
    pub block_height: u64,
    #[prost(uint64, tag = "5")]
    pub chain_id: u64,
}

#[derive(Clone, PartialEq, Eq, Message)]
pub struct GetBlockRequest {
    #[prost(int64, optional, tag = "1")]
    pub request_id: Option<i64>,
    #[prost(uint64, optional, tag = "2")]
    pub height: Option<u64>,
    #[prost(string, optional, tag = "3")]
    pub hash: Option<String>,
    #[prost(bool, tag = "4")]
    pub include_transactions: bool,
}

#[derive(Clone, PartialEq, Eq, Message)]
pub struct BlockHeaderMsg {
    #[prost(uint64, tag = "1")]
    pub height: u64,
    #[prost(string, tag = "2")]
    pub hash: String,
    #[prost(string, tag = "3")]
    pub previous_block_hash: String,
    #[prost(string, tag = "4")]
    pub merkle_root: String,
    #[prost(string, tag = "5")]
    pub checksum_root: String,
    #[prost(uint32, tag = "6")]
    pub time: u32,
    #[prost(uint32, tag = "7")]
    pub tx_count: u32,
}

#[derive(Clone, PartialEq, Eq, Message)]
pub struct BlockResponse {
    #[prost(int64, tag = "1")]
    pub request_id: i64,
    #[prost(message, optional, tag = "2")]
    pub header: Option<BlockHeaderMsg>,
    /// Present only when transactions were requested.
    #[prost(string, repeated, tag = "3")]
    pub tx_ids: Vec<String>,
}

#[derive(Clone, PartialEq, Eq, Message)]
pub struct GetBlockWitnessesRequest {
    #[prost(int64, optional, tag = "1")]
    pub request_id: Option<i64>,
    #[prost(uint64, tag = "2")]
    pub block_number: u64,
}

#[derive(Clone, PartialEq, Eq, Message)]
pub struct WitnessMsg {
    #[prost(uint64, tag = "1")]
    pub block_number: u64,
    #[prost(bytes = "vec", tag = "2")]
    pub signature: Vec<u8>,
    #[prost(bytes = "vec", tag = "3")]
    pub public_key: Vec<u8>,
    #[prost(string, tag = "4")]
    pub identity: String,
    #[prost(bool, tag = "5")]
    pub trusted: bool,
}

#[derive(Clone, PartialEq, Eq, Message)]
pub struct BlockWitnessesResponse {
    #[prost(int64, tag = "1")]
    pub request_id: i64,
    #[prost(message, repeated, tag = "2")]
    pub witnesses: Vec<WitnessMsg>,
}

#[derive(Clone, PartialEq, Eq, Message)]
pub struct GetEpochRequest {
    #[prost(int64, optional, tag = "1")]
    pub request_id: Option<i64>,
    #[prost(uint64, tag = "2")]
    pub epoch_number: u64,
}

#[derive(Clone, PartialEq, Eq, Message)]
pub struct EpochResponse {
    #[prost(int64, tag = "1")]
    pub request_id: i64,
    #[prost(bool, tag = "2")]
    pub found: bool,
    #[prost(uint64, tag = "3")]
    pub epoch_number: u64,
    #[prost(string, tag = "4")]
    pub commitment: String,
    #[prost(bool, tag = "5")]
    pub finalized: bool,
    #[prost(uint32, tag = "6")]
    pub witness_count: u32,
}

#[derive(Clone, PartialEq, Eq, Message)]
pub struct GetChainTipRequest {
    #[prost(int64, optional, tag = "1")]
    pub request_id: Option<i64>,
}

#[derive(Clone, PartialEq, Eq, Message)]
pub struct ChainTipResponse {
    #[prost(int64, tag = "1")]
    pub request_id: i64,
    #[prost(uint64, tag = "2")]
    pub height: u64,
    #[prost(string, tag = "3")]
    pub hash: String,
}

#[derive(Clone, PartialEq, Eq, Message)]
pub struct SubscribeRequest {
    #[prost(int64, optional, tag = "1")]
    pub request_id: Option<i64>,
}

#[derive(Clone, PartialEq, Eq, Message)]
pub struct SubscribeAck {
    #[prost(int64, tag = "1")]
    pub request_id: i64,
    #[prost(string, tag = "2")]
    pub topic: String,
}

#[derive(Clone, PartialEq, Eq, Message)]
pub struct UnsubscribeRequest {
    #[prost(int64, optional, tag = "1")]
    pub request_id: Option<i64>,
    #[prost(string, tag = "2")]
    pub topic: String,
}

#[derive(Clone, PartialEq, Eq, Message)]
pub struct ErrorResponse {
    #[prost(int64, tag = "1")]
    pub request_id: i64,
    #[prost(uint32, tag = "2")]
    pub code: u32,
    #[prost(string, tag = "3")]
    pub message: String,
}

#[derive(Clone, PartialEq, Eq, Message)]
pub struct NewBlockNotification {
    #[prost(uint64, tag = "1")]
    pub height: u64,
    #[prost(string, tag = "2")]
    pub hash: String,
}

#[derive(Clone, PartialEq, Eq, Message)]
pub struct EpochFinalizedNotification {
    #[prost(uint64, tag = "1")]
    pub epoch_number: u64,
    #[prost(uint64, tag = "2")]
    pub last_height: u64,
}

#[derive(Clone, PartialEq, Eq, Message)]
pub struct MempoolTxNotification {
    #[prost(string, tag = "1")]
    pub id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_roundtrip() {
        let req = HandshakeRequest {
            protocol_version: 1,
            client_name: "t".into(),
            client_version: "0".into(),
        };
        let bytes = req.encode_to_vec();
        assert_eq!(decode::<HandshakeRequest>(&bytes).unwrap(), req);
    }

    #[test]
    fn test_missing_request_id_is_none() {
        // An empty GetChainTipRequest has no request_id on the wire.
        let decoded = decode::<GetChainTipRequest>(&[]).unwrap();
        assert_eq!(decoded.request_id, None);
    }

    #[test]
    fn test_malformed_payload_maps_to_error_code() {
        let err = decode::<HandshakeRequest>(&[0xff, 0xff, 0xff]).unwrap_err();
        assert_eq!(err, WsErrorCode::MalformedMessage);
    }
}
