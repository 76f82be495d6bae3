//! Request handlers behind the opcode registry.

use std::sync::Arc;

use async_trait::async_trait;
use opnet_db::{
    EpochDatabase, HeaderDatabase, HeaderRecord, TransactionDatabase, WitnessDatabase,
};
use opnet_status::StatusChannel;
use prost::Message;

use crate::{
    cache::{BlockFingerprint, InflightCache},
    errors::WsErrorCode,
    opcodes::Opcode,
    proto,
    registry::{HandlerError, HandlerOutcome, OpcodeRegistry, RequestHandler},
    subs::{ClientId, SubscriptionManager, Topic},
};

/// Validates the correlation id carried by a request: present and
/// non-negative, else `INVALID_REQUEST_ID` echoed with id 0.
fn require_request_id(id: Option<i64>) -> Result<i64, HandlerError> {
    match id {
        Some(id) if id >= 0 => Ok(id),
        _ => Err(HandlerError::new(0, WsErrorCode::InvalidRequestId)),
    }
}

fn header_to_msg(header: &HeaderRecord) -> proto::BlockHeaderMsg {
    proto::BlockHeaderMsg {
        height: header.height,
        hash: format!("{:?}", header.hash),
        previous_block_hash: header
            .prev_blockhash
            .map(|h| format!("{h:?}"))
            .unwrap_or_default(),
        merkle_root: format!("{:?}", header.merkle_root),
        checksum_root: header
            .checksum_root
            .map(|h| format!("{h:?}"))
            .unwrap_or_default(),
        time: header.time,
        tx_count: header.tx_count,
    }
}

struct GetBlockHandler<D> {
    db: Arc<D>,
    /// Concurrent identical requests collapse into one build.
    inflight: InflightCache<BlockFingerprint, BuiltBlock>,
}

#[derive(Clone, Debug)]
struct BuiltBlock {
    header: Option<proto::BlockHeaderMsg>,
    tx_ids: Vec<String>,
}

impl<D> GetBlockHandler<D>
where
    D: HeaderDatabase + TransactionDatabase,
{
    async fn build(
        &self,
        height: Option<u64>,
        hash: Option<opnet_primitives::Buf32>,
        include_transactions: bool,
    ) -> Result<BuiltBlock, WsErrorCode> {
        let header = match (height, hash) {
            (Some(height), _) => self
                .db
                .header_at(height)
                .await
                .map_err(|_| WsErrorCode::InternalError)?,
            (None, Some(hash)) => self
                .db
                .header_by_hash(hash)
                .await
                .map_err(|_| WsErrorCode::InternalError)?,
            (None, None) => return Err(WsErrorCode::InvalidParams),
        };

        let mut tx_ids = Vec::new();
        if include_transactions {
            if let Some(header) = &header {
                tx_ids = self
                    .db
                    .transactions_by_block(header.height)
                    .await
                    .map_err(|_| WsErrorCode::InternalError)?
                    .iter()
                    .map(|t| format!("{:?}", t.txid))
                    .collect();
            }
        }

        Ok(BuiltBlock {
            header: header.as_ref().map(header_to_msg),
            tx_ids,
        })
    }
}

#[async_trait]
impl<D> RequestHandler for GetBlockHandler<D>
where
    D: HeaderDatabase + TransactionDatabase,
{
    async fn handle(
        &self,
        _client: ClientId,
        payload: &[u8],
    ) -> Result<HandlerOutcome, HandlerError> {
        let request: proto::GetBlockRequest = proto::decode(payload)
            .map_err(|code| HandlerError::new(0, code))?;
        let request_id = require_request_id(request.request_id)?;

        let hash: Option<opnet_primitives::Buf32> = match &request.hash {
            Some(raw) if request.height.is_none() => Some(
                raw.parse()
                    .map_err(|_| HandlerError::new(request_id, WsErrorCode::InvalidParams))?,
            ),
            _ => None,
        };

        let fingerprint = BlockFingerprint {
            key: request
                .height
                .map(|h| h.to_string())
                .or_else(|| request.hash.clone())
                .unwrap_or_default(),
            include_transactions: request.include_transactions,
        };

        let built = self
            .inflight
            .get_or_build(fingerprint, || {
                self.build(request.height, hash, request.include_transactions)
            })
            .await
            .map_err(|code| HandlerError::new(request_id, code))?;

        let response = proto::BlockResponse {
            request_id,
            header: built.header,
            tx_ids: built.tx_ids,
        };
        Ok(HandlerOutcome {
            opcode: Opcode::BlockResponse,
            payload: response.encode_to_vec(),
        })
    }
}

struct GetBlockWitnessesHandler<D> {
    db: Arc<D>,
}

#[async_trait]
impl<D: WitnessDatabase> RequestHandler for GetBlockWitnessesHandler<D> {
    async fn handle(
        &self,
        _client: ClientId,
        payload: &[u8],
    ) -> Result<HandlerOutcome, HandlerError> {
        let request: proto::GetBlockWitnessesRequest = proto::decode(payload)
            .map_err(|code| HandlerError::new(0, code))?;
        let request_id = require_request_id(request.request_id)?;

        let witnesses = self
            .db
            .witnesses_at(request.block_number)
            .await
            .map_err(|_| HandlerError::new(request_id, WsErrorCode::InternalError))?;

        let response = proto::BlockWitnessesResponse {
            request_id,
            witnesses: witnesses
                .iter()
                .map(|w| proto::WitnessMsg {
                    block_number: w.block_number,
                    signature: w.signature.clone(),
                    public_key: w.public_key.clone(),
                    identity: format!("{:?}", w.identity),
                    trusted: w.trusted,
                })
                .collect(),
        };
        Ok(HandlerOutcome {
            opcode: Opcode::BlockWitnessesResponse,
            payload: response.encode_to_vec(),
        })
    }
}

struct GetEpochHandler<D> {
    db: Arc<D>,
}

#[async_trait]
impl<D: EpochDatabase> RequestHandler for GetEpochHandler<D> {
    async fn handle(
        &self,
        _client: ClientId,
        payload: &[u8],
    ) -> Result<HandlerOutcome, HandlerError> {
        let request: proto::GetEpochRequest = proto::decode(payload)
            .map_err(|code| HandlerError::new(0, code))?;
        let request_id = require_request_id(request.request_id)?;

        let epoch = self
            .db
            .epoch(request.epoch_number)
            .await
            .map_err(|_| HandlerError::new(request_id, WsErrorCode::InternalError))?;

        let response = match epoch {
            Some(e) => proto::EpochResponse {
                request_id,
                found: true,
                epoch_number: e.epoch_number,
                commitment: format!("{:?}", e.commitment),
                finalized: e.finalized,
                witness_count: e.witness_identities.len() as u32,
            },
            None => proto::EpochResponse {
                request_id,
                found: false,
                epoch_number: request.epoch_number,
                commitment: String::new(),
                finalized: false,
                witness_count: 0,
            },
        };
        Ok(HandlerOutcome {
            opcode: Opcode::EpochResponse,
            payload: response.encode_to_vec(),
        })
    }
}

struct GetChainTipHandler {
    status: StatusChannel,
}

#[async_trait]
impl RequestHandler for GetChainTipHandler {
    async fn handle(
        &self,
        _client: ClientId,
        payload: &[u8],
    ) -> Result<HandlerOutcome, HandlerError> {
        let request: proto::GetChainTipRequest = proto::decode(payload)
            .map_err(|code| HandlerError::new(0, code))?;
        let request_id = require_request_id(request.request_id)?;

        let tip = self.status.chain_status().tip;
        let response = proto::ChainTipResponse {
            request_id,
            height: tip.map(|t| t.height()).unwrap_or(0),
            hash: tip.map(|t| format!("{:?}", t.blkid())).unwrap_or_default(),
        };
        Ok(HandlerOutcome {
            opcode: Opcode::ChainTipResponse,
            payload: response.encode_to_vec(),
        })
    }
}

struct SubscribeHandler {
    subs: Arc<SubscriptionManager>,
    topic: Topic,
}

#[async_trait]
impl RequestHandler for SubscribeHandler {
    async fn handle(
        &self,
        client: ClientId,
        payload: &[u8],
    ) -> Result<HandlerOutcome, HandlerError> {
        let request: proto::SubscribeRequest = proto::decode(payload)
            .map_err(|code| HandlerError::new(0, code))?;
        let request_id = require_request_id(request.request_id)?;

        self.subs.subscribe(client, self.topic);
        let ack = proto::SubscribeAck {
            request_id,
            topic: self.topic.as_str().to_string(),
        };
        Ok(HandlerOutcome {
            opcode: Opcode::SubscribeAck,
            payload: ack.encode_to_vec(),
        })
    }
}

struct UnsubscribeHandler {
    subs: Arc<SubscriptionManager>,
}

#[async_trait]
impl RequestHandler for UnsubscribeHandler {
    async fn handle(
        &self,
        client: ClientId,
        payload: &[u8],
    ) -> Result<HandlerOutcome, HandlerError> {
        let request: proto::UnsubscribeRequest = proto::decode(payload)
            .map_err(|code| HandlerError::new(0, code))?;
        let request_id = require_request_id(request.request_id)?;

        let topic = Topic::parse(&request.topic)
            .ok_or(HandlerError::new(request_id, WsErrorCode::InvalidParams))?;
        self.subs.unsubscribe(client, topic);

        let ack = proto::SubscribeAck {
            request_id,
            topic: topic.as_str().to_string(),
        };
        Ok(HandlerOutcome {
            opcode: Opcode::UnsubscribeAck,
            payload: ack.encode_to_vec(),
        })
    }
}

/// Builds the full dispatch table.
pub fn build_registry<D>(
    db: Arc<D>,
    status: StatusChannel,
    subs: Arc<SubscriptionManager>,
) -> OpcodeRegistry
where
    D: HeaderDatabase + TransactionDatabase + WitnessDatabase + EpochDatabase + 'static,
{
    let mut registry = OpcodeRegistry::new();

    registry.register(
        Opcode::GetBlock,
        Opcode::BlockResponse,
        Arc::new(GetBlockHandler {
            db: db.clone(),
            inflight: InflightCache::new(),
        }),
    );
    registry.register(
        Opcode::GetBlockWitnesses,
        Opcode::BlockWitnessesResponse,
        Arc::new(GetBlockWitnessesHandler { db: db.clone() }),
    );
    registry.register(
        Opcode::GetEpoch,
        Opcode::EpochResponse,
        Arc::new(GetEpochHandler { db }),
    );
    registry.register(
        Opcode::GetChainTip,
        Opcode::ChainTipResponse,
        Arc::new(GetChainTipHandler { status }),
    );
    registry.register(
        Opcode::SubscribeBlocks,
        Opcode::SubscribeAck,
        Arc::new(SubscribeHandler {
            subs: subs.clone(),
            topic: Topic::Blocks,
        }),
    );
    registry.register(
        Opcode::SubscribeEpochs,
        Opcode::SubscribeAck,
        Arc::new(SubscribeHandler {
            subs: subs.clone(),
            topic: Topic::Epochs,
        }),
    );
    registry.register(
        Opcode::SubscribeMempool,
        Opcode::SubscribeAck,
        Arc::new(SubscribeHandler {
            subs: subs.clone(),
            topic: Topic::Mempool,
        }),
    );
    registry.register(
        Opcode::Unsubscribe,
        Opcode::UnsubscribeAck,
        Arc::new(UnsubscribeHandler { subs }),
    );

    registry
}

#[cfg(test)]
mod tests {
    use opnet_db::MemDb;
    use opnet_primitives::{Buf32, L1BlockCommitment};

    use super::*;

    fn setup() -> (OpcodeRegistry, Arc<MemDb>, Arc<SubscriptionManager>, StatusChannel) {
        let db = Arc::new(MemDb::new());
        let status = StatusChannel::new();
        let subs = Arc::new(SubscriptionManager::new());
        let registry = build_registry(db.clone(), status.clone(), subs.clone());
        (registry, db, subs, status)
    }

    #[tokio::test]
    async fn test_chain_tip_echoes_request_id() {
        let (registry, _db, _subs, status) = setup();
        status.update_chain_status(|s| {
            s.tip = Some(L1BlockCommitment::new(55, Buf32::new([9; 32])))
        });

        let payload = proto::GetChainTipRequest {
            request_id: Some(42),
        }
        .encode_to_vec();
        let outcome = registry
            .lookup(Opcode::GetChainTip)
            .unwrap()
            .handle(ClientId(1), &payload)
            .await
            .unwrap();

        assert_eq!(outcome.opcode, Opcode::ChainTipResponse);
        let response: proto::ChainTipResponse = proto::decode(&outcome.payload).unwrap();
        assert_eq!(response.request_id, 42);
        assert_eq!(response.height, 55);
    }

    #[tokio::test]
    async fn test_missing_request_id_rejected() {
        let (registry, _db, _subs, _status) = setup();

        let payload = proto::GetChainTipRequest { request_id: None }.encode_to_vec();
        let err = registry
            .lookup(Opcode::GetChainTip)
            .unwrap()
            .handle(ClientId(1), &payload)
            .await
            .unwrap_err();

        assert_eq!(err.code, WsErrorCode::InvalidRequestId);
        assert_eq!(err.request_id, 0);
    }

    #[tokio::test]
    async fn test_negative_request_id_rejected() {
        let (registry, _db, _subs, _status) = setup();

        let payload = proto::GetBlockRequest {
            request_id: Some(-3),
            height: Some(1),
            hash: None,
            include_transactions: false,
        }
        .encode_to_vec();
        let err = registry
            .lookup(Opcode::GetBlock)
            .unwrap()
            .handle(ClientId(1), &payload)
            .await
            .unwrap_err();
        assert_eq!(err.code, WsErrorCode::InvalidRequestId);
    }

    #[tokio::test]
    async fn test_get_block_by_height() {
        let (registry, db, _subs, _status) = setup();
        db.put_headers(vec![opnet_db::HeaderRecord::new(
            3,
            Buf32::new([3; 32]),
            None,
            Buf32::new([4; 32]),
            0,
            0,
            0,
            0,
            2,
            7,
        )])
        .await
        .unwrap();

        let payload = proto::GetBlockRequest {
            request_id: Some(1),
            height: Some(3),
            hash: None,
            include_transactions: false,
        }
        .encode_to_vec();
        let outcome = registry
            .lookup(Opcode::GetBlock)
            .unwrap()
            .handle(ClientId(1), &payload)
            .await
            .unwrap();

        let response: proto::BlockResponse = proto::decode(&outcome.payload).unwrap();
        let header = response.header.unwrap();
        assert_eq!(header.height, 3);
        assert_eq!(header.tx_count, 7);
    }

    #[tokio::test]
    async fn test_subscribe_registers_client() {
        let (registry, _db, subs, _status) = setup();

        let payload = proto::SubscribeRequest {
            request_id: Some(2),
        }
        .encode_to_vec();
        registry
            .lookup(Opcode::SubscribeBlocks)
            .unwrap()
            .handle(ClientId(8), &payload)
            .await
            .unwrap();

        assert!(subs.is_subscribed(ClientId(8), Topic::Blocks));
    }

    #[tokio::test]
    async fn test_unsubscribe_unknown_topic_rejected() {
        let (registry, _db, _subs, _status) = setup();

        let payload = proto::UnsubscribeRequest {
            request_id: Some(3),
            topic: "weather".into(),
        }
        .encode_to_vec();
        let err = registry
            .lookup(Opcode::Unsubscribe)
            .unwrap()
            .handle(ClientId(1), &payload)
            .await
            .unwrap_err();
        assert_eq!(err.code, WsErrorCode::InvalidParams);
        assert_eq!(err.request_id, 3);
    }
}
