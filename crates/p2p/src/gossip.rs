//! Block-witness gossip: inbound validation and outbound broadcast.

use std::sync::Arc;

use bytes::Bytes;
use opnet_authority::{witness_message, AuthorityManager};
use opnet_db::{HeaderDatabase, WitnessDatabase, WitnessRecord};
use tracing::debug;

use crate::{wire::P2pMessage, P2pError};

/// What became of an inbound witness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundWitness {
    /// Verified and persisted. `complete` is set when the block reached
    /// the minimum distinct trusted identities.
    Stored { complete: bool },
    /// Same identity already attested this block.
    Duplicate,
    /// No local header (unsolicited or out of range); counts toward the
    /// sender's bad-behavior budget.
    UnknownBlock,
    /// Signature not in the active trusted set; the sender must be
    /// blacklisted permanently.
    InvalidSignature,
}

/// Validates inbound witnesses against the trusted-authority set and the
/// local chain, and prepares outbound broadcasts.
pub struct WitnessGossip<D> {
    db: Arc<D>,
    authority: Arc<AuthorityManager>,
    min_witnesses: usize,
}

impl<D> std::fmt::Debug for WitnessGossip<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WitnessGossip").finish_non_exhaustive()
    }
}

impl<D> WitnessGossip<D>
where
    D: HeaderDatabase + WitnessDatabase,
{
    pub fn new(db: Arc<D>, authority: Arc<AuthorityManager>, min_witnesses: usize) -> Self {
        Self {
            db,
            authority,
            min_witnesses,
        }
    }

    /// Inbound processing per the gossip contract: verify against the
    /// trusted set, de-dup by identity, persist, and report completion.
    pub async fn process_inbound(
        &self,
        mut witness: WitnessRecord,
    ) -> Result<InboundWitness, P2pError> {
        let block_number = witness.block_number;

        let Some(checksum_root) = self
            .db
            .header_at(block_number)
            .await?
            .and_then(|h| h.checksum_root)
        else {
            return Ok(InboundWitness::UnknownBlock);
        };

        let message = witness_message(block_number, &checksum_root);
        let Some(matched) = self
            .authority
            .verify_trusted_signature(&message, &witness.signature)
        else {
            return Ok(InboundWitness::InvalidSignature);
        };

        witness.identity = matched.identity;
        witness.trusted = true;

        if !self.db.insert_witness(witness).await? {
            return Ok(InboundWitness::Duplicate);
        }

        let count = self.db.trusted_identity_count(block_number).await?;
        let complete = count >= self.min_witnesses;
        debug!(block_number, count, complete, "stored inbound witness");
        Ok(InboundWitness::Stored { complete })
    }

    /// Serves a witness request from local storage. Peers may receive any
    /// subset of what we know.
    pub async fn serve_request(&self, block_number: u64) -> Result<Vec<WitnessRecord>, P2pError> {
        Ok(self.db.witnesses_at(block_number).await?)
    }

    /// Serializes a locally produced witness once; the same bytes go to
    /// every peer.
    pub fn encode_broadcast(witness: &WitnessRecord) -> Bytes {
        Bytes::from(P2pMessage::BlockWitness(witness.clone()).encode())
    }
}
