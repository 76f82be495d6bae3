//! Development signature schemes.
//!
//! The production deployment supplies the real Schnorr / ML-DSA providers
//! through these seams. The hash-based scheme here is deterministic and
//! self-consistent, good enough for regtest networks where every node
//! runs it.

use opnet_authority::SignatureVerifier;
use opnet_p2p::{IdentifyInfo, IndexerMode, PeerAuthenticator, TxVerifier};
use opnet_plugin::{MlDsaLevel, PluginSignatureVerifier};
use opnet_primitives::{sha256, sha256d, Buf32, Params};

use async_trait::async_trait;

/// `sig = sha256(public_key || message)`.
pub(crate) fn dev_sign(public_key: &[u8], message: &[u8]) -> Vec<u8> {
    let mut input = public_key.to_vec();
    input.extend_from_slice(message);
    sha256(&input).as_ref().to_vec()
}

/// Witness/authority signature verification for dev networks.
#[derive(Debug, Default)]
pub(crate) struct DevSignatureVerifier;

impl SignatureVerifier for DevSignatureVerifier {
    fn verify(&self, message: &[u8], signature: &[u8], public_key: &[u8]) -> bool {
        signature == dev_sign(public_key, message)
    }
}

/// Plugin container signatures for dev networks.
#[derive(Debug, Default)]
pub(crate) struct DevPluginVerifier;

impl PluginSignatureVerifier for DevPluginVerifier {
    fn verify(
        &self,
        _level: MlDsaLevel,
        public_key: &[u8],
        signed_content: &[u8],
        signature: &[u8],
    ) -> bool {
        signature == dev_sign(public_key, signed_content)
    }
}

/// P2P session authentication for dev networks.
#[derive(Debug)]
pub(crate) struct DevAuthenticator {
    identity_key: Vec<u8>,
    agent: String,
    chain_id: u64,
    network: String,
}

impl DevAuthenticator {
    pub(crate) fn new(identity_key: Vec<u8>, params: &Params) -> Self {
        Self {
            identity_key,
            agent: format!("opnet-client/{}", env!("CARGO_PKG_VERSION")),
            chain_id: params.chain_id(),
            network: params.network().to_string(),
        }
    }
}

impl PeerAuthenticator for DevAuthenticator {
    fn local_info(&self) -> IdentifyInfo {
        IdentifyInfo {
            agent: self.agent.clone(),
            protocol_version: 1,
            chain_id: self.chain_id,
            network: self.network.clone(),
            mode: IndexerMode::Full,
            identity: sha256(&self.identity_key),
        }
    }

    fn sign_challenge(&self, nonce: &[u8; 32]) -> (Vec<u8>, Vec<u8>) {
        (
            self.identity_key.clone(),
            dev_sign(&self.identity_key, nonce),
        )
    }

    fn verify_challenge(&self, identity_key: &[u8], nonce: &[u8; 32], signature: &[u8]) -> bool {
        signature == dev_sign(identity_key, nonce)
    }
}

/// Mempool transaction verification: id is the double-SHA of the raw
/// bytes. Wrap/unwrap verification lives in the external verifier.
#[derive(Debug, Default)]
pub(crate) struct DevTxVerifier;

#[async_trait]
impl TxVerifier for DevTxVerifier {
    async fn verify(&self, raw: &[u8]) -> Option<Buf32> {
        (!raw.is_empty()).then(|| sha256d(raw))
    }
}
