//! Validated trusted-authority key sets.

use std::collections::HashSet;

use opnet_primitives::{sha256, Buf32, NetworkId};
use serde::{Deserialize, Serialize};

use crate::{AuthorityError, SignatureVerifier};

/// One `(publicKey, long-term key, self-signature)` triple owned by an
/// entity.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustedKey {
    pub public_key: Vec<u8>,
    /// The entity's OP_NET long-term key; its hash is the witness
    /// identity.
    pub opnet_key: Vec<u8>,
    /// Signature of `public_key` under `opnet_key`.
    pub self_signature: Vec<u8>,
}

impl TrustedKey {
    /// Identity derived from the long-term key.
    pub fn identity(&self) -> Buf32 {
        sha256(&self.opnet_key)
    }
}

/// A named operator contributing keys to the authority set.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustedEntity {
    pub name: String,
    pub keys: Vec<TrustedKey>,
}

/// Key set for one `(authority_version, chain_id, network)` scope,
/// validated at construction and immutable afterwards.
#[derive(Clone, Debug)]
pub struct AuthorityKeySet {
    version: u16,
    chain_id: u64,
    network: NetworkId,
    entities: Vec<TrustedEntity>,
}

impl AuthorityKeySet {
    /// Validates and builds a key set. Every triple's self-signature must
    /// verify, no long-term key may repeat across entities, and the total
    /// key count must meet `min_keys`.
    pub fn load(
        version: u16,
        chain_id: u64,
        network: NetworkId,
        entities: Vec<TrustedEntity>,
        verifier: &dyn SignatureVerifier,
        min_keys: usize,
    ) -> Result<Self, AuthorityError> {
        let mut seen = HashSet::new();
        let mut total = 0usize;

        for entity in &entities {
            for key in &entity.keys {
                if !verifier.verify(&key.public_key, &key.self_signature, &key.opnet_key) {
                    return Err(AuthorityError::InvalidSelfSignature(entity.name.clone()));
                }
                if !seen.insert(key.opnet_key.clone()) {
                    return Err(AuthorityError::DuplicateKey);
                }
                total += 1;
            }
        }

        if total < min_keys {
            return Err(AuthorityError::TooFewKeys {
                got: total,
                min: min_keys,
            });
        }

        Ok(Self {
            version,
            chain_id,
            network,
            entities,
        })
    }

    pub fn version(&self) -> u16 {
        self.version
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub fn network(&self) -> NetworkId {
        self.network
    }

    pub fn entities(&self) -> &[TrustedEntity] {
        &self.entities
    }

    pub fn key_count(&self) -> usize {
        self.entities.iter().map(|e| e.keys.len()).sum()
    }

    /// Looks up the entity and key matching a public key, if present.
    pub fn find_public_key(&self, public_key: &[u8]) -> Option<(&TrustedEntity, &TrustedKey)> {
        self.entities.iter().find_map(|e| {
            e.keys
                .iter()
                .find(|k| k.public_key == public_key)
                .map(|k| (e, k))
        })
    }
}

#[cfg(test)]
pub(crate) mod test_utils {
    use super::*;

    /// Verifier accepting signatures of the form `sig = message ||
    /// public_key`, good enough to exercise set validation determinately.
    #[derive(Debug, Default)]
    pub(crate) struct StubVerifier;

    impl SignatureVerifier for StubVerifier {
        fn verify(&self, message: &[u8], signature: &[u8], public_key: &[u8]) -> bool {
            let mut expect = message.to_vec();
            expect.extend_from_slice(public_key);
            signature == expect
        }
    }

    pub(crate) fn make_key(tag: u8) -> TrustedKey {
        let public_key = vec![tag; 8];
        let opnet_key = vec![tag.wrapping_add(100); 8];
        let mut self_signature = public_key.clone();
        self_signature.extend_from_slice(&opnet_key);
        TrustedKey {
            public_key,
            opnet_key,
            self_signature,
        }
    }

    pub(crate) fn make_entity(name: &str, tags: &[u8]) -> TrustedEntity {
        TrustedEntity {
            name: name.to_string(),
            keys: tags.iter().map(|t| make_key(*t)).collect(),
        }
    }
}
