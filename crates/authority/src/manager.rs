//! Active-set queries and consensus upgrade handling.

use std::{collections::HashMap, sync::Arc};

use opnet_primitives::Buf32;
use tracing::{error, info};

use crate::{
    set::AuthorityKeySet, shuffle::secure_shuffle, AuthorityError, SignatureVerifier,
};

/// Result of matching a trusted signature: which identity produced it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignatureMatch {
    pub identity: Buf32,
    pub entity_name: String,
}

/// Decides whether the node follows a consensus upgrade. Refusal is fatal
/// to the node, by contract.
pub trait ConsensusUpgradePolicy: Send + Sync {
    fn accepts(&self, new_version: u16) -> bool;
}

/// Accepts every upgrade; the default for fully-managed deployments.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAllUpgrades;

impl ConsensusUpgradePolicy for AcceptAllUpgrades {
    fn accepts(&self, _new_version: u16) -> bool {
        true
    }
}

/// Holds every loaded key set and the constraint knobs for subset
/// selection.
pub struct AuthorityManager {
    sets: HashMap<u16, AuthorityKeySet>,
    active_version: u16,
    verifier: Arc<dyn SignatureVerifier>,
    max_keys_per_entity: usize,
    min_total_keys: usize,
    min_entities: usize,
}

impl std::fmt::Debug for AuthorityManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthorityManager")
            .field("active_version", &self.active_version)
            .field("sets", &self.sets.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl AuthorityManager {
    pub fn new(
        initial: AuthorityKeySet,
        verifier: Arc<dyn SignatureVerifier>,
        max_keys_per_entity: usize,
        min_total_keys: usize,
        min_entities: usize,
    ) -> Self {
        let active_version = initial.version();
        let mut sets = HashMap::new();
        sets.insert(active_version, initial);
        Self {
            sets,
            active_version,
            verifier,
            max_keys_per_entity,
            min_total_keys,
            min_entities,
        }
    }

    pub fn active_version(&self) -> u16 {
        self.active_version
    }

    pub fn active_set(&self) -> &AuthorityKeySet {
        // The constructor guarantees the active version is present.
        &self.sets[&self.active_version]
    }

    /// Registers a key set for a future consensus version.
    pub fn register_set(&mut self, set: AuthorityKeySet) {
        self.sets.insert(set.version(), set);
    }

    /// Selects a shuffled validator subset obeying the per-entity cap and
    /// the global minima.
    pub fn trusted_keys_respecting_constraints(&self) -> Result<Vec<Vec<u8>>, AuthorityError> {
        let set = self.active_set();

        let mut picked: Vec<Vec<u8>> = Vec::new();
        let mut entities_hit = 0usize;

        for entity in set.entities() {
            let mut keys: Vec<&[u8]> = entity.keys.iter().map(|k| k.public_key.as_slice()).collect();
            if keys.is_empty() {
                continue;
            }
            secure_shuffle(&mut keys);
            let take = keys.len().min(self.max_keys_per_entity);
            picked.extend(keys[..take].iter().map(|k| k.to_vec()));
            entities_hit += 1;
        }

        if entities_hit < self.min_entities {
            return Err(AuthorityError::ConstraintsUnsatisfiable(format!(
                "only {entities_hit} entities contribute, need {}",
                self.min_entities
            )));
        }
        if picked.len() < self.min_total_keys {
            return Err(AuthorityError::ConstraintsUnsatisfiable(format!(
                "only {} keys selectable, need {}",
                picked.len(),
                self.min_total_keys
            )));
        }

        secure_shuffle(&mut picked);
        Ok(picked)
    }

    /// Tries every key in the active set until one verifies `signature`
    /// over `data`. Returns the matching identity.
    pub fn verify_trusted_signature(&self, data: &[u8], signature: &[u8]) -> Option<SignatureMatch> {
        let set = self.active_set();
        for entity in set.entities() {
            for key in &entity.keys {
                if self.verifier.verify(data, signature, &key.public_key) {
                    return Some(SignatureMatch {
                        identity: key.identity(),
                        entity_name: entity.name.clone(),
                    });
                }
            }
        }
        None
    }

    /// Checks that a presented key list satisfies the same constraints the
    /// local node applies when selecting validators: all keys known, the
    /// per-entity cap respected, the minima met.
    pub fn verify_public_keys_constraints(&self, keys: &[Vec<u8>]) -> Result<(), AuthorityError> {
        let set = self.active_set();
        let mut per_entity: HashMap<&str, usize> = HashMap::new();

        for key in keys {
            let (entity, _) = set.find_public_key(key).ok_or_else(|| {
                AuthorityError::ConstraintsUnsatisfiable("unknown public key presented".into())
            })?;
            let count = per_entity.entry(entity.name.as_str()).or_insert(0);
            *count += 1;
            if *count > self.max_keys_per_entity {
                return Err(AuthorityError::ConstraintsUnsatisfiable(format!(
                    "entity {} exceeds per-entity cap",
                    entity.name
                )));
            }
        }

        if per_entity.len() < self.min_entities {
            return Err(AuthorityError::ConstraintsUnsatisfiable(format!(
                "keys span {} entities, need {}",
                per_entity.len(),
                self.min_entities
            )));
        }
        if keys.len() < self.min_total_keys {
            return Err(AuthorityError::ConstraintsUnsatisfiable(format!(
                "{} keys presented, need {}",
                keys.len(),
                self.min_total_keys
            )));
        }

        Ok(())
    }

    /// Switches the active set on a consensus upgrade. A policy refusal is
    /// fatal: the caller must halt the node after the diagnostic.
    pub fn apply_consensus_upgrade(
        &mut self,
        new_version: u16,
        policy: &dyn ConsensusUpgradePolicy,
    ) -> Result<(), AuthorityError> {
        if !policy.accepts(new_version) {
            error!(
                new_version,
                "NODE HALT: consensus upgrade refused by policy; refusing to follow the new \
                 consensus rules"
            );
            return Err(AuthorityError::UpgradeRefused(new_version));
        }
        if !self.sets.contains_key(&new_version) {
            return Err(AuthorityError::UnknownVersion(new_version));
        }
        info!(
            old_version = self.active_version,
            new_version, "switching trusted authority set"
        );
        self.active_version = new_version;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use opnet_primitives::NetworkId;

    use super::*;
    use crate::set::test_utils::{make_entity, make_key, StubVerifier};

    fn make_manager(max_per_entity: usize, min_total: usize, min_entities: usize) -> AuthorityManager {
        let set = AuthorityKeySet::load(
            1,
            0,
            NetworkId::Regtest,
            vec![
                make_entity("alpha", &[1, 2, 3]),
                make_entity("beta", &[4, 5]),
                make_entity("gamma", &[6]),
            ],
            &StubVerifier,
            1,
        )
        .unwrap();
        AuthorityManager::new(set, Arc::new(StubVerifier), max_per_entity, min_total, min_entities)
    }

    #[test]
    fn test_constraint_selection_respects_caps() {
        let manager = make_manager(2, 3, 2);
        let keys = manager.trusted_keys_respecting_constraints().unwrap();

        // alpha contributes at most 2, beta 2, gamma 1.
        assert!(keys.len() <= 5 && keys.len() >= 3);

        let alpha_keys: HashSet<Vec<u8>> =
            [vec![1u8; 8], vec![2u8; 8], vec![3u8; 8]].into_iter().collect();
        let from_alpha = keys.iter().filter(|k| alpha_keys.contains(*k)).count();
        assert!(from_alpha <= 2);
    }

    #[test]
    fn test_constraint_selection_fails_when_minima_unmet() {
        let manager = make_manager(1, 10, 2);
        assert!(matches!(
            manager.trusted_keys_respecting_constraints(),
            Err(AuthorityError::ConstraintsUnsatisfiable(_))
        ));
    }

    #[test]
    fn test_verify_trusted_signature_finds_identity() {
        let manager = make_manager(2, 3, 2);
        let data = b"payload".to_vec();
        // StubVerifier accepts sig = message || public_key.
        let mut sig = data.clone();
        sig.extend_from_slice(&[4u8; 8]);

        let matched = manager.verify_trusted_signature(&data, &sig).unwrap();
        assert_eq!(matched.entity_name, "beta");
        assert_eq!(matched.identity, make_key(4).identity());
    }

    #[test]
    fn test_verify_trusted_signature_rejects_unknown_key() {
        let manager = make_manager(2, 3, 2);
        let data = b"payload".to_vec();
        let mut sig = data.clone();
        sig.extend_from_slice(&[99u8; 8]);
        assert!(manager.verify_trusted_signature(&data, &sig).is_none());
    }

    #[test]
    fn test_public_key_constraints() {
        let manager = make_manager(2, 3, 2);

        // Valid: 2 from alpha, 1 from beta.
        manager
            .verify_public_keys_constraints(&[vec![1; 8], vec![2; 8], vec![4; 8]])
            .unwrap();

        // Per-entity cap exceeded.
        assert!(manager
            .verify_public_keys_constraints(&[vec![1; 8], vec![2; 8], vec![3; 8]])
            .is_err());

        // Too few entities.
        assert!(manager
            .verify_public_keys_constraints(&[vec![1; 8], vec![2; 8]])
            .is_err());
    }

    #[test]
    fn test_upgrade_refusal_is_fatal() {
        let mut manager = make_manager(2, 3, 2);

        struct RefuseAll;
        impl ConsensusUpgradePolicy for RefuseAll {
            fn accepts(&self, _v: u16) -> bool {
                false
            }
        }

        assert!(matches!(
            manager.apply_consensus_upgrade(2, &RefuseAll),
            Err(AuthorityError::UpgradeRefused(2))
        ));
        assert_eq!(manager.active_version(), 1);
    }

    #[test]
    fn test_upgrade_switches_active_set() {
        let mut manager = make_manager(2, 3, 2);
        let v2 = AuthorityKeySet::load(
            2,
            0,
            NetworkId::Regtest,
            vec![make_entity("alpha", &[7, 8]), make_entity("beta", &[9])],
            &StubVerifier,
            1,
        )
        .unwrap();
        manager.register_set(v2);

        manager
            .apply_consensus_upgrade(2, &AcceptAllUpgrades)
            .unwrap();
        assert_eq!(manager.active_version(), 2);
        assert!(manager.active_set().find_public_key(&[7; 8]).is_some());
    }
}
