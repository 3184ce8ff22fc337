//! Key management service
//!
//! Issues fresh confidential keys on behalf of a node. Each fresh key is bound
//! to an external UUID chosen by the requester, so that an account or other
//! external entity can later find every key issued for it. The node's root
//! key never leaves this service; callers ask it to sign.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use ed25519_dalek::{Signature, Signer, SigningKey};
use rand::rngs::OsRng;
use uuid::Uuid;

use super::keys::{NodeIdentity, Party, PublicKey};
use super::IdentityError;

struct FreshKey {
    signing_key: SigningKey,
    external_id: Uuid,
}

pub struct KeyManagementService {
    identity: NodeIdentity,
    fresh_keys: RwLock<HashMap<PublicKey, FreshKey>>,
}

impl KeyManagementService {
    pub fn new(identity: NodeIdentity) -> Self {
        Self {
            identity,
            fresh_keys: RwLock::new(HashMap::new()),
        }
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    /// Our well-known party.
    pub fn party(&self) -> Party {
        self.identity.party()
    }

    /// Generate a new keypair bound to `external_id` and return its public half.
    ///
    /// Every call produces a distinct key, even for a repeated `external_id`.
    pub fn fresh_key(&self, external_id: Uuid) -> PublicKey {
        let signing_key = SigningKey::generate(&mut OsRng);
        let public: PublicKey = signing_key.verifying_key().into();

        self.fresh_keys
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                public,
                FreshKey {
                    signing_key,
                    external_id,
                },
            );

        log::debug!(
            "{}: fresh key {} for external id {}",
            self.identity.name(),
            public,
            external_id
        );
        public
    }

    /// Whether we hold the private half of `key` (root or fresh).
    pub fn holds(&self, key: &PublicKey) -> bool {
        *key == self.identity.owning_key()
            || self
                .fresh_keys
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .contains_key(key)
    }

    /// The external id a fresh key was issued for.
    pub fn external_id(&self, key: &PublicKey) -> Option<Uuid> {
        self.fresh_keys
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .map(|k| k.external_id)
    }

    /// All fresh keys issued for `external_id`, in key order.
    pub fn keys_for(&self, external_id: Uuid) -> Vec<PublicKey> {
        let keys = self.fresh_keys.read().unwrap_or_else(PoisonError::into_inner);
        let mut found: Vec<PublicKey> = keys
            .iter()
            .filter(|(_, k)| k.external_id == external_id)
            .map(|(public, _)| *public)
            .collect();
        found.sort();
        found
    }

    /// Sign with the root key.
    pub fn sign_with_root(&self, data: &[u8]) -> Signature {
        self.identity.sign(data)
    }

    /// Sign with any key we hold.
    pub fn sign(&self, key: &PublicKey, data: &[u8]) -> Result<Signature, IdentityError> {
        if *key == self.identity.owning_key() {
            return Ok(self.identity.sign(data));
        }
        let keys = self.fresh_keys.read().unwrap_or_else(PoisonError::into_inner);
        let fresh = keys.get(key).ok_or(IdentityError::KeyNotHeld(*key))?;
        Ok(fresh.signing_key.sign(data))
    }
}
