//! Key mappings and their signed form
//!
//! A mapping binds a (usually confidential) public key to its well-known
//! owner. The owner proves the binding by signing the SHA-256 digest of the
//! mapping's canonical CBOR encoding with its root key. Only `key` and
//! `owner` are covered by the signature: `created_by` records which session
//! produced the mapping and may differ between two copies of the same binding.

use ed25519_dalek::Signature;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::identity::{KeyManagementService, Party, PublicKey};

use super::RegistryError;

/// Association between a public key and the party that owns it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyMapping {
    pub key: PublicKey,
    pub owner: Party,
    /// Session that produced this mapping, if any.
    pub created_by: Option<Uuid>,
}

/// The signed portion of a mapping, in a fixed field order.
#[derive(Serialize)]
struct CanonicalMapping<'a> {
    key: &'a PublicKey,
    owner_name: &'a str,
    owner_key: &'a PublicKey,
}

impl KeyMapping {
    pub fn new(key: PublicKey, owner: Party) -> Self {
        Self {
            key,
            owner,
            created_by: None,
        }
    }

    pub fn with_session(mut self, session_id: Uuid) -> Self {
        self.created_by = Some(session_id);
        self
    }

    /// CBOR encoding of the signed fields.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, RegistryError> {
        let canonical = CanonicalMapping {
            key: &self.key,
            owner_name: &self.owner.name,
            owner_key: &self.owner.owning_key,
        };
        let mut buf = Vec::new();
        ciborium::into_writer(&canonical, &mut buf)
            .map_err(|e| RegistryError::EncodingError(e.to_string()))?;
        Ok(buf)
    }

    /// SHA-256 of the canonical encoding; this is what gets signed.
    pub fn digest(&self) -> Result<[u8; 32], RegistryError> {
        let bytes = self.canonical_bytes()?;
        Ok(Sha256::digest(&bytes).into())
    }

    /// Same key bound to the same owner, ignoring provenance.
    pub fn same_binding(&self, other: &KeyMapping) -> bool {
        self.key == other.key && self.owner == other.owner
    }
}

/// A key mapping together with the owner's signature over it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedKeyMapping {
    pub mapping: KeyMapping,
    pub signature: Signature,
}

impl SignedKeyMapping {
    /// Sign `mapping` with our root key. The mapping must name us as owner.
    pub fn sign(mapping: KeyMapping, kms: &KeyManagementService) -> Result<Self, RegistryError> {
        let us = kms.party();
        if mapping.owner != us {
            return Err(RegistryError::NotOwner {
                key: mapping.key,
                owner: mapping.owner.name.clone(),
            });
        }
        let digest = mapping.digest()?;
        let signature = kms.sign_with_root(&digest);
        Ok(Self { mapping, signature })
    }

    /// Generate a fresh key bound to `external_id` and sign its mapping to us.
    pub fn for_fresh_key(
        kms: &KeyManagementService,
        external_id: Uuid,
        session_id: Option<Uuid>,
    ) -> Result<Self, RegistryError> {
        let key = kms.fresh_key(external_id);
        Self::for_known_key(kms, key, session_id)
    }

    /// Sign a mapping from an already existing key to us. No key is generated.
    pub fn for_known_key(
        kms: &KeyManagementService,
        key: PublicKey,
        session_id: Option<Uuid>,
    ) -> Result<Self, RegistryError> {
        let mut mapping = KeyMapping::new(key, kms.party());
        mapping.created_by = session_id;
        Self::sign(mapping, kms)
    }

    pub fn key(&self) -> PublicKey {
        self.mapping.key
    }

    pub fn owner(&self) -> &Party {
        &self.mapping.owner
    }

    /// Check the signature against the root key the mapping claims as owner.
    ///
    /// This alone does not make the mapping trustworthy: the caller must also
    /// know that the claimed root key really belongs to the claimed name.
    pub fn verify(&self) -> Result<(), RegistryError> {
        let digest = self.mapping.digest()?;
        if self.mapping.owner.owning_key.verify(&digest, &self.signature) {
            Ok(())
        } else {
            Err(RegistryError::InvalidSignature(self.mapping.key))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::NodeIdentity;

    fn kms(name: &str) -> KeyManagementService {
        KeyManagementService::new(NodeIdentity::generate(name))
    }

    #[test]
    fn test_fresh_key_mapping_verifies() {
        let alice = kms("O=Alice,L=London,C=GB");
        let external_id = Uuid::new_v4();
        let signed = SignedKeyMapping::for_fresh_key(&alice, external_id, None).unwrap();

        assert_eq!(signed.owner(), &alice.party());
        assert!(alice.holds(&signed.key()));
        assert_eq!(alice.external_id(&signed.key()), Some(external_id));
        signed.verify().unwrap();
    }

    #[test]
    fn test_known_key_mapping_does_not_generate() {
        let alice = kms("O=Alice,L=London,C=GB");
        let key = alice.fresh_key(Uuid::new_v4());
        let signed = SignedKeyMapping::for_known_key(&alice, key, Some(Uuid::new_v4())).unwrap();

        assert_eq!(signed.key(), key);
        signed.verify().unwrap();
    }

    #[test]
    fn test_session_id_is_not_signed() {
        let alice = kms("O=Alice,L=London,C=GB");
        let mut signed = SignedKeyMapping::for_fresh_key(&alice, Uuid::new_v4(), None).unwrap();
        signed.mapping.created_by = Some(Uuid::new_v4());
        signed.verify().unwrap();
    }

    #[test]
    fn test_tampered_owner_fails() {
        let alice = kms("O=Alice,L=London,C=GB");
        let mallory = kms("O=Mallory,L=Nowhere,C=XX");
        let mut signed = SignedKeyMapping::for_fresh_key(&alice, Uuid::new_v4(), None).unwrap();

        // claim mallory owns the key, keep alice's signature
        signed.mapping.owner = mallory.party();
        assert!(matches!(signed.verify(), Err(RegistryError::InvalidSignature(_))));
    }

    #[test]
    fn test_cannot_sign_for_someone_else() {
        let alice = kms("O=Alice,L=London,C=GB");
        let bob = kms("O=Bob,L=Paris,C=FR");
        let key = alice.fresh_key(Uuid::new_v4());

        let mapping = KeyMapping::new(key, bob.party());
        assert!(matches!(
            SignedKeyMapping::sign(mapping, &alice),
            Err(RegistryError::NotOwner { .. })
        ));
    }

    #[test]
    fn test_canonical_bytes_ignore_provenance() {
        let alice = kms("O=Alice,L=London,C=GB");
        let key = alice.fresh_key(Uuid::new_v4());
        let a = KeyMapping::new(key, alice.party());
        let b = a.clone().with_session(Uuid::new_v4());

        assert_eq!(a.canonical_bytes().unwrap(), b.canonical_bytes().unwrap());
        assert!(a.same_binding(&b));
        assert_ne!(a, b);
    }
}
