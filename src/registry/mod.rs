//! Key registry: public key → certified owner
//!
//! The registry is the only place key mappings are stored. Inserts are
//! signature-checked against the owner's root key as recorded in the trust
//! store; nothing is ever removed. Reads take a shared lock and never block
//! one another; writes are serialised, which also serialises competing
//! registrations for the same key.

pub mod journal;
pub mod mapping;
pub mod trust;

pub use journal::Journal;
pub use mapping::{KeyMapping, SignedKeyMapping};
pub use trust::TrustStore;

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::identity::{Party, PublicKey};

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Signature on mapping for {0} does not verify")]
    InvalidSignature(PublicKey),

    #[error("Owner {0} is not in the trust store")]
    UnknownOwner(String),

    #[error("A different mapping is already registered for {0}")]
    DuplicateMappingConflict(PublicKey),

    #[error("{owner} cannot sign a mapping for {key}: not our identity")]
    NotOwner { key: PublicKey, owner: String },

    #[error("No mapping registered for {0}")]
    NotFound(PublicKey),

    #[error("Encoding error: {0}")]
    EncodingError(String),

    #[error("IO error: {0}")]
    IoError(String),

    #[error("Journal corrupt: {0}")]
    JournalCorrupt(String),
}

/// Who may see a registered mapping besides us.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Disclosure {
    /// The key is ours.
    Owned,
    /// Learned from a counterparty; never forwarded.
    Confidential,
    /// Learned from a counterparty with explicit permission to forward.
    Shareable,
}

/// A mapping as stored, with its disclosure policy.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RegisteredMapping {
    pub signed: SignedKeyMapping,
    pub disclosure: Disclosure,
    pub registered_at: DateTime<Utc>,
}

/// Outcome of a successful `register`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Registration {
    Inserted,
    AlreadyRegistered,
}

pub struct KeyRegistry {
    trust: Arc<TrustStore>,
    mappings: RwLock<HashMap<PublicKey, RegisteredMapping>>,
    journal: Option<Journal>,
}

impl KeyRegistry {
    /// An in-memory registry.
    pub fn new(trust: Arc<TrustStore>) -> Self {
        Self {
            trust,
            mappings: RwLock::new(HashMap::new()),
            journal: None,
        }
    }

    /// A registry backed by an append-only journal at `path`.
    ///
    /// Existing entries are replayed and re-verified; an entry that fails
    /// verification or contradicts an earlier one makes the whole open fail.
    pub fn open(trust: Arc<TrustStore>, path: &Path) -> Result<Self, RegistryError> {
        let mut mappings: HashMap<PublicKey, RegisteredMapping> = HashMap::new();

        for entry in Journal::read_all(path)? {
            verify_against_trust(&trust, &entry.signed)
                .map_err(|e| RegistryError::JournalCorrupt(e.to_string()))?;
            let key = entry.signed.key();
            match mappings.get(&key) {
                Some(existing) if !existing.signed.mapping.same_binding(&entry.signed.mapping) => {
                    return Err(RegistryError::JournalCorrupt(format!(
                        "conflicting entries for {}",
                        key
                    )));
                }
                // a later entry for the same binding only changes disclosure
                _ => {
                    mappings.insert(key, entry);
                }
            }
        }

        log::info!("Replayed {} key mappings from {}", mappings.len(), path.display());

        Ok(Self {
            trust,
            mappings: RwLock::new(mappings),
            journal: Some(Journal::open(path)?),
        })
    }

    pub fn trust_store(&self) -> &Arc<TrustStore> {
        &self.trust
    }

    /// Register a mapping learned from a counterparty. It will not be forwarded.
    pub fn register(&self, signed: SignedKeyMapping) -> Result<Registration, RegistryError> {
        self.register_with(signed, Disclosure::Confidential)
    }

    /// Register a mapping with an explicit disclosure policy.
    ///
    /// Registering the same binding again is not an error and leaves the
    /// stored entry untouched. A different binding for an already mapped key
    /// fails with `DuplicateMappingConflict`.
    pub fn register_with(
        &self,
        signed: SignedKeyMapping,
        disclosure: Disclosure,
    ) -> Result<Registration, RegistryError> {
        if let Err(e) = verify_against_trust(&self.trust, &signed) {
            log::warn!("Rejected mapping for {}: {}", signed.key(), e);
            return Err(e);
        }

        let key = signed.key();
        let mut mappings = self.mappings.write().unwrap_or_else(PoisonError::into_inner);

        if let Some(existing) = mappings.get(&key) {
            if existing.signed.mapping.same_binding(&signed.mapping) {
                return Ok(Registration::AlreadyRegistered);
            }
            log::warn!(
                "Conflicting mapping for {}: have {}, offered {}",
                key,
                existing.signed.owner(),
                signed.owner()
            );
            return Err(RegistryError::DuplicateMappingConflict(key));
        }

        let entry = RegisteredMapping {
            signed,
            disclosure,
            registered_at: Utc::now(),
        };
        if let Some(journal) = &self.journal {
            journal.append(&entry)?;
        }

        log::debug!("Registered {} -> {} ({:?})", key, entry.signed.owner(), disclosure);
        mappings.insert(key, entry);
        Ok(Registration::Inserted)
    }

    /// Explicitly allow a confidential mapping to be forwarded to others.
    pub fn authorize_sharing(&self, key: &PublicKey) -> Result<(), RegistryError> {
        let mut mappings = self.mappings.write().unwrap_or_else(PoisonError::into_inner);
        let entry = mappings.get_mut(key).ok_or(RegistryError::NotFound(*key))?;
        if entry.disclosure != Disclosure::Confidential {
            return Ok(());
        }

        let mut updated = entry.clone();
        updated.disclosure = Disclosure::Shareable;
        if let Some(journal) = &self.journal {
            journal.append(&updated)?;
        }
        *entry = updated;
        Ok(())
    }

    /// The owner of `key`, if we can resolve it. Trusted parties' root keys
    /// resolve to the parties themselves.
    pub fn lookup(&self, key: &PublicKey) -> Option<Party> {
        let from_mapping = self
            .mappings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .map(|m| m.signed.owner().clone());
        from_mapping.or_else(|| self.trust.party_for_root_key(key))
    }

    /// The subset of `keys` we can already resolve.
    pub fn known_keys(&self, keys: &BTreeSet<PublicKey>) -> BTreeSet<PublicKey> {
        let mappings = self.mappings.read().unwrap_or_else(PoisonError::into_inner);
        keys.iter()
            .filter(|k| mappings.contains_key(k) || self.trust.party_for_root_key(k).is_some())
            .copied()
            .collect()
    }

    /// The stored mapping for `key`.
    pub fn mapping(&self, key: &PublicKey) -> Option<RegisteredMapping> {
        self.mappings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.mappings.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The owner must be trusted under exactly the claimed root key, and the
/// signature must verify against it.
fn verify_against_trust(
    trust: &TrustStore,
    signed: &SignedKeyMapping,
) -> Result<(), RegistryError> {
    let owner = signed.owner();
    let trusted = trust
        .resolve(&owner.name)
        .ok_or_else(|| RegistryError::UnknownOwner(owner.name.clone()))?;
    if trusted.owning_key != owner.owning_key {
        return Err(RegistryError::InvalidSignature(signed.key()));
    }
    signed.verify()
}
