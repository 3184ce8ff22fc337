//! Trust store: which well-known parties we accept, and their root keys.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use crate::identity::{Party, PublicKey};

/// Name → party lookup for every well-known identity this node trusts.
#[derive(Default)]
pub struct TrustStore {
    parties: RwLock<HashMap<String, Party>>,
}

impl TrustStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store that trusts exactly `parties`.
    pub fn with_parties(parties: impl IntoIterator<Item = Party>) -> Self {
        let store = Self::new();
        for party in parties {
            store.trust(party);
        }
        store
    }

    /// Add (or replace) a trusted party.
    pub fn trust(&self, party: Party) {
        self.parties
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(party.name.clone(), party);
    }

    /// The trusted party registered under `name`.
    pub fn resolve(&self, name: &str) -> Option<Party> {
        self.parties
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Whether `party` is trusted with exactly this root key.
    pub fn is_trusted(&self, party: &Party) -> bool {
        self.resolve(&party.name).as_ref() == Some(party)
    }

    /// The trusted party whose root key is `key`.
    pub fn party_for_root_key(&self, key: &PublicKey) -> Option<Party> {
        self.parties
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .find(|p| p.owning_key == *key)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.parties.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
