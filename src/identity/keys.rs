//! Public keys, parties and the node's root identity
//!
//! A node has exactly one well-known identity: a stable name plus an Ed25519
//! root signing key. Confidential identities are bare public keys whose owner
//! is only known to parties holding a signed key mapping.

use std::fmt;
use std::path::Path;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use super::IdentityError;

/// An Ed25519 public key in its 32-byte compressed form.
///
/// Kept as raw bytes so it can be hashed, ordered and used as a map key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PublicKey([u8; 32]);

impl PublicKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Decode into a verifying key. Fails for byte strings that are not a
    /// valid curve point.
    pub fn verifying_key(&self) -> Result<VerifyingKey, IdentityError> {
        VerifyingKey::from_bytes(&self.0)
            .map_err(|e| IdentityError::InvalidKeyMaterial(e.to_string()))
    }

    /// Verify `signature` over `data` with this key.
    pub fn verify(&self, data: &[u8], signature: &Signature) -> bool {
        match self.verifying_key() {
            Ok(vk) => vk.verify(data, signature).is_ok(),
            Err(_) => false,
        }
    }
}

impl From<VerifyingKey> for PublicKey {
    fn from(vk: VerifyingKey) -> Self {
        Self(vk.to_bytes())
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // first 8 bytes is plenty to tell keys apart in logs
        write!(f, "PublicKey({}..)", hex::encode(&self.0[..8]))
    }
}

/// A well-known identity: a stable name and its root signing key.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Party {
    pub name: String,
    pub owning_key: PublicKey,
}

impl Party {
    pub fn new(name: impl Into<String>, owning_key: PublicKey) -> Self {
        Self {
            name: name.into(),
            owning_key,
        }
    }
}

impl fmt::Display for Party {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// A confidential identity: a key whose owner is not disclosed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AnonymousParty {
    pub owning_key: PublicKey,
}

impl AnonymousParty {
    pub fn new(owning_key: PublicKey) -> Self {
        Self { owning_key }
    }
}

/// Either kind of party, as found in transaction outputs.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AbstractParty {
    WellKnown(Party),
    Anonymous(AnonymousParty),
}

impl AbstractParty {
    pub fn owning_key(&self) -> PublicKey {
        match self {
            AbstractParty::WellKnown(party) => party.owning_key,
            AbstractParty::Anonymous(anon) => anon.owning_key,
        }
    }

    pub fn is_anonymous(&self) -> bool {
        matches!(self, AbstractParty::Anonymous(_))
    }
}

impl From<Party> for AbstractParty {
    fn from(party: Party) -> Self {
        AbstractParty::WellKnown(party)
    }
}

impl From<AnonymousParty> for AbstractParty {
    fn from(anon: AnonymousParty) -> Self {
        AbstractParty::Anonymous(anon)
    }
}

/// Serializable form of a NodeIdentity (for persistence).
/// Zeroized on drop.
#[derive(Serialize, Deserialize)]
struct NodeIdentityStore {
    name: String,
    signing_key_bytes: [u8; 32],
}

impl Drop for NodeIdentityStore {
    fn drop(&mut self) {
        self.signing_key_bytes.zeroize();
    }
}

/// A node's well-known identity together with its root signing key.
pub struct NodeIdentity {
    name: String,
    signing_key: SigningKey,
}

impl NodeIdentity {
    /// Generate a new identity with a random root key.
    pub fn generate(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn owning_key(&self) -> PublicKey {
        self.signing_key.verifying_key().into()
    }

    /// The public, shareable view of this identity.
    pub fn party(&self) -> Party {
        Party::new(self.name.clone(), self.owning_key())
    }

    /// Sign arbitrary data with the root key.
    pub fn sign(&self, data: &[u8]) -> Signature {
        self.signing_key.sign(data)
    }

    /// Load from a JSON keystore file.
    pub fn load(path: &Path) -> Result<Self, IdentityError> {
        let data = std::fs::read(path).map_err(|e| IdentityError::IoError(e.to_string()))?;
        let store: NodeIdentityStore = serde_json::from_slice(&data)
            .map_err(|e| IdentityError::DeserializationError(e.to_string()))?;

        Ok(Self {
            name: store.name.clone(),
            signing_key: SigningKey::from_bytes(&store.signing_key_bytes),
        })
    }

    /// Persist to a JSON keystore file.
    pub fn save(&self, path: &Path) -> Result<(), IdentityError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| IdentityError::IoError(e.to_string()))?;
        }

        let store = NodeIdentityStore {
            name: self.name.clone(),
            signing_key_bytes: self.signing_key.to_bytes(),
        };

        let json = serde_json::to_string_pretty(&store)
            .map_err(|e| IdentityError::SerializationError(e.to_string()))?;

        std::fs::write(path, json).map_err(|e| IdentityError::IoError(e.to_string()))?;

        Ok(())
    }

    /// Load from path if it exists, otherwise generate and save.
    pub fn load_or_generate(path: &Path, name: &str) -> Result<Self, IdentityError> {
        if path.exists() {
            Self::load(path)
        } else {
            let identity = Self::generate(name);
            identity.save(path)?;
            Ok(identity)
        }
    }
}

impl fmt::Debug for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeIdentity")
            .field("name", &self.name)
            .field("owning_key", &self.owning_key())
            .finish()
    }
}
