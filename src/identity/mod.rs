//! Parties, keys and key management
//!
//! This module provides the identity foundation for key mapping:
//! - `PublicKey`: an Ed25519 verifying key usable as a map key
//! - `Party` / `AnonymousParty` / `AbstractParty`: well-known and confidential identities
//! - `NodeIdentity`: a node's name plus its root Ed25519 signing key
//! - `KeyManagementService`: fresh confidential keys bound to an external UUID

pub mod keys;
pub mod kms;

pub use keys::{AbstractParty, AnonymousParty, NodeIdentity, Party, PublicKey};
pub use kms::KeyManagementService;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    #[error("Invalid key material: {0}")]
    InvalidKeyMaterial(String),

    #[error("No private key held for {0}")]
    KeyNotHeld(PublicKey),
}
