use thiserror::Error;

use crate::identity::{IdentityError, PublicKey};
use crate::protocol::CheckpointError;
use crate::registry::RegistryError;
use crate::transport::TransportError;

/// Errors surfaced by the flows and the node runtime.
#[derive(Error, Debug)]
pub enum FlowError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid signature on mapping for {0}")]
    InvalidSignature(PublicKey),

    #[error("A different mapping is already registered for {0}")]
    DuplicateMappingConflict(PublicKey),

    #[error("Session failure: {0}")]
    SessionFailure(#[from] TransportError),

    #[error("Rejected by counterparty: {0}")]
    Rejected(String),

    #[error("Unexpected message: expected {expected}, got {got}")]
    UnexpectedMessage {
        expected: &'static str,
        got: &'static str,
    },

    #[error("Returned mapping does not match the request: {0}")]
    MappingMismatch(String),

    #[error("Unknown party: {0}")]
    UnknownParty(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),

    #[error("Registry error: {0}")]
    Registry(RegistryError),
}

impl From<RegistryError> for FlowError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::InvalidSignature(key) => FlowError::InvalidSignature(key),
            RegistryError::DuplicateMappingConflict(key) => {
                FlowError::DuplicateMappingConflict(key)
            }
            RegistryError::UnknownOwner(name) => FlowError::UnknownParty(name),
            other => FlowError::Registry(other),
        }
    }
}

impl FlowError {
    /// Whether the transport let us down, as opposed to the protocol.
    pub fn is_session_failure(&self) -> bool {
        matches!(self, FlowError::SessionFailure(_))
    }
}
