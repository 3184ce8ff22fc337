use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::flows::FlowError;
use crate::identity::PublicKey;

/// What a key request asks the counterparty for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyRequest {
    /// Generate a fresh key bound to this external id.
    ById(Uuid),
    /// Attest ownership of a key the counterparty already holds.
    ByKey(PublicKey),
}

impl KeyRequest {
    /// Build a request from two optional parts; exactly one must be given.
    pub fn from_parts(id: Option<Uuid>, key: Option<PublicKey>) -> Result<Self, FlowError> {
        match (id, key) {
            (Some(id), None) => Ok(KeyRequest::ById(id)),
            (None, Some(key)) => Ok(KeyRequest::ByKey(key)),
            (Some(_), Some(_)) => Err(FlowError::InvalidArgument(
                "specify either an external id or a known key, not both".to_string(),
            )),
            (None, None) => Err(FlowError::InvalidArgument(
                "specify an external id or a known key".to_string(),
            )),
        }
    }
}
