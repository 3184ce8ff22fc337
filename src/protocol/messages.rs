//! Wire messages exchanged between nodes, CBOR-encoded.

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use super::{KeyRequest, ProtocolId};
use crate::flows::FlowError;
use crate::identity::PublicKey;
use crate::registry::SignedKeyMapping;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum FlowMessage {
    /// First message on every session.
    SessionInit {
        protocol: ProtocolId,
        initiator: String,
    },
    /// Responder accepted the session and will serve the protocol.
    SessionConfirm,
    KeyRequest(KeyRequest),
    /// Ask the counterparty for a brand-new confidential identity.
    NewIdentityRequest,
    /// A mapping signed by its owner, in either direction.
    SignedMapping(SignedKeyMapping),
    /// Keys the initiator cannot resolve.
    SyncRequest { keys: Vec<PublicKey> },
    /// The mappings the responder is willing to attest, in no particular order.
    SyncResponse { mappings: Vec<SignedKeyMapping> },
    Ack,
    /// Either side can reject, at open time or mid-run.
    Rejected { reason: String },
}

impl FlowMessage {
    pub fn name(&self) -> &'static str {
        match self {
            FlowMessage::SessionInit { .. } => "SessionInit",
            FlowMessage::SessionConfirm => "SessionConfirm",
            FlowMessage::KeyRequest(_) => "KeyRequest",
            FlowMessage::NewIdentityRequest => "NewIdentityRequest",
            FlowMessage::SignedMapping(_) => "SignedMapping",
            FlowMessage::SyncRequest { .. } => "SyncRequest",
            FlowMessage::SyncResponse { .. } => "SyncResponse",
            FlowMessage::Ack => "Ack",
            FlowMessage::Rejected { .. } => "Rejected",
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, FlowError> {
        cbor_serialize(self)
    }

    pub fn decode(data: &[u8]) -> Result<Self, FlowError> {
        cbor_deserialize(data)
    }

    /// The error to raise when this message arrived instead of `expected`.
    /// A rejection from the peer is reported as such.
    pub fn unexpected(self, expected: &'static str) -> FlowError {
        match self {
            FlowMessage::Rejected { reason } => FlowError::Rejected(reason),
            other => FlowError::UnexpectedMessage {
                expected,
                got: other.name(),
            },
        }
    }
}

fn cbor_serialize<T: Serialize>(value: &T) -> Result<Vec<u8>, FlowError> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| FlowError::Serialization(e.to_string()))?;
    Ok(buf)
}

fn cbor_deserialize<T: DeserializeOwned>(data: &[u8]) -> Result<T, FlowError> {
    ciborium::from_reader(data).map_err(|e| FlowError::Serialization(e.to_string()))
}
