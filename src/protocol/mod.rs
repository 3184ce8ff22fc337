//! Session protocol engine
//!
//! Wire messages, the per-run state machine with its checkpoint store, and
//! the table that maps a protocol id to the responder that serves it.

pub mod checkpoint;
pub mod dispatch;
pub mod messages;
pub mod request;
pub mod state;

pub use checkpoint::{Checkpoint, CheckpointError, CheckpointStore, DEFAULT_FINISHED_HISTORY};
pub use dispatch::{Dispatcher, FlowHandler};
pub use messages::FlowMessage;
pub use request::KeyRequest;
pub use state::{FlowRun, FlowState, Role};

use std::fmt;

use serde::{Deserialize, Serialize};

/// Which initiator/responder pair a session runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProtocolId {
    RequestKey,
    ShareKey,
    SyncKeyMapping,
    ConfidentialIdentity,
}

impl ProtocolId {
    pub const ALL: [ProtocolId; 4] = [
        ProtocolId::RequestKey,
        ProtocolId::ShareKey,
        ProtocolId::SyncKeyMapping,
        ProtocolId::ConfidentialIdentity,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolId::RequestKey => "request-key",
            ProtocolId::ShareKey => "share-key",
            ProtocolId::SyncKeyMapping => "sync-key-mapping",
            ProtocolId::ConfidentialIdentity => "confidential-identity",
        }
    }
}

impl fmt::Display for ProtocolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
