//! Protocol id → responder table, consulted when a session is opened.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;

use super::state::FlowRun;
use super::ProtocolId;
use crate::flows::{FlowError, FlowSession, ServiceHub};

/// Responder side of one protocol.
///
/// Called after the session handshake, with the run already bound to the
/// session. Returning an error fails the run and sends the peer a rejection.
#[async_trait]
pub trait FlowHandler: Send + Sync {
    async fn respond(
        &self,
        hub: &ServiceHub,
        session: &FlowSession,
        run: &mut FlowRun,
    ) -> Result<(), FlowError>;
}

#[derive(Default)]
pub struct Dispatcher {
    handlers: RwLock<HashMap<ProtocolId, Arc<dyn FlowHandler>>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install (or replace) the responder for `protocol`.
    pub fn register(&self, protocol: ProtocolId, handler: Arc<dyn FlowHandler>) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(protocol, handler);
    }

    /// Stop serving `protocol`.
    pub fn unregister(&self, protocol: ProtocolId) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&protocol);
    }

    pub fn resolve(&self, protocol: ProtocolId) -> Option<Arc<dyn FlowHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&protocol)
            .cloned()
    }

    pub fn protocols(&self) -> Vec<ProtocolId> {
        let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
        ProtocolId::ALL
            .into_iter()
            .filter(|p| handlers.contains_key(p))
            .collect()
    }
}
