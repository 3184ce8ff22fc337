//! Per-run state machine
//!
//! Responder runs walk `Init → AwaitingKeyOrId → KeyGenerated → Signing →
//! SignedSent → Complete`. Initiators use the same states for their side of
//! the exchange (`AwaitingKeyOrId` while waiting on the counterparty). Any
//! forward step may skip states; `Failed` is reachable from every
//! non-terminal state; nothing leaves a terminal state.

use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::checkpoint::{Checkpoint, CheckpointStore};
use super::ProtocolId;
use crate::flows::FlowError;
use crate::registry::SignedKeyMapping;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowState {
    Init,
    AwaitingKeyOrId,
    KeyGenerated,
    Signing,
    SignedSent,
    Complete,
    Failed { reason: String },
}

impl FlowState {
    fn rank(&self) -> u8 {
        match self {
            FlowState::Init => 0,
            FlowState::AwaitingKeyOrId => 1,
            FlowState::KeyGenerated => 2,
            FlowState::Signing => 3,
            FlowState::SignedSent => 4,
            FlowState::Complete | FlowState::Failed { .. } => 5,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, FlowState::Complete | FlowState::Failed { .. })
    }

    pub fn can_transition_to(&self, next: &FlowState) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            FlowState::Failed { .. } => true,
            _ => next.rank() > self.rank(),
        }
    }
}

impl fmt::Display for FlowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlowState::Failed { reason } => write!(f, "Failed({})", reason),
            other => write!(f, "{:?}", other),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Initiator,
    Responder,
}

/// One protocol run. Every state change is written to the checkpoint store
/// before the run proceeds.
pub struct FlowRun {
    store: Arc<CheckpointStore>,
    checkpoint: Checkpoint,
}

impl FlowRun {
    pub fn start(
        store: Arc<CheckpointStore>,
        protocol: ProtocolId,
        role: Role,
        counterparty: impl Into<String>,
    ) -> Result<Self, FlowError> {
        let checkpoint = Checkpoint {
            run_id: Uuid::new_v4(),
            session_id: None,
            protocol,
            role,
            counterparty: counterparty.into(),
            state: FlowState::Init,
            mapping: None,
            updated_at: Utc::now(),
        };
        store.record(&checkpoint)?;
        Ok(Self { store, checkpoint })
    }

    pub fn run_id(&self) -> Uuid {
        self.checkpoint.run_id
    }

    pub fn state(&self) -> &FlowState {
        &self.checkpoint.state
    }

    pub fn checkpoint(&self) -> &Checkpoint {
        &self.checkpoint
    }

    pub fn bind_session(&mut self, session_id: Uuid) -> Result<(), FlowError> {
        self.checkpoint.session_id = Some(session_id);
        self.checkpoint.updated_at = Utc::now();
        self.store.record(&self.checkpoint)?;
        Ok(())
    }

    /// Attach the mapping this run sent or accepted to its checkpoint.
    pub fn record_mapping(&mut self, signed: &SignedKeyMapping) -> Result<(), FlowError> {
        self.checkpoint.mapping = Some(signed.clone());
        self.checkpoint.updated_at = Utc::now();
        self.store.record(&self.checkpoint)?;
        Ok(())
    }

    pub fn advance(&mut self, next: FlowState) -> Result<(), FlowError> {
        if !self.checkpoint.state.can_transition_to(&next) {
            return Err(FlowError::InvalidState(format!(
                "{} run {}: {} -> {}",
                self.checkpoint.protocol, self.checkpoint.run_id, self.checkpoint.state, next
            )));
        }
        log::debug!(
            "{} {:?} run {}: {} -> {}",
            self.checkpoint.protocol,
            self.checkpoint.role,
            self.checkpoint.run_id,
            self.checkpoint.state,
            next
        );
        self.checkpoint.state = next;
        self.checkpoint.updated_at = Utc::now();
        self.store.record(&self.checkpoint)?;
        Ok(())
    }

    /// Move to `Failed`. A run that already finished is left alone.
    pub fn fail(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        if self.checkpoint.state.is_terminal() {
            return;
        }
        log::warn!(
            "{} {:?} run {} with {} failed: {}",
            self.checkpoint.protocol,
            self.checkpoint.role,
            self.checkpoint.run_id,
            self.checkpoint.counterparty,
            reason
        );
        if let Err(e) = self.advance(FlowState::Failed { reason }) {
            log::warn!("Could not record failure of run {}: {}", self.checkpoint.run_id, e);
        }
    }

    /// Close out the run with the outcome of its body: `Complete` on success,
    /// `Failed` otherwise.
    pub fn finish<T>(&mut self, result: Result<T, FlowError>) -> Result<T, FlowError> {
        match result {
            Ok(value) => {
                self.advance(FlowState::Complete)?;
                Ok(value)
            }
            Err(e) => {
                self.fail(e.to_string());
                Err(e)
            }
        }
    }
}
