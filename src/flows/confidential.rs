//! Ask a counterparty for a brand-new confidential identity.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{check_owned_by, initiate, FlowError, FlowSession, ServiceHub};
use crate::identity::{AnonymousParty, Party};
use crate::protocol::{FlowHandler, FlowMessage, FlowRun, FlowState, ProtocolId};
use crate::transport::Transport;

/// An anonymous key together with the well-known party that owns it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfidentialIdentity {
    pub anonymous: AnonymousParty,
    pub well_known: Party,
}

/// Initiator: the counterparty generates a fresh key and certifies it.
pub async fn confidential_identity(
    hub: &ServiceHub,
    transport: &dyn Transport,
    counterparty: &Party,
) -> Result<ConfidentialIdentity, FlowError> {
    let (mut run, session) =
        initiate(hub, transport, counterparty, ProtocolId::ConfidentialIdentity).await?;
    let result = exchange(hub, &session, &mut run, counterparty).await;
    session.close().await;
    run.finish(result)
}

async fn exchange(
    hub: &ServiceHub,
    session: &FlowSession,
    run: &mut FlowRun,
    counterparty: &Party,
) -> Result<ConfidentialIdentity, FlowError> {
    session.send(&FlowMessage::NewIdentityRequest).await?;
    run.advance(FlowState::AwaitingKeyOrId)?;

    let signed = match session.recv().await? {
        FlowMessage::SignedMapping(signed) => signed,
        other => return Err(other.unexpected("SignedMapping")),
    };
    check_owned_by(&signed, counterparty)?;
    hub.registry().register(signed.clone())?;
    run.record_mapping(&signed)?;

    Ok(ConfidentialIdentity {
        anonymous: AnonymousParty::new(signed.key()),
        well_known: counterparty.clone(),
    })
}

/// Responder for `ProtocolId::ConfidentialIdentity`.
pub struct ConfidentialIdentityResponder;

#[async_trait]
impl FlowHandler for ConfidentialIdentityResponder {
    async fn respond(
        &self,
        hub: &ServiceHub,
        session: &FlowSession,
        run: &mut FlowRun,
    ) -> Result<(), FlowError> {
        match session.recv().await? {
            FlowMessage::NewIdentityRequest => {}
            other => return Err(other.unexpected("NewIdentityRequest")),
        }

        let key = hub.kms().fresh_key(Uuid::new_v4());
        run.advance(FlowState::KeyGenerated)?;

        run.advance(FlowState::Signing)?;
        let signed = hub.attest_own_key(key, session.session_id())?;
        run.record_mapping(&signed)?;
        session.send(&FlowMessage::SignedMapping(signed)).await?;
        run.advance(FlowState::SignedSent)?;

        log::info!("{}: issued confidential identity {} to {}", hub.party(), key, session.peer());
        Ok(())
    }
}
