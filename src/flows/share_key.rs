//! Share one of our own keys with a counterparty.

use async_trait::async_trait;
use uuid::Uuid;

use super::{check_owned_by, initiate, FlowError, FlowSession, ServiceHub};
use crate::identity::Party;
use crate::protocol::{FlowHandler, FlowMessage, FlowRun, FlowState, ProtocolId};
use crate::registry::SignedKeyMapping;
use crate::transport::Transport;

/// Initiator: generate a fresh key for `external_id`, sign its mapping and
/// send it to `counterparty`. Returns once the counterparty has registered it.
pub async fn share_key(
    hub: &ServiceHub,
    transport: &dyn Transport,
    counterparty: &Party,
    external_id: Uuid,
) -> Result<SignedKeyMapping, FlowError> {
    let (mut run, session) = initiate(hub, transport, counterparty, ProtocolId::ShareKey).await?;
    let result = exchange(hub, &session, &mut run, external_id).await;
    session.close().await;
    run.finish(result)
}

async fn exchange(
    hub: &ServiceHub,
    session: &FlowSession,
    run: &mut FlowRun,
    external_id: Uuid,
) -> Result<SignedKeyMapping, FlowError> {
    let key = hub.kms().fresh_key(external_id);
    run.advance(FlowState::KeyGenerated)?;

    let signed = hub.attest_own_key(key, session.session_id())?;
    run.advance(FlowState::Signing)?;
    run.record_mapping(&signed)?;

    session.send(&FlowMessage::SignedMapping(signed.clone())).await?;
    run.advance(FlowState::SignedSent)?;

    match session.recv().await? {
        FlowMessage::Ack => Ok(signed),
        other => Err(other.unexpected("Ack")),
    }
}

/// Responder for `ProtocolId::ShareKey`.
pub struct ShareKeyResponder;

impl ShareKeyResponder {
    /// Validate and register a mapping shared by the session's peer.
    async fn receive(
        hub: &ServiceHub,
        session: &FlowSession,
        run: &mut FlowRun,
    ) -> Result<SignedKeyMapping, FlowError> {
        let signed = match session.recv().await? {
            FlowMessage::SignedMapping(signed) => signed,
            other => return Err(other.unexpected("SignedMapping")),
        };
        run.advance(FlowState::Signing)?;

        let sender = hub.trusted_party(session.peer())?;
        check_owned_by(&signed, &sender)?;
        hub.registry().register(signed.clone())?;
        run.record_mapping(&signed)?;

        session.send(&FlowMessage::Ack).await?;
        run.advance(FlowState::SignedSent)?;
        Ok(signed)
    }
}

#[async_trait]
impl FlowHandler for ShareKeyResponder {
    async fn respond(
        &self,
        hub: &ServiceHub,
        session: &FlowSession,
        run: &mut FlowRun,
    ) -> Result<(), FlowError> {
        let signed = Self::receive(hub, session, run).await?;
        log::info!("{}: {} shared {}", hub.party(), signed.owner(), signed.key());
        Ok(())
    }
}
