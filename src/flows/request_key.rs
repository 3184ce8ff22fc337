//! Request a signed key mapping from a counterparty.
//!
//! By id the responder generates a fresh key bound to the id; by key it only
//! attests a key it already holds and refuses anything else.

use async_trait::async_trait;

use super::{check_owned_by, initiate, FlowError, FlowSession, ServiceHub};
use crate::identity::Party;
use crate::protocol::{FlowHandler, FlowMessage, FlowRun, FlowState, KeyRequest, ProtocolId};
use crate::registry::SignedKeyMapping;
use crate::transport::Transport;

/// Initiator: ask `counterparty` for a signed mapping and register it.
pub async fn request_key(
    hub: &ServiceHub,
    transport: &dyn Transport,
    counterparty: &Party,
    request: KeyRequest,
) -> Result<SignedKeyMapping, FlowError> {
    let (mut run, session) = initiate(hub, transport, counterparty, ProtocolId::RequestKey).await?;
    let result = exchange(hub, &session, &mut run, counterparty, request).await;
    session.close().await;
    run.finish(result)
}

async fn exchange(
    hub: &ServiceHub,
    session: &FlowSession,
    run: &mut FlowRun,
    counterparty: &Party,
    request: KeyRequest,
) -> Result<SignedKeyMapping, FlowError> {
    session.send(&FlowMessage::KeyRequest(request)).await?;
    run.advance(FlowState::AwaitingKeyOrId)?;

    let signed = match session.recv().await? {
        FlowMessage::SignedMapping(signed) => signed,
        other => return Err(other.unexpected("SignedMapping")),
    };

    if let KeyRequest::ByKey(key) = request {
        if signed.key() != key {
            return Err(FlowError::MappingMismatch(format!(
                "asked for {}, got a mapping for {}",
                key,
                signed.key()
            )));
        }
    }
    check_owned_by(&signed, counterparty)?;
    hub.registry().register(signed.clone())?;
    run.record_mapping(&signed)?;

    log::info!("{}: {} is owned by {}", hub.party(), signed.key(), counterparty);
    Ok(signed)
}

/// Responder for `ProtocolId::RequestKey`.
pub struct RequestKeyResponder;

#[async_trait]
impl FlowHandler for RequestKeyResponder {
    async fn respond(
        &self,
        hub: &ServiceHub,
        session: &FlowSession,
        run: &mut FlowRun,
    ) -> Result<(), FlowError> {
        let request = match session.recv().await? {
            FlowMessage::KeyRequest(request) => request,
            other => return Err(other.unexpected("KeyRequest")),
        };

        let key = match request {
            KeyRequest::ById(external_id) => {
                let key = hub.kms().fresh_key(external_id);
                run.advance(FlowState::KeyGenerated)?;
                key
            }
            KeyRequest::ByKey(key) => {
                if !hub.kms().holds(&key) {
                    return Err(FlowError::InvalidArgument(format!(
                        "{} does not hold {}",
                        hub.party(),
                        key
                    )));
                }
                key
            }
        };

        run.advance(FlowState::Signing)?;
        let signed = hub.attest_own_key(key, session.session_id())?;
        run.record_mapping(&signed)?;
        session.send(&FlowMessage::SignedMapping(signed)).await?;
        run.advance(FlowState::SignedSent)?;
        Ok(())
    }
}
