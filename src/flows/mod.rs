//! Key-mapping flows
//!
//! Four initiator/responder pairs run over the session protocol engine:
//!
//! - **request key**: ask a counterparty for a signed mapping, either for a
//!   fresh key bound to an external id or for a key it already holds.
//! - **share key**: generate one of our own keys and hand its signed mapping
//!   to a counterparty.
//! - **sync key mappings**: learn the owners of the keys in a transaction or
//!   identity list that we cannot resolve yet.
//! - **confidential identity**: ask a counterparty for a brand-new
//!   confidential identity.
//!
//! Initiators are plain async functions; responders implement
//! `FlowHandler` and are installed in the node's dispatcher.

pub mod confidential;
pub mod error;
pub mod node;
pub mod request_key;
pub mod session;
pub mod share_key;
pub mod sync;

pub use confidential::ConfidentialIdentity;
pub use error::FlowError;
pub use node::{Node, ServiceHub};
pub use session::FlowSession;
pub use sync::{OwnerKeyReader, SyncReport, SyncTarget, Transaction, TransactionOutput};

use std::sync::Arc;

use crate::identity::Party;
use crate::protocol::{FlowRun, ProtocolId, Role};
use crate::registry::SignedKeyMapping;
use crate::transport::Transport;

/// Start an initiator run and open its session.
async fn initiate(
    hub: &ServiceHub,
    transport: &dyn Transport,
    counterparty: &Party,
    protocol: ProtocolId,
) -> Result<(FlowRun, FlowSession), FlowError> {
    if !hub.registry().trust_store().is_trusted(counterparty) {
        return Err(FlowError::UnknownParty(counterparty.name.clone()));
    }

    let mut run = FlowRun::start(
        Arc::clone(hub.checkpoints()),
        protocol,
        Role::Initiator,
        counterparty.name.clone(),
    )?;

    let opened = FlowSession::open(
        transport,
        &counterparty.name,
        protocol,
        hub.config().session_timeout(),
    )
    .await;

    match opened {
        Ok(session) => match run.bind_session(session.session_id()) {
            Ok(()) => Ok((run, session)),
            Err(e) => {
                session.close().await;
                run.fail(e.to_string());
                Err(e)
            }
        },
        Err(e) => {
            run.fail(e.to_string());
            Err(e)
        }
    }
}

/// A mapping handed to us directly by `counterparty` must name it as owner
/// and carry its signature.
fn check_owned_by(signed: &SignedKeyMapping, counterparty: &Party) -> Result<(), FlowError> {
    if signed.owner() != counterparty {
        return Err(FlowError::MappingMismatch(format!(
            "{} claims {} is owned by {}",
            counterparty,
            signed.key(),
            signed.owner()
        )));
    }
    signed.verify()?;
    Ok(())
}
