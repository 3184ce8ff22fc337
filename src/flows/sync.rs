//! Transitive key-mapping sync
//!
//! The party missing mappings pulls them: it collects the keys of a
//! transaction's confidential output owners (or of an explicit identity
//! list), drops the ones it can already resolve, and asks a counterparty for
//! the rest in a single session. Nothing to ask means no session at all.
//!
//! The responder attests, per key:
//! 1. a key it holds: a freshly signed `key → self` mapping;
//! 2. a mapping registered as `Shareable`: the stored owner-signed copy;
//! 3. anything else, including confidential third-party mappings: nothing.
//!
//! Keys are handled one at a time on both sides. A key the responder fails to
//! attest is left out of the response, and every returned mapping is checked
//! and registered on its own; one bad entry does not spoil the batch.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{initiate, FlowError, FlowSession, ServiceHub};
use crate::identity::{AbstractParty, Party, PublicKey};
use crate::protocol::{FlowHandler, FlowMessage, FlowRun, FlowState, ProtocolId};
use crate::registry::{Disclosure, Registration, SignedKeyMapping};
use crate::transport::Transport;

/// Anything that can list the owners of its outputs.
pub trait OwnerKeyReader: Send + Sync {
    fn output_owners(&self) -> Vec<AbstractParty>;
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionOutput {
    pub owner: AbstractParty,
    pub state: String,
}

/// The slice of a transaction sync cares about.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Uuid,
    pub outputs: Vec<TransactionOutput>,
}

impl Transaction {
    pub fn new(outputs: Vec<TransactionOutput>) -> Self {
        Self {
            id: Uuid::new_v4(),
            outputs,
        }
    }
}

impl OwnerKeyReader for Transaction {
    fn output_owners(&self) -> Vec<AbstractParty> {
        self.outputs.iter().map(|o| o.owner.clone()).collect()
    }
}

/// What to sync mappings for.
#[derive(Clone)]
pub enum SyncTarget {
    /// The confidential owners of a transaction's outputs.
    Transaction(Arc<dyn OwnerKeyReader>),
    /// These identities, anonymous or not.
    Identities(Vec<AbstractParty>),
}

impl SyncTarget {
    pub fn transaction(tx: impl OwnerKeyReader + 'static) -> Self {
        SyncTarget::Transaction(Arc::new(tx))
    }

    pub fn keys(&self) -> BTreeSet<PublicKey> {
        match self {
            SyncTarget::Transaction(reader) => reader
                .output_owners()
                .iter()
                .filter(|owner| owner.is_anonymous())
                .map(AbstractParty::owning_key)
                .collect(),
            SyncTarget::Identities(parties) => {
                parties.iter().map(AbstractParty::owning_key).collect()
            }
        }
    }
}

/// Outcome of one sync.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    /// Keys we asked for. Empty when no session was needed.
    pub requested: BTreeSet<PublicKey>,
    /// Newly registered.
    pub registered: BTreeSet<PublicKey>,
    /// Returned, but already known by the time we registered.
    pub already_present: BTreeSet<PublicKey>,
    /// Asked for and not attested by the counterparty.
    pub unresolved: BTreeSet<PublicKey>,
    /// Entries we refused, with the reason.
    pub rejected: Vec<(PublicKey, String)>,
}

impl SyncReport {
    /// Every requested key is now resolvable.
    pub fn is_complete(&self) -> bool {
        self.unresolved.is_empty() && self.rejected.is_empty()
    }
}

/// Initiator: resolve every key in `target` we do not know yet by asking
/// `counterparty`.
pub async fn sync_key_mappings(
    hub: &ServiceHub,
    transport: &dyn Transport,
    counterparty: &Party,
    target: &SyncTarget,
) -> Result<SyncReport, FlowError> {
    let keys = target.keys();
    let known = hub.registry().known_keys(&keys);
    let unknown: BTreeSet<PublicKey> = keys.difference(&known).copied().collect();

    if unknown.is_empty() {
        log::debug!(
            "{}: all {} keys already known, nothing to sync",
            hub.party(),
            keys.len()
        );
        return Ok(SyncReport::default());
    }

    let (mut run, session) =
        initiate(hub, transport, counterparty, ProtocolId::SyncKeyMapping).await?;
    let result = exchange(hub, &session, &mut run, unknown).await;
    session.close().await;
    let report = run.finish(result)?;

    log::info!(
        "{}: synced from {}: {} registered, {} unresolved, {} rejected",
        hub.party(),
        counterparty,
        report.registered.len(),
        report.unresolved.len(),
        report.rejected.len()
    );
    Ok(report)
}

async fn exchange(
    hub: &ServiceHub,
    session: &FlowSession,
    run: &mut FlowRun,
    unknown: BTreeSet<PublicKey>,
) -> Result<SyncReport, FlowError> {
    session
        .send(&FlowMessage::SyncRequest {
            keys: unknown.iter().copied().collect(),
        })
        .await?;
    run.advance(FlowState::AwaitingKeyOrId)?;

    let mappings = match session.recv().await? {
        FlowMessage::SyncResponse { mappings } => mappings,
        other => return Err(other.unexpected("SyncResponse")),
    };

    let mut report = SyncReport {
        requested: unknown,
        ..SyncReport::default()
    };
    let mut seen = BTreeSet::new();

    for signed in mappings {
        let key = signed.key();
        if !report.requested.contains(&key) {
            report.rejected.push((key, "unsolicited".to_string()));
            continue;
        }
        if !seen.insert(key) {
            report.rejected.push((key, "duplicate entry".to_string()));
            continue;
        }
        match hub.registry().register(signed) {
            Ok(Registration::Inserted) => {
                report.registered.insert(key);
            }
            Ok(Registration::AlreadyRegistered) => {
                report.already_present.insert(key);
            }
            Err(e) => {
                log::warn!(
                    "{}: refusing mapping for {} from {}: {}",
                    hub.party(),
                    key,
                    session.peer(),
                    e
                );
                report.rejected.push((key, e.to_string()));
            }
        }
    }

    report.unresolved = report
        .requested
        .iter()
        .filter(|k| !seen.contains(k))
        .copied()
        .collect();
    Ok(report)
}

/// What we may tell anyone about `key`, if anything.
fn attest(
    hub: &ServiceHub,
    key: PublicKey,
    session_id: Uuid,
) -> Result<Option<SignedKeyMapping>, FlowError> {
    if hub.kms().holds(&key) {
        return hub.attest_own_key(key, session_id).map(Some);
    }
    Ok(hub
        .registry()
        .mapping(&key)
        .filter(|m| m.disclosure == Disclosure::Shareable)
        .map(|m| m.signed))
}

/// Responder for `ProtocolId::SyncKeyMapping`.
pub struct SyncKeyMappingResponder;

#[async_trait]
impl FlowHandler for SyncKeyMappingResponder {
    async fn respond(
        &self,
        hub: &ServiceHub,
        session: &FlowSession,
        run: &mut FlowRun,
    ) -> Result<(), FlowError> {
        let keys: BTreeSet<PublicKey> = match session.recv().await? {
            FlowMessage::SyncRequest { keys } => keys.into_iter().collect(),
            other => return Err(other.unexpected("SyncRequest")),
        };
        run.advance(FlowState::Signing)?;

        let mut mappings = Vec::new();
        for key in &keys {
            match attest(hub, *key, session.session_id()) {
                Ok(Some(signed)) => mappings.push(signed),
                Ok(None) => {
                    log::debug!("{}: not disclosing {} to {}", hub.party(), key, session.peer())
                }
                Err(e) => log::warn!(
                    "{}: cannot attest {} for {}, omitting it: {}",
                    hub.party(),
                    key,
                    session.peer(),
                    e
                ),
            }
        }

        log::debug!(
            "{}: attesting {} of {} keys for {}",
            hub.party(),
            mappings.len(),
            keys.len(),
            session.peer()
        );
        session.send(&FlowMessage::SyncResponse { mappings }).await?;
        run.advance(FlowState::SignedSent)?;
        Ok(())
    }
}
