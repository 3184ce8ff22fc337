//! Node runtime
//!
//! A `Node` bundles one well-known identity with its key management service,
//! key registry, checkpoint store and responder table, and serves incoming
//! sessions on its transport. Initiating flows are started through its
//! methods.

use std::sync::Arc;

use tokio::sync::broadcast;
use uuid::Uuid;

use super::confidential::{self, ConfidentialIdentity, ConfidentialIdentityResponder};
use super::request_key::{self, RequestKeyResponder};
use super::share_key::{self, ShareKeyResponder};
use super::sync::{self, SyncKeyMappingResponder, SyncReport, SyncTarget};
use super::{FlowError, FlowSession};
use crate::config::NodeConfig;
use crate::identity::{KeyManagementService, NodeIdentity, Party, PublicKey};
use crate::protocol::{
    CheckpointStore, Dispatcher, FlowHandler, FlowMessage, FlowRun, FlowState, KeyRequest,
    ProtocolId, Role,
};
use crate::registry::{Disclosure, KeyRegistry, SignedKeyMapping, TrustStore};
use crate::transport::{Session, Transport};

/// Services a flow body can reach.
pub struct ServiceHub {
    kms: Arc<KeyManagementService>,
    registry: Arc<KeyRegistry>,
    checkpoints: Arc<CheckpointStore>,
    config: NodeConfig,
}

impl ServiceHub {
    pub fn new(
        kms: Arc<KeyManagementService>,
        registry: Arc<KeyRegistry>,
        checkpoints: Arc<CheckpointStore>,
        config: NodeConfig,
    ) -> Self {
        Self {
            kms,
            registry,
            checkpoints,
            config,
        }
    }

    pub fn party(&self) -> Party {
        self.kms.party()
    }

    pub fn kms(&self) -> &Arc<KeyManagementService> {
        &self.kms
    }

    pub fn registry(&self) -> &Arc<KeyRegistry> {
        &self.registry
    }

    pub fn checkpoints(&self) -> &Arc<CheckpointStore> {
        &self.checkpoints
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// The trusted party called `name`.
    pub fn trusted_party(&self, name: &str) -> Result<Party, FlowError> {
        self.registry
            .trust_store()
            .resolve(name)
            .ok_or_else(|| FlowError::UnknownParty(name.to_string()))
    }

    /// Sign `key → us` and keep our own copy of the mapping.
    pub fn attest_own_key(
        &self,
        key: PublicKey,
        session_id: Uuid,
    ) -> Result<SignedKeyMapping, FlowError> {
        let signed = SignedKeyMapping::for_known_key(&self.kms, key, Some(session_id))?;
        self.registry.register_with(signed.clone(), Disclosure::Owned)?;
        Ok(signed)
    }
}

pub struct Node {
    hub: Arc<ServiceHub>,
    transport: Arc<dyn Transport>,
    dispatcher: Arc<Dispatcher>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Node {
    /// Assemble a node serving all four protocols.
    ///
    /// The transport must be attached under the identity's name. Our own
    /// party is added to `trust` so our own mappings can be registered.
    pub fn new(
        identity: NodeIdentity,
        transport: Arc<dyn Transport>,
        trust: Arc<TrustStore>,
        config: NodeConfig,
    ) -> Result<Self, FlowError> {
        if transport.local_name() != identity.name() {
            return Err(FlowError::InvalidArgument(format!(
                "transport is attached as {}, identity is {}",
                transport.local_name(),
                identity.name()
            )));
        }
        trust.trust(identity.party());

        let registry = match &config.journal_path {
            Some(path) => KeyRegistry::open(trust, path)?,
            None => KeyRegistry::new(trust),
        };

        let checkpoints = match &config.checkpoint_dir {
            Some(dir) => {
                let store = CheckpointStore::open(dir)?.with_history(config.finished_run_history);
                store.recover_interrupted()?;
                store
            }
            None => CheckpointStore::new().with_history(config.finished_run_history),
        };

        let dispatcher = Dispatcher::new();
        dispatcher.register(ProtocolId::RequestKey, Arc::new(RequestKeyResponder));
        dispatcher.register(ProtocolId::ShareKey, Arc::new(ShareKeyResponder));
        dispatcher.register(ProtocolId::SyncKeyMapping, Arc::new(SyncKeyMappingResponder));
        dispatcher.register(
            ProtocolId::ConfidentialIdentity,
            Arc::new(ConfidentialIdentityResponder),
        );

        let (shutdown_tx, _) = broadcast::channel(1);
        Ok(Self {
            hub: Arc::new(ServiceHub::new(
                Arc::new(KeyManagementService::new(identity)),
                Arc::new(registry),
                Arc::new(checkpoints),
                config,
            )),
            transport,
            dispatcher: Arc::new(dispatcher),
            shutdown_tx,
        })
    }

    pub fn hub(&self) -> &Arc<ServiceHub> {
        &self.hub
    }

    pub fn party(&self) -> Party {
        self.hub.party()
    }

    pub fn kms(&self) -> &Arc<KeyManagementService> {
        self.hub.kms()
    }

    pub fn registry(&self) -> &Arc<KeyRegistry> {
        self.hub.registry()
    }

    pub fn checkpoints(&self) -> &Arc<CheckpointStore> {
        self.hub.checkpoints()
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Install a responder, replacing the default for that protocol.
    pub fn register_responder(&self, protocol: ProtocolId, handler: Arc<dyn FlowHandler>) {
        self.dispatcher.register(protocol, handler);
    }

    /// Serve incoming sessions until `stop` is called. Each session runs in
    /// its own task.
    pub fn start(&self) {
        let hub = Arc::clone(&self.hub);
        let transport = Arc::clone(&self.transport);
        let dispatcher = Arc::clone(&self.dispatcher);
        let mut shutdown = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = transport.accept() => match accepted {
                        Ok(session) => {
                            let hub = Arc::clone(&hub);
                            let dispatcher = Arc::clone(&dispatcher);
                            tokio::spawn(async move {
                                serve_session(hub, dispatcher, session).await;
                            });
                        }
                        Err(e) => {
                            log::warn!(
                                "{}: accept failed, stopping: {}",
                                transport.local_name(),
                                e
                            );
                            break;
                        }
                    },
                    _ = shutdown.recv() => break,
                }
            }
        });
    }

    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(());
    }

    // -----------------------------------------------------------------------
    // Initiating flows
    // -----------------------------------------------------------------------

    pub async fn request_key(
        &self,
        counterparty: &Party,
        request: KeyRequest,
    ) -> Result<SignedKeyMapping, FlowError> {
        request_key::request_key(&self.hub, self.transport.as_ref(), counterparty, request).await
    }

    /// Request by exactly one of an external id or a known key. Both or
    /// neither fail before any session is opened.
    pub async fn request_key_with(
        &self,
        counterparty: &Party,
        external_id: Option<Uuid>,
        key: Option<PublicKey>,
    ) -> Result<SignedKeyMapping, FlowError> {
        let request = KeyRequest::from_parts(external_id, key)?;
        self.request_key(counterparty, request).await
    }

    pub async fn share_key(
        &self,
        counterparty: &Party,
        external_id: Uuid,
    ) -> Result<SignedKeyMapping, FlowError> {
        share_key::share_key(&self.hub, self.transport.as_ref(), counterparty, external_id).await
    }

    pub async fn sync_key_mappings(
        &self,
        counterparty: &Party,
        target: &SyncTarget,
    ) -> Result<SyncReport, FlowError> {
        sync::sync_key_mappings(&self.hub, self.transport.as_ref(), counterparty, target).await
    }

    pub async fn confidential_identity(
        &self,
        counterparty: &Party,
    ) -> Result<ConfidentialIdentity, FlowError> {
        confidential::confidential_identity(&self.hub, self.transport.as_ref(), counterparty).await
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Run the opening handshake on an incoming session, then hand it to the
/// responder registered for the requested protocol.
async fn serve_session(
    hub: Arc<ServiceHub>,
    dispatcher: Arc<Dispatcher>,
    session: Box<dyn Session>,
) {
    let session = FlowSession::new(session, hub.config().session_timeout());

    let (protocol, handler) = match accept_handshake(&hub, &dispatcher, &session).await {
        Ok(accepted) => accepted,
        Err(reason) => {
            log::warn!("{}: refusing session from {}: {}", hub.party(), session.peer(), reason);
            let _ = session.send(&FlowMessage::Rejected { reason }).await;
            session.close().await;
            return;
        }
    };

    if let Err(e) = session.send(&FlowMessage::SessionConfirm).await {
        log::warn!("{}: lost {} before confirming: {}", hub.party(), session.peer(), e);
        return;
    }

    let result = respond(&hub, handler.as_ref(), &session, protocol).await;
    if let Err(e) = result {
        if !e.is_session_failure() {
            let _ = session
                .send(&FlowMessage::Rejected {
                    reason: e.to_string(),
                })
                .await;
        }
    }
    session.close().await;
}

/// Resolve the protocol and check the initiator. Returns the refusal reason
/// on failure.
async fn accept_handshake(
    hub: &ServiceHub,
    dispatcher: &Dispatcher,
    session: &FlowSession,
) -> Result<(ProtocolId, Arc<dyn FlowHandler>), String> {
    let (protocol, initiator) = match session.recv().await {
        Ok(FlowMessage::SessionInit { protocol, initiator }) => (protocol, initiator),
        Ok(other) => return Err(format!("expected SessionInit, got {}", other.name())),
        Err(e) => return Err(e.to_string()),
    };

    if initiator != session.peer() {
        return Err(format!(
            "initiator {} does not match authenticated peer {}",
            initiator,
            session.peer()
        ));
    }
    if hub.trusted_party(&initiator).is_err() {
        return Err(format!("{} is not a trusted party", initiator));
    }
    let handler = dispatcher
        .resolve(protocol)
        .ok_or_else(|| format!("{} does not serve {}", hub.party(), protocol))?;

    Ok((protocol, handler))
}

async fn respond(
    hub: &ServiceHub,
    handler: &dyn FlowHandler,
    session: &FlowSession,
    protocol: ProtocolId,
) -> Result<(), FlowError> {
    let mut run = FlowRun::start(
        Arc::clone(hub.checkpoints()),
        protocol,
        Role::Responder,
        session.peer().to_string(),
    )?;
    run.bind_session(session.session_id())?;
    run.advance(FlowState::AwaitingKeyOrId)?;

    let result = handler.respond(hub, session, &mut run).await;
    run.finish(result)
}
