//! Multi-node key mapping tests
//!
//! Runs several nodes over one SimNetwork and drives the request, share,
//! sync and confidential-identity flows between them.
//!
//! Run with:
//!   cargo test --test key_mapping_flows

use std::sync::Arc;
use std::time::Duration;

use confidential_identities::flows::{Transaction, TransactionOutput};
use confidential_identities::identity::KeyManagementService;
use confidential_identities::protocol::{FlowMessage, FlowState, ProtocolId, Role};
use confidential_identities::registry::Disclosure;
use confidential_identities::transport::{SimNetwork, Transport, TransportError};
use confidential_identities::{
    AbstractParty, AnonymousParty, FlowError, KeyRequest, Node, NodeConfig, NodeIdentity, Party,
    PublicKey, SignedKeyMapping, SyncTarget, TrustStore,
};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const ALICE: &str = "O=Alice,L=London,C=GB";
const BOB: &str = "O=Bob,L=Paris,C=FR";
const CHARLIE: &str = "O=Charlie,L=Rome,C=IT";

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Start one node per identity; every node trusts every listed party.
fn start_nodes(
    network: &Arc<SimNetwork>,
    identities: Vec<NodeIdentity>,
    extra: &[Party],
) -> Vec<Node> {
    let mut parties: Vec<Party> = identities.iter().map(|i| i.party()).collect();
    parties.extend_from_slice(extra);

    identities
        .into_iter()
        .map(|identity| {
            let endpoint = Arc::new(network.attach(identity.name()).unwrap());
            let trust = Arc::new(TrustStore::with_parties(parties.clone()));
            let node = Node::new(identity, endpoint, trust, NodeConfig::default()).unwrap();
            node.start();
            node
        })
        .collect()
}

fn three_nodes() -> (Arc<SimNetwork>, Node, Node, Node) {
    init_logging();
    let network = SimNetwork::new();
    let identities = vec![
        NodeIdentity::generate(ALICE),
        NodeIdentity::generate(BOB),
        NodeIdentity::generate(CHARLIE),
    ];
    let mut nodes = start_nodes(&network, identities, &[]).into_iter();
    let alice = nodes.next().unwrap();
    let bob = nodes.next().unwrap();
    let charlie = nodes.next().unwrap();
    (network, alice, bob, charlie)
}

/// A payment whose only output is owned by `key`.
fn payment_to(key: PublicKey) -> Transaction {
    Transaction::new(vec![TransactionOutput {
        owner: AnonymousParty::new(key).into(),
        state: "Cash(1000 USD)".into(),
    }])
}

fn sync_target_for(key: PublicKey) -> SyncTarget {
    SyncTarget::transaction(payment_to(key))
}

// ---------------------------------------------------------------------------
// Sync
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_sync_key_mapping_between_two_parties() {
    let (_network, alice, bob, _charlie) = three_nodes();

    // Alice pays to a fresh confidential key of her own
    let key = alice.kms().fresh_key(Uuid::new_v4());
    let target = sync_target_for(key);
    assert_eq!(bob.registry().lookup(&key), None);

    let report = bob.sync_key_mappings(&alice.party(), &target).await.unwrap();

    assert_eq!(report.requested.iter().copied().collect::<Vec<_>>(), vec![key]);
    assert!(report.registered.contains(&key));
    assert!(report.is_complete());
    assert_eq!(bob.registry().lookup(&key), Some(alice.party()));
    assert_eq!(bob.registry().mapping(&key).unwrap().disclosure, Disclosure::Confidential);
}

#[tokio::test]
async fn test_sync_is_idempotent_and_skips_the_session() {
    let (network, alice, bob, _charlie) = three_nodes();
    let key = alice.kms().fresh_key(Uuid::new_v4());
    let target = sync_target_for(key);

    bob.sync_key_mappings(&alice.party(), &target).await.unwrap();
    let opened = network.sessions_opened();
    let mappings = bob.registry().len();

    let again = bob.sync_key_mappings(&alice.party(), &target).await.unwrap();

    assert!(again.requested.is_empty());
    assert!(again.registered.is_empty());
    assert_eq!(network.sessions_opened(), opened);
    assert_eq!(bob.registry().len(), mappings);
}

#[tokio::test]
async fn test_sync_does_not_leak_confidential_identities() {
    let (_network, alice, bob, charlie) = three_nodes();

    // Charlie hands Alice a confidential key; nobody else knows it
    let shared = charlie.share_key(&alice.party(), Uuid::new_v4()).await.unwrap();
    let key = shared.key();
    assert_eq!(alice.registry().lookup(&key), Some(charlie.party()));
    assert_eq!(bob.registry().lookup(&key), None);

    // Bob asks Alice about a payment touching Charlie's key
    let report = bob.sync_key_mappings(&alice.party(), &sync_target_for(key)).await.unwrap();

    assert!(report.unresolved.contains(&key));
    assert!(report.registered.is_empty());
    assert_eq!(bob.registry().lookup(&key), None);
}

#[tokio::test]
async fn test_shareable_mappings_are_forwarded() {
    let (_network, alice, bob, charlie) = three_nodes();

    let shared = charlie.share_key(&alice.party(), Uuid::new_v4()).await.unwrap();
    let key = shared.key();
    alice.registry().authorize_sharing(&key).unwrap();

    let report = bob.sync_key_mappings(&alice.party(), &sync_target_for(key)).await.unwrap();

    // forwarded as Charlie signed it, and checked against Charlie's root key
    assert!(report.registered.contains(&key));
    assert_eq!(bob.registry().lookup(&key), Some(charlie.party()));
    assert_eq!(bob.registry().mapping(&key).unwrap().signed, shared);
}

#[tokio::test]
async fn test_sync_by_identity_list_mixes_resolved_and_unresolved() {
    let (_network, alice, bob, charlie) = three_nodes();

    let alices = alice.kms().fresh_key(Uuid::new_v4());
    let charlies = charlie.kms().fresh_key(Uuid::new_v4());
    let target = SyncTarget::Identities(vec![
        AnonymousParty::new(alices).into(),
        AnonymousParty::new(charlies).into(),
        // already resolvable: never requested
        AbstractParty::WellKnown(charlie.party()),
    ]);

    let report = bob.sync_key_mappings(&alice.party(), &target).await.unwrap();

    assert_eq!(report.requested.len(), 2);
    assert!(report.registered.contains(&alices));
    assert!(report.unresolved.contains(&charlies));
    assert!(!report.is_complete());
    assert_eq!(bob.registry().lookup(&alices), Some(alice.party()));
    assert_eq!(bob.registry().lookup(&charlies), None);
}

#[tokio::test]
async fn test_sync_omits_a_key_the_responder_cannot_attest() {
    let (_network, alice, bob, charlie) = three_nodes();
    let contested = alice.kms().fresh_key(Uuid::new_v4());
    let clean = alice.kms().fresh_key(Uuid::new_v4());

    // Charlie claims one of Alice's keys before Alice ever attests it
    let claim = SignedKeyMapping::for_known_key(charlie.kms(), contested, None).unwrap();
    alice.registry().register(claim).unwrap();

    let target = SyncTarget::Identities(vec![
        AnonymousParty::new(contested).into(),
        AnonymousParty::new(clean).into(),
    ]);
    let report = bob.sync_key_mappings(&alice.party(), &target).await.unwrap();

    assert_eq!(report.requested.len(), 2);
    assert!(report.registered.contains(&clean));
    assert!(report.unresolved.contains(&contested));
    assert!(report.rejected.is_empty());
    assert_eq!(bob.registry().lookup(&clean), Some(alice.party()));
    assert_eq!(bob.registry().lookup(&contested), None);
}

#[tokio::test]
async fn test_sync_reports_already_present_after_race() {
    let (_network, alice, bob, _charlie) = three_nodes();
    let key = alice.kms().fresh_key(Uuid::new_v4());
    let target = sync_target_for(key);

    // two syncs for the same key at once: exactly one inserts
    let alice_party = alice.party();
    let (first, second) = tokio::join!(
        bob.sync_key_mappings(&alice_party, &target),
        bob.sync_key_mappings(&alice_party, &target),
    );
    let (first, second) = (first.unwrap(), second.unwrap());

    let inserted = [&first, &second]
        .iter()
        .filter(|r| r.registered.contains(&key))
        .count();
    assert_eq!(inserted, 1);
    assert!(first.is_complete() && second.is_complete());
    assert_eq!(bob.registry().lookup(&key), Some(alice.party()));
    assert_eq!(bob.registry().len(), 1);
}

// ---------------------------------------------------------------------------
// Request key
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_request_key_by_id() {
    let (_network, alice, bob, _charlie) = three_nodes();
    let account = Uuid::new_v4();

    let signed = alice.request_key(&bob.party(), KeyRequest::ById(account)).await.unwrap();

    signed.verify().unwrap();
    assert_eq!(signed.owner(), &bob.party());
    assert_eq!(bob.kms().external_id(&signed.key()), Some(account));
    assert_eq!(alice.registry().lookup(&signed.key()), Some(bob.party()));
    assert_eq!(bob.registry().mapping(&signed.key()).unwrap().disclosure, Disclosure::Owned);
}

#[tokio::test]
async fn test_request_key_by_known_key() {
    let (_network, alice, bob, _charlie) = three_nodes();
    let key = bob.kms().fresh_key(Uuid::new_v4());
    let keys_before = bob.kms().keys_for(bob.kms().external_id(&key).unwrap());

    let signed = alice.request_key(&bob.party(), KeyRequest::ByKey(key)).await.unwrap();

    assert_eq!(signed.key(), key);
    signed.verify().unwrap();
    assert_eq!(alice.registry().lookup(&key), Some(bob.party()));
    // no key was generated
    assert_eq!(bob.kms().keys_for(bob.kms().external_id(&key).unwrap()), keys_before);
}

#[tokio::test]
async fn test_request_for_a_key_the_responder_does_not_hold_is_rejected() {
    let (_network, alice, bob, charlie) = three_nodes();
    let charlies = charlie.kms().fresh_key(Uuid::new_v4());

    let result = alice.request_key(&bob.party(), KeyRequest::ByKey(charlies)).await;

    assert!(matches!(result, Err(FlowError::Rejected(_))));
    assert_eq!(alice.registry().lookup(&charlies), None);
}

#[tokio::test]
async fn test_request_arguments_checked_before_any_session() {
    let (network, alice, bob, _charlie) = three_nodes();
    let key = bob.kms().fresh_key(Uuid::new_v4());

    let both = alice.request_key_with(&bob.party(), Some(Uuid::new_v4()), Some(key)).await;
    let neither = alice.request_key_with(&bob.party(), None, None).await;

    assert!(matches!(both, Err(FlowError::InvalidArgument(_))));
    assert!(matches!(neither, Err(FlowError::InvalidArgument(_))));
    assert_eq!(network.sessions_opened(), 0);
    assert!(alice.checkpoints().is_empty());
}

#[tokio::test]
async fn test_untrusted_counterparty_is_refused_locally() {
    let (network, alice, _bob, _charlie) = three_nodes();
    let stranger = NodeIdentity::generate("O=Mallory,L=Nowhere,C=XX").party();

    let result = alice.request_key(&stranger, KeyRequest::ById(Uuid::new_v4())).await;

    assert!(matches!(result, Err(FlowError::UnknownParty(name)) if name == stranger.name));
    assert_eq!(network.sessions_opened(), 0);
}

// ---------------------------------------------------------------------------
// Share key and confidential identity
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_share_key() {
    let (_network, alice, bob, _charlie) = three_nodes();
    let account = Uuid::new_v4();

    let shared = alice.share_key(&bob.party(), account).await.unwrap();

    assert_eq!(alice.kms().external_id(&shared.key()), Some(account));
    assert_eq!(alice.registry().mapping(&shared.key()).unwrap().disclosure, Disclosure::Owned);
    assert_eq!(bob.registry().lookup(&shared.key()), Some(alice.party()));
    assert_eq!(bob.registry().mapping(&shared.key()).unwrap().disclosure, Disclosure::Confidential);
}

#[tokio::test]
async fn test_share_key_responder_keeps_the_received_mapping() {
    let (_network, alice, bob, _charlie) = three_nodes();

    let shared = alice.share_key(&bob.party(), Uuid::new_v4()).await.unwrap();
    for _ in 0..100 {
        if !bob.checkpoints().finished().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let runs = bob.checkpoints().finished();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].protocol, ProtocolId::ShareKey);
    assert_eq!(runs[0].role, Role::Responder);
    assert_eq!(runs[0].state, FlowState::Complete);
    assert_eq!(runs[0].mapping.as_ref(), Some(&shared));
    assert_eq!(alice.checkpoints().finished()[0].mapping.as_ref(), Some(&shared));
}

#[tokio::test]
async fn test_confidential_identity() {
    let (_network, alice, bob, _charlie) = three_nodes();

    let identity = alice.confidential_identity(&bob.party()).await.unwrap();

    assert_eq!(identity.well_known, bob.party());
    assert!(bob.kms().holds(&identity.anonymous.owning_key));
    assert_eq!(alice.registry().lookup(&identity.anonymous.owning_key), Some(bob.party()));

    // every request yields a new identity
    let another = alice.confidential_identity(&bob.party()).await.unwrap();
    assert_ne!(identity.anonymous, another.anonymous);
}

// ---------------------------------------------------------------------------
// Session handling
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_unknown_protocol_rejected_at_open() {
    let (_network, alice, bob, _charlie) = three_nodes();
    bob.dispatcher().unregister(ProtocolId::ConfidentialIdentity);

    let result = alice.confidential_identity(&bob.party()).await;

    assert!(matches!(
        result,
        Err(FlowError::Rejected(reason)) if reason.contains("confidential-identity")
    ));
    let failed = alice.checkpoints().all();
    assert_eq!(failed.len(), 1);
    assert!(matches!(failed[0].state, FlowState::Failed { .. }));
}

#[tokio::test]
async fn test_forged_share_is_rejected_by_responder() {
    init_logging();
    let network = SimNetwork::new();
    let charlie = NodeIdentity::generate(CHARLIE);
    let nodes = start_nodes(&network, vec![NodeIdentity::generate(ALICE)], &[charlie.party()]);
    let alice = &nodes[0];

    // an impostor holding the transport name "Charlie" but not Charlie's root key
    let impostor = KeyManagementService::new(NodeIdentity::generate(CHARLIE));
    let forged = SignedKeyMapping::for_fresh_key(&impostor, Uuid::new_v4(), None).unwrap();
    let endpoint = network.attach(CHARLIE).unwrap();

    let session = endpoint.open_session(ALICE).await.unwrap();
    let init = FlowMessage::SessionInit {
        protocol: ProtocolId::ShareKey,
        initiator: CHARLIE.to_string(),
    };
    session.send(&init.encode().unwrap()).await.unwrap();
    let confirm = FlowMessage::decode(&session.recv().await.unwrap()).unwrap();
    assert_eq!(confirm, FlowMessage::SessionConfirm);

    session
        .send(&FlowMessage::SignedMapping(forged.clone()).encode().unwrap())
        .await
        .unwrap();
    let reply = FlowMessage::decode(&session.recv().await.unwrap()).unwrap();

    assert!(matches!(reply, FlowMessage::Rejected { .. }));
    assert_eq!(alice.registry().lookup(&forged.key()), None);
    assert!(alice.registry().is_empty());
}

#[tokio::test]
async fn test_session_drop_surfaces_session_failure() {
    init_logging();
    let network = SimNetwork::new();
    let dropper = NodeIdentity::generate("O=Dropper,L=Nowhere,C=XX");
    let nodes = start_nodes(&network, vec![NodeIdentity::generate(ALICE)], &[dropper.party()]);
    let alice = &nodes[0];

    // a peer that accepts the session and hangs up without answering
    let endpoint = network.attach(dropper.name()).unwrap();
    let peer = tokio::spawn(async move {
        let session = endpoint.accept().await.unwrap();
        let _init = session.recv().await.unwrap();
        drop(session);
        endpoint
    });

    let result = alice.request_key(&dropper.party(), KeyRequest::ById(Uuid::new_v4())).await;
    let _endpoint = peer.await.unwrap();

    assert!(matches!(
        result,
        Err(FlowError::SessionFailure(TransportError::Disconnected))
    ));
    let runs = alice.checkpoints().all();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].role, Role::Initiator);
    assert!(matches!(runs[0].state, FlowState::Failed { .. }));
}

#[tokio::test(start_paused = true)]
async fn test_silent_responder_times_out() {
    init_logging();
    let network = SimNetwork::new();
    let silent = NodeIdentity::generate("O=Silent,L=Nowhere,C=XX");
    let nodes = start_nodes(&network, vec![NodeIdentity::generate(ALICE)], &[silent.party()]);
    let alice = &nodes[0];

    // confirms the session, then never answers the request
    let endpoint = network.attach(silent.name()).unwrap();
    let peer = tokio::spawn(async move {
        let session = endpoint.accept().await.unwrap();
        let _init = session.recv().await.unwrap();
        session.send(&FlowMessage::SessionConfirm.encode().unwrap()).await.unwrap();
        let _request = session.recv().await.unwrap();
        tokio::time::sleep(Duration::from_secs(3600)).await;
        drop(session);
    });

    let result = alice.request_key(&silent.party(), KeyRequest::ById(Uuid::new_v4())).await;

    assert!(matches!(result, Err(FlowError::SessionFailure(TransportError::Timeout))));
    peer.abort();
}

#[tokio::test]
async fn test_initiator_must_be_the_authenticated_peer() {
    init_logging();
    let network = SimNetwork::new();
    let nodes = start_nodes(
        &network,
        vec![NodeIdentity::generate(ALICE), NodeIdentity::generate(BOB)],
        &[],
    );
    let bob = &nodes[1];

    // an endpoint that is not Alice claims to be her
    let endpoint = network.attach("O=Mallory,L=Nowhere,C=XX").unwrap();
    let session = endpoint.open_session(BOB).await.unwrap();
    let init = FlowMessage::SessionInit {
        protocol: ProtocolId::RequestKey,
        initiator: ALICE.to_string(),
    };
    session.send(&init.encode().unwrap()).await.unwrap();

    let reply = FlowMessage::decode(&session.recv().await.unwrap()).unwrap();
    assert!(matches!(reply, FlowMessage::Rejected { .. }));
    assert!(bob.checkpoints().is_empty());
}

#[tokio::test]
async fn test_responder_runs_are_checkpointed() {
    let (_network, alice, bob, _charlie) = three_nodes();

    alice.request_key(&bob.party(), KeyRequest::ById(Uuid::new_v4())).await.unwrap();
    // the responder finishes after sending; give its task a moment
    for _ in 0..100 {
        if bob.checkpoints().in_flight().is_empty() && !bob.checkpoints().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let alices = alice.checkpoints().all();
    let bobs = bob.checkpoints().all();
    assert_eq!(alices.len(), 1);
    assert_eq!(bobs.len(), 1);
    assert_eq!(alices[0].state, FlowState::Complete);
    assert_eq!(bobs[0].state, FlowState::Complete);
    assert_eq!(bobs[0].role, Role::Responder);
    assert_eq!(alices[0].session_id, bobs[0].session_id);
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_journal_survives_restart() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let network = SimNetwork::new();

    let alice_id = NodeIdentity::generate(ALICE);
    let bob_path = dir.path().join("bob.json");
    let bob_id = NodeIdentity::load_or_generate(&bob_path, BOB).unwrap();
    let parties = vec![alice_id.party(), bob_id.party()];
    let config = NodeConfig {
        journal_path: Some(dir.path().join("bob-mappings.jsonl")),
        checkpoint_dir: Some(dir.path().join("bob-checkpoints")),
        ..NodeConfig::default()
    };

    let alice = Node::new(
        alice_id,
        Arc::new(network.attach(ALICE).unwrap()),
        Arc::new(TrustStore::with_parties(parties.clone())),
        NodeConfig::default(),
    )
    .unwrap();
    alice.start();

    let key = {
        let bob = Node::new(
            bob_id,
            Arc::new(network.attach(BOB).unwrap()),
            Arc::new(TrustStore::with_parties(parties.clone())),
            config.clone(),
        )
        .unwrap();
        let signed = bob
            .request_key(&alice.party(), KeyRequest::ById(Uuid::new_v4()))
            .await
            .unwrap();
        signed.key()
    };

    // same identity, same journal, fresh process state
    let bob = Node::new(
        NodeIdentity::load(&bob_path).unwrap(),
        Arc::new(network.attach(BOB).unwrap()),
        Arc::new(TrustStore::with_parties(parties)),
        config,
    )
    .unwrap();

    assert_eq!(bob.registry().lookup(&key), Some(alice.party()));
    // the finished run left nothing behind on disk
    assert!(bob.checkpoints().is_empty());
    let leftover = std::fs::read_dir(dir.path().join("bob-checkpoints")).unwrap().count();
    assert_eq!(leftover, 0);
}
