//! End-to-end pairing between two controllers in one process.
//!
//! The memory peer connection stands in for the network, so these tests run
//! the real negotiator, message channel, and session store together.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mockall::mock;
use pairlink_core::{
    encode_setup, ChannelState, Command, CommandType, ConnectionSnapshot, ConnectionState, Role,
    ScopeType, SetupBlob,
};
use uuid::Uuid;
use tokio::sync::mpsc;

use pairlink_peer::application::{CheckpointScope, ConnectionController};
use pairlink_peer::infrastructure::negotiation::{
    GatheringNegotiator, NegotiatedTransport, NegotiationError, NegotiationInput, Negotiator,
    ICE_GATHER_TIMEOUT,
};
use pairlink_peer::infrastructure::network::{FrameLink, Framing};
use pairlink_peer::infrastructure::peer::{MemoryPeerFactory, MemoryRendezvous};
use pairlink_peer::infrastructure::storage::SessionStore;

const WAIT: Duration = Duration::from_secs(5);

async fn within<T>(future: impl Future<Output = T>) -> T {
    tokio::time::timeout(WAIT, future)
        .await
        .expect("timed out waiting for the controller")
}

async fn reach(controller: &ConnectionController, state: ConnectionState) -> ConnectionSnapshot {
    within(controller.wait_for(|s| s.state == state)).await
}

fn memory_controllers(store: Arc<SessionStore>) -> (ConnectionController, ConnectionController) {
    let factory = Arc::new(MemoryPeerFactory::new(
        MemoryRendezvous::new(),
        Some(Duration::from_millis(10)),
    ));
    let make = || {
        ConnectionController::with_store(
            Arc::new(GatheringNegotiator::new(factory.clone(), ICE_GATHER_TIMEOUT)),
            Arc::clone(&store),
        )
    };
    let initiator = make();
    let responder = make();
    initiator.select_role(Role::Initiator);
    responder.select_role(Role::Responder);
    (initiator, responder)
}

/// Runs the offer/answer exchange, relaying blobs as encoded text.
async fn pair(initiator: &ConnectionController, responder: &ConnectionController) {
    let offer = encode_setup(&initiator.initiate_connection().await.unwrap());
    let answer = responder
        .accept_connection(&offer)
        .await
        .unwrap()
        .expect("gathering transport always answers");
    initiator
        .complete_connection(&encode_setup(&answer))
        .await
        .unwrap();

    reach(initiator, ConnectionState::Connected).await;
    reach(responder, ConnectionState::Connected).await;
}

#[tokio::test]
async fn test_offer_answer_exchange_connects_both_sides() {
    // Arrange
    let store = Arc::new(SessionStore::in_memory());
    let (initiator, responder) = memory_controllers(Arc::clone(&store));

    // Act
    pair(&initiator, &responder).await;
    initiator.store_settled().await;
    responder.store_settled().await;

    // Assert
    for (controller, role) in [(&initiator, Role::Initiator), (&responder, Role::Responder)] {
        let snapshot = controller.snapshot();
        assert_eq!(snapshot.state, ConnectionState::Connected);
        assert_eq!(snapshot.role, role);
        assert_eq!(snapshot.channel_state, ChannelState::Open);
        assert_eq!(snapshot.last_error, None);
        let session = controller.session_id().expect("connected session has an id");
        assert!(store.token(&session).is_some_and(|t| t.is_active()));
    }
    assert_eq!(
        initiator.session_id(),
        responder.session_id(),
        "both ends name the pairing the same"
    );
    assert_eq!(store.tokens().len(), 1, "one reconnect token per pairing");
}

#[tokio::test]
async fn test_each_pairing_gets_its_own_session_id() {
    // Arrange
    let (initiator, responder) = memory_controllers(Arc::new(SessionStore::in_memory()));
    pair(&initiator, &responder).await;
    let first = initiator.session_id().unwrap();
    initiator.reset();
    reach(&responder, ConnectionState::Disconnected).await;

    // Act
    initiator.select_role(Role::Initiator);
    responder.select_role(Role::Responder);
    pair(&initiator, &responder).await;

    // Assert
    assert_ne!(initiator.session_id().unwrap(), first);
    assert_eq!(initiator.session_id(), responder.session_id());
}

#[tokio::test]
async fn test_commands_are_delivered_in_both_directions() {
    // Arrange
    let (initiator, responder) = memory_controllers(Arc::new(SessionStore::in_memory()));
    pair(&initiator, &responder).await;

    let (to_responder, mut at_responder) = mpsc::unbounded_channel();
    let _a = responder.on_message(move |c: &Command| {
        let _ = to_responder.send(*c);
    });
    let (to_initiator, mut at_initiator) = mpsc::unbounded_channel();
    let _b = initiator.on_message(move |c: &Command| {
        let _ = to_initiator.send(*c);
    });

    // Act
    let sent = initiator.send(CommandType::Next).unwrap();
    let reply = responder.send(CommandType::Prev).unwrap();

    // Assert
    assert_eq!(within(at_responder.recv()).await, Some(sent));
    assert_eq!(within(at_initiator.recv()).await, Some(reply));
}

#[tokio::test]
async fn test_ping_is_answered_without_reaching_subscribers() {
    // Arrange
    let (initiator, responder) = memory_controllers(Arc::new(SessionStore::in_memory()));
    pair(&initiator, &responder).await;
    let (tx, mut delivered) = mpsc::unbounded_channel();
    let _subscription = responder.on_message(move |c: &Command| {
        let _ = tx.send(*c);
    });

    // Act
    initiator.send_ping().unwrap();
    let marker = initiator.send(CommandType::Next).unwrap();

    // Assert: the first thing the responder's subscribers see is the marker.
    assert_eq!(within(delivered.recv()).await, Some(marker));
    within(async {
        while !initiator.events().iter().any(|e| e.message.starts_with("PONG")) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
}

#[tokio::test]
async fn test_reset_disconnects_peer_and_invalidates_both_sessions() {
    // Arrange
    let store = Arc::new(SessionStore::in_memory());
    let (initiator, responder) = memory_controllers(Arc::clone(&store));
    pair(&initiator, &responder).await;
    let initiator_session = initiator.session_id().unwrap();
    let responder_session = responder.session_id().unwrap();

    // Act
    initiator.reset();
    let ended = reach(&responder, ConnectionState::Disconnected).await;
    initiator.store_settled().await;
    responder.store_settled().await;

    // Assert
    assert_eq!(initiator.snapshot().state, ConnectionState::Idle);
    assert_eq!(initiator.snapshot().role, Role::None);
    assert!(ended.last_error.is_some());
    assert_eq!(ended.channel_state, ChannelState::Closed);
    assert!(store.token(&initiator_session).is_none());
    assert!(store.token(&responder_session).is_none());
    assert!(responder
        .send(CommandType::Next)
        .is_err(), "a disconnected channel must refuse to send");
}

#[tokio::test]
async fn test_controllers_can_pair_again_after_reset() {
    // Arrange
    let (initiator, responder) = memory_controllers(Arc::new(SessionStore::in_memory()));
    pair(&initiator, &responder).await;
    initiator.reset();
    reach(&responder, ConnectionState::Disconnected).await;

    // Act
    initiator.select_role(Role::Initiator);
    responder.select_role(Role::Responder);
    pair(&initiator, &responder).await;

    // Assert
    assert_eq!(initiator.snapshot().channel_state, ChannelState::Open);
    assert_eq!(responder.snapshot().channel_state, ChannelState::Open);
}

fn scope() -> CheckpointScope {
    CheckpointScope {
        scope_type: ScopeType::SoloPair,
        scope_id: "pair-under-test".to_string(),
        song_ref: "song-1".to_string(),
        peer_id: "initiator".to_string(),
    }
}

#[tokio::test]
async fn test_page_turns_from_peer_advance_the_followed_checkpoint() {
    // Arrange
    let store = Arc::new(SessionStore::in_memory());
    let (initiator, responder) = memory_controllers(Arc::clone(&store));
    responder.follow_checkpoint(scope());
    pair(&initiator, &responder).await;
    let key = scope().key();

    // Act
    initiator.send_ping().unwrap();
    initiator.send(CommandType::Next).unwrap();
    initiator.send(CommandType::Next).unwrap();
    let last = initiator.send(CommandType::Prev).unwrap();
    within(async {
        while !store.checkpoint(&key).is_some_and(|c| c.revision >= 3) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    responder.store_settled().await;

    // Assert
    let checkpoint = store.checkpoint(&key).expect("checkpoint written");
    assert_eq!(checkpoint.page_index, 1);
    assert_eq!(checkpoint.revision, 3, "ping is not a page turn");
    assert_eq!(checkpoint.last_change_ts, last.ts);
    assert_eq!(checkpoint.last_change_sender_id, "initiator");
    assert_eq!(store.checkpoints().len(), 1, "the sender records nothing");
}

#[tokio::test]
async fn test_file_backed_session_is_invalidated_after_reset() {
    // Arrange
    let path = std::env::temp_dir()
        .join(format!("pairlink-controller-{}", Uuid::new_v4().simple()))
        .join("sessions.json");
    let store = Arc::new(SessionStore::open(&path).unwrap());
    let (initiator, responder) = memory_controllers(Arc::clone(&store));
    pair(&initiator, &responder).await;
    let session = initiator.session_id().unwrap();
    initiator.store_settled().await;
    responder.store_settled().await;
    assert!(store.token(&session).is_some());

    // Act: reset returns without waiting for the file write
    initiator.reset();
    assert_eq!(initiator.snapshot().state, ConnectionState::Idle);
    reach(&responder, ConnectionState::Disconnected).await;
    initiator.store_settled().await;
    responder.store_settled().await;

    // Assert
    assert!(store.token(&session).is_none());
    let reopened = SessionStore::open(&path).unwrap();
    assert!(reopened.token(&session).is_none());

    let _ = std::fs::remove_dir_all(path.parent().unwrap());
}

// ── Inbound frame handling over a scripted transport ──────────────────────────

mock! {
    pub Transport {}

    #[async_trait]
    impl Negotiator for Transport {
        fn name(&self) -> &'static str;
        async fn negotiate(
            &self,
            role: Role,
            input: NegotiationInput,
        ) -> Result<NegotiatedTransport, NegotiationError>;
        fn cancel(&self);
    }
}

/// A connected initiator plus the raw far end of its channel.
async fn connected_over_pair() -> (ConnectionController, FrameLink) {
    let (local, remote) = FrameLink::pair(Framing::Json);
    local.handle().mark_open();

    let mut negotiator = MockTransport::new();
    negotiator.expect_name().return_const("scripted");
    negotiator.expect_cancel().return_const(());
    negotiator.expect_negotiate().return_once(move |_, _| {
        Ok(NegotiatedTransport {
            local_setup: Some(SetupBlob::offer("scripted")),
            link: Some(local),
        })
    });

    let controller = ConnectionController::new(Arc::new(negotiator));
    controller.select_role(Role::Initiator);
    controller.initiate_connection().await.unwrap();
    reach(&controller, ConnectionState::Connected).await;
    (controller, remote)
}

#[tokio::test]
async fn test_unknown_command_frame_is_dropped_and_channel_stays_open() {
    // Arrange
    let (controller, remote) = connected_over_pair().await;
    let (outbound, _inbound, _handle) = remote.into_parts();
    let (tx, mut delivered) = mpsc::unbounded_channel();
    let _subscription = controller.on_message(move |c: &Command| {
        let _ = tx.send(*c);
    });

    // Act
    outbound
        .send(r#"{"type":"SYNC_TEST_UNKNOWN","ts":1}"#.into())
        .unwrap();
    let flagged = within(controller.wait_for(|s| s.last_error.is_some())).await;
    outbound
        .send(r#"{"type":"SYNC_TEST_NEXT","ts":2}"#.into())
        .unwrap();

    // Assert
    assert_eq!(flagged.state, ConnectionState::Connected);
    assert_eq!(flagged.channel_state, ChannelState::Open);
    assert!(flagged.last_error.unwrap().contains("SYNC_TEST_UNKNOWN"));
    assert_eq!(
        within(delivered.recv()).await,
        Some(Command::new(CommandType::Next, 2)),
        "only the known command reaches subscribers"
    );
    let cleared = within(controller.wait_for(|s| s.last_error.is_none())).await;
    assert_eq!(cleared.state, ConnectionState::Connected);
}

#[tokio::test]
async fn test_malformed_frame_sets_last_error_only() {
    // Arrange
    let (controller, remote) = connected_over_pair().await;
    let (outbound, _inbound, _handle) = remote.into_parts();

    // Act
    outbound.send("definitely not json".into()).unwrap();
    let flagged = within(controller.wait_for(|s| s.last_error.is_some())).await;

    // Assert
    assert_eq!(flagged.state, ConnectionState::Connected);
    assert_eq!(flagged.channel_state, ChannelState::Open);
    assert!(controller.send(CommandType::Next).is_ok());
}

#[tokio::test]
async fn test_far_end_closing_moves_controller_to_disconnected() {
    // Arrange
    let (controller, remote) = connected_over_pair().await;

    // Act
    remote.handle().close();
    let ended = reach(&controller, ConnectionState::Disconnected).await;

    // Assert
    assert_eq!(ended.role, Role::Initiator);
    assert!(ended.last_error.is_some());
    assert!(controller
        .events()
        .iter()
        .any(|e| e.message.starts_with("disconnected")));
}
