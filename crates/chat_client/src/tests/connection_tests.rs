use std::sync::Arc;

use serde_json::json;
use tokio::sync::broadcast::error::TryRecvError;

use super::*;
use crate::test_support::{credential, wait_until, FakeAuthorizer, FakeTransport, ME, OTHER};

fn manager() -> (
    Arc<ConnectionManager>,
    mpsc::UnboundedReceiver<ConnectionSignal>,
    Arc<FakeTransport>,
    Arc<FakeAuthorizer>,
) {
    let transport = FakeTransport::new();
    let authorizer = FakeAuthorizer::new();
    let (manager, signals) = ConnectionManager::new(transport.clone(), authorizer.clone());
    (manager, signals, transport, authorizer)
}

#[tokio::test]
async fn connect_with_same_credential_is_idempotent() {
    let (manager, _signals, transport, _authorizer) = manager();

    manager.connect(credential(ME)).await.expect("first connect");
    let generation = manager.current_generation();
    manager.connect(credential(ME)).await.expect("second connect");

    assert_eq!(manager.state(), ConnectionState::Connected);
    assert_eq!(transport.open_count(), 1);
    assert_eq!(manager.current_generation(), generation);
    assert_eq!(manager.socket_id().as_deref(), Some("1.1000"));
}

#[tokio::test]
async fn new_credential_replaces_the_connection() {
    let (manager, _signals, transport, _authorizer) = manager();

    manager.connect(credential(ME)).await.expect("connect me");
    let first_generation = manager.current_generation();
    manager.connect(credential(OTHER)).await.expect("connect other");

    assert_eq!(transport.open_count(), 2);
    assert!(manager.current_generation() > first_generation);
    assert_eq!(manager.credential(), Some(credential(OTHER)));
    assert_eq!(manager.socket_id().as_deref(), Some("2.1000"));
}

#[tokio::test]
async fn rejected_credential_fails_then_settles_disconnected() {
    let (manager, _signals, _transport, authorizer) = manager();
    authorizer.reject_user(ME);
    let mut transitions = manager.transitions();

    let err = manager
        .connect(credential(ME))
        .await
        .expect_err("credential must be rejected");

    assert!(matches!(err, SessionError::Authentication(_)));
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert_eq!(manager.credential(), None);
    assert_eq!(transitions.try_recv(), Ok(ConnectionState::Connecting));
    assert_eq!(transitions.try_recv(), Ok(ConnectionState::Failed));
    assert_eq!(transitions.try_recv(), Ok(ConnectionState::Disconnected));
    assert_eq!(
        authorizer.calls(),
        vec![ChannelName::user(ME).as_str().to_string()]
    );
}

#[tokio::test]
async fn transport_failure_surfaces_as_transport_error() {
    let (manager, _signals, transport, _authorizer) = manager();
    transport.fail_next(SessionError::Transport("connection refused".into()));

    let err = manager
        .connect(credential(ME))
        .await
        .expect_err("open must fail");

    assert_eq!(err, SessionError::Transport("connection refused".into()));
    assert_eq!(manager.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn disconnect_when_already_disconnected_is_a_noop() {
    let (manager, _signals, _transport, _authorizer) = manager();
    let mut transitions = manager.transitions();

    manager.disconnect().await;
    manager.disconnect().await;

    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert_eq!(transitions.try_recv(), Err(TryRecvError::Empty));
}

#[tokio::test]
async fn frames_are_tagged_with_the_live_generation() {
    let (manager, mut signals, transport, _authorizer) = manager();
    manager.connect(credential(ME)).await.expect("connect");
    let generation = manager.current_generation();

    transport
        .last_socket()
        .push_event("private-chat.1", "MessageSent", json!({"id": 1}));

    let signal = signals.recv().await.expect("signal");
    match signal {
        ConnectionSignal::Frame { generation: tagged, frame } => {
            assert_eq!(tagged, generation);
            assert_eq!(frame.event, "MessageSent");
        }
        other => panic!("unexpected signal {other:?}"),
    }
}

#[tokio::test]
async fn teardown_invalidates_the_previous_generation() {
    let (manager, _signals, _transport, _authorizer) = manager();
    manager.connect(credential(ME)).await.expect("connect");
    let generation = manager.current_generation();

    manager.disconnect().await;

    assert_ne!(manager.current_generation(), generation);
    assert_eq!(manager.credential(), None);
    assert_eq!(manager.socket_id(), None);
    assert!(manager
        .send(PusherFrame::unsubscribe("private-chat.1"))
        .is_err());
}

#[tokio::test]
async fn closed_socket_reports_loss_and_disconnects() {
    let (manager, mut signals, transport, _authorizer) = manager();
    manager.connect(credential(ME)).await.expect("connect");
    let generation = manager.current_generation();

    transport.last_socket().close();

    let signal = signals.recv().await.expect("signal");
    assert!(matches!(
        signal,
        ConnectionSignal::Lost { generation: lost, .. } if lost == generation
    ));
    wait_until(|| manager.state() == ConnectionState::Disconnected).await;
    // The credential is kept so the session can reconnect.
    assert_eq!(manager.credential(), Some(credential(ME)));
}
