use std::time::Duration;

use serde_json::json;
use shared::domain::{MessageKey, UserId};

use super::*;
use crate::{
    ingestion::IngestionPipeline,
    repository::RepositoryError,
    subscriptions::{ChannelEvent, ChannelName},
    test_support::{wire_chat, wire_message, FakeRepository, ME, OTHER},
    typing::TypingTracker,
};

struct Fixture {
    store: Arc<ChatStore>,
    repository: Arc<FakeRepository>,
    reconciler: Arc<ReadReconciler>,
    pipeline: IngestionPipeline,
}

fn fixture() -> Fixture {
    let store = Arc::new(ChatStore::new());
    store.set_identity(Some(ME));
    let repository = FakeRepository::new(ME);
    let reconciler = Arc::new(ReadReconciler::new(Arc::clone(&store), repository.clone()));
    let pipeline = IngestionPipeline::new(
        Arc::clone(&store),
        Arc::clone(&reconciler),
        TypingTracker::new(Arc::clone(&store), Duration::from_secs(5)),
    );
    Fixture {
        store,
        repository,
        reconciler,
        pipeline,
    }
}

fn deliver(fx: &Fixture, room: i64, id: i64, sender: UserId) {
    fx.pipeline.ingest(&ChannelEvent {
        channel: ChannelName::room(RoomId(room)),
        name: "MessageSent".into(),
        data: serde_json::to_value(wire_message(id, room, sender, "text")).expect("json"),
    });
}

fn is_read(store: &ChatStore, room: i64, id: i64) -> bool {
    store
        .messages(RoomId(room))
        .iter()
        .find(|message| message.key == MessageKey::Confirmed(MessageId(id)))
        .map(|message| message.read)
        .expect("message present")
}

#[tokio::test]
async fn mark_read_confirms_and_clears_unread() {
    let fx = fixture();
    deliver(&fx, 1, 10, OTHER);
    assert_eq!(fx.store.unread(RoomId(1)), 1);

    fx.reconciler
        .mark_read(RoomId(1), &[MessageId(10)])
        .await
        .expect("mark read");

    assert_eq!(fx.store.unread(RoomId(1)), 0);
    assert!(is_read(&fx.store, 1, 10));
    assert_eq!(
        fx.repository.read_calls(),
        vec![(RoomId(1), vec![MessageId(10)])]
    );

    // A later inbound message counts from the confirmed zero.
    deliver(&fx, 1, 11, OTHER);
    assert_eq!(fx.store.unread(RoomId(1)), 1);
}

#[tokio::test]
async fn failed_mark_read_rolls_back_and_reports_sync_error() {
    let fx = fixture();
    deliver(&fx, 1, 10, OTHER);
    *fx.repository.read_failure.lock().expect("lock") = Some(RepositoryError::Status {
        status: 500,
        message: "Server Error".into(),
    });

    let err = fx
        .reconciler
        .mark_read(RoomId(1), &[MessageId(10)])
        .await
        .expect_err("mark read must fail");

    assert!(matches!(err, SessionError::Sync { room_id, .. } if room_id == RoomId(1)));
    assert_eq!(fx.store.unread(RoomId(1)), 1);
    assert!(!is_read(&fx.store, 1, 10));
}

#[tokio::test]
async fn unauthorized_mark_read_is_an_authentication_error() {
    let fx = fixture();
    deliver(&fx, 1, 10, OTHER);
    *fx.repository.read_failure.lock().expect("lock") =
        Some(RepositoryError::Unauthorized("Unauthenticated.".into()));

    let err = fx
        .reconciler
        .mark_read(RoomId(1), &[MessageId(10)])
        .await
        .expect_err("mark read must fail");

    assert_eq!(err, SessionError::Authentication("Unauthenticated.".into()));
    assert_eq!(fx.store.unread(RoomId(1)), 1);
}

#[tokio::test]
async fn optimistic_decrement_is_visible_while_in_flight() {
    let fx = fixture();
    deliver(&fx, 1, 10, OTHER);
    deliver(&fx, 1, 11, OTHER);
    let gate = fx.repository.gate.lock().await;

    let reconciler = Arc::clone(&fx.reconciler);
    let request = tokio::spawn(async move { reconciler.mark_read(RoomId(1), &[MessageId(10)]).await });
    crate::test_support::wait_until(|| fx.store.unread(RoomId(1)) == 1).await;

    // Inbound increments while the request is held stay visible.
    deliver(&fx, 1, 12, OTHER);
    assert_eq!(fx.store.unread(RoomId(1)), 2);

    drop(gate);
    request.await.expect("join").expect("mark read");
    assert_eq!(fx.store.unread(RoomId(1)), 2);
}

#[tokio::test]
async fn rollback_keeps_concurrent_inbound_increments() {
    let fx = fixture();
    deliver(&fx, 1, 10, OTHER);
    *fx.repository.read_failure.lock().expect("lock") = Some(RepositoryError::Network("reset".into()));
    let gate = fx.repository.gate.lock().await;

    let reconciler = Arc::clone(&fx.reconciler);
    let request = tokio::spawn(async move { reconciler.mark_read(RoomId(1), &[MessageId(10)]).await });
    crate::test_support::wait_until(|| fx.store.unread(RoomId(1)) == 0).await;
    deliver(&fx, 1, 11, OTHER);
    assert_eq!(fx.store.unread(RoomId(1)), 1);

    drop(gate);
    assert!(request.await.expect("join").is_err());
    assert_eq!(fx.store.unread(RoomId(1)), 2);
}

#[tokio::test]
async fn repeated_ids_and_already_read_messages_do_not_go_negative() {
    let fx = fixture();
    deliver(&fx, 1, 10, OTHER);

    fx.reconciler
        .mark_read(RoomId(1), &[MessageId(10), MessageId(10), MessageId(999)])
        .await
        .expect("mark read");
    fx.reconciler
        .mark_read(RoomId(1), &[MessageId(10)])
        .await
        .expect("mark read again");

    assert_eq!(fx.store.unread(RoomId(1)), 0);
    assert!(fx
        .reconciler
        .mark_read(RoomId(1), &[])
        .await
        .is_err());
}

#[tokio::test]
async fn own_receipt_from_another_device_settles_unread() {
    let fx = fixture();
    deliver(&fx, 1, 10, OTHER);
    deliver(&fx, 1, 11, OTHER);

    fx.pipeline.ingest(&ChannelEvent {
        channel: ChannelName::room(RoomId(1)),
        name: "MessagesRead".into(),
        data: json!({"reader_id": ME.0, "message_ids": [10]}),
    });

    assert_eq!(fx.store.unread(RoomId(1)), 1);
    assert!(is_read(&fx.store, 1, 10));
    assert!(!is_read(&fx.store, 1, 11));
}

#[tokio::test]
async fn receipt_from_peer_marks_our_messages_read() {
    let fx = fixture();
    deliver(&fx, 1, 20, ME);

    fx.pipeline.ingest(&ChannelEvent {
        channel: ChannelName::room(RoomId(1)),
        name: "MessagesRead".into(),
        data: json!({"reader_id": OTHER.0, "message_ids": [20]}),
    });

    assert!(is_read(&fx.store, 1, 20));
    assert_eq!(fx.store.unread(RoomId(1)), 0);
}

#[tokio::test]
async fn room_sync_adopts_backend_counts_and_focus_is_tracked() {
    let fx = fixture();
    let summaries = fx.reconciler.sync_rooms(&[wire_chat(1, 4), wire_chat(2, 0)]);

    assert_eq!(summaries.len(), 2);
    assert_eq!(fx.store.unread(RoomId(1)), 4);

    fx.reconciler.focus(RoomId(2));
    fx.reconciler.unfocus(RoomId(1));
    assert_eq!(fx.store.focused_room(), Some(RoomId(2)));
    fx.reconciler.unfocus(RoomId(2));
    assert_eq!(fx.store.focused_room(), None);
}

fn room_update(fx: &Fixture, name: &str, chat: serde_json::Value) {
    fx.pipeline.ingest(&ChannelEvent {
        channel: ChannelName::user(ME),
        name: name.into(),
        data: json!({ "chat": chat }),
    });
}

#[tokio::test]
async fn partial_room_update_keeps_fields_it_does_not_carry() {
    let fx = fixture();
    deliver(&fx, 1, 10, OTHER);
    deliver(&fx, 1, 11, OTHER);
    assert_eq!(fx.store.unread(RoomId(1)), 2);

    room_update(&fx, "ChatArchived", json!({"id": 1, "is_archived": true}));

    let summary = fx.store.summary(RoomId(1)).expect("summary");
    assert!(summary.archived);
    assert!(summary.can_send_messages);
    assert_eq!(fx.store.unread(RoomId(1)), 2);

    fx.reconciler
        .mark_read(RoomId(1), &[MessageId(10)])
        .await
        .expect("mark read");
    assert_eq!(fx.store.unread(RoomId(1)), 1);
}

#[tokio::test]
async fn backend_count_adopted_mid_flight_is_not_subtracted_again() {
    let fx = fixture();
    deliver(&fx, 1, 10, OTHER);
    deliver(&fx, 1, 11, OTHER);
    let gate = fx.repository.gate.lock().await;

    let reconciler = Arc::clone(&fx.reconciler);
    let request = tokio::spawn(async move { reconciler.mark_read(RoomId(1), &[MessageId(10)]).await });
    crate::test_support::wait_until(|| fx.store.unread(RoomId(1)) == 1).await;

    // The backend already counts the in-flight read.
    room_update(&fx, "ChatUpdated", json!({"id": 1, "unread_count": 1}));
    assert_eq!(fx.store.unread(RoomId(1)), 1);

    drop(gate);
    request.await.expect("join").expect("mark read");
    assert_eq!(fx.store.unread(RoomId(1)), 1);
    assert!(!is_read(&fx.store, 1, 11));

    fx.reconciler
        .mark_read(RoomId(1), &[MessageId(11)])
        .await
        .expect("mark remaining");
    assert_eq!(fx.store.unread(RoomId(1)), 0);
}

#[tokio::test]
async fn history_reload_mid_flight_keeps_the_pending_decrement() {
    let fx = fixture();
    deliver(&fx, 1, 10, OTHER);
    deliver(&fx, 1, 11, OTHER);
    let gate = fx.repository.gate.lock().await;

    let reconciler = Arc::clone(&fx.reconciler);
    let request = tokio::spawn(async move { reconciler.mark_read(RoomId(1), &[MessageId(10)]).await });
    crate::test_support::wait_until(|| fx.store.unread(RoomId(1)) == 1).await;

    let mut chat = wire_chat(1, 0);
    chat.unread_count = None;
    fx.pipeline.load_history(
        &chat,
        vec![wire_message(10, 1, OTHER, "text"), wire_message(11, 1, OTHER, "text")],
    );

    drop(gate);
    request.await.expect("join").expect("mark read");
    assert_eq!(fx.store.unread(RoomId(1)), 1);
}
