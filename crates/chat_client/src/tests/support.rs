use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde_json::Value;
use shared::{
    domain::{MessageId, RoomId, UserId},
    protocol::{
        PaginatedMessages, PaginationMeta, PusherFrame, RoomMessages, WireChat, WireMessage,
        EVENT_SUBSCRIBE,
    },
};
use tokio::sync::mpsc;

use crate::{
    backoff::ReconnectPolicy,
    credentials::Credential,
    error::SessionError,
    repository::{ChatRepository, FileUpload, RepositoryError},
    session::{ChatSession, SessionConfig},
    subscriptions::{ChannelEvent, ChannelListener, ChannelName},
    transport::{ChannelAuthorizer, Transport, TransportLink},
};

pub(crate) const ME: UserId = UserId(7);
pub(crate) const OTHER: UserId = UserId(42);

pub(crate) fn credential(user_id: UserId) -> Credential {
    Credential::new(user_id, format!("token-{user_id}"))
}

pub(crate) async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..300 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition was not reached in time");
}

/// Server side of one fake socket.
pub(crate) struct FakeSocket {
    pub(crate) socket_id: String,
    inbound: Mutex<Option<mpsc::UnboundedSender<PusherFrame>>>,
    sent: Arc<Mutex<Vec<PusherFrame>>>,
}

impl FakeSocket {
    pub(crate) fn push(&self, frame: PusherFrame) {
        if let Some(tx) = self.inbound.lock().expect("socket lock").as_ref() {
            let _ = tx.send(frame);
        }
    }

    pub(crate) fn push_event(&self, channel: &str, event: &str, data: Value) {
        self.push(PusherFrame::new(event, Some(channel.to_string()), data));
    }

    /// Simulates the server dropping the connection.
    pub(crate) fn close(&self) {
        self.inbound.lock().expect("socket lock").take();
    }

    pub(crate) fn sent(&self) -> Vec<PusherFrame> {
        self.sent.lock().expect("sent lock").clone()
    }

    pub(crate) fn sent_for(&self, event: &str) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter(|frame| frame.event == event)
            .filter_map(|frame| {
                frame
                    .data_value()
                    .get("channel")
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
            .collect()
    }

    pub(crate) fn subscribed(&self) -> Vec<String> {
        self.sent_for(EVENT_SUBSCRIBE)
    }
}

#[derive(Default)]
pub(crate) struct FakeTransport {
    sockets: Mutex<Vec<Arc<FakeSocket>>>,
    failures: Mutex<VecDeque<SessionError>>,
}

impl FakeTransport {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn fail_next(&self, err: SessionError) {
        self.failures.lock().expect("failures lock").push_back(err);
    }

    pub(crate) fn open_count(&self) -> usize {
        self.sockets.lock().expect("sockets lock").len()
    }

    pub(crate) fn socket(&self, index: usize) -> Arc<FakeSocket> {
        Arc::clone(&self.sockets.lock().expect("sockets lock")[index])
    }

    pub(crate) fn last_socket(&self) -> Arc<FakeSocket> {
        let sockets = self.sockets.lock().expect("sockets lock");
        Arc::clone(sockets.last().expect("a socket was opened"))
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn open(&self) -> Result<TransportLink, SessionError> {
        if let Some(err) = self.failures.lock().expect("failures lock").pop_front() {
            return Err(err);
        }
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<PusherFrame>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<PusherFrame>();
        let sent = Arc::new(Mutex::new(Vec::new()));
        let socket_id = format!("{}.{}", self.open_count() + 1, 1000);

        let sink = Arc::clone(&sent);
        let task = tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                sink.lock().expect("sent lock").push(frame);
            }
        });

        self.sockets
            .lock()
            .expect("sockets lock")
            .push(Arc::new(FakeSocket {
                socket_id: socket_id.clone(),
                inbound: Mutex::new(Some(inbound_tx)),
                sent,
            }));
        Ok(TransportLink {
            socket_id,
            outbound: outbound_tx,
            inbound: inbound_rx,
            task,
        })
    }
}

#[derive(Default)]
pub(crate) struct FakeAuthorizer {
    rejected_users: Mutex<HashSet<UserId>>,
    rejected_channels: Mutex<HashSet<String>>,
    calls: Mutex<Vec<String>>,
}

impl FakeAuthorizer {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn reject_user(&self, user_id: UserId) {
        self.rejected_users
            .lock()
            .expect("authorizer lock")
            .insert(user_id);
    }

    pub(crate) fn reject_channel(&self, channel: &ChannelName) {
        self.rejected_channels
            .lock()
            .expect("authorizer lock")
            .insert(channel.as_str().to_string());
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("authorizer lock").clone()
    }
}

#[async_trait]
impl ChannelAuthorizer for FakeAuthorizer {
    async fn authorize(
        &self,
        socket_id: &str,
        channel: &ChannelName,
        credential: &Credential,
    ) -> Result<String, SessionError> {
        self.calls
            .lock()
            .expect("authorizer lock")
            .push(channel.as_str().to_string());
        if self
            .rejected_users
            .lock()
            .expect("authorizer lock")
            .contains(&credential.user_id)
        {
            return Err(SessionError::Authentication("token revoked".into()));
        }
        if self
            .rejected_channels
            .lock()
            .expect("authorizer lock")
            .contains(channel.as_str())
        {
            return Err(SessionError::Authentication(format!("{channel} forbidden")));
        }
        Ok(format!("app-key:{socket_id}:{channel}"))
    }
}

#[derive(Default)]
pub(crate) struct RecordingListener {
    events: Mutex<Vec<ChannelEvent>>,
}

impl RecordingListener {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn names(&self) -> Vec<String> {
        self.events
            .lock()
            .expect("listener lock")
            .iter()
            .map(|event| event.name.clone())
            .collect()
    }
}

impl ChannelListener for RecordingListener {
    fn on_event(&self, event: &ChannelEvent) {
        self.events
            .lock()
            .expect("listener lock")
            .push(event.clone());
    }
}

pub(crate) fn wire_message(id: i64, room: i64, sender: UserId, text: &str) -> WireMessage {
    WireMessage {
        id: MessageId(id),
        room_id: Some(RoomId(room)),
        sender_id: sender,
        message: Some(text.to_string()),
        file_url: None,
        file_name: None,
        mime_type: None,
        created_at: Utc.timestamp_opt(1_700_000_000 + id, 0).single(),
        is_read: Some(false),
        read_at: None,
    }
}

pub(crate) fn wire_chat(id: i64, unread: u32) -> WireChat {
    WireChat {
        id: RoomId(id),
        title: Some(format!("Room {id}")),
        unread_count: Some(unread),
        is_archived: Some(false),
        can_send_messages: Some(true),
        last_message: None,
    }
}

/// In-memory backend. `gate` holds send and mark-read calls while locked.
pub(crate) struct FakeRepository {
    pub(crate) sender: UserId,
    pub(crate) chats: Mutex<Vec<WireChat>>,
    pub(crate) history: Mutex<HashMap<RoomId, Vec<WireMessage>>>,
    pub(crate) archived: Mutex<Vec<WireMessage>>,
    pub(crate) send_failure: Mutex<Option<RepositoryError>>,
    pub(crate) read_failure: Mutex<Option<RepositoryError>>,
    pub(crate) chats_failure: Mutex<Option<RepositoryError>>,
    pub(crate) gate: tokio::sync::Mutex<()>,
    pub(crate) read_calls: Mutex<Vec<(RoomId, Vec<MessageId>)>>,
    pub(crate) typing_calls: Mutex<Vec<(RoomId, bool)>>,
    pub(crate) reports: Mutex<Vec<(RoomId, String)>>,
    next_id: AtomicI64,
}

impl FakeRepository {
    pub(crate) fn new(sender: UserId) -> Arc<Self> {
        Arc::new(Self {
            sender,
            chats: Mutex::new(Vec::new()),
            history: Mutex::new(HashMap::new()),
            archived: Mutex::new(Vec::new()),
            send_failure: Mutex::new(None),
            read_failure: Mutex::new(None),
            chats_failure: Mutex::new(None),
            gate: tokio::sync::Mutex::new(()),
            read_calls: Mutex::new(Vec::new()),
            typing_calls: Mutex::new(Vec::new()),
            reports: Mutex::new(Vec::new()),
            next_id: AtomicI64::new(100),
        })
    }

    pub(crate) fn next_message_id(&self) -> i64 {
        self.next_id.load(Ordering::SeqCst) + 1
    }

    pub(crate) fn read_calls(&self) -> Vec<(RoomId, Vec<MessageId>)> {
        self.read_calls.lock().expect("repository lock").clone()
    }
}

#[async_trait]
impl ChatRepository for FakeRepository {
    async fn get_chats(&self, _include_archived: bool) -> Result<Vec<WireChat>, RepositoryError> {
        if let Some(err) = self.chats_failure.lock().expect("repository lock").clone() {
            return Err(err);
        }
        Ok(self.chats.lock().expect("repository lock").clone())
    }

    async fn get_messages(&self, room_id: RoomId) -> Result<RoomMessages, RepositoryError> {
        let room = self
            .chats
            .lock()
            .expect("repository lock")
            .iter()
            .find(|chat| chat.id == room_id)
            .cloned()
            .unwrap_or_else(|| wire_chat(room_id.0, 0));
        let messages = self
            .history
            .lock()
            .expect("repository lock")
            .get(&room_id)
            .cloned()
            .unwrap_or_default();
        Ok(RoomMessages { room, messages })
    }

    async fn send_message(
        &self,
        room_id: RoomId,
        message: &str,
    ) -> Result<WireMessage, RepositoryError> {
        let _gate = self.gate.lock().await;
        if let Some(err) = self.send_failure.lock().expect("repository lock").clone() {
            return Err(err);
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(wire_message(id, room_id.0, self.sender, message))
    }

    async fn send_file_message(
        &self,
        room_id: RoomId,
        file: FileUpload,
        caption: Option<&str>,
    ) -> Result<WireMessage, RepositoryError> {
        let _gate = self.gate.lock().await;
        if let Some(err) = self.send_failure.lock().expect("repository lock").clone() {
            return Err(err);
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let mut wire = wire_message(id, room_id.0, self.sender, caption.unwrap_or_default());
        wire.file_url = Some(format!("https://cdn.test/uploads/{}", file.file_name));
        wire.file_name = Some(file.file_name);
        wire.mime_type = file.mime_type;
        Ok(wire)
    }

    async fn mark_as_read(
        &self,
        room_id: RoomId,
        message_ids: &[MessageId],
    ) -> Result<(), RepositoryError> {
        let _gate = self.gate.lock().await;
        self.read_calls
            .lock()
            .expect("repository lock")
            .push((room_id, message_ids.to_vec()));
        match self.read_failure.lock().expect("repository lock").clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn send_typing_status(
        &self,
        room_id: RoomId,
        is_typing: bool,
    ) -> Result<(), RepositoryError> {
        self.typing_calls
            .lock()
            .expect("repository lock")
            .push((room_id, is_typing));
        Ok(())
    }

    async fn get_archived_chats(&self) -> Result<Vec<WireChat>, RepositoryError> {
        let mut chat = wire_chat(90, 3);
        chat.is_archived = Some(true);
        Ok(vec![chat])
    }

    async fn get_archived_messages(
        &self,
        _room_id: RoomId,
        page: u32,
        per_page: u32,
    ) -> Result<PaginatedMessages, RepositoryError> {
        let all = self.archived.lock().expect("repository lock").clone();
        let start = ((page - 1) * per_page) as usize;
        let messages: Vec<_> = all.iter().skip(start).take(per_page as usize).cloned().collect();
        let total = all.len() as u64;
        Ok(PaginatedMessages {
            messages,
            meta: PaginationMeta {
                current_page: page,
                last_page: total.div_ceil(u64::from(per_page)).max(1) as u32,
                per_page,
                total,
            },
        })
    }

    async fn report_archived_chat(
        &self,
        room_id: RoomId,
        reason: &str,
    ) -> Result<(), RepositoryError> {
        self.reports
            .lock()
            .expect("repository lock")
            .push((room_id, reason.to_string()));
        Ok(())
    }

    async fn export_archived_chat(&self, room_id: RoomId) -> Result<Vec<u8>, RepositoryError> {
        Ok(format!("export of room {room_id}").into_bytes())
    }
}

pub(crate) struct Harness {
    pub(crate) session: Arc<ChatSession>,
    pub(crate) transport: Arc<FakeTransport>,
    pub(crate) authorizer: Arc<FakeAuthorizer>,
    pub(crate) repository: Arc<FakeRepository>,
}

pub(crate) fn harness() -> Harness {
    let transport = FakeTransport::new();
    let authorizer = FakeAuthorizer::new();
    let repository = FakeRepository::new(ME);
    let config = SessionConfig {
        typing_expiry: Duration::from_secs(5),
        reconnect: ReconnectPolicy {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(40),
            max_attempts: 4,
        },
    };
    let session = ChatSession::new(
        config,
        repository.clone(),
        transport.clone(),
        authorizer.clone(),
    );
    Harness {
        session,
        transport,
        authorizer,
        repository,
    }
}
