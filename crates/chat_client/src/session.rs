//! Session facade tying the connection, subscriptions, ingestion, read state
//! and the REST repository together for one signed-in user.

use std::{
    sync::{Arc, Mutex, MutexGuard, Weak},
    time::Duration,
};

use chrono::Utc;
use shared::{
    domain::{ChatSummary, Message, MessageBody, MessageId, MessageKey, RoomId, UserId},
    protocol::{PaginationMeta, RoomMessages, WireChat},
};
use tokio::{
    sync::{broadcast, mpsc},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    backoff::ReconnectPolicy,
    connection::{ConnectionManager, ConnectionSignal, ConnectionState},
    credentials::{Credential, CredentialSource},
    error::SessionError,
    ingestion::{normalize_message, IngestionPipeline},
    reconciler::{self, ReadReconciler},
    repository::{ChatRepository, FileUpload, HttpChatRepository},
    settings::{BroadcastSettings, SettingsError},
    store::{ChatStore, SessionEvent},
    subscriptions::{ChannelListener, ChannelName, ChannelRegistry, SubscriptionHandle},
    transport::{ChannelAuthorizer, HttpChannelAuthorizer, Transport, WebSocketTransport},
    typing::TypingTracker,
};

pub const MAX_ARCHIVE_PAGE_SIZE: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    pub typing_expiry: Duration,
    pub reconnect: ReconnectPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from(&BroadcastSettings::default())
    }
}

impl From<&BroadcastSettings> for SessionConfig {
    fn from(settings: &BroadcastSettings) -> Self {
        Self {
            typing_expiry: settings.typing_expiry(),
            reconnect: ReconnectPolicy::from(&settings.reconnect),
        }
    }
}

/// One page of an archived conversation.
#[derive(Debug, Clone, PartialEq)]
pub struct ArchivedPage {
    pub messages: Vec<Message>,
    pub meta: PaginationMeta,
}

pub struct ChatSession {
    connection: Arc<ConnectionManager>,
    registry: Arc<ChannelRegistry>,
    store: Arc<ChatStore>,
    pipeline: Arc<IngestionPipeline>,
    reconciler: Arc<ReadReconciler>,
    repository: Arc<dyn ChatRepository>,
    reconnect: ReconnectPolicy,
    user_channel: Mutex<Option<SubscriptionHandle>>,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ChatSession {
    /// Builds a session and starts its dispatch tasks. Must be called from
    /// within a tokio runtime.
    pub fn new(
        config: SessionConfig,
        repository: Arc<dyn ChatRepository>,
        transport: Arc<dyn Transport>,
        authorizer: Arc<dyn ChannelAuthorizer>,
    ) -> Arc<Self> {
        let (connection, signals) = ConnectionManager::new(transport, authorizer);
        let registry = ChannelRegistry::new(&connection);
        let store = Arc::new(ChatStore::new());
        let reconciler = Arc::new(ReadReconciler::new(
            Arc::clone(&store),
            Arc::clone(&repository),
        ));
        let (focus_tx, focus_rx) = mpsc::unbounded_channel();
        let pipeline = Arc::new(
            IngestionPipeline::new(
                Arc::clone(&store),
                Arc::clone(&reconciler),
                TypingTracker::new(Arc::clone(&store), config.typing_expiry),
            )
            .with_focus_feed(focus_tx),
        );

        let session = Arc::new(Self {
            connection,
            registry,
            store,
            pipeline,
            reconciler,
            repository,
            reconnect: config.reconnect,
            user_channel: Mutex::new(None),
            reconnect_task: Mutex::new(None),
            background: Mutex::new(Vec::new()),
        });
        let tasks = vec![
            session.spawn_dispatch(signals),
            session.spawn_state_forwarder(),
            session.spawn_focus_reader(focus_rx),
        ];
        lock(&session.background).extend(tasks);
        session
    }

    /// Wires the websocket transport, the HTTP channel authorizer and the
    /// HTTP repository from settings.
    pub fn from_settings(
        settings: &BroadcastSettings,
        credentials: CredentialSource,
    ) -> Result<Arc<Self>, SettingsError> {
        settings.validate()?;
        let transport = WebSocketTransport::new(settings.websocket_url()?, settings.handshake_timeout());
        let authorizer = HttpChannelAuthorizer::new(settings.auth_endpoint.clone());
        let repository = HttpChatRepository::new(settings.api_base_url.clone(), credentials);
        Ok(Self::new(
            SessionConfig::from(settings),
            Arc::new(repository),
            Arc::new(transport),
            Arc::new(authorizer),
        ))
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.store.subscribe()
    }

    pub fn store(&self) -> &ChatStore {
        &self.store
    }

    pub fn registry(&self) -> &ChannelRegistry {
        &self.registry
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Connects as `credential`, subscribes the user's notification channel
    /// and loads the room list.
    pub async fn login(&self, credential: Credential) -> Result<Vec<ChatSummary>, SessionError> {
        let identity = credential.user_id;
        if self.store.identity().is_some_and(|previous| previous != identity) {
            self.store.reset();
            lock(&self.user_channel).take();
        }
        self.cancel_reconnect();

        self.connection
            .connect(credential)
            .await
            .map_err(|err| self.surface(err))?;
        self.store.set_identity(Some(identity));
        self.ensure_user_channel(identity).await;

        let chats = self
            .repository
            .get_chats(false)
            .await
            .map_err(|err| self.surface(err.into()))?;
        info!(user_id = identity.0, rooms = chats.len(), "session: logged in");
        Ok(self.reconciler.sync_rooms(&chats))
    }

    /// Drops the connection, every subscription and all cached chat state.
    pub async fn logout(&self) {
        self.cancel_reconnect();
        self.connection.disconnect().await;
        self.registry.clear();
        lock(&self.user_channel).take();
        self.store.reset();
        info!("session: logged out");
    }

    /// Follows a credential source: a new credential logs in, `None` logs out.
    pub fn bind_credentials(self: &Arc<Self>, source: &CredentialSource) {
        let mut rx = source.watch();
        let weak = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            loop {
                let current = rx.borrow_and_update().clone();
                let Some(session) = weak.upgrade() else {
                    break;
                };
                match current {
                    Some(credential) => {
                        if let Err(err) = session.login(credential).await {
                            warn!("session: login from credential source failed: {err}");
                            session.store.publish(SessionEvent::Error(err));
                        }
                    }
                    None => session.logout().await,
                }
                drop(session);
                if rx.changed().await.is_err() {
                    break;
                }
            }
        });
        lock(&self.background).push(task);
    }

    pub async fn load_chats(&self, include_archived: bool) -> Result<Vec<ChatSummary>, SessionError> {
        self.require_identity()?;
        let chats = self
            .repository
            .get_chats(include_archived)
            .await
            .map_err(|err| self.surface(err.into()))?;
        Ok(self.reconciler.sync_rooms(&chats))
    }

    /// Subscribes the room channel, focuses the room, loads its history and
    /// marks unread messages from others as read.
    pub async fn open_room(&self, room_id: RoomId) -> Result<Vec<Message>, SessionError> {
        self.require_identity()?;
        let channel = ChannelName::room(room_id);
        if self.registry.listener_count(&channel) == 0 {
            let listener: Arc<dyn ChannelListener> = self.pipeline.clone();
            self.registry.subscribe(channel, listener).await;
        }
        self.reconciler.focus(room_id);

        let RoomMessages { room, messages } = self
            .repository
            .get_messages(room_id)
            .await
            .map_err(|err| self.surface(err.into()))?;
        let history = self.pipeline.load_history(&room, messages);
        debug!(room_id = room_id.0, messages = history.len(), "session: room opened");

        let unread = self
            .store
            .inspect_room(room_id, reconciler::unread_from_others)
            .unwrap_or_default();
        if !unread.is_empty() {
            if let Err(err) = self.reconciler.mark_read(room_id, &unread).await {
                let err = self.surface(err);
                self.store.publish(SessionEvent::Error(err));
            }
        }
        Ok(self.store.messages(room_id))
    }

    /// Releases the room channel and its focus. Cached messages stay.
    pub fn close_room(&self, room_id: RoomId) {
        self.registry.unsubscribe(&ChannelName::room(room_id));
        self.reconciler.unfocus(room_id);
    }

    pub async fn send_message(&self, room_id: RoomId, text: &str) -> Result<Message, SessionError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(SessionError::Validation("message must not be empty".into()));
        }
        let identity = self.require_identity()?;
        self.ensure_can_send(room_id)?;

        let pending = self.optimistic(room_id, identity, MessageBody::text(text));
        self.pipeline.apply_optimistic(pending.clone());
        match self.repository.send_message(room_id, text).await {
            Ok(wire) => Ok(self
                .pipeline
                .confirm_optimistic(&pending, normalize_message(wire, room_id))),
            Err(err) => {
                self.pipeline.discard_optimistic(&pending);
                Err(self.surface(SessionError::sync(room_id, err)))
            }
        }
    }

    pub async fn send_file_message(
        &self,
        room_id: RoomId,
        file: FileUpload,
        caption: Option<&str>,
    ) -> Result<Message, SessionError> {
        if file.file_name.trim().is_empty() {
            return Err(SessionError::Validation("file name must not be empty".into()));
        }
        if file.bytes.is_empty() {
            return Err(SessionError::Validation(format!(
                "file '{}' is empty",
                file.file_name
            )));
        }
        let caption = caption.map(str::trim).filter(|text| !text.is_empty());
        let identity = self.require_identity()?;
        self.ensure_can_send(room_id)?;

        let body = MessageBody::File {
            name: file.file_name.clone(),
            url: None,
            mime_type: file.mime_type.clone(),
            caption: caption.map(str::to_string),
        };
        let pending = self.optimistic(room_id, identity, body);
        self.pipeline.apply_optimistic(pending.clone());
        match self.repository.send_file_message(room_id, file, caption).await {
            Ok(wire) => Ok(self
                .pipeline
                .confirm_optimistic(&pending, normalize_message(wire, room_id))),
            Err(err) => {
                self.pipeline.discard_optimistic(&pending);
                Err(self.surface(SessionError::sync(room_id, err)))
            }
        }
    }

    pub async fn mark_read(&self, room_id: RoomId, ids: &[MessageId]) -> Result<(), SessionError> {
        self.require_identity()?;
        self.reconciler
            .mark_read(room_id, ids)
            .await
            .map_err(|err| self.surface(err))
    }

    pub async fn set_typing(&self, room_id: RoomId, is_typing: bool) -> Result<(), SessionError> {
        self.require_identity()?;
        self.repository
            .send_typing_status(room_id, is_typing)
            .await
            .map_err(|err| self.surface(err.into()))
    }

    pub async fn archived_chats(&self) -> Result<Vec<ChatSummary>, SessionError> {
        self.require_identity()?;
        let chats = self
            .repository
            .get_archived_chats()
            .await
            .map_err(|err| self.surface(err.into()))?;
        Ok(chats.iter().map(archived_summary).collect())
    }

    pub async fn archived_messages(
        &self,
        room_id: RoomId,
        page: u32,
        per_page: u32,
    ) -> Result<ArchivedPage, SessionError> {
        if page == 0 {
            return Err(SessionError::Validation("page numbers start at 1".into()));
        }
        if per_page == 0 || per_page > MAX_ARCHIVE_PAGE_SIZE {
            return Err(SessionError::Validation(format!(
                "per_page must be between 1 and {MAX_ARCHIVE_PAGE_SIZE}"
            )));
        }
        self.require_identity()?;
        let page = self
            .repository
            .get_archived_messages(room_id, page, per_page)
            .await
            .map_err(|err| self.surface(err.into()))?;
        let mut messages: Vec<Message> = page
            .messages
            .into_iter()
            .map(|wire| normalize_message(wire, room_id))
            .collect();
        messages.sort_by_key(Message::sort_key);
        Ok(ArchivedPage {
            messages,
            meta: page.meta,
        })
    }

    pub async fn report_archived_chat(&self, room_id: RoomId, reason: &str) -> Result<(), SessionError> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(SessionError::Validation("report reason must not be empty".into()));
        }
        self.require_identity()?;
        self.repository
            .report_archived_chat(room_id, reason)
            .await
            .map_err(|err| self.surface(err.into()))
    }

    pub async fn export_archived_chat(&self, room_id: RoomId) -> Result<Vec<u8>, SessionError> {
        self.require_identity()?;
        self.repository
            .export_archived_chat(room_id)
            .await
            .map_err(|err| self.surface(err.into()))
    }

    fn require_identity(&self) -> Result<UserId, SessionError> {
        self.store
            .identity()
            .ok_or_else(|| SessionError::Authentication("not logged in".into()))
    }

    fn ensure_can_send(&self, room_id: RoomId) -> Result<(), SessionError> {
        match self.store.summary(room_id) {
            Some(summary) if summary.archived || !summary.can_send_messages => Err(
                SessionError::Validation(format!("room {room_id} does not accept new messages")),
            ),
            _ => Ok(()),
        }
    }

    fn optimistic(&self, room_id: RoomId, sender_id: UserId, body: MessageBody) -> Message {
        Message {
            key: MessageKey::new_pending(),
            room_id,
            sender_id,
            body,
            sent_at: Utc::now(),
            read: false,
        }
    }

    /// Publishes `SessionExpired` for authentication failures and hands the
    /// error back.
    fn surface(&self, err: SessionError) -> SessionError {
        if matches!(err, SessionError::Authentication(_)) {
            self.store.publish(SessionEvent::SessionExpired);
        }
        err
    }

    async fn ensure_user_channel(&self, identity: UserId) {
        let channel = ChannelName::user(identity);
        {
            let current = lock(&self.user_channel);
            if current.as_ref().is_some_and(|handle| handle.channel == channel)
                && self.registry.listener_count(&channel) > 0
            {
                return;
            }
        }
        let listener: Arc<dyn ChannelListener> = self.pipeline.clone();
        let handle = self.registry.subscribe(channel, listener).await;
        *lock(&self.user_channel) = Some(handle);
    }

    fn cancel_reconnect(&self) {
        if let Some(task) = lock(&self.reconnect_task).take() {
            task.abort();
        }
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        let Some(credential) = self.connection.credential() else {
            return;
        };
        let mut slot = lock(&self.reconnect_task);
        if slot.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        let policy = self.reconnect;
        let weak = Arc::downgrade(self);
        *slot = Some(tokio::spawn(reconnect_loop(weak, credential, policy)));
    }

    fn spawn_dispatch(
        self: &Arc<Self>,
        mut signals: mpsc::UnboundedReceiver<ConnectionSignal>,
    ) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(signal) = signals.recv().await {
                let Some(session) = weak.upgrade() else {
                    break;
                };
                match signal {
                    ConnectionSignal::Frame { generation, frame } => {
                        session.registry.dispatch(generation, frame);
                    }
                    ConnectionSignal::Lost { generation, reason } => {
                        warn!(generation, "session: connection lost: {reason}");
                        session
                            .store
                            .publish(SessionEvent::Error(SessionError::Transport(reason)));
                        session.schedule_reconnect();
                    }
                }
            }
        })
    }

    fn spawn_state_forwarder(&self) -> JoinHandle<()> {
        let mut transitions = self.connection.transitions();
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            loop {
                match transitions.recv().await {
                    Ok(state) => {
                        if state == ConnectionState::Disconnected {
                            store.clear_typing();
                        }
                        store.publish(SessionEvent::ConnectionChanged(state));
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "session: connection transitions lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Messages from others that land in the focused room are read on arrival.
    fn spawn_focus_reader(self: &Arc<Self>, mut feed: mpsc::UnboundedReceiver<Message>) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(message) = feed.recv().await {
                let Some(id) = message.key.confirmed_id() else {
                    continue;
                };
                let Some(session) = weak.upgrade() else {
                    break;
                };
                if let Err(err) = session.reconciler.mark_read(message.room_id, &[id]).await {
                    let err = session.surface(err);
                    session.store.publish(SessionEvent::Error(err));
                }
            }
        })
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.reconnect_task).take() {
            task.abort();
        }
        for task in lock(&self.background).drain(..) {
            task.abort();
        }
    }
}

async fn reconnect_loop(session: Weak<ChatSession>, credential: Credential, policy: ReconnectPolicy) {
    let mut attempt = 0;
    while let Some(delay) = policy.delay_for(attempt) {
        tokio::time::sleep(delay).await;
        let Some(active) = session.upgrade() else {
            return;
        };
        if active.connection.credential().as_ref() != Some(&credential) {
            debug!("session: credential changed; abandoning reconnect");
            return;
        }
        if active.connection.state() == ConnectionState::Connected {
            return;
        }
        match active.connection.connect(credential.clone()).await {
            Ok(()) => {
                info!(attempt, "session: reconnected");
                return;
            }
            Err(SessionError::Authentication(reason)) => {
                warn!("session: reconnect rejected: {reason}");
                active
                    .store
                    .publish(SessionEvent::Error(SessionError::Authentication(reason)));
                active.store.publish(SessionEvent::SessionExpired);
                return;
            }
            Err(err) => warn!(attempt, "session: reconnect attempt failed: {err}"),
        }
        attempt += 1;
    }
    if let Some(active) = session.upgrade() {
        active.store.publish(SessionEvent::Error(SessionError::Transport(format!(
            "gave up reconnecting after {} attempts",
            policy.max_attempts
        ))));
    }
}

fn archived_summary(chat: &WireChat) -> ChatSummary {
    ChatSummary {
        room_id: chat.id,
        title: chat.title.clone(),
        unread_count: 0,
        last_message: chat
            .last_message
            .as_ref()
            .map(|message| MessageKey::Confirmed(message.id)),
        archived: true,
        can_send_messages: false,
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
