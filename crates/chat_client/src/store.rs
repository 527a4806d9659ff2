//! Application-level chat state.
//!
//! Rooms, messages, unread counters and typing sets live here. Only the
//! ingestion pipeline and the read reconciler write through the crate-private
//! mutators; everyone else reads snapshots or follows [`SessionEvent`]s.

use std::{
    collections::{HashMap, HashSet},
    sync::{Mutex, MutexGuard},
};

use shared::domain::{ChatSummary, Message, MessageBody, MessageId, MessageKey, RoomId, UserId};
use tokio::sync::broadcast;

use crate::{connection::ConnectionState, error::SessionError};

const EVENT_BUFFER: usize = 1024;

/// State deltas published to observers.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    ConnectionChanged(ConnectionState),
    RoomsLoaded(Vec<ChatSummary>),
    RoomUpdated(ChatSummary),
    HistoryLoaded {
        room_id: RoomId,
        messages: Vec<Message>,
    },
    /// A new record, or an in-place update of an existing one.
    MessageUpserted {
        room_id: RoomId,
        message: Message,
    },
    /// An optimistic record took its authoritative id.
    MessageReplaced {
        room_id: RoomId,
        previous: MessageKey,
        message: Message,
    },
    MessageRemoved {
        room_id: RoomId,
        key: MessageKey,
    },
    UnreadChanged {
        room_id: RoomId,
        unread: u32,
    },
    TypingChanged {
        room_id: RoomId,
        users: Vec<UserId>,
    },
    SessionExpired,
    Error(SessionError),
}

pub(crate) struct RoomState {
    pub(crate) summary: ChatSummary,
    pub(crate) messages: Vec<Message>,
    /// Unread count acknowledged by the backend or grown by inbound messages.
    pub(crate) confirmed_unread: u32,
    /// Ids known to contribute to `confirmed_unread`.
    pub(crate) unread_ids: HashSet<MessageId>,
    /// In-flight mark-read requests: ticket -> ids they subtract.
    pub(crate) pending_reads: HashMap<u64, Vec<MessageId>>,
    /// Typing users and the stamp of their latest refresh.
    pub(crate) typing: HashMap<UserId, u64>,
}

impl RoomState {
    fn new(room_id: RoomId) -> Self {
        Self {
            summary: ChatSummary::empty(room_id),
            messages: Vec::new(),
            confirmed_unread: 0,
            unread_ids: HashSet::new(),
            pending_reads: HashMap::new(),
            typing: HashMap::new(),
        }
    }

    pub(crate) fn room_id(&self) -> RoomId {
        self.summary.room_id
    }

    pub(crate) fn is_pending_read(&self, id: MessageId) -> bool {
        self.pending_reads.values().any(|ids| ids.contains(&id))
    }

    pub(crate) fn visible_unread(&self) -> u32 {
        let pending: usize = self.pending_reads.values().map(Vec::len).sum();
        self.confirmed_unread
            .saturating_sub(u32::try_from(pending).unwrap_or(u32::MAX))
    }

    /// Refreshes the summary's unread count; returns the event when it changed.
    pub(crate) fn refresh_unread(&mut self) -> Option<SessionEvent> {
        let unread = self.visible_unread();
        if self.summary.unread_count == unread {
            return None;
        }
        self.summary.unread_count = unread;
        Some(SessionEvent::UnreadChanged {
            room_id: self.room_id(),
            unread,
        })
    }

    pub(crate) fn position_of(&self, key: MessageKey) -> Option<usize> {
        self.messages.iter().position(|message| message.key == key)
    }

    pub(crate) fn position_confirmed(&self, id: MessageId) -> Option<usize> {
        self.position_of(MessageKey::Confirmed(id))
    }

    /// Oldest optimistic record of `sender` with the same content.
    pub(crate) fn position_optimistic(&self, sender: UserId, body: &MessageBody) -> Option<usize> {
        self.messages.iter().position(|message| {
            message.key.is_pending() && message.sender_id == sender && message.body.same_content(body)
        })
    }

    pub(crate) fn insert_sorted(&mut self, message: Message) -> usize {
        let key = message.sort_key();
        let idx = self
            .messages
            .partition_point(|existing| existing.sort_key() <= key);
        self.messages.insert(idx, message);
        self.refresh_last_message();
        idx
    }

    pub(crate) fn resort(&mut self) {
        self.messages.sort_by_key(Message::sort_key);
        self.refresh_last_message();
    }

    pub(crate) fn remove(&mut self, key: MessageKey) -> Option<Message> {
        let idx = self.position_of(key)?;
        let removed = self.messages.remove(idx);
        self.refresh_last_message();
        Some(removed)
    }

    fn refresh_last_message(&mut self) {
        self.summary.last_message = self.messages.last().map(|message| message.key);
    }

    pub(crate) fn typing_users(&self) -> Vec<UserId> {
        let mut users: Vec<_> = self.typing.keys().copied().collect();
        users.sort();
        users
    }
}

/// Who is asking, and which room the UI shows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct ViewContext {
    pub(crate) identity: Option<UserId>,
    pub(crate) focused: Option<RoomId>,
}

#[derive(Default)]
struct StoreInner {
    context: ViewContext,
    rooms: HashMap<RoomId, RoomState>,
    next_stamp: u64,
}

pub struct ChatStore {
    inner: Mutex<StoreInner>,
    events: broadcast::Sender<SessionEvent>,
}

impl Default for ChatStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ChatStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            inner: Mutex::new(StoreInner::default()),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub(crate) fn publish(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn publish_all(&self, events: Vec<SessionEvent>) {
        for event in events {
            self.publish(event);
        }
    }

    pub fn identity(&self) -> Option<UserId> {
        self.lock().context.identity
    }

    pub fn focused_room(&self) -> Option<RoomId> {
        self.lock().context.focused
    }

    pub fn summary(&self, room_id: RoomId) -> Option<ChatSummary> {
        self.lock()
            .rooms
            .get(&room_id)
            .map(|room| room.summary.clone())
    }

    pub fn summaries(&self) -> Vec<ChatSummary> {
        let mut summaries: Vec<_> = self
            .lock()
            .rooms
            .values()
            .map(|room| room.summary.clone())
            .collect();
        summaries.sort_by_key(|summary| summary.room_id);
        summaries
    }

    pub fn unread(&self, room_id: RoomId) -> u32 {
        self.lock()
            .rooms
            .get(&room_id)
            .map(RoomState::visible_unread)
            .unwrap_or_default()
    }

    pub fn messages(&self, room_id: RoomId) -> Vec<Message> {
        self.lock()
            .rooms
            .get(&room_id)
            .map(|room| room.messages.clone())
            .unwrap_or_default()
    }

    pub fn typing(&self, room_id: RoomId) -> Vec<UserId> {
        self.lock()
            .rooms
            .get(&room_id)
            .map(RoomState::typing_users)
            .unwrap_or_default()
    }

    pub(crate) fn set_identity(&self, identity: Option<UserId>) {
        self.lock().context.identity = identity;
    }

    pub(crate) fn set_focus(&self, focused: Option<RoomId>) {
        self.lock().context.focused = focused;
    }

    pub(crate) fn context(&self) -> ViewContext {
        self.lock().context
    }

    pub(crate) fn next_stamp(&self) -> u64 {
        let mut guard = self.lock();
        guard.next_stamp += 1;
        guard.next_stamp
    }

    /// Runs `f` against the room, creating it when absent, then publishes the
    /// events it returned.
    pub(crate) fn update_room<R>(
        &self,
        room_id: RoomId,
        f: impl FnOnce(&mut RoomState, ViewContext) -> (R, Vec<SessionEvent>),
    ) -> R {
        let (result, events) = {
            let mut guard = self.lock();
            let context = guard.context;
            let room = guard
                .rooms
                .entry(room_id)
                .or_insert_with(|| RoomState::new(room_id));
            f(room, context)
        };
        self.publish_all(events);
        result
    }

    /// Like [`Self::update_room`] but leaves unknown rooms alone.
    pub(crate) fn update_existing_room<R>(
        &self,
        room_id: RoomId,
        f: impl FnOnce(&mut RoomState, ViewContext) -> (R, Vec<SessionEvent>),
    ) -> Option<R> {
        let (result, events) = {
            let mut guard = self.lock();
            let context = guard.context;
            let room = guard.rooms.get_mut(&room_id)?;
            f(room, context)
        };
        self.publish_all(events);
        Some(result)
    }

    pub(crate) fn inspect_room<R>(
        &self,
        room_id: RoomId,
        f: impl FnOnce(&RoomState, ViewContext) -> R,
    ) -> Option<R> {
        let guard = self.lock();
        let context = guard.context;
        guard.rooms.get(&room_id).map(|room| f(room, context))
    }

    /// Drops every typing indicator; nobody is known to be typing without a
    /// live connection.
    pub(crate) fn clear_typing(&self) {
        let events: Vec<SessionEvent> = {
            let mut guard = self.lock();
            guard
                .rooms
                .values_mut()
                .filter(|room| !room.typing.is_empty())
                .map(|room| {
                    room.typing.clear();
                    SessionEvent::TypingChanged {
                        room_id: room.room_id(),
                        users: Vec::new(),
                    }
                })
                .collect()
        };
        self.publish_all(events);
    }

    pub(crate) fn reset(&self) {
        let mut guard = self.lock();
        guard.rooms.clear();
        guard.context = ViewContext::default();
    }
}
