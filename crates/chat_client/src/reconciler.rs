//! Read/unread bookkeeping.
//!
//! The visible unread count of a room is the confirmed count minus the ids of
//! mark-read requests still in flight. A failed request drops its ticket and
//! restores the read flags it flipped, so the count snaps back on its own.

use std::{
    collections::BTreeSet,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use shared::{
    domain::{ChatSummary, Message, MessageId, RoomId},
    protocol::{ReadReceiptPayload, WireChat},
};
use tracing::{debug, warn};

use crate::{
    error::SessionError,
    repository::ChatRepository,
    store::{ChatStore, RoomState, SessionEvent, ViewContext},
};

pub struct ReadReconciler {
    store: Arc<ChatStore>,
    repository: Arc<dyn ChatRepository>,
    next_ticket: AtomicU64,
}

impl ReadReconciler {
    pub fn new(store: Arc<ChatStore>, repository: Arc<dyn ChatRepository>) -> Self {
        Self {
            store,
            repository,
            next_ticket: AtomicU64::new(0),
        }
    }

    pub fn focus(&self, room_id: RoomId) {
        self.store.set_focus(Some(room_id));
    }

    /// Clears the focus if `room_id` still holds it.
    pub fn unfocus(&self, room_id: RoomId) {
        if self.store.focused_room() == Some(room_id) {
            self.store.set_focus(None);
        }
    }

    /// Marks `ids` read locally, then confirms with the backend. On failure the
    /// local change is rolled back and a sync error is returned.
    pub async fn mark_read(&self, room_id: RoomId, ids: &[MessageId]) -> Result<(), SessionError> {
        let ids: Vec<MessageId> = ids.iter().copied().collect::<BTreeSet<_>>().into_iter().collect();
        if ids.is_empty() {
            return Err(SessionError::Validation(
                "mark-read needs at least one message id".into(),
            ));
        }
        let ticket = self.next_ticket.fetch_add(1, Ordering::SeqCst) + 1;

        let flipped = self.store.update_room(room_id, |room, _| {
            let mut events = Vec::new();
            let mut flipped = Vec::new();
            for id in &ids {
                if let Some(idx) = room.position_confirmed(*id) {
                    let message = &mut room.messages[idx];
                    if !message.read {
                        message.read = true;
                        flipped.push(*id);
                        events.push(upserted(message));
                    }
                }
            }
            let counted: Vec<MessageId> = ids
                .iter()
                .copied()
                .filter(|id| room.unread_ids.contains(id) && !room.is_pending_read(*id))
                .collect();
            room.pending_reads.insert(ticket, counted);
            events.extend(room.refresh_unread());
            (flipped, events)
        });

        match self.repository.mark_as_read(room_id, &ids).await {
            Ok(()) => {
                self.store.update_room(room_id, |room, _| {
                    let counted = room.pending_reads.remove(&ticket).unwrap_or_default();
                    for id in counted {
                        if room.unread_ids.remove(&id) {
                            room.confirmed_unread = room.confirmed_unread.saturating_sub(1);
                        }
                    }
                    ((), room.refresh_unread().into_iter().collect())
                });
                debug!(room_id = room_id.0, count = ids.len(), "reconciler: read confirmed");
                Ok(())
            }
            Err(err) => {
                warn!(room_id = room_id.0, "reconciler: mark-read failed, rolling back: {err}");
                self.store.update_room(room_id, |room, _| {
                    room.pending_reads.remove(&ticket);
                    let mut events = Vec::new();
                    for id in &flipped {
                        if let Some(idx) = room.position_confirmed(*id) {
                            let message = &mut room.messages[idx];
                            message.read = false;
                            events.push(upserted(message));
                        }
                    }
                    events.extend(room.refresh_unread());
                    ((), events)
                });
                Err(SessionError::sync(room_id, err))
            }
        }
    }

    /// Applies a read receipt broadcast by the backend. A receipt from the
    /// current identity (another device) settles unread state; a receipt
    /// from someone else flags our own messages as read by them.
    pub(crate) fn apply_receipt(&self, room_id: RoomId, receipt: &ReadReceiptPayload) {
        self.store.update_existing_room(room_id, |room, context| {
            let mut events = Vec::new();
            let own_receipt = context.identity == Some(receipt.user_id);
            for id in &receipt.message_ids {
                let Some(idx) = room.position_confirmed(*id) else {
                    continue;
                };
                let message = &mut room.messages[idx];
                let relevant = if own_receipt {
                    Some(message.sender_id) != context.identity
                } else {
                    message.sender_id != receipt.user_id
                };
                if relevant && !message.read {
                    message.read = true;
                    events.push(upserted(message));
                }
            }
            if own_receipt {
                for id in &receipt.message_ids {
                    if !room.is_pending_read(*id) && room.unread_ids.remove(id) {
                        room.confirmed_unread = room.confirmed_unread.saturating_sub(1);
                    }
                }
                events.extend(room.refresh_unread());
            }
            ((), events)
        });
    }

    /// Adopts backend room summaries, including their unread counts.
    pub(crate) fn sync_rooms(&self, chats: &[WireChat]) -> Vec<ChatSummary> {
        let summaries: Vec<ChatSummary> = chats
            .iter()
            .map(|chat| {
                self.store.update_room(chat.id, |room, context| {
                    let events = sync_summary(room, chat, context).into_iter().collect();
                    (room.summary.clone(), events)
                })
            })
            .collect();
        self.store
            .publish(SessionEvent::RoomsLoaded(summaries.clone()));
        summaries
    }

    pub(crate) fn sync_room(&self, chat: &WireChat) -> ChatSummary {
        self.store.update_room(chat.id, |room, context| {
            let mut events: Vec<SessionEvent> =
                sync_summary(room, chat, context).into_iter().collect();
            let summary = room.summary.clone();
            events.push(SessionEvent::RoomUpdated(summary.clone()));
            (summary, events)
        })
    }
}

/// Applies the fields a backend room record carries; absent fields keep their
/// local value.
///
/// A backend unread count replaces the confirmed baseline. Reads still in
/// flight no longer subtract from it, since the backend may already have
/// applied them, and the ids behind the count are rebuilt from the loaded
/// messages that are still unread.
pub(crate) fn sync_summary(
    room: &mut RoomState,
    chat: &WireChat,
    context: ViewContext,
) -> Option<SessionEvent> {
    if chat.title.is_some() {
        room.summary.title = chat.title.clone();
    }
    if let Some(archived) = chat.is_archived {
        room.summary.archived = archived;
    }
    if let Some(can_send) = chat.can_send_messages {
        room.summary.can_send_messages = can_send;
    }
    if let Some(unread) = chat.unread_count {
        for counted in room.pending_reads.values_mut() {
            counted.clear();
        }
        track_history_unread(room, context);
        room.confirmed_unread = unread;
    }
    room.refresh_unread()
}

/// Counts a freshly ingested message as unread when it comes from someone
/// else and its room is not on screen.
pub(crate) fn count_inbound(
    room: &mut RoomState,
    context: ViewContext,
    message: &Message,
) -> Option<SessionEvent> {
    let id = message.key.confirmed_id()?;
    if context.identity == Some(message.sender_id) || context.focused == Some(room.room_id()) {
        return None;
    }
    if !room.unread_ids.insert(id) {
        return None;
    }
    room.confirmed_unread = room.confirmed_unread.saturating_add(1);
    room.refresh_unread()
}

/// Rebuilds the set of ids behind the unread count from loaded history. Ids
/// held by in-flight reads stay, so their confirmation still subtracts.
pub(crate) fn track_history_unread(room: &mut RoomState, context: ViewContext) {
    let in_flight: Vec<MessageId> = room.pending_reads.values().flatten().copied().collect();
    room.unread_ids = room
        .messages
        .iter()
        .filter(|message| !message.read && Some(message.sender_id) != context.identity)
        .filter_map(|message| message.key.confirmed_id())
        .collect();
    room.unread_ids.extend(in_flight);
}

/// Ids of unread messages from other participants, oldest first.
pub(crate) fn unread_from_others(room: &RoomState, context: ViewContext) -> Vec<MessageId> {
    room.messages
        .iter()
        .filter(|message| !message.read && Some(message.sender_id) != context.identity)
        .filter_map(|message| message.key.confirmed_id())
        .collect()
}

fn upserted(message: &Message) -> SessionEvent {
    SessionEvent::MessageUpserted {
        room_id: message.room_id,
        message: message.clone(),
    }
}

#[cfg(test)]
#[path = "tests/reconciler_tests.rs"]
mod tests;
