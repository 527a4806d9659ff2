//! Turns raw channel events into chat state updates.
//!
//! Each inbound event is decoded once, routed to exactly one room, and merged
//! into that room's ordered message list. Echoes of our own optimistic sends
//! replace the local record instead of duplicating it.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use shared::{
    domain::{Message, MessageBody, MessageKey, RoomId},
    protocol::{MessageEnvelope, ReadReceiptPayload, RoomUpdatedPayload, TypingPayload, WireChat, WireMessage},
};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::{
    reconciler::{self, ReadReconciler},
    store::{ChatStore, SessionEvent},
    subscriptions::{ChannelEvent, ChannelListener, ChannelScope},
    typing::TypingTracker,
};

/// Typed form of a channel event.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    Message {
        room_id: Option<RoomId>,
        message: WireMessage,
    },
    Typing(TypingPayload),
    ReadReceipt(ReadReceiptPayload),
    RoomUpdated(WireChat),
    Unknown(String),
}

/// Strips the leading dot Echo uses for custom names and any PHP namespace,
/// e.g. `.App\Events\MessageSent` -> `MessageSent`.
pub fn normalize_event_name(raw: &str) -> &str {
    let name = raw.trim_start_matches('.');
    name.rsplit('\\').next().unwrap_or(name)
}

pub fn decode_event(name: &str, data: &Value) -> Result<InboundEvent, serde_json::Error> {
    let normalized = normalize_event_name(name);
    let event = match normalized {
        "MessageSent" | "NewMessage" | "NewChatMessage" | "message.sent" => {
            let envelope: MessageEnvelope = serde_json::from_value(data.clone())?;
            let (message, room_id) = envelope.into_parts();
            InboundEvent::Message { room_id, message }
        }
        "UserTyping" | "TypingStatus" | "client-typing" | "typing" => {
            InboundEvent::Typing(serde_json::from_value(data.clone())?)
        }
        "MessagesRead" | "MessageRead" | "message.read" => {
            InboundEvent::ReadReceipt(serde_json::from_value(data.clone())?)
        }
        "ChatUpdated" | "ChatArchived" | "RoomUpdated" => {
            let payload: RoomUpdatedPayload = serde_json::from_value(data.clone())?;
            InboundEvent::RoomUpdated(payload.chat)
        }
        other => InboundEvent::Unknown(other.to_string()),
    };
    Ok(event)
}

/// Converts a backend message record into the domain model.
pub fn normalize_message(wire: WireMessage, room_id: RoomId) -> Message {
    let caption = wire
        .message
        .clone()
        .filter(|text| !text.trim().is_empty());
    let body = match (wire.file_name, wire.file_url) {
        (Some(name), url) => MessageBody::File {
            name,
            url,
            mime_type: wire.mime_type,
            caption,
        },
        (None, Some(url)) => MessageBody::File {
            name: file_name_from_url(&url),
            url: Some(url),
            mime_type: wire.mime_type,
            caption,
        },
        (None, None) => MessageBody::text(wire.message.unwrap_or_default()),
    };
    Message {
        key: MessageKey::Confirmed(wire.id),
        room_id,
        sender_id: wire.sender_id,
        body,
        sent_at: wire.created_at.unwrap_or_else(Utc::now),
        read: wire.is_read.unwrap_or(false) || wire.read_at.is_some(),
    }
}

fn file_name_from_url(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.rsplit('/')
        .find(|segment| !segment.is_empty())
        .unwrap_or("file")
        .to_string()
}

pub struct IngestionPipeline {
    store: Arc<ChatStore>,
    reconciler: Arc<ReadReconciler>,
    typing: TypingTracker,
    /// Messages from others that arrived in the focused room.
    seen_in_focus: Option<mpsc::UnboundedSender<Message>>,
}

impl IngestionPipeline {
    pub fn new(
        store: Arc<ChatStore>,
        reconciler: Arc<ReadReconciler>,
        typing: TypingTracker,
    ) -> Self {
        Self {
            store,
            reconciler,
            typing,
            seen_in_focus: None,
        }
    }

    pub(crate) fn with_focus_feed(mut self, feed: mpsc::UnboundedSender<Message>) -> Self {
        self.seen_in_focus = Some(feed);
        self
    }

    pub fn ingest(&self, event: &ChannelEvent) {
        let inbound = match decode_event(&event.name, &event.data) {
            Ok(inbound) => inbound,
            Err(err) => {
                warn!(channel = %event.channel, event = %event.name, "ingest: malformed payload: {err}");
                return;
            }
        };
        let scope = event.channel.scope();
        match inbound {
            InboundEvent::Message { room_id, message } => {
                let Some(room_id) = route(scope, room_id.or(message.room_id)) else {
                    warn!(channel = %event.channel, "ingest: message without a room");
                    return;
                };
                self.apply_message(normalize_message(message, room_id));
            }
            InboundEvent::Typing(payload) => {
                if let Some(room_id) = route(scope, payload.room_id) {
                    self.typing.observe(room_id, payload.user_id, payload.is_typing);
                }
            }
            InboundEvent::ReadReceipt(payload) => {
                if let Some(room_id) = route(scope, payload.room_id) {
                    self.reconciler.apply_receipt(room_id, &payload);
                }
            }
            InboundEvent::RoomUpdated(chat) => {
                self.reconciler.sync_room(&chat);
            }
            InboundEvent::Unknown(name) => {
                debug!(channel = %event.channel, event = %name, "ingest: ignoring event");
            }
        }
    }

    /// Merges one authoritative message into its room.
    pub fn apply_message(&self, message: Message) {
        let Some(id) = message.key.confirmed_id() else {
            return;
        };
        let room_id = message.room_id;
        let forward = self.store.update_room(room_id, |room, context| {
            if let Some(idx) = room.position_confirmed(id) {
                let existing = &mut room.messages[idx];
                let mut merged = message.clone();
                merged.sent_at = existing.sent_at;
                merged.read = existing.read || message.read;
                if *existing == merged {
                    return (None, Vec::new());
                }
                *existing = merged.clone();
                return (
                    None,
                    vec![SessionEvent::MessageUpserted {
                        room_id,
                        message: merged,
                    }],
                );
            }

            if context.identity == Some(message.sender_id) {
                if let Some(idx) = room.position_optimistic(message.sender_id, &message.body) {
                    let previous = room.messages[idx].key;
                    let merged = Message {
                        sent_at: room.messages[idx].sent_at,
                        ..message.clone()
                    };
                    room.messages[idx] = merged.clone();
                    room.resort();
                    return (
                        None,
                        vec![SessionEvent::MessageReplaced {
                            room_id,
                            previous,
                            message: merged,
                        }],
                    );
                }
            }

            room.insert_sorted(message.clone());
            let mut events = vec![SessionEvent::MessageUpserted {
                room_id,
                message: message.clone(),
            }];
            events.extend(reconciler::count_inbound(room, context, &message));
            let forward = (context.focused == Some(room_id)
                && context.identity != Some(message.sender_id)
                && !message.read)
                .then(|| message.clone());
            (forward, events)
        });

        if let (Some(message), Some(feed)) = (forward, self.seen_in_focus.as_ref()) {
            let _ = feed.send(message);
        }
    }

    /// Inserts a locally composed message ahead of its confirmation.
    pub fn apply_optimistic(&self, message: Message) {
        let room_id = message.room_id;
        self.store.update_room(room_id, |room, _| {
            room.insert_sorted(message.clone());
            ((), vec![SessionEvent::MessageUpserted { room_id, message }])
        });
    }

    /// Settles an optimistic record with the backend's answer and returns the
    /// record as stored.
    pub fn confirm_optimistic(&self, pending: &Message, confirmed: Message) -> Message {
        let room_id = pending.room_id;
        self.store.update_room(room_id, |room, _| {
            if let Some(idx) = confirmed.key.confirmed_id().and_then(|id| room.position_confirmed(id)) {
                // The broadcast echo got here first.
                return (room.messages[idx].clone(), Vec::new());
            }
            let slot = room
                .position_of(pending.key)
                .or_else(|| room.position_optimistic(pending.sender_id, &pending.body));
            match slot {
                Some(idx) => {
                    let previous = room.messages[idx].key;
                    let merged = Message {
                        sent_at: room.messages[idx].sent_at,
                        ..confirmed
                    };
                    room.messages[idx] = merged.clone();
                    room.resort();
                    (
                        merged.clone(),
                        vec![SessionEvent::MessageReplaced {
                            room_id,
                            previous,
                            message: merged,
                        }],
                    )
                }
                None => {
                    room.insert_sorted(confirmed.clone());
                    (
                        confirmed.clone(),
                        vec![SessionEvent::MessageUpserted {
                            room_id,
                            message: confirmed,
                        }],
                    )
                }
            }
        })
    }

    pub fn discard_optimistic(&self, pending: &Message) {
        let room_id = pending.room_id;
        self.store.update_existing_room(room_id, |room, _| {
            let events = match room.remove(pending.key) {
                Some(removed) => vec![SessionEvent::MessageRemoved {
                    room_id,
                    key: removed.key,
                }],
                None => Vec::new(),
            };
            ((), events)
        });
    }

    /// Merges a history page. History is never counted as new unread; the
    /// backend's room summary carries the count.
    pub fn load_history(&self, chat: &WireChat, messages: Vec<WireMessage>) -> Vec<Message> {
        let room_id = chat.id;
        let incoming: Vec<Message> = messages
            .into_iter()
            .map(|wire| normalize_message(wire, room_id))
            .collect();
        self.store.update_room(room_id, |room, context| {
            let synced = reconciler::sync_summary(room, chat, context);
            for message in incoming {
                let Some(id) = message.key.confirmed_id() else {
                    continue;
                };
                if let Some(idx) = room.position_confirmed(id) {
                    let existing = &mut room.messages[idx];
                    existing.read = existing.read || message.read;
                    existing.body = message.body;
                    continue;
                }
                if context.identity == Some(message.sender_id) {
                    if let Some(idx) = room.position_optimistic(message.sender_id, &message.body) {
                        let sent_at = room.messages[idx].sent_at;
                        room.messages[idx] = Message { sent_at, ..message };
                        continue;
                    }
                }
                room.messages.push(message);
            }
            room.resort();
            reconciler::track_history_unread(room, context);
            let snapshot = room.messages.clone();
            let mut events = vec![SessionEvent::HistoryLoaded {
                room_id,
                messages: snapshot.clone(),
            }];
            events.extend(room.refresh_unread().or(synced));
            (snapshot, events)
        })
    }
}

impl ChannelListener for IngestionPipeline {
    fn on_event(&self, event: &ChannelEvent) {
        self.ingest(event);
    }
}

/// Room-scoped channels decide the room; the user channel defers to the payload.
fn route(scope: ChannelScope, payload_room: Option<RoomId>) -> Option<RoomId> {
    match scope {
        ChannelScope::Room(room_id) => Some(room_id),
        ChannelScope::User(_) | ChannelScope::Other => payload_room,
    }
}

#[cfg(test)]
#[path = "tests/ingestion_tests.rs"]
mod tests;
