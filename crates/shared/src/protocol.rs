use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::{MessageId, RoomId, UserId};

pub const EVENT_CONNECTION_ESTABLISHED: &str = "pusher:connection_established";
pub const EVENT_ERROR: &str = "pusher:error";
pub const EVENT_PING: &str = "pusher:ping";
pub const EVENT_PONG: &str = "pusher:pong";
pub const EVENT_SUBSCRIBE: &str = "pusher:subscribe";
pub const EVENT_UNSUBSCRIBE: &str = "pusher:unsubscribe";
pub const EVENT_SUBSCRIPTION_SUCCEEDED: &str = "pusher_internal:subscription_succeeded";
pub const EVENT_SUBSCRIPTION_ERROR: &str = "pusher:subscription_error";

/// Pusher protocol revision spoken by the broadcast server.
pub const PUSHER_PROTOCOL_VERSION: u8 = 7;

/// One websocket frame of the Pusher channels protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PusherFrame {
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

impl PusherFrame {
    pub fn new(event: impl Into<String>, channel: Option<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            channel,
            data,
        }
    }

    pub fn subscribe(channel: &str, auth: &str) -> Self {
        Self::new(
            EVENT_SUBSCRIBE,
            None,
            serde_json::json!({ "channel": channel, "auth": auth }),
        )
    }

    pub fn unsubscribe(channel: &str) -> Self {
        Self::new(
            EVENT_UNSUBSCRIBE,
            None,
            serde_json::json!({ "channel": channel }),
        )
    }

    pub fn pong() -> Self {
        Self::new(EVENT_PONG, None, serde_json::json!({}))
    }

    /// Servers send `data` as a JSON-encoded string; clients send objects.
    /// Returns the decoded value either way.
    pub fn data_value(&self) -> Value {
        match &self.data {
            Value::String(raw) => {
                serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.clone()))
            }
            other => other.clone(),
        }
    }

    pub fn decode_data<T: for<'de> Deserialize<'de>>(&self) -> serde_json::Result<T> {
        serde_json::from_value(self.data_value())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionEstablished {
    pub socket_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity_timeout: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PusherErrorData {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub code: Option<u16>,
}

/// Body returned by the broadcasting auth endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelAuthResponse {
    pub auth: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_data: Option<String>,
}

/// Message record as serialized by the REST backend and by broadcast events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    pub id: MessageId,
    #[serde(default, alias = "chat_id", alias = "chat_room_id")]
    pub room_id: Option<RoomId>,
    #[serde(alias = "user_id")]
    pub sender_id: UserId,
    #[serde(default, alias = "content", alias = "body")]
    pub message: Option<String>,
    #[serde(default)]
    pub file_url: Option<String>,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_read: Option<bool>,
    #[serde(default)]
    pub read_at: Option<DateTime<Utc>>,
}

/// Broadcast payload carrying a message, either bare or wrapped.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum MessageEnvelope {
    Wrapped {
        message: WireMessage,
        #[serde(default, alias = "chat_id")]
        room_id: Option<RoomId>,
    },
    Bare(WireMessage),
}

impl MessageEnvelope {
    pub fn into_parts(self) -> (WireMessage, Option<RoomId>) {
        match self {
            Self::Wrapped { message, room_id } => {
                let room_id = room_id.or(message.room_id);
                (message, room_id)
            }
            Self::Bare(message) => {
                let room_id = message.room_id;
                (message, room_id)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingPayload {
    #[serde(default, alias = "chat_id")]
    pub room_id: Option<RoomId>,
    #[serde(alias = "sender_id")]
    pub user_id: UserId,
    #[serde(default = "default_true", alias = "typing")]
    pub is_typing: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadReceiptPayload {
    #[serde(default, alias = "chat_id")]
    pub room_id: Option<RoomId>,
    #[serde(alias = "reader_id")]
    pub user_id: UserId,
    #[serde(default)]
    pub message_ids: Vec<MessageId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomUpdatedPayload {
    #[serde(alias = "room")]
    pub chat: WireChat,
}

/// Room record. Broadcast updates may carry only some fields; absent ones
/// leave the local value alone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireChat {
    pub id: RoomId,
    #[serde(default, alias = "name")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unread_count: Option<u32>,
    #[serde(default, alias = "archived", skip_serializing_if = "Option::is_none")]
    pub is_archived: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub can_send_messages: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<WireMessage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataEnvelope<T> {
    pub data: T,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomMessages {
    pub room: WireChat,
    #[serde(default)]
    pub messages: Vec<WireMessage>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaginationMeta {
    pub current_page: u32,
    pub last_page: u32,
    pub per_page: u32,
    pub total: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaginatedMessages {
    #[serde(default)]
    pub messages: Vec<WireMessage>,
    pub meta: PaginationMeta,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkReadRequest {
    pub message_ids: Vec<MessageId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypingStatusRequest {
    pub is_typing: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportChatRequest {
    pub reason: String,
}
