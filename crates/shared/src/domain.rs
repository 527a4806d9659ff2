use std::{cmp::Ordering, fmt};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

id_newtype!(UserId);
id_newtype!(RoomId);
id_newtype!(MessageId);

/// Identity of a message record.
///
/// Locally sent messages carry a `Pending` key until the backend assigns the
/// authoritative id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum MessageKey {
    Confirmed(MessageId),
    Pending(Uuid),
}

impl MessageKey {
    pub fn new_pending() -> Self {
        Self::Pending(Uuid::new_v4())
    }

    pub fn confirmed_id(&self) -> Option<MessageId> {
        match self {
            Self::Confirmed(id) => Some(*id),
            Self::Pending(_) => None,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending(_))
    }
}

impl PartialOrd for MessageKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MessageKey {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Confirmed(a), Self::Confirmed(b)) => a.cmp(b),
            (Self::Confirmed(_), Self::Pending(_)) => Ordering::Less,
            (Self::Pending(_), Self::Confirmed(_)) => Ordering::Greater,
            (Self::Pending(a), Self::Pending(b)) => a.cmp(b),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageBody {
    Text {
        text: String,
    },
    File {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        url: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mime_type: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        caption: Option<String>,
    },
}

impl MessageBody {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// Whether two bodies describe the same logical send. File urls are only
    /// known once the upload is stored, so they do not take part.
    pub fn same_content(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Text { text: a }, Self::Text { text: b }) => a == b,
            (
                Self::File {
                    name: a_name,
                    caption: a_caption,
                    ..
                },
                Self::File {
                    name: b_name,
                    caption: b_caption,
                    ..
                },
            ) => a_name == b_name && a_caption == b_caption,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub key: MessageKey,
    pub room_id: RoomId,
    pub sender_id: UserId,
    pub body: MessageBody,
    pub sent_at: DateTime<Utc>,
    pub read: bool,
}

impl Message {
    pub fn sort_key(&self) -> (DateTime<Utc>, MessageKey) {
        (self.sent_at, self.key)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatSummary {
    pub room_id: RoomId,
    pub title: Option<String>,
    pub unread_count: u32,
    pub last_message: Option<MessageKey>,
    pub archived: bool,
    pub can_send_messages: bool,
}

impl ChatSummary {
    pub fn empty(room_id: RoomId) -> Self {
        Self {
            room_id,
            title: None,
            unread_count: 0,
            last_message: None,
            archived: false,
            can_send_messages: true,
        }
    }
}
