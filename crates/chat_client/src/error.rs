use shared::domain::RoomId;
use thiserror::Error;

use crate::repository::RepositoryError;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// Credential rejected by the broadcast server or the REST backend.
    #[error("session expired: {0}")]
    Authentication(String),
    #[error("transport failure: {0}")]
    Transport(String),
    /// An optimistic local change was rolled back because its confirming call failed.
    #[error("sync failed for room {room_id}: {reason}")]
    Sync { room_id: RoomId, reason: String },
    #[error("invalid input: {0}")]
    Validation(String),
}

impl SessionError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Sync { .. })
    }

    /// Maps a failed confirming call of an optimistic flow.
    pub(crate) fn sync(room_id: RoomId, err: RepositoryError) -> Self {
        match err {
            RepositoryError::Unauthorized(reason) => Self::Authentication(reason),
            other => Self::Sync {
                room_id,
                reason: other.to_string(),
            },
        }
    }
}

impl From<RepositoryError> for SessionError {
    fn from(value: RepositoryError) -> Self {
        match value {
            RepositoryError::Unauthorized(reason) => Self::Authentication(reason),
            RepositoryError::Status { status: 422, message } => Self::Validation(message),
            other => Self::Transport(other.to_string()),
        }
    }
}
