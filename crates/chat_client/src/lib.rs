//! Realtime chat session layer: one authenticated connection to a
//! Pusher-protocol broadcast server, private channel subscriptions, inbound
//! event ingestion with optimistic-send reconciliation, read state, and the
//! REST repository the chat screens talk to.

pub mod backoff;
pub mod connection;
pub mod credentials;
pub mod error;
pub mod ingestion;
pub mod reconciler;
pub mod repository;
pub mod session;
pub mod settings;
pub mod store;
pub mod subscriptions;
pub mod transport;
pub mod typing;

pub use connection::{ConnectionManager, ConnectionState};
pub use credentials::{Credential, CredentialSource};
pub use error::SessionError;
pub use repository::{ChatRepository, FileUpload, HttpChatRepository, RepositoryError};
pub use session::{ArchivedPage, ChatSession, SessionConfig};
pub use settings::{load_settings, BroadcastSettings};
pub use store::{ChatStore, SessionEvent};
pub use subscriptions::{ChannelName, ChannelRegistry, SubscriptionState};

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;
