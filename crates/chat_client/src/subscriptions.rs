//! Channel subscription registry.
//!
//! Maps channel names to listener sets and mirrors them onto the transport.
//! Channel names and listeners survive a teardown so that the next connect of
//! the same identity restores them; transport-level subscriptions do not.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, MutexGuard, Weak},
};

use async_trait::async_trait;
use serde_json::Value;
use shared::{
    domain::{RoomId, UserId},
    protocol::{PusherFrame, EVENT_SUBSCRIPTION_ERROR, EVENT_SUBSCRIPTION_SUCCEEDED},
};
use tracing::{debug, info, warn};

use crate::{
    connection::{ConnectionManager, ConnectionObserver, ConnectionState},
    error::SessionError,
};

pub const ROOM_CHANNEL_PREFIX: &str = "private-chat.";
pub const USER_CHANNEL_PREFIX: &str = "private-App.Models.User.";
const MAX_CHANNEL_NAME_LEN: usize = 164;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelName(String);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelScope {
    Room(RoomId),
    User(UserId),
    Other,
}

impl ChannelName {
    pub fn room(room_id: RoomId) -> Self {
        Self(format!("{ROOM_CHANNEL_PREFIX}{room_id}"))
    }

    pub fn user(user_id: UserId) -> Self {
        Self(format!("{USER_CHANNEL_PREFIX}{user_id}"))
    }

    pub fn parse(raw: impl Into<String>) -> Result<Self, SessionError> {
        let raw = raw.into();
        if raw.is_empty() {
            return Err(SessionError::Validation(
                "channel name must not be empty".into(),
            ));
        }
        if raw.len() > MAX_CHANNEL_NAME_LEN {
            return Err(SessionError::Validation(format!(
                "channel name exceeds {MAX_CHANNEL_NAME_LEN} characters"
            )));
        }
        if let Some(bad) = raw
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || "_-=@,.;".contains(*c)))
        {
            return Err(SessionError::Validation(format!(
                "channel name '{raw}' contains invalid character '{bad}'"
            )));
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn scope(&self) -> ChannelScope {
        if let Some(id) = self
            .0
            .strip_prefix(ROOM_CHANNEL_PREFIX)
            .and_then(|raw| raw.parse().ok())
        {
            return ChannelScope::Room(RoomId(id));
        }
        if let Some(id) = self
            .0
            .strip_prefix(USER_CHANNEL_PREFIX)
            .and_then(|raw| raw.parse().ok())
        {
            return ChannelScope::User(UserId(id));
        }
        ChannelScope::Other
    }
}

impl fmt::Display for ChannelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Pending,
    Active,
    Error,
}

/// Untyped event as delivered by the transport on one channel.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelEvent {
    pub channel: ChannelName,
    pub name: String,
    pub data: Value,
}

/// Receives channel events on the dispatch task, in arrival order per channel.
pub trait ChannelListener: Send + Sync {
    fn on_event(&self, event: &ChannelEvent);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionHandle {
    pub channel: ChannelName,
    listener_id: u64,
}

struct ChannelEntry {
    state: SubscriptionState,
    listeners: Vec<(u64, Arc<dyn ChannelListener>)>,
    /// Connection generation the transport subscription was issued on.
    subscribed_generation: Option<u64>,
}

impl ChannelEntry {
    fn new() -> Self {
        Self {
            state: SubscriptionState::Pending,
            listeners: Vec::new(),
            subscribed_generation: None,
        }
    }
}

#[derive(Default)]
struct RegistryInner {
    identity: Option<UserId>,
    channels: HashMap<ChannelName, ChannelEntry>,
    next_listener_id: u64,
}

pub struct ChannelRegistry {
    connection: Weak<ConnectionManager>,
    inner: Mutex<RegistryInner>,
}

impl ChannelRegistry {
    /// Creates a registry bound to `connection` and registers it for
    /// connection state transitions.
    pub fn new(connection: &Arc<ConnectionManager>) -> Arc<Self> {
        let registry = Arc::new(Self {
            connection: Arc::downgrade(connection),
            inner: Mutex::new(RegistryInner::default()),
        });
        let weak: Weak<Self> = Arc::downgrade(&registry);
        let observer: Weak<dyn ConnectionObserver> = weak;
        connection.add_observer(observer);
        registry
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub async fn subscribe(
        &self,
        channel: ChannelName,
        listener: Arc<dyn ChannelListener>,
    ) -> SubscriptionHandle {
        let (handle, needs_transport) = {
            let mut guard = self.lock();
            guard.next_listener_id += 1;
            let listener_id = guard.next_listener_id;
            let entry = guard
                .channels
                .entry(channel.clone())
                .or_insert_with(ChannelEntry::new);
            entry.listeners.push((listener_id, listener));
            let needs_transport =
                entry.subscribed_generation.is_none() || entry.state == SubscriptionState::Error;
            (
                SubscriptionHandle {
                    channel: channel.clone(),
                    listener_id,
                },
                needs_transport,
            )
        };

        if needs_transport {
            self.subscribe_transport(&channel).await;
        }
        handle
    }

    /// Removes every listener of `channel` and releases its transport subscription.
    pub fn unsubscribe(&self, channel: &ChannelName) {
        let removed = self.lock().channels.remove(channel);
        if let Some(entry) = removed {
            self.release_transport(channel, entry.subscribed_generation);
        }
    }

    /// Removes one listener; the transport subscription goes with the last one.
    pub fn detach(&self, handle: &SubscriptionHandle) {
        let released = {
            let mut guard = self.lock();
            let Some(entry) = guard.channels.get_mut(&handle.channel) else {
                return;
            };
            entry.listeners.retain(|(id, _)| *id != handle.listener_id);
            if entry.listeners.is_empty() {
                guard.channels.remove(&handle.channel)
            } else {
                None
            }
        };
        if let Some(entry) = released {
            self.release_transport(&handle.channel, entry.subscribed_generation);
        }
    }

    /// Forgets every channel, e.g. on logout.
    pub fn clear(&self) {
        let drained: Vec<_> = {
            let mut guard = self.lock();
            guard.identity = None;
            guard.channels.drain().collect()
        };
        for (channel, entry) in drained {
            self.release_transport(&channel, entry.subscribed_generation);
        }
    }

    pub fn state(&self, channel: &ChannelName) -> Option<SubscriptionState> {
        self.lock().channels.get(channel).map(|entry| entry.state)
    }

    pub fn listener_count(&self, channel: &ChannelName) -> usize {
        self.lock()
            .channels
            .get(channel)
            .map(|entry| entry.listeners.len())
            .unwrap_or_default()
    }

    pub fn channels(&self) -> Vec<ChannelName> {
        let mut names: Vec<_> = self.lock().channels.keys().cloned().collect();
        names.sort();
        names
    }

    /// Routes one inbound frame. Frames from a torn-down connection, for
    /// unknown channels, or without listeners are dropped.
    pub fn dispatch(&self, generation: u64, frame: PusherFrame) -> bool {
        let Some(connection) = self.connection.upgrade() else {
            return false;
        };
        if connection.current_generation() != generation {
            debug!(
                generation,
                event = %frame.event,
                "realtime: dropping frame from stale connection"
            );
            return false;
        }
        let Some(raw_channel) = frame.channel.clone() else {
            debug!(event = %frame.event, "realtime: connection-level frame");
            return false;
        };
        let Ok(channel) = ChannelName::parse(raw_channel) else {
            return false;
        };

        match frame.event.as_str() {
            EVENT_SUBSCRIPTION_SUCCEEDED => {
                if let Some(entry) = self.lock().channels.get_mut(&channel) {
                    entry.state = SubscriptionState::Active;
                    info!(channel = %channel, "realtime: subscription active");
                }
                false
            }
            EVENT_SUBSCRIPTION_ERROR => {
                if let Some(entry) = self.lock().channels.get_mut(&channel) {
                    entry.state = SubscriptionState::Error;
                }
                warn!(channel = %channel, data = %frame.data, "realtime: subscription rejected");
                false
            }
            _ => {
                let listeners: Vec<Arc<dyn ChannelListener>> = match self.lock().channels.get(&channel) {
                    Some(entry) => entry
                        .listeners
                        .iter()
                        .map(|(_, listener)| Arc::clone(listener))
                        .collect(),
                    None => Vec::new(),
                };
                if listeners.is_empty() {
                    debug!(channel = %channel, event = %frame.event, "realtime: no listener for event");
                    return false;
                }
                let event = ChannelEvent {
                    channel,
                    data: frame.data_value(),
                    name: frame.event,
                };
                for listener in listeners {
                    listener.on_event(&event);
                }
                true
            }
        }
    }

    async fn subscribe_transport(&self, channel: &ChannelName) {
        let Some(connection) = self.connection.upgrade() else {
            return;
        };
        if connection.state() != ConnectionState::Connected {
            return;
        }
        let generation = connection.current_generation();
        {
            let mut guard = self.lock();
            let Some(entry) = guard.channels.get_mut(channel) else {
                return;
            };
            if entry.subscribed_generation == Some(generation)
                && entry.state != SubscriptionState::Error
            {
                return;
            }
            entry.subscribed_generation = Some(generation);
            entry.state = SubscriptionState::Pending;
        }

        let result = match connection.authorize(channel).await {
            Ok(auth) => {
                // The channel may have been released while authorizing.
                let still_wanted = self
                    .lock()
                    .channels
                    .get(channel)
                    .is_some_and(|entry| entry.subscribed_generation == Some(generation));
                if !still_wanted || connection.current_generation() != generation {
                    return;
                }
                connection.send(PusherFrame::subscribe(channel.as_str(), &auth))
            }
            Err(err) => Err(err),
        };

        if let Err(err) = result {
            warn!(channel = %channel, "realtime: subscribe failed: {err}");
            if let Some(entry) = self.lock().channels.get_mut(channel) {
                if entry.subscribed_generation == Some(generation) {
                    entry.state = SubscriptionState::Error;
                }
            }
        }
    }

    fn release_transport(&self, channel: &ChannelName, subscribed_generation: Option<u64>) {
        let Some(connection) = self.connection.upgrade() else {
            return;
        };
        if subscribed_generation.is_none()
            || subscribed_generation != Some(connection.current_generation())
        {
            return;
        }
        if let Err(err) = connection.send(PusherFrame::unsubscribe(channel.as_str())) {
            debug!(channel = %channel, "realtime: unsubscribe not sent: {err}");
        }
    }
}

#[async_trait]
impl ConnectionObserver for ChannelRegistry {
    async fn on_connected(&self, identity: UserId, _generation: u64) {
        let channels: Vec<ChannelName> = {
            let mut guard = self.lock();
            if guard.identity.is_some_and(|previous| previous != identity) {
                info!(
                    previous = ?guard.identity,
                    current = identity.0,
                    "realtime: identity changed; dropping remembered channels"
                );
                guard.channels.clear();
            }
            guard.identity = Some(identity);
            guard.channels.keys().cloned().collect()
        };
        for channel in channels {
            self.subscribe_transport(&channel).await;
        }
    }

    fn on_disconnected(&self) {
        let mut guard = self.lock();
        for entry in guard.channels.values_mut() {
            entry.state = SubscriptionState::Pending;
            entry.subscribed_generation = None;
        }
    }
}

#[cfg(test)]
#[path = "tests/subscriptions_tests.rs"]
mod tests;
