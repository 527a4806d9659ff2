use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use shared::domain::{RoomId, UserId};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::store::{ChatStore, SessionEvent};

/// Remote typing indicators. Each refresh restarts the user's expiry window;
/// an indicator without a refresh clears itself once the window elapses.
pub struct TypingTracker {
    store: Arc<ChatStore>,
    expiry: Duration,
    timers: Mutex<HashMap<(RoomId, UserId), JoinHandle<()>>>,
}

impl TypingTracker {
    pub fn new(store: Arc<ChatStore>, expiry: Duration) -> Self {
        Self {
            store,
            expiry,
            timers: Mutex::new(HashMap::new()),
        }
    }

    fn timers(&self) -> MutexGuard<'_, HashMap<(RoomId, UserId), JoinHandle<()>>> {
        self.timers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn cancel_timer(&self, room_id: RoomId, user_id: UserId) {
        if let Some(timer) = self.timers().remove(&(room_id, user_id)) {
            timer.abort();
        }
    }

    pub fn expiry(&self) -> Duration {
        self.expiry
    }

    pub fn observe(&self, room_id: RoomId, user_id: UserId, is_typing: bool) {
        if self.store.identity() == Some(user_id) {
            return;
        }
        if !is_typing {
            self.cancel_timer(room_id, user_id);
            self.store.update_existing_room(room_id, |room, _| {
                let events = match room.typing.remove(&user_id) {
                    Some(_) => vec![typing_changed(room_id, room.typing_users())],
                    None => Vec::new(),
                };
                ((), events)
            });
            return;
        }

        let stamp = self.store.next_stamp();
        self.store.update_room(room_id, |room, _| {
            let events = match room.typing.insert(user_id, stamp) {
                None => vec![typing_changed(room_id, room.typing_users())],
                Some(_) => Vec::new(),
            };
            ((), events)
        });
        self.schedule_expiry(room_id, user_id, stamp);
    }

    fn schedule_expiry(&self, room_id: RoomId, user_id: UserId, stamp: u64) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!(room_id = room_id.0, "typing: no runtime; indicator will not expire");
            return;
        };
        let store = Arc::clone(&self.store);
        let expiry = self.expiry;
        let timer = runtime.spawn(async move {
            tokio::time::sleep(expiry).await;
            store.update_existing_room(room_id, |room, _| {
                // A newer refresh owns the indicator now.
                if room.typing.get(&user_id) != Some(&stamp) {
                    return ((), Vec::new());
                }
                room.typing.remove(&user_id);
                ((), vec![typing_changed(room_id, room.typing_users())])
            });
        });
        let mut timers = self.timers();
        timers.retain(|_, timer| !timer.is_finished());
        if let Some(previous) = timers.insert((room_id, user_id), timer) {
            previous.abort();
        }
    }
}

impl Drop for TypingTracker {
    fn drop(&mut self) {
        for (_, timer) in self.timers().drain() {
            timer.abort();
        }
    }
}

fn typing_changed(room_id: RoomId, users: Vec<UserId>) -> SessionEvent {
    SessionEvent::TypingChanged { room_id, users }
}
