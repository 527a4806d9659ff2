//! Lifecycle of the single realtime connection of one authenticated identity.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex, MutexGuard, Weak,
};

use async_trait::async_trait;
use shared::{domain::UserId, protocol::PusherFrame};
use tokio::{
    sync::{broadcast, mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    credentials::Credential,
    error::SessionError,
    subscriptions::ChannelName,
    transport::{ChannelAuthorizer, Transport, TransportLink},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

/// What the connection hands to its consumer, in transport order.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionSignal {
    Frame { generation: u64, frame: PusherFrame },
    /// The socket of `generation` went away without a requested teardown.
    Lost { generation: u64, reason: String },
}

/// Components that follow connection transitions. Held weakly by the manager.
#[async_trait]
pub trait ConnectionObserver: Send + Sync {
    async fn on_connected(&self, identity: UserId, generation: u64);
    fn on_disconnected(&self);
}

struct ActiveLink {
    generation: u64,
    socket_id: String,
    outbound: mpsc::UnboundedSender<PusherFrame>,
    transport_task: JoinHandle<()>,
    reader_task: Option<JoinHandle<()>>,
}

impl ActiveLink {
    fn shutdown(mut self) {
        self.transport_task.abort();
        if let Some(reader) = self.reader_task.take() {
            reader.abort();
        }
    }
}

#[derive(Default)]
struct ConnectionInner {
    credential: Option<Credential>,
    link: Option<ActiveLink>,
}

pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    authorizer: Arc<dyn ChannelAuthorizer>,
    lifecycle: tokio::sync::Mutex<()>,
    inner: Mutex<ConnectionInner>,
    generation: AtomicU64,
    state: watch::Sender<ConnectionState>,
    transitions: broadcast::Sender<ConnectionState>,
    signals: mpsc::UnboundedSender<ConnectionSignal>,
    observers: Mutex<Vec<Weak<dyn ConnectionObserver>>>,
}

impl ConnectionManager {
    pub fn new(
        transport: Arc<dyn Transport>,
        authorizer: Arc<dyn ChannelAuthorizer>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ConnectionSignal>) {
        let (signals, signals_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (transitions, _) = broadcast::channel(64);
        let manager = Arc::new(Self {
            transport,
            authorizer,
            lifecycle: tokio::sync::Mutex::new(()),
            inner: Mutex::new(ConnectionInner::default()),
            generation: AtomicU64::new(0),
            state,
            transitions,
            signals,
            observers: Mutex::new(Vec::new()),
        });
        (manager, signals_rx)
    }

    fn lock(&self) -> MutexGuard<'_, ConnectionInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Every transition in order, including the brief `Failed` step that a
    /// `watch` receiver may coalesce away.
    pub fn transitions(&self) -> broadcast::Receiver<ConnectionState> {
        self.transitions.subscribe()
    }

    /// Generation of the live connection. Bumped on every connect and teardown.
    pub fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn credential(&self) -> Option<Credential> {
        self.lock().credential.clone()
    }

    pub fn socket_id(&self) -> Option<String> {
        self.lock().link.as_ref().map(|link| link.socket_id.clone())
    }

    pub fn add_observer(&self, observer: Weak<dyn ConnectionObserver>) {
        self.observers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(observer);
    }

    fn live_observers(&self) -> Vec<Arc<dyn ConnectionObserver>> {
        let mut observers = self
            .observers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        observers.retain(|observer| observer.strong_count() > 0);
        observers.iter().filter_map(Weak::upgrade).collect()
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(?previous, ?next, "realtime: connection state changed");
            let _ = self.transitions.send(next);
        }
    }

    /// Connects as `credential`. A no-op when already connected with the same
    /// credential; a different credential tears the current connection down first.
    pub async fn connect(self: &Arc<Self>, credential: Credential) -> Result<(), SessionError> {
        let _lifecycle = self.lifecycle.lock().await;

        {
            let inner = self.lock();
            if self.state() == ConnectionState::Connected
                && inner.link.is_some()
                && inner.credential.as_ref() == Some(&credential)
            {
                return Ok(());
            }
        }
        self.teardown("credential changed");

        self.set_state(ConnectionState::Connecting);
        info!(user_id = credential.user_id.0, "realtime: connecting");

        let link = match self.transport.open().await {
            Ok(link) => link,
            Err(err) => {
                self.fail(&err);
                return Err(err);
            }
        };

        // Authenticate by authorizing the identity's own private channel.
        let probe = ChannelName::user(credential.user_id);
        if let Err(err) = self
            .authorizer
            .authorize(&link.socket_id, &probe, &credential)
            .await
        {
            link.task.abort();
            self.fail(&err);
            return Err(err);
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let TransportLink {
            socket_id,
            outbound,
            inbound,
            task,
        } = link;
        {
            let mut inner = self.lock();
            inner.credential = Some(credential.clone());
            inner.link = Some(ActiveLink {
                generation,
                socket_id: socket_id.clone(),
                outbound,
                transport_task: task,
                reader_task: None,
            });
        }
        let reader = self.spawn_reader(generation, inbound);
        if let Some(link) = self.lock().link.as_mut() {
            link.reader_task = Some(reader);
        }

        self.set_state(ConnectionState::Connected);
        info!(
            user_id = credential.user_id.0,
            generation,
            socket_id = %socket_id,
            "realtime: connected"
        );

        for observer in self.live_observers() {
            observer.on_connected(credential.user_id, generation).await;
        }
        Ok(())
    }

    /// Tears the connection down and forgets the credential. Safe to call when
    /// already disconnected.
    pub async fn disconnect(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        self.teardown("disconnect requested");
        self.lock().credential = None;
    }

    pub async fn authorize(&self, channel: &ChannelName) -> Result<String, SessionError> {
        let (socket_id, credential) = {
            let inner = self.lock();
            let socket_id = inner
                .link
                .as_ref()
                .map(|link| link.socket_id.clone())
                .ok_or_else(|| SessionError::Transport("not connected".into()))?;
            let credential = inner
                .credential
                .clone()
                .ok_or_else(|| SessionError::Authentication("no credential".into()))?;
            (socket_id, credential)
        };
        self.authorizer
            .authorize(&socket_id, channel, &credential)
            .await
    }

    pub fn send(&self, frame: PusherFrame) -> Result<(), SessionError> {
        let inner = self.lock();
        let link = inner
            .link
            .as_ref()
            .ok_or_else(|| SessionError::Transport("not connected".into()))?;
        link.outbound
            .send(frame)
            .map_err(|_| SessionError::Transport("socket writer closed".into()))
    }

    fn fail(&self, err: &SessionError) {
        warn!("realtime: connect failed: {err}");
        self.set_state(ConnectionState::Failed);
        self.set_state(ConnectionState::Disconnected);
    }

    /// Drops the live link, invalidating every in-flight frame of its generation.
    fn teardown(&self, reason: &str) {
        let link = self.lock().link.take();
        let Some(link) = link else {
            if self.state() != ConnectionState::Disconnected {
                self.set_state(ConnectionState::Disconnected);
            }
            return;
        };
        self.generation.fetch_add(1, Ordering::SeqCst);
        info!(generation = link.generation, reason, "realtime: tearing down connection");
        link.shutdown();
        self.set_state(ConnectionState::Disconnected);
        for observer in self.live_observers() {
            observer.on_disconnected();
        }
    }

    fn spawn_reader(
        self: &Arc<Self>,
        generation: u64,
        mut inbound: mpsc::UnboundedReceiver<PusherFrame>,
    ) -> JoinHandle<()> {
        let manager = Arc::downgrade(self);
        let signals = self.signals.clone();
        tokio::spawn(async move {
            while let Some(frame) = inbound.recv().await {
                let _ = signals.send(ConnectionSignal::Frame { generation, frame });
            }
            if let Some(manager) = manager.upgrade() {
                manager.link_lost(generation).await;
            }
        })
    }

    async fn link_lost(&self, generation: u64) {
        let _lifecycle = self.lifecycle.lock().await;
        if self.current_generation() != generation {
            return;
        }
        let owns_link = self
            .lock()
            .link
            .as_ref()
            .is_some_and(|link| link.generation == generation);
        if !owns_link {
            return;
        }
        // The reader task is the caller; only the socket task needs stopping.
        if let Some(mut link) = self.lock().link.take() {
            link.reader_task = None;
            link.shutdown();
        }
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.set_state(ConnectionState::Disconnected);
        warn!(generation, "realtime: connection lost");
        for observer in self.live_observers() {
            observer.on_disconnected();
        }
        let _ = self.signals.send(ConnectionSignal::Lost {
            generation,
            reason: "socket closed".into(),
        });
    }
}

#[cfg(test)]
#[path = "tests/connection_tests.rs"]
mod tests;
