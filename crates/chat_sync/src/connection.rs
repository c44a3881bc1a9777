use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use shared::protocol::{ClientRequest, ServerEvent};
use tokio::{
    sync::{mpsc, watch, Mutex, RwLock},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

use crate::{
    error::{EmitError, TransportError},
    reconnect::ReconnectPolicy,
    subscriptions::SignalSink,
    transport::{Transport, TransportLink},
};

/// Bearer credential handed over by the auth layer. Never logged.
#[derive(Clone, PartialEq, Eq)]
pub struct Session {
    token: String,
}

impl Session {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("token", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventName {
    Connect,
    Disconnect,
    ConnectError,
    NewMessage,
    Notification,
    MessageRejected,
    ServerError,
}

impl EventName {
    pub const ALL: [EventName; 7] = [
        EventName::Connect,
        EventName::Disconnect,
        EventName::ConnectError,
        EventName::NewMessage,
        EventName::Notification,
        EventName::MessageRejected,
        EventName::ServerError,
    ];
}

#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Connected,
    Disconnected { reason: String },
    ConnectError { attempt: u32, message: String },
    Server(ServerEvent),
}

impl ConnectionEvent {
    pub fn name(&self) -> EventName {
        match self {
            ConnectionEvent::Connected => EventName::Connect,
            ConnectionEvent::Disconnected { .. } => EventName::Disconnect,
            ConnectionEvent::ConnectError { .. } => EventName::ConnectError,
            ConnectionEvent::Server(ServerEvent::NewMessage { .. }) => EventName::NewMessage,
            ConnectionEvent::Server(ServerEvent::Notification { .. }) => EventName::Notification,
            ConnectionEvent::Server(ServerEvent::MessageRejected { .. }) => {
                EventName::MessageRejected
            }
            ConnectionEvent::Server(ServerEvent::Error(_)) => EventName::ServerError,
        }
    }
}

pub type EventHandler = Arc<dyn Fn(&ConnectionEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionOptions {
    pub reconnect: ReconnectPolicy,
    pub handshake_timeout: Duration,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            reconnect: ReconnectPolicy::default(),
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

struct ConnectionInner {
    session: Option<Session>,
    // Bumped by every connect/disconnect; a supervisor whose generation is stale must not touch state.
    generation: u64,
    outbound: Option<mpsc::UnboundedSender<String>>,
    supervisor: Option<JoinHandle<()>>,
}

/// Owns the single push connection of an authenticated session.
pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    options: ConnectionOptions,
    inner: Mutex<ConnectionInner>,
    state: watch::Sender<ConnectionState>,
    handlers: RwLock<HashMap<EventName, Vec<(HandlerId, EventHandler)>>>,
    next_handler_id: AtomicU64,
    // Incremented each time a socket is promoted to `Connected`.
    link_id: AtomicU64,
}

impl ConnectionManager {
    pub fn new(transport: Arc<dyn Transport>, options: ConnectionOptions) -> Arc<Self> {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Arc::new(Self {
            transport,
            options,
            inner: Mutex::new(ConnectionInner {
                session: None,
                generation: 0,
                outbound: None,
                supervisor: None,
            }),
            state,
            handlers: RwLock::new(HashMap::new()),
            next_handler_id: AtomicU64::new(1),
            link_id: AtomicU64::new(0),
        })
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Identifies the socket behind the current `Connected` state.
    pub fn link_id(&self) -> u64 {
        self.link_id.load(Ordering::SeqCst)
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Starts (or keeps) the connection for `session`. A call for the session that is
    /// already connected or still being established is a no-op.
    pub async fn connect(self: &Arc<Self>, session: Session) {
        let mut guard = self.inner.lock().await;
        let state = self.state();
        if guard.session.as_ref() == Some(&session) && state != ConnectionState::Disconnected {
            debug!(?state, "push: connect ignored; session already active");
            return;
        }

        if let Some(previous) = guard.supervisor.take() {
            previous.abort();
        }
        guard.outbound = None;
        guard.generation += 1;
        guard.session = Some(session);
        let generation = guard.generation;
        self.state.send_replace(ConnectionState::Connecting);

        let manager = Arc::clone(self);
        guard.supervisor = Some(tokio::spawn(async move {
            manager.supervise(generation).await;
        }));
        info!(generation, "push: connecting");
    }

    /// Replaces the stored credential; the next (re)connect attempt uses it.
    pub async fn refresh_session(&self, session: Session) {
        let mut guard = self.inner.lock().await;
        if guard.session.is_some() {
            guard.session = Some(session);
        }
    }

    pub async fn disconnect(&self) {
        let previous = {
            let mut guard = self.inner.lock().await;
            guard.generation += 1;
            guard.session = None;
            // A live pump flushes queued frames and closes the link once its queue is dropped.
            let draining = guard.outbound.take().is_some();
            if let Some(supervisor) = guard.supervisor.take() {
                if !draining {
                    supervisor.abort();
                }
            }
            self.state.send_replace(ConnectionState::Disconnected)
        };

        if previous != ConnectionState::Disconnected {
            info!(?previous, "push: disconnected by client");
        }
        if previous == ConnectionState::Connected {
            self.dispatch(&ConnectionEvent::Disconnected {
                reason: "client disconnect".to_string(),
            })
            .await;
        }
    }

    /// Queues a frame on the live connection. Fails without side effects when not connected.
    pub async fn emit(&self, request: &ClientRequest) -> Result<(), EmitError> {
        if !self.is_connected() {
            return Err(EmitError::NotConnected);
        }
        let frame = serde_json::to_string(request).map_err(|source| EmitError::Encode {
            event: request.event_name(),
            source,
        })?;

        let guard = self.inner.lock().await;
        let outbound = guard.outbound.as_ref().ok_or(EmitError::NotConnected)?;
        outbound.send(frame).map_err(|_| EmitError::Closed)?;
        debug!(event = request.event_name(), "push: frame queued");
        Ok(())
    }

    pub async fn on(&self, name: EventName, handler: EventHandler) -> HandlerId {
        let id = HandlerId(self.next_handler_id.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .write()
            .await
            .entry(name)
            .or_default()
            .push((id, handler));
        id
    }

    pub async fn off(&self, name: EventName, id: HandlerId) -> bool {
        let mut handlers = self.handlers.write().await;
        let Some(registered) = handlers.get_mut(&name) else {
            return false;
        };
        let before = registered.len();
        registered.retain(|(handler_id, _)| *handler_id != id);
        before != registered.len()
    }

    async fn dispatch(&self, event: &ConnectionEvent) {
        let handlers = {
            let handlers = self.handlers.read().await;
            handlers
                .get(&event.name())
                .map(|registered| {
                    registered
                        .iter()
                        .map(|(_, handler)| Arc::clone(handler))
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default()
        };
        for handler in handlers {
            handler(event);
        }
    }

    async fn current_session(&self, generation: u64) -> Option<Session> {
        let guard = self.inner.lock().await;
        if guard.generation != generation {
            return None;
        }
        guard.session.clone()
    }

    async fn set_state_if_current(&self, generation: u64, state: ConnectionState) -> bool {
        let guard = self.inner.lock().await;
        if guard.generation != generation {
            return false;
        }
        self.state.send_replace(state);
        true
    }

    async fn promote(&self, generation: u64, outbound: mpsc::UnboundedSender<String>) -> bool {
        let mut guard = self.inner.lock().await;
        if guard.generation != generation {
            return false;
        }
        guard.outbound = Some(outbound);
        self.link_id.fetch_add(1, Ordering::SeqCst);
        self.state.send_replace(ConnectionState::Connected);
        true
    }

    async fn demote(&self, generation: u64) -> bool {
        let mut guard = self.inner.lock().await;
        if guard.generation != generation {
            return false;
        }
        guard.outbound = None;
        self.state.send_replace(ConnectionState::Reconnecting);
        true
    }

    async fn supervise(self: Arc<Self>, generation: u64) {
        let policy = &self.options.reconnect;
        let mut failures: u32 = 0;

        loop {
            let Some(session) = self.current_session(generation).await else {
                return;
            };

            let attempt = failures + 1;
            let opened =
                tokio::time::timeout(self.options.handshake_timeout, self.transport.open(&session))
                    .await
                    .unwrap_or(Err(TransportError::HandshakeTimeout(
                        self.options.handshake_timeout,
                    )));

            match opened {
                Ok(link) => {
                    failures = 0;
                    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
                    if !self.promote(generation, outbound_tx).await {
                        return;
                    }
                    info!(attempt, "push: connected");
                    self.dispatch(&ConnectionEvent::Connected).await;

                    let reason = self.pump(link, outbound_rx).await;
                    if !self.demote(generation).await {
                        return;
                    }
                    warn!(%reason, "push: connection dropped");
                    self.dispatch(&ConnectionEvent::Disconnected { reason }).await;
                }
                Err(err) => {
                    failures += 1;
                    warn!(
                        attempt,
                        max_attempts = policy.max_attempts,
                        "push: connect failed: {err}"
                    );
                    self.dispatch(&ConnectionEvent::ConnectError {
                        attempt,
                        message: err.to_string(),
                    })
                    .await;
                }
            }

            if policy.is_exhausted(failures) {
                error!(
                    attempts = failures,
                    "push: reconnect attempts exhausted; staying disconnected"
                );
                self.set_state_if_current(generation, ConnectionState::Disconnected)
                    .await;
                return;
            }

            if !self
                .set_state_if_current(generation, ConnectionState::Reconnecting)
                .await
            {
                return;
            }
            let delay = policy.delay(failures.max(1));
            debug!(?delay, "push: waiting before reconnect");
            tokio::time::sleep(delay).await;
        }
    }

    /// Shuttles frames until the link fails; returns the reason it stopped.
    async fn pump(
        &self,
        link: TransportLink,
        mut outbound: mpsc::UnboundedReceiver<String>,
    ) -> String {
        let TransportLink {
            mut sink,
            mut stream,
        } = link;

        loop {
            tokio::select! {
                frame = outbound.recv() => match frame {
                    Some(frame) => {
                        if let Err(err) = sink.send(frame).await {
                            return format!("send failed: {err}");
                        }
                    }
                    None => {
                        let _ = sink.close().await;
                        return "outbound queue closed".to_string();
                    }
                },
                inbound = stream.next() => match inbound {
                    Some(Ok(text)) => match serde_json::from_str::<ServerEvent>(&text) {
                        Ok(event) => self.dispatch(&ConnectionEvent::Server(event)).await,
                        Err(err) => warn!("push: ignoring malformed frame: {err}"),
                    },
                    Some(Err(err)) => return err.to_string(),
                    None => return "stream ended".to_string(),
                },
            }
        }
    }
}

#[async_trait]
impl SignalSink for ConnectionManager {
    fn is_connected(&self) -> bool {
        ConnectionManager::is_connected(self)
    }

    fn link_id(&self) -> u64 {
        ConnectionManager::link_id(self)
    }

    async fn emit(&self, request: &ClientRequest) -> Result<(), EmitError> {
        ConnectionManager::emit(self, request).await
    }
}

#[cfg(test)]
#[path = "tests/connection_tests.rs"]
mod tests;
