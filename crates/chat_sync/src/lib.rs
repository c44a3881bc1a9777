use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::Result;
use chrono::Utc;
use shared::{
    domain::{
        Channel, ChannelKind, ChannelRef, ClientRef, GroupId, Message, MessageId, Notification,
        NotificationId, Sender,
    },
    error::ApiError,
    protocol::{ClientRequest, MessagePayload, ServerEvent},
};
use tokio::{
    sync::{broadcast, mpsc, oneshot, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

pub mod api;
pub mod config;
pub mod connection;
pub mod error;
pub mod messages;
pub mod notifications;
pub mod read_state;
pub mod reconnect;
pub mod subscriptions;
pub mod transport;

#[cfg(test)]
mod test_support;

pub use api::{HttpSyncBackend, SyncBackend};
pub use config::{load_settings, Settings};
pub use connection::{
    ConnectionEvent, ConnectionManager, ConnectionOptions, ConnectionState, EventName, HandlerId,
    Session,
};
pub use error::{EmitError, SendError, SyncError, TransportError};
pub use messages::{MessageSynchronizer, ReceiveOutcome};
pub use notifications::{
    age_bucket, group_by_age, AgeBucket, MarkAllSummary, NotificationAggregator,
    NotificationBuckets,
};
pub use read_state::ReadStateTracker;
pub use reconnect::ReconnectPolicy;
pub use subscriptions::{SignalSink, SubscriptionTracker};
pub use transport::{Transport, TransportLink, WebSocketTransport};

/// What the UI renders from.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    ConnectionChanged(ConnectionState),
    HistoryUpdated {
        channel: ChannelRef,
        messages: Vec<Message>,
    },
    SendFailed {
        channel: ChannelRef,
        temp_id: MessageId,
        reason: String,
    },
    NotificationReceived(Notification),
    NotificationsUpdated {
        unread_count: usize,
    },
    Error(String),
}

type AckSender = oneshot::Sender<std::result::Result<Message, ApiError>>;

struct SyncState {
    identity: Option<Sender>,
    active_channel: Option<Channel>,
    subscriptions: SubscriptionTracker,
    messages: MessageSynchronizer,
    acks: HashMap<ClientRef, AckSender>,
    handlers: Vec<(EventName, HandlerId)>,
    pump: Option<JoinHandle<()>>,
}

/// Wires the connection, subscription tracker, message synchronizer, read-state tracker and
/// notification aggregator to one sequential event pump.
pub struct SyncClient {
    connection: Arc<ConnectionManager>,
    backend: Arc<dyn SyncBackend>,
    read_state: Arc<ReadStateTracker>,
    notifications: NotificationAggregator,
    ack_timeout: Duration,
    inner: Mutex<SyncState>,
    events: broadcast::Sender<ClientEvent>,
}

impl SyncClient {
    pub fn new(
        connection: Arc<ConnectionManager>,
        backend: Arc<dyn SyncBackend>,
        ack_timeout: Duration,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        Arc::new(Self {
            connection,
            read_state: Arc::new(ReadStateTracker::new(Arc::clone(&backend))),
            notifications: NotificationAggregator::new(Arc::clone(&backend)),
            backend,
            ack_timeout,
            inner: Mutex::new(SyncState {
                identity: None,
                active_channel: None,
                subscriptions: SubscriptionTracker::new(),
                messages: MessageSynchronizer::new(),
                acks: HashMap::new(),
                handlers: Vec::new(),
                pump: None,
            }),
            events,
        })
    }

    /// Builds the websocket + HTTP stack described by `settings`.
    pub fn from_settings(settings: &Settings, session: &Session) -> Result<Arc<Self>> {
        let transport = WebSocketTransport::new(&settings.socket_url()?)?;
        let connection = ConnectionManager::new(Arc::new(transport), settings.connection_options());
        let backend = HttpSyncBackend::new(settings.server_url.clone(), session.clone());
        Ok(Self::new(connection, Arc::new(backend), settings.ack_timeout()))
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub async fn set_identity(&self, sender: Sender) {
        self.inner.lock().await.identity = Some(sender);
    }

    /// Registers the event pump (once) and opens the push connection for `session`.
    pub async fn start(self: &Arc<Self>, session: Session) {
        {
            let mut guard = self.inner.lock().await;
            if guard.pump.is_none() {
                let (tx, mut rx) = mpsc::unbounded_channel::<ConnectionEvent>();
                for name in EventName::ALL {
                    let tx = tx.clone();
                    let id = self
                        .connection
                        .on(
                            name,
                            Arc::new(move |event: &ConnectionEvent| {
                                let _ = tx.send(event.clone());
                            }),
                        )
                        .await;
                    guard.handlers.push((name, id));
                }

                let client = Arc::downgrade(self);
                guard.pump = Some(tokio::spawn(async move {
                    while let Some(event) = rx.recv().await {
                        let Some(client) = client.upgrade() else {
                            break;
                        };
                        client.handle_connection_event(event).await;
                    }
                }));
            }
        }
        self.connection.connect(session).await;
    }

    /// Hands a refreshed credential to both the push connection and the REST backend.
    pub async fn refresh_session(&self, session: Session) {
        self.connection.refresh_session(session.clone()).await;
        self.backend.set_session(session).await;
        debug!("sync: session credential refreshed");
    }

    /// Logout: leaves the current group, closes the connection and drops all local state.
    pub async fn shutdown(&self) {
        let (handlers, pump) = {
            let mut guard = self.inner.lock().await;
            guard.subscriptions.clear(self.connection.as_ref()).await;
            guard.messages.clear();
            guard.active_channel = None;
            guard.acks.clear();
            (std::mem::take(&mut guard.handlers), guard.pump.take())
        };
        for (name, id) in handlers {
            self.connection.off(name, id).await;
        }
        self.connection.disconnect().await;
        if let Some(pump) = pump {
            pump.abort();
        }
        self.notifications.clear().await;
        self.read_state.clear().await;
        let _ = self
            .events
            .send(ClientEvent::ConnectionChanged(ConnectionState::Disconnected));
        info!("sync: session shut down");
    }

    pub async fn list_channels(&self) -> std::result::Result<Vec<Channel>, SyncError> {
        self.backend
            .list_channels()
            .await
            .map_err(SyncError::Directory)
    }

    /// Makes `channel` the displayed one: moves group membership, loads history, marks read.
    pub async fn select_channel(&self, channel: Channel) -> std::result::Result<Vec<Message>, SyncError> {
        let reference = channel
            .reference()
            .ok_or_else(|| SyncError::MalformedChannel(channel.id.clone()))?;
        {
            let mut guard = self.inner.lock().await;
            let changed = guard
                .subscriptions
                .select(&channel, self.connection.as_ref())
                .await?;
            if !changed {
                debug!(channel = %reference, "sync: channel already selected");
                return Ok(guard.messages.history(&reference).to_vec());
            }
            guard.active_channel = Some(channel.clone());
            guard.messages.activate(reference);
        }
        self.load_history(&channel).await
    }

    /// Retries the history fetch for the displayed channel.
    pub async fn reload_history(&self) -> std::result::Result<Vec<Message>, SyncError> {
        let channel = self
            .inner
            .lock()
            .await
            .active_channel
            .clone()
            .ok_or(SyncError::NoActiveChannel)?;
        self.load_history(&channel).await
    }

    pub async fn leave_channel(&self) {
        let mut guard = self.inner.lock().await;
        guard.subscriptions.clear(self.connection.as_ref()).await;
        guard.messages.deactivate();
        guard.active_channel = None;
    }

    pub async fn active_channel(&self) -> Option<Channel> {
        self.inner.lock().await.active_channel.clone()
    }

    pub async fn history(&self, channel: &ChannelRef) -> Vec<Message> {
        self.inner.lock().await.messages.history(channel).to_vec()
    }

    /// Optimistically shows `content` in the displayed channel and waits for the server copy.
    pub async fn send_message(&self, content: &str) -> std::result::Result<Message, SendError> {
        if content.trim().is_empty() {
            return Err(SendError::EmptyContent);
        }

        let (channel, reference, client_ref, ack) = {
            let mut guard = self.inner.lock().await;
            let channel = guard
                .active_channel
                .clone()
                .ok_or(SendError::NoActiveChannel)?;
            let reference = guard
                .messages
                .active()
                .cloned()
                .ok_or(SendError::NoActiveChannel)?;
            let sender = guard.identity.clone().ok_or(SendError::MissingIdentity)?;
            let (client_ref, _temp) = guard
                .messages
                .begin_send(&reference, content, sender, Utc::now());
            let (tx, rx) = oneshot::channel();
            guard.acks.insert(client_ref.clone(), tx);
            self.broadcast_history(&guard.messages, &reference);
            (channel, reference, client_ref, rx)
        };

        let request = ClientRequest::send_message(&channel, content, client_ref.clone());
        if let Err(err) = self.connection.emit(&request).await {
            self.fail_send(&client_ref, &reference, err.to_string()).await;
            return Err(SendError::Emit(err));
        }

        match tokio::time::timeout(self.ack_timeout, ack).await {
            Ok(Ok(Ok(message))) => Ok(message),
            Ok(Ok(Err(rejection))) => {
                self.fail_send(&client_ref, &reference, rejection.message.clone())
                    .await;
                Err(SendError::Rejected(rejection))
            }
            Ok(Err(_)) => {
                self.fail_send(&client_ref, &reference, "session closed".to_string())
                    .await;
                Err(SendError::Emit(EmitError::Closed))
            }
            Err(_) => {
                self.fail_send(&client_ref, &reference, "no acknowledgment".to_string())
                    .await;
                Err(SendError::AckTimeout(self.ack_timeout))
            }
        }
    }

    pub async fn load_notifications(&self) -> std::result::Result<usize, SyncError> {
        let payloads = match self.backend.list_notifications().await {
            Ok(payloads) => payloads,
            Err(err) => {
                warn!("sync: notification fetch failed: {err}");
                let _ = self
                    .events
                    .send(ClientEvent::Error(format!("failed to load notifications: {err}")));
                return Err(SyncError::Notifications(err));
            }
        };
        let added = self
            .notifications
            .merge(
                payloads
                    .into_iter()
                    .map(|payload| payload.into_notification())
                    .collect(),
            )
            .await;
        self.broadcast_unread().await;
        Ok(added)
    }

    pub async fn notifications(&self) -> Vec<Notification> {
        self.notifications.snapshot().await
    }

    pub async fn unread_notifications(&self) -> usize {
        self.notifications.unread_count().await
    }

    pub async fn mark_notification_read(&self, id: &NotificationId) -> bool {
        let found = self.notifications.mark_one(id).await;
        if found {
            self.broadcast_unread().await;
        }
        found
    }

    pub async fn mark_all_notifications_read(&self) -> MarkAllSummary {
        let summary = self.notifications.mark_all().await;
        self.broadcast_unread().await;
        summary
    }

    async fn load_history(&self, channel: &Channel) -> std::result::Result<Vec<Message>, SyncError> {
        let reference = channel
            .reference()
            .ok_or_else(|| SyncError::MalformedChannel(channel.id.clone()))?;
        let payloads = match self.backend.fetch_history(channel).await {
            Ok(payloads) => payloads,
            Err(error) => {
                warn!(channel = %reference, "sync: history fetch failed: {error}");
                let _ = self.events.send(ClientEvent::Error(format!(
                    "failed to load messages for {}: {error}",
                    channel.name
                )));
                // Still displayed, so still read.
                let latest = {
                    let guard = self.inner.lock().await;
                    (guard.messages.active() == Some(&reference))
                        .then(|| guard.messages.latest_confirmed(&reference).cloned())
                };
                if let Some(latest) = latest {
                    self.spawn_mark_read(channel.clone(), latest);
                }
                return Err(SyncError::History {
                    channel: channel.id.clone(),
                    error,
                });
            }
        };

        let (history, latest, still_active) = {
            let mut guard = self.inner.lock().await;
            let confirmed = payloads
                .into_iter()
                .map(|payload| payload.into_message(reference.clone()))
                .collect();
            guard.messages.replace_history(reference.clone(), confirmed);
            self.broadcast_history(&guard.messages, &reference);
            (
                guard.messages.history(&reference).to_vec(),
                guard.messages.latest_confirmed(&reference).cloned(),
                guard.messages.active() == Some(&reference),
            )
        };

        if still_active {
            self.spawn_mark_read(channel.clone(), latest);
        }
        Ok(history)
    }

    async fn fail_send(&self, client_ref: &ClientRef, channel: &ChannelRef, reason: String) {
        let mut guard = self.inner.lock().await;
        guard.acks.remove(client_ref);
        let Some(temp) = guard.messages.rollback(client_ref) else {
            return;
        };
        warn!(channel = %channel, temp_id = %temp.id, "sync: send rolled back: {reason}");
        self.broadcast_history(&guard.messages, channel);
        let _ = self.events.send(ClientEvent::SendFailed {
            channel: channel.clone(),
            temp_id: temp.id,
            reason,
        });
    }

    async fn handle_connection_event(&self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Connected => {
                {
                    let mut guard = self.inner.lock().await;
                    guard
                        .subscriptions
                        .on_connected(self.connection.as_ref())
                        .await;
                }
                let _ = self
                    .events
                    .send(ClientEvent::ConnectionChanged(ConnectionState::Connected));
            }
            ConnectionEvent::Disconnected { reason } => {
                debug!(%reason, "sync: connection lost");
                self.inner
                    .lock()
                    .await
                    .subscriptions
                    .on_disconnected(self.connection.as_ref());
                let _ = self
                    .events
                    .send(ClientEvent::ConnectionChanged(self.connection.state()));
            }
            ConnectionEvent::ConnectError { attempt, message } => {
                debug!(attempt, %message, "sync: connect attempt failed");
                let _ = self
                    .events
                    .send(ClientEvent::ConnectionChanged(self.connection.state()));
            }
            ConnectionEvent::Server(ServerEvent::NewMessage {
                message,
                chat_type,
                group_id,
                client_ref,
            }) => {
                self.handle_new_message(message, chat_type, group_id, client_ref)
                    .await;
            }
            ConnectionEvent::Server(ServerEvent::Notification { notification }) => {
                let notification = notification.into_notification();
                if self.notifications.receive(notification.clone()).await {
                    let _ = self
                        .events
                        .send(ClientEvent::NotificationReceived(notification));
                    self.broadcast_unread().await;
                }
            }
            ConnectionEvent::Server(ServerEvent::MessageRejected { client_ref, error }) => {
                let mut guard = self.inner.lock().await;
                match guard.acks.remove(&client_ref) {
                    Some(ack) => {
                        let _ = ack.send(Err(error));
                    }
                    None => {
                        // Nobody is waiting any more; still drop the optimistic copy.
                        if let Some(temp) = guard.messages.rollback(&client_ref) {
                            self.broadcast_history(&guard.messages, &temp.channel);
                        }
                    }
                }
            }
            ConnectionEvent::Server(ServerEvent::Error(err)) => {
                warn!(
                    code = ?err.code,
                    transient = err.is_transient(),
                    "sync: server error: {}",
                    err.message
                );
                let _ = self.events.send(ClientEvent::Error(err.message));
            }
        }
    }

    async fn handle_new_message(
        &self,
        payload: MessagePayload,
        chat_type: ChannelKind,
        group_id: Option<GroupId>,
        client_ref: Option<ClientRef>,
    ) {
        let Some(reference) = ChannelRef::from_parts(chat_type, group_id) else {
            warn!(message_id = %payload.id, "sync: group message without group id");
            return;
        };
        let message = payload.into_message(reference.clone());

        let mark_read = {
            let mut guard = self.inner.lock().await;
            let touched_active = match guard.messages.receive(message, client_ref) {
                ReceiveOutcome::Reconciled {
                    client_ref,
                    message,
                    active,
                } => {
                    if let Some(ack) = guard.acks.remove(&client_ref) {
                        let _ = ack.send(Ok(message.clone()));
                    }
                    self.broadcast_history(&guard.messages, &message.channel);
                    active
                }
                ReceiveOutcome::Appended(message) => {
                    self.broadcast_history(&guard.messages, &message.channel);
                    true
                }
                ReceiveOutcome::Duplicate | ReceiveOutcome::Ignored => false,
            };

            if touched_active {
                guard.active_channel.clone().map(|channel| {
                    let latest = guard.messages.latest_confirmed(&reference).cloned();
                    (channel, latest)
                })
            } else {
                None
            }
        };

        if let Some((channel, latest)) = mark_read {
            self.spawn_mark_read(channel, latest);
        }
    }

    fn spawn_mark_read(&self, channel: Channel, latest: Option<MessageId>) {
        let read_state = Arc::clone(&self.read_state);
        tokio::spawn(async move {
            read_state.mark_read(&channel, latest.as_ref()).await;
        });
    }

    fn broadcast_history(&self, messages: &MessageSynchronizer, channel: &ChannelRef) {
        let _ = self.events.send(ClientEvent::HistoryUpdated {
            channel: channel.clone(),
            messages: messages.history(channel).to_vec(),
        });
    }

    async fn broadcast_unread(&self) {
        let unread_count = self.notifications.unread_count().await;
        let _ = self
            .events
            .send(ClientEvent::NotificationsUpdated { unread_count });
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
