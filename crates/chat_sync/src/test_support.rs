use std::{
    collections::{HashMap, HashSet},
    future::Future,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{channel::mpsc as frames, SinkExt, StreamExt};
use shared::{
    domain::{Channel, ChannelId, Sender, UserId},
    protocol::{ClientRequest, MarkReadRequest, MessagePayload, NotificationPayload, ServerEvent},
};
use tokio::sync::{mpsc, Mutex};

use crate::{
    api::SyncBackend,
    connection::{ConnectionOptions, Session},
    error::TransportError,
    reconnect::ReconnectPolicy,
    transport::{Transport, TransportLink},
};

const WAIT: Duration = Duration::from_secs(2);

pub fn fast_options(max_attempts: u32) -> ConnectionOptions {
    ConnectionOptions {
        reconnect: ReconnectPolicy {
            max_attempts,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(40),
            jitter: false,
        },
        handshake_timeout: Duration::from_millis(500),
    }
}

pub fn sender(id: &str, name: &str) -> Sender {
    Sender {
        id: UserId::from(id),
        name: name.to_string(),
        avatar: None,
    }
}

pub fn at(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .expect("timestamp")
        .with_timezone(&Utc)
}

pub fn payload(id: &str, content: &str, sender_id: &str, created_at: &str) -> MessagePayload {
    MessagePayload {
        id: id.into(),
        content: content.to_string(),
        sender: sender(sender_id, sender_id),
        created_at: at(created_at),
        edited: false,
    }
}

pub fn notification_payload(id: &str, message: &str, created_at: &str) -> NotificationPayload {
    serde_json::from_value(serde_json::json!({
        "_id": id,
        "type": "info",
        "message": message,
        "createdAt": created_at,
    }))
    .expect("notification payload")
}

/// Polls `check` until it holds or the wait budget runs out.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Server side of one in-memory connection.
pub struct ServerEnd {
    pub token: String,
    inbound: frames::UnboundedReceiver<String>,
    outbound: frames::UnboundedSender<Result<String, TransportError>>,
}

impl ServerEnd {
    pub async fn next_request(&mut self) -> ClientRequest {
        let frame = tokio::time::timeout(WAIT, self.inbound.next())
            .await
            .expect("client frame in time")
            .expect("client link open");
        serde_json::from_str(&frame).expect("client frame decodes")
    }

    /// Fails if the client sends anything within `window`.
    pub async fn expect_silence(&mut self, window: Duration) {
        if let Ok(Some(frame)) = tokio::time::timeout(window, self.inbound.next()).await {
            panic!("unexpected client frame: {frame}");
        }
    }

    pub fn push(&self, event: &ServerEvent) {
        let frame = serde_json::to_string(event).expect("encode server event");
        self.outbound
            .unbounded_send(Ok(frame))
            .expect("client still listening");
    }

    pub fn push_raw(&self, frame: &str) {
        self.outbound
            .unbounded_send(Ok(frame.to_string()))
            .expect("client still listening");
    }

    pub fn close(self, reason: &str) {
        let _ = self
            .outbound
            .unbounded_send(Err(TransportError::Closed(reason.to_string())));
    }
}

pub struct Acceptor {
    accepted: mpsc::UnboundedReceiver<ServerEnd>,
}

impl Acceptor {
    pub async fn accept(&mut self) -> ServerEnd {
        tokio::time::timeout(WAIT, self.accepted.recv())
            .await
            .expect("connection in time")
            .expect("transport alive")
    }

    pub async fn expect_no_connection(&mut self, window: Duration) {
        if let Ok(Some(end)) = tokio::time::timeout(window, self.accepted.recv()).await {
            panic!("unexpected connection with token {}", end.token);
        }
    }
}

/// Transport whose connections are in-process channel pairs.
pub struct MemoryTransport {
    refuse: AtomicBool,
    attempts: AtomicU32,
    accepted: mpsc::UnboundedSender<ServerEnd>,
}

impl MemoryTransport {
    pub fn new() -> (Arc<Self>, Acceptor) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                refuse: AtomicBool::new(false),
                attempts: AtomicU32::new(0),
                accepted: tx,
            }),
            Acceptor { accepted: rx },
        )
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open(&self, session: &Session) -> Result<TransportLink, TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.refuse.load(Ordering::SeqCst) {
            return Err(TransportError::Handshake("connection refused".to_string()));
        }

        let (client_tx, server_rx) = frames::unbounded::<String>();
        let (server_tx, client_rx) = frames::unbounded::<Result<String, TransportError>>();
        self.accepted
            .send(ServerEnd {
                token: session.token().to_string(),
                inbound: server_rx,
                outbound: server_tx,
            })
            .map_err(|_| TransportError::Handshake("acceptor dropped".to_string()))?;

        Ok(TransportLink {
            sink: Box::pin(
                client_tx.sink_map_err(|err| TransportError::Closed(err.to_string())),
            ),
            stream: Box::pin(client_rx),
        })
    }
}

#[derive(Default)]
struct BackendState {
    channels: Vec<Channel>,
    histories: HashMap<ChannelId, Vec<MessagePayload>>,
    notifications: Vec<NotificationPayload>,
    failing_history: HashSet<ChannelId>,
    failing_updates: HashSet<String>,
    fail_mark_read: bool,
    fail_notifications: bool,
    history_delay: Option<Duration>,
    history_calls: Vec<ChannelId>,
    mark_read_calls: Vec<MarkReadRequest>,
    notification_updates: Vec<(String, bool)>,
    tokens: Vec<String>,
}

/// Scriptable backend that records every call.
#[derive(Default)]
pub struct FakeBackend {
    state: Mutex<BackendState>,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn set_channels(&self, channels: Vec<Channel>) {
        self.state.lock().await.channels = channels;
    }

    pub async fn set_history(&self, channel: &str, messages: Vec<MessagePayload>) {
        self.state
            .lock()
            .await
            .histories
            .insert(ChannelId::from(channel), messages);
    }

    pub async fn set_notifications(&self, notifications: Vec<NotificationPayload>) {
        self.state.lock().await.notifications = notifications;
    }

    /// Delays history responses; the snapshot is still taken when the call starts.
    pub async fn delay_history(&self, delay: Duration) {
        self.state.lock().await.history_delay = Some(delay);
    }

    pub async fn fail_history_for(&self, channel: &str, fail: bool) {
        let mut state = self.state.lock().await;
        let channel = ChannelId::from(channel);
        if fail {
            state.failing_history.insert(channel);
        } else {
            state.failing_history.remove(&channel);
        }
    }

    pub async fn fail_update_for(&self, server_id: &str) {
        self.state
            .lock()
            .await
            .failing_updates
            .insert(server_id.to_string());
    }

    pub async fn fail_mark_read(&self, fail: bool) {
        self.state.lock().await.fail_mark_read = fail;
    }

    pub async fn fail_notifications(&self, fail: bool) {
        self.state.lock().await.fail_notifications = fail;
    }

    pub async fn history_calls(&self) -> Vec<ChannelId> {
        self.state.lock().await.history_calls.clone()
    }

    pub async fn mark_read_calls(&self) -> Vec<MarkReadRequest> {
        self.state.lock().await.mark_read_calls.clone()
    }

    pub async fn notification_updates(&self) -> Vec<(String, bool)> {
        self.state.lock().await.notification_updates.clone()
    }

    pub async fn tokens(&self) -> Vec<String> {
        self.state.lock().await.tokens.clone()
    }
}

#[async_trait]
impl SyncBackend for FakeBackend {
    async fn list_channels(&self) -> Result<Vec<Channel>> {
        Ok(self.state.lock().await.channels.clone())
    }

    async fn fetch_history(&self, channel: &Channel) -> Result<Vec<MessagePayload>> {
        let (snapshot, delay) = {
            let mut state = self.state.lock().await;
            state.history_calls.push(channel.id.clone());
            let snapshot = if state.failing_history.contains(&channel.id) {
                Err(anyhow!("history unavailable"))
            } else {
                Ok(state.histories.get(&channel.id).cloned().unwrap_or_default())
            };
            (snapshot, state.history_delay)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        snapshot
    }

    async fn mark_channel_read(&self, request: &MarkReadRequest) -> Result<()> {
        let mut state = self.state.lock().await;
        state.mark_read_calls.push(request.clone());
        if state.fail_mark_read {
            return Err(anyhow!("read marker unavailable"));
        }
        Ok(())
    }

    async fn update_notification(&self, server_id: &str, is_read: bool) -> Result<()> {
        let mut state = self.state.lock().await;
        state
            .notification_updates
            .push((server_id.to_string(), is_read));
        if state.failing_updates.contains(server_id) {
            return Err(anyhow!("update rejected"));
        }
        Ok(())
    }

    async fn list_notifications(&self) -> Result<Vec<NotificationPayload>> {
        let state = self.state.lock().await;
        if state.fail_notifications {
            return Err(anyhow!("notifications unavailable"));
        }
        Ok(state.notifications.clone())
    }

    async fn set_session(&self, session: Session) {
        self.state
            .lock()
            .await
            .tokens
            .push(session.token().to_string());
    }
}
