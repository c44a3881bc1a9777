use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use shared::{
    domain::{Channel, ChannelKind, GroupId},
    protocol::{MarkReadRequest, MessagePayload, NotificationPayload, UpdateNotificationRequest},
};
use tokio::sync::RwLock;

use crate::connection::Session;

/// REST collaborator that owns message, channel and notification persistence.
#[async_trait]
pub trait SyncBackend: Send + Sync {
    async fn list_channels(&self) -> Result<Vec<Channel>>;
    async fn fetch_history(&self, channel: &Channel) -> Result<Vec<MessagePayload>>;
    async fn mark_channel_read(&self, request: &MarkReadRequest) -> Result<()>;
    async fn update_notification(&self, server_id: &str, is_read: bool) -> Result<()>;
    async fn list_notifications(&self) -> Result<Vec<NotificationPayload>>;
    /// Swaps the bearer credential used by later calls.
    async fn set_session(&self, session: Session);
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HistoryQuery<'a> {
    chat_type: ChannelKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    group_id: Option<&'a GroupId>,
}

pub struct HttpSyncBackend {
    http: Client,
    server_url: String,
    session: RwLock<Session>,
}

impl HttpSyncBackend {
    pub fn new(server_url: impl Into<String>, session: Session) -> Self {
        Self {
            http: Client::new(),
            server_url: server_url.into().trim_end_matches('/').to_string(),
            session: RwLock::new(session),
        }
    }

    async fn bearer(&self) -> String {
        self.session.read().await.token().to_string()
    }
}

#[async_trait]
impl SyncBackend for HttpSyncBackend {
    async fn list_channels(&self) -> Result<Vec<Channel>> {
        let channels: Vec<Channel> = self
            .http
            .get(format!("{}/chats", self.server_url))
            .bearer_auth(self.bearer().await)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(channels)
    }

    async fn fetch_history(&self, channel: &Channel) -> Result<Vec<MessagePayload>> {
        if channel.kind == ChannelKind::Group && channel.group_id.is_none() {
            return Err(anyhow!("group channel {} has no group id", channel.id));
        }
        let messages: Vec<MessagePayload> = self
            .http
            .get(format!("{}/chats/{}/messages", self.server_url, channel.id))
            .bearer_auth(self.bearer().await)
            .query(&HistoryQuery {
                chat_type: channel.kind,
                group_id: channel.group_id.as_ref(),
            })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(messages)
    }

    async fn mark_channel_read(&self, request: &MarkReadRequest) -> Result<()> {
        self.http
            .post(format!("{}/chats/read", self.server_url))
            .bearer_auth(self.bearer().await)
            .json(request)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn update_notification(&self, server_id: &str, is_read: bool) -> Result<()> {
        self.http
            .put(format!("{}/notifications/{server_id}", self.server_url))
            .bearer_auth(self.bearer().await)
            .json(&UpdateNotificationRequest { is_read })
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn list_notifications(&self) -> Result<Vec<NotificationPayload>> {
        let notifications: Vec<NotificationPayload> = self
            .http
            .get(format!("{}/notifications", self.server_url))
            .bearer_auth(self.bearer().await)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(notifications)
    }

    async fn set_session(&self, session: Session) {
        *self.session.write().await = session;
    }
}

#[cfg(test)]
#[path = "tests/api_tests.rs"]
mod tests;
