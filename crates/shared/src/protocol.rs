use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{
        Channel, ChannelId, ChannelKind, ChannelRef, ClientRef, GroupId, Message, MessageId,
        Notification, NotificationId, NotificationKind, Sender,
    },
    error::ApiError,
};

/// Frames the client pushes over the socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientRequest {
    #[serde(rename = "join-group", rename_all = "camelCase")]
    JoinGroup { group_id: GroupId },
    #[serde(rename = "leave-group", rename_all = "camelCase")]
    LeaveGroup { group_id: GroupId },
    #[serde(rename = "send-message", rename_all = "camelCase")]
    SendMessage {
        content: String,
        chat_id: ChannelId,
        chat_type: ChannelKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        group_id: Option<GroupId>,
        client_ref: ClientRef,
    },
}

impl ClientRequest {
    pub fn send_message(channel: &Channel, content: impl Into<String>, client_ref: ClientRef) -> Self {
        ClientRequest::SendMessage {
            content: content.into(),
            chat_id: channel.id.clone(),
            chat_type: channel.kind,
            group_id: channel.group_id.clone(),
            client_ref,
        }
    }

    pub fn event_name(&self) -> &'static str {
        match self {
            ClientRequest::JoinGroup { .. } => "join-group",
            ClientRequest::LeaveGroup { .. } => "leave-group",
            ClientRequest::SendMessage { .. } => "send-message",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePayload {
    #[serde(alias = "_id")]
    pub id: MessageId,
    pub content: String,
    pub sender: Sender,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub edited: bool,
}

impl MessagePayload {
    pub fn into_message(self, channel: ChannelRef) -> Message {
        Message {
            id: self.id,
            content: self.content,
            sender: self.sender,
            channel,
            created_at: self.created_at,
            edited: self.edited,
            is_temp: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationPayload {
    /// Absent on pushes for notifications the backend has not persisted yet.
    #[serde(default, alias = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    #[serde(default)]
    pub is_read: bool,
    #[serde(default = "received_now")]
    pub created_at: DateTime<Utc>,
}

fn received_now() -> DateTime<Utc> {
    Utc::now()
}

impl NotificationPayload {
    pub fn into_notification(self) -> Notification {
        Notification {
            id: NotificationId::generate(),
            server_id: self.id,
            kind: self.kind,
            title: self.title,
            message: self.message,
            link: self.link,
            read: self.is_read,
            created_at: self.created_at,
        }
    }
}

/// Frames the server pushes to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "new_message", rename_all = "camelCase")]
    NewMessage {
        message: MessagePayload,
        chat_type: ChannelKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        group_id: Option<GroupId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_ref: Option<ClientRef>,
    },
    #[serde(rename = "notification")]
    Notification { notification: NotificationPayload },
    #[serde(rename = "message_rejected", rename_all = "camelCase")]
    MessageRejected { client_ref: ClientRef, error: ApiError },
    #[serde(rename = "error")]
    Error(ApiError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkReadRequest {
    pub chat_id: ChannelId,
    pub chat_type: ChannelKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<GroupId>,
}

impl From<&Channel> for MarkReadRequest {
    fn from(channel: &Channel) -> Self {
        Self {
            chat_id: channel.id.clone(),
            chat_type: channel.kind,
            group_id: channel.group_id.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateNotificationRequest {
    pub is_read: bool,
}
