use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

id_newtype!(UserId);
id_newtype!(GroupId);
id_newtype!(ChannelId);
id_newtype!(MessageId);
id_newtype!(NotificationId);
id_newtype!(ClientRef);

const TEMP_MESSAGE_PREFIX: &str = "temp-";

impl MessageId {
    /// Locally generated id for an optimistic message that the server has not confirmed yet.
    pub fn temporary(client_ref: &ClientRef) -> Self {
        Self(format!("{TEMP_MESSAGE_PREFIX}{}", client_ref.0))
    }

    pub fn is_temporary(&self) -> bool {
        self.0.starts_with(TEMP_MESSAGE_PREFIX)
    }
}

impl ClientRef {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl NotificationId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Admin,
    Group,
}

/// Identity of a message stream. Admin is a singleton; group streams are keyed by group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "chatType", content = "groupId", rename_all = "snake_case")]
pub enum ChannelRef {
    Admin,
    Group(GroupId),
}

impl ChannelRef {
    pub fn kind(&self) -> ChannelKind {
        match self {
            ChannelRef::Admin => ChannelKind::Admin,
            ChannelRef::Group(_) => ChannelKind::Group,
        }
    }

    pub fn group_id(&self) -> Option<&GroupId> {
        match self {
            ChannelRef::Admin => None,
            ChannelRef::Group(group_id) => Some(group_id),
        }
    }

    /// Rebuilds the identity carried by a push event (`chatType` + optional `groupId`).
    pub fn from_parts(kind: ChannelKind, group_id: Option<GroupId>) -> Option<Self> {
        match (kind, group_id) {
            (ChannelKind::Admin, _) => Some(ChannelRef::Admin),
            (ChannelKind::Group, Some(group_id)) => Some(ChannelRef::Group(group_id)),
            (ChannelKind::Group, None) => None,
        }
    }
}

impl fmt::Display for ChannelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelRef::Admin => f.write_str("admin"),
            ChannelRef::Group(group_id) => write!(f, "group:{group_id}"),
        }
    }
}

/// Entry of the channel directory served by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Channel {
    pub id: ChannelId,
    #[serde(rename = "type")]
    pub kind: ChannelKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<GroupId>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub unread_count: u32,
}

impl Channel {
    pub fn admin(id: impl Into<ChannelId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: ChannelKind::Admin,
            group_id: None,
            name: name.into(),
            description: None,
            unread_count: 0,
        }
    }

    pub fn group(
        id: impl Into<ChannelId>,
        group_id: impl Into<GroupId>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            kind: ChannelKind::Group,
            group_id: Some(group_id.into()),
            name: name.into(),
            description: None,
            unread_count: 0,
        }
    }

    /// `None` for a group entry that came back without its group id.
    pub fn reference(&self) -> Option<ChannelRef> {
        ChannelRef::from_parts(self.kind, self.group_id.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sender {
    pub id: UserId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub content: String,
    pub sender: Sender,
    pub channel: ChannelRef,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub edited: bool,
    #[serde(default)]
    pub is_temp: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Info,
    Warning,
    Success,
    Error,
    Payment,
    Group,
    Meeting,
    Document,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: NotificationId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    pub read: bool,
    pub created_at: DateTime<Utc>,
}
