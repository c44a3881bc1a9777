use std::time::Duration;

use shared::{domain::ChannelId, error::ApiError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid socket url: {0}")]
    InvalidUrl(String),
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),
    #[error("transport closed: {0}")]
    Closed(String),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Returned by `ConnectionManager::emit`; never fatal.
#[derive(Debug, Error)]
pub enum EmitError {
    #[error("push connection is not connected")]
    NotConnected,
    #[error("failed to encode {event} frame: {source}")]
    Encode {
        event: &'static str,
        source: serde_json::Error,
    },
    #[error("push connection closed before the frame was queued")]
    Closed,
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error("no channel is selected")]
    NoActiveChannel,
    #[error("sender identity is not set")]
    MissingIdentity,
    #[error("message content must not be empty")]
    EmptyContent,
    #[error("message could not be sent: {0}")]
    Emit(#[from] EmitError),
    #[error("server rejected message: {}", .0.message)]
    Rejected(ApiError),
    #[error("no acknowledgment within {0:?}")]
    AckTimeout(Duration),
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("no channel is selected")]
    NoActiveChannel,
    #[error("channel {0} is a group channel without a group id")]
    MalformedChannel(ChannelId),
    #[error("failed to load channel directory: {0}")]
    Directory(anyhow::Error),
    #[error("failed to load history for channel {channel}: {error}")]
    History {
        channel: ChannelId,
        error: anyhow::Error,
    },
    #[error("failed to load notifications: {0}")]
    Notifications(anyhow::Error),
}
