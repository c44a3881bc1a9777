use std::{collections::HashMap, sync::Arc};

use shared::{
    domain::{Channel, ChannelRef, MessageId},
    protocol::MarkReadRequest,
};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::api::SyncBackend;

/// Best-effort read marks. Remembers the newest message each channel was marked read at so
/// repeated calls without new messages never reach the backend.
pub struct ReadStateTracker {
    backend: Arc<dyn SyncBackend>,
    marked: Mutex<HashMap<ChannelRef, Option<MessageId>>>,
}

impl ReadStateTracker {
    pub fn new(backend: Arc<dyn SyncBackend>) -> Self {
        Self {
            backend,
            marked: Mutex::new(HashMap::new()),
        }
    }

    /// Returns whether the backend was called. Failures are logged and forgotten so the
    /// next call retries.
    pub async fn mark_read(&self, channel: &Channel, latest: Option<&MessageId>) -> bool {
        let Some(reference) = channel.reference() else {
            warn!(channel_id = %channel.id, "read-state: skipping malformed channel");
            return false;
        };
        let latest = latest.cloned();

        {
            let mut marked = self.marked.lock().await;
            if marked.get(&reference) == Some(&latest) {
                debug!(channel = %reference, "read-state: already read");
                return false;
            }
            marked.insert(reference.clone(), latest.clone());
        }

        if let Err(err) = self
            .backend
            .mark_channel_read(&MarkReadRequest::from(channel))
            .await
        {
            warn!(channel = %reference, "read-state: mark read failed: {err}");
            let mut marked = self.marked.lock().await;
            if marked.get(&reference) == Some(&latest) {
                marked.remove(&reference);
            }
        }
        true
    }

    pub async fn clear(&self) {
        self.marked.lock().await.clear();
    }
}

#[cfg(test)]
#[path = "tests/read_state_tests.rs"]
mod tests;
