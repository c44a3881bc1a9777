use async_trait::async_trait;
use shared::{
    domain::{Channel, ChannelId, ChannelKind, ChannelRef, GroupId},
    protocol::ClientRequest,
};
use tracing::{debug, info, warn};

use crate::error::{EmitError, SyncError};

/// Where join/leave signals go. Implemented by the connection manager.
#[async_trait]
pub trait SignalSink: Send + Sync {
    fn is_connected(&self) -> bool;
    /// Changes whenever a new socket becomes connected.
    fn link_id(&self) -> u64;
    async fn emit(&self, request: &ClientRequest) -> Result<(), EmitError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub channel_id: ChannelId,
    pub kind: ChannelKind,
    pub channel: ChannelRef,
}

/// Keeps server-side room membership equal to the one displayed channel.
///
/// `joined` is the group the server currently has us in. It is reset whenever the socket
/// is lost because a fresh connection starts without rooms; the current selection is then
/// replayed on the next `on_connected`. `joined_on` records which socket the join went out
/// on, so a connect or disconnect event that is processed late never undoes a join already
/// made on the live socket.
#[derive(Debug, Default)]
pub struct SubscriptionTracker {
    selected: Option<Selection>,
    joined: Option<GroupId>,
    joined_on: Option<u64>,
    replay_pending: bool,
}

impl SubscriptionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn selected(&self) -> Option<&Selection> {
        self.selected.as_ref()
    }

    pub fn joined_group(&self) -> Option<&GroupId> {
        self.joined.as_ref()
    }

    pub fn is_replay_pending(&self) -> bool {
        self.replay_pending
    }

    /// Returns `Ok(false)` when `channel` is already the selection.
    pub async fn select(&mut self, channel: &Channel, sink: &dyn SignalSink) -> Result<bool, SyncError> {
        let reference = channel
            .reference()
            .ok_or_else(|| SyncError::MalformedChannel(channel.id.clone()))?;
        let selection = Selection {
            channel_id: channel.id.clone(),
            kind: channel.kind,
            channel: reference,
        };
        if self.selected.as_ref() == Some(&selection) {
            return Ok(false);
        }

        debug!(channel = %selection.channel, "subscriptions: selecting channel");
        self.selected = Some(selection);
        self.sync_membership(sink).await;
        Ok(true)
    }

    pub async fn clear(&mut self, sink: &dyn SignalSink) {
        self.selected = None;
        self.replay_pending = false;
        self.joined_on = None;
        let Some(group_id) = self.joined.take() else {
            return;
        };
        if !sink.is_connected() {
            return;
        }
        if let Err(err) = sink
            .emit(&ClientRequest::LeaveGroup {
                group_id: group_id.clone(),
            })
            .await
        {
            warn!(group_id = %group_id, "subscriptions: leave on clear failed: {err}");
        }
    }

    pub async fn on_connected(&mut self, sink: &dyn SignalSink) {
        if self.joined_on_live_link(sink) {
            debug!("subscriptions: membership already set up on this connection");
        } else {
            self.joined = None;
            self.joined_on = None;
            if self.replay_pending {
                info!("subscriptions: replaying selection after connect");
            }
        }
        self.sync_membership(sink).await;
    }

    pub fn on_disconnected(&mut self, sink: &dyn SignalSink) {
        if self.joined_on_live_link(sink) {
            debug!("subscriptions: ignoring disconnect of an earlier connection");
            return;
        }
        self.joined = None;
        self.joined_on = None;
        self.replay_pending = self
            .selected
            .as_ref()
            .is_some_and(|selection| selection.channel.group_id().is_some());
    }

    fn joined_on_live_link(&self, sink: &dyn SignalSink) -> bool {
        self.joined.is_some() && sink.is_connected() && self.joined_on == Some(sink.link_id())
    }

    async fn sync_membership(&mut self, sink: &dyn SignalSink) {
        if !sink.is_connected() {
            self.replay_pending = true;
            debug!("subscriptions: not connected; selection queued");
            return;
        }

        let wanted = self
            .selected
            .as_ref()
            .and_then(|selection| selection.channel.group_id().cloned());
        if self.joined == wanted {
            self.replay_pending = false;
            return;
        }

        self.joined_on = None;
        if let Some(previous) = self.joined.take() {
            if let Err(err) = sink
                .emit(&ClientRequest::LeaveGroup {
                    group_id: previous.clone(),
                })
                .await
            {
                warn!(group_id = %previous, "subscriptions: leave failed: {err}");
            }
        }

        let Some(group_id) = wanted else {
            self.replay_pending = false;
            return;
        };
        let link = sink.link_id();
        match sink
            .emit(&ClientRequest::JoinGroup {
                group_id: group_id.clone(),
            })
            .await
        {
            Ok(()) => {
                info!(group_id = %group_id, "subscriptions: joined group");
                self.joined = Some(group_id);
                self.joined_on = Some(link);
                self.replay_pending = false;
            }
            Err(err) => {
                warn!(group_id = %group_id, "subscriptions: join failed, will replay on connect: {err}");
                self.replay_pending = true;
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/subscriptions_tests.rs"]
mod tests;
