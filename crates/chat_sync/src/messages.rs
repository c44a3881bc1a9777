use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use shared::domain::{ChannelRef, ClientRef, Message, MessageId, Sender, UserId};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSend {
    pub client_ref: ClientRef,
    pub temp_id: MessageId,
    pub channel: ChannelRef,
    pub sender_id: UserId,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// An optimistic message was replaced by its confirmed copy.
    Reconciled {
        client_ref: ClientRef,
        message: Message,
        active: bool,
    },
    Appended(Message),
    /// The confirmed id is already in history.
    Duplicate,
    /// The message belongs to a channel that is not displayed.
    Ignored,
}

/// Per-channel ordered history with optimistic sends.
///
/// Pushed messages are reconciled against pending sends first by the echoed `clientRef`;
/// when the server does not echo one, the oldest pending send in the same channel with the
/// same sender and identical content is taken.
#[derive(Debug, Default)]
pub struct MessageSynchronizer {
    active: Option<ChannelRef>,
    histories: HashMap<ChannelRef, Vec<Message>>,
    pending: Vec<PendingSend>,
    // Confirmed ids added by pushes or acks that no fetched snapshot has contained yet.
    unsnapshotted: HashMap<ChannelRef, HashSet<MessageId>>,
}

impl MessageSynchronizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active(&self) -> Option<&ChannelRef> {
        self.active.as_ref()
    }

    pub fn activate(&mut self, channel: ChannelRef) {
        self.active = Some(channel);
    }

    pub fn deactivate(&mut self) {
        self.active = None;
    }

    pub fn history(&self, channel: &ChannelRef) -> &[Message] {
        self.histories
            .get(channel)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn pending(&self) -> &[PendingSend] {
        &self.pending
    }

    /// Latest server-confirmed id in a channel's history.
    pub fn latest_confirmed(&self, channel: &ChannelRef) -> Option<&MessageId> {
        self.history(channel)
            .iter()
            .rev()
            .find(|message| !message.is_temp)
            .map(|message| &message.id)
    }

    /// Appends an optimistic message and records it as pending.
    pub fn begin_send(
        &mut self,
        channel: &ChannelRef,
        content: &str,
        sender: Sender,
        now: DateTime<Utc>,
    ) -> (ClientRef, Message) {
        let client_ref = ClientRef::generate();
        let temp = Message {
            id: MessageId::temporary(&client_ref),
            content: content.to_string(),
            sender,
            channel: channel.clone(),
            created_at: now,
            edited: false,
            is_temp: true,
        };
        self.pending.push(PendingSend {
            client_ref: client_ref.clone(),
            temp_id: temp.id.clone(),
            channel: channel.clone(),
            sender_id: temp.sender.id.clone(),
            content: temp.content.clone(),
        });
        self.histories
            .entry(channel.clone())
            .or_default()
            .push(temp.clone());
        (client_ref, temp)
    }

    /// Removes an optimistic message. `None` if it was already reconciled or rolled back.
    pub fn rollback(&mut self, client_ref: &ClientRef) -> Option<Message> {
        let index = self
            .pending
            .iter()
            .position(|pending| &pending.client_ref == client_ref)?;
        let pending = self.pending.remove(index);
        let history = self.histories.get_mut(&pending.channel)?;
        let position = history
            .iter()
            .position(|message| message.id == pending.temp_id)?;
        Some(history.remove(position))
    }

    /// Replaces a channel's confirmed history with a fetched snapshot.
    ///
    /// Messages that arrived live and are missing from the snapshot (the fetch started before
    /// they were pushed or acknowledged) are kept after it in arrival order, as are sends
    /// still in flight.
    pub fn replace_history(&mut self, channel: ChannelRef, confirmed: Vec<Message>) {
        let previous = self.histories.remove(&channel).unwrap_or_default();

        let mut seen = HashSet::new();
        let mut history = Vec::with_capacity(confirmed.len());
        for message in confirmed {
            if seen.insert(message.id.clone()) {
                history.push(message);
            }
        }

        let live = self.unsnapshotted.remove(&channel).unwrap_or_default();
        let live: HashSet<MessageId> = live.into_iter().filter(|id| !seen.contains(id)).collect();
        let pending = &self.pending;
        let carried: Vec<Message> = previous
            .into_iter()
            .filter(|message| {
                if message.is_temp {
                    pending.iter().any(|pending| pending.temp_id == message.id)
                } else {
                    live.contains(&message.id) && seen.insert(message.id.clone())
                }
            })
            .collect();
        if !carried.is_empty() {
            debug!(
                channel = %channel,
                carried = carried.len(),
                "messages: kept live messages missing from fetched history"
            );
        }
        history.extend(carried);

        if !live.is_empty() {
            self.unsnapshotted.insert(channel.clone(), live);
        }
        self.histories.insert(channel, history);
    }

    pub fn receive(&mut self, message: Message, client_ref: Option<ClientRef>) -> ReceiveOutcome {
        let pending_index = match &client_ref {
            Some(client_ref) => self
                .pending
                .iter()
                .position(|pending| &pending.client_ref == client_ref),
            None => self.pending.iter().position(|pending| {
                pending.channel == message.channel
                    && pending.sender_id == message.sender.id
                    && pending.content == message.content
            }),
        };
        if let Some(index) = pending_index {
            let pending = self.pending.remove(index);
            return self.reconcile(pending, message);
        }

        if self.active.as_ref() != Some(&message.channel) {
            debug!(channel = %message.channel, "messages: dropping push for inactive channel");
            return ReceiveOutcome::Ignored;
        }

        let history = self.histories.entry(message.channel.clone()).or_default();
        if history.iter().any(|existing| existing.id == message.id) {
            return ReceiveOutcome::Duplicate;
        }
        history.push(message.clone());
        self.unsnapshotted
            .entry(message.channel.clone())
            .or_default()
            .insert(message.id.clone());
        ReceiveOutcome::Appended(message)
    }

    pub fn clear(&mut self) {
        self.active = None;
        self.histories.clear();
        self.pending.clear();
        self.unsnapshotted.clear();
    }

    fn reconcile(&mut self, pending: PendingSend, mut confirmed: Message) -> ReceiveOutcome {
        confirmed.is_temp = false;
        confirmed.channel = pending.channel.clone();
        let active = self.active.as_ref() == Some(&pending.channel);
        let history = self.histories.entry(pending.channel.clone()).or_default();

        let already_present = history.iter().any(|message| message.id == confirmed.id);
        let temp_position = history
            .iter()
            .position(|message| message.id == pending.temp_id);
        match (temp_position, already_present) {
            (Some(position), false) => history[position] = confirmed.clone(),
            (Some(position), true) => {
                history.remove(position);
            }
            (None, false) => history.push(confirmed.clone()),
            (None, true) => {}
        }
        self.unsnapshotted
            .entry(pending.channel.clone())
            .or_default()
            .insert(confirmed.id.clone());

        debug!(
            client_ref = %pending.client_ref,
            message_id = %confirmed.id,
            "messages: optimistic send reconciled"
        );
        ReceiveOutcome::Reconciled {
            client_ref: pending.client_ref,
            message: confirmed,
            active,
        }
    }
}

#[cfg(test)]
#[path = "tests/messages_tests.rs"]
mod tests;
