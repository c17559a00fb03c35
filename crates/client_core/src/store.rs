//! Timeline of the active conversation.
//!
//! Every producer (history pages, push events, optimistic sends) goes through the same
//! insert path here, which is what keeps ids unique and the order total.

use std::collections::HashSet;

use chrono::Utc;
use shared::{
    attachment::attachment_from_parts,
    domain::{ConversationId, Message, MessageId, MessageOrigin, ProfileId},
    protocol::PushMessage,
};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MergeOutcome {
    pub inserted: usize,
    pub duplicates: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    Applied(MessageId),
    /// The viewer's own message; SendPipeline owns its reconciliation.
    OwnEcho,
    Duplicate,
    /// Sent by someone other than the active peer, or no peer conversation is active.
    OtherConversation,
    Malformed(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Replaced,
    /// The confirmed id was already present, so the optimistic copy was dropped.
    MergedIntoExisting,
    /// The optimistic entry no longer exists (conversation switched).
    Missing,
}

pub struct MessageStore {
    viewer: ProfileId,
    active: Option<ConversationId>,
    entries: Vec<Message>,
    ids: HashSet<MessageId>,
}

impl MessageStore {
    pub fn new(viewer: ProfileId) -> Self {
        Self {
            viewer,
            active: None,
            entries: Vec::new(),
            ids: HashSet::new(),
        }
    }

    pub fn viewer(&self) -> &ProfileId {
        &self.viewer
    }

    pub fn active(&self) -> Option<&ConversationId> {
        self.active.as_ref()
    }

    pub fn active_peer(&self) -> Option<&ProfileId> {
        self.active.as_ref().and_then(ConversationId::peer)
    }

    pub fn replace_active_conversation(&mut self, conversation: ConversationId) {
        self.active = Some(conversation);
        self.entries.clear();
        self.ids.clear();
    }

    pub fn messages(&self) -> &[Message] {
        &self.entries
    }

    pub fn snapshot(&self) -> Vec<Message> {
        self.entries.clone()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.ids.contains(id)
    }

    pub fn get(&self, id: &MessageId) -> Option<&Message> {
        self.position(id).map(|index| &self.entries[index])
    }

    /// Merges a history page. Ids already present win over the fetched copy, since a live
    /// or optimistic entry may carry newer state than history (e.g. `seen`).
    pub fn merge_fetched(&mut self, page: Vec<Message>) -> MergeOutcome {
        let mut outcome = MergeOutcome::default();
        let Some(peer) = self.active_peer().cloned() else {
            outcome.duplicates = page.len();
            return outcome;
        };

        for mut message in page {
            if message.conversation_id != peer {
                debug!(message_id = %message.id, "store: dropping fetched message for another conversation");
                outcome.duplicates += 1;
                continue;
            }
            message.origin = MessageOrigin::Fetched;
            if self.insert_sorted(message) {
                outcome.inserted += 1;
            } else {
                outcome.duplicates += 1;
            }
        }
        outcome
    }

    /// Converts a raw push event into a timeline entry if it belongs here.
    pub fn apply_pushed(&mut self, event: PushMessage) -> PushOutcome {
        let Some(sender) = event.sender_id.clone().filter(|s| !s.is_empty()) else {
            return PushOutcome::Malformed("missing sender");
        };
        let sender = ProfileId(sender);
        let body = event.message.clone().unwrap_or_default();
        let metadata = event.image_metadata.clone().unwrap_or_default();
        let attachment = attachment_from_parts(
            event.image.clone(),
            event.file_type.clone().or(metadata.file_type),
            event.file_name.clone().or(metadata.original_file_name),
            event.file_size.or(metadata.file_size),
        );
        if body.is_empty() && attachment.is_none() {
            return PushOutcome::Malformed("neither body nor attachment");
        }

        if sender == self.viewer {
            return PushOutcome::OwnEcho;
        }
        if let Some(receiver) = event.receiver_id.as_deref().filter(|r| !r.is_empty()) {
            if receiver != self.viewer.as_str() {
                return PushOutcome::OtherConversation;
            }
        }

        let Some(peer) = self.active_peer() else {
            return PushOutcome::OtherConversation;
        };
        if *peer != sender {
            return PushOutcome::OtherConversation;
        }

        let created_at = event.timestamp.unwrap_or_else(Utc::now);
        let id = event
            .message_id
            .filter(|id| !id.is_empty())
            .map(MessageId)
            .unwrap_or_else(|| MessageId::synthesized(&sender, created_at));
        if self.ids.contains(&id) {
            return PushOutcome::Duplicate;
        }

        let message = Message {
            id: id.clone(),
            conversation_id: peer.clone(),
            sender_id: sender,
            body,
            attachment,
            created_at,
            seen: event.seen,
            origin: MessageOrigin::Pushed,
        };
        self.insert_sorted(message);
        PushOutcome::Applied(id)
    }

    pub fn insert_optimistic(&mut self, mut message: Message) -> bool {
        message.origin = MessageOrigin::Optimistic;
        if self.active_peer() != Some(&message.conversation_id) {
            return false;
        }
        self.insert_sorted(message)
    }

    /// Swaps an optimistic entry for its server-confirmed record without adding an entry.
    pub fn reconcile(&mut self, provisional: &MessageId, confirmed: Message) -> ReconcileOutcome {
        let Some(index) = self.position(provisional) else {
            return ReconcileOutcome::Missing;
        };

        if self.ids.contains(&confirmed.id) {
            self.entries.remove(index);
            self.ids.remove(provisional);
            return ReconcileOutcome::MergedIntoExisting;
        }

        let entry = &mut self.entries[index];
        self.ids.remove(provisional);
        self.ids.insert(confirmed.id.clone());
        entry.id = confirmed.id;
        entry.created_at = confirmed.created_at;
        entry.seen = confirmed.seen;
        entry.origin = MessageOrigin::Fetched;
        if confirmed.attachment.is_some() {
            entry.attachment = confirmed.attachment;
        }

        // The server clock may disagree with ours; restore order only if it has to move.
        let in_order = (index == 0 || self.entries[index - 1].order_key() <= self.entries[index].order_key())
            && (index + 1 == self.entries.len()
                || self.entries[index].order_key() <= self.entries[index + 1].order_key());
        if !in_order {
            let entry = self.entries.remove(index);
            let at = self.insertion_point(&entry);
            self.entries.insert(at, entry);
        }
        ReconcileOutcome::Replaced
    }

    pub fn remove(&mut self, id: &MessageId) -> Option<Message> {
        let index = self.position(id)?;
        self.ids.remove(id);
        Some(self.entries.remove(index))
    }

    /// Flags a message as seen. Unknown ids are ignored rather than queued.
    pub fn mark_seen(&mut self, id: &MessageId) -> bool {
        match self.position(id) {
            Some(index) if !self.entries[index].seen => {
                self.entries[index].seen = true;
                true
            }
            _ => false,
        }
    }

    fn position(&self, id: &MessageId) -> Option<usize> {
        if !self.ids.contains(id) {
            return None;
        }
        self.entries.iter().position(|message| &message.id == id)
    }

    fn insertion_point(&self, message: &Message) -> usize {
        let key = message.order_key();
        self.entries.partition_point(|existing| existing.order_key() <= key)
    }

    fn insert_sorted(&mut self, message: Message) -> bool {
        if !self.ids.insert(message.id.clone()) {
            return false;
        }
        let at = self.insertion_point(&message);
        self.entries.insert(at, message);
        true
    }
}

#[cfg(test)]
#[path = "tests/store_tests.rs"]
mod tests;
