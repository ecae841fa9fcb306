// Ordered, deduplicated message timeline for one conversation

use log::{debug, warn};
use std::collections::HashSet;

use crate::models::{DeliveryStatus, Message};

struct Entry {
    // Arrival order, breaks ties between equal timestamps
    seq: u64,
    message: Message,
}

/// Outcome of [`MessageStore::ingest_remote`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ingest {
    Inserted,
    Duplicate,
    /// The pushed message was the echo of a pending local send.
    Resolved { temp_id: String },
}

#[derive(Default)]
pub struct MessageStore {
    entries: Vec<Entry>,
    next_seq: u64,
    // Temporary ids of optimistic sends awaiting reconciliation
    pending: HashSet<String>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Populate the timeline from a fetched history page.
    pub fn load_history(&mut self, messages: Vec<Message>) -> usize {
        if !self.entries.is_empty() {
            warn!("History loaded into a non-empty store ({} entries)", self.entries.len());
        }
        let mut loaded = 0;
        for message in messages {
            if self.contains(&message.id) {
                debug!("Skipping duplicate history message {}", message.id);
                continue;
            }
            self.insert(message);
            loaded += 1;
        }
        loaded
    }

    /// Show a local send immediately, before the server has acknowledged it.
    pub fn append_optimistic(&mut self, mut draft: Message) -> String {
        draft.is_read = false;
        draft.delivery = DeliveryStatus::Sending;
        let temp_id = draft.id.clone();

        if self.contains(&temp_id) {
            warn!("Optimistic message {} already present", temp_id);
            return temp_id;
        }
        self.pending.insert(temp_id.clone());
        self.insert(draft);
        temp_id
    }

    /// Swap a pending entry for its server-confirmed copy.
    ///
    /// Returns false when `temp_id` was no longer pending, in which case the
    /// server message is merged like a remote delivery.
    pub fn resolve_optimistic(&mut self, temp_id: &str, confirmed: Message) -> bool {
        self.pending.remove(temp_id);

        let Some(temp_idx) = self.position(temp_id) else {
            debug!("Pending message {} already reconciled", temp_id);
            if !self.contains(&confirmed.id) {
                self.insert(Message {
                    delivery: DeliveryStatus::Sent,
                    ..confirmed
                });
            }
            return false;
        };

        let local = self.entries.remove(temp_idx);

        // The echo beat the HTTP response: fold the temporary entry into it
        if confirmed.id != temp_id {
            if let Some(existing) = self.entries.iter_mut().find(|e| e.message.id == confirmed.id) {
                debug!("Folding {} into already delivered {}", temp_id, confirmed.id);
                existing.message.is_read |= confirmed.is_read || local.message.is_read;
                existing.message.delivery = DeliveryStatus::Sent;
                if existing.message.client_ref.is_none() {
                    existing.message.client_ref = local.message.client_ref;
                }
                return true;
            }
        }

        let merged = Message {
            body: if confirmed.body.is_empty() {
                local.message.body
            } else {
                confirmed.body
            },
            attachment_url: confirmed.attachment_url.or(local.message.attachment_url),
            is_read: confirmed.is_read || local.message.is_read,
            client_ref: confirmed.client_ref.or(local.message.client_ref),
            delivery: DeliveryStatus::Sent,
            ..confirmed
        };
        debug!("Resolved {} as {}", temp_id, merged.id);
        self.place(Entry {
            seq: local.seq,
            message: merged,
        });
        true
    }

    /// Flag a pending send as failed. It stays visible and can be retried.
    pub fn fail_optimistic(&mut self, temp_id: &str) -> bool {
        if !self.pending.contains(temp_id) {
            return false;
        }
        match self.get_mut(temp_id) {
            Some(message) if message.delivery == DeliveryStatus::Sending => {
                message.delivery = DeliveryStatus::Failed;
                true
            }
            _ => false,
        }
    }

    /// Move a failed send back to `Sending` ahead of a retry.
    pub fn mark_sending(&mut self, temp_id: &str) -> bool {
        if !self.pending.contains(temp_id) {
            return false;
        }
        match self.get_mut(temp_id) {
            Some(message) if message.delivery == DeliveryStatus::Failed => {
                message.delivery = DeliveryStatus::Sending;
                true
            }
            _ => false,
        }
    }

    /// Merge a message pushed by the event channel. Redeliveries are no-ops.
    pub fn ingest_remote(&mut self, message: Message) -> Ingest {
        if self.contains(&message.id) {
            debug!("Ignoring duplicate delivery of {}", message.id);
            return Ingest::Duplicate;
        }

        let echoed = message
            .client_ref
            .as_deref()
            .and_then(|client_ref| self.pending_with_ref(client_ref));
        if let Some(temp_id) = echoed {
            self.resolve_optimistic(&temp_id, message);
            return Ingest::Resolved { temp_id };
        }

        self.insert(message);
        Ingest::Inserted
    }

    /// Returns true only when the message went from unread to read.
    pub fn mark_read(&mut self, id: &str) -> bool {
        match self.get_mut(id) {
            Some(message) if !message.is_read => {
                message.is_read = true;
                true
            }
            _ => false,
        }
    }

    pub fn snapshot(&self) -> Vec<Message> {
        self.entries.iter().map(|e| e.message.clone()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.entries.iter().map(|e| &e.message)
    }

    pub fn get(&self, id: &str) -> Option<&Message> {
        self.iter().find(|m| m.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.position(id).is_some()
    }

    pub fn is_pending(&self, id: &str) -> bool {
        self.pending.contains(id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn get_mut(&mut self, id: &str) -> Option<&mut Message> {
        self.entries
            .iter_mut()
            .map(|e| &mut e.message)
            .find(|m| m.id == id)
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.message.id == id)
    }

    fn pending_with_ref(&self, client_ref: &str) -> Option<String> {
        self.entries
            .iter()
            .find(|e| self.pending.contains(&e.message.id) && e.message.client_ref.as_deref() == Some(client_ref))
            .map(|e| e.message.id.clone())
    }

    fn insert(&mut self, message: Message) {
        self.next_seq += 1;
        let seq = self.next_seq;
        self.place(Entry { seq, message });
    }

    fn place(&mut self, entry: Entry) {
        let key = (entry.message.sent_at, entry.seq);
        let idx = self
            .entries
            .partition_point(|e| (e.message.sent_at, e.seq) <= key);
        self.entries.insert(idx, entry);
    }
}
