//! Ordered in-memory message sequence for a single channel.
//!
//! The sequence is an incrementally maintained index: messages stay sorted
//! by `(created_at, id)` under every mutation, and a side set of ids makes
//! duplicate change-feed events O(1) to reject. Gap-freeness holds only
//! within the loaded window; coverage grows backward one page at a time.

use std::collections::HashSet;

use chrono::{DateTime, Utc};

use crate::model::{Message, MessageId, Reactions};

#[derive(Debug)]
pub struct MessageSequence {
    messages: Vec<Message>,
    ids: HashSet<MessageId>,
    /// Pagination cursor: timestamp of the oldest loaded message.
    oldest: Option<DateTime<Utc>>,
    has_more: bool,
}

impl MessageSequence {
    pub fn new() -> Self {
        Self {
            messages: Vec::new(),
            ids: HashSet::new(),
            oldest: None,
            has_more: true,
        }
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// The loaded messages in ascending `(created_at, id)` order.
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn cursor(&self) -> Option<DateTime<Utc>> {
        self.oldest
    }

    pub fn has_more(&self) -> bool {
        self.has_more
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.ids.contains(id)
    }

    /// Replace the whole sequence with a freshly fetched newest page, given
    /// in descending fetch order. Sets the cursor to the oldest fetched
    /// timestamp; a short page means history is exhausted.
    pub fn reset_with_latest(&mut self, page_desc: Vec<Message>, page_size: usize) {
        let fetched = page_desc.len();
        self.messages = page_desc;
        self.messages.reverse();
        self.ids = self.messages.iter().map(|m| m.id.clone()).collect();
        self.oldest = self.messages.first().map(|m| m.created_at);
        self.has_more = fetched == page_size;
    }

    /// Prepend a backfilled page of strictly older messages, given in
    /// descending fetch order. Already-known ids are dropped; the cursor
    /// moves to the new oldest timestamp.
    pub fn prepend_older(&mut self, page_desc: Vec<Message>, page_size: usize) {
        let fetched = page_desc.len();
        let mut page = page_desc;
        page.reverse();

        if let Some(first) = page.first() {
            self.oldest = Some(first.created_at);
        }

        let fresh: Vec<Message> = page
            .into_iter()
            .filter(|m| !self.ids.contains(&m.id))
            .collect();
        for message in &fresh {
            self.ids.insert(message.id.clone());
        }
        self.messages.splice(0..0, fresh);

        self.has_more = fetched == page_size;
    }

    /// Insert one realtime message, keeping sort order. Returns false when
    /// the id is already present (the echo of our own insert, or a
    /// redelivered event).
    pub fn apply_insert(&mut self, message: Message) -> bool {
        if self.ids.contains(&message.id) {
            return false;
        }

        let at = self.messages.partition_point(|m| {
            (m.created_at, m.id.as_str()) <= (message.created_at, message.id.as_str())
        });
        self.ids.insert(message.id.clone());
        if self.oldest.is_none() {
            self.oldest = Some(message.created_at);
        }
        self.messages.insert(at, message);
        true
    }

    /// Replace the reactions of a loaded message. Returns false when the
    /// message is outside the loaded window; such updates are dropped, and
    /// the current state arrives with the row when its page is backfilled.
    pub fn apply_reactions(&mut self, id: &MessageId, reactions: Reactions) -> bool {
        match self.messages.iter_mut().find(|m| &m.id == id) {
            Some(message) => {
                message.reactions = reactions;
                true
            },
            None => false,
        }
    }

    /// Drop every loaded message and reset the cursor, as on teardown.
    pub fn clear(&mut self) {
        self.messages.clear();
        self.ids.clear();
        self.oldest = None;
        self.has_more = true;
    }
}
