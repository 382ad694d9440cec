//! Unread conversations and transient DM previews.
//!
//! Unread state is a comparison between each conversation's `updated_at`
//! and the locally persisted read cursor. Marking as read is local-first:
//! the cursor is persisted on the device and the remote sync is
//! fire-and-forget, so other devices converge eventually.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{instrument, warn};

use crate::config::Config;
use crate::error::{Error, NotifyError, Result};
use crate::future::{lock, spawn_logged};
use crate::gateway::{self, ChangeEvent, Filter, Gateway, Procedure, Table};
use crate::kv::{KeyValueStore, ReadCursorStore};
use crate::model::{Conversation, ConversationId, UserId};
use crate::subs::{SubscriptionGuard, SubscriptionManager};

/// Transient preview of a newly arrived DM, shown as a toast.
#[derive(Debug, Clone, PartialEq)]
pub struct DmPreview {
    pub conversation_id: ConversationId,
    pub sender_name: String,
    pub content: String,
}

struct NotifyState {
    unread: HashSet<ConversationId>,
    preview: Option<DmPreview>,
    /// Monotonic preview generation; a scheduled clear only fires for the
    /// generation it was scheduled with.
    preview_seq: u64,
}

pub struct UnreadTracker<G: Gateway> {
    weak: Weak<Self>,
    gateway: Arc<G>,
    subs: Arc<SubscriptionManager<G>>,
    user: UserId,
    cursors: ReadCursorStore,
    cursor_cache: Mutex<BTreeMap<ConversationId, DateTime<Utc>>>,
    state: Mutex<NotifyState>,
    revision: watch::Sender<u64>,
    subscription: Mutex<Option<SubscriptionGuard<G>>>,
    preview_task: Mutex<Option<JoinHandle<()>>>,
    preview_ttl: Duration,
}

impl<G: Gateway> UnreadTracker<G> {
    pub fn new(
        gateway: Arc<G>,
        subs: Arc<SubscriptionManager<G>>,
        kv: Arc<dyn KeyValueStore>,
        user: UserId,
        config: &Config,
    ) -> Arc<Self> {
        let (revision, _) = watch::channel(0);
        let cursors = ReadCursorStore::new(kv, user.clone());
        Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            gateway,
            subs,
            user,
            cursors,
            cursor_cache: Mutex::new(BTreeMap::new()),
            state: Mutex::new(NotifyState {
                unread: HashSet::new(),
                preview: None,
                preview_seq: 0,
            }),
            revision,
            subscription: Mutex::new(None),
            preview_task: Mutex::new(None),
            preview_ttl: config.preview_ttl(),
        })
    }

    /// Load the cursor map, snapshot the unread set from the user's
    /// conversations, and subscribe to conversation changes. No messages
    /// are fetched; the snapshot is a pure timestamp comparison.
    #[instrument(skip(self), level = "debug")]
    pub async fn start(&self) -> Result<()> {
        *lock(&self.cursor_cache) = self.cursors.load();

        let rows = self
            .gateway
            .query(
                Table::Conversations,
                &[Filter::EitherEq("user1_id", "user2_id", json!(self.user))],
                None,
                None,
            )
            .await
            .map_err(|err| NotifyError::Snapshot(err.to_string()))?;

        let mut unread = HashSet::new();
        {
            let cursors = lock(&self.cursor_cache);
            for row in &rows {
                let conversation: Conversation = match gateway::decode_row(row) {
                    Ok(conversation) => conversation,
                    Err(err) => {
                        warn!("skipping undecodable conversation row: {err}");
                        continue;
                    },
                };
                if Self::is_past_cursor(&cursors, &conversation.id, conversation.updated_at) {
                    unread.insert(conversation.id);
                }
            }
        }
        lock(&self.state).unread = unread;
        self.bump();

        let weak = self.weak.clone();
        let guard = self
            .subs
            .subscribe(
                Table::Conversations,
                Arc::new(move |event| {
                    if let Some(tracker) = weak.upgrade() {
                        tracker.apply_event(event);
                    }
                }),
            )
            .await?;
        *lock(&self.subscription) = Some(guard);
        Ok(())
    }

    /// Mark a conversation read as of `timestamp`: drop it from the unread
    /// set, persist the cursor locally, and sync the read position to the
    /// backend without waiting on it.
    #[instrument(skip(self), level = "debug", fields(conversation = %conversation))]
    pub fn mark_as_read(
        &self,
        conversation: &ConversationId,
        timestamp: DateTime<Utc>,
    ) -> Result<()> {
        lock(&self.state).unread.remove(conversation);
        self.bump();

        lock(&self.cursor_cache).insert(conversation.clone(), timestamp);
        self.cursors.record(conversation, timestamp)?;

        let remote = self.gateway.clone();
        let args = gateway::row(json!({
            "conversation_id": conversation,
            "user_id": self.user,
            "read_at": timestamp,
        }));
        spawn_logged("read-cursor sync", async move {
            remote
                .call(Procedure::UpdateReadCursor, args)
                .await
                .map(|_| ())
                .map_err(Error::from)
        });
        Ok(())
    }

    /// Conversation ids currently unread, in stable order.
    pub fn unread_conversations(&self) -> Vec<ConversationId> {
        let mut ids: Vec<ConversationId> = lock(&self.state).unread.iter().cloned().collect();
        ids.sort();
        ids
    }

    pub fn has_unread(&self) -> bool {
        !lock(&self.state).unread.is_empty()
    }

    pub fn is_unread(&self, conversation: &ConversationId) -> bool {
        lock(&self.state).unread.contains(conversation)
    }

    /// The preview currently on screen, if its display window has not
    /// elapsed.
    pub fn preview(&self) -> Option<DmPreview> {
        lock(&self.state).preview.clone()
    }

    /// Receiver that changes whenever unread state or the preview does.
    pub fn watch_revision(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    /// Drop the subscription and any pending preview clear.
    pub fn stop(&self) {
        *lock(&self.subscription) = None;
        if let Some(task) = lock(&self.preview_task).take() {
            task.abort();
        }
    }

    fn bump(&self) {
        self.revision.send_modify(|revision| *revision = revision.wrapping_add(1));
    }

    fn is_past_cursor(
        cursors: &BTreeMap<ConversationId, DateTime<Utc>>,
        conversation: &ConversationId,
        updated_at: DateTime<Utc>,
    ) -> bool {
        cursors
            .get(conversation)
            .is_none_or(|read_at| updated_at > *read_at)
    }

    /// A conversation row changed: if its newest message is from someone
    /// else and past our cursor, mark unread and surface a preview.
    fn apply_event(&self, event: &ChangeEvent) {
        let conversation: Conversation = match gateway::decode_row(&event.row) {
            Ok(conversation) => conversation,
            Err(err) => {
                warn!("ignoring undecodable conversation event: {err}");
                return;
            },
        };
        let Some(last) = conversation.last_message() else {
            return;
        };
        if last.author_id == self.user {
            return;
        }
        {
            let cursors = lock(&self.cursor_cache);
            if !Self::is_past_cursor(&cursors, &conversation.id, conversation.updated_at) {
                return;
            }
        }

        let (_, other_name) = conversation.other_participant(&self.user);
        let sender_name = if other_name.is_empty() {
            last.author_name.clone()
        } else {
            other_name.to_owned()
        };

        let seq = {
            let mut state = lock(&self.state);
            state.unread.insert(conversation.id.clone());
            state.preview_seq += 1;
            state.preview = Some(DmPreview {
                conversation_id: conversation.id.clone(),
                sender_name,
                content: last.content.clone(),
            });
            state.preview_seq
        };
        self.bump();
        self.schedule_preview_clear(seq);
    }

    /// Clear the preview after its display window unless a newer preview
    /// superseded it in the meantime.
    fn schedule_preview_clear(&self, seq: u64) {
        let weak = self.weak.clone();
        let ttl = self.preview_ttl;
        let task = tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            let Some(tracker) = weak.upgrade() else {
                return;
            };
            let cleared = {
                let mut state = lock(&tracker.state);
                if state.preview_seq == seq && state.preview.is_some() {
                    state.preview = None;
                    true
                } else {
                    false
                }
            };
            if cleared {
                tracker.bump();
            }
        });
        if let Some(previous) = lock(&self.preview_task).replace(task) {
            previous.abort();
        }
    }
}
