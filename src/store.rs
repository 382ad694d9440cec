//! Per-channel message store.
//!
//! One store owns one channel's history: newest-page initial load, backward
//! backfill, exactly-once reconciliation of realtime events, and send with
//! bounded escalating retry. Renderers read snapshots and watch a revision
//! counter; they never hold references into the store's state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::sync::watch;
use tracing::{debug, instrument, warn};

use crate::bus::{RefreshBus, RefreshGuard};
use crate::config::{Config, PAGE_SIZE};
use crate::error::{ChannelError, Error, GatewayError, Result};
use crate::future::{lock, spawn_logged};
use crate::gateway::{self, ChangeEvent, EventKind, Filter, Gateway, Order, Procedure, Row, Table};
use crate::model::{Author, Channel, Message, MessageId, UserId};
use crate::retry::RetryPolicy;
use crate::sequence::MessageSequence;
use crate::subs::{SubscriptionGuard, SubscriptionManager};

/// Lifecycle of a channel's history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No load attempted yet.
    Idle,
    /// Initial page fetch in flight.
    Loading,
    /// Sequence is live and receiving realtime events.
    Ready,
    /// Initial load failed; the caller retries explicitly.
    Failed,
}

struct StoreState {
    sequence: MessageSequence,
    phase: Phase,
    /// Guard flag against concurrent backfills. A flag, not a lock:
    /// execution is cooperative.
    loading_older: bool,
    sending: bool,
    last_error: Option<String>,
}

impl StoreState {
    fn new() -> Self {
        Self {
            sequence: MessageSequence::new(),
            phase: Phase::Idle,
            loading_older: false,
            sending: false,
            last_error: None,
        }
    }
}

pub struct MessageStore<G: Gateway> {
    weak: Weak<Self>,
    gateway: Arc<G>,
    subs: Arc<SubscriptionManager<G>>,
    channel: Channel,
    state: Mutex<StoreState>,
    /// Bumped on close/refresh teardown; in-flight fetches from an older
    /// epoch discard their results instead of applying them.
    epoch: AtomicU64,
    revision: watch::Sender<u64>,
    subscription: Mutex<Option<SubscriptionGuard<G>>>,
    refresh_guard: Mutex<Option<RefreshGuard>>,
    retry: RetryPolicy,
    page_size: usize,
}

impl<G: Gateway> MessageStore<G> {
    pub fn new(
        gateway: Arc<G>,
        subs: Arc<SubscriptionManager<G>>,
        channel: Channel,
        config: &Config,
    ) -> Arc<Self> {
        let (revision, _) = watch::channel(0);
        Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            gateway,
            subs,
            channel,
            state: Mutex::new(StoreState::new()),
            epoch: AtomicU64::new(0),
            revision,
            subscription: Mutex::new(None),
            refresh_guard: Mutex::new(None),
            retry: RetryPolicy::new(config.retry_delays()),
            page_size: PAGE_SIZE,
        })
    }

    /// Subscribe to the channel's realtime feed and load the newest page.
    #[instrument(skip(self), level = "debug", fields(channel = %self.channel))]
    pub async fn open(&self) -> Result<()> {
        let weak = self.weak.clone();
        let guard = self
            .subs
            .subscribe(
                self.channel.table(),
                Arc::new(move |event| {
                    if let Some(store) = weak.upgrade() {
                        store.apply_change(event);
                    }
                }),
            )
            .await?;
        *lock(&self.subscription) = Some(guard);

        self.load_latest().await
    }

    /// Register for revalidate dispatches while the store is open.
    pub fn attach_bus(&self, bus: &RefreshBus) {
        let weak = self.weak.clone();
        let guard = bus.register(Arc::new(move || {
            if let Some(store) = weak.upgrade() {
                tokio::spawn(async move {
                    if let Err(err) = store.refresh().await {
                        warn!("revalidate refresh failed: {err}");
                    }
                });
            }
        }));
        *lock(&self.refresh_guard) = Some(guard);
    }

    /// Fetch the newest page and replace the in-memory sequence. Safe to
    /// call repeatedly; each call is a full snapshot, not a merge.
    #[instrument(skip(self), level = "debug", fields(channel = %self.channel))]
    pub async fn load_latest(&self) -> Result<()> {
        let epoch = self.epoch.load(Ordering::SeqCst);
        {
            let mut state = lock(&self.state);
            state.phase = Phase::Loading;
            state.last_error = None;
        }
        self.bump();

        let fetched = self.fetch_page(None).await;
        if self.epoch.load(Ordering::SeqCst) != epoch {
            debug!("discarding stale initial load");
            return Ok(());
        }

        match fetched {
            Ok(page) => {
                {
                    let mut state = lock(&self.state);
                    state.sequence.reset_with_latest(page, self.page_size);
                    state.phase = Phase::Ready;
                }
                self.bump();
                self.touch_presence();
                Ok(())
            },
            Err(err) => {
                let reason = err.to_string();
                {
                    let mut state = lock(&self.state);
                    state.phase = Phase::Failed;
                    state.last_error = Some(reason.clone());
                }
                self.bump();
                Err(ChannelError::LoadFailed(reason).into())
            },
        }
    }

    /// Backfill one page of older history. A no-op while another backfill
    /// is in flight, when history is exhausted, or before the initial load
    /// set a cursor. Not retried automatically on failure.
    #[instrument(skip(self), level = "debug", fields(channel = %self.channel))]
    pub async fn load_older(&self) -> Result<()> {
        let epoch = self.epoch.load(Ordering::SeqCst);
        let cursor = {
            let mut state = lock(&self.state);
            if state.loading_older || !state.sequence.has_more() {
                return Ok(());
            }
            let Some(cursor) = state.sequence.cursor() else {
                return Ok(());
            };
            state.loading_older = true;
            cursor
        };
        self.bump();

        let fetched = self.fetch_page(Some(cursor)).await;
        if self.epoch.load(Ordering::SeqCst) != epoch {
            debug!("discarding stale backfill");
            lock(&self.state).loading_older = false;
            return Ok(());
        }

        match fetched {
            Ok(page) => {
                {
                    let mut state = lock(&self.state);
                    state.sequence.prepend_older(page, self.page_size);
                    state.loading_older = false;
                }
                self.bump();
                self.touch_presence();
                Ok(())
            },
            Err(err) => {
                let reason = err.to_string();
                {
                    let mut state = lock(&self.state);
                    state.loading_older = false;
                    state.last_error = Some(reason.clone());
                }
                self.bump();
                Err(ChannelError::LoadFailed(reason).into())
            },
        }
    }

    /// Send a message. Up to three attempts with escalating recovery in
    /// between: reopen the realtime feed, then refresh the auth session.
    /// On terminal failure the caller keeps its draft; nothing was
    /// appended locally. The message itself arrives through the insert
    /// echo or the realtime feed, deduplicated by id.
    #[instrument(skip(self, content, author), level = "debug", fields(channel = %self.channel))]
    pub async fn send(&self, content: &str, author: &Author) -> Result<()> {
        let content = content.trim();
        if content.is_empty() {
            return Err(ChannelError::EmptyMessage.into());
        }

        {
            let mut state = lock(&self.state);
            state.sending = true;
        }
        self.bump();

        let attempts = self.retry.attempts();
        let mut last_error: Option<GatewayError> = None;
        for attempt in 1..=attempts {
            match self.try_send(content, author).await {
                Ok(()) => {
                    {
                        let mut state = lock(&self.state);
                        state.sending = false;
                        state.last_error = None;
                    }
                    self.bump();
                    self.touch_presence();
                    return Ok(());
                },
                Err(err) => {
                    warn!(attempt, "send attempt failed: {err}");
                    last_error = Some(err);
                },
            }
            if let Some(delay) = self.retry.delay_after(attempt) {
                tokio::time::sleep(delay).await;
                self.recover(attempt).await;
            }
        }

        let reason = last_error.map_or_else(String::new, |err| err.to_string());
        {
            let mut state = lock(&self.state);
            state.sending = false;
            state.last_error = Some(reason.clone());
        }
        self.bump();
        Err(ChannelError::SendFailed { attempts, reason }.into())
    }

    /// Toggle the current user's reaction on a message. No optimistic
    /// local mutation: the new state arrives with the UPDATE echo, so a
    /// failure reverts nothing.
    #[instrument(skip(self), level = "debug", fields(channel = %self.channel))]
    pub async fn toggle_reaction(
        &self,
        message: &MessageId,
        emoji: &str,
        user: &UserId,
    ) -> Result<()> {
        let args = gateway::row(json!({
            "message_id": message,
            "emoji": emoji,
            "user_id": user,
        }));
        self.gateway.call(Procedure::ToggleReaction, args).await?;
        Ok(())
    }

    /// Reopen the realtime feed and reload the newest page. Dispatched on
    /// focus/visibility revalidate and after reconnects.
    #[instrument(skip(self), level = "debug", fields(channel = %self.channel))]
    pub async fn refresh(&self) -> Result<()> {
        if let Err(err) = self.subs.resubscribe(self.channel.table()).await {
            warn!("resubscribe during refresh failed: {err}");
        }
        self.load_latest().await
    }

    /// Tear the store down: cancel the realtime subscription, invalidate
    /// in-flight fetches, and drop the loaded history.
    pub fn close(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        *lock(&self.subscription) = None;
        *lock(&self.refresh_guard) = None;
        *lock(&self.state) = StoreState::new();
        self.bump();
    }

    /// Snapshot of the loaded messages in ascending order.
    pub fn messages(&self) -> Vec<Message> {
        lock(&self.state).sequence.messages().to_vec()
    }

    pub fn phase(&self) -> Phase {
        lock(&self.state).phase
    }

    pub fn has_more(&self) -> bool {
        lock(&self.state).sequence.has_more()
    }

    pub fn cursor(&self) -> Option<DateTime<Utc>> {
        lock(&self.state).sequence.cursor()
    }

    pub fn is_loading_older(&self) -> bool {
        lock(&self.state).loading_older
    }

    pub fn is_sending(&self) -> bool {
        lock(&self.state).sending
    }

    pub fn last_error(&self) -> Option<String> {
        lock(&self.state).last_error.clone()
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Receiver that changes whenever the store's state does.
    pub fn watch_revision(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    fn bump(&self) {
        self.revision.send_modify(|revision| *revision = revision.wrapping_add(1));
    }

    /// Reconcile one realtime event into the sequence.
    fn apply_change(&self, event: &ChangeEvent) {
        if !self.channel.owns_row(&event.row) {
            return;
        }
        let message: Message = match gateway::decode_row(&event.row) {
            Ok(message) => message,
            Err(err) => {
                warn!(kind = ?event.kind, "ignoring undecodable change event: {err}");
                return;
            },
        };

        let changed = {
            let mut state = lock(&self.state);
            match event.kind {
                EventKind::Insert => state.sequence.apply_insert(message),
                EventKind::Update => {
                    state.sequence.apply_reactions(&message.id, message.reactions)
                },
            }
        };
        if changed {
            self.bump();
        }
    }

    async fn fetch_page(
        &self,
        before: Option<DateTime<Utc>>,
    ) -> std::result::Result<Vec<Message>, GatewayError> {
        let mut filters = self.channel.filters();
        if let Some(cursor) = before {
            filters.push(Filter::Before("created_at", cursor));
        }
        let rows = self
            .gateway
            .query(
                self.channel.table(),
                &filters,
                Some(Order::desc("created_at")),
                Some(self.page_size),
            )
            .await?;
        gateway::decode_rows(&rows)
    }

    async fn try_send(
        &self,
        content: &str,
        author: &Author,
    ) -> std::result::Result<(), GatewayError> {
        match &self.channel {
            Channel::Group => {
                let row = gateway::row(json!({
                    "content": content,
                    "user_id": author.id,
                    "user_name": author.name,
                    "avatar_color": author.avatar_color,
                    "avatar_url": author.avatar_url,
                }));
                let echoed = self.gateway.insert(Table::Messages, row).await?;
                self.reconcile_echo(&echoed);
                Ok(())
            },
            Channel::Direct(conversation) => {
                let args = gateway::row(json!({
                    "conversation_id": conversation,
                    "sender_id": author.id,
                    "content": content,
                }));
                let result = self.gateway.call(Procedure::AppendDmMessage, args).await?;
                if let Value::Object(echoed) = result {
                    self.reconcile_echo(&echoed);
                }
                Ok(())
            },
        }
    }

    /// Apply the synchronous insert response so the message is visible even
    /// before the realtime echo; the echo then dedups by id.
    fn reconcile_echo(&self, row: &Row) {
        match gateway::decode_row::<Message>(row) {
            Ok(message) => {
                let inserted = lock(&self.state).sequence.apply_insert(message);
                if inserted {
                    self.bump();
                }
            },
            Err(err) => debug!("insert echo not reconcilable: {err}"),
        }
    }

    /// Escalating recovery between send attempts: first reopen the realtime
    /// feed, then refresh the auth session.
    async fn recover(&self, failed_attempt: usize) {
        if failed_attempt == 1 {
            debug!("reopening realtime feed before retry");
            if let Err(err) = self.subs.resubscribe(self.channel.table()).await {
                warn!("resubscribe failed during send recovery: {err}");
            }
        } else {
            debug!("refreshing session before retry");
            if let Err(err) = self.gateway.refresh_session().await {
                warn!("session refresh failed during send recovery: {err}");
            }
        }
    }

    /// Best-effort heartbeat after a successful fetch or send. Never fails
    /// the primary operation.
    fn touch_presence(&self) {
        let gateway = self.gateway.clone();
        spawn_logged("presence heartbeat", async move {
            gateway
                .call(Procedure::Heartbeat, Row::new())
                .await
                .map(|_| ())
                .map_err(Error::from)
        });
    }
}
