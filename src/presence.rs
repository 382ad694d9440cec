//! Presence: heartbeat emission and the active-user set.
//!
//! The tracker beats on a fixed interval and on every revalidate dispatch,
//! and derives the active set from one snapshot query plus per-user
//! recomputation on users-table events. A user who stops heartbeating
//! without a further table event stays in the set until the next snapshot;
//! there is no local expiry sweep.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{instrument, warn};

use crate::bus::{RefreshBus, RefreshGuard};
use crate::config::Config;
use crate::error::{PresenceError, Result};
use crate::future::lock;
use crate::gateway::{ChangeEvent, Filter, Gateway, Procedure, Row, Table};
use crate::model::UserId;
use crate::subs::{SubscriptionGuard, SubscriptionManager};

pub struct PresenceTracker<G: Gateway> {
    weak: Weak<Self>,
    gateway: Arc<G>,
    subs: Arc<SubscriptionManager<G>>,
    active: Mutex<HashSet<UserId>>,
    revision: watch::Sender<u64>,
    heartbeat_task: Mutex<Option<JoinHandle<()>>>,
    subscription: Mutex<Option<SubscriptionGuard<G>>>,
    bus_guard: Mutex<Option<RefreshGuard>>,
    interval: Duration,
    window: chrono::Duration,
    retry_delay: Duration,
}

impl<G: Gateway> PresenceTracker<G> {
    pub fn new(gateway: Arc<G>, subs: Arc<SubscriptionManager<G>>, config: &Config) -> Arc<Self> {
        let (revision, _) = watch::channel(0);
        let retry_delay = config
            .retry_delays()
            .first()
            .copied()
            .unwrap_or(Duration::from_millis(300));
        Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            gateway,
            subs,
            active: Mutex::new(HashSet::new()),
            revision,
            heartbeat_task: Mutex::new(None),
            subscription: Mutex::new(None),
            bus_guard: Mutex::new(None),
            interval: config.heartbeat_interval(),
            window: config.active_window(),
            retry_delay,
        })
    }

    /// Beat once, start the interval task, take the active-set snapshot,
    /// and subscribe to users-table changes.
    #[instrument(skip(self), level = "debug")]
    pub async fn start(&self) -> Result<()> {
        self.heartbeat().await;

        let weak = self.weak.clone();
        let interval = self.interval;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick fires immediately; the initial beat already
            // went out above.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(tracker) = weak.upgrade() else {
                    break;
                };
                tracker.heartbeat().await;
            }
        });
        if let Some(previous) = lock(&self.heartbeat_task).replace(task) {
            previous.abort();
        }

        let since = Utc::now() - self.window;
        let rows = self
            .gateway
            .query(Table::Users, &[Filter::Since("last_active", since)], None, None)
            .await
            .map_err(|err| PresenceError::Snapshot(err.to_string()))?;
        let mut snapshot = HashSet::new();
        for row in &rows {
            if let Some(id) = row.get("id").and_then(Value::as_str) {
                snapshot.insert(UserId::new(id));
            }
        }
        *lock(&self.active) = snapshot;
        self.bump();

        let weak = self.weak.clone();
        let guard = self
            .subs
            .subscribe(
                Table::Users,
                Arc::new(move |event| {
                    if let Some(tracker) = weak.upgrade() {
                        tracker.apply_user_event(event);
                    }
                }),
            )
            .await?;
        *lock(&self.subscription) = Some(guard);
        Ok(())
    }

    /// Beat on every revalidate dispatch while attached.
    pub fn attach_bus(&self, bus: &RefreshBus) {
        let weak = self.weak.clone();
        let guard = bus.register(Arc::new(move || {
            if let Some(tracker) = weak.upgrade() {
                tokio::spawn(async move {
                    tracker.heartbeat().await;
                });
            }
        }));
        *lock(&self.bus_guard) = Some(guard);
    }

    /// Refresh the current user's last-active timestamp. Best-effort: one
    /// retry after a short pause and a session refresh, then give up with
    /// a warning.
    pub async fn heartbeat(&self) {
        if let Err(err) = self.gateway.call(Procedure::Heartbeat, Row::new()).await {
            warn!("heartbeat failed: {err}; retrying once");
            tokio::time::sleep(self.retry_delay).await;
            if let Err(err) = self.gateway.refresh_session().await {
                warn!("session refresh before heartbeat retry failed: {err}");
            }
            if let Err(err) = self.gateway.call(Procedure::Heartbeat, Row::new()).await {
                warn!("heartbeat retry failed: {err}");
            }
        }
    }

    /// Users with a heartbeat inside the trailing window, as of the last
    /// snapshot or table event.
    pub fn active_users(&self) -> HashSet<UserId> {
        lock(&self.active).clone()
    }

    pub fn is_active(&self, user: &UserId) -> bool {
        lock(&self.active).contains(user)
    }

    /// Receiver that changes whenever the active set does.
    pub fn watch_revision(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    /// Stop the interval task and drop the subscriptions.
    pub fn stop(&self) {
        if let Some(task) = lock(&self.heartbeat_task).take() {
            task.abort();
        }
        *lock(&self.subscription) = None;
        *lock(&self.bus_guard) = None;
    }

    fn bump(&self) {
        self.revision.send_modify(|revision| *revision = revision.wrapping_add(1));
    }

    /// Recompute a single user's membership from a users-table event and
    /// merge it into the set, without a full requery.
    fn apply_user_event(&self, event: &ChangeEvent) {
        let Some(id) = event.row.get("id").and_then(Value::as_str) else {
            return;
        };
        let last_active = event
            .row
            .get("last_active")
            .and_then(Value::as_str)
            .and_then(|raw| raw.parse::<chrono::DateTime<Utc>>().ok());
        let active_now = last_active.is_some_and(|ts| ts > Utc::now() - self.window);

        let user = UserId::new(id);
        let changed = {
            let mut active = lock(&self.active);
            if active_now {
                active.insert(user)
            } else {
                active.remove(&user)
            }
        };
        if changed {
            self.bump();
        }
    }
}
