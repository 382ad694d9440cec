//! Shared realtime subscriptions, reference counted per table.
//!
//! The first subscriber on a table opens the underlying gateway feed and a
//! pump task; later subscribers share them. Each subscriber holds a guard
//! that deregisters its callback on drop, and dropping the last guard tears
//! the feed down. `resubscribe` reopens a table's feed in place — the
//! recovery step used by the retrying send path and by refresh — without
//! disturbing registered callbacks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

use crate::error::GatewayError;
use crate::future::lock;
use crate::gateway::{ChangeEvent, ChangeFeed, EventMask, Gateway, Table};

/// Callback invoked for every event on a subscribed table.
pub type ChangeCallback = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

struct TableFeed {
    subscribers: HashMap<Uuid, ChangeCallback>,
    handle: Option<crate::gateway::SubscriptionHandle>,
    pump: Option<JoinHandle<()>>,
}

impl TableFeed {
    fn teardown(mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        if let Some(handle) = self.handle.take() {
            handle.unsubscribe();
        }
    }
}

pub struct SubscriptionManager<G: Gateway> {
    weak: Weak<Self>,
    gateway: Arc<G>,
    tables: Mutex<HashMap<Table, TableFeed>>,
}

impl<G: Gateway> SubscriptionManager<G> {
    pub fn new(gateway: Arc<G>) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            gateway,
            tables: Mutex::new(HashMap::new()),
        })
    }

    /// Register a callback for a table's change events, opening the
    /// underlying feed if this is the table's first subscriber.
    pub async fn subscribe(
        &self,
        table: Table,
        callback: ChangeCallback,
    ) -> Result<SubscriptionGuard<G>, GatewayError> {
        let id = Uuid::new_v4();

        if self.try_join(table, id, callback.clone()) {
            return Ok(self.guard(table, id));
        }

        let feed = self.gateway.subscribe(table, EventMask::All).await?;

        let mut tables = lock(&self.tables);
        match tables.get_mut(&table) {
            // Another subscriber opened the feed while ours was in flight;
            // join theirs and drop the extra feed.
            Some(entry) => {
                entry.subscribers.insert(id, callback);
                drop(tables);
                feed.handle.unsubscribe();
            },
            None => {
                let pump = self.spawn_pump(table, feed.events);
                let mut subscribers = HashMap::new();
                subscribers.insert(id, callback);
                tables.insert(
                    table,
                    TableFeed {
                        subscribers,
                        handle: Some(feed.handle),
                        pump: Some(pump),
                    },
                );
            },
        }

        Ok(self.guard(table, id))
    }

    /// Tear down and reopen a table's feed, keeping its subscribers. A
    /// table with no subscribers is left alone.
    pub async fn resubscribe(&self, table: Table) -> Result<(), GatewayError> {
        if !lock(&self.tables).contains_key(&table) {
            return Ok(());
        }

        debug!(%table, "reopening realtime feed");
        let feed = self.gateway.subscribe(table, EventMask::All).await?;

        let mut tables = lock(&self.tables);
        match tables.get_mut(&table) {
            Some(entry) => {
                if let Some(pump) = entry.pump.take() {
                    pump.abort();
                }
                let old_handle = entry.handle.replace(feed.handle);
                entry.pump = Some(self.spawn_pump(table, feed.events));
                drop(tables);
                if let Some(handle) = old_handle {
                    handle.unsubscribe();
                }
            },
            // Last subscriber left while the new feed was opening.
            None => {
                drop(tables);
                feed.handle.unsubscribe();
            },
        }
        Ok(())
    }

    /// Number of registered subscribers on a table.
    pub fn subscriber_count(&self, table: Table) -> usize {
        lock(&self.tables)
            .get(&table)
            .map_or(0, |entry| entry.subscribers.len())
    }

    fn try_join(&self, table: Table, id: Uuid, callback: ChangeCallback) -> bool {
        let mut tables = lock(&self.tables);
        match tables.get_mut(&table) {
            Some(entry) => {
                entry.subscribers.insert(id, callback);
                true
            },
            None => false,
        }
    }

    fn guard(&self, table: Table, id: Uuid) -> SubscriptionGuard<G> {
        SubscriptionGuard { manager: self.weak.clone(), table, id }
    }

    fn spawn_pump(
        &self,
        table: Table,
        mut events: crate::future::ChangeStream<ChangeEvent>,
    ) -> JoinHandle<()> {
        let manager = self.weak.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                let callbacks: Vec<ChangeCallback> = {
                    let tables = lock(&manager.tables);
                    match tables.get(&table) {
                        Some(entry) => entry.subscribers.values().cloned().collect(),
                        None => break,
                    }
                };
                for callback in callbacks {
                    callback(&event);
                }
            }
            debug!(%table, "realtime feed ended");
        })
    }

    fn remove_subscriber(&self, table: Table, id: Uuid) {
        let mut tables = lock(&self.tables);
        let Some(entry) = tables.get_mut(&table) else {
            return;
        };
        entry.subscribers.remove(&id);
        if entry.subscribers.is_empty() {
            if let Some(feed) = tables.remove(&table) {
                drop(tables);
                debug!(%table, "last subscriber left, closing feed");
                feed.teardown();
            }
        }
    }
}

/// Keeps one callback registered; dropping it deregisters, and the last
/// guard on a table closes the shared feed.
pub struct SubscriptionGuard<G: Gateway> {
    manager: Weak<SubscriptionManager<G>>,
    table: Table,
    id: Uuid,
}

impl<G: Gateway> Drop for SubscriptionGuard<G> {
    fn drop(&mut self) {
        if let Some(manager) = self.manager.upgrade() {
            manager.remove_subscriber(self.table, self.id);
        }
    }
}
