//! Process-lifetime cache of user profiles.
//!
//! Profiles are fetched once per unseen id and kept for the lifetime of the
//! directory; users-table events refresh entries already tracked. Entries
//! are never dropped on inactivity, which avoids refetching when a user
//! comes back within the same session.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};

use serde_json::{json, Value};
use tracing::debug;

use crate::error::Result;
use crate::future::lock;
use crate::gateway::{self, ChangeEvent, Filter, Gateway, Table};
use crate::model::{UserId, UserProfile};
use crate::subs::{SubscriptionGuard, SubscriptionManager};

pub struct ProfileDirectory<G: Gateway> {
    weak: Weak<Self>,
    gateway: Arc<G>,
    cache: Mutex<HashMap<UserId, UserProfile>>,
    /// Ids ever requested, hit or miss, so absent rows are not refetched
    /// on every resolve.
    fetched: Mutex<HashSet<UserId>>,
    subscription: Mutex<Option<SubscriptionGuard<G>>>,
}

impl<G: Gateway> ProfileDirectory<G> {
    pub fn new(gateway: Arc<G>) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            gateway,
            cache: Mutex::new(HashMap::new()),
            fetched: Mutex::new(HashSet::new()),
            subscription: Mutex::new(None),
        })
    }

    /// Subscribe to users-table changes so cached profiles stay current.
    pub async fn start(&self, subs: &SubscriptionManager<G>) -> Result<()> {
        let weak = self.weak.clone();
        let guard = subs
            .subscribe(
                Table::Users,
                Arc::new(move |event| {
                    if let Some(directory) = weak.upgrade() {
                        directory.apply_user_event(event);
                    }
                }),
            )
            .await?;
        *lock(&self.subscription) = Some(guard);
        Ok(())
    }

    /// Profiles for `ids` in input order, fetching only never-seen ids in
    /// one batch query. Ids with no profile row are silently omitted.
    pub async fn resolve(&self, ids: &[UserId]) -> Result<Vec<UserProfile>> {
        let missing: Vec<UserId> = {
            let cache = lock(&self.cache);
            let fetched = lock(&self.fetched);
            let mut seen = HashSet::new();
            ids.iter()
                .filter(|id| !fetched.contains(*id) && !cache.contains_key(*id))
                .filter(|id| seen.insert((*id).clone()))
                .cloned()
                .collect()
        };

        if !missing.is_empty() {
            let values: Vec<Value> = missing.iter().map(|id| json!(id)).collect();
            let rows = self
                .gateway
                .query(Table::Users, &[Filter::AnyOf("id", values)], None, None)
                .await?;
            let profiles: Vec<UserProfile> = gateway::decode_rows(&rows)?;
            {
                let mut cache = lock(&self.cache);
                for profile in profiles {
                    cache.insert(profile.id.clone(), profile);
                }
            }
            let mut fetched = lock(&self.fetched);
            for id in missing {
                fetched.insert(id);
            }
        }

        let cache = lock(&self.cache);
        Ok(ids.iter().filter_map(|id| cache.get(id).cloned()).collect())
    }

    /// The cached profile for one user, if any.
    pub fn cached(&self, id: &UserId) -> Option<UserProfile> {
        lock(&self.cache).get(id).cloned()
    }

    /// Drop the realtime subscription.
    pub fn stop(&self) {
        *lock(&self.subscription) = None;
    }

    /// Refresh a tracked profile from a users-table event. Unseen users
    /// are left for the next resolve.
    fn apply_user_event(&self, event: &ChangeEvent) {
        let profile: UserProfile = match gateway::decode_row(&event.row) {
            Ok(profile) => profile,
            Err(err) => {
                debug!("ignoring undecodable user event: {err}");
                return;
            },
        };
        let mut cache = lock(&self.cache);
        if let Some(entry) = cache.get_mut(&profile.id) {
            *entry = profile;
        }
    }
}
