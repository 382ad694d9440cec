//! Local device storage behind a small key-value port.
//!
//! The trackers never touch a concrete store: drafts, read cursors, and the
//! image cache all go through [`KeyValueStore`], so the backing (in-memory
//! map, sled tree, browser storage in an embedding) is swappable without
//! touching business logic. Writes are last-write-wins from the single UI
//! thread; no locking across processes.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};

use crate::error::StorageError;
use crate::future::lock;
use crate::model::{Channel, ConversationId, UserId};

/// String-keyed, string-valued persistence port.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;
    fn remove(&self, key: &str) -> Result<(), StorageError>;
    fn keys(&self) -> Result<Vec<String>, StorageError>;
}

/// Ephemeral in-memory store, used in tests and sessions without device
/// persistence.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(lock(&self.entries).get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        lock(&self.entries).insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        lock(&self.entries).remove(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, StorageError> {
        Ok(lock(&self.entries).keys().cloned().collect())
    }
}

/// On-disk store backed by a sled tree.
pub struct SledStore {
    db: sled::Db,
}

impl SledStore {
    /// Open (or create) the store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db = sled::open(path).map_err(StorageError::backend)?;
        Ok(Self { db })
    }
}

impl KeyValueStore for SledStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        match self.db.get(key).map_err(StorageError::backend)? {
            Some(bytes) => {
                let value =
                    String::from_utf8(bytes.to_vec()).map_err(StorageError::serialization)?;
                Ok(Some(value))
            },
            None => Ok(None),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.db
            .insert(key, value.as_bytes())
            .map_err(StorageError::backend)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.db.remove(key).map_err(StorageError::backend)?;
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, StorageError> {
        let mut keys = Vec::new();
        for key in self.db.iter().keys() {
            let key = key.map_err(StorageError::backend)?;
            keys.push(String::from_utf8(key.to_vec()).map_err(StorageError::serialization)?);
        }
        Ok(keys)
    }
}

/// Per-channel compose drafts. The caller clears a draft only after a
/// successful send, so a failed send leaves the typed content intact.
pub struct DraftStore {
    kv: Arc<dyn KeyValueStore>,
}

impl DraftStore {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self { kv }
    }

    fn key(channel: &Channel) -> String {
        format!("draft_message_{channel}")
    }

    pub fn load(&self, channel: &Channel) -> Result<Option<String>, StorageError> {
        self.kv.get(&Self::key(channel))
    }

    pub fn save(&self, channel: &Channel, draft: &str) -> Result<(), StorageError> {
        if draft.is_empty() {
            self.kv.remove(&Self::key(channel))
        } else {
            self.kv.set(&Self::key(channel), draft)
        }
    }

    pub fn clear(&self, channel: &Channel) -> Result<(), StorageError> {
        self.kv.remove(&Self::key(channel))
    }
}

/// The per-user read-cursor map: conversation id to the timestamp of the
/// last message the user has seen, stored as one JSON object.
pub struct ReadCursorStore {
    kv: Arc<dyn KeyValueStore>,
    user: UserId,
}

impl ReadCursorStore {
    pub fn new(kv: Arc<dyn KeyValueStore>, user: UserId) -> Self {
        Self { kv, user }
    }

    fn key(&self) -> String {
        format!("dm_last_read_{}", self.user)
    }

    /// Load the cursor map. A missing or corrupt value reads as empty.
    pub fn load(&self) -> BTreeMap<ConversationId, DateTime<Utc>> {
        let Ok(Some(raw)) = self.kv.get(&self.key()) else {
            return BTreeMap::new();
        };
        serde_json::from_str(&raw).unwrap_or_default()
    }

    /// Persist one cursor, keeping the rest of the map.
    pub fn record(
        &self,
        conversation: &ConversationId,
        timestamp: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let mut cursors = self.load();
        cursors.insert(conversation.clone(), timestamp);
        let raw = serde_json::to_string(&cursors).map_err(StorageError::serialization)?;
        self.kv.set(&self.key(), &raw)
    }
}

const IMAGE_INDEX_KEY: &str = "image-cache-index";

/// Bounded cache of fetched images keyed by source url, with
/// oldest-insertion eviction tracked through an index key.
pub struct ImageCache {
    kv: Arc<dyn KeyValueStore>,
    capacity: usize,
}

impl ImageCache {
    pub fn new(kv: Arc<dyn KeyValueStore>, capacity: usize) -> Self {
        Self { kv, capacity }
    }

    fn entry_key(url: &str) -> String {
        format!("image-cache-{url}")
    }

    fn load_index(&self) -> Vec<String> {
        let Ok(Some(raw)) = self.kv.get(IMAGE_INDEX_KEY) else {
            return Vec::new();
        };
        serde_json::from_str(&raw).unwrap_or_default()
    }

    fn store_index(&self, index: &[String]) -> Result<(), StorageError> {
        let raw = serde_json::to_string(index).map_err(StorageError::serialization)?;
        self.kv.set(IMAGE_INDEX_KEY, &raw)
    }

    pub fn get(&self, url: &str) -> Result<Option<String>, StorageError> {
        self.kv.get(&Self::entry_key(url))
    }

    /// Store an entry, evicting the oldest entries beyond capacity.
    pub fn put(&self, url: &str, data: &str) -> Result<(), StorageError> {
        let mut index = self.load_index();
        if !index.iter().any(|known| known == url) {
            index.push(url.to_owned());
            while index.len() > self.capacity {
                let evicted = index.remove(0);
                self.kv.remove(&Self::entry_key(&evicted))?;
            }
            self.store_index(&index)?;
        }
        self.kv.set(&Self::entry_key(url), data)
    }
}
