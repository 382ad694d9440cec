//! Client-side synchronization core for a realtime group-chat and
//! direct-message product.
//!
//! The crate keeps an in-memory message timeline consistent with a remote
//! append-only log: newest-first initial load, older-page backfill on
//! demand, exactly-once reconciliation of realtime change events, and send
//! with bounded escalating retry. Smaller trackers maintain the active-user
//! set and per-conversation unread state, with read cursors persisted
//! through a small key-value port. Everything is written against the
//! [`gateway::Gateway`] contract; rendering and the backend itself live
//! elsewhere.

pub mod bus;
pub mod config;
pub mod dms;
pub mod error;
pub mod future;
pub mod gateway;
pub mod kv;
pub mod model;
pub mod notify;
pub mod presence;
pub mod profiles;
pub mod retry;
pub mod sequence;
pub mod store;
pub mod subs;

pub use bus::RefreshBus;
pub use config::{Config, PAGE_SIZE, QUICK_REACTIONS};
pub use dms::ConversationDirectory;
pub use error::{Error, Result};
pub use gateway::Gateway;
pub use model::{Author, Channel, Conversation, Message, UserProfile};
pub use notify::UnreadTracker;
pub use presence::PresenceTracker;
pub use profiles::ProfileDirectory;
pub use store::MessageStore;
pub use subs::SubscriptionManager;
