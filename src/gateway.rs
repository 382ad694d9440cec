//! Contract for the hosted backend-as-a-service.
//!
//! The core consumes the backend strictly through this interface: filtered
//! ordered queries, inserts that echo the server-assigned row, named
//! procedure calls, and per-table change feeds. Implementations adapt a
//! concrete transport; tests script one in memory.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::GatewayError;
use crate::future::ChangeStream;

/// A wire row: a flat JSON object keyed by column name.
pub type Row = serde_json::Map<String, Value>;

/// Tables the core reads and writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Users,
    Messages,
    Conversations,
    DmMessages,
}

impl Table {
    /// Wire name of the table.
    pub fn name(&self) -> &'static str {
        match self {
            Table::Users => "users",
            Table::Messages => "messages",
            Table::Conversations => "dms",
            Table::DmMessages => "dm_messages",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Server-side procedures invoked through [`Gateway::call`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Procedure {
    /// Append a message to a DM conversation and touch its `updated_at`.
    AppendDmMessage,
    /// Add the user to an emoji's reaction set, or remove them if present.
    ToggleReaction,
    /// Return the conversation for a canonical participant pair, creating
    /// it if absent.
    PairConversation,
    /// Record the user's read position in a conversation.
    UpdateReadCursor,
    /// Refresh the current user's last-active timestamp.
    Heartbeat,
}

impl Procedure {
    /// Wire name of the procedure.
    pub fn name(&self) -> &'static str {
        match self {
            Procedure::AppendDmMessage => "append_dm_message",
            Procedure::ToggleReaction => "toggle_reaction",
            Procedure::PairConversation => "get_or_create_dm",
            Procedure::UpdateReadCursor => "update_dm_read",
            Procedure::Heartbeat => "update_user_last_active",
        }
    }
}

impl fmt::Display for Procedure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Row predicates supported by [`Gateway::query`].
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Column equals value.
    Eq(&'static str, Value),
    /// Column differs from value.
    Neq(&'static str, Value),
    /// Timestamp column strictly before the instant.
    Before(&'static str, DateTime<Utc>),
    /// Timestamp column at or after the instant.
    Since(&'static str, DateTime<Utc>),
    /// Column value is one of the given values.
    AnyOf(&'static str, Vec<Value>),
    /// Text column contains the fragment.
    Contains(&'static str, String),
    /// The value matches either of the two columns.
    EitherEq(&'static str, &'static str, Value),
}

/// Sort order for query results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Order {
    pub column: &'static str,
    pub descending: bool,
}

impl Order {
    pub fn asc(column: &'static str) -> Self {
        Self { column, descending: false }
    }

    pub fn desc(column: &'static str) -> Self {
        Self { column, descending: true }
    }
}

/// Change-feed event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Insert,
    Update,
}

/// Which event kinds a subscription receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventMask {
    Insert,
    Update,
    All,
}

impl EventMask {
    pub fn matches(&self, kind: EventKind) -> bool {
        match self {
            EventMask::Insert => kind == EventKind::Insert,
            EventMask::Update => kind == EventKind::Update,
            EventMask::All => true,
        }
    }
}

/// A single change delivered on a table's feed.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub table: Table,
    pub kind: EventKind,
    /// The row after the change.
    pub row: Row,
}

/// Tears a realtime subscription down, synchronously, exactly once —
/// explicitly via [`SubscriptionHandle::unsubscribe`] or implicitly on drop.
pub struct SubscriptionHandle {
    canceller: Option<Box<dyn FnOnce() + Send>>,
}

impl SubscriptionHandle {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self { canceller: Some(Box::new(cancel)) }
    }

    /// A handle with nothing to tear down.
    pub fn noop() -> Self {
        Self { canceller: None }
    }

    /// Tear the subscription down now.
    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.canceller.take() {
            cancel();
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        if let Some(cancel) = self.canceller.take() {
            cancel();
        }
    }
}

impl fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("active", &self.canceller.is_some())
            .finish()
    }
}

/// An open realtime subscription: the event stream plus its teardown handle.
pub struct ChangeFeed {
    pub events: ChangeStream<ChangeEvent>,
    pub handle: SubscriptionHandle,
}

impl ChangeFeed {
    pub fn new(events: ChangeStream<ChangeEvent>, handle: SubscriptionHandle) -> Self {
        Self { events, handle }
    }
}

/// The remote data gateway consumed by the stores and trackers.
#[async_trait]
pub trait Gateway: Send + Sync + 'static {
    /// Fetch rows matching every filter, optionally ordered and limited.
    async fn query(
        &self,
        table: Table,
        filters: &[Filter],
        order: Option<Order>,
        limit: Option<usize>,
    ) -> Result<Vec<Row>, GatewayError>;

    /// Insert a row; the server assigns `id` and `created_at` when absent
    /// and echoes the stored row back.
    async fn insert(&self, table: Table, row: Row) -> Result<Row, GatewayError>;

    /// Invoke a named server-side procedure.
    async fn call(&self, procedure: Procedure, args: Row) -> Result<Value, GatewayError>;

    /// Open a change feed for a table.
    async fn subscribe(&self, table: Table, mask: EventMask) -> Result<ChangeFeed, GatewayError>;

    /// Re-establish the auth session. Used as an escalating recovery step
    /// by the retrying write paths.
    async fn refresh_session(&self) -> Result<(), GatewayError>;
}

/// Build a [`Row`] from a `json!` object literal. Non-object values yield
/// an empty row.
pub fn row(value: Value) -> Row {
    match value {
        Value::Object(map) => map,
        _ => Row::new(),
    }
}

/// Decode a wire row into a typed value.
pub fn decode_row<T: DeserializeOwned>(row: &Row) -> Result<T, GatewayError> {
    serde_json::from_value(Value::Object(row.clone())).map_err(GatewayError::decode)
}

/// Decode a batch of wire rows.
pub fn decode_rows<T: DeserializeOwned>(rows: &[Row]) -> Result<Vec<T>, GatewayError> {
    rows.iter().map(decode_row).collect()
}
