use std::fmt;
use thiserror::Error;

/// Errors that can occur across the chat client core
#[derive(Error, Debug)]
pub enum Error {
    /// An error from the remote data gateway
    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    /// An error from a channel's message store
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    /// An error from the presence tracker
    #[error("Presence error: {0}")]
    Presence(#[from] PresenceError),

    /// An error from the unread/notification tracker
    #[error("Notification error: {0}")]
    Notify(#[from] NotifyError),

    /// An error from local device storage
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// An error while reading configuration
    #[error("Config error: {0}")]
    Config(String),
}

/// Result type for chat client operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the remote data gateway
#[derive(Error, Debug)]
pub enum GatewayError {
    /// The backend could not be reached
    #[error("Network error: {0}")]
    Network(String),

    /// The session is missing, expired, or was rejected
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// The backend accepted the request but reported a failure
    #[error("Backend error: {0}")]
    Backend(String),

    /// A row or procedure result did not match the expected shape
    #[error("Decode error: {0}")]
    Decode(String),

    /// The realtime feed or client was torn down mid-operation
    #[error("Gateway closed")]
    Closed,
}

impl GatewayError {
    /// Create a new Network error
    pub fn network<E: fmt::Display>(error: E) -> Self {
        Self::Network(error.to_string())
    }

    /// Create a new Backend error
    pub fn backend<E: fmt::Display>(error: E) -> Self {
        Self::Backend(error.to_string())
    }

    /// Create a new Decode error
    pub fn decode<E: fmt::Display>(error: E) -> Self {
        Self::Decode(error.to_string())
    }
}

/// Errors surfaced by a channel's message store
#[derive(Error, Debug)]
pub enum ChannelError {
    /// Empty or whitespace-only content was submitted
    #[error("Message is empty")]
    EmptyMessage,

    /// All send attempts failed; the caller should keep the draft
    #[error("Send failed after {attempts} attempts: {reason}")]
    SendFailed { attempts: usize, reason: String },

    /// A page fetch failed; the caller re-triggers explicitly
    #[error("Load failed: {0}")]
    LoadFailed(String),
}

/// Errors surfaced by the presence tracker
#[derive(Error, Debug)]
pub enum PresenceError {
    /// The active-user snapshot query failed
    #[error("Presence snapshot failed: {0}")]
    Snapshot(String),
}

/// Errors surfaced by the unread/notification tracker
#[derive(Error, Debug)]
pub enum NotifyError {
    /// The initial unread-conversation query failed
    #[error("Unread snapshot failed: {0}")]
    Snapshot(String),
}

/// Errors surfaced by local device storage
#[derive(Error, Debug)]
pub enum StorageError {
    /// The backing store failed
    #[error("Storage backend error: {0}")]
    Backend(String),

    /// A stored value could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl StorageError {
    /// Create a new Backend error
    pub fn backend<E: fmt::Display>(error: E) -> Self {
        Self::Backend(error.to_string())
    }

    /// Create a new Serialization error
    pub fn serialization<E: fmt::Display>(error: E) -> Self {
        Self::Serialization(error.to_string())
    }
}
