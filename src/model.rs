//! Domain data model shared across the stores and trackers.
//!
//! Wire field names follow the backend schema (`user_id` / `user_name` on
//! group messages, `sender_id` on DM messages, `user1_*` / `user2_*` on
//! conversations); the Rust names are the domain ones.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};

use crate::gateway::{Filter, Table};

macro_rules! string_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_owned())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(
    /// Server-assigned user identifier.
    UserId
);
string_id!(
    /// Server-assigned message identifier.
    MessageId
);
string_id!(
    /// Server-assigned conversation identifier.
    ConversationId
);

/// Reaction state of one message: emoji symbol to the set of users who
/// reacted with it. Open vocabulary.
pub type Reactions = BTreeMap<String, BTreeSet<UserId>>;

/// Deserialize a possibly-null column into its default.
fn null_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// One message in a channel. Immutable after creation except `reactions`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub content: String,
    #[serde(rename = "user_id", alias = "sender_id")]
    pub author_id: UserId,
    #[serde(rename = "user_name", default, deserialize_with = "null_default")]
    pub author_name: String,
    #[serde(default, deserialize_with = "null_default")]
    pub avatar_color: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, deserialize_with = "null_default")]
    pub reactions: Reactions,
}

impl Message {
    /// Number of users who reacted with `emoji`.
    pub fn reaction_count(&self, emoji: &str) -> usize {
        self.reactions.get(emoji).map_or(0, BTreeSet::len)
    }

    /// Whether `user` reacted with `emoji`.
    pub fn has_reacted(&self, emoji: &str, user: &UserId) -> bool {
        self.reactions.get(emoji).is_some_and(|users| users.contains(user))
    }
}

/// Author metadata attached to an outgoing message.
#[derive(Debug, Clone, PartialEq)]
pub struct Author {
    pub id: UserId,
    pub name: String,
    pub avatar_color: String,
    pub avatar_url: Option<String>,
}

/// A DM conversation between a canonically ordered participant pair:
/// the lower user id is always `participant_a`, so one row exists per
/// unordered pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    #[serde(rename = "user1_id")]
    pub participant_a: UserId,
    #[serde(rename = "user2_id")]
    pub participant_b: UserId,
    #[serde(rename = "user1_username", default, deserialize_with = "null_default")]
    pub participant_a_name: String,
    #[serde(rename = "user2_username", default, deserialize_with = "null_default")]
    pub participant_b_name: String,
    pub updated_at: DateTime<Utc>,
    /// Recent-message tail carried by change-feed rows; snapshot queries
    /// may omit the column entirely.
    #[serde(default, deserialize_with = "null_default")]
    pub messages: Vec<Message>,
}

impl Conversation {
    /// The participant who is not `me`, as (id, display name).
    pub fn other_participant(&self, me: &UserId) -> (&UserId, &str) {
        if &self.participant_a == me {
            (&self.participant_b, &self.participant_b_name)
        } else {
            (&self.participant_a, &self.participant_a_name)
        }
    }

    /// The most recent message in the carried tail, if any.
    pub fn last_message(&self) -> Option<&Message> {
        self.messages.last()
    }
}

/// A user profile row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: UserId,
    pub username: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default, deserialize_with = "null_default")]
    pub avatar_color: String,
    #[serde(default)]
    pub bio: Option<String>,
    #[serde(default)]
    pub last_active: Option<DateTime<Utc>>,
}

/// One open channel: the single group conversation, or one DM conversation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Channel {
    Group,
    Direct(ConversationId),
}

impl Channel {
    /// The table this channel's messages live in.
    pub fn table(&self) -> Table {
        match self {
            Channel::Group => Table::Messages,
            Channel::Direct(_) => Table::DmMessages,
        }
    }

    /// Filters that scope a message query to this channel.
    pub fn filters(&self) -> Vec<Filter> {
        match self {
            Channel::Group => Vec::new(),
            Channel::Direct(conversation) => {
                vec![Filter::Eq("conversation_id", json!(conversation))]
            },
        }
    }

    /// Whether a change-feed row belongs to this channel.
    pub fn owns_row(&self, row: &serde_json::Map<String, Value>) -> bool {
        match self {
            Channel::Group => true,
            Channel::Direct(conversation) => row
                .get("conversation_id")
                .and_then(Value::as_str)
                .is_some_and(|id| id == conversation.as_str()),
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::Group => f.write_str("group"),
            Channel::Direct(conversation) => write!(f, "dm:{conversation}"),
        }
    }
}
