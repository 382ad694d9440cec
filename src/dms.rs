//! Conversation directory: canonical pair conversations and user lookup.
//!
//! A conversation between two users is a singleton: the pair is ordered so
//! the lower user id is always `user1`, and creation goes through the
//! pair-conversation procedure, so requesting (A, B) and (B, A) resolves to
//! the same row.

use std::sync::Arc;

use serde_json::json;
use tracing::instrument;

use crate::config::Config;
use crate::error::{Error, GatewayError, Result};
use crate::future::{spawn_logged, Debouncer};
use crate::gateway::{self, Filter, Gateway, Order, Procedure, Row, Table};
use crate::model::{Conversation, UserId, UserProfile};

/// Cap on debounced user-search results.
const SEARCH_LIMIT: usize = 10;

pub struct ConversationDirectory<G: Gateway> {
    gateway: Arc<G>,
    user: UserId,
    debounce: Debouncer,
}

impl<G: Gateway> ConversationDirectory<G> {
    pub fn new(gateway: Arc<G>, user: UserId, config: &Config) -> Self {
        Self {
            gateway,
            user,
            debounce: Debouncer::new(config.search_debounce()),
        }
    }

    /// The conversation for `me` and `other`, created if absent. The pair
    /// is canonicalized before the call, so argument order is irrelevant.
    #[instrument(skip(self, me, other), level = "debug")]
    pub async fn get_or_create(
        &self,
        me: &UserProfile,
        other: &UserProfile,
    ) -> Result<Conversation> {
        let (first, second) = if me.id <= other.id { (me, other) } else { (other, me) };
        let args = gateway::row(json!({
            "user1_id": first.id,
            "user2_id": second.id,
            "user1_username": first.username,
            "user2_username": second.username,
        }));
        let value = self.gateway.call(Procedure::PairConversation, args).await?;
        let conversation = serde_json::from_value(value).map_err(GatewayError::decode)?;
        Ok(conversation)
    }

    /// The current user's conversations, most recently touched first.
    /// Rows without a message tail normalize to an empty one.
    #[instrument(skip(self), level = "debug")]
    pub async fn list_conversations(&self) -> Result<Vec<Conversation>> {
        let rows = self
            .gateway
            .query(
                Table::Conversations,
                &[Filter::EitherEq("user1_id", "user2_id", json!(self.user))],
                Some(Order::desc("updated_at")),
                None,
            )
            .await?;
        let conversations = gateway::decode_rows(&rows)?;
        self.touch_presence();
        Ok(conversations)
    }

    /// Every other user, ordered by username.
    #[instrument(skip(self), level = "debug")]
    pub async fn list_users(&self) -> Result<Vec<UserProfile>> {
        let rows = self
            .gateway
            .query(
                Table::Users,
                &[Filter::Neq("id", json!(self.user))],
                Some(Order::asc("username")),
                None,
            )
            .await?;
        let users = gateway::decode_rows(&rows)?;
        self.touch_presence();
        Ok(users)
    }

    /// The current user's own profile row, if it exists yet.
    pub async fn current_profile(&self) -> Result<Option<UserProfile>> {
        let rows = self
            .gateway
            .query(Table::Users, &[Filter::Eq("id", json!(self.user))], None, Some(1))
            .await?;
        match rows.first() {
            Some(row) => Ok(Some(gateway::decode_row(row)?)),
            None => Ok(None),
        }
    }

    /// Debounced username search. Scheduling a new search cancels the
    /// previous pending one; only the last query inside the window reaches
    /// the gateway. Results are delivered through `deliver`.
    pub fn search_users<F>(&self, query: String, deliver: F)
    where
        F: FnOnce(Result<Vec<UserProfile>>) + Send + 'static,
    {
        let remote = self.gateway.clone();
        let user = self.user.clone();
        self.debounce.run(async move {
            deliver(Self::run_search(remote, user, query).await);
        });
    }

    /// Cancel a pending debounced search, as on teardown.
    pub fn cancel_search(&self) {
        self.debounce.cancel();
    }

    async fn run_search(
        remote: Arc<G>,
        user: UserId,
        query: String,
    ) -> Result<Vec<UserProfile>> {
        let needle = query.trim();
        if needle.is_empty() {
            return Ok(Vec::new());
        }
        let rows = remote
            .query(
                Table::Users,
                &[
                    Filter::Neq("id", json!(user)),
                    Filter::Contains("username", needle.to_owned()),
                ],
                Some(Order::asc("username")),
                Some(SEARCH_LIMIT),
            )
            .await?;
        Ok(gateway::decode_rows(&rows)?)
    }

    /// Best-effort heartbeat after a successful fetch.
    fn touch_presence(&self) {
        let remote = self.gateway.clone();
        spawn_logged("presence heartbeat", async move {
            remote
                .call(Procedure::Heartbeat, Row::new())
                .await
                .map(|_| ())
                .map_err(Error::from)
        });
    }
}
