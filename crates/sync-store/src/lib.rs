//! External collaborator seams consumed by the sync runtime.
//!
//! The remote data store is reached only through [`DataStore`]; session
//! presence only through [`AuthSession`]. [`InMemoryStore`] is a complete
//! reference implementation with fault injection for tests and demos.

use async_trait::async_trait;
use sync_core::{
    ConversationSummary, Message, MessageId, Role, SyncError, SyncErrorCategory, UserRole,
    classify_store_status,
};
use thiserror::Error;
use tokio::sync::mpsc;

mod auth;
mod memory;

pub use auth::AuthSession;
pub use memory::{CallCounts, InMemoryStore};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("store backend failure: {0}")]
    Backend(String),
}

impl StoreError {
    /// Convert into the caller-facing error with a stable `code`.
    pub fn into_sync_error(self, code: &str) -> SyncError {
        let category = match &self {
            Self::Unavailable(_) => SyncErrorCategory::Transport,
            Self::Rejected { status, .. } => classify_store_status(*status),
            Self::NotFound(_) | Self::Backend(_) => SyncErrorCategory::Store,
        };
        SyncError::new(category, code, self.to_string())
    }
}

/// Row order for message queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MessageOrder {
    /// Ascending store id; used by the poller cursor.
    #[default]
    IdAscending,
    CreatedAtAscending,
}

/// Filter for message queries. Rows are always scoped to the user's conversations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageQuery {
    pub user_id: String,
    pub conversation_id: Option<String>,
    /// Only ids strictly greater than this.
    pub after_id: Option<MessageId>,
    /// Only rows created strictly after this instant.
    pub created_after_ms: Option<u64>,
    pub order: MessageOrder,
    pub limit: Option<usize>,
}

impl MessageQuery {
    pub fn for_user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            conversation_id: None,
            after_id: None,
            created_after_ms: None,
            order: MessageOrder::IdAscending,
            limit: None,
        }
    }

    pub fn in_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }

    pub fn after_id(mut self, after_id: Option<MessageId>) -> Self {
        self.after_id = after_id;
        self
    }

    pub fn created_after(mut self, created_after_ms: u64) -> Self {
        self.created_after_ms = Some(created_after_ms);
        self
    }

    pub fn ordered_by(mut self, order: MessageOrder) -> Self {
        self.order = order;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Message insert payload; id and timestamp are assigned by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub conversation_id: String,
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewConversation {
    pub user_id: String,
    pub title: String,
}

/// Push events and lifecycle callbacks of one subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionEvent {
    Subscribed,
    Insert(Message),
    Heartbeat { latency_ms: u64 },
    Error(String),
    TimedOut,
    Closed,
}

/// Live subscription handle; release it with [`DataStore::unsubscribe`].
#[derive(Debug)]
pub struct Subscription {
    pub id: u64,
    pub events: mpsc::Receiver<SubscriptionEvent>,
}

/// Remote data store operations the reliability core depends on.
#[async_trait]
pub trait DataStore: Send + Sync {
    async fn query_messages(&self, query: &MessageQuery) -> Result<Vec<Message>, StoreError>;

    async fn get_conversation(
        &self,
        user_id: &str,
        conversation_id: &str,
    ) -> Result<ConversationSummary, StoreError>;

    async fn count_conversations(&self, user_id: &str) -> Result<usize, StoreError>;

    async fn insert_conversation(
        &self,
        record: NewConversation,
    ) -> Result<ConversationSummary, StoreError>;

    async fn insert_message(&self, record: NewMessage) -> Result<Message, StoreError>;

    /// Open a push subscription for inserts into the user's conversations.
    async fn subscribe(&self, user_id: &str) -> Result<Subscription, StoreError>;

    /// Release a subscription. Unknown or already released ids are ignored.
    fn unsubscribe(&self, subscription_id: u64);

    async fn fetch_user_role(&self, user_id: &str) -> Result<UserRole, StoreError>;
}
