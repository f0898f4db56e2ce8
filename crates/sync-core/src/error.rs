use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Broad error category that decides how a failure reaches the caller.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SyncErrorCategory {
    /// Subscription or poll transport failure. Never surfaced as a hard error.
    Transport,
    /// Tab budget or conversation cap reached. Rejected synchronously, not retried.
    Capacity,
    /// Store rejected an insert or query.
    Store,
    /// Session missing or revoked.
    Auth,
    /// Invalid input or configuration.
    Config,
    /// Runtime invariant break (closed mailbox, dropped reply).
    Internal,
}

/// Stable error payload returned across the session handle boundary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
#[error("{category:?}:{code}: {message}")]
pub struct SyncError {
    pub category: SyncErrorCategory,
    /// Stable machine-readable error code.
    pub code: String,
    pub message: String,
    /// Optional retry hint in milliseconds.
    pub retry_after_ms: Option<u64>,
}

impl SyncError {
    pub fn new(
        category: SyncErrorCategory,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            code: code.into(),
            message: message.into(),
            retry_after_ms: None,
        }
    }

    /// Attach a retry hint to the error.
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after_ms = Some(retry_after.as_millis() as u64);
        self
    }

    pub fn tab_capacity(max_tabs: usize) -> Self {
        Self::new(
            SyncErrorCategory::Capacity,
            "tab_capacity",
            format!("all {max_tabs} tabs are in use and none can be evicted"),
        )
    }

    pub fn conversation_capacity(max_conversations: usize) -> Self {
        Self::new(
            SyncErrorCategory::Capacity,
            "conversation_capacity",
            format!("conversation limit of {max_conversations} reached"),
        )
    }

    pub fn no_session() -> Self {
        Self::new(
            SyncErrorCategory::Auth,
            "no_session",
            "no signed-in session is available",
        )
    }

    pub fn session_closed() -> Self {
        Self::new(
            SyncErrorCategory::Internal,
            "session_closed",
            "session controller is no longer running",
        )
    }

    pub fn tab_not_found(tab_id: &str) -> Self {
        Self::new(
            SyncErrorCategory::Config,
            "tab_not_found",
            format!("no open tab with id '{tab_id}'"),
        )
    }

    /// Transport failures are absorbed by timers and backoff, never shown as hard errors.
    pub fn is_transient(&self) -> bool {
        self.category == SyncErrorCategory::Transport
    }
}

/// Map store/HTTP status codes to error categories.
pub fn classify_store_status(status: u16) -> SyncErrorCategory {
    match status {
        401 | 403 => SyncErrorCategory::Auth,
        408 | 429 => SyncErrorCategory::Transport,
        400..=499 => SyncErrorCategory::Store,
        500..=599 => SyncErrorCategory::Transport,
        _ => SyncErrorCategory::Internal,
    }
}
