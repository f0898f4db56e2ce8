use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{recovery::RecoveryReport, tabs::TabsSnapshot};

/// Store-assigned message identifier.
///
/// Identifiers are opaque to callers but grow monotonically with insertion
/// order, which is what the backup poller's cursor relies on.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct MessageId(pub u64);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Author role of a chat message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Message written by the signed-in user.
    User,
    /// Reply produced by the assistant.
    Assistant,
}

/// Role of the signed-in account, resolved through the store.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    /// Regular chat user.
    User,
    /// Account with administrative access.
    Admin,
}

/// Delivery path a message instance arrived through.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MessageSource {
    /// Realtime subscription insert event.
    Push,
    /// Backup poller batch.
    Poll,
    /// Manual or automatic recovery fetch.
    Recovery,
    /// Record returned by our own insert (optimistic local apply).
    Local,
}

/// Immutable chat message as stored by the remote data store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    /// Store-assigned unique identifier.
    pub id: MessageId,
    /// Conversation the message belongs to.
    pub conversation_id: String,
    /// Author role.
    pub role: Role,
    /// Text body.
    pub content: String,
    /// Store-assigned creation time in milliseconds since Unix epoch.
    pub created_at_ms: u64,
}

/// Read-only conversation reference data.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConversationSummary {
    pub id: String,
    pub title: String,
    pub created_at_ms: u64,
}

/// Connection status reported by the health monitor.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    /// No subscription is held.
    Disconnected,
    /// A subscription has been requested but not confirmed yet.
    Connecting,
    /// Subscription confirmed and heartbeats are healthy.
    Connected,
    /// Subscription confirmed but heartbeat quality is poor.
    Degraded,
    /// Last subscription attempt failed or timed out.
    Error,
}

impl ConnectionStatus {
    /// Whether the status is on the connected path (quality is meaningful).
    pub fn is_live(self) -> bool {
        matches!(self, Self::Connected | Self::Degraded)
    }
}

/// Point-in-time connection health.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionHealth {
    pub status: ConnectionStatus,
    /// 0-100, meaningful only while [`ConnectionStatus::is_live`].
    pub quality: u8,
    pub latency_ms: u64,
    /// Time of the last heartbeat in milliseconds since Unix epoch, `None` if never.
    pub last_heartbeat_ms: Option<u64>,
    pub consecutive_failures: u32,
}

impl ConnectionHealth {
    /// Quality as consumers should read it: zero off the connected path.
    pub fn effective_quality(&self) -> u8 {
        if self.status.is_live() {
            self.quality
        } else {
            0
        }
    }
}

impl Default for ConnectionHealth {
    fn default() -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            quality: 0,
            latency_ms: 0,
            last_heartbeat_ms: None,
            consecutive_failures: 0,
        }
    }
}

/// Notification emitted to UI subscribers of a session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum SessionEvent {
    /// A signed-in session became available and its components started.
    SessionStarted { user_id: String },
    /// The session was torn down (sign-out, user switch or shutdown).
    SessionEnded { user_id: String },
    /// Connection health changed.
    HealthChanged(ConnectionHealth),
    /// Tab set, active tab, loading flags or unread counts changed.
    TabsChanged(TabsSnapshot),
    /// An assistant message landed in an open conversation.
    AssistantReplied { conversation_id: String },
    /// The recovery affordance should be shown or hidden.
    RecoveryAffordance { visible: bool },
    /// A recovery fetch completed.
    RecoveryFinished(RecoveryReport),
}
