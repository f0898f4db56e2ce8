//! Core delivery-reliability model shared by the session runtime and its callers.
//!
//! This crate holds the timer-free pieces: the data model, connection health
//! state machine, duplicate detection, the bounded tab manager, recovery
//! policy, and the session command/event channel pair.

/// Backoff used when re-acquiring a dropped subscription.
pub mod backoff;
/// Session command/event channel primitives.
pub mod channel;
/// Wall clock that follows tokio time.
pub mod clock;
/// Cross-source duplicate detection.
pub mod dedupe;
/// Stable error taxonomy and store status classification.
pub mod error;
/// Connection health state machine.
pub mod health;
/// Conversation titles and outgoing content normalization.
pub mod normalization;
/// Recovery affordance and auto-recovery bookkeeping.
pub mod recovery;
/// Session-scoped role lookup cache.
pub mod roles;
/// Bounded set of open conversation tabs.
pub mod tabs;
/// Data model and session events.
pub mod types;

pub use backoff::ResubscribePolicy;
pub use channel::{EventStream, SessionChannelError, SessionChannels};
pub use clock::{Clock, TokioClock};
pub use dedupe::{Admission, DuplicateReason, MessageDeduplicator};
pub use error::{SyncError, SyncErrorCategory, classify_store_status};
pub use health::{ConnectionHealthMonitor, HealthEvent, quality_for_latency};
pub use normalization::{conversation_title, normalize_outgoing_content};
pub use recovery::{
    AutomaticRefusal, RecoveryOrchestrator, RecoveryPolicy, RecoveryReport, RecoveryTrigger,
};
pub use roles::RoleCache;
pub use tabs::{
    ApplyOutcome, ConversationTab, ConversationTabManager, MAX_TABS, OpenOutcome, TabView,
    TabsSnapshot,
};
pub use types::{
    ConnectionHealth, ConnectionStatus, ConversationSummary, Message, MessageId, MessageSource,
    Role, SessionEvent, UserRole,
};
