use sync_core::{
    ConversationSummary, HealthEvent, Message, MessageSource, RecoveryReport, RecoveryTrigger,
    SyncError, UserRole,
};
use sync_store::StoreError;
use tokio::sync::{mpsc, oneshot};

/// Everything background tasks hand back to the session actor.
///
/// Tasks never touch session state directly; they post one of these and the
/// actor applies it on its own loop. Variants carrying a `reply` finish a
/// caller request once the actor has applied the result.
#[derive(Debug)]
pub(crate) enum Inbound {
    Health(HealthEvent),
    Delivered {
        message: Message,
        source: MessageSource,
    },
    HistoryLoaded {
        tab_id: String,
        result: Result<Vec<Message>, StoreError>,
    },
    RecoveryFetched {
        trigger: RecoveryTrigger,
        result: Result<Vec<Message>, StoreError>,
        reply: Option<oneshot::Sender<RecoveryReport>>,
    },
    ConversationFetched {
        result: Result<ConversationSummary, SyncError>,
        reply: oneshot::Sender<Result<String, SyncError>>,
    },
    MessageStored {
        tab_id: String,
        /// Conversation created for a placeholder tab, even when the insert then failed.
        created: Option<ConversationSummary>,
        result: Result<Message, SyncError>,
        reply: oneshot::Sender<Result<Message, SyncError>>,
    },
    RoleFetched {
        result: Result<UserRole, SyncError>,
        reply: oneshot::Sender<Result<UserRole, SyncError>>,
    },
}

pub(crate) type InboundSender = mpsc::UnboundedSender<Inbound>;
