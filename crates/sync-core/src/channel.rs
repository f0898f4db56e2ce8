use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

use crate::types::SessionEvent;

/// Broadcast event stream handed to UI subscribers.
pub type EventStream = broadcast::Receiver<SessionEvent>;

/// Errors returned by session channel operations.
#[derive(Debug, Error)]
pub enum SessionChannelError {
    /// The session mailbox is closed.
    #[error("session mailbox is closed")]
    MailboxClosed,
}

/// Mailbox/event pair for one session actor.
///
/// All commands funnel through the single mailbox, which is the serialization
/// point for every tab and dedupe mutation. Events fan out to any number of
/// subscribers.
#[derive(Debug)]
pub struct SessionChannels<C> {
    command_tx: mpsc::Sender<C>,
    event_tx: broadcast::Sender<SessionEvent>,
}

impl<C> Clone for SessionChannels<C> {
    fn clone(&self) -> Self {
        Self {
            command_tx: self.command_tx.clone(),
            event_tx: self.event_tx.clone(),
        }
    }
}

impl<C> SessionChannels<C> {
    /// Create a mailbox fed into an existing event broadcaster.
    pub fn new(
        command_buffer: usize,
        event_tx: broadcast::Sender<SessionEvent>,
    ) -> (Self, mpsc::Receiver<C>) {
        let (command_tx, command_rx) = mpsc::channel(command_buffer.max(1));
        (
            Self {
                command_tx,
                event_tx,
            },
            command_rx,
        )
    }

    pub fn subscribe(&self) -> EventStream {
        self.event_tx.subscribe()
    }

    pub async fn send_command(&self, command: C) -> Result<(), SessionChannelError> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| SessionChannelError::MailboxClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.command_tx.is_closed()
    }

    /// Emit an event to all subscribers.
    ///
    /// Emission is best-effort; lagged subscribers are handled by `broadcast`.
    pub fn emit(&self, event: SessionEvent) {
        let _ = self.event_tx.send(event);
    }
}
