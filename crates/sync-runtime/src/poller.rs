use std::{sync::Arc, time::Duration};

use sync_core::{Message, MessageId, MessageSource};
use sync_store::{DataStore, MessageOrder, MessageQuery};
use tokio::{
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::inbound::{Inbound, InboundSender};

/// "Last seen" position of a poller.
///
/// Until the first row arrives there is no id to page from, so the cursor
/// pages by creation time from the moment the poller started instead of
/// replaying the user's whole history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollCursor {
    started_at_ms: u64,
    last_seen: Option<MessageId>,
}

impl PollCursor {
    pub fn starting_at(started_at_ms: u64) -> Self {
        Self {
            started_at_ms,
            last_seen: None,
        }
    }

    pub fn last_seen(&self) -> Option<MessageId> {
        self.last_seen
    }

    pub fn query(&self, user_id: &str, batch_size: usize) -> MessageQuery {
        let query = MessageQuery::for_user(user_id)
            .ordered_by(MessageOrder::IdAscending)
            .limit(batch_size);
        match self.last_seen {
            Some(_) => query.after_id(self.last_seen),
            None => query.created_after(self.started_at_ms),
        }
    }

    /// Move past every row of a returned batch.
    pub fn advance(&mut self, rows: &[Message]) {
        if let Some(max) = rows.iter().map(|message| message.id).max() {
            self.last_seen = Some(self.last_seen.map_or(max, |seen| seen.max(max)));
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct PollerSettings {
    pub interval: Duration,
    pub batch_size: usize,
}

/// Fixed-interval fallback query, independent of subscription health.
///
/// The query is awaited inside the loop and missed ticks are skipped, so at
/// most one poll is in flight.
#[derive(Debug)]
pub struct BackupPoller {
    stop: CancellationToken,
    task: JoinHandle<()>,
}

impl BackupPoller {
    pub(crate) fn spawn(
        store: Arc<dyn DataStore>,
        user_id: String,
        cursor: PollCursor,
        settings: PollerSettings,
        sink: InboundSender,
        parent: &CancellationToken,
    ) -> Self {
        let stop = parent.child_token();
        let task = tokio::spawn(run(store, user_id, cursor, settings, sink, stop.clone()));
        Self { stop, task }
    }

    /// Cancel the timer and any in-flight query. The cursor dies with the task.
    pub async fn stop(self) {
        self.stop.cancel();
        let _ = self.task.await;
    }
}

async fn run(
    store: Arc<dyn DataStore>,
    user_id: String,
    mut cursor: PollCursor,
    settings: PollerSettings,
    sink: InboundSender,
    stop: CancellationToken,
) {
    let mut ticker =
        tokio::time::interval_at(Instant::now() + settings.interval, settings.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    debug!(%user_id, interval = ?settings.interval, "backup poller started");

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let query = cursor.query(&user_id, settings.batch_size);
        let result = tokio::select! {
            _ = stop.cancelled() => break,
            result = store.query_messages(&query) => result,
        };

        match result {
            Ok(rows) => {
                cursor.advance(&rows);
                trace!(
                    %user_id,
                    rows = rows.len(),
                    cursor = ?cursor.last_seen(),
                    "poll cycle finished"
                );
                for message in rows {
                    let delivered = sink.send(Inbound::Delivered {
                        message,
                        source: MessageSource::Poll,
                    });
                    if delivered.is_err() {
                        return;
                    }
                }
            }
            Err(err) => warn!(%user_id, error = %err, "backup poll failed; retrying next tick"),
        }
    }
    debug!(%user_id, "backup poller stopped");
}
