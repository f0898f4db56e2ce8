use std::sync::Arc;

use sync_core::{HealthEvent, MessageSource, ResubscribePolicy};
use sync_store::{DataStore, Subscription, SubscriptionEvent};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::inbound::{Inbound, InboundSender};

/// Releases the store subscription on every exit path of the pump.
struct Lease {
    store: Arc<dyn DataStore>,
    id: u64,
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.store.unsubscribe(self.id);
    }
}

/// How one acquired subscription ended.
enum PumpExit {
    Cancelled,
    Lost,
}

/// Owns the single push subscription of a session.
///
/// Inserts are forwarded as `source = push`; lifecycle callbacks become
/// health events. Lost subscriptions are re-acquired with backoff until the
/// attempt budget runs out.
#[derive(Debug)]
pub struct SubscriptionChannel {
    stop: CancellationToken,
    task: JoinHandle<()>,
}

impl SubscriptionChannel {
    pub(crate) fn spawn(
        store: Arc<dyn DataStore>,
        user_id: String,
        policy: ResubscribePolicy,
        sink: InboundSender,
        parent: &CancellationToken,
    ) -> Self {
        let stop = parent.child_token();
        let task = tokio::spawn(run(store, user_id, policy, sink, stop.clone()));
        Self { stop, task }
    }

    /// Unsubscribe and wait for the task to finish. Safe after the task already ended.
    pub async fn shutdown(self) {
        self.stop.cancel();
        let _ = self.task.await;
    }
}

async fn run(
    store: Arc<dyn DataStore>,
    user_id: String,
    policy: ResubscribePolicy,
    sink: InboundSender,
    stop: CancellationToken,
) {
    let mut attempt: u32 = 0;

    loop {
        let _ = sink.send(Inbound::Health(HealthEvent::SubscribeRequested));
        let acquired = tokio::select! {
            _ = stop.cancelled() => break,
            result = store.subscribe(&user_id) => result,
        };

        match acquired {
            Ok(subscription) => {
                let lease = Lease {
                    store: store.clone(),
                    id: subscription.id,
                };
                let exit = pump(subscription, &sink, &stop, &mut attempt).await;
                drop(lease);
                if matches!(exit, PumpExit::Cancelled) {
                    break;
                }
            }
            Err(err) => {
                let _ = sink.send(Inbound::Health(HealthEvent::SubscribeError {
                    reason: err.to_string(),
                }));
            }
        }

        let Some(delay) = policy.delay_for_attempt(attempt) else {
            warn!(
                %user_id,
                attempts = attempt,
                "resubscribe budget exhausted; relying on polling and recovery"
            );
            return;
        };
        attempt = attempt.saturating_add(1);
        debug!(%user_id, attempt, ?delay, "resubscribing after backoff");

        tokio::select! {
            _ = stop.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    let _ = sink.send(Inbound::Health(HealthEvent::DisconnectRequested));
    debug!(%user_id, "subscription channel stopped");
}

async fn pump(
    mut subscription: Subscription,
    sink: &InboundSender,
    stop: &CancellationToken,
    attempt: &mut u32,
) -> PumpExit {
    loop {
        let event = tokio::select! {
            _ = stop.cancelled() => return PumpExit::Cancelled,
            event = subscription.events.recv() => event,
        };

        let inbound = match event {
            Some(SubscriptionEvent::Subscribed) => {
                *attempt = 0;
                info!(subscription_id = subscription.id, "subscription established");
                Inbound::Health(HealthEvent::SubscribeSuccess)
            }
            Some(SubscriptionEvent::Insert(message)) => Inbound::Delivered {
                message,
                source: MessageSource::Push,
            },
            Some(SubscriptionEvent::Heartbeat { latency_ms }) => {
                Inbound::Health(HealthEvent::Heartbeat { latency_ms })
            }
            Some(SubscriptionEvent::Error(reason)) => {
                let _ = sink.send(Inbound::Health(HealthEvent::SubscribeError { reason }));
                return PumpExit::Lost;
            }
            Some(SubscriptionEvent::TimedOut) => {
                let _ = sink.send(Inbound::Health(HealthEvent::SubscribeTimeout));
                return PumpExit::Lost;
            }
            Some(SubscriptionEvent::Closed) | None => {
                warn!(subscription_id = subscription.id, "subscription closed by the store");
                let _ = sink.send(Inbound::Health(HealthEvent::DisconnectRequested));
                return PumpExit::Lost;
            }
        };

        if sink.send(inbound).is_err() {
            return PumpExit::Cancelled;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use sync_core::{Role, TokioClock};
    use sync_store::InMemoryStore;
    use tokio::{sync::mpsc, time::timeout};

    use super::*;

    async fn next_health(rx: &mut mpsc::UnboundedReceiver<Inbound>) -> HealthEvent {
        loop {
            let inbound = timeout(Duration::from_secs(60), rx.recv())
                .await
                .expect("inbound timeout")
                .expect("inbound closed");
            if let Inbound::Health(event) = inbound {
                return event;
            }
        }
    }

    fn store() -> InMemoryStore {
        InMemoryStore::with_clock(Arc::new(TokioClock::starting_at(1_000_000)))
    }

    #[tokio::test(start_paused = true)]
    async fn forwards_inserts_as_push_and_unsubscribes_on_shutdown() {
        let store = store();
        let conversation = store.seed_conversation("alice", "c");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let root = CancellationToken::new();
        let channel = SubscriptionChannel::spawn(
            Arc::new(store.clone()),
            "alice".into(),
            ResubscribePolicy::default(),
            tx,
            &root,
        );

        assert_eq!(next_health(&mut rx).await, HealthEvent::SubscribeRequested);
        assert_eq!(next_health(&mut rx).await, HealthEvent::SubscribeSuccess);

        let message = store.deliver(&conversation.id, Role::Assistant, "hello");
        match timeout(Duration::from_secs(5), rx.recv()).await {
            Ok(Some(Inbound::Delivered { message: got, source })) => {
                assert_eq!(got, message);
                assert_eq!(source, MessageSource::Push);
            }
            other => panic!("unexpected inbound: {other:?}"),
        }

        channel.shutdown().await;
        assert_eq!(next_health(&mut rx).await, HealthEvent::DisconnectRequested);
        assert_eq!(store.active_subscriptions(), 0);
        assert_eq!(store.calls().unsubscribes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reacquires_after_timeout_with_backoff() {
        let store = store();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let root = CancellationToken::new();
        let channel = SubscriptionChannel::spawn(
            Arc::new(store.clone()),
            "alice".into(),
            ResubscribePolicy::new(1_000, 1_000, 3),
            tx,
            &root,
        );
        assert_eq!(next_health(&mut rx).await, HealthEvent::SubscribeRequested);
        assert_eq!(next_health(&mut rx).await, HealthEvent::SubscribeSuccess);

        store.emit(SubscriptionEvent::TimedOut);
        assert_eq!(next_health(&mut rx).await, HealthEvent::SubscribeTimeout);
        assert_eq!(next_health(&mut rx).await, HealthEvent::SubscribeRequested);
        assert_eq!(next_health(&mut rx).await, HealthEvent::SubscribeSuccess);
        assert_eq!(store.calls().subscribes, 2);
        assert_eq!(store.active_subscriptions(), 1);

        channel.shutdown().await;
        assert_eq!(store.active_subscriptions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stops_retrying_once_budget_is_spent() {
        let store = store();
        store.fail_next_subscribes(10);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let root = CancellationToken::new();
        let channel = SubscriptionChannel::spawn(
            Arc::new(store.clone()),
            "alice".into(),
            ResubscribePolicy::new(100, 100, 2),
            tx,
            &root,
        );

        for _ in 0..3 {
            assert_eq!(next_health(&mut rx).await, HealthEvent::SubscribeRequested);
            assert!(matches!(
                next_health(&mut rx).await,
                HealthEvent::SubscribeError { .. }
            ));
        }
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(store.calls().subscribes, 3);
        assert!(rx.try_recv().is_err());
        channel.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn parent_cancellation_releases_the_subscription() {
        let store = store();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let root = CancellationToken::new();
        let channel = SubscriptionChannel::spawn(
            Arc::new(store.clone()),
            "alice".into(),
            ResubscribePolicy::default(),
            tx,
            &root,
        );
        assert_eq!(next_health(&mut rx).await, HealthEvent::SubscribeRequested);
        assert_eq!(next_health(&mut rx).await, HealthEvent::SubscribeSuccess);

        root.cancel();
        channel.shutdown().await;
        assert_eq!(store.active_subscriptions(), 0);
    }
}
