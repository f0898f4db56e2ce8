#![allow(dead_code)]

use std::{sync::Arc, time::Duration};

use sync_core::{ConnectionHealth, ConnectionStatus, EventStream, SessionEvent, TokioClock};
use sync_runtime::{ReliabilityConfig, SessionController};
use sync_store::InMemoryStore;
use tokio::{
    sync::broadcast::{self, error::RecvError},
    time::{Instant, timeout, timeout_at},
};

pub const START_MS: u64 = 1_700_000_000_000;
pub const USER: &str = "alice";

pub struct Harness {
    pub clock: Arc<TokioClock>,
    pub store: InMemoryStore,
}

impl Harness {
    pub fn new() -> Self {
        let clock = Arc::new(TokioClock::starting_at(START_MS));
        let store = InMemoryStore::with_clock(clock.clone());
        Self { clock, store }
    }

    pub fn start(&self, config: ReliabilityConfig) -> (SessionController, EventStream) {
        let (events, rx) = broadcast::channel(1_024);
        let controller = SessionController::start(
            Arc::new(self.store.clone()),
            USER,
            config,
            self.clock.clone(),
            events,
        );
        (controller, rx)
    }
}

pub fn without_polling() -> ReliabilityConfig {
    ReliabilityConfig {
        poll_enabled: false,
        ..ReliabilityConfig::default()
    }
}

/// Next event matching `predicate`, skipping everything else.
pub async fn wait_for<F>(events: &mut EventStream, mut predicate: F) -> SessionEvent
where
    F: FnMut(&SessionEvent) -> bool,
{
    timeout(Duration::from_secs(300), async {
        loop {
            match events.recv().await {
                Ok(event) if predicate(&event) => return event,
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => panic!("event stream closed"),
            }
        }
    })
    .await
    .expect("event timeout")
}

/// Next health change that lands on `status`.
pub async fn wait_for_status(
    events: &mut EventStream,
    status: ConnectionStatus,
) -> ConnectionHealth {
    match wait_for(events, |event| {
        matches!(event, SessionEvent::HealthChanged(health) if health.status == status)
    })
    .await
    {
        SessionEvent::HealthChanged(health) => health,
        other => panic!("unexpected event {other:?}"),
    }
}

/// Every event emitted during the next `window` of (tokio) time.
pub async fn collect_for(events: &mut EventStream, window: Duration) -> Vec<SessionEvent> {
    let deadline = Instant::now() + window;
    let mut seen = Vec::new();
    loop {
        match timeout_at(deadline, events.recv()).await {
            Ok(Ok(event)) => seen.push(event),
            Ok(Err(RecvError::Lagged(_))) => continue,
            Ok(Err(RecvError::Closed)) | Err(_) => return seen,
        }
    }
}
