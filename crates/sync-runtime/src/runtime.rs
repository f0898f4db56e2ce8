use std::sync::Arc;

use sync_core::{Clock, EventStream, SessionEvent, SyncError, TokioClock};
use sync_store::{AuthSession, DataStore};
use tokio::{
    sync::{broadcast, watch},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    config::ReliabilityConfig,
    session::{SessionController, SessionHandle},
};

const EVENT_BUFFER: usize = 512;

/// Caller-side handle to the auth-driven session supervisor.
#[derive(Debug)]
pub struct RuntimeHandle {
    events: broadcast::Sender<SessionEvent>,
    current: watch::Receiver<Option<SessionHandle>>,
    stop: CancellationToken,
    task: JoinHandle<()>,
}

impl RuntimeHandle {
    /// Events of every session this runtime starts, including start/end markers.
    pub fn subscribe(&self) -> EventStream {
        self.events.subscribe()
    }

    /// Handle of the running session, if someone is signed in.
    pub fn session(&self) -> Result<SessionHandle, SyncError> {
        self.current.borrow().clone().ok_or_else(SyncError::no_session)
    }

    /// Wait until a session for `user_id` is running.
    pub async fn session_for(&self, user_id: &str) -> Result<SessionHandle, SyncError> {
        let mut current = self.current.clone();
        let session = current
            .wait_for(|session| {
                session
                    .as_ref()
                    .is_some_and(|handle| handle.user_id() == user_id)
            })
            .await
            .map_err(|_| SyncError::session_closed())?;
        session.as_ref().cloned().ok_or_else(SyncError::no_session)
    }

    /// Tear down the running session and stop watching auth.
    pub async fn shutdown(self) {
        self.stop.cancel();
        let _ = self.task.await;
    }
}

/// Start the supervisor with a wall clock read from the system.
pub fn spawn_runtime(
    store: Arc<dyn DataStore>,
    auth: &AuthSession,
    config: ReliabilityConfig,
) -> RuntimeHandle {
    spawn_runtime_with_clock(store, auth, config, Arc::new(TokioClock::starting_now()))
}

/// Start the supervisor: one session per signed-in user, torn down on sign-out or switch.
pub fn spawn_runtime_with_clock(
    store: Arc<dyn DataStore>,
    auth: &AuthSession,
    config: ReliabilityConfig,
    clock: Arc<dyn Clock>,
) -> RuntimeHandle {
    let (events, _) = broadcast::channel(EVENT_BUFFER);
    let (current_tx, current) = watch::channel(None);
    let stop = CancellationToken::new();

    let supervisor = Supervisor {
        store,
        config,
        clock,
        events: events.clone(),
        current: current_tx,
        running: None,
    };
    let task = tokio::spawn(supervisor.run(auth.watch(), stop.clone()));

    RuntimeHandle {
        events,
        current,
        stop,
        task,
    }
}

struct Supervisor {
    store: Arc<dyn DataStore>,
    config: ReliabilityConfig,
    clock: Arc<dyn Clock>,
    events: broadcast::Sender<SessionEvent>,
    current: watch::Sender<Option<SessionHandle>>,
    running: Option<SessionController>,
}

impl Supervisor {
    async fn run(mut self, mut auth: watch::Receiver<Option<String>>, stop: CancellationToken) {
        loop {
            let wanted = auth.borrow_and_update().clone();
            self.reconcile(wanted).await;

            tokio::select! {
                _ = stop.cancelled() => break,
                changed = auth.changed() => {
                    if changed.is_err() {
                        debug!("auth source dropped; supervisor stopping");
                        break;
                    }
                }
            }
        }
        self.end_running().await;
    }

    async fn reconcile(&mut self, wanted: Option<String>) {
        let running_user = self.running.as_ref().map(SessionController::user_id);
        if running_user == wanted.as_deref() {
            return;
        }

        // The previous session is fully gone before the next one subscribes.
        self.end_running().await;

        if let Some(user_id) = wanted {
            info!(%user_id, "starting session");
            let _ = self.events.send(SessionEvent::SessionStarted {
                user_id: user_id.clone(),
            });
            let controller = SessionController::start(
                self.store.clone(),
                user_id,
                self.config.clone(),
                self.clock.clone(),
                self.events.clone(),
            );
            self.current.send_replace(Some(controller.handle()));
            self.running = Some(controller);
        }
    }

    async fn end_running(&mut self) {
        let Some(controller) = self.running.take() else {
            return;
        };
        self.current.send_replace(None);
        let user_id = controller.user_id().to_owned();
        info!(%user_id, "ending session");
        controller.shutdown().await;
        let _ = self.events.send(SessionEvent::SessionEnded { user_id });
    }
}
