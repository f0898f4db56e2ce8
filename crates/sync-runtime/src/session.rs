use std::{collections::HashSet, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use sync_core::{
    ApplyOutcome, AutomaticRefusal, Clock, ConnectionHealth, ConnectionHealthMonitor,
    ConversationSummary, ConversationTabManager, EventStream, HealthEvent, Message,
    MessageDeduplicator, MessageSource, OpenOutcome, RecoveryOrchestrator, RecoveryReport,
    RecoveryTrigger, Role, RoleCache, SessionChannels, SessionEvent, SyncError, SyncErrorCategory,
    TabView, UserRole, conversation_title, normalize_outgoing_content,
};
use sync_store::{DataStore, MessageOrder, MessageQuery, NewConversation, NewMessage, StoreError};
use tokio::{
    sync::{broadcast, mpsc, oneshot},
    task::{JoinHandle, JoinSet},
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::{
    config::ReliabilityConfig,
    inbound::{Inbound, InboundSender},
    poller::{BackupPoller, PollCursor, PollerSettings},
    subscription::SubscriptionChannel,
};

const COMMAND_BUFFER: usize = 64;
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(1);
const NEW_CONVERSATION_TITLE: &str = "New conversation";

/// Point-in-time view of one session for UI consumers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub user_id: String,
    pub health: ConnectionHealth,
    pub tabs: Vec<TabView>,
    pub active_tab_id: Option<String>,
    pub recovery_visible: bool,
}

#[derive(Debug)]
pub(crate) enum SessionCommand {
    OpenConversation {
        conversation_id: String,
        reply: oneshot::Sender<Result<String, SyncError>>,
    },
    OpenNewConversation {
        reply: oneshot::Sender<Result<String, SyncError>>,
    },
    CloseTab {
        tab_id: String,
        reply: oneshot::Sender<Result<(), SyncError>>,
    },
    SetActiveTab {
        tab_id: String,
        reply: oneshot::Sender<Result<(), SyncError>>,
    },
    SendMessage {
        tab_id: String,
        content: String,
        reply: oneshot::Sender<Result<Message, SyncError>>,
    },
    CreateConversation {
        first_message: String,
        reply: oneshot::Sender<Result<ConversationSummary, SyncError>>,
    },
    ForceRefresh {
        reply: oneshot::Sender<RecoveryReport>,
    },
    ManualRecover {
        reply: oneshot::Sender<RecoveryReport>,
    },
    SetPolling {
        enabled: bool,
        reply: oneshot::Sender<()>,
    },
    UserRole {
        reply: oneshot::Sender<Result<UserRole, SyncError>>,
    },
    TabMessages {
        tab_id: String,
        reply: oneshot::Sender<Result<Vec<Message>, SyncError>>,
    },
    Snapshot {
        reply: oneshot::Sender<SessionSnapshot>,
    },
}

/// Cloneable caller-side handle to a running session.
///
/// Every call is a message to the session actor; once the session has been
/// torn down calls fail with `session_closed`.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    user_id: String,
    channels: SessionChannels<SessionCommand>,
}

impl SessionHandle {
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn subscribe(&self) -> EventStream {
        self.channels.subscribe()
    }

    /// `true` once the session actor has stopped.
    pub fn is_closed(&self) -> bool {
        self.channels.is_closed()
    }

    /// Open a stored conversation (or focus its tab). Returns the tab id.
    pub async fn open_conversation(
        &self,
        conversation_id: impl Into<String>,
    ) -> Result<String, SyncError> {
        let conversation_id = conversation_id.into();
        self.request(|reply| SessionCommand::OpenConversation {
            conversation_id,
            reply,
        })
        .await?
    }

    /// Open an empty tab; the conversation is created on its first send.
    pub async fn open_new_conversation(&self) -> Result<String, SyncError> {
        self.request(|reply| SessionCommand::OpenNewConversation { reply })
            .await?
    }

    pub async fn close_tab(&self, tab_id: impl Into<String>) -> Result<(), SyncError> {
        let tab_id = tab_id.into();
        self.request(|reply| SessionCommand::CloseTab { tab_id, reply })
            .await?
    }

    pub async fn set_active_tab(&self, tab_id: impl Into<String>) -> Result<(), SyncError> {
        let tab_id = tab_id.into();
        self.request(|reply| SessionCommand::SetActiveTab { tab_id, reply })
            .await?
    }

    /// Persist a user message and apply the stored record locally.
    pub async fn send_message(
        &self,
        tab_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Result<Message, SyncError> {
        let tab_id = tab_id.into();
        let content = content.into();
        self.request(|reply| SessionCommand::SendMessage {
            tab_id,
            content,
            reply,
        })
        .await?
    }

    pub async fn create_conversation(
        &self,
        first_message: impl Into<String>,
    ) -> Result<ConversationSummary, SyncError> {
        let first_message = first_message.into();
        self.request(|reply| SessionCommand::CreateConversation {
            first_message,
            reply,
        })
        .await?
    }

    /// Recreate the subscription, then run a recovery fetch.
    pub async fn force_refresh(&self) -> Result<RecoveryReport, SyncError> {
        self.request(|reply| SessionCommand::ForceRefresh { reply })
            .await
    }

    pub async fn manual_recover(&self) -> Result<RecoveryReport, SyncError> {
        self.request(|reply| SessionCommand::ManualRecover { reply })
            .await
    }

    pub async fn set_polling(&self, enabled: bool) -> Result<(), SyncError> {
        self.request(|reply| SessionCommand::SetPolling { enabled, reply })
            .await
    }

    pub async fn user_role(&self) -> Result<UserRole, SyncError> {
        self.request(|reply| SessionCommand::UserRole { reply })
            .await?
    }

    pub async fn tab_messages(&self, tab_id: impl Into<String>) -> Result<Vec<Message>, SyncError> {
        let tab_id = tab_id.into();
        self.request(|reply| SessionCommand::TabMessages { tab_id, reply })
            .await?
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot, SyncError> {
        self.request(|reply| SessionCommand::Snapshot { reply })
            .await
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> SessionCommand,
    ) -> Result<T, SyncError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.channels
            .send_command(build(reply_tx))
            .await
            .map_err(|_| SyncError::session_closed())?;
        reply_rx.await.map_err(|_| SyncError::session_closed())
    }
}

/// Running session: the actor task plus the token that tears it down.
#[derive(Debug)]
pub struct SessionController {
    handle: SessionHandle,
    stop: CancellationToken,
    task: JoinHandle<()>,
}

impl SessionController {
    /// Start every per-session component for `user_id`.
    pub fn start(
        store: Arc<dyn DataStore>,
        user_id: impl Into<String>,
        config: ReliabilityConfig,
        clock: Arc<dyn Clock>,
        events: broadcast::Sender<SessionEvent>,
    ) -> Self {
        let user_id = user_id.into();
        let stop = CancellationToken::new();
        let (channels, command_rx) = SessionChannels::new(COMMAND_BUFFER, events.clone());
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let actor = SessionActor {
            user_id: user_id.clone(),
            store,
            clock,
            events,
            stop: stop.clone(),
            inbound_tx,
            monitor: ConnectionHealthMonitor::default(),
            dedupe: MessageDeduplicator::new(config.duplicate_window_ms),
            tabs: ConversationTabManager::new(config.max_tabs),
            recovery: RecoveryOrchestrator::new(config.recovery),
            roles: RoleCache::new(config.role_cache_ttl),
            config,
            subscription: None,
            poller: None,
            fetches: JoinSet::new(),
            creating: HashSet::new(),
            tabs_dirty: false,
            stale_reported: false,
        };
        let task = tokio::spawn(actor.run(command_rx, inbound_rx));

        Self {
            handle: SessionHandle { user_id, channels },
            stop,
            task,
        }
    }

    pub fn user_id(&self) -> &str {
        self.handle.user_id()
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    /// Cancel timers, unsubscribe and wait until the actor has reset everything.
    pub async fn shutdown(self) {
        self.stop.cancel();
        if let Err(err) = self.task.await {
            error!(user_id = %self.handle.user_id, error = %err, "session task ended abnormally");
        }
    }
}

struct SessionActor {
    user_id: String,
    store: Arc<dyn DataStore>,
    config: ReliabilityConfig,
    clock: Arc<dyn Clock>,
    events: broadcast::Sender<SessionEvent>,
    stop: CancellationToken,
    inbound_tx: InboundSender,
    monitor: ConnectionHealthMonitor,
    dedupe: MessageDeduplicator,
    tabs: ConversationTabManager,
    recovery: RecoveryOrchestrator,
    roles: RoleCache,
    subscription: Option<SubscriptionChannel>,
    poller: Option<BackupPoller>,
    /// Store calls in flight: history loads, recovery fetches, lookups and inserts.
    fetches: JoinSet<()>,
    /// Placeholder tabs whose conversation is being created.
    creating: HashSet<String>,
    tabs_dirty: bool,
    stale_reported: bool,
}

impl SessionActor {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<SessionCommand>,
        mut inbound: mpsc::UnboundedReceiver<Inbound>,
    ) {
        info!(user_id = %self.user_id, "session started");
        self.start_subscription();
        if self.config.poll_enabled {
            self.start_poller();
        }

        let stop = self.stop.clone();
        let mut maintenance =
            tokio::time::interval_at(Instant::now() + MAINTENANCE_INTERVAL, MAINTENANCE_INTERVAL);
        maintenance.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let deadline = self.recovery.deadline();
            tokio::select! {
                _ = stop.cancelled() => break,
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                Some(event) = inbound.recv() => self.handle_inbound(event),
                _ = sleep_until_deadline(deadline) => self.show_due_affordance(),
                _ = maintenance.tick() => self.maintain(),
                Some(joined) = self.fetches.join_next(), if !self.fetches.is_empty() => {
                    if let Err(err) = joined
                        && err.is_panic()
                    {
                        error!(user_id = %self.user_id, error = %err, "fetch task panicked");
                    }
                }
            }
            self.flush_tabs();
        }

        self.teardown().await;
    }

    async fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::OpenConversation {
                conversation_id,
                reply,
            } => self.open_conversation(conversation_id, reply),
            SessionCommand::OpenNewConversation { reply } => {
                let _ = reply.send(self.open_new_conversation());
            }
            SessionCommand::CloseTab { tab_id, reply } => {
                let result = match self.tabs.close(&tab_id) {
                    Some(_) => {
                        self.tabs_dirty = true;
                        Ok(())
                    }
                    None => Err(SyncError::tab_not_found(&tab_id)),
                };
                let _ = reply.send(result);
            }
            SessionCommand::SetActiveTab { tab_id, reply } => {
                let result = self.tabs.set_active(&tab_id);
                if result.is_ok() {
                    self.tabs_dirty = true;
                }
                let _ = reply.send(result);
            }
            SessionCommand::SendMessage {
                tab_id,
                content,
                reply,
            } => self.send_message(tab_id, &content, reply),
            SessionCommand::CreateConversation {
                first_message,
                reply,
            } => {
                let store = self.store.clone();
                let user_id = self.user_id.clone();
                let max_conversations = self.config.max_conversations;
                self.fetches.spawn(async move {
                    let result = create_capped_conversation(
                        store.as_ref(),
                        &user_id,
                        max_conversations,
                        &first_message,
                    )
                    .await;
                    let _ = reply.send(result);
                });
            }
            SessionCommand::ForceRefresh { reply } => {
                info!(user_id = %self.user_id, "force refresh requested");
                if let Some(subscription) = self.subscription.take() {
                    subscription.shutdown().await;
                }
                self.start_subscription();
                self.spawn_recovery(RecoveryTrigger::ForceRefresh, Some(reply));
            }
            SessionCommand::ManualRecover { reply } => {
                self.spawn_recovery(RecoveryTrigger::Manual, Some(reply));
            }
            SessionCommand::SetPolling { enabled, reply } => {
                if let Some(poller) = self.poller.take() {
                    poller.stop().await;
                }
                self.config.poll_enabled = enabled;
                if enabled {
                    self.start_poller();
                }
                info!(user_id = %self.user_id, enabled, "backup polling toggled");
                let _ = reply.send(());
            }
            SessionCommand::UserRole { reply } => self.user_role(reply),
            SessionCommand::TabMessages { tab_id, reply } => {
                let result = self
                    .tabs
                    .tab(&tab_id)
                    .map(|tab| tab.messages.clone())
                    .ok_or_else(|| SyncError::tab_not_found(&tab_id));
                let _ = reply.send(result);
            }
            SessionCommand::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    fn handle_inbound(&mut self, inbound: Inbound) {
        match inbound {
            Inbound::Health(event) => self.report_health(event),
            Inbound::Delivered { message, source } => {
                if source == MessageSource::Push {
                    self.monitor.note_activity(self.clock.now_ms());
                    self.stale_reported = false;
                }
                self.ingest(&message, source);
            }
            Inbound::HistoryLoaded { tab_id, result } => self.finish_history(&tab_id, result),
            Inbound::RecoveryFetched {
                trigger,
                result,
                reply,
            } => self.finish_recovery(trigger, result, reply),
            Inbound::ConversationFetched { result, reply } => {
                let _ = reply.send(result.and_then(|conversation| self.open_fetched(conversation)));
            }
            Inbound::MessageStored {
                tab_id,
                created,
                result,
                reply,
            } => self.finish_send(&tab_id, created, result, reply),
            Inbound::RoleFetched { result, reply } => {
                if let Ok(role) = &result {
                    self.roles.insert(self.user_id.clone(), *role, Instant::now());
                }
                let _ = reply.send(result);
            }
        }
    }

    /// Focus an open tab at once, or look the conversation up off the actor loop.
    fn open_conversation(
        &mut self,
        conversation_id: String,
        reply: oneshot::Sender<Result<String, SyncError>>,
    ) {
        if let Some(tab_id) = self
            .tabs
            .tab_for_conversation(&conversation_id)
            .map(|tab| tab.id.clone())
        {
            let result = self.tabs.set_active(&tab_id).map(|()| tab_id);
            self.tabs_dirty |= result.is_ok();
            let _ = reply.send(result);
            return;
        }

        let store = self.store.clone();
        let user_id = self.user_id.clone();
        let sink = self.inbound_tx.clone();
        self.fetches.spawn(async move {
            let result = store
                .get_conversation(&user_id, &conversation_id)
                .await
                .map_err(|err| err.into_sync_error("conversation_lookup_failed"));
            let _ = sink.send(Inbound::ConversationFetched { result, reply });
        });
    }

    fn open_fetched(&mut self, conversation: ConversationSummary) -> Result<String, SyncError> {
        let conversation_id = conversation.id.clone();
        let outcome = self.tabs.open(conversation)?;
        self.tabs_dirty = true;
        if let OpenOutcome::Created { tab_id, .. } = &outcome {
            self.spawn_history_load(tab_id.clone(), conversation_id);
        }
        Ok(outcome.tab_id().to_owned())
    }

    fn open_new_conversation(&mut self) -> Result<String, SyncError> {
        let draft = ConversationSummary {
            id: format!("draft-{}", Uuid::new_v4()),
            title: NEW_CONVERSATION_TITLE.to_owned(),
            created_at_ms: self.clock.now_ms(),
        };
        let outcome = self.tabs.open_placeholder(draft)?;
        self.tabs_dirty = true;
        Ok(outcome.tab_id().to_owned())
    }

    /// Validate on the loop, then persist in a fetch task and finish in [`Self::finish_send`].
    fn send_message(
        &mut self,
        tab_id: String,
        content: &str,
        reply: oneshot::Sender<Result<Message, SyncError>>,
    ) {
        let Some(content) = normalize_outgoing_content(content) else {
            let _ = reply.send(Err(SyncError::new(
                SyncErrorCategory::Config,
                "empty_message",
                "message content is empty",
            )));
            return;
        };
        let Some(tab) = self.tabs.tab(&tab_id) else {
            let _ = reply.send(Err(SyncError::tab_not_found(&tab_id)));
            return;
        };

        let conversation_id = if tab.placeholder {
            // One creation per placeholder; a second send would create a second conversation.
            if !self.creating.insert(tab_id.clone()) {
                let _ = reply.send(Err(SyncError::new(
                    SyncErrorCategory::Config,
                    "conversation_pending",
                    "the conversation for this tab is still being created",
                )));
                return;
            }
            None
        } else {
            Some(tab.conversation.id.clone())
        };

        let store = self.store.clone();
        let user_id = self.user_id.clone();
        let max_conversations = self.config.max_conversations;
        let sink = self.inbound_tx.clone();
        self.fetches.spawn(async move {
            let (created, result) = persist_message(
                store.as_ref(),
                &user_id,
                max_conversations,
                conversation_id,
                content,
            )
            .await;
            if let Err(err) = &result {
                warn!(%tab_id, code = %err.code, "message send failed");
            }
            let _ = sink.send(Inbound::MessageStored {
                tab_id,
                created,
                result,
                reply,
            });
        });
    }

    fn finish_send(
        &mut self,
        tab_id: &str,
        created: Option<ConversationSummary>,
        result: Result<Message, SyncError>,
        reply: oneshot::Sender<Result<Message, SyncError>>,
    ) {
        self.creating.remove(tab_id);
        if let Some(conversation) = created
            && self.tabs.bind_conversation(tab_id, conversation)
        {
            self.tabs_dirty = true;
        }
        if let Ok(message) = &result {
            self.ingest(message, MessageSource::Local);
        }
        let _ = reply.send(result);
    }

    fn user_role(&mut self, reply: oneshot::Sender<Result<UserRole, SyncError>>) {
        if let Some(role) = self.roles.get(&self.user_id, Instant::now()) {
            let _ = reply.send(Ok(role));
            return;
        }
        let store = self.store.clone();
        let user_id = self.user_id.clone();
        let sink = self.inbound_tx.clone();
        self.fetches.spawn(async move {
            let result = store
                .fetch_user_role(&user_id)
                .await
                .map_err(|err| err.into_sync_error("role_lookup_failed"));
            let _ = sink.send(Inbound::RoleFetched { result, reply });
        });
    }

    /// Run one delivered instance through dedupe and into its tab. Returns `true` when fresh.
    fn ingest(&mut self, message: &Message, source: MessageSource) -> bool {
        if !self.dedupe.admit(message, source).is_fresh() {
            return false;
        }

        match self.tabs.apply_message(message) {
            ApplyOutcome::Applied {
                tab_id,
                assistant_reply,
                unread_count,
            } => {
                trace!(%tab_id, id = %message.id, ?source, unread_count, "message applied");
                self.tabs_dirty = true;
                if assistant_reply {
                    self.emit(SessionEvent::AssistantReplied {
                        conversation_id: message.conversation_id.clone(),
                    });
                }
            }
            ApplyOutcome::AlreadyPresent { tab_id } => {
                debug!(%tab_id, id = %message.id, ?source, "message already present in tab");
            }
            ApplyOutcome::NoOpenTab => {
                trace!(
                    conversation_id = %message.conversation_id,
                    id = %message.id,
                    "no open tab for message"
                );
            }
        }
        true
    }

    fn report_health(&mut self, event: HealthEvent) {
        if !matches!(event, HealthEvent::Stale { .. }) {
            self.stale_reported = false;
        }
        let Some(health) = self.monitor.report(&event, self.clock.now_ms()) else {
            return;
        };
        self.emit(SessionEvent::HealthChanged(health));
        if let Some(visible) = self.recovery.observe(&health, Instant::now()) {
            self.emit(SessionEvent::RecoveryAffordance { visible });
        }
        self.try_automatic_recovery(true);
    }

    fn show_due_affordance(&mut self) {
        if let Some(visible) = self.recovery.fire_due(Instant::now()) {
            self.emit(SessionEvent::RecoveryAffordance { visible });
        }
    }

    /// Staleness watchdog plus a retry point for cooled-down automatic recovery.
    fn maintain(&mut self) {
        let window_ms = self.config.silence_window.as_millis() as u64;
        if !self.stale_reported
            && let Some(silent_for_ms) = self.monitor.stale_for(self.clock.now_ms(), window_ms)
        {
            warn!(user_id = %self.user_id, silent_for_ms, "connection silent past window");
            self.report_health(HealthEvent::Stale { silent_for_ms });
            self.stale_reported = true;
        }
        self.try_automatic_recovery(false);
    }

    fn try_automatic_recovery(&mut self, log_refusal: bool) {
        let health = self.monitor.current();
        match self.recovery.try_begin_automatic(&health, Instant::now()) {
            Ok(_) => self.spawn_recovery(RecoveryTrigger::Automatic, None),
            Err(AutomaticRefusal::NotArmed) => {}
            Err(refusal) if log_refusal => {
                debug!(
                    ?refusal,
                    failures = health.consecutive_failures,
                    "automatic recovery refused"
                );
            }
            Err(_) => {}
        }
    }

    fn spawn_recovery(
        &mut self,
        trigger: RecoveryTrigger,
        reply: Option<oneshot::Sender<RecoveryReport>>,
    ) {
        let health = self.monitor.current();
        let since_ms = self.recovery.policy().window_start_ms(
            &health,
            self.clock.now_ms(),
            self.tabs.latest_message_ms(),
        );
        let query = MessageQuery::for_user(&self.user_id)
            .created_after(since_ms)
            .ordered_by(MessageOrder::CreatedAtAscending);
        info!(user_id = %self.user_id, ?trigger, since_ms, "recovery fetch started");

        let store = self.store.clone();
        let sink = self.inbound_tx.clone();
        self.fetches.spawn(async move {
            let result = store.query_messages(&query).await;
            let _ = sink.send(Inbound::RecoveryFetched {
                trigger,
                result,
                reply,
            });
        });
    }

    fn finish_recovery(
        &mut self,
        trigger: RecoveryTrigger,
        result: Result<Vec<Message>, StoreError>,
        reply: Option<oneshot::Sender<RecoveryReport>>,
    ) {
        let report = match result {
            Ok(rows) => {
                let fetched = rows.len();
                let applied = rows
                    .iter()
                    .filter(|message| self.ingest(message, MessageSource::Recovery))
                    .count();
                info!(?trigger, fetched, applied, "recovery fetch finished");
                RecoveryReport {
                    trigger,
                    fetched,
                    applied,
                    error_code: None,
                }
            }
            Err(err) => {
                warn!(?trigger, error = %err, "recovery fetch failed");
                RecoveryReport {
                    trigger,
                    fetched: 0,
                    applied: 0,
                    error_code: Some("recovery_fetch_failed".to_owned()),
                }
            }
        };

        self.emit(SessionEvent::RecoveryFinished(report.clone()));
        if let Some(reply) = reply {
            let _ = reply.send(report);
        }
    }

    fn spawn_history_load(&mut self, tab_id: String, conversation_id: String) {
        let query = MessageQuery::for_user(&self.user_id)
            .in_conversation(conversation_id)
            .ordered_by(MessageOrder::CreatedAtAscending);
        let store = self.store.clone();
        let sink = self.inbound_tx.clone();
        self.fetches.spawn(async move {
            let result = store.query_messages(&query).await;
            let _ = sink.send(Inbound::HistoryLoaded { tab_id, result });
        });
    }

    fn finish_history(&mut self, tab_id: &str, result: Result<Vec<Message>, StoreError>) {
        let changed = match result {
            Ok(history) => {
                for message in &history {
                    self.dedupe.observe(message);
                }
                self.tabs.finish_loading(tab_id, history)
            }
            Err(err) => {
                warn!(%tab_id, error = %err, "history load failed");
                self.tabs.fail_loading(tab_id)
            }
        };
        self.tabs_dirty |= changed;
    }

    fn start_subscription(&mut self) {
        self.subscription = Some(SubscriptionChannel::spawn(
            self.store.clone(),
            self.user_id.clone(),
            self.config.resubscribe,
            self.inbound_tx.clone(),
            &self.stop,
        ));
    }

    fn start_poller(&mut self) {
        self.poller = Some(BackupPoller::spawn(
            self.store.clone(),
            self.user_id.clone(),
            PollCursor::starting_at(self.clock.now_ms()),
            PollerSettings {
                interval: self.config.poll_interval,
                batch_size: self.config.poll_batch_size,
            },
            self.inbound_tx.clone(),
            &self.stop,
        ));
    }

    fn snapshot(&self) -> SessionSnapshot {
        let tabs = self.tabs.snapshot();
        SessionSnapshot {
            user_id: self.user_id.clone(),
            health: self.monitor.current(),
            tabs: tabs.tabs,
            active_tab_id: tabs.active_tab_id,
            recovery_visible: self.recovery.is_visible(),
        }
    }

    fn flush_tabs(&mut self) {
        if std::mem::take(&mut self.tabs_dirty) {
            self.emit(SessionEvent::TabsChanged(self.tabs.snapshot()));
        }
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    async fn teardown(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            subscription.shutdown().await;
        }
        if let Some(poller) = self.poller.take() {
            poller.stop().await;
        }
        self.fetches.shutdown().await;

        let was_visible = self.recovery.is_visible();
        self.monitor.reset();
        self.recovery.reset();
        self.dedupe.reset();
        self.tabs.clear();
        self.roles.clear();
        self.creating.clear();

        self.emit(SessionEvent::HealthChanged(self.monitor.current()));
        self.emit(SessionEvent::TabsChanged(self.tabs.snapshot()));
        if was_visible {
            self.emit(SessionEvent::RecoveryAffordance { visible: false });
        }
        info!(user_id = %self.user_id, "session stopped");
    }
}

/// Count first, refuse at the cap, then insert with a title cut from the first message.
async fn create_capped_conversation(
    store: &dyn DataStore,
    user_id: &str,
    max_conversations: usize,
    first_message: &str,
) -> Result<ConversationSummary, SyncError> {
    let existing = store
        .count_conversations(user_id)
        .await
        .map_err(|err| err.into_sync_error("conversation_count_failed"))?;
    if existing >= max_conversations {
        warn!(%user_id, existing, max = max_conversations, "conversation cap reached");
        return Err(SyncError::conversation_capacity(max_conversations));
    }

    let conversation = store
        .insert_conversation(NewConversation {
            user_id: user_id.to_owned(),
            title: conversation_title(first_message),
        })
        .await
        .map_err(|err| err.into_sync_error("store_insert_failed"))?;
    info!(
        conversation_id = %conversation.id,
        title = %conversation.title,
        "conversation created"
    );
    Ok(conversation)
}

/// Insert a user message, creating its conversation first when `conversation_id` is `None`.
async fn persist_message(
    store: &dyn DataStore,
    user_id: &str,
    max_conversations: usize,
    conversation_id: Option<String>,
    content: String,
) -> (Option<ConversationSummary>, Result<Message, SyncError>) {
    let (created, conversation_id) = match conversation_id {
        Some(conversation_id) => (None, conversation_id),
        None => {
            match create_capped_conversation(store, user_id, max_conversations, &content).await {
                Ok(conversation) => {
                    let conversation_id = conversation.id.clone();
                    (Some(conversation), conversation_id)
                }
                Err(err) => return (None, Err(err)),
            }
        }
    };

    let result = store
        .insert_message(NewMessage {
            conversation_id,
            role: Role::User,
            content,
        })
        .await
        .map_err(|err| err.into_sync_error("store_insert_failed"));
    (created, result)
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
