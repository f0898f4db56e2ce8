use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
    time::Duration,
};

use async_trait::async_trait;
use sync_core::{Clock, ConversationSummary, Message, MessageId, Role, TokioClock, UserRole};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::{
    DataStore, MessageOrder, MessageQuery, NewConversation, NewMessage, StoreError, Subscription,
    SubscriptionEvent,
};

const SUBSCRIPTION_BUFFER: usize = 256;

/// Number of calls seen per operation kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub queries: u32,
    pub inserts: u32,
    pub subscribes: u32,
    pub unsubscribes: u32,
    pub role_lookups: u32,
}

#[derive(Debug, Default)]
struct Faults {
    queries: u32,
    inserts: u32,
    subscribes: u32,
    /// Every query waits this long before it is served.
    query_latency: Option<Duration>,
    /// Message inserts never complete.
    stall_message_inserts: bool,
}

#[derive(Debug)]
struct Subscriber {
    user_id: String,
    tx: mpsc::Sender<SubscriptionEvent>,
}

#[derive(Debug, Default)]
struct Inner {
    next_message_id: u64,
    next_conversation_id: u64,
    next_subscription_id: u64,
    /// `(owner user id, summary)`.
    conversations: Vec<(String, ConversationSummary)>,
    messages: Vec<Message>,
    roles: HashMap<String, UserRole>,
    subscribers: HashMap<u64, Subscriber>,
    push_paused: bool,
    faults: Faults,
    calls: CallCounts,
}

impl Inner {
    fn owner_of(&self, conversation_id: &str) -> Option<&str> {
        self.conversations
            .iter()
            .find(|(_, summary)| summary.id == conversation_id)
            .map(|(owner, _)| owner.as_str())
    }

    fn push_to_owner(&mut self, message: &Message) {
        let Some(owner) = self.owner_of(&message.conversation_id).map(str::to_owned) else {
            return;
        };
        self.subscribers.retain(|id, subscriber| {
            if subscriber.user_id != owner {
                return true;
            }
            match subscriber.tx.try_send(SubscriptionEvent::Insert(message.clone())) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!(subscription_id = id, "subscriber lagging; push dropped");
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }

    fn take_fault(counter: &mut u32) -> bool {
        if *counter == 0 {
            return false;
        }
        *counter -= 1;
        true
    }
}

/// In-process [`DataStore`] with push delivery and fault injection.
#[derive(Debug, Clone)]
pub struct InMemoryStore {
    inner: Arc<RwLock<Inner>>,
    clock: Arc<dyn Clock>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::with_clock(Arc::new(TokioClock::starting_now()))
    }
}

impl InMemoryStore {
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner {
                next_message_id: 1,
                next_conversation_id: 1,
                next_subscription_id: 1,
                ..Inner::default()
            })),
            clock,
        }
    }

    /// Create a conversation owned by `user_id` without counting an insert call.
    pub fn seed_conversation(&self, user_id: &str, title: &str) -> ConversationSummary {
        let now_ms = self.clock.now_ms();
        let mut inner = self.write_unpoisoned();
        Self::create_conversation(&mut inner, user_id, title, now_ms)
    }

    /// Store a message without pushing it, as if the realtime channel had stalled.
    pub fn insert_silently(
        &self,
        conversation_id: &str,
        role: Role,
        content: &str,
        created_at_ms: u64,
    ) -> Message {
        let mut inner = self.write_unpoisoned();
        Self::create_message(&mut inner, conversation_id, role, content, created_at_ms)
    }

    /// Store a message and push it to the owner's subscribers (when push is not paused).
    pub fn deliver(&self, conversation_id: &str, role: Role, content: &str) -> Message {
        let now_ms = self.clock.now_ms();
        let mut inner = self.write_unpoisoned();
        let message = Self::create_message(&mut inner, conversation_id, role, content, now_ms);
        if !inner.push_paused {
            inner.push_to_owner(&message);
        }
        message
    }

    /// Push an already stored message again, as a duplicate realtime event.
    pub fn replay_push(&self, message: &Message) {
        self.write_unpoisoned().push_to_owner(message);
    }

    /// Send a lifecycle or heartbeat event to every live subscriber.
    pub fn emit(&self, event: SubscriptionEvent) {
        let mut inner = self.write_unpoisoned();
        inner.subscribers.retain(|_, subscriber| {
            !matches!(
                subscriber.tx.try_send(event.clone()),
                Err(mpsc::error::TrySendError::Closed(_))
            )
        });
    }

    pub fn set_push_paused(&self, paused: bool) {
        self.write_unpoisoned().push_paused = paused;
    }

    pub fn set_role(&self, user_id: &str, role: UserRole) {
        self.write_unpoisoned()
            .roles
            .insert(user_id.to_owned(), role);
    }

    pub fn fail_next_queries(&self, count: u32) {
        self.write_unpoisoned().faults.queries = count;
    }

    pub fn fail_next_inserts(&self, count: u32) {
        self.write_unpoisoned().faults.inserts = count;
    }

    pub fn fail_next_subscribes(&self, count: u32) {
        self.write_unpoisoned().faults.subscribes = count;
    }

    /// Delay every query, as a slow backend would.
    pub fn set_query_latency(&self, latency: Option<Duration>) {
        self.write_unpoisoned().faults.query_latency = latency;
    }

    /// Leave message inserts pending forever (they are still counted).
    pub fn set_message_inserts_stalled(&self, stalled: bool) {
        self.write_unpoisoned().faults.stall_message_inserts = stalled;
    }

    pub fn calls(&self) -> CallCounts {
        self.read_unpoisoned().calls
    }

    pub fn active_subscriptions(&self) -> usize {
        self.read_unpoisoned().subscribers.len()
    }

    pub fn messages_in(&self, conversation_id: &str) -> Vec<Message> {
        self.read_unpoisoned()
            .messages
            .iter()
            .filter(|message| message.conversation_id == conversation_id)
            .cloned()
            .collect()
    }

    fn create_conversation(
        inner: &mut Inner,
        user_id: &str,
        title: &str,
        now_ms: u64,
    ) -> ConversationSummary {
        let summary = ConversationSummary {
            id: format!("conv-{}", inner.next_conversation_id),
            title: title.to_owned(),
            created_at_ms: now_ms,
        };
        inner.next_conversation_id += 1;
        inner
            .conversations
            .push((user_id.to_owned(), summary.clone()));
        summary
    }

    fn create_message(
        inner: &mut Inner,
        conversation_id: &str,
        role: Role,
        content: &str,
        created_at_ms: u64,
    ) -> Message {
        let message = Message {
            id: MessageId(inner.next_message_id),
            conversation_id: conversation_id.to_owned(),
            role,
            content: content.to_owned(),
            created_at_ms,
        };
        inner.next_message_id += 1;
        inner.messages.push(message.clone());
        message
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Inner>, StoreError> {
        self.inner
            .read()
            .map_err(|_| StoreError::Backend("poisoned lock".to_owned()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Inner>, StoreError> {
        self.inner
            .write()
            .map_err(|_| StoreError::Backend("poisoned lock".to_owned()))
    }

    fn read_unpoisoned(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_unpoisoned(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    async fn begin_query(&self) -> Result<(), StoreError> {
        let latency = self.count_query()?;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        Ok(())
    }

    fn count_query(&self) -> Result<Option<Duration>, StoreError> {
        let mut inner = self.write()?;
        inner.calls.queries += 1;
        if Inner::take_fault(&mut inner.faults.queries) {
            return Err(StoreError::Unavailable("injected query failure".to_owned()));
        }
        Ok(inner.faults.query_latency)
    }

    fn begin_insert(&self) -> Result<(), StoreError> {
        let mut inner = self.write()?;
        inner.calls.inserts += 1;
        if Inner::take_fault(&mut inner.faults.inserts) {
            return Err(StoreError::Unavailable("injected insert failure".to_owned()));
        }
        Ok(())
    }
}

#[async_trait]
impl DataStore for InMemoryStore {
    async fn query_messages(&self, query: &MessageQuery) -> Result<Vec<Message>, StoreError> {
        self.begin_query().await?;
        let inner = self.read()?;
        let mut rows: Vec<Message> = inner
            .messages
            .iter()
            .filter(|message| {
                inner.owner_of(&message.conversation_id) == Some(query.user_id.as_str())
            })
            .filter(|message| {
                query
                    .conversation_id
                    .as_deref()
                    .is_none_or(|conversation_id| message.conversation_id == conversation_id)
            })
            .filter(|message| query.after_id.is_none_or(|after| message.id > after))
            .filter(|message| {
                query
                    .created_after_ms
                    .is_none_or(|after| message.created_at_ms > after)
            })
            .cloned()
            .collect();

        match query.order {
            MessageOrder::IdAscending => rows.sort_by_key(|message| message.id),
            MessageOrder::CreatedAtAscending => {
                rows.sort_by_key(|message| (message.created_at_ms, message.id))
            }
        }
        if let Some(limit) = query.limit {
            rows.truncate(limit);
        }
        trace!(user_id = %query.user_id, rows = rows.len(), "message query served");
        Ok(rows)
    }

    async fn get_conversation(
        &self,
        user_id: &str,
        conversation_id: &str,
    ) -> Result<ConversationSummary, StoreError> {
        self.begin_query().await?;
        self.read()?
            .conversations
            .iter()
            .find(|(owner, summary)| owner == user_id && summary.id == conversation_id)
            .map(|(_, summary)| summary.clone())
            .ok_or_else(|| StoreError::NotFound(format!("conversation {conversation_id}")))
    }

    async fn count_conversations(&self, user_id: &str) -> Result<usize, StoreError> {
        self.begin_query().await?;
        Ok(self
            .read()?
            .conversations
            .iter()
            .filter(|(owner, _)| owner == user_id)
            .count())
    }

    async fn insert_conversation(
        &self,
        record: NewConversation,
    ) -> Result<ConversationSummary, StoreError> {
        self.begin_insert()?;
        let now_ms = self.clock.now_ms();
        let mut inner = self.write()?;
        Ok(Self::create_conversation(
            &mut inner,
            &record.user_id,
            &record.title,
            now_ms,
        ))
    }

    async fn insert_message(&self, record: NewMessage) -> Result<Message, StoreError> {
        self.begin_insert()?;
        let stalled = self.read()?.faults.stall_message_inserts;
        if stalled {
            std::future::pending::<()>().await;
        }
        let now_ms = self.clock.now_ms();
        let mut inner = self.write()?;
        if inner.owner_of(&record.conversation_id).is_none() {
            return Err(StoreError::Rejected {
                status: 409,
                message: format!("unknown conversation {}", record.conversation_id),
            });
        }
        let message = Self::create_message(
            &mut inner,
            &record.conversation_id,
            record.role,
            &record.content,
            now_ms,
        );
        if !inner.push_paused {
            inner.push_to_owner(&message);
        }
        Ok(message)
    }

    async fn subscribe(&self, user_id: &str) -> Result<Subscription, StoreError> {
        let mut inner = self.write()?;
        inner.calls.subscribes += 1;
        if Inner::take_fault(&mut inner.faults.subscribes) {
            return Err(StoreError::Unavailable(
                "injected subscribe failure".to_owned(),
            ));
        }

        let (tx, events) = mpsc::channel(SUBSCRIPTION_BUFFER);
        // Fresh channel with spare capacity: cannot fail.
        let _ = tx.try_send(SubscriptionEvent::Subscribed);
        let id = inner.next_subscription_id;
        inner.next_subscription_id += 1;
        inner.subscribers.insert(
            id,
            Subscriber {
                user_id: user_id.to_owned(),
                tx,
            },
        );
        debug!(subscription_id = id, %user_id, "subscription opened");
        Ok(Subscription { id, events })
    }

    fn unsubscribe(&self, subscription_id: u64) {
        let mut inner = self.write_unpoisoned();
        if inner.subscribers.remove(&subscription_id).is_some() {
            inner.calls.unsubscribes += 1;
            debug!(subscription_id, "subscription released");
        }
    }

    async fn fetch_user_role(&self, user_id: &str) -> Result<UserRole, StoreError> {
        let mut inner = self.write()?;
        inner.calls.role_lookups += 1;
        Ok(inner
            .roles
            .get(user_id)
            .copied()
            .unwrap_or(UserRole::User))
    }
}
