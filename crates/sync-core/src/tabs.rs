use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    error::SyncError,
    types::{ConversationSummary, Message, Role},
};

/// Default number of conversations that may be open at once.
pub const MAX_TABS: usize = 3;

/// Client-side open instance of a conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConversationTab {
    pub id: String,
    pub conversation: ConversationSummary,
    /// Conversation not persisted yet (created on first send).
    pub placeholder: bool,
    /// Ascending by `created_at_ms`, no duplicate ids.
    pub messages: Vec<Message>,
    pub loading_messages: bool,
    pub unread_count: u32,
    #[serde(skip)]
    opened_seq: u64,
}

/// Lightweight row for tab strips.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TabView {
    pub tab_id: String,
    pub conversation_id: String,
    pub title: String,
    pub placeholder: bool,
    pub loading_messages: bool,
    pub unread_count: u32,
    pub message_count: usize,
    pub is_active: bool,
}

/// Tab strip snapshot emitted on every tab-set change.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TabsSnapshot {
    pub tabs: Vec<TabView>,
    pub active_tab_id: Option<String>,
}

/// Result of opening a conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenOutcome {
    /// Conversation already had a tab; it is now active. No reload happens.
    Focused { tab_id: String },
    /// A new tab was created in the loading state.
    Created {
        tab_id: String,
        evicted: Option<ConversationTab>,
    },
}

impl OpenOutcome {
    pub fn tab_id(&self) -> &str {
        match self {
            Self::Focused { tab_id } | Self::Created { tab_id, .. } => tab_id,
        }
    }
}

/// Result of routing one admitted message to the tab set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// No open tab shows the message's conversation.
    NoOpenTab,
    /// The tab already holds a message with this id.
    AlreadyPresent { tab_id: String },
    Applied {
        tab_id: String,
        /// `true` for assistant messages; callers notify "assistant replied".
        assistant_reply: bool,
        unread_count: u32,
    },
}

/// Bounded, insertion-ordered set of open conversation tabs with one active pointer.
#[derive(Debug, Clone)]
pub struct ConversationTabManager {
    tabs: Vec<ConversationTab>,
    active_tab_id: Option<String>,
    max_tabs: usize,
    next_seq: u64,
}

impl Default for ConversationTabManager {
    fn default() -> Self {
        Self::new(MAX_TABS)
    }
}

impl ConversationTabManager {
    /// Create a manager with a tab budget (`max_tabs >= 1`).
    pub fn new(max_tabs: usize) -> Self {
        Self {
            tabs: Vec::new(),
            active_tab_id: None,
            max_tabs: max_tabs.max(1),
            next_seq: 0,
        }
    }

    pub fn tabs(&self) -> &[ConversationTab] {
        &self.tabs
    }

    pub fn tab(&self, tab_id: &str) -> Option<&ConversationTab> {
        self.tabs.iter().find(|tab| tab.id == tab_id)
    }

    pub fn tab_for_conversation(&self, conversation_id: &str) -> Option<&ConversationTab> {
        self.tabs
            .iter()
            .find(|tab| tab.conversation.id == conversation_id)
    }

    pub fn active_tab_id(&self) -> Option<&str> {
        self.active_tab_id.as_deref()
    }

    pub fn active_tab(&self) -> Option<&ConversationTab> {
        self.tab(self.active_tab_id.as_deref()?)
    }

    /// Open a stored conversation, reusing its tab if one exists.
    pub fn open(&mut self, conversation: ConversationSummary) -> Result<OpenOutcome, SyncError> {
        if let Some(tab_id) = self
            .tab_for_conversation(&conversation.id)
            .map(|tab| tab.id.clone())
        {
            self.set_active(&tab_id)?;
            return Ok(OpenOutcome::Focused { tab_id });
        }
        self.insert_tab(conversation, false)
    }

    /// Open a not-yet-persisted conversation. Nothing to load, so it starts ready.
    pub fn open_placeholder(
        &mut self,
        conversation: ConversationSummary,
    ) -> Result<OpenOutcome, SyncError> {
        self.insert_tab(conversation, true)
    }

    /// Merge the initial history into a loading tab and mark it ready.
    ///
    /// Messages applied while the load was in flight are kept. Returns `false`
    /// when the tab was closed or evicted in the meantime.
    pub fn finish_loading(&mut self, tab_id: &str, history: Vec<Message>) -> bool {
        let Some(tab) = self.tab_mut(tab_id) else {
            debug!(%tab_id, "history arrived for a tab that is gone");
            return false;
        };

        for message in history {
            if !tab.messages.iter().any(|existing| existing.id == message.id) {
                tab.messages.push(message);
            }
        }
        tab.messages.sort_by_key(|message| message.created_at_ms);
        tab.loading_messages = false;
        debug!(%tab_id, message_count = tab.messages.len(), "tab history loaded");
        true
    }

    /// Leave a tab ready with whatever it holds after a failed history load.
    pub fn fail_loading(&mut self, tab_id: &str) -> bool {
        match self.tab_mut(tab_id) {
            Some(tab) => {
                tab.loading_messages = false;
                true
            }
            None => false,
        }
    }

    /// Replace a placeholder's conversation with the stored record.
    pub fn bind_conversation(&mut self, tab_id: &str, conversation: ConversationSummary) -> bool {
        let Some(tab) = self.tab_mut(tab_id) else {
            return false;
        };
        debug!(
            %tab_id,
            conversation_id = %conversation.id,
            "placeholder bound to stored conversation"
        );
        tab.conversation = conversation;
        tab.placeholder = false;
        true
    }

    /// Close a tab. If it was active, the first remaining tab becomes active.
    pub fn close(&mut self, tab_id: &str) -> Option<ConversationTab> {
        let index = self.tabs.iter().position(|tab| tab.id == tab_id)?;
        let removed = self.tabs.remove(index);

        if self.active_tab_id.as_deref() == Some(tab_id) {
            self.active_tab_id = None;
            if let Some(next) = self.tabs.first().map(|tab| tab.id.clone()) {
                // Infallible: the id was just read from the set.
                let _ = self.set_active(&next);
            }
        }
        info!(%tab_id, conversation_id = %removed.conversation.id, "tab closed");
        Some(removed)
    }

    /// Switch the active pointer and clear that tab's unread counter.
    pub fn set_active(&mut self, tab_id: &str) -> Result<(), SyncError> {
        let tab = self
            .tab_mut(tab_id)
            .ok_or_else(|| SyncError::tab_not_found(tab_id))?;
        tab.unread_count = 0;
        self.active_tab_id = Some(tab_id.to_owned());
        Ok(())
    }

    /// Route an admitted message to the tab showing its conversation.
    pub fn apply_message(&mut self, message: &Message) -> ApplyOutcome {
        let active_tab_id = self.active_tab_id.clone();
        let Some(tab) = self
            .tabs
            .iter_mut()
            .find(|tab| tab.conversation.id == message.conversation_id)
        else {
            return ApplyOutcome::NoOpenTab;
        };

        if tab.messages.iter().any(|existing| existing.id == message.id) {
            return ApplyOutcome::AlreadyPresent {
                tab_id: tab.id.clone(),
            };
        }

        let index = tab
            .messages
            .partition_point(|existing| existing.created_at_ms <= message.created_at_ms);
        tab.messages.insert(index, message.clone());

        let assistant_reply = message.role == Role::Assistant;
        if assistant_reply && active_tab_id.as_deref() != Some(tab.id.as_str()) {
            tab.unread_count = tab.unread_count.saturating_add(1);
        }

        ApplyOutcome::Applied {
            tab_id: tab.id.clone(),
            assistant_reply,
            unread_count: tab.unread_count,
        }
    }

    /// Newest `created_at_ms` across all open tabs.
    pub fn latest_message_ms(&self) -> Option<u64> {
        self.tabs
            .iter()
            .filter_map(|tab| tab.messages.last())
            .map(|message| message.created_at_ms)
            .max()
    }

    pub fn snapshot(&self) -> TabsSnapshot {
        TabsSnapshot {
            tabs: self
                .tabs
                .iter()
                .map(|tab| TabView {
                    tab_id: tab.id.clone(),
                    conversation_id: tab.conversation.id.clone(),
                    title: tab.conversation.title.clone(),
                    placeholder: tab.placeholder,
                    loading_messages: tab.loading_messages,
                    unread_count: tab.unread_count,
                    message_count: tab.messages.len(),
                    is_active: self.active_tab_id.as_deref() == Some(tab.id.as_str()),
                })
                .collect(),
            active_tab_id: self.active_tab_id.clone(),
        }
    }

    pub fn clear(&mut self) {
        self.tabs.clear();
        self.active_tab_id = None;
    }

    fn insert_tab(
        &mut self,
        conversation: ConversationSummary,
        placeholder: bool,
    ) -> Result<OpenOutcome, SyncError> {
        let evicted = if self.tabs.len() >= self.max_tabs {
            Some(self.evict_oldest_inactive()?)
        } else {
            None
        };

        let tab_id = Uuid::new_v4().to_string();
        info!(
            %tab_id,
            conversation_id = %conversation.id,
            placeholder,
            "tab opened"
        );
        self.tabs.push(ConversationTab {
            id: tab_id.clone(),
            conversation,
            placeholder,
            messages: Vec::new(),
            loading_messages: !placeholder,
            unread_count: 0,
            opened_seq: self.next_seq,
        });
        self.next_seq += 1;
        self.set_active(&tab_id)?;

        Ok(OpenOutcome::Created { tab_id, evicted })
    }

    fn evict_oldest_inactive(&mut self) -> Result<ConversationTab, SyncError> {
        let active = self.active_tab_id.as_deref();
        let index = self
            .tabs
            .iter()
            .enumerate()
            .filter(|(_, tab)| Some(tab.id.as_str()) != active)
            .min_by_key(|(_, tab)| tab.opened_seq)
            .map(|(index, _)| index);

        let Some(index) = index else {
            warn!(max_tabs = self.max_tabs, "tab budget reached with no evictable tab");
            return Err(SyncError::tab_capacity(self.max_tabs));
        };

        let evicted = self.tabs.remove(index);
        info!(
            tab_id = %evicted.id,
            conversation_id = %evicted.conversation.id,
            "evicted oldest inactive tab"
        );
        Ok(evicted)
    }

    fn tab_mut(&mut self, tab_id: &str) -> Option<&mut ConversationTab> {
        self.tabs.iter_mut().find(|tab| tab.id == tab_id)
    }
}
