use std::collections::{HashMap, HashSet};

use tracing::{debug, trace};

use crate::types::{Message, MessageId, MessageSource};

/// Default window within which equal content counts as the same logical message.
pub const DEFAULT_DUPLICATE_WINDOW_MS: u64 = 1_000;

/// Why an incoming instance was classified as a repeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicateReason {
    SameId,
    /// Same conversation and content, created within the window of `matched`.
    SameContent { matched: MessageId },
}

/// Decision for one incoming message instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// First sighting of this logical message; apply it.
    Fresh,
    /// Repeat of an already applied logical message; drop it.
    Duplicate(DuplicateReason),
}

impl Admission {
    pub fn is_fresh(self) -> bool {
        matches!(self, Self::Fresh)
    }
}

/// Collapses push, poll, recovery and local copies into one applied instance.
///
/// Matching by content inside a time window is a heuristic: two distinct
/// messages with identical text sent within the window collapse into one.
#[derive(Debug, Clone)]
pub struct MessageDeduplicator {
    window_ms: u64,
    seen_ids: HashSet<MessageId>,
    by_content: HashMap<(String, String), Vec<(MessageId, u64)>>,
}

impl Default for MessageDeduplicator {
    fn default() -> Self {
        Self::new(DEFAULT_DUPLICATE_WINDOW_MS)
    }
}

impl MessageDeduplicator {
    pub fn new(window_ms: u64) -> Self {
        Self {
            window_ms,
            seen_ids: HashSet::new(),
            by_content: HashMap::new(),
        }
    }

    /// Classify an incoming instance. Its id is remembered either way, but only
    /// fresh instances anchor the content window, so repeats cannot extend it.
    pub fn admit(&mut self, message: &Message, source: MessageSource) -> Admission {
        let admission = self.classify(message);
        match admission {
            Admission::Fresh => self.remember(message),
            Admission::Duplicate(_) => {
                self.seen_ids.insert(message.id);
            }
        }

        match admission {
            Admission::Fresh => trace!(
                id = %message.id,
                conversation_id = %message.conversation_id,
                ?source,
                "admitted message"
            ),
            Admission::Duplicate(reason) => debug!(
                id = %message.id,
                conversation_id = %message.conversation_id,
                ?source,
                ?reason,
                "dropped duplicate message"
            ),
        }
        admission
    }

    /// Record an instance that was applied outside [`Self::admit`], such as loaded history.
    pub fn observe(&mut self, message: &Message) {
        self.remember(message);
    }

    pub fn contains(&self, id: MessageId) -> bool {
        self.seen_ids.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.seen_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen_ids.is_empty()
    }

    pub fn reset(&mut self) {
        self.seen_ids.clear();
        self.by_content.clear();
    }

    fn classify(&self, message: &Message) -> Admission {
        if self.seen_ids.contains(&message.id) {
            return Admission::Duplicate(DuplicateReason::SameId);
        }

        let key = (message.conversation_id.clone(), message.content.clone());
        let matched = self.by_content.get(&key).and_then(|instances| {
            instances.iter().find(|(_, created_at_ms)| {
                created_at_ms.abs_diff(message.created_at_ms) < self.window_ms
            })
        });

        match matched {
            Some((id, _)) => Admission::Duplicate(DuplicateReason::SameContent { matched: *id }),
            None => Admission::Fresh,
        }
    }

    /// Anchor `message` for content matching and drop anchors that fell out of
    /// the window of the newest one under the same key.
    fn remember(&mut self, message: &Message) {
        if !self.seen_ids.insert(message.id) {
            return;
        }
        let window_ms = self.window_ms;
        let instances = self
            .by_content
            .entry((message.conversation_id.clone(), message.content.clone()))
            .or_default();
        instances.push((message.id, message.created_at_ms));
        let newest = instances
            .iter()
            .map(|(_, created_at_ms)| *created_at_ms)
            .max()
            .unwrap_or(message.created_at_ms);
        instances.retain(|(_, created_at_ms)| newest - created_at_ms < window_ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Role;

    fn message(id: u64, content: &str, created_at_ms: u64) -> Message {
        Message {
            id: MessageId(id),
            conversation_id: "c-1".to_owned(),
            role: Role::Assistant,
            content: content.to_owned(),
            created_at_ms,
        }
    }

    #[test]
    fn same_id_from_every_source_applies_once() {
        let mut dedupe = MessageDeduplicator::default();
        let original = message(7, "hello", 1_000);

        let sources = [
            MessageSource::Push,
            MessageSource::Poll,
            MessageSource::Recovery,
            MessageSource::Push,
        ];
        let fresh = sources
            .iter()
            .filter(|source| dedupe.admit(&original, **source).is_fresh())
            .count();
        assert_eq!(fresh, 1);
    }

    #[test]
    fn same_content_within_window_is_a_duplicate() {
        let mut dedupe = MessageDeduplicator::default();
        assert!(dedupe.admit(&message(1, "ping", 10_000), MessageSource::Local).is_fresh());

        let admission = dedupe.admit(&message(2, "ping", 10_999), MessageSource::Push);
        assert_eq!(
            admission,
            Admission::Duplicate(DuplicateReason::SameContent {
                matched: MessageId(1)
            })
        );
        // The surrogate id is remembered too.
        assert_eq!(
            dedupe.admit(&message(2, "ping", 10_999), MessageSource::Poll),
            Admission::Duplicate(DuplicateReason::SameId)
        );
    }

    #[test]
    fn same_content_outside_window_is_fresh() {
        let mut dedupe = MessageDeduplicator::default();
        dedupe.admit(&message(1, "ping", 10_000), MessageSource::Push);
        assert!(dedupe.admit(&message(2, "ping", 11_000), MessageSource::Push).is_fresh());
        assert!(dedupe.admit(&message(3, "ping", 8_500), MessageSource::Push).is_fresh());
    }

    #[test]
    fn dropped_repeats_do_not_stretch_the_window() {
        let mut dedupe = MessageDeduplicator::default();
        assert!(dedupe.admit(&message(1, "again", 0), MessageSource::Push).is_fresh());
        assert!(!dedupe.admit(&message(2, "again", 999), MessageSource::Push).is_fresh());
        assert!(dedupe.admit(&message(3, "again", 1_998), MessageSource::Push).is_fresh());
    }

    #[test]
    fn content_anchors_are_pruned_as_newer_ones_arrive() {
        let mut dedupe = MessageDeduplicator::default();
        for index in 0..50 {
            let tick = message(index, "tick", index * 5_000);
            assert!(dedupe.admit(&tick, MessageSource::Poll).is_fresh());
        }
        let key = ("c-1".to_owned(), "tick".to_owned());
        assert_eq!(dedupe.by_content[&key], vec![(MessageId(49), 245_000)]);
        assert_eq!(dedupe.len(), 50);
    }

    #[test]
    fn equal_content_in_another_conversation_is_fresh() {
        let mut dedupe = MessageDeduplicator::default();
        dedupe.admit(&message(1, "ok", 10_000), MessageSource::Push);

        let mut other = message(2, "ok", 10_000);
        other.conversation_id = "c-2".to_owned();
        assert!(dedupe.admit(&other, MessageSource::Push).is_fresh());
    }

    #[test]
    fn observed_history_blocks_later_copies() {
        let mut dedupe = MessageDeduplicator::default();
        dedupe.observe(&message(5, "from history", 1_000));
        assert!(dedupe.contains(MessageId(5)));
        assert!(!dedupe.admit(&message(5, "from history", 1_000), MessageSource::Push).is_fresh());
    }

    #[test]
    fn reset_forgets_everything() {
        let mut dedupe = MessageDeduplicator::default();
        dedupe.admit(&message(1, "a", 1), MessageSource::Push);
        dedupe.reset();
        assert!(dedupe.is_empty());
        assert!(dedupe.admit(&message(1, "a", 1), MessageSource::Push).is_fresh());
    }
}
