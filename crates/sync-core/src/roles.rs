use std::{collections::HashMap, time::Duration};

use tokio::time::Instant;

use crate::types::UserRole;

/// Default lifetime of a cached role lookup.
pub const DEFAULT_ROLE_TTL: Duration = Duration::from_secs(300);

/// Role lookups cached for a fixed TTL.
///
/// Owned by one session, so sign-out discards it along with the session.
#[derive(Debug, Clone)]
pub struct RoleCache {
    ttl: Duration,
    entries: HashMap<String, (UserRole, Instant)>,
}

impl Default for RoleCache {
    fn default() -> Self {
        Self::new(DEFAULT_ROLE_TTL)
    }
}

impl RoleCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
        }
    }

    /// Cached role, unless the entry is missing or older than the TTL.
    pub fn get(&self, user_id: &str, now: Instant) -> Option<UserRole> {
        let (role, stored_at) = self.entries.get(user_id)?;
        (now.saturating_duration_since(*stored_at) < self.ttl).then_some(*role)
    }

    pub fn insert(&mut self, user_id: impl Into<String>, role: UserRole, now: Instant) {
        self.entries.insert(user_id.into(), (role, now));
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
