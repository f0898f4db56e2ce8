//! Per-session delivery runtime.
//!
//! A [`SessionController`] owns one signed-in user's subscription channel,
//! backup poller, recovery timers and tab set. Background tasks post their
//! results to the session actor, which is the only place tab and dedupe state
//! changes. [`spawn_runtime`] ties session lifetime to an [`AuthSession`].
//!
//! [`AuthSession`]: sync_store::AuthSession

/// Environment-backed reliability tuning.
pub mod config;
mod inbound;
/// Fixed-interval fallback polling.
pub mod poller;
/// Auth-driven session supervisor.
pub mod runtime;
/// Session actor and its caller handle.
pub mod session;
/// Push subscription ownership and resubscribe loop.
pub mod subscription;

pub use config::{ConfigError, ReliabilityConfig};
pub use poller::{BackupPoller, PollCursor};
pub use runtime::{RuntimeHandle, spawn_runtime, spawn_runtime_with_clock};
pub use session::{SessionController, SessionHandle, SessionSnapshot};
pub use subscription::SubscriptionChannel;
