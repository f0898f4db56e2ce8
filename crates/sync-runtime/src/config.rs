//! Environment-backed reliability tuning.

use std::{env, time::Duration};

use sync_core::{MAX_TABS, RecoveryPolicy, ResubscribePolicy};
use thiserror::Error;

const DEFAULT_POLL_INTERVAL_MS: u64 = 3_000;
const DEFAULT_POLL_BATCH_SIZE: usize = 5;
const DEFAULT_SILENCE_WINDOW_MS: u64 = 30_000;
const DEFAULT_MAX_CONVERSATIONS: usize = 3;
const DEFAULT_ROLE_CACHE_TTL_MS: u64 = 300_000;
const DEFAULT_DUPLICATE_WINDOW_MS: u64 = 1_000;
const DEFAULT_RESUBSCRIBE_BASE_MS: u64 = 1_000;
const DEFAULT_RESUBSCRIBE_MAX_MS: u64 = 30_000;
const DEFAULT_RESUBSCRIBE_ATTEMPTS: u32 = 5;

/// Tuning shared by every session the runtime starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReliabilityConfig {
    /// Whether the backup poller runs when a session starts.
    pub poll_enabled: bool,
    pub poll_interval: Duration,
    /// Upper bound on rows fetched per poll cycle.
    pub poll_batch_size: usize,
    /// Silence on a live connection longer than this counts as a missed heartbeat.
    pub silence_window: Duration,
    pub max_tabs: usize,
    /// Per-user cap enforced before a conversation is created.
    pub max_conversations: usize,
    pub role_cache_ttl: Duration,
    pub duplicate_window_ms: u64,
    pub resubscribe: ResubscribePolicy,
    /// Not read from the environment; override in code.
    pub recovery: RecoveryPolicy,
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        Self {
            poll_enabled: true,
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            poll_batch_size: DEFAULT_POLL_BATCH_SIZE,
            silence_window: Duration::from_millis(DEFAULT_SILENCE_WINDOW_MS),
            max_tabs: MAX_TABS,
            max_conversations: DEFAULT_MAX_CONVERSATIONS,
            role_cache_ttl: Duration::from_millis(DEFAULT_ROLE_CACHE_TTL_MS),
            duplicate_window_ms: DEFAULT_DUPLICATE_WINDOW_MS,
            resubscribe: ResubscribePolicy::default(),
            recovery: RecoveryPolicy::default(),
        }
    }
}

impl ReliabilityConfig {
    /// Parse configuration from `CHATSYNC_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Parse configuration through an arbitrary key lookup.
    pub fn from_lookup<F>(mut lookup: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let poll_enabled =
            parse_optional_bool("CHATSYNC_POLL_ENABLED", &mut lookup)?.unwrap_or(true);
        let poll_interval_ms =
            parse_u64_or("CHATSYNC_POLL_INTERVAL_MS", DEFAULT_POLL_INTERVAL_MS, &mut lookup)?;
        let poll_batch_size =
            parse_usize_or("CHATSYNC_POLL_BATCH_SIZE", DEFAULT_POLL_BATCH_SIZE, &mut lookup)?;
        let silence_window_ms =
            parse_u64_or("CHATSYNC_SILENCE_WINDOW_MS", DEFAULT_SILENCE_WINDOW_MS, &mut lookup)?;
        let max_tabs = parse_usize_or("CHATSYNC_MAX_TABS", MAX_TABS, &mut lookup)?;
        let max_conversations = parse_usize_or(
            "CHATSYNC_MAX_CONVERSATIONS",
            DEFAULT_MAX_CONVERSATIONS,
            &mut lookup,
        )?;
        let role_cache_ttl_ms =
            parse_u64_or("CHATSYNC_ROLE_CACHE_TTL_MS", DEFAULT_ROLE_CACHE_TTL_MS, &mut lookup)?;
        let duplicate_window_ms = parse_u64_or(
            "CHATSYNC_DUPLICATE_WINDOW_MS",
            DEFAULT_DUPLICATE_WINDOW_MS,
            &mut lookup,
        )?;
        let resubscribe_base_ms = parse_u64_or(
            "CHATSYNC_RESUBSCRIBE_BASE_MS",
            DEFAULT_RESUBSCRIBE_BASE_MS,
            &mut lookup,
        )?;
        let resubscribe_max_ms = parse_u64_or(
            "CHATSYNC_RESUBSCRIBE_MAX_MS",
            DEFAULT_RESUBSCRIBE_MAX_MS,
            &mut lookup,
        )?;
        let resubscribe_attempts = parse_u32_or(
            "CHATSYNC_RESUBSCRIBE_ATTEMPTS",
            DEFAULT_RESUBSCRIBE_ATTEMPTS,
            &mut lookup,
        )?;

        require_positive("CHATSYNC_POLL_INTERVAL_MS", poll_interval_ms)?;
        require_positive("CHATSYNC_POLL_BATCH_SIZE", poll_batch_size as u64)?;
        require_positive("CHATSYNC_MAX_TABS", max_tabs as u64)?;
        require_positive("CHATSYNC_MAX_CONVERSATIONS", max_conversations as u64)?;

        Ok(Self {
            poll_enabled,
            poll_interval: Duration::from_millis(poll_interval_ms),
            poll_batch_size,
            silence_window: Duration::from_millis(silence_window_ms),
            max_tabs,
            max_conversations,
            role_cache_ttl: Duration::from_millis(role_cache_ttl_ms),
            duplicate_window_ms,
            resubscribe: ResubscribePolicy::new(
                resubscribe_base_ms,
                resubscribe_max_ms,
                resubscribe_attempts,
            ),
            recovery: RecoveryPolicy::default(),
        })
    }
}

/// Errors produced while parsing runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// An environment variable could not be parsed or is out of range.
    #[error("invalid {key}='{value}': {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

fn require_positive(key: &'static str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::InvalidValue {
            key,
            value: "0".to_owned(),
            reason: "must be at least 1".to_owned(),
        });
    }
    Ok(())
}

fn trimmed<F>(key: &'static str, lookup: &mut F) -> Option<String>
where
    F: FnMut(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn parse_optional_bool<F>(key: &'static str, lookup: &mut F) -> Result<Option<bool>, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = trimmed(key, lookup) else {
        return Ok(None);
    };
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(Some(true)),
        "0" | "false" | "no" | "off" => Ok(Some(false)),
        _ => Err(ConfigError::InvalidValue {
            key,
            value,
            reason: "expected a boolean".to_owned(),
        }),
    }
}

fn parse_or<T, F>(key: &'static str, default: T, lookup: &mut F) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = trimmed(key, lookup) else {
        return Ok(default);
    };
    value.parse::<T>().map_err(|err| ConfigError::InvalidValue {
        key,
        reason: err.to_string(),
        value,
    })
}

fn parse_u64_or<F>(key: &'static str, default: u64, lookup: &mut F) -> Result<u64, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    parse_or(key, default, lookup)
}

fn parse_u32_or<F>(key: &'static str, default: u32, lookup: &mut F) -> Result<u32, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    parse_or(key, default, lookup)
}

fn parse_usize_or<F>(
    key: &'static str,
    default: usize,
    lookup: &mut F,
) -> Result<usize, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    parse_or(key, default, lookup)
}
