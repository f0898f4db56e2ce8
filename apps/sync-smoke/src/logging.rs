//! Tracing bootstrap for the smoke binary.

use std::env;

use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,sync_runtime=debug,sync_smoke=debug";

/// Filter variables consulted after `RUST_LOG`, most specific first.
const FILTER_VARS: [&str; 2] = ["CHATSYNC_SMOKE_LOG", "CHATSYNC_LOG"];

/// Install the global subscriber.
///
/// `RUST_LOG` wins, then the first non-empty parseable entry of
/// [`FILTER_VARS`], then [`DEFAULT_FILTER`].
pub fn init() {
    let _ = tracing_subscriber::fmt()
        .with_target(true)
        .with_env_filter(filter_from_env())
        .try_init();
}

fn filter_from_env() -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }

    FILTER_VARS
        .iter()
        .filter_map(|key| env::var(key).ok())
        .filter(|value| !value.trim().is_empty())
        .find_map(|value| EnvFilter::try_new(value).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_FILTER))
}
