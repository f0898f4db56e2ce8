use std::{
    fmt::Debug,
    time::{SystemTime, UNIX_EPOCH},
};

use tokio::time::Instant;

/// Wall-clock source in milliseconds since Unix epoch.
pub trait Clock: Send + Sync + Debug {
    fn now_ms(&self) -> u64;
}

/// Wall clock anchored once and advanced by tokio's clock.
///
/// Under a paused tokio runtime the wall clock moves only when tokio time
/// does, which keeps timestamps and timers consistent in tests.
#[derive(Debug, Clone, Copy)]
pub struct TokioClock {
    base_ms: u64,
    base: Instant,
}

impl TokioClock {
    pub fn starting_now() -> Self {
        let base_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis() as u64)
            .unwrap_or_default();
        Self::starting_at(base_ms)
    }

    pub fn starting_at(base_ms: u64) -> Self {
        Self {
            base_ms,
            base: Instant::now(),
        }
    }
}

impl Clock for TokioClock {
    fn now_ms(&self) -> u64 {
        self.base_ms + self.base.elapsed().as_millis() as u64
    }
}
