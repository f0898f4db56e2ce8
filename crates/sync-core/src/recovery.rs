use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::types::{ConnectionHealth, ConnectionStatus};

/// Thresholds that decide when recovery is offered and when it runs by itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryPolicy {
    /// Affordance delay while the status is `error`.
    pub error_delay: Duration,
    /// Affordance delay for every other qualifying condition.
    pub default_delay: Duration,
    /// Live connections with quality below this qualify.
    pub quality_floor: u8,
    /// Consecutive failures that arm automatic recovery.
    pub failure_threshold: u32,
    pub max_automatic_attempts: u32,
    pub automatic_cooldown: Duration,
    /// Fetch window while the status is `error`.
    pub error_lookback: Duration,
    pub default_lookback: Duration,
    /// How far behind the newest known message a fetch may start.
    pub backtrack: Duration,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            error_delay: Duration::from_secs(5),
            default_delay: Duration::from_secs(10),
            quality_floor: 50,
            failure_threshold: 3,
            max_automatic_attempts: 2,
            automatic_cooldown: Duration::from_secs(30),
            error_lookback: Duration::from_secs(600),
            default_lookback: Duration::from_secs(300),
            backtrack: Duration::from_secs(180),
        }
    }
}

impl RecoveryPolicy {
    /// Whether the health warrants offering recovery.
    pub fn qualifies(&self, health: &ConnectionHealth) -> bool {
        match health.status {
            ConnectionStatus::Error | ConnectionStatus::Degraded => true,
            // Reconnecting after failures keeps the condition alive between retries.
            ConnectionStatus::Disconnected | ConnectionStatus::Connecting => {
                health.consecutive_failures > 0
            }
            ConnectionStatus::Connected => health.quality < self.quality_floor,
        }
    }

    pub fn visibility_delay(&self, health: &ConnectionHealth) -> Duration {
        if health.status == ConnectionStatus::Error {
            self.error_delay
        } else {
            self.default_delay
        }
    }

    pub fn wants_automatic(&self, health: &ConnectionHealth) -> bool {
        health.status == ConnectionStatus::Error
            && health.consecutive_failures >= self.failure_threshold
    }

    /// Lower bound (exclusive) on `created_at_ms` for a recovery fetch.
    pub fn window_start_ms(
        &self,
        health: &ConnectionHealth,
        now_ms: u64,
        last_known_ms: Option<u64>,
    ) -> u64 {
        let lookback = if health.status == ConnectionStatus::Error {
            self.error_lookback
        } else {
            self.default_lookback
        };
        let from_now = now_ms.saturating_sub(lookback.as_millis() as u64);
        match last_known_ms {
            Some(last) => from_now.max(last.saturating_sub(self.backtrack.as_millis() as u64)),
            None => from_now,
        }
    }
}

/// What started a recovery fetch.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryTrigger {
    Automatic,
    Manual,
    ForceRefresh,
}

/// Outcome of one recovery fetch. Zero fetched rows is still a success.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecoveryReport {
    pub trigger: RecoveryTrigger,
    pub fetched: usize,
    pub applied: usize,
    /// Stable error code when the fetch itself failed.
    pub error_code: Option<String>,
}

/// Why an automatic attempt did not start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutomaticRefusal {
    /// Health does not meet the error/failure threshold.
    NotArmed,
    BudgetExhausted,
    CoolingDown { remaining: Duration },
}

/// Tracks affordance visibility and the automatic-recovery budget.
#[derive(Debug, Clone)]
pub struct RecoveryOrchestrator {
    policy: RecoveryPolicy,
    visible: bool,
    pending_deadline: Option<Instant>,
    automatic_attempts: u32,
    last_automatic_at: Option<Instant>,
}

impl RecoveryOrchestrator {
    pub fn new(policy: RecoveryPolicy) -> Self {
        Self {
            policy,
            visible: false,
            pending_deadline: None,
            automatic_attempts: 0,
            last_automatic_at: None,
        }
    }

    pub fn policy(&self) -> &RecoveryPolicy {
        &self.policy
    }

    pub fn is_visible(&self) -> bool {
        self.visible
    }

    /// When the armed affordance delay elapses, if one is armed.
    pub fn deadline(&self) -> Option<Instant> {
        self.pending_deadline
    }

    pub fn automatic_attempts(&self) -> u32 {
        self.automatic_attempts
    }

    /// Feed the latest health. Returns `Some(visible)` when visibility changed.
    ///
    /// A qualifying condition arms the delay; it is not restarted while it keeps
    /// holding, but a worse status with a shorter delay pulls the deadline in.
    /// A non-qualifying condition disarms it and hides at once.
    pub fn observe(&mut self, health: &ConnectionHealth, now: Instant) -> Option<bool> {
        if health.status == ConnectionStatus::Connected && health.consecutive_failures == 0 {
            self.automatic_attempts = 0;
            self.last_automatic_at = None;
        }

        if self.policy.qualifies(health) {
            if !self.visible {
                let delay = self.policy.visibility_delay(health);
                let candidate = now + delay;
                match self.pending_deadline {
                    None => {
                        debug!(?delay, status = ?health.status, "recovery affordance armed");
                        self.pending_deadline = Some(candidate);
                    }
                    Some(armed) if candidate < armed => {
                        debug!(
                            ?delay,
                            status = ?health.status,
                            "recovery affordance brought forward"
                        );
                        self.pending_deadline = Some(candidate);
                    }
                    Some(_) => {}
                }
            }
            return None;
        }

        self.pending_deadline = None;
        if self.visible {
            self.visible = false;
            debug!("recovery affordance hidden");
            return Some(false);
        }
        None
    }

    /// Show the affordance if its armed delay has elapsed.
    pub fn fire_due(&mut self, now: Instant) -> Option<bool> {
        let deadline = self.pending_deadline?;
        if now < deadline {
            return None;
        }
        self.pending_deadline = None;
        self.visible = true;
        info!("recovery affordance shown");
        Some(true)
    }

    /// Claim an automatic attempt if health, budget and cooldown allow it.
    pub fn try_begin_automatic(
        &mut self,
        health: &ConnectionHealth,
        now: Instant,
    ) -> Result<u32, AutomaticRefusal> {
        if !self.policy.wants_automatic(health) {
            return Err(AutomaticRefusal::NotArmed);
        }
        if self.automatic_attempts >= self.policy.max_automatic_attempts {
            return Err(AutomaticRefusal::BudgetExhausted);
        }
        if let Some(last) = self.last_automatic_at {
            let elapsed = now.saturating_duration_since(last);
            if elapsed < self.policy.automatic_cooldown {
                return Err(AutomaticRefusal::CoolingDown {
                    remaining: self.policy.automatic_cooldown - elapsed,
                });
            }
        }

        self.automatic_attempts += 1;
        self.last_automatic_at = Some(now);
        info!(
            attempt = self.automatic_attempts,
            failures = health.consecutive_failures,
            "automatic recovery started"
        );
        Ok(self.automatic_attempts)
    }

    pub fn reset(&mut self) {
        *self = Self::new(self.policy);
    }
}
