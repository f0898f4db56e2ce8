use tracing::{debug, info, warn};

use crate::types::{ConnectionHealth, ConnectionStatus};

/// Quality below or at this value marks a live connection as degraded.
const DEGRADED_QUALITY: u8 = 50;
const DEFAULT_QUALITY: u8 = 100;

/// Client-observable connection signal fed into the monitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthEvent {
    /// The channel started acquiring a subscription.
    SubscribeRequested,
    SubscribeSuccess,
    SubscribeError { reason: String },
    SubscribeTimeout,
    Heartbeat { latency_ms: u64 },
    /// No signal for `silent_for_ms` while live; scored like a heartbeat of that latency.
    Stale { silent_for_ms: u64 },
    /// Explicit unsubscribe or channel teardown.
    DisconnectRequested,
}

/// Step function mapping heartbeat latency to a 0-100 quality score.
pub fn quality_for_latency(latency_ms: u64) -> u8 {
    match latency_ms {
        0..150 => 100,
        150..500 => 70,
        500..1_500 => 40,
        _ => 10,
    }
}

/// Deterministic connection health state machine driven only by reported events.
#[derive(Debug, Clone, Default)]
pub struct ConnectionHealthMonitor {
    health: ConnectionHealth,
    last_latency_ms: Option<u64>,
    last_signal_ms: Option<u64>,
}

impl ConnectionHealthMonitor {
    pub fn current(&self) -> ConnectionHealth {
        self.health
    }

    /// Apply one event. Returns the new snapshot when anything changed.
    pub fn report(&mut self, event: &HealthEvent, now_ms: u64) -> Option<ConnectionHealth> {
        let before = self.health;

        match event {
            HealthEvent::SubscribeRequested => {
                if matches!(
                    self.health.status,
                    ConnectionStatus::Disconnected | ConnectionStatus::Error
                ) {
                    self.health.status = ConnectionStatus::Connecting;
                    self.health.quality = 0;
                } else {
                    self.log_ignored(event);
                }
            }
            HealthEvent::SubscribeSuccess => {
                self.health.status = ConnectionStatus::Connected;
                self.health.consecutive_failures = 0;
                self.health.quality = self
                    .last_latency_ms
                    .map(quality_for_latency)
                    .unwrap_or(DEFAULT_QUALITY);
                self.last_signal_ms = Some(now_ms);
            }
            HealthEvent::SubscribeError { reason } => {
                warn!(
                    %reason,
                    failures = self.health.consecutive_failures + 1,
                    "subscription error"
                );
                self.record_failure();
            }
            HealthEvent::SubscribeTimeout => {
                warn!(failures = self.health.consecutive_failures + 1, "subscription timed out");
                self.record_failure();
            }
            HealthEvent::Heartbeat { latency_ms } => {
                if self.health.status.is_live() {
                    self.last_latency_ms = Some(*latency_ms);
                    self.last_signal_ms = Some(now_ms);
                    self.health.last_heartbeat_ms = Some(now_ms);
                    self.health.consecutive_failures = 0;
                    self.score(*latency_ms);
                } else {
                    self.log_ignored(event);
                }
            }
            HealthEvent::Stale { silent_for_ms } => {
                if self.health.status.is_live() {
                    self.score(*silent_for_ms);
                } else {
                    self.log_ignored(event);
                }
            }
            HealthEvent::DisconnectRequested => {
                self.health.status = ConnectionStatus::Disconnected;
                self.health.quality = 0;
                self.last_signal_ms = None;
            }
        }

        if self.health == before {
            return None;
        }
        info!(
            from = ?before.status,
            to = ?self.health.status,
            quality = self.health.quality,
            failures = self.health.consecutive_failures,
            "connection health changed"
        );
        Some(self.health)
    }

    /// Silence duration when live and nothing was heard for longer than `window_ms`.
    pub fn stale_for(&self, now_ms: u64, window_ms: u64) -> Option<u64> {
        if !self.health.status.is_live() {
            return None;
        }
        let silent = now_ms.saturating_sub(self.last_signal_ms?);
        (silent > window_ms).then_some(silent)
    }

    /// Count traffic on a live channel (a pushed row) as proof of life for
    /// [`Self::stale_for`]. Status and quality are left to heartbeats.
    pub fn note_activity(&mut self, now_ms: u64) {
        if self.health.status.is_live() {
            self.last_signal_ms = Some(now_ms);
        }
    }

    /// Return to the initial no-session state.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    fn record_failure(&mut self) {
        self.health.status = ConnectionStatus::Error;
        self.health.quality = 0;
        self.health.consecutive_failures = self.health.consecutive_failures.saturating_add(1);
        self.last_signal_ms = None;
    }

    fn score(&mut self, latency_ms: u64) {
        let quality = quality_for_latency(latency_ms);
        self.health.latency_ms = latency_ms;
        self.health.quality = quality;
        self.health.status = if quality <= DEGRADED_QUALITY {
            ConnectionStatus::Degraded
        } else {
            ConnectionStatus::Connected
        };
    }

    fn log_ignored(&self, event: &HealthEvent) {
        debug!(?event, status = ?self.health.status, "health event ignored in current state");
    }
}
