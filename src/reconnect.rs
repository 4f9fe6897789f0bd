//! Reconnect policy and attempt bookkeeping.
//!
//! Reconnects use a fixed interval rather than exponential growth and stop
//! after a capped number of consecutive failures. Once the cap is reached the
//! channel stays down until the caller connects again explicitly.

use std::time::Duration;

use tracing::{debug, error};

/// Policy controlling automatic reconnect attempts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Maximum number of consecutive automatic attempts before giving up.
    pub max_attempts: u32,
    /// Fixed delay applied before every automatic attempt.
    pub interval: Duration,
}

impl ReconnectPolicy {
    /// Policy that never reconnects automatically.
    pub fn disabled() -> Self {
        Self {
            max_attempts: 0,
            interval: Duration::ZERO,
        }
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            interval: Duration::from_millis(3000),
        }
    }
}

/// Consecutive-failure counter driven by a [`ReconnectPolicy`].
#[derive(Clone, Debug)]
pub struct ReconnectState {
    policy: ReconnectPolicy,
    attempt_count: u32,
}

impl ReconnectState {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            attempt_count: 0,
        }
    }

    /// Number of automatic attempts scheduled since the last successful open.
    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    /// Clears the counter after a successful open.
    pub fn reset(&mut self) {
        self.attempt_count = 0;
    }

    /// Records an abnormal close and returns the delay before the next attempt.
    ///
    /// Returns `None` once `max_attempts` consecutive attempts have already
    /// been scheduled; the counter is left untouched in that case.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt_count >= self.policy.max_attempts {
            error!(
                event = "reconnect_exhausted",
                attempts = self.attempt_count,
                max_attempts = self.policy.max_attempts,
                "max reconnection attempts reached; call connect() to retry"
            );
            return None;
        }

        self.attempt_count += 1;
        debug!(
            event = "reconnect_scheduled",
            attempt = self.attempt_count,
            max_attempts = self.policy.max_attempts,
            delay_ms = self.policy.interval.as_millis() as u64
        );
        Some(self.policy.interval)
    }
}
