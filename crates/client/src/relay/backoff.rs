use std::time::Duration;

/// Reconnection parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(30),
            max_attempts: u32::MAX, // retry indefinitely
        }
    }
}

impl ReconnectPolicy {
    /// Never reconnect on its own; a dropped relay stays down until the
    /// next explicit `connect()`.
    pub fn disabled() -> Self {
        Self { max_attempts: 0, ..Self::default() }
    }

    /// Whether another attempt is allowed after `consecutive_failures`.
    pub fn should_retry(&self, consecutive_failures: u32) -> bool {
        consecutive_failures < self.max_attempts
    }

    /// Delay before the retry that follows `consecutive_failures` failures.
    /// The first retry waits `base_delay`; each further failure doubles it
    /// up to `max_delay`.
    pub fn delay_for(&self, consecutive_failures: u32) -> Duration {
        let exp = consecutive_failures.saturating_sub(1).min(7);
        self.base_delay.saturating_mul(1u32 << exp).min(self.max_delay)
    }
}
