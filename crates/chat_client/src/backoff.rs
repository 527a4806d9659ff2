use std::time::Duration;

use crate::settings::ReconnectSettings;

/// Capped exponential backoff for reconnect attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl ReconnectPolicy {
    /// Delay before the given zero-based attempt, or `None` once attempts are exhausted.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        let delay = self
            .initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay);
        Some(delay.min(self.max_delay))
    }
}

impl From<&ReconnectSettings> for ReconnectPolicy {
    fn from(value: &ReconnectSettings) -> Self {
        Self {
            initial_delay: Duration::from_millis(value.initial_delay_ms),
            max_delay: Duration::from_millis(value.max_delay_ms),
            max_attempts: value.max_attempts,
        }
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from(&ReconnectSettings::default())
    }
}
