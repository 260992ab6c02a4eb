use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Exponential reconnect curve: `base * 2^(attempt-1)`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Backoff {
    pub base_ms: u64,
    pub max_ms: u64,
    pub max_retries: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base_ms: 100,
            max_ms: 5_000,
            max_retries: 8,
        }
    }
}

impl Backoff {
    /// Delay before reconnect attempt number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = attempt.saturating_sub(1).min(31);
        let millis = self.base_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(millis.min(self.max_ms))
    }

    pub fn exhausted(&self, attempt: u32) -> bool {
        attempt > self.max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_doubles_then_caps() {
        let backoff = Backoff {
            base_ms: 100,
            max_ms: 1_000,
            max_retries: 5,
        };
        assert_eq!(backoff.delay(0), Duration::ZERO);
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(2), Duration::from_millis(200));
        assert_eq!(backoff.delay(4), Duration::from_millis(800));
        assert_eq!(backoff.delay(5), Duration::from_millis(1_000));
        assert_eq!(backoff.delay(u32::MAX), Duration::from_millis(1_000));
    }

    #[test]
    fn test_exhaustion() {
        let backoff = Backoff::default();
        assert!(!backoff.exhausted(backoff.max_retries));
        assert!(backoff.exhausted(backoff.max_retries + 1));
    }
}
