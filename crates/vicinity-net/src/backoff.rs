//! Exponential backoff policy for reconnecting after abnormal closes.

use std::time::Duration;

use vicinity_shared::constants::{BACKOFF_BASE_MS, BACKOFF_CAP_MS, MAX_RECONNECT_ATTEMPTS};

/// Retry delay schedule: `min(base * 2^attempt, cap)`, giving up once the
/// attempt counter reaches the maximum.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub base_ms: u64,
    pub cap_ms: u64,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_ms: BACKOFF_BASE_MS,
            cap_ms: BACKOFF_CAP_MS,
            max_attempts: MAX_RECONNECT_ATTEMPTS,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before retry number `attempt` (1-indexed, incremented before
    /// calling). `None` means the limit is reached and no retry is scheduled.
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let delay = self.base_ms.saturating_mul(factor).min(self.cap_ms);
        Some(Duration::from_millis(delay))
    }
}
