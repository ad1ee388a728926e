//! Optimistic concurrency control for execution state writes
//!
//! The coarse lock prevents conflicts in the common case; OCC is the
//! correctness backstop against cross-process races (admin resume colliding
//! with a queue retry). Writers read, apply a pure delta, and retry with
//! jittered exponential backoff on version conflicts.

use rand::Rng;
use std::time::Duration;

/// OCC retry knobs
#[derive(Debug, Clone)]
pub struct OccConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for OccConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(50),
        }
    }
}

impl OccConfig {
    /// Backoff before retry `attempt` (1-based): `base·2^(attempt-1)` plus
    /// up to one base delay of jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = self.base_delay * 2u32.pow(attempt.saturating_sub(1).min(10));
        let jitter_ms = rand::thread_rng().gen_range(0..=self.base_delay.as_millis() as u64);
        exp + Duration::from_millis(jitter_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_with_attempts() {
        let config = OccConfig {
            max_retries: 5,
            base_delay: Duration::from_millis(50),
        };
        let first = config.backoff(1);
        let third = config.backoff(3);
        assert!(first >= Duration::from_millis(50));
        assert!(first <= Duration::from_millis(100));
        assert!(third >= Duration::from_millis(200));
        assert!(third <= Duration::from_millis(250));
    }
}
