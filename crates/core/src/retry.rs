//! Bounded conflict retry. A conflict means a fresher object is already
//! available, so retries are immediate unless jitter is configured.

use std::time::Duration;

use rand::Rng;
use tracing::debug;

use crate::config::env_or;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictPolicy {
    /// Total attempts, including the first one. Never below 1.
    pub max_attempts: u32,
    /// Upper bound of a random pause between attempts. Zero = retry
    /// immediately.
    pub jitter: Duration,
}

impl Default for ConflictPolicy {
    fn default() -> Self {
        Self { max_attempts: 5, jitter: Duration::ZERO }
    }
}

impl ConflictPolicy {
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self { max_attempts: attempts.max(1), ..Default::default() }
    }

    /// `KEEL_CONFLICT_MAX_ATTEMPTS`, `KEEL_CONFLICT_JITTER_MS`.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            max_attempts: env_or("KEEL_CONFLICT_MAX_ATTEMPTS", d.max_attempts).max(1),
            jitter: Duration::from_millis(env_or("KEEL_CONFLICT_JITTER_MS", 0u64)),
        }
    }

    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Pause before the next attempt.
    pub async fn pause(&self) {
        let max_ms = self.jitter.as_millis() as u64;
        if max_ms == 0 {
            return;
        }
        let ms = rand::thread_rng().gen_range(0..=max_ms);
        debug!(pause_ms = ms, max_ms, "conflict retry jitter");
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }
}
