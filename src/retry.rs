//! Bounded retry for the write paths.
//!
//! Send and heartbeat retry with short escalating pauses and recovery
//! actions between attempts; reads (initial load, backfill) are never
//! retried automatically — the caller re-triggers those.

use std::time::Duration;

/// Attempt schedule for a retried write: one attempt, then one more after
/// each listed pause.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    delays: Vec<Duration>,
}

impl RetryPolicy {
    pub fn new(delays: Vec<Duration>) -> Self {
        Self { delays }
    }

    /// Total number of attempts, the initial one included.
    pub fn attempts(&self) -> usize {
        self.delays.len() + 1
    }

    /// The pause to take after a failed `attempt` (1-based), or `None` when
    /// the attempt was the last.
    pub fn delay_after(&self, attempt: usize) -> Option<Duration> {
        self.delays.get(attempt.saturating_sub(1)).copied()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(vec![Duration::from_millis(300), Duration::from_millis(800)])
    }
}
