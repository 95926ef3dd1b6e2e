use std::time::Duration;

use serde::Deserialize;

/// Tuning knobs of a [`FeedEngine`](crate::FeedEngine).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    /// Items requested per page.
    pub page_limit: u32,
    /// Delay between a committed mutation and its reconciliation refetch.
    pub settle_window_ms: u64,
    /// Give up on a mutation request after this long; unbounded if unset.
    pub mutation_timeout_ms: Option<u64>,
    /// Buffered [`FeedEvent`](crate::FeedEvent)s per subscriber.
    pub event_capacity: usize,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            page_limit: 20,
            settle_window_ms: 1500,
            mutation_timeout_ms: None,
            event_capacity: 256,
        }
    }
}

impl FeedConfig {
    pub fn settle_window(&self) -> Duration {
        Duration::from_millis(self.settle_window_ms)
    }

    pub fn mutation_timeout(&self) -> Option<Duration> {
        self.mutation_timeout_ms.map(Duration::from_millis)
    }
}
