//! Queue statistics.

use serde::{Deserialize, Serialize};

/// Counters maintained by the queue under its stats lock.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub rejected: u64,
    pub high_priority: u64,
    pub peak_depth: usize,
    pub total_wait_ms: u64,
    pub dead_lettered: u64,
    pub retried: u64,
    pub retry_succeeded: u64,
}

impl QueueStats {
    /// Mean time requests spent queued before the worker picked them up.
    pub fn average_wait_ms(&self) -> f64 {
        let processed = self.completed + self.failed;
        if processed == 0 {
            0.0
        } else {
            self.total_wait_ms as f64 / processed as f64
        }
    }

    pub(crate) fn record_depth(&mut self, depth: usize) {
        self.peak_depth = self.peak_depth.max(depth);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_average_wait() {
        let stats = QueueStats {
            completed: 3,
            failed: 1,
            total_wait_ms: 40,
            ..QueueStats::default()
        };
        assert!((stats.average_wait_ms() - 10.0).abs() < f64::EPSILON);
        assert_eq!(QueueStats::default().average_wait_ms(), 0.0);
    }

    #[test]
    fn test_peak_depth_is_monotonic() {
        let mut stats = QueueStats::default();
        stats.record_depth(3);
        stats.record_depth(1);
        assert_eq!(stats.peak_depth, 3);
    }
}
