//! Bounded FIFO archive of failed requests.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use tracing::{debug, warn};

use crate::request::FailedRequest;

/// Holds at most `capacity` failures; the oldest entry is evicted first.
#[derive(Debug)]
pub struct DeadLetterStore {
    capacity: usize,
    entries: Mutex<VecDeque<FailedRequest>>,
}

impl DeadLetterStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append a failure, returning the evicted entry if the store was full.
    pub fn push(&self, failed: FailedRequest) -> Option<FailedRequest> {
        if self.capacity == 0 {
            return Some(failed);
        }
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let evicted = if entries.len() >= self.capacity {
            entries.pop_front()
        } else {
            None
        };
        if let Some(old) = &evicted {
            warn!(
                event = "dead_letter.evicted",
                request_id = %old.request.id,
                capacity = self.capacity,
            );
        }
        debug!(
            event = "dead_letter.recorded",
            request_id = %failed.request.id,
            error_kind = %failed.error_kind,
            attempts = failed.attempts,
        );
        entries.push_back(failed);
        evicted
    }

    /// Remove and return up to `n` of the oldest entries.
    pub fn pop_oldest(&self, n: usize) -> Vec<FailedRequest> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let take = n.min(entries.len());
        entries.drain(..take).collect()
    }

    /// Copy of the current entries, oldest first.
    pub fn entries(&self) -> Vec<FailedRequest> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry, returning how many were removed.
    pub fn clear(&self) -> usize {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let n = entries.len();
        entries.clear();
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{Priority, RequestSnapshot};
    use chrono::Utc;
    use ravel_domain::{GenerateOptions, ModelError};

    fn failure(id: &str) -> FailedRequest {
        FailedRequest::new(
            RequestSnapshot {
                id: id.to_string(),
                priority: Priority::Normal,
                messages: vec![],
                options: GenerateOptions::default(),
                queued_at: Utc::now(),
            },
            &ModelError::Connection("reset".into()),
            1,
        )
    }

    #[test]
    fn test_keeps_most_recent_within_capacity() {
        let store = DeadLetterStore::new(3);
        for i in 0..5 {
            store.push(failure(&format!("r{i}")));
        }
        let ids: Vec<String> = store.entries().into_iter().map(|f| f.request.id).collect();
        assert_eq!(ids, vec!["r2", "r3", "r4"]);
    }

    #[test]
    fn test_push_reports_eviction() {
        let store = DeadLetterStore::new(1);
        assert!(store.push(failure("a")).is_none());
        let evicted = store.push(failure("b")).unwrap();
        assert_eq!(evicted.request.id, "a");
    }

    #[test]
    fn test_pop_oldest_and_clear() {
        let store = DeadLetterStore::new(10);
        for id in ["a", "b", "c"] {
            store.push(failure(id));
        }
        let popped = store.pop_oldest(1);
        assert_eq!(popped[0].request.id, "a");
        assert_eq!(store.pop_oldest(10).len(), 2);
        assert!(store.is_empty());

        store.push(failure("d"));
        assert_eq!(store.clear(), 1);
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn test_zero_capacity_stores_nothing() {
        let store = DeadLetterStore::new(0);
        assert!(store.push(failure("a")).is_some());
        assert!(store.is_empty());
    }
}
