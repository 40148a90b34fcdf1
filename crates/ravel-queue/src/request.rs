//! Queued and failed request records.

use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use ravel_domain::{AssistantMessage, ChatMessage, GenerateOptions, ModelError};

/// Scheduling class of a queued request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    #[default]
    Normal,
    /// Spliced to the front of the queue at enqueue time.
    High,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Normal => write!(f, "normal"),
            Priority::High => write!(f, "high"),
        }
    }
}

pub(crate) type ResultSender = oneshot::Sender<Result<AssistantMessage, ModelError>>;

/// A pending model call owned by the queue until the worker answers it.
///
/// The result channel receives exactly one value over its lifetime.
#[derive(Debug)]
pub struct QueuedRequest {
    pub id: String,
    pub priority: Priority,
    pub messages: Vec<ChatMessage>,
    pub options: GenerateOptions,
    pub queued_at: DateTime<Utc>,
    pub(crate) enqueued: Instant,
    pub(crate) result_tx: ResultSender,
}

impl QueuedRequest {
    pub(crate) fn new(
        priority: Priority,
        messages: Vec<ChatMessage>,
        options: GenerateOptions,
        result_tx: ResultSender,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            priority,
            messages,
            options,
            queued_at: Utc::now(),
            enqueued: Instant::now(),
            result_tx,
        }
    }

    pub(crate) fn snapshot(&self) -> RequestSnapshot {
        RequestSnapshot {
            id: self.id.clone(),
            priority: self.priority,
            messages: self.messages.clone(),
            options: self.options.clone(),
            queued_at: self.queued_at,
        }
    }

    /// Deliver the result, consuming the request.
    pub(crate) fn complete(self, result: Result<AssistantMessage, ModelError>) -> bool {
        self.result_tx.send(result).is_ok()
    }
}

/// Request data retained after the result channel is gone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestSnapshot {
    pub id: String,
    pub priority: Priority,
    pub messages: Vec<ChatMessage>,
    pub options: GenerateOptions,
    pub queued_at: DateTime<Utc>,
}

/// Immutable record of a failed request held by the dead-letter store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedRequest {
    pub request: RequestSnapshot,
    pub error_kind: String,
    pub error_message: String,
    pub retriable: bool,
    pub attempts: u32,
    pub failed_at: DateTime<Utc>,
}

impl FailedRequest {
    pub fn new(request: RequestSnapshot, error: &ModelError, attempts: u32) -> Self {
        Self {
            request,
            error_kind: error.kind().to_string(),
            error_message: error.to_string(),
            retriable: error.is_retriable(),
            attempts,
            failed_at: Utc::now(),
        }
    }

    /// New snapshot for a retry that failed again.
    pub fn retry_failed(&self, error: &ModelError) -> Self {
        Self::new(self.request.clone(), error, self.attempts + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> RequestSnapshot {
        RequestSnapshot {
            id: "req-1".into(),
            priority: Priority::Normal,
            messages: vec![ChatMessage::user("hi")],
            options: GenerateOptions::default(),
            queued_at: Utc::now(),
        }
    }

    #[test]
    fn test_failed_request_records_error() {
        let failed = FailedRequest::new(snapshot(), &ModelError::Timeout { elapsed_ms: 50 }, 1);
        assert_eq!(failed.error_kind, "timeout");
        assert!(failed.retriable);
        assert_eq!(failed.attempts, 1);
    }

    #[test]
    fn test_retry_failed_increments_attempts() {
        let failed = FailedRequest::new(snapshot(), &ModelError::Timeout { elapsed_ms: 50 }, 1);
        let again = failed.retry_failed(&ModelError::Connection("reset".into()));
        assert_eq!(again.attempts, 2);
        assert_eq!(again.error_kind, "connection");
        assert_eq!(again.request.id, "req-1");
    }

    #[test]
    fn test_priority_display() {
        assert_eq!(Priority::High.to_string(), "high");
        assert_eq!(Priority::default(), Priority::Normal);
    }
}
