//! Queue error types.

use ravel_domain::ModelError;

/// Errors returned by [`RequestQueue`](crate::RequestQueue).
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum QueueError {
    #[error("queue full: depth {depth} reached max depth {max_depth}")]
    Full { depth: usize, max_depth: usize },

    #[error("request queue is shut down")]
    ShutDown,

    #[error("queue worker dropped request {request_id} without a result")]
    Dropped { request_id: String },

    #[error(transparent)]
    Model(#[from] ModelError),
}

impl QueueError {
    pub fn is_retriable(&self) -> bool {
        match self {
            QueueError::Full { .. } => true,
            QueueError::ShutDown | QueueError::Dropped { .. } => false,
            QueueError::Model(e) => e.is_retriable(),
        }
    }
}

impl From<QueueError> for ModelError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::Model(e) => e,
            QueueError::Full { .. } => ModelError::RateLimited(err.to_string()),
            QueueError::ShutDown | QueueError::Dropped { .. } => {
                ModelError::Connection(err.to_string())
            }
        }
    }
}

/// Result type for queue operations.
pub type QueueResult<T> = std::result::Result<T, QueueError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_error_passes_through() {
        let err = QueueError::from(ModelError::Configuration("no key".into()));
        assert_eq!(err.to_string(), "invalid model configuration: no key");
        assert!(!err.is_retriable());
        assert_eq!(
            ModelError::from(err),
            ModelError::Configuration("no key".into())
        );
    }

    #[test]
    fn test_full_maps_to_rate_limited() {
        let err = QueueError::Full {
            depth: 4,
            max_depth: 4,
        };
        assert!(err.is_retriable());
        assert!(matches!(ModelError::from(err), ModelError::RateLimited(_)));
    }
}
