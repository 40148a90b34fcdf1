//! Ravel request queue (Layer 1)
//!
//! Serializes calls to model backends that cannot serve concurrent requests:
//! - `RequestQueue`: single background worker, FIFO with high-priority splicing
//! - `DeadLetterStore`: bounded archive of failed requests with manual retry
//! - `QueuedModel`: a `Model` adapter routing through a shared queue

pub mod config;
pub mod dead_letter;
pub mod error;
pub mod queue;
pub mod queued_model;
pub mod request;
pub mod stats;

pub use config::QueueConfig;
pub use dead_letter::DeadLetterStore;
pub use error::{QueueError, QueueResult};
pub use queue::{RequestQueue, RetryOutcome};
pub use queued_model::QueuedModel;
pub use request::{FailedRequest, Priority, QueuedRequest, RequestSnapshot};
pub use stats::QueueStats;
