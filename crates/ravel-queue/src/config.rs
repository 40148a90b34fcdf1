//! Queue configuration.

use serde::{Deserialize, Serialize};

/// Settings for [`RequestQueue`](crate::RequestQueue).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// When false, `queued_generate` calls the backend directly.
    pub enabled: bool,
    pub max_depth: usize,
    pub dead_letter_enabled: bool,
    pub dead_letter_capacity: usize,
    /// How long `shutdown` waits for the worker before aborting it.
    pub shutdown_grace_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_depth: 100,
            dead_letter_enabled: true,
            dead_letter_capacity: 100,
            shutdown_grace_ms: 5_000,
        }
    }
}

impl QueueConfig {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn with_dead_letter_capacity(mut self, capacity: usize) -> Self {
        self.dead_letter_enabled = capacity > 0;
        self.dead_letter_capacity = capacity;
        self
    }
}
