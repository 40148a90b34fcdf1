//! Side-channel runtime events.
//!
//! The core reports progress through an [`Emitter`]. When no [`EventSink`] is
//! attached, [`Emitter::emit_with`] never builds the event value.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Structured events emitted by the execution core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RuntimeEvent {
    StepCompleted {
        run_id: String,
        step_number: usize,
        duration_ms: u64,
        tool_calls: usize,
        is_final_answer: bool,
        error: Option<String>,
    },
    DivergenceDetected {
        run_id: String,
        step_number: usize,
        level: String,
        off_topic_count: u32,
    },
    QueueRequestStarted {
        request_id: String,
        priority: String,
        waited_ms: u64,
    },
    QueueRequestCompleted {
        request_id: String,
        success: bool,
        duration_ms: u64,
    },
    RefinementCompleted {
        run_id: String,
        step_number: usize,
        iterations: u32,
        improved: bool,
        confidence: f32,
    },
    ReflectionRecorded {
        run_id: String,
        step_number: usize,
        outcome: String,
    },
}

impl RuntimeEvent {
    /// Dotted event name used as the `event` field in tracing output.
    pub fn name(&self) -> &'static str {
        match self {
            RuntimeEvent::StepCompleted { .. } => "step.completed",
            RuntimeEvent::DivergenceDetected { .. } => "divergence.detected",
            RuntimeEvent::QueueRequestStarted { .. } => "queue.request_started",
            RuntimeEvent::QueueRequestCompleted { .. } => "queue.request_completed",
            RuntimeEvent::RefinementCompleted { .. } => "refinement.completed",
            RuntimeEvent::ReflectionRecorded { .. } => "reflection.recorded",
        }
    }
}

/// Subscriber for runtime events. Must not block.
pub trait EventSink: Send + Sync {
    fn handle(&self, event: &RuntimeEvent);
}

/// Optional event fan-out point carried by core components.
#[derive(Clone, Default)]
pub struct Emitter {
    sink: Option<Arc<dyn EventSink>>,
}

impl Emitter {
    /// An emitter with no subscriber.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self { sink: Some(sink) }
    }

    pub fn is_enabled(&self) -> bool {
        self.sink.is_some()
    }

    /// Build and deliver an event only when a sink is attached.
    pub fn emit_with<F>(&self, build: F)
    where
        F: FnOnce() -> RuntimeEvent,
    {
        if let Some(sink) = &self.sink {
            let event = build();
            tracing::trace!(event = event.name(), "runtime event emitted");
            sink.handle(&event);
        }
    }
}

impl std::fmt::Debug for Emitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Emitter")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::CollectingSink;

    #[test]
    fn test_emitter_without_sink_never_builds_event() {
        let emitter = Emitter::none();
        let mut built = false;
        emitter.emit_with(|| {
            built = true;
            RuntimeEvent::ReflectionRecorded {
                run_id: "r".into(),
                step_number: 1,
                outcome: "failure".into(),
            }
        });
        assert!(!built);
        assert!(!emitter.is_enabled());
    }

    #[test]
    fn test_emitter_delivers_to_sink() {
        let sink = Arc::new(CollectingSink::new());
        let emitter = Emitter::new(sink.clone());
        emitter.emit_with(|| RuntimeEvent::QueueRequestStarted {
            request_id: "req-1".into(),
            priority: "normal".into(),
            waited_ms: 3,
        });
        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name(), "queue.request_started");
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let ev = RuntimeEvent::DivergenceDetected {
            run_id: "r".into(),
            step_number: 4,
            level: "mild".into(),
            off_topic_count: 1,
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["event"], "divergence_detected");
        assert_eq!(json["level"], "mild");
    }
}
