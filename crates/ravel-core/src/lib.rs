//! Ravel Core - the agent execution loop
//!
//! Layer 2 crate providing:
//! - `Agent`: the ReAct step state machine
//! - Planning, divergence tracking and evaluation checkpoints
//! - Reflection on failed steps and a bounded self-refinement loop
//! - Observation routing and parallel tool execution with early yield
//! - Configuration, metrics and tracing setup

pub mod agent;
pub mod config;
pub mod divergence;
pub mod error;
pub mod evaluation;
pub mod memory;
pub mod metrics;
pub mod obs;
pub mod parallel;
pub mod planning;
pub mod prompts;
pub mod refinement;
pub mod reflection;
pub mod routing;
pub mod step;
pub mod telemetry;

pub use agent::{extract_code, Agent, RunResult, RunState};
pub use config::{
    AgentConfig, EvaluationConfig, FeedbackSource, ParallelToolsConfig, ReflectionConfig,
    RefinementConfig, RoutingConfig,
};
pub use divergence::{DivergenceLevel, DivergenceTracker};
pub use error::{AgentError, Result};
pub use evaluation::{parse_evaluation, EvaluationStatus, EvaluationVerdict, Evaluator};
pub use memory::AgentMemory;
pub use metrics::METRICS;
pub use parallel::{
    execute_parallel, non_empty_success, ParallelOutcome, PendingCollector, QualityPredicate,
    ToolOutcome,
};
pub use planning::Planner;
pub use refinement::{refine, Feedback, ModelRefiner, RefinementResult, Refiner};
pub use reflection::{advice_for_error, Reflection, ReflectionOutcome, ReflectionStore};
pub use routing::{ModelRouter, ObservationRouter, PassThroughRouter, Route, RouteDecision};
pub use step::{
    read_transcript, write_transcript, ActionStep, FinalAnswerStep, NullStep, PlanningStep, Step,
    SystemPromptStep, TaskStep, Timing,
};
pub use telemetry::init_tracing;

/// Ravel version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
