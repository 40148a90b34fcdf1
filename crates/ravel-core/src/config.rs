//! Agent configuration.
//!
//! Loaded from TOML with every field optional, then overridable from the
//! environment:
//!
//! ```toml
//! max_steps = 12
//! planning_interval = 3
//!
//! [evaluation]
//! enabled = true
//! interval = 2
//!
//! [refinement]
//! enabled = true
//! source = "self"
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{AgentError, Result};

pub const ENV_MAX_STEPS: &str = "RAVEL_MAX_STEPS";
pub const ENV_PLANNING_INTERVAL: &str = "RAVEL_PLANNING_INTERVAL";
pub const ENV_EVALUATION_INTERVAL: &str = "RAVEL_EVALUATION_INTERVAL";

/// Where the refine loop gets its feedback from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackSource {
    /// Re-run the output through the code executor and report errors.
    #[default]
    Execution,
    /// Ask the model to critique its own output.
    #[serde(rename = "self")]
    SelfCritique,
    /// Reuse the evaluation verdict format.
    Evaluation,
}

impl std::fmt::Display for FeedbackSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FeedbackSource::Execution => write!(f, "execution"),
            FeedbackSource::SelfCritique => write!(f, "self"),
            FeedbackSource::Evaluation => write!(f, "evaluation"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluationConfig {
    pub enabled: bool,
    /// Evaluate after every `interval`-th step.
    pub interval: usize,
    /// Minimum confidence for a `DONE` verdict to end the run.
    pub done_confidence: f32,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: 1,
            done_confidence: 0.7,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefinementConfig {
    pub enabled: bool,
    pub max_iterations: u32,
    pub source: FeedbackSource,
}

impl Default for RefinementConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_iterations: 3,
            source: FeedbackSource::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParallelToolsConfig {
    pub enabled: bool,
}

impl Default for ParallelToolsConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Observations shorter than this skip the router entirely.
    pub min_chars: usize,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self { min_chars: 2_000 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReflectionConfig {
    pub enabled: bool,
    pub max_store: usize,
    /// Reflections injected into the system prompt of a new run.
    pub top_n: usize,
}

impl Default for ReflectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_store: 100,
            top_n: 3,
        }
    }
}

/// Top-level settings for an [`Agent`](crate::Agent).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub max_steps: usize,
    /// Plan on the first step and every `planning_interval` steps after.
    pub planning_interval: Option<usize>,
    pub evaluation: EvaluationConfig,
    pub refinement: RefinementConfig,
    pub parallel_tools: ParallelToolsConfig,
    pub routing: RoutingConfig,
    pub reflection: ReflectionConfig,
    /// Name substrings that mark a tool as retrieval-style.
    pub retrieval_tools: Vec<String>,
    /// Extra instructions appended to the system prompt.
    pub instructions: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_steps: 20,
            planning_interval: None,
            evaluation: EvaluationConfig::default(),
            refinement: RefinementConfig::default(),
            parallel_tools: ParallelToolsConfig::default(),
            routing: RoutingConfig::default(),
            reflection: ReflectionConfig::default(),
            retrieval_tools: ravel_domain::RetrievalMatcher::default().patterns,
            instructions: None,
        }
    }
}

impl AgentConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: AgentConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    /// Apply `RAVEL_*` overrides from the process environment.
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup (the environment in production).
    pub fn with_overrides_from<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(ENV_MAX_STEPS) {
            self.max_steps = parse_count(ENV_MAX_STEPS, &raw)?;
        }
        if let Some(raw) = lookup(ENV_PLANNING_INTERVAL) {
            let interval = parse_count(ENV_PLANNING_INTERVAL, &raw)?;
            self.planning_interval = (interval > 0).then_some(interval);
        }
        if let Some(raw) = lookup(ENV_EVALUATION_INTERVAL) {
            let interval = parse_count(ENV_EVALUATION_INTERVAL, &raw)?;
            self.evaluation.enabled = interval > 0;
            if interval > 0 {
                self.evaluation.interval = interval;
            }
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_steps == 0 {
            return Err(AgentError::InvalidConfig(
                "max_steps must be at least 1".into(),
            ));
        }
        if self.planning_interval == Some(0) {
            return Err(AgentError::InvalidConfig(
                "planning_interval must be at least 1 when set".into(),
            ));
        }
        if self.evaluation.interval == 0 {
            return Err(AgentError::InvalidConfig(
                "evaluation.interval must be at least 1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.evaluation.done_confidence) {
            return Err(AgentError::InvalidConfig(format!(
                "evaluation.done_confidence must be within 0..=1, got {}",
                self.evaluation.done_confidence
            )));
        }
        Ok(())
    }

    pub fn retrieval_matcher(&self) -> ravel_domain::RetrievalMatcher {
        ravel_domain::RetrievalMatcher::new(self.retrieval_tools.clone())
    }
}

fn parse_count(key: &str, raw: &str) -> Result<usize> {
    raw.trim()
        .parse::<usize>()
        .map_err(|e| AgentError::InvalidConfig(format!("{key}={raw:?}: {e}")))
}
