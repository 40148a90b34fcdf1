//! Observation routing: decide how much of a tool's output enters context.

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use ravel_domain::{GenerateOptions, Model, TokenUsage};

use crate::error::Result;
use crate::memory::truncate;
use crate::prompts;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteDecision {
    SummaryOnly,
    FullOutput,
    NeedsRetry,
    Irrelevant,
}

impl RouteDecision {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "summary_only" => Some(RouteDecision::SummaryOnly),
            "full_output" => Some(RouteDecision::FullOutput),
            "needs_retry" => Some(RouteDecision::NeedsRetry),
            "irrelevant" => Some(RouteDecision::Irrelevant),
            _ => None,
        }
    }
}

/// A routing verdict for one observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub decision: RouteDecision,
    pub summary: Option<String>,
    #[serde(default)]
    pub token_usage: Option<TokenUsage>,
}

impl Route {
    pub fn full() -> Self {
        Self {
            decision: RouteDecision::FullOutput,
            summary: None,
            token_usage: None,
        }
    }

    /// Text that enters the agent's context in place of `raw`.
    pub fn render(&self, raw: &str) -> String {
        let summary = self.summary.as_deref().filter(|s| !s.trim().is_empty());
        match (self.decision, summary) {
            (RouteDecision::FullOutput, _) | (RouteDecision::SummaryOnly, None) => raw.to_string(),
            (RouteDecision::SummaryOnly, Some(summary)) => format!("Summary: {summary}"),
            (RouteDecision::NeedsRetry, summary) => format!(
                "{}\nThis result looks incomplete or wrong; retry with a different query or tool.",
                summary.map_or_else(|| truncate(raw, 500), str::to_string)
            ),
            (RouteDecision::Irrelevant, summary) => format!(
                "Output judged irrelevant to the task{}",
                summary.map_or_else(String::new, |s| format!(": {s}"))
            ),
        }
    }
}

/// Gate between raw tool output and agent context.
#[async_trait]
pub trait ObservationRouter: Send + Sync {
    async fn route(&self, task: &str, tool_name: &str, observation: &str) -> Result<Route>;
}

/// Forwards everything unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassThroughRouter;

#[async_trait]
impl ObservationRouter for PassThroughRouter {
    async fn route(&self, _task: &str, _tool_name: &str, _observation: &str) -> Result<Route> {
        Ok(Route::full())
    }
}

/// Asks a (typically cheap) model to triage long observations.
pub struct ModelRouter {
    model: Arc<dyn Model>,
    min_chars: usize,
}

impl ModelRouter {
    pub fn new(model: Arc<dyn Model>, min_chars: usize) -> Self {
        Self { model, min_chars }
    }
}

impl std::fmt::Debug for ModelRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelRouter")
            .field("model", &self.model.model_id())
            .field("min_chars", &self.min_chars)
            .finish()
    }
}

fn route_patterns() -> Option<&'static (Regex, Regex)> {
    static PATTERNS: OnceLock<Option<(Regex, Regex)>> = OnceLock::new();
    PATTERNS
        .get_or_init(|| {
            Some((
                Regex::new(r"(?mi)^[ \t]*DECISION:[ \t]*([a-z_]+)").ok()?,
                Regex::new(r"(?msi)^[ \t]*SUMMARY:[ \t]*(.*)").ok()?,
            ))
        })
        .as_ref()
}

/// Parse a router reply. Unknown decisions fall back to the full output.
pub fn parse_route(text: &str) -> Route {
    let Some((decision_re, summary_re)) = route_patterns() else {
        return Route::full();
    };
    let decision = decision_re
        .captures(text)
        .and_then(|c| c.get(1))
        .and_then(|m| RouteDecision::parse(m.as_str()))
        .unwrap_or(RouteDecision::FullOutput);
    let summary = summary_re
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|s| !s.is_empty());
    Route {
        decision,
        summary,
        token_usage: None,
    }
}

#[async_trait]
impl ObservationRouter for ModelRouter {
    async fn route(&self, task: &str, tool_name: &str, observation: &str) -> Result<Route> {
        if observation.chars().count() < self.min_chars {
            return Ok(Route::full());
        }
        let messages = prompts::routing_messages(task, tool_name, observation);
        let reply = self.model.generate(&messages, &GenerateOptions::default()).await?;
        let mut route = parse_route(&reply.content);
        route.token_usage = reply.token_usage;
        Ok(route)
    }
}

/// Route an observation, passing it through untouched if the router fails.
pub async fn route_or_passthrough(
    router: &dyn ObservationRouter,
    task: &str,
    tool_name: &str,
    observation: &str,
) -> (String, Option<TokenUsage>) {
    match router.route(task, tool_name, observation).await {
        Ok(route) => (route.render(observation), route.token_usage),
        Err(e) => {
            warn!(event = "routing.failed_open", tool = %tool_name, error = %e);
            (observation.to_string(), None)
        }
    }
}
