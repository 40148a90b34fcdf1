//! The `Tool` capability, the final-answer tool and retrieval classification.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::ToolError;

/// Name of the tool whose invocation terminates a run.
pub const FINAL_ANSWER_TOOL: &str = "final_answer";

/// A callable capability exposed to the model and to sandboxed code.
///
/// Arguments arrive as a JSON object keyed by parameter name.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON description of accepted parameters, rendered into prompts.
    fn inputs(&self) -> Value {
        json!({})
    }

    async fn execute(&self, arguments: Value) -> Result<Value, ToolError>;
}

/// The terminal tool: returns its `answer` argument unchanged.
#[derive(Debug, Clone, Default)]
pub struct FinalAnswerTool;

impl FinalAnswerTool {
    /// Extract the answer from final-answer arguments.
    ///
    /// Accepts `{"answer": ...}`, `{"input": ...}` or any other object as-is.
    pub fn extract_answer(arguments: &Value) -> Value {
        arguments
            .get("answer")
            .or_else(|| arguments.get("input"))
            .cloned()
            .unwrap_or_else(|| arguments.clone())
    }
}

#[async_trait]
impl Tool for FinalAnswerTool {
    fn name(&self) -> &str {
        FINAL_ANSWER_TOOL
    }

    fn description(&self) -> &str {
        "Provides the final answer to the task and ends the run."
    }

    fn inputs(&self) -> Value {
        json!({"answer": {"type": "any", "description": "The final answer to the task"}})
    }

    async fn execute(&self, arguments: Value) -> Result<Value, ToolError> {
        Ok(Self::extract_answer(&arguments))
    }
}

/// Named set of tools available to an agent or a sandbox.
#[derive(Clone, Default)]
pub struct Toolbox {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl Toolbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a tool, replacing any previous tool with the same name.
    pub fn with_tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.insert(tool);
        self
    }

    pub fn insert(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Tool names in sorted order.
    pub fn names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Tool>> {
        self.tools.values()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl std::fmt::Debug for Toolbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Toolbox")
            .field("tools", &self.names())
            .finish()
    }
}

/// Classifies tool names as retrieval/search style by substring match.
///
/// A final answer must not be given in the same action that requests
/// retrieval; the model has to observe the retrieved data first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrievalMatcher {
    pub patterns: Vec<String>,
}

impl Default for RetrievalMatcher {
    fn default() -> Self {
        Self::new(
            [
                "search",
                "retriev",
                "fetch",
                "lookup",
                "browse",
                "visit_webpage",
                "wikipedia",
                "scrape",
                "crawl",
            ]
            .iter()
            .map(|p| p.to_string())
            .collect(),
        )
    }
}

impl RetrievalMatcher {
    pub fn new(patterns: Vec<String>) -> Self {
        Self {
            patterns: patterns.into_iter().map(|p| p.to_lowercase()).collect(),
        }
    }

    pub fn is_retrieval(&self, tool_name: &str) -> bool {
        let name = tool_name.to_lowercase();
        self.patterns.iter().any(|p| name.contains(p.as_str()))
    }

    /// First retrieval tool among `names`, if any.
    pub fn first_retrieval<'a, I>(&self, names: I) -> Option<&'a str>
    where
        I: IntoIterator<Item = &'a str>,
    {
        names.into_iter().find(|n| self.is_retrieval(n))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retrieval_matcher_substring() {
        let m = RetrievalMatcher::default();
        assert!(m.is_retrieval("web_search"));
        assert!(m.is_retrieval("DuckDuckGoSearch"));
        assert!(m.is_retrieval("visit_webpage"));
        assert!(m.is_retrieval("document_retriever"));
        assert!(!m.is_retrieval("final_answer"));
        assert!(!m.is_retrieval("calculator"));
    }

    #[test]
    fn test_first_retrieval() {
        let m = RetrievalMatcher::default();
        let names = ["calculator", "web_search", "final_answer"];
        assert_eq!(m.first_retrieval(names), Some("web_search"));
        assert_eq!(m.first_retrieval(["calculator"]), None);
    }

    #[test]
    fn test_extract_answer_variants() {
        assert_eq!(
            FinalAnswerTool::extract_answer(&json!({"answer": "Paris"})),
            json!("Paris")
        );
        assert_eq!(
            FinalAnswerTool::extract_answer(&json!({"input": 42})),
            json!(42)
        );
        assert_eq!(
            FinalAnswerTool::extract_answer(&json!({"city": "Paris"})),
            json!({"city": "Paris"})
        );
    }

    #[tokio::test]
    async fn test_final_answer_tool_returns_answer() {
        let tool = FinalAnswerTool;
        let out = tool.execute(json!({"answer": "done"})).await.unwrap();
        assert_eq!(out, json!("done"));
    }

    #[test]
    fn test_toolbox_names_sorted() {
        let toolbox = Toolbox::new()
            .with_tool(Arc::new(FinalAnswerTool))
            .with_tool(Arc::new(crate::fakes::StaticTool::new("alpha", json!(1))));
        assert_eq!(toolbox.names(), vec!["alpha", "final_answer"]);
        assert!(toolbox.contains("alpha"));
        assert_eq!(toolbox.len(), 2);
    }
}
