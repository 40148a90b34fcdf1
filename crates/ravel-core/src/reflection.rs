//! Reflections on failed steps and the store they are recalled from.
//!
//! Error text is matched against an ordered rule table; the first matching
//! rule supplies the advice. Stored reflections are keyed by a digest of the
//! normalized task and ranked for later tasks by keyword overlap.

use std::collections::{BTreeSet, VecDeque};
use std::sync::{Mutex, OnceLock, PoisonError};

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::memory::truncate;
use crate::step::ActionStep;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReflectionOutcome {
    Failure,
    Stuck,
    Success,
}

impl std::fmt::Display for ReflectionOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReflectionOutcome::Failure => write!(f, "failure"),
            ReflectionOutcome::Stuck => write!(f, "stuck"),
            ReflectionOutcome::Success => write!(f, "success"),
        }
    }
}

/// A lesson drawn from one step. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reflection {
    pub id: String,
    pub task: String,
    pub task_digest: String,
    pub step_number: usize,
    pub step_snapshot: String,
    pub reflection_text: String,
    pub outcome: ReflectionOutcome,
    pub created_at: DateTime<Utc>,
}

impl Reflection {
    pub fn new(
        task: &str,
        step_number: usize,
        step_snapshot: impl Into<String>,
        reflection_text: impl Into<String>,
        outcome: ReflectionOutcome,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            task: task.to_string(),
            task_digest: task_digest(task),
            step_number,
            step_snapshot: step_snapshot.into(),
            reflection_text: reflection_text.into(),
            outcome,
            created_at: Utc::now(),
        }
    }

    /// Reflect on a failed step using the rule table.
    pub fn from_failed_step(task: &str, step: &ActionStep) -> Option<Self> {
        let error = step.error.as_deref()?;
        Some(Self::new(
            task,
            step.step_number,
            snapshot(step),
            advice_for_error(error),
            ReflectionOutcome::Failure,
        ))
    }
}

/// Hex SHA-256 of the whitespace-normalized, lowercased task.
pub fn task_digest(task: &str) -> String {
    let normalized = task.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase();
    hex::encode(Sha256::digest(normalized.as_bytes()))
}

fn snapshot(step: &ActionStep) -> String {
    let tools: Vec<&str> = step.tool_names().collect();
    let mut text = format!("step {}", step.step_number);
    if !tools.is_empty() {
        text.push_str(&format!(" tools=[{}]", tools.join(", ")));
    }
    if let Some(code) = &step.code_action {
        text.push_str(&format!(" code={}", truncate(code, 120)));
    }
    if let Some(error) = &step.error {
        text.push_str(&format!(" error={}", truncate(error, 200)));
    }
    text
}

const GENERIC_ADVICE: &str =
    "This approach failed. Avoid repeating it and try a different strategy.";

fn rules() -> &'static [(Regex, &'static str)] {
    static RULES: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    RULES.get_or_init(|| {
        let specs: [(&str, &str); 7] = [
            (
                r"(?i)operation limit exceeded",
                "The code ran too many operations. Avoid unbounded loops and process less data per step.",
            ),
            (
                r"(?i)(undefined|unknown|not found).*(variable|method|function)|(variable|function|method).*(not found|undefined)",
                "A name was not defined. Only use registered tools and variables, and define values before use.",
            ),
            (
                r"(?i)(wrong number of arguments|arity|expected \d+ arguments?|parameters? mismatch)",
                "A call used the wrong number of arguments. Check each tool's inputs before calling it.",
            ),
            (
                r"(?i)(implicit conversion|mismatched types|cannot convert|type mismatch|data type incorrect)",
                "A value had the wrong type. Convert values explicitly before combining them.",
            ),
            (
                r"(?i)(syntax error|parse error|unexpected token|expecting)",
                "The code did not parse. Write smaller, simpler snippets and check brackets and quotes.",
            ),
            (
                r"(?i)tool not found",
                "A tool that does not exist was requested. Only call tools from the available list.",
            ),
            (
                r"(?i)(timed out|timeout)",
                "The action timed out. Break the work into smaller steps or use a faster tool.",
            ),
        ];
        specs
            .iter()
            .filter_map(|(pattern, advice)| Regex::new(pattern).ok().map(|re| (re, *advice)))
            .collect()
    })
}

/// Advice for an error message: the first matching rule, or generic advice.
pub fn advice_for_error(error: &str) -> &'static str {
    rules()
        .iter()
        .find(|(re, _)| re.is_match(error))
        .map(|(_, advice)| *advice)
        .unwrap_or(GENERIC_ADVICE)
}

/// Bounded, shareable store of reflections; the oldest is evicted first.
#[derive(Debug)]
pub struct ReflectionStore {
    capacity: usize,
    entries: Mutex<VecDeque<Reflection>>,
}

impl Default for ReflectionStore {
    fn default() -> Self {
        Self::new(100)
    }
}

impl ReflectionStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(VecDeque::new()),
        }
    }

    pub fn record(&self, reflection: Reflection) {
        if self.capacity == 0 {
            return;
        }
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        while entries.len() >= self.capacity {
            entries.pop_front();
        }
        debug!(
            event = "reflection.stored",
            task_digest = %reflection.task_digest,
            outcome = %reflection.outcome,
        );
        entries.push_back(reflection);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn all(&self) -> Vec<Reflection> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// Up to `top_n` reflections ranked by relevance to `task`.
    ///
    /// Same-task reflections rank first, then keyword overlap; ties go to the
    /// newer entry. Entries with no overlap at all are never returned.
    pub fn relevant(&self, task: &str, top_n: usize) -> Vec<Reflection> {
        let digest = task_digest(task);
        let words = word_set(task);
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let mut scored: Vec<(f64, usize, &Reflection)> = entries
            .iter()
            .enumerate()
            .filter_map(|(idx, r)| {
                let score = if r.task_digest == digest {
                    2.0
                } else {
                    jaccard(&words, &word_set(&r.task))
                };
                (score > 0.0).then_some((score, idx, r))
            })
            .collect();
        scored.sort_by(|a, b| b.0.total_cmp(&a.0).then(b.1.cmp(&a.1)));

        let mut seen_text = BTreeSet::new();
        scored
            .into_iter()
            .filter(|(_, _, r)| seen_text.insert(r.reflection_text.clone()))
            .take(top_n)
            .map(|(_, _, r)| r.clone())
            .collect()
    }
}

fn word_set(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() >= 3)
        .map(str::to_lowercase)
        .collect()
}

fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f64 / union as f64
}
