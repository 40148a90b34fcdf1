//! Parallel tool execution with early yield.
//!
//! All calls of one action are spawned at once. As soon as a completed
//! result passes the quality predicate the step continues with everything
//! finished so far; the rest keep running and are reachable through the
//! returned [`PendingCollector`].

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use ravel_domain::{ToolCall, ToolError, Toolbox};
use ravel_sandbox::redact_secrets;

/// Result of one tool call, tagged with its position in the action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub index: usize,
    pub call: ToolCall,
    /// Tool output, or redacted error text.
    pub output: Result<Value, String>,
    pub duration_ms: u64,
}

impl ToolOutcome {
    pub fn is_success(&self) -> bool {
        self.output.is_ok()
    }

    /// Raw observation text for the model.
    pub fn observation(&self) -> String {
        match &self.output {
            Ok(Value::String(s)) => s.clone(),
            Ok(other) => other.to_string(),
            Err(e) => format!("Error: {e}"),
        }
    }
}

/// Decides whether a finished call is good enough to continue early.
pub type QualityPredicate = Arc<dyn Fn(&ToolOutcome) -> bool + Send + Sync>;

/// Accepts any successful, non-empty output.
pub fn non_empty_success() -> QualityPredicate {
    Arc::new(|outcome: &ToolOutcome| match &outcome.output {
        Ok(Value::Null) | Err(_) => false,
        Ok(Value::String(s)) => !s.trim().is_empty(),
        Ok(Value::Array(a)) => !a.is_empty(),
        Ok(Value::Object(o)) => !o.is_empty(),
        Ok(_) => true,
    })
}

/// Run a single call directly on the current task.
pub async fn execute_call(toolbox: &Toolbox, call: ToolCall, index: usize) -> ToolOutcome {
    let started = Instant::now();
    let output = match toolbox.get(&call.name) {
        Some(tool) => tool
            .execute(call.arguments.clone())
            .await
            .map_err(|e| redact_secrets(&e.to_string())),
        None => Err(ToolError::NotFound {
            name: call.name.clone(),
        }
        .to_string()),
    };
    ToolOutcome {
        index,
        call,
        output,
        duration_ms: started.elapsed().as_millis() as u64,
    }
}

/// Outcome of a parallel batch.
#[derive(Debug)]
pub struct ParallelOutcome {
    /// Slot per call in origin order; `None` while still running.
    pub results: Vec<Option<ToolOutcome>>,
    /// Index of the result that triggered early yield.
    pub accepted: Option<usize>,
    pub pending: PendingCollector,
}

impl ParallelOutcome {
    /// Finished outcomes in origin order.
    pub fn completed(&self) -> impl Iterator<Item = &ToolOutcome> {
        self.results.iter().flatten()
    }

    pub fn is_complete(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Spawn every call and return at the first quality-accepted result.
pub async fn execute_parallel(
    toolbox: &Toolbox,
    calls: Vec<ToolCall>,
    accept: &QualityPredicate,
) -> ParallelOutcome {
    let total = calls.len();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut handles = Vec::with_capacity(total);
    for (index, call) in calls.iter().cloned().enumerate() {
        let toolbox = toolbox.clone();
        let tx = tx.clone();
        handles.push(tokio::spawn(async move {
            let outcome = execute_call(&toolbox, call, index).await;
            let _ = tx.send(outcome);
        }));
    }
    drop(tx);

    let mut results: Vec<Option<ToolOutcome>> = vec![None; total];
    let mut remaining = total;
    let mut accepted = None;
    while remaining > 0 {
        let Some(outcome) = rx.recv().await else {
            break;
        };
        remaining -= 1;
        let index = outcome.index;
        let good = accept(&outcome);
        results[index] = Some(outcome);
        if good {
            accepted = Some(index);
            break;
        }
    }

    if accepted.is_some() {
        // Include anything else that already finished.
        while let Ok(outcome) = rx.try_recv() {
            remaining -= 1;
            let index = outcome.index;
            results[index] = Some(outcome);
        }
        debug!(accepted = ?accepted, still_running = remaining, "parallel tools yielded early");
    } else if remaining > 0 {
        // Every sender is gone: the missing workers panicked.
        for (index, slot) in results.iter_mut().enumerate() {
            if slot.is_none() {
                warn!(tool = %calls[index].name, "tool worker exited without a result");
                *slot = Some(ToolOutcome {
                    index,
                    call: calls[index].clone(),
                    output: Err(format!("tool {} panicked", calls[index].name)),
                    duration_ms: 0,
                });
            }
        }
        remaining = 0;
    }

    let pending = if remaining > 0 {
        PendingCollector {
            rx: Some(rx),
            handles,
            remaining,
        }
    } else {
        PendingCollector::empty()
    };
    ParallelOutcome {
        results,
        accepted,
        pending,
    }
}

/// Handle on tool calls still running after an early yield.
#[derive(Debug, Default)]
pub struct PendingCollector {
    rx: Option<mpsc::UnboundedReceiver<ToolOutcome>>,
    handles: Vec<JoinHandle<()>>,
    remaining: usize,
}

impl PendingCollector {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Calls not yet collected.
    pub fn remaining(&self) -> usize {
        self.remaining
    }

    pub fn is_empty(&self) -> bool {
        self.remaining == 0
    }

    /// Outcomes that have finished since the last poll, without waiting.
    pub fn drain_ready(&mut self) -> Vec<ToolOutcome> {
        let mut ready = Vec::new();
        if let Some(rx) = &mut self.rx {
            while let Ok(outcome) = rx.try_recv() {
                ready.push(outcome);
            }
        }
        self.remaining = self.remaining.saturating_sub(ready.len());
        ready
    }

    /// Join every worker and return all outstanding outcomes.
    pub async fn collect(mut self) -> Vec<ToolOutcome> {
        for handle in self.handles.drain(..) {
            if let Err(e) = handle.await {
                warn!(error = %e, "late tool worker failed");
            }
        }
        let mut outcomes = Vec::new();
        if let Some(mut rx) = self.rx.take() {
            while let Some(outcome) = rx.recv().await {
                outcomes.push(outcome);
            }
        }
        outcomes.sort_by_key(|o| o.index);
        outcomes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ravel_domain::fakes::StaticTool;
    use serde_json::json;
    use std::time::Duration;

    fn call(name: &str) -> ToolCall {
        ToolCall::new(format!("id-{name}"), name, json!({}))
    }

    #[tokio::test]
    async fn test_single_call_and_missing_tool() {
        let toolbox = Toolbox::new().with_tool(Arc::new(StaticTool::new("echo", json!("hi"))));
        let ok = execute_call(&toolbox, call("echo"), 0).await;
        assert_eq!(ok.output, Ok(json!("hi")));
        let missing = execute_call(&toolbox, call("nope"), 1).await;
        assert_eq!(missing.output, Err("tool not found: nope".to_string()));
    }

    #[tokio::test]
    async fn test_waits_for_all_when_nothing_accepted() {
        let toolbox = Toolbox::new()
            .with_tool(Arc::new(StaticTool::new("a", json!(""))))
            .with_tool(Arc::new(StaticTool::failing("b", "boom")));
        let outcome = execute_parallel(&toolbox, vec![call("a"), call("b")], &non_empty_success()).await;
        assert!(outcome.accepted.is_none());
        assert!(outcome.is_complete());
        assert_eq!(outcome.completed().count(), 2);
        assert_eq!(outcome.results[1].as_ref().unwrap().output, Err("tool b failed: boom".into()));
    }

    #[tokio::test]
    async fn test_early_yield_and_late_collection() {
        let slow = Arc::new(StaticTool::new("slow", json!("late")).with_delay(Duration::from_millis(200)));
        let toolbox = Toolbox::new()
            .with_tool(slow.clone())
            .with_tool(Arc::new(StaticTool::new("fast", json!("quick"))));

        let outcome = execute_parallel(&toolbox, vec![call("slow"), call("fast")], &non_empty_success()).await;
        assert_eq!(outcome.accepted, Some(1));
        assert!(outcome.results[0].is_none());
        assert_eq!(outcome.results[1].as_ref().unwrap().output, Ok(json!("quick")));
        assert_eq!(outcome.pending.remaining(), 1);

        let late = outcome.pending.collect().await;
        assert_eq!(late.len(), 1);
        assert_eq!(late[0].index, 0);
        assert_eq!(late[0].output, Ok(json!("late")));
        assert_eq!(slow.call_count(), 1);
    }

    #[tokio::test]
    async fn test_drain_ready_is_non_blocking() {
        let toolbox = Toolbox::new()
            .with_tool(Arc::new(StaticTool::new("slow", json!(1)).with_delay(Duration::from_millis(50))))
            .with_tool(Arc::new(StaticTool::new("fast", json!(2))));
        let mut outcome =
            execute_parallel(&toolbox, vec![call("slow"), call("fast")], &non_empty_success()).await;
        assert_eq!(outcome.pending.remaining(), 1);
        tokio::time::sleep(Duration::from_millis(150)).await;
        let ready = outcome.pending.drain_ready();
        assert_eq!(ready.len(), 1);
        assert!(outcome.pending.is_empty());
    }
}
