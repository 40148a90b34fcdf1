//! End-to-end tests for the local (interpreter) executor.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use ravel_domain::fakes::StaticTool;
use ravel_domain::{FinalAnswerTool, Toolbox};
use ravel_sandbox::{
    CodeExecutor, LimitMode, LocalExecutor, LocalExecutorConfig, ResourceLimits,
};

fn toolbox() -> Toolbox {
    Toolbox::new()
        .with_tool(Arc::new(StaticTool::new("calculator", json!(42))))
        .with_tool(Arc::new(StaticTool::new(
            "web_search",
            json!("Paris is the capital of France"),
        )))
        .with_tool(Arc::new(StaticTool::failing(
            "vault",
            "access denied for api_key=SECRET123",
        )))
}

fn executor_with(max_operations: u64, limit_mode: LimitMode) -> LocalExecutor {
    LocalExecutor::with_config(
        toolbox(),
        LocalExecutorConfig {
            max_operations,
            limit_mode,
            ..LocalExecutorConfig::default()
        },
    )
}

// -------------------------------------------------------------------------
// Operation limit
// -------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn test_infinite_loop_hits_operation_limit() {
    let exec = executor_with(1_000, LimitMode::Operations);
    let result = exec
        .execute("let i = 0; while true { i += 1; }")
        .await
        .unwrap();

    let error = result.error.expect("loop must fail");
    assert!(error.contains("InterpreterError"));
    assert!(error.contains("Operation limit exceeded: 1000"));
    assert!(!result.is_final_answer);
    assert_eq!(result.output, serde_json::Value::Null);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_call_mode_counts_invocations() {
    let exec = executor_with(3, LimitMode::Calls);
    let result = exec
        .execute("for i in 0..10 { puts(i); }")
        .await
        .unwrap();

    assert!(result
        .error
        .unwrap()
        .contains("Operation limit exceeded: 3"));
    assert_eq!(result.logs, "0\n1\n2\n");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_code_within_limit_succeeds() {
    let exec = executor_with(10_000, LimitMode::Operations);
    let result = exec
        .execute("let total = 0; for i in 1..=10 { total += i; } total")
        .await
        .unwrap();
    assert!(result.error.is_none());
    assert_eq!(result.output, json!(55));
}

// -------------------------------------------------------------------------
// Isolation
// -------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn test_unknown_method_is_not_found() {
    let exec = LocalExecutor::new(toolbox());
    for code in ["system(\"ls\")", "File.read(\"/etc/passwd\")", "delete_all()"] {
        let result = exec.execute(code).await.unwrap();
        let error = result.error.unwrap_or_default();
        assert!(
            error.contains("undefined method or variable"),
            "code {code:?} produced {error:?}"
        );
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_wall_clock_timeout() {
    let exec = LocalExecutor::with_config(
        toolbox(),
        LocalExecutorConfig {
            max_operations: 0,
            limits: ResourceLimits::default().with_timeout_ms(100),
            ..LocalExecutorConfig::default()
        },
    );
    let result = exec.execute("loop { }").await.unwrap();
    assert!(result.error.unwrap().contains("timed out"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_output_capture_survives_timeout() {
    let exec = LocalExecutor::with_config(
        toolbox(),
        LocalExecutorConfig {
            max_operations: 0,
            limits: ResourceLimits::default().with_timeout_ms(200),
            ..LocalExecutorConfig::default()
        },
    );
    let result = exec
        .execute("puts(\"started work\"); loop { }")
        .await
        .unwrap();
    assert!(result.error.unwrap().contains("timed out"));
    assert_eq!(result.logs, "started work\n");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_output_capture_survives_failure() {
    let exec = LocalExecutor::new(toolbox());
    let result = exec
        .execute("puts(\"before\"); print(\"still before\"); missing_helper()")
        .await
        .unwrap();
    assert_eq!(result.logs, "before\nstill before\n");
    assert!(result.error.unwrap().contains("missing_helper"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_tool_errors_are_redacted() {
    let exec = LocalExecutor::new(toolbox());
    let result = exec.execute("vault(\"prod\")").await.unwrap();
    let error = result.error.unwrap();
    assert!(error.contains("vault"));
    assert!(!error.contains("SECRET123"));
    assert!(error.contains("[REDACTED]"));
}

// -------------------------------------------------------------------------
// Final answer guard
// -------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn test_final_answer_alone_succeeds() {
    let exec = LocalExecutor::new(toolbox());
    let result = exec.execute("final_answer(\"Paris\")").await.unwrap();
    assert!(result.is_final_answer);
    assert_eq!(result.output, json!("Paris"));
    assert!(result.error.is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_final_answer_tool_from_toolbox() {
    let exec = LocalExecutor::new(toolbox().with_tool(Arc::new(FinalAnswerTool)));
    let result = exec
        .execute("let n = calculator(); final_answer(#{answer: n})")
        .await
        .unwrap();
    assert!(result.is_final_answer);
    assert_eq!(result.output, json!(42));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_final_answer_with_retrieval_is_rejected() {
    let exec = LocalExecutor::new(toolbox());
    let result = exec
        .execute("let r = web_search(#{query: \"capital of France\"}); final_answer(r)")
        .await
        .unwrap();
    assert!(!result.is_final_answer);
    let error = result.error.unwrap();
    assert!(error.contains("web_search"));
    assert!(error.contains("Wait for its results"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_final_answer_after_deferred_retrieval_is_rejected() {
    let search = Arc::new(StaticTool::new("web_search", json!("Paris")));
    let exec = LocalExecutor::new(Toolbox::new().with_tool(search.clone()));
    let result = exec
        .execute("let f = defer(\"web_search\", #{q: \"x\"}); final_answer(\"guess\")")
        .await
        .unwrap();
    assert!(!result.is_final_answer);
    assert_ne!(result.output, json!("guess"));
    assert!(result.error.unwrap().contains("web_search"));
    assert_eq!(search.call_count(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_final_answer_after_separate_retrieval_execution() {
    let exec = LocalExecutor::new(toolbox());
    let first = exec.execute("web_search(\"capital of France\")").await.unwrap();
    assert!(first.error.is_none());

    let second = exec.execute("final_answer(\"Paris\")").await.unwrap();
    assert!(second.is_final_answer);
}

// -------------------------------------------------------------------------
// Async tools and deferred dispatch
// -------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn test_async_tool_with_delay() {
    let slow = StaticTool::new("slow_lookup", json!({"rows": 3})).with_delay(Duration::from_millis(20));
    let exec = LocalExecutor::new(Toolbox::new().with_tool(Arc::new(slow)));
    let result = exec.execute("let r = slow_lookup(); r.rows").await.unwrap();
    assert_eq!(result.output, json!(3));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_deferred_calls_resolve() {
    let exec = LocalExecutor::new(toolbox());
    let result = exec
        .execute(
            "let a = defer(\"calculator\", #{x: 1}); \
             let b = defer(\"calculator\", #{x: 2}); \
             [resolve(a), resolve(b)]",
        )
        .await
        .unwrap();
    assert_eq!(result.output, json!([42, 42]));
    assert_eq!(exec.sandbox().pending_count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_returned_future_is_flushed() {
    let exec = LocalExecutor::new(toolbox());
    let result = exec.execute("defer(\"calculator\", #{})").await.unwrap();
    assert_eq!(result.output, json!(42));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_dynamic_invoke_and_variables() {
    let exec = LocalExecutor::new(toolbox()).with_variable("question", json!("What is 6*7?"));
    let result = exec
        .execute("if has_tool(\"calculator\") { [question, invoke(\"calculator\", #{q: question})] } else { () }")
        .await
        .unwrap();
    assert_eq!(result.output, json!(["What is 6*7?", 42]));
}
