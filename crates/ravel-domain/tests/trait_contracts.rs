//! Contract tests for the Model and Tool capabilities and their fakes.

use std::sync::Arc;

use serde_json::json;

use ravel_domain::fakes::{CollectingSink, FnModel, ScriptedModel, StaticTool};
use ravel_domain::{
    AssistantMessage, ChatMessage, Emitter, GenerateOptions, Model, ModelError, RuntimeEvent,
    TokenUsage, Tool, ToolCall, ToolError, Toolbox,
};

#[tokio::test]
async fn test_scripted_model_replays_in_order_then_fails() {
    let model = ScriptedModel::new(vec![
        AssistantMessage::text("first"),
        AssistantMessage::text("second"),
    ]);
    let history = vec![ChatMessage::user("hi")];
    let opts = GenerateOptions::default();

    assert_eq!(model.generate(&history, &opts).await.unwrap().content, "first");
    assert_eq!(model.generate(&history, &opts).await.unwrap().content, "second");
    let err = model.generate(&history, &opts).await.unwrap_err();
    assert!(matches!(err, ModelError::InvalidResponse(_)));
    assert_eq!(model.call_count(), 3);
}

#[tokio::test]
async fn test_model_through_arc_dyn() {
    let model: Arc<dyn Model> = Arc::new(FnModel::new(|messages| {
        Ok(AssistantMessage::text(format!("saw {} messages", messages.len()))
            .with_usage(TokenUsage::new(10, 2)))
    }));
    let reply = model
        .generate(
            &[ChatMessage::system("sys"), ChatMessage::user("task")],
            &GenerateOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(reply.content, "saw 2 messages");
    assert_eq!(reply.token_usage.unwrap().total(), 12);
}

#[tokio::test]
async fn test_retriable_errors_survive_scripting() {
    let model = ScriptedModel::with_results(vec![
        Err(ModelError::RateLimited("slow down".into())),
        Err(ModelError::Configuration("missing key".into())),
    ]);
    let opts = GenerateOptions::default();
    let first = model.generate(&[], &opts).await.unwrap_err();
    let second = model.generate(&[], &opts).await.unwrap_err();
    assert!(first.is_retriable());
    assert!(!second.is_retriable());
}

#[tokio::test]
async fn test_static_tool_records_arguments_and_fails() {
    let ok = StaticTool::new("calculator", json!(4));
    assert_eq!(ok.execute(json!({"expression": "2+2"})).await.unwrap(), json!(4));
    assert_eq!(ok.last_arguments(), Some(json!({"expression": "2+2"})));
    assert_eq!(ok.call_count(), 1);

    let failing = StaticTool::failing("broken", "exploded");
    let err = failing.execute(json!({})).await.unwrap_err();
    assert!(matches!(err, ToolError::Failed { .. }));
    assert_eq!(err.to_string(), "tool broken failed: exploded");
}

#[test]
fn test_tool_call_arguments_normalized_from_string() {
    let call = ToolCall::new("c1", "web_search", json!("{\"query\": \"rust\"}"));
    assert_eq!(call.argument("query"), Some(&json!("rust")));

    let scalar = ToolCall::new("c2", "web_search", json!("rust"));
    assert_eq!(scalar.arguments, json!({"input": "rust"}));
}

#[test]
fn test_toolbox_lookup() {
    let toolbox = Toolbox::new().with_tool(Arc::new(StaticTool::new("lookup", json!(null))));
    assert!(toolbox.get("lookup").is_some());
    assert!(toolbox.get("missing").is_none());
}

#[test]
fn test_collecting_sink_filters_by_name() {
    let sink = Arc::new(CollectingSink::new());
    let emitter = Emitter::new(sink.clone());
    emitter.emit_with(|| RuntimeEvent::QueueRequestCompleted {
        request_id: "r1".into(),
        success: true,
        duration_ms: 5,
    });
    emitter.emit_with(|| RuntimeEvent::ReflectionRecorded {
        run_id: "run".into(),
        step_number: 2,
        outcome: "failure".into(),
    });
    assert_eq!(sink.named("queue.request_completed").len(), 1);
    assert_eq!(sink.named("reflection.recorded").len(), 1);
    assert_eq!(sink.events().len(), 2);
}
