//! Dead-letter capture and manual retry.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ravel_domain::fakes::FnModel;
use ravel_domain::{AssistantMessage, ChatMessage, GenerateOptions, ModelError};
use ravel_queue::{Priority, QueueConfig, QueueError, RequestQueue};

/// Backend that fails with a connection error until `healthy` flips.
fn flaky_backend(healthy: Arc<AtomicBool>) -> Arc<FnModel> {
    Arc::new(FnModel::new(move |messages| {
        if healthy.load(Ordering::SeqCst) {
            let prompt = messages.last().map(|m| m.content.clone()).unwrap_or_default();
            Ok(AssistantMessage::text(format!("ok: {prompt}")))
        } else {
            Err(ModelError::Connection("connection refused".into()))
        }
    }))
}

async fn fail_n(queue: &RequestQueue, n: usize) {
    for i in 0..n {
        let err = queue
            .queued_generate(
                &[ChatMessage::user(format!("req {i}"))],
                &GenerateOptions::default(),
                Priority::Normal,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Model(ModelError::Connection(_))));
    }
}

fn prompts(queue: &RequestQueue) -> Vec<String> {
    queue
        .dead_letters()
        .unwrap()
        .entries()
        .into_iter()
        .map(|f| f.request.messages[0].content.clone())
        .collect()
}

#[tokio::test]
async fn test_store_keeps_most_recent_failures() {
    let healthy = Arc::new(AtomicBool::new(false));
    let config = QueueConfig::default().with_dead_letter_capacity(3);
    let queue = RequestQueue::new(flaky_backend(healthy), config);

    fail_n(&queue, 5).await;

    assert_eq!(prompts(&queue), vec!["req 2", "req 3", "req 4"]);
    let stats = queue.stats();
    assert_eq!(stats.failed, 5);
    assert_eq!(stats.dead_lettered, 5);
    assert!(queue
        .dead_letters()
        .unwrap()
        .entries()
        .iter()
        .all(|f| f.retriable && f.attempts == 1));
}

#[tokio::test]
async fn test_retry_pops_oldest_and_succeeds() {
    let healthy = Arc::new(AtomicBool::new(false));
    let queue = RequestQueue::new(flaky_backend(healthy.clone()), QueueConfig::default());
    fail_n(&queue, 3).await;
    let oldest_id = queue.dead_letters().unwrap().entries()[0].request.id.clone();

    healthy.store(true, Ordering::SeqCst);
    let outcomes = queue.retry_failed(1).await;

    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].request_id, oldest_id);
    assert_eq!(outcomes[0].attempts, 2);
    assert_eq!(outcomes[0].result.as_ref().unwrap().content, "ok: req 0");
    assert_eq!(prompts(&queue), vec!["req 1", "req 2"]);
    assert_eq!(queue.stats().retry_succeeded, 1);
}

#[tokio::test]
async fn test_failed_retry_is_reappended() {
    let healthy = Arc::new(AtomicBool::new(false));
    let queue = RequestQueue::new(flaky_backend(healthy), QueueConfig::default());
    fail_n(&queue, 2).await;

    let outcomes = queue.retry_failed(1).await;
    assert!(outcomes[0].result.is_err());

    let entries = queue.dead_letters().unwrap().entries();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].request.messages[0].content, "req 1");
    assert_eq!(entries[1].request.messages[0].content, "req 0");
    assert_eq!(entries[1].attempts, 2);
    assert_eq!(queue.stats().retried, 1);
}

#[tokio::test]
async fn test_disabled_dead_letters_and_empty_retry() {
    let healthy = Arc::new(AtomicBool::new(false));
    let queue = RequestQueue::new(
        flaky_backend(healthy),
        QueueConfig::default().with_dead_letter_capacity(0),
    );
    fail_n(&queue, 1).await;
    assert!(queue.dead_letters().is_none());
    assert!(queue.retry_failed(5).await.is_empty());
}
