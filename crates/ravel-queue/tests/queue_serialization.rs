//! Ordering and concurrency guarantees of the request queue.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;

use ravel_domain::{AssistantMessage, ChatMessage, GenerateOptions, Model, ModelError};
use ravel_queue::{Priority, QueueConfig, QueueError, RequestQueue};

/// Tracks how many calls are in flight at once.
#[derive(Default)]
struct CountingModel {
    current: AtomicUsize,
    max_seen: AtomicUsize,
    calls: AtomicUsize,
}

#[async_trait]
impl Model for CountingModel {
    async fn generate(
        &self,
        _messages: &[ChatMessage],
        _options: &GenerateOptions,
    ) -> Result<AssistantMessage, ModelError> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_seen.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(15)).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(AssistantMessage::text(format!("reply {n}")))
    }
}

/// Records prompt order and holds each call until a permit is released.
struct GatedModel {
    gate: Semaphore,
    order: Mutex<Vec<String>>,
}

impl GatedModel {
    fn new() -> Self {
        Self {
            gate: Semaphore::new(0),
            order: Mutex::new(Vec::new()),
        }
    }

    fn order(&self) -> Vec<String> {
        self.order.lock().unwrap().clone()
    }
}

#[async_trait]
impl Model for GatedModel {
    async fn generate(
        &self,
        messages: &[ChatMessage],
        _options: &GenerateOptions,
    ) -> Result<AssistantMessage, ModelError> {
        let prompt = messages.last().map(|m| m.content.clone()).unwrap_or_default();
        self.order.lock().unwrap().push(prompt.clone());
        self.gate.acquire().await.unwrap().forget();
        Ok(AssistantMessage::text(prompt))
    }
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    for _ in 0..400 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

fn submit(
    queue: &Arc<RequestQueue>,
    prompt: &str,
    priority: Priority,
) -> tokio::task::JoinHandle<Result<AssistantMessage, QueueError>> {
    let queue = queue.clone();
    let messages = vec![ChatMessage::user(prompt)];
    tokio::spawn(async move {
        queue
            .queued_generate(&messages, &GenerateOptions::default(), priority)
            .await
    })
}

#[tokio::test]
async fn test_backend_never_sees_concurrent_calls() {
    let backend = Arc::new(CountingModel::default());
    let queue = Arc::new(RequestQueue::new(backend.clone(), QueueConfig::default()));

    let handles: Vec<_> = (0..6)
        .map(|i| submit(&queue, &format!("p{i}"), Priority::Normal))
        .collect();
    for result in futures::future::join_all(handles).await {
        assert!(result.unwrap().is_ok());
    }

    assert_eq!(backend.calls.load(Ordering::SeqCst), 6);
    assert_eq!(backend.max_seen.load(Ordering::SeqCst), 1);
    let stats = queue.stats();
    assert_eq!(stats.submitted, 6);
    assert_eq!(stats.completed, 6);
    assert!(queue.shutdown().await);
}

#[tokio::test]
async fn test_high_priority_jumps_waiting_requests() {
    let backend = Arc::new(GatedModel::new());
    let queue = Arc::new(RequestQueue::new(backend.clone(), QueueConfig::default()));

    let first = submit(&queue, "first", Priority::Normal);
    wait_until(|| backend.order().len() == 1).await;

    let n1 = submit(&queue, "n1", Priority::Normal);
    wait_until(|| queue.depth() == 1).await;
    let n2 = submit(&queue, "n2", Priority::Normal);
    wait_until(|| queue.depth() == 2).await;
    let h1 = submit(&queue, "h1", Priority::High);
    wait_until(|| queue.depth() == 3).await;

    backend.gate.add_permits(4);
    for handle in [first, n1, n2, h1] {
        handle.await.unwrap().unwrap();
    }

    // The in-flight request is never preempted.
    assert_eq!(backend.order(), vec!["first", "h1", "n1", "n2"]);
    assert_eq!(queue.stats().high_priority, 1);
    assert_eq!(queue.stats().peak_depth, 3);
}

#[tokio::test]
async fn test_full_queue_rejects_without_blocking() {
    let backend = Arc::new(GatedModel::new());
    let config = QueueConfig::default().with_max_depth(2);
    let queue = Arc::new(RequestQueue::new(backend.clone(), config));

    let in_flight = submit(&queue, "busy", Priority::Normal);
    wait_until(|| backend.order().len() == 1).await;
    let a = submit(&queue, "a", Priority::Normal);
    let b = submit(&queue, "b", Priority::Normal);
    wait_until(|| queue.depth() == 2).await;

    let err = queue
        .queued_generate(
            &[ChatMessage::user("c")],
            &GenerateOptions::default(),
            Priority::High,
        )
        .await
        .unwrap_err();
    assert_eq!(
        err,
        QueueError::Full {
            depth: 2,
            max_depth: 2
        }
    );
    assert_eq!(queue.stats().rejected, 1);

    backend.gate.add_permits(3);
    for handle in [in_flight, a, b] {
        handle.await.unwrap().unwrap();
    }
    assert_eq!(queue.depth(), 0);
}

#[tokio::test]
async fn test_shutdown_times_out_on_stuck_worker() {
    let backend = Arc::new(GatedModel::new());
    let config = QueueConfig {
        shutdown_grace_ms: 30,
        ..QueueConfig::default()
    };
    let queue = Arc::new(RequestQueue::new(backend.clone(), config));

    let stuck = submit(&queue, "stuck", Priority::Normal);
    wait_until(|| backend.order().len() == 1).await;

    assert!(!queue.shutdown().await);
    // The aborted worker drops the pending sender.
    let err = stuck.await.unwrap().unwrap_err();
    assert!(matches!(err, QueueError::Dropped { .. }));
}
