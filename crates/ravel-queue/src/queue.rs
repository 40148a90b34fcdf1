//! Single-worker request queue serializing calls to a model backend.
//!
//! Backends that cannot serve concurrent calls sit behind a `RequestQueue`.
//! Callers block on a one-shot channel while one background worker drains the
//! queue strictly in order, one request at a time. Failed requests are
//! delivered to their caller and also archived in the dead-letter store.

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use ravel_domain::{
    AssistantMessage, ChatMessage, Emitter, GenerateOptions, Model, ModelError, RuntimeEvent,
};

use crate::config::QueueConfig;
use crate::dead_letter::DeadLetterStore;
use crate::error::{QueueError, QueueResult};
use crate::request::{FailedRequest, Priority, QueuedRequest};
use crate::stats::QueueStats;

enum QueueItem {
    Request(QueuedRequest),
    /// Poison pill: the worker exits when it pops this.
    Shutdown,
}

struct Shared {
    items: Mutex<VecDeque<QueueItem>>,
    notify: Notify,
    stats: Mutex<QueueStats>,
    dead_letters: Option<DeadLetterStore>,
    closed: AtomicBool,
}

impl Shared {
    fn stats(&self) -> std::sync::MutexGuard<'_, QueueStats> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pop(&self) -> Option<QueueItem> {
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    /// Close the queue and enqueue the poison pill atomically.
    fn close(&self, with_pill: bool) {
        let mut items = self.items.lock().unwrap_or_else(PoisonError::into_inner);
        self.closed.store(true, Ordering::SeqCst);
        if with_pill {
            items.push_back(QueueItem::Shutdown);
        }
        drop(items);
        self.notify.notify_one();
    }
}

/// Outcome of retrying one dead-lettered request.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryOutcome {
    pub request_id: String,
    /// Attempts made so far, including this retry.
    pub attempts: u32,
    pub result: Result<AssistantMessage, ModelError>,
}

/// Serializes model calls through one background worker.
pub struct RequestQueue {
    backend: Arc<dyn Model>,
    config: QueueConfig,
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
    emitter: Emitter,
}

impl std::fmt::Debug for RequestQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestQueue")
            .field("backend", &self.backend.model_id())
            .field("config", &self.config)
            .field("depth", &self.depth())
            .finish()
    }
}

impl RequestQueue {
    pub fn new(backend: Arc<dyn Model>, config: QueueConfig) -> Self {
        let dead_letters = config
            .dead_letter_enabled
            .then(|| DeadLetterStore::new(config.dead_letter_capacity));
        Self {
            backend,
            shared: Arc::new(Shared {
                items: Mutex::new(VecDeque::new()),
                notify: Notify::new(),
                stats: Mutex::new(QueueStats::default()),
                dead_letters,
                closed: AtomicBool::new(false),
            }),
            config,
            worker: Mutex::new(None),
            emitter: Emitter::none(),
        }
    }

    pub fn with_emitter(mut self, emitter: Emitter) -> Self {
        self.emitter = emitter;
        self
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Requests waiting for the worker, excluding the one in flight.
    pub fn depth(&self) -> usize {
        self.shared
            .items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|item| matches!(item, QueueItem::Request(_)))
            .count()
    }

    pub fn stats(&self) -> QueueStats {
        self.shared.stats().clone()
    }

    pub fn dead_letters(&self) -> Option<&DeadLetterStore> {
        self.shared.dead_letters.as_ref()
    }

    /// Generate through the queue, or directly when queueing is disabled.
    pub async fn queued_generate(
        &self,
        messages: &[ChatMessage],
        options: &GenerateOptions,
        priority: Priority,
    ) -> QueueResult<AssistantMessage> {
        if !self.config.enabled {
            return self
                .backend
                .generate(messages, options)
                .await
                .map_err(QueueError::from);
        }
        let (tx, rx) = oneshot::channel();
        let request = QueuedRequest::new(priority, messages.to_vec(), options.clone(), tx);
        let request_id = request.id.clone();

        let depth = {
            let mut items = self.shared.items.lock().unwrap_or_else(PoisonError::into_inner);
            if self.shared.closed.load(Ordering::SeqCst) {
                return Err(QueueError::ShutDown);
            }
            let depth = items
                .iter()
                .filter(|item| matches!(item, QueueItem::Request(_)))
                .count();
            if depth >= self.config.max_depth {
                drop(items);
                self.shared.stats().rejected += 1;
                warn!(
                    event = "queue.rejected",
                    depth = depth,
                    max_depth = self.config.max_depth,
                );
                return Err(QueueError::Full {
                    depth,
                    max_depth: self.config.max_depth,
                });
            }
            // Splice under the lock so concurrent enqueues cannot interleave.
            match priority {
                Priority::High => items.push_front(QueueItem::Request(request)),
                Priority::Normal => items.push_back(QueueItem::Request(request)),
            }
            depth + 1
        };
        {
            let mut stats = self.shared.stats();
            stats.submitted += 1;
            if priority == Priority::High {
                stats.high_priority += 1;
            }
            stats.record_depth(depth);
        }
        debug!(event = "queue.enqueued", request_id = %request_id, priority = %priority, depth = depth);

        self.ensure_worker();
        self.shared.notify.notify_one();

        match rx.await {
            Ok(result) => result.map_err(QueueError::from),
            Err(_) => Err(QueueError::Dropped { request_id }),
        }
    }

    /// Pop up to `n` of the oldest dead letters and re-execute them directly.
    ///
    /// A retry that fails again is re-appended with its attempt count bumped.
    pub async fn retry_failed(&self, n: usize) -> Vec<RetryOutcome> {
        let Some(store) = self.shared.dead_letters.as_ref() else {
            return Vec::new();
        };
        let mut outcomes = Vec::new();
        for entry in store.pop_oldest(n) {
            let attempts = entry.attempts + 1;
            let result = self
                .backend
                .generate(&entry.request.messages, &entry.request.options)
                .await;
            {
                let mut stats = self.shared.stats();
                stats.retried += 1;
                if result.is_ok() {
                    stats.retry_succeeded += 1;
                }
            }
            match &result {
                Ok(_) => info!(
                    event = "queue.retry_succeeded",
                    request_id = %entry.request.id,
                    attempts = attempts,
                ),
                Err(e) => {
                    warn!(
                        event = "queue.retry_failed",
                        request_id = %entry.request.id,
                        attempts = attempts,
                        error = %e,
                    );
                    store.push(entry.retry_failed(e));
                }
            }
            outcomes.push(RetryOutcome {
                request_id: entry.request.id.clone(),
                attempts,
                result,
            });
        }
        outcomes
    }

    /// Stop the worker: push a poison pill, wait out the grace period, then abort.
    ///
    /// Returns `true` when the worker exited on its own.
    pub async fn shutdown(&self) -> bool {
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.shared.close(handle.is_some());
        let Some(mut handle) = handle else {
            return true;
        };

        let grace = Duration::from_millis(self.config.shutdown_grace_ms);
        match tokio::time::timeout(grace, &mut handle).await {
            Ok(_) => {
                info!(event = "queue.shutdown", graceful = true);
                true
            }
            Err(_) => {
                warn!(
                    event = "queue.shutdown",
                    graceful = false,
                    grace_ms = self.config.shutdown_grace_ms,
                );
                handle.abort();
                // Dropping the remaining senders fails their callers with `Dropped`.
                let stranded = std::mem::take(
                    &mut *self
                        .shared
                        .items
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner),
                );
                drop(stranded);
                false
            }
        }
    }

    fn ensure_worker(&self) {
        let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        if worker.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let shared = self.shared.clone();
        let backend = self.backend.clone();
        let emitter = self.emitter.clone();
        *worker = Some(tokio::spawn(run_worker(shared, backend, emitter)));
    }
}

impl Drop for RequestQueue {
    fn drop(&mut self) {
        let running = self
            .worker
            .get_mut()
            .map(|w| w.is_some())
            .unwrap_or(false);
        if running {
            self.shared.close(true);
        }
    }
}

async fn run_worker(shared: Arc<Shared>, backend: Arc<dyn Model>, emitter: Emitter) {
    debug!(event = "queue.worker_started", backend = backend.model_id());
    loop {
        let item = match shared.pop() {
            Some(item) => item,
            None => {
                shared.notify.notified().await;
                continue;
            }
        };
        let request = match item {
            QueueItem::Request(request) => request,
            QueueItem::Shutdown => break,
        };
        process(&shared, backend.as_ref(), &emitter, request).await;
    }
    debug!(event = "queue.worker_stopped");
}

async fn process(shared: &Shared, backend: &dyn Model, emitter: &Emitter, request: QueuedRequest) {
    let waited_ms = request.enqueued.elapsed().as_millis() as u64;
    info!(
        event = "queue.request_started",
        request_id = %request.id,
        priority = %request.priority,
        waited_ms = waited_ms,
    );
    emitter.emit_with(|| RuntimeEvent::QueueRequestStarted {
        request_id: request.id.clone(),
        priority: request.priority.to_string(),
        waited_ms,
    });

    let started = Instant::now();
    let result = AssertUnwindSafe(backend.generate(&request.messages, &request.options))
        .catch_unwind()
        .await
        .unwrap_or_else(|_| Err(ModelError::InvalidResponse("model backend panicked".into())));
    let duration_ms = started.elapsed().as_millis() as u64;

    {
        let mut stats = shared.stats();
        stats.total_wait_ms += waited_ms;
        if result.is_ok() {
            stats.completed += 1;
        } else {
            stats.failed += 1;
        }
    }

    if let Err(e) = &result {
        warn!(
            event = "queue.request_failed",
            request_id = %request.id,
            error_kind = e.kind(),
            error = %e,
        );
        if let Some(store) = &shared.dead_letters {
            store.push(FailedRequest::new(request.snapshot(), e, 1));
            shared.stats().dead_lettered += 1;
        }
    }

    info!(
        event = "queue.request_completed",
        request_id = %request.id,
        success = result.is_ok(),
        duration_ms = duration_ms,
    );
    let success = result.is_ok();
    let request_id = request.id.clone();
    if !request.complete(result) {
        debug!(request_id = %request_id, "caller went away before the result arrived");
    }
    emitter.emit_with(|| RuntimeEvent::QueueRequestCompleted {
        request_id,
        success,
        duration_ms,
    });
}
