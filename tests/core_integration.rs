//! Integration tests across the scheduler, request queue and tiered cache.
//!
//! Each test wires the real components together with a scripted stub
//! engine and a temporary cache directory.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::time::timeout;
use tokio_stream::StreamExt;

use lexigen::cache::TieredCache;
use lexigen::config::{CacheConfig, RequestQueueConfig, SchedulerConfig};
use lexigen::error::{EngineError, RequestError};
use lexigen::events::{CoreEvent, EventBus};
use lexigen::requests::{
    CachingEngine, Engine, EntryParams, LanguageParams, LanguageValidation, LemmaParams,
    RegenerateParams, RequestKind, RequestOptions, RequestParams, RequestQueue, RequestStatus,
};
use lexigen::worker::{TaskOptions, TaskPriority, TaskScheduler, TaskStatus};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Stub engine replaying scripted failures before succeeding.
#[derive(Default)]
struct ScriptedEngine {
    failures: Mutex<VecDeque<EngineError>>,
    always_fail: Option<EngineError>,
    calls: AtomicU32,
}

impl ScriptedEngine {
    fn failing_first(errors: Vec<EngineError>) -> Self {
        Self {
            failures: Mutex::new(errors.into()),
            ..Default::default()
        }
    }

    fn always_failing(error: EngineError) -> Self {
        Self {
            always_fail: Some(error),
            ..Default::default()
        }
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn next(&self) -> Result<(), EngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = &self.always_fail {
            return Err(error.clone());
        }
        match self.failures.lock().unwrap().pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Engine for ScriptedEngine {
    async fn lemma(&self, params: &LemmaParams) -> Result<String, EngineError> {
        self.next()?;
        Ok(params.word.clone())
    }

    async fn create_entry(&self, params: &EntryParams) -> Result<Value, EngineError> {
        self.next()?;
        Ok(json!({
            "headword": params.word,
            "definition": format!("definition of {}", params.word),
        }))
    }

    async fn regenerate_entry(&self, params: &RegenerateParams) -> Result<Value, EngineError> {
        self.next()?;
        Ok(json!({ "headword": params.headword, "seed": params.variation_seed }))
    }

    async fn validate_language(
        &self,
        params: &LanguageParams,
    ) -> Result<LanguageValidation, EngineError> {
        self.next()?;
        Ok(LanguageValidation {
            standardized_name: params.name.to_lowercase(),
            display_name: params.name.clone(),
        })
    }
}

/// Engine delegating to a shared `ScriptedEngine` so tests can inspect it.
struct Shared(Arc<ScriptedEngine>);

#[async_trait]
impl Engine for Shared {
    async fn lemma(&self, params: &LemmaParams) -> Result<String, EngineError> {
        self.0.lemma(params).await
    }

    async fn create_entry(&self, params: &EntryParams) -> Result<Value, EngineError> {
        self.0.create_entry(params).await
    }

    async fn regenerate_entry(&self, params: &RegenerateParams) -> Result<Value, EngineError> {
        self.0.regenerate_entry(params).await
    }

    async fn validate_language(
        &self,
        params: &LanguageParams,
    ) -> Result<LanguageValidation, EngineError> {
        self.0.validate_language(params).await
    }
}

fn queue_config() -> RequestQueueConfig {
    RequestQueueConfig {
        poll_interval: Duration::from_millis(10),
        ..Default::default()
    }
}

fn quick_retries(max_retries: u32) -> RequestOptions {
    RequestOptions::default()
        .max_retries(max_retries)
        .base_delay(Duration::from_millis(10))
}

#[tokio::test]
async fn rate_limited_entry_completes_on_third_attempt() {
    let events = EventBus::new();
    let mut stream = events.stream();
    let engine = Arc::new(ScriptedEngine::failing_first(vec![
        EngineError::RateLimited { retry_after: None },
        EngineError::Status {
            code: 429,
            message: "Too Many Requests".into(),
        },
    ]));
    let queue = RequestQueue::new(queue_config(), engine.clone(), events);

    let ticket = queue
        .enqueue_awaitable(
            RequestParams::entry("jablko").target_lang("en").source_lang("pl"),
            quick_retries(3),
        )
        .await
        .unwrap();
    let id = ticket.id();
    let entry = timeout(TEST_TIMEOUT, ticket).await.unwrap().unwrap();
    assert_eq!(entry["headword"], "jablko");

    let snapshot = queue.snapshot(id).await.unwrap();
    assert_eq!(snapshot.status, RequestStatus::Completed);
    assert_eq!(snapshot.attempts, 3);
    assert_eq!(snapshot.retry_history.len(), 2);
    assert_eq!(engine.calls(), 3);

    let mut retries = 0;
    loop {
        let event = timeout(TEST_TIMEOUT, stream.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        match event {
            CoreEvent::RequestRetry { kind, .. } => {
                assert_eq!(kind, RequestKind::EntryCreation);
                retries += 1;
            }
            CoreEvent::RequestCompleted { attempts, .. } => {
                assert_eq!(attempts, 3);
                break;
            }
            _ => {}
        }
    }
    assert_eq!(retries, 2);
    queue.shutdown().await;
}

#[tokio::test]
async fn attempts_never_exceed_retry_budget() {
    for max_retries in 0..=3 {
        let engine = Arc::new(ScriptedEngine::always_failing(EngineError::Timeout(
            "engine timed out".into(),
        )));
        let queue = RequestQueue::new(queue_config(), engine.clone(), EventBus::new());

        let ticket = queue
            .enqueue_awaitable(RequestParams::lemma("domy"), quick_retries(max_retries))
            .await
            .unwrap();
        let id = ticket.id();
        let err = timeout(TEST_TIMEOUT, ticket).await.unwrap().unwrap_err();
        assert!(matches!(err, RequestError::Failed { .. }));

        let snapshot = queue.snapshot(id).await.unwrap();
        assert_eq!(snapshot.status, RequestStatus::Failed);
        assert_eq!(snapshot.attempts, max_retries + 1);
        assert_eq!(engine.calls(), max_retries + 1);
        queue.shutdown().await;
    }
}

#[tokio::test]
async fn cache_miss_put_then_hit() {
    let dir = TempDir::new().unwrap();
    let cache = TieredCache::new(CacheConfig::with_dir(dir.path()), EventBus::new()).unwrap();
    let key = TieredCache::key("entry", &json!({"word": "jablko", "target_lang": "en"})).unwrap();

    assert!(cache.get(&key).await.is_none());
    let before = cache.stats().await.memory_hits;

    cache.put(&key, json!({"definition": "x"})).await;
    assert_eq!(cache.get(&key).await, Some(json!({"definition": "x"})));
    assert_eq!(cache.stats().await.memory_hits, before + 1);

    assert!(cache.remove(&key).await);
    assert!(cache.get(&key).await.is_none());
    cache.shutdown().await;
}

#[tokio::test]
async fn queue_over_caching_engine_skips_repeat_calls() {
    let dir = TempDir::new().unwrap();
    let events = EventBus::new();
    let cache = TieredCache::new(CacheConfig::with_dir(dir.path()), events.clone()).unwrap();
    let scripted = Arc::new(ScriptedEngine::default());
    let engine = Arc::new(CachingEngine::new(Shared(scripted.clone()), cache.clone()));
    let queue = RequestQueue::new(queue_config(), engine, events);

    for _ in 0..2 {
        let ticket = queue
            .enqueue_awaitable(RequestParams::entry("kot").target_lang("en"), quick_retries(0))
            .await
            .unwrap();
        let entry = timeout(TEST_TIMEOUT, ticket).await.unwrap().unwrap();
        assert_eq!(entry["headword"], "kot");
    }
    assert_eq!(scripted.calls(), 1);
    assert_eq!(cache.stats().await.memory_hits, 1);

    // regeneration is never served from cache
    for _ in 0..2 {
        let ticket = queue
            .enqueue_awaitable(
                RequestParams::regenerate("kot").variation_seed("same"),
                quick_retries(0),
            )
            .await
            .unwrap();
        timeout(TEST_TIMEOUT, ticket).await.unwrap().unwrap();
    }
    assert_eq!(scripted.calls(), 3);

    queue.shutdown().await;
    cache.shutdown().await;
}

#[tokio::test]
async fn scheduled_task_awaits_engine_request() {
    let events = EventBus::new();
    let scheduler = TaskScheduler::new(SchedulerConfig::default(), events.clone());
    let queue = RequestQueue::new(
        queue_config(),
        Arc::new(ScriptedEngine::default()),
        events,
    );
    let (done_tx, done_rx) = tokio::sync::oneshot::channel();

    let worker_queue = Arc::clone(&queue);
    let id = scheduler
        .submit(
            TaskOptions::new("lookup")
                .priority(TaskPriority::HIGH)
                .on_complete(move |value| {
                    let _ = done_tx.send(value);
                }),
            move |ctx| async move {
                ctx.report_progress(10.0).await;
                let ticket = worker_queue
                    .enqueue_awaitable(RequestParams::validate_language("Polish"), quick_retries(1))
                    .await?;
                let validation = ticket.await?;
                ctx.report_progress(100.0).await;
                Ok(validation)
            },
        )
        .await
        .unwrap();

    let value = timeout(TEST_TIMEOUT, done_rx).await.unwrap().unwrap();
    assert_eq!(value["standardized_name"], "polish");

    let snapshot = scheduler.get_status(id).await.unwrap();
    assert_eq!(snapshot.status, TaskStatus::Completed);
    assert_eq!(snapshot.progress, 100.0);

    queue.shutdown().await;
    scheduler.shutdown().await;
}

#[tokio::test]
async fn task_lifecycle_events_arrive_in_order() {
    let events = EventBus::new();
    let mut stream = events.stream();
    let scheduler = TaskScheduler::new(
        SchedulerConfig {
            workers: 1,
            ..Default::default()
        },
        events,
    );

    let id = scheduler
        .submit(TaskOptions::new("export"), |_ctx| async { Ok(json!("done")) })
        .await
        .unwrap();

    let mut names = Vec::new();
    while names.last() != Some(&"task:completed") {
        let event = timeout(TEST_TIMEOUT, stream.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        match &event {
            CoreEvent::TaskSubmitted { task_id, .. }
            | CoreEvent::TaskStarted { task_id, .. }
            | CoreEvent::TaskCompleted { task_id, .. } => {
                assert_eq!(*task_id, id);
                names.push(event.name());
            }
            _ => {}
        }
    }
    assert_eq!(names, vec!["task:submitted", "task:started", "task:completed"]);
    scheduler.shutdown().await;
}
