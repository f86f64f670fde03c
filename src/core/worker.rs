//! Worker implementation for chordq.
//!
//! A [`Worker`] consumes from a broker and runs every delivery through the
//! task registry. Outcomes go to the [`Orchestrator`], which records state
//! and publishes retries, chains and chord callbacks.

use crate::backend::ResultBackend;
use crate::broker::{Broker, TaskProcessor};
use crate::config::Config;
use crate::core::orchestrator::{FailureOutcome, Orchestrator};
use crate::core::registry::TaskRegistry;
use crate::error::{ChordqError, ChordqResult, TaskError};
use crate::tasks::Signature;
use crate::utils::{calculate_backoff, hash_seed};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Called before a task body runs
pub type PreTaskHandler = Arc<dyn Fn(&Signature) + Send + Sync>;
/// Called after a task body returns, whatever the outcome
pub type PostTaskHandler = Arc<dyn Fn(&Signature) + Send + Sync>;
/// Called when a task body fails
pub type ErrorHandler = Arc<dyn Fn(&Signature, &TaskError) + Send + Sync>;
/// Gate checked before each delivery is pulled
pub type PreConsumeHandler = Arc<dyn Fn() -> bool + Send + Sync>;

/// Statistics about worker performance
#[derive(Debug, Clone, Default)]
pub struct WorkerStats {
    /// Number of tasks processed successfully
    pub tasks_completed: u64,
    /// Number of tasks that failed for good
    pub tasks_failed: u64,
    /// Number of retries published
    pub tasks_retried: u64,
    /// Number of times the consumer reconnected
    pub reconnects: u64,
    /// Average task processing time
    pub avg_task_duration: Option<Duration>,
}

impl WorkerStats {
    fn record_duration(&mut self, duration: Duration) {
        let runs = self.tasks_completed + self.tasks_failed + self.tasks_retried;
        self.avg_task_duration = Some(match self.avg_task_duration {
            Some(avg) if runs > 1 => {
                let total = avg.as_nanos() * u128::from(runs - 1) + duration.as_nanos();
                Duration::from_nanos((total / u128::from(runs)) as u64)
            }
            _ => duration,
        });
    }
}

#[derive(Clone, Default)]
struct WorkerHooks {
    pre_task: Option<PreTaskHandler>,
    post_task: Option<PostTaskHandler>,
    error: Option<ErrorHandler>,
    pre_consume: Option<PreConsumeHandler>,
}

/// Consumes signatures from a broker and executes them.
#[derive(Clone)]
pub struct Worker {
    consumer_tag: String,
    concurrency: usize,
    queue: Option<String>,
    config: Arc<Config>,
    broker: Arc<dyn Broker>,
    registry: Arc<TaskRegistry>,
    orchestrator: Orchestrator,
    hooks: WorkerHooks,
    stats: Arc<Mutex<WorkerStats>>,
    /// Cancelled by [`quit`](Self::quit); ends reconnect backoff early
    quit: CancellationToken,
    /// Context for publishing continuations; never cancelled so in-flight work can finish
    publish_ctx: CancellationToken,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("consumer_tag", &self.consumer_tag)
            .field("concurrency", &self.concurrency)
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}

impl Worker {
    pub(crate) fn new(
        consumer_tag: impl Into<String>,
        concurrency: usize,
        queue: Option<String>,
        config: Arc<Config>,
        broker: Arc<dyn Broker>,
        backend: Arc<dyn ResultBackend>,
        registry: Arc<TaskRegistry>,
    ) -> Self {
        let orchestrator = Orchestrator::new(Arc::clone(&broker), backend, config.retry.clone());
        Self {
            consumer_tag: consumer_tag.into(),
            concurrency,
            queue,
            config,
            broker,
            registry,
            orchestrator,
            hooks: WorkerHooks::default(),
            stats: Arc::new(Mutex::new(WorkerStats::default())),
            quit: CancellationToken::new(),
            publish_ctx: CancellationToken::new(),
        }
    }

    /// Run `handler` before every task body
    pub fn with_pre_task_handler(mut self, handler: impl Fn(&Signature) + Send + Sync + 'static) -> Self {
        self.hooks.pre_task = Some(Arc::new(handler));
        self
    }

    /// Run `handler` after every task body
    pub fn with_post_task_handler(mut self, handler: impl Fn(&Signature) + Send + Sync + 'static) -> Self {
        self.hooks.post_task = Some(Arc::new(handler));
        self
    }

    /// Run `handler` whenever a task body fails
    pub fn with_error_handler(
        mut self,
        handler: impl Fn(&Signature, &TaskError) + Send + Sync + 'static,
    ) -> Self {
        self.hooks.error = Some(Arc::new(handler));
        self
    }

    /// Pause consumption while `handler` returns `false`
    pub fn with_pre_consume_handler(mut self, handler: impl Fn() -> bool + Send + Sync + 'static) -> Self {
        self.hooks.pre_consume = Some(Arc::new(handler));
        self
    }

    /// Consumer tag given to the broker
    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    /// Current statistics
    pub async fn stats(&self) -> WorkerStats {
        self.stats.lock().await.clone()
    }

    /// Consume until [`quit`](Self::quit) is called.
    ///
    /// Retryable broker errors are answered by reconnecting with exponential
    /// backoff, at most `max_reconnect_attempts` times over the worker's
    /// lifetime (0 means forever). Fatal errors are returned.
    pub async fn launch(&self) -> ChordqResult<()> {
        let names = self.registry.registered_names().await;
        if names.is_empty() {
            tracing::warn!("Worker {} launched with no registered tasks", self.consumer_tag);
        }
        self.broker.set_registered_task_names(names).await;

        let processor: Arc<dyn TaskProcessor> = Arc::new(self.clone());
        let max_attempts = self.config.worker.max_reconnect_attempts;
        let seed = hash_seed(&self.consumer_tag);
        let mut attempt = 0u32;

        loop {
            tracing::info!(
                "Launching worker {} (concurrency {})",
                self.consumer_tag,
                self.concurrency
            );

            match self
                .broker
                .start_consuming(&self.consumer_tag, self.concurrency, Arc::clone(&processor))
                .await
            {
                Ok(()) => {
                    tracing::info!("Worker {} stopped", self.consumer_tag);
                    return Ok(());
                }
                Err(e) if e.is_retryable() => {
                    attempt += 1;
                    if max_attempts > 0 && attempt > max_attempts {
                        tracing::error!(
                            "Worker {} giving up after {} reconnect attempts: {}",
                            self.consumer_tag,
                            max_attempts,
                            e
                        );
                        return Err(e);
                    }

                    let backoff_ms =
                        calculate_backoff(attempt, self.config.worker.reconnect_base_delay_ms, seed);
                    tracing::warn!(
                        "Worker {} lost its broker connection ({}), reconnecting in {}ms",
                        self.consumer_tag,
                        e,
                        backoff_ms
                    );
                    self.stats.lock().await.reconnects += 1;

                    tokio::select! {
                        _ = self.quit.cancelled() => {
                            tracing::info!("Worker {} quit while reconnecting", self.consumer_tag);
                            return Ok(());
                        }
                        _ = sleep(Duration::from_millis(backoff_ms)) => {}
                    }
                }
                Err(e) => {
                    tracing::error!("Worker {} failed: {}", self.consumer_tag, e);
                    return Err(e);
                }
            }
        }
    }

    /// Like [`launch`](Self::launch), but quits on Ctrl+C.
    pub async fn launch_until_ctrl_c(&self) -> ChordqResult<()> {
        let quitter = self.clone();
        let listener = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
                quitter.quit();
            }
        });

        let result = self.launch().await;
        listener.abort();
        result
    }

    /// Stop consuming; in-flight tasks are drained before `launch` returns.
    ///
    /// Only this worker's consumer stops; other workers on the same broker keep running.
    pub fn quit(&self) {
        self.quit.cancel();
        self.broker.stop_consumer(&self.consumer_tag);
    }

    async fn run(&self, signature: Signature) -> ChordqResult<()> {
        if !self.registry.is_registered(&signature.name).await {
            if signature.ignore_when_task_not_registered {
                tracing::debug!("Ignoring unregistered task {}", signature.name);
                return Ok(());
            }
            return Err(ChordqError::TaskNotRegistered {
                name: signature.name,
            });
        }

        let backend = self.orchestrator.backend();
        backend.set_state_received(&signature).await?;
        backend.set_state_started(&signature).await?;

        if let Some(hook) = &self.hooks.pre_task {
            hook(&signature);
        }

        let timeout = self.config.worker.task_timeout_secs.map(Duration::from_secs);
        let start = Instant::now();
        let result = self
            .registry
            .execute(&signature.name, signature.args.clone(), timeout)
            .await;
        let duration = start.elapsed();

        if let Some(hook) = &self.hooks.post_task {
            hook(&signature);
        }

        match result {
            Ok(results) => {
                tracing::info!("Task completed in {:?}", duration);
                self.orchestrator
                    .on_success(&self.publish_ctx, &signature, results)
                    .await?;

                let mut stats = self.stats.lock().await;
                stats.tasks_completed += 1;
                stats.record_duration(duration);
            }
            Err(err) => {
                if let Some(hook) = &self.hooks.error {
                    hook(&signature, &err);
                }
                let outcome = self
                    .orchestrator
                    .on_failure(&self.publish_ctx, &signature, &err)
                    .await?;

                let mut stats = self.stats.lock().await;
                match outcome {
                    FailureOutcome::Retried { .. } => stats.tasks_retried += 1,
                    FailureOutcome::Failed => stats.tasks_failed += 1,
                }
                stats.record_duration(duration);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl TaskProcessor for Worker {
    async fn process(&self, signature: Signature) -> ChordqResult<()> {
        let span = tracing::info_span!(
            "task",
            task_uuid = %signature.uuid,
            task_name = %signature.name,
            retry_count = signature.retry_count,
            trace_id = tracing::field::Empty,
        );
        if let Some(trace_id) = signature.headers.get_str("trace_id") {
            span.record("trace_id", trace_id);
        }

        self.run(signature).instrument(span).await
    }

    fn custom_queue(&self) -> Option<String> {
        self.queue.clone()
    }

    fn pre_consume_handler(&self) -> bool {
        self.hooks.pre_consume.as_ref().is_none_or(|gate| gate())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{AsyncResult, InMemoryBackend};
    use crate::broker::{BrokerBase, InMemoryBroker};
    use crate::core::registry::task_fn;
    use crate::tasks::{Arg, TaskResult, TaskStatus};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixture {
        broker: Arc<InMemoryBroker>,
        backend: Arc<InMemoryBackend>,
        registry: Arc<TaskRegistry>,
        config: Arc<Config>,
    }

    impl Fixture {
        async fn new() -> Self {
            let config = Arc::new(Config::testing());
            let registry = Arc::new(TaskRegistry::new());
            registry
                .register(
                    "double",
                    task_fn(|args: Vec<Arg>| async move {
                        let value = args[0].decode::<i64>()?;
                        Ok::<_, TaskError>(vec![TaskResult::new("int64", value * 2)])
                    }),
                )
                .await;
            registry
                .register("fail", task_fn(|_args| async { Err(TaskError::failed("nope")) }))
                .await;

            Self {
                broker: Arc::new(InMemoryBroker::new(Arc::clone(&config))),
                backend: Arc::new(InMemoryBackend::new()),
                registry,
                config,
            }
        }

        fn worker(&self) -> Worker {
            Worker::new(
                "test-worker",
                2,
                None,
                Arc::clone(&self.config),
                Arc::clone(&self.broker) as Arc<dyn Broker>,
                Arc::clone(&self.backend) as Arc<dyn ResultBackend>,
                Arc::clone(&self.registry),
            )
        }
    }

    #[tokio::test]
    async fn test_process_success_publishes_chain() {
        let fixture = Fixture::new().await;
        let next = Signature::new("double", vec![]);
        let sig = Signature::new("double", vec![Arg::new("int64", 3)]).then(next.clone());

        let calls = Arc::new(AtomicUsize::new(0));
        let (pre, post) = (Arc::clone(&calls), Arc::clone(&calls));
        let worker = fixture
            .worker()
            .with_pre_task_handler(move |_| {
                pre.fetch_add(1, Ordering::SeqCst);
            })
            .with_post_task_handler(move |_| {
                post.fetch_add(1, Ordering::SeqCst);
            });

        worker.process(sig.clone()).await.unwrap();

        let state = fixture.backend.get_state(&sig.uuid).await.unwrap().unwrap();
        assert_eq!(state.status, TaskStatus::Success);
        assert_eq!(state.results, vec![TaskResult::new("int64", 6)]);

        let pending = fixture.broker.get_pending_tasks("chordq_tasks").await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].uuid, next.uuid);
        assert_eq!(pending[0].args, vec![Arg::new("int64", 6)]);

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(worker.stats().await.tasks_completed, 1);
    }

    #[tokio::test]
    async fn test_process_failure_retries() {
        let fixture = Fixture::new().await;
        let errors = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&errors);
        let worker = fixture.worker().with_error_handler(move |_, err| {
            assert_eq!(err, &TaskError::failed("nope"));
            seen.fetch_add(1, Ordering::SeqCst);
        });

        let sig = Signature::new("fail", vec![]);
        worker.process(sig.clone()).await.unwrap();

        let delayed = fixture.broker.get_delayed_tasks().await.unwrap();
        assert_eq!(delayed.len(), 1);
        assert_eq!(delayed[0].retry_count, 1);
        assert_eq!(delayed[0].uuid, sig.uuid);
        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert_eq!(worker.stats().await.tasks_retried, 1);
    }

    #[tokio::test]
    async fn test_unregistered_task() {
        let fixture = Fixture::new().await;
        let worker = fixture.worker();

        let err = worker.process(Signature::new("ghost", vec![])).await.unwrap_err();
        assert!(matches!(err, ChordqError::TaskNotRegistered { name } if name == "ghost"));

        let mut ignored = Signature::new("ghost", vec![]);
        ignored.ignore_when_task_not_registered = true;
        worker.process(ignored).await.unwrap();
    }

    #[tokio::test]
    async fn test_pre_consume_gate() {
        let fixture = Fixture::new().await;
        assert!(fixture.worker().pre_consume_handler());
        assert!(!fixture.worker().with_pre_consume_handler(|| false).pre_consume_handler());
        assert_eq!(fixture.worker().custom_queue(), None);
    }

    #[tokio::test]
    async fn test_launch_and_quit() {
        let fixture = Fixture::new().await;
        let worker = fixture.worker();
        let ctx = CancellationToken::new();

        let sig = Signature::new("double", vec![Arg::new("int64", 21)]);
        fixture.broker.publish(&ctx, sig.clone()).await.unwrap();

        let running = {
            let worker = worker.clone();
            tokio::spawn(async move { worker.launch().await })
        };

        let backend = Arc::clone(&fixture.backend) as Arc<dyn ResultBackend>;
        let result = AsyncResult::new(&sig.uuid, backend)
            .get_with_timeout(Duration::from_secs(2), Duration::from_millis(5))
            .await
            .unwrap();
        assert_eq!(result, vec![TaskResult::new("int64", 42)]);

        worker.quit();
        running.await.unwrap().unwrap();
    }

    /// Fails `start_consuming` a set number of times, then consumes until stopped
    struct FlakyBroker {
        base: BrokerBase,
        retryable_failures: AtomicUsize,
        fatal: bool,
        starts: AtomicUsize,
    }

    impl FlakyBroker {
        fn new(config: Arc<Config>, retryable_failures: usize, fatal: bool) -> Arc<Self> {
            Arc::new(Self {
                base: BrokerBase::new(config),
                retryable_failures: AtomicUsize::new(retryable_failures),
                fatal,
                starts: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Broker for FlakyBroker {
        fn config(&self) -> Arc<Config> {
            self.base.config()
        }

        async fn set_registered_task_names(&self, names: Vec<String>) {
            self.base.set_registered_task_names(names).await;
        }

        async fn is_task_registered(&self, name: &str) -> bool {
            self.base.is_task_registered(name).await
        }

        async fn start_consuming(
            &self,
            consumer_tag: &str,
            _concurrency: usize,
            _processor: Arc<dyn TaskProcessor>,
        ) -> ChordqResult<()> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            if self
                .retryable_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .is_ok()
            {
                return Err(ChordqError::transport(
                    "Connection reset",
                    std::io::Error::from(std::io::ErrorKind::ConnectionReset),
                ));
            }
            if self.fatal {
                return Err(ChordqError::fatal_transport("Authentication failed"));
            }

            let session = self.base.begin_session(consumer_tag)?;
            session.stop_token().cancelled().await;
            Ok(())
        }

        fn stop_consuming(&self) {
            self.base.stop_consuming();
        }

        fn stop_consumer(&self, consumer_tag: &str) {
            self.base.stop_consumer(consumer_tag);
        }

        async fn publish(&self, _ctx: &CancellationToken, _signature: Signature) -> ChordqResult<()> {
            Ok(())
        }

        async fn get_pending_tasks(&self, _queue: &str) -> ChordqResult<Vec<Signature>> {
            Ok(Vec::new())
        }

        async fn get_delayed_tasks(&self) -> ChordqResult<Vec<Signature>> {
            Ok(Vec::new())
        }

        fn adjust_routing_key(&self, signature: &mut Signature) {
            self.base.adjust_routing_key(signature);
        }
    }

    fn worker_on(broker: Arc<FlakyBroker>, config: Arc<Config>) -> Worker {
        Worker::new(
            "flaky-worker",
            1,
            None,
            config,
            broker as Arc<dyn Broker>,
            Arc::new(InMemoryBackend::new()) as Arc<dyn ResultBackend>,
            Arc::new(TaskRegistry::new()),
        )
    }

    #[tokio::test]
    async fn test_launch_reconnects_after_retryable_errors() {
        let config = Arc::new(Config::testing());
        let broker = FlakyBroker::new(Arc::clone(&config), 2, false);
        let worker = worker_on(Arc::clone(&broker), config);

        let running = {
            let worker = worker.clone();
            tokio::spawn(async move { worker.launch().await })
        };

        tokio::time::timeout(Duration::from_secs(2), async {
            while broker.starts.load(Ordering::SeqCst) < 3 {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        // Give the third attempt time to open its session
        sleep(Duration::from_millis(20)).await;

        worker.quit();
        running.await.unwrap().unwrap();
        assert_eq!(broker.starts.load(Ordering::SeqCst), 3);
        assert_eq!(worker.stats().await.reconnects, 2);
    }

    #[tokio::test]
    async fn test_launch_gives_up_after_max_reconnect_attempts() {
        let config = Arc::new(Config::testing());
        let broker = FlakyBroker::new(Arc::clone(&config), usize::MAX, false);
        let worker = worker_on(Arc::clone(&broker), Arc::clone(&config));

        let err = worker.launch().await.unwrap_err();
        assert!(err.is_retryable());

        let max = config.worker.max_reconnect_attempts;
        assert_eq!(broker.starts.load(Ordering::SeqCst), max as usize + 1);
        assert_eq!(worker.stats().await.reconnects, u64::from(max));
    }

    #[tokio::test]
    async fn test_fatal_consumer_error_is_not_retried() {
        let config = Arc::new(Config::testing());
        let broker = FlakyBroker::new(Arc::clone(&config), 0, true);
        let worker = worker_on(Arc::clone(&broker), config);

        let err = worker.launch().await.unwrap_err();
        assert!(!err.is_retryable());
        assert_eq!(broker.starts.load(Ordering::SeqCst), 1);
        assert_eq!(worker.stats().await.reconnects, 0);
    }

    #[tokio::test]
    async fn test_quit_ends_reconnect_backoff() {
        let mut config = Config::testing();
        config.worker.reconnect_base_delay_ms = 60_000;
        config.worker.max_reconnect_attempts = 0;
        let config = Arc::new(config);
        let broker = FlakyBroker::new(Arc::clone(&config), usize::MAX, false);
        let worker = worker_on(Arc::clone(&broker), config);

        let running = {
            let worker = worker.clone();
            tokio::spawn(async move { worker.launch().await })
        };
        sleep(Duration::from_millis(50)).await;

        worker.quit();
        let finished = tokio::time::timeout(Duration::from_secs(1), running).await;
        assert!(matches!(finished, Ok(Ok(Ok(())))));
        assert_eq!(broker.starts.load(Ordering::SeqCst), 1);
        assert_eq!(worker.stats().await.reconnects, 1);
    }

    #[tokio::test]
    async fn test_new_worker_consumes_after_another_quit() {
        let fixture = Fixture::new().await;
        let ctx = CancellationToken::new();
        let backend = Arc::clone(&fixture.backend) as Arc<dyn ResultBackend>;

        let first = fixture.worker();
        let running = {
            let worker = first.clone();
            tokio::spawn(async move { worker.launch().await })
        };
        sleep(Duration::from_millis(20)).await;
        first.quit();
        running.await.unwrap().unwrap();

        let sig = Signature::new("double", vec![Arg::new("int64", 5)]);
        fixture.broker.publish(&ctx, sig.clone()).await.unwrap();

        let second = Worker::new(
            "second-worker",
            1,
            None,
            Arc::clone(&fixture.config),
            Arc::clone(&fixture.broker) as Arc<dyn Broker>,
            Arc::clone(&backend),
            Arc::clone(&fixture.registry),
        );
        let running = {
            let worker = second.clone();
            tokio::spawn(async move { worker.launch().await })
        };

        let result = AsyncResult::new(&sig.uuid, backend)
            .get_with_timeout(Duration::from_secs(2), Duration::from_millis(5))
            .await
            .unwrap();
        assert_eq!(result, vec![TaskResult::new("int64", 10)]);

        second.quit();
        running.await.unwrap().unwrap();
    }

    #[test]
    fn test_stats_average() {
        let mut stats = WorkerStats::default();
        stats.tasks_completed = 1;
        stats.record_duration(Duration::from_millis(10));
        stats.tasks_completed = 2;
        stats.record_duration(Duration::from_millis(30));
        assert_eq!(stats.avg_task_duration, Some(Duration::from_millis(20)));
    }
}
