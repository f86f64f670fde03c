//! The chordq server: task registration, sending and worker creation.
//!
//! The [`Server`] is the producer-side entry point. It owns the broker, the
//! result backend and the task registry, and hands them to every worker it
//! creates.

use crate::backend::{AsyncResult, InMemoryBackend, ResultBackend};
use crate::broker::{Broker, InMemoryBroker};
use crate::config::{BrokerKind, Config};
use crate::error::{ChordqError, ChordqResult};
use crate::tasks::{Chain, Chord, Group, Signature};
use futures::stream::{self, StreamExt, TryStreamExt};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub mod orchestrator;
pub mod registry;
pub mod worker;

pub use orchestrator::{FailureOutcome, Orchestrator};
pub use registry::{FnTask, RegistrySummary, TaskHandler, TaskRegistry, TaskTypeStats, task_fn};
pub use worker::{Worker, WorkerStats};

/// The main chordq server.
///
/// # Examples
///
/// ```rust
/// use chordq::prelude::*;
///
/// #[tokio::main]
/// async fn main() -> ChordqResult<()> {
///     let server = Server::new(Config::default()).await?;
///     server
///         .register_task("hello", task_fn(|_args| async { Ok(vec![]) }))
///         .await;
///
///     let result = server.send_task(Signature::new("hello", vec![])).await?;
///     println!("Sent {}", result.task_uuid());
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct Server {
    config: Arc<Config>,
    broker: Arc<dyn Broker>,
    backend: Arc<dyn ResultBackend>,
    registry: Arc<TaskRegistry>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Server {
    /// Create a server with the broker selected by `config.broker.kind`.
    ///
    /// The result backend lives next to the broker: in memory for the
    /// in-memory broker, in the same Redis for the Redis broker, so every
    /// process sharing the queues also shares group and chord state.
    pub async fn new(config: Config) -> ChordqResult<Self> {
        config
            .validate()
            .map_err(|errors| ChordqError::config(errors.join("; ")))?;
        let config = Arc::new(config);

        let (broker, backend): (Arc<dyn Broker>, Arc<dyn ResultBackend>) = match &config.broker.kind {
            BrokerKind::InMemory => (
                Arc::new(InMemoryBroker::new(Arc::clone(&config))),
                Arc::new(InMemoryBackend::with_config(&config.backend)),
            ),
            #[cfg(feature = "redis")]
            BrokerKind::Redis(redis) => {
                let connect_timeout =
                    std::time::Duration::from_secs(config.broker.operation_timeout_secs.max(1));
                (
                    Arc::new(crate::broker::RedisBroker::new(Arc::clone(&config)).await?),
                    Arc::new(
                        crate::backend::RedisBackend::new(redis, &config.backend, connect_timeout)
                            .await?,
                    ),
                )
            }
        };

        Ok(Self::with_components(config, broker, backend))
    }

    /// Create a server over an existing broker and result backend.
    pub fn with_components(
        config: Arc<Config>,
        broker: Arc<dyn Broker>,
        backend: Arc<dyn ResultBackend>,
    ) -> Self {
        Self {
            config,
            broker,
            backend,
            registry: Arc::new(TaskRegistry::new()),
        }
    }

    /// Configuration in use
    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    /// Broker in use
    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    /// Result backend in use
    pub fn backend(&self) -> &Arc<dyn ResultBackend> {
        &self.backend
    }

    /// Task registry shared with every worker
    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    /// Register one task and publish the new name set to the broker.
    pub async fn register_task(&self, name: impl Into<String>, handler: impl TaskHandler + 'static) {
        self.registry.register(name, handler).await;
        self.sync_registered_names().await;
    }

    /// Register several tasks at once.
    pub async fn register_tasks<I, S>(&self, tasks: I)
    where
        I: IntoIterator<Item = (S, Arc<dyn TaskHandler>)>,
        S: Into<String>,
    {
        for (name, handler) in tasks {
            self.registry.register_arc(name, handler).await;
        }
        self.sync_registered_names().await;
    }

    async fn sync_registered_names(&self) {
        let names = self.registry.registered_names().await;
        self.broker.set_registered_task_names(names).await;
    }

    /// Whether a handler is registered for `name`
    pub async fn is_task_registered(&self, name: &str) -> bool {
        self.registry.is_registered(name).await
    }

    /// Send one task.
    pub async fn send_task(&self, signature: Signature) -> ChordqResult<AsyncResult> {
        self.send_task_with_context(&CancellationToken::new(), signature)
            .await
    }

    /// Send one task, giving up if `ctx` is cancelled before it is enqueued.
    pub async fn send_task_with_context(
        &self,
        ctx: &CancellationToken,
        signature: Signature,
    ) -> ChordqResult<AsyncResult> {
        let task_uuid = signature.uuid.clone();
        self.backend.set_state_pending(&signature).await?;

        if let Err(e) = self.broker.publish(ctx, signature).await {
            tracing::error!("Failed to send task {}: {}", task_uuid, e);
            self.backend.purge_state(&task_uuid).await?;
            return Err(e);
        }

        tracing::debug!("Sent task {}", task_uuid);
        Ok(AsyncResult::new(task_uuid, Arc::clone(&self.backend)))
    }

    /// Send the head of a chain; the result tracks the last task.
    pub async fn send_chain(&self, chain: Chain) -> ChordqResult<AsyncResult> {
        let last = chain
            .task_uuids()
            .last()
            .cloned()
            .ok_or_else(|| ChordqError::workflow("chain is empty"))?;

        self.send_task(chain.into_head()).await?;
        Ok(AsyncResult::new(last, Arc::clone(&self.backend)))
    }

    /// Record group membership, then publish every member with bounded concurrency.
    ///
    /// Results are returned in member order.
    pub async fn send_group(&self, group: Group) -> ChordqResult<Vec<AsyncResult>> {
        self.send_group_with_context(&CancellationToken::new(), group)
            .await
    }

    /// Like [`send_group`](Self::send_group) with a cancellation context.
    pub async fn send_group_with_context(
        &self,
        ctx: &CancellationToken,
        group: Group,
    ) -> ChordqResult<Vec<AsyncResult>> {
        let group_uuid = group.group_uuid().to_string();
        self.backend
            .init_group(&group_uuid, &group.task_uuids())
            .await?;

        let width = self.config.worker.publish_concurrency.max(1);
        tracing::info!(
            "Sending group {} with {} tasks ({} at a time)",
            group_uuid,
            group.len(),
            width
        );

        stream::iter(group.into_tasks())
            .map(|signature| self.send_task_with_context(ctx, signature))
            .buffered(width)
            .try_collect()
            .await
    }

    /// Send a chord; the result tracks the callback.
    pub async fn send_chord(&self, chord: Chord) -> ChordqResult<AsyncResult> {
        let (group, callback) = chord.into_parts();
        self.send_group(group).await?;
        Ok(AsyncResult::new(callback.uuid, Arc::clone(&self.backend)))
    }

    /// Create a worker consuming from the default queue.
    ///
    /// A `concurrency` of 0 uses `config.worker.concurrency`.
    pub fn new_worker(&self, consumer_tag: impl Into<String>, concurrency: usize) -> Worker {
        self.build_worker(consumer_tag, concurrency, None)
    }

    /// Create a worker that also consumes from `queue`.
    pub fn new_custom_queue_worker(
        &self,
        consumer_tag: impl Into<String>,
        concurrency: usize,
        queue: impl Into<String>,
    ) -> Worker {
        self.build_worker(consumer_tag, concurrency, Some(queue.into()))
    }

    fn build_worker(
        &self,
        consumer_tag: impl Into<String>,
        concurrency: usize,
        queue: Option<String>,
    ) -> Worker {
        Worker::new(
            consumer_tag,
            concurrency,
            queue,
            Arc::clone(&self.config),
            Arc::clone(&self.broker),
            Arc::clone(&self.backend),
            Arc::clone(&self.registry),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::{Arg, TaskResult, TaskStatus};

    async fn server() -> Server {
        let server = Server::new(Config::testing()).await.unwrap();
        server
            .register_task(
                "echo",
                task_fn(|args: Vec<Arg>| async move {
                    Ok(args
                        .into_iter()
                        .map(|arg| TaskResult::new(arg.arg_type, arg.value))
                        .collect())
                }),
            )
            .await;
        server
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let mut config = Config::testing();
        config.worker.concurrency = 0;
        assert!(matches!(
            Server::new(config).await,
            Err(ChordqError::ConfigError { .. })
        ));
    }

    #[tokio::test]
    async fn test_registration_reaches_broker() {
        let server = server().await;
        assert!(server.is_task_registered("echo").await);
        assert!(server.broker().is_task_registered("echo").await);

        server
            .register_tasks([(
                "noop",
                Arc::new(task_fn(|_args| async { Ok(vec![]) })) as Arc<dyn TaskHandler>,
            )])
            .await;
        assert!(server.broker().is_task_registered("noop").await);
    }

    #[tokio::test]
    async fn test_send_task_marks_pending() {
        let server = server().await;
        let sig = Signature::new("echo", vec![]);

        let result = server.send_task(sig.clone()).await.unwrap();
        assert_eq!(result.task_uuid(), sig.uuid);
        assert_eq!(
            result.state().await.unwrap().unwrap().status,
            TaskStatus::Pending
        );
        assert_eq!(
            server.broker().get_pending_tasks("chordq_tasks").await.unwrap()[0].uuid,
            sig.uuid
        );
    }

    #[tokio::test]
    async fn test_cancelled_send_leaves_no_trace() {
        let server = server().await;
        let ctx = CancellationToken::new();
        ctx.cancel();

        let sig = Signature::new("echo", vec![]);
        let err = server.send_task_with_context(&ctx, sig.clone()).await.unwrap_err();
        assert!(matches!(err, ChordqError::Cancelled { .. }));
        assert!(server.backend().get_state(&sig.uuid).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_send_chain_publishes_head_only() {
        let server = server().await;
        let first = Signature::new("echo", vec![]);
        let last = Signature::new("echo", vec![]);
        let chain = Chain::new(vec![first.clone(), last.clone()]).unwrap();

        let result = server.send_chain(chain).await.unwrap();
        assert_eq!(result.task_uuid(), last.uuid);

        let pending = server.broker().get_pending_tasks("chordq_tasks").await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].uuid, first.uuid);
        assert_eq!(pending[0].on_success[0].uuid, last.uuid);
    }

    #[tokio::test]
    async fn test_send_group_records_membership() {
        let server = server().await;
        let group = Group::new((0..5).map(|i| Signature::new("echo", vec![Arg::new("int64", i)])).collect())
            .unwrap();
        let group_uuid = group.group_uuid().to_string();
        let uuids = group.task_uuids();

        let results = server.send_group(group).await.unwrap();
        let sent: Vec<_> = results.iter().map(|r| r.task_uuid().to_string()).collect();
        assert_eq!(sent, uuids);

        let pending = server.broker().get_pending_tasks("chordq_tasks").await.unwrap();
        assert_eq!(pending.len(), 5);
        assert!(pending.iter().all(|s| s.group_uuid == group_uuid && s.group_task_count == 5));
        assert!(!server.backend().group_completed(&group_uuid, 5).await.unwrap());
    }

    #[tokio::test]
    async fn test_send_chord_tracks_callback() {
        let server = server().await;
        let group = Group::new(vec![Signature::new("echo", vec![]), Signature::new("echo", vec![])]).unwrap();
        let callback = Signature::new("echo", vec![]);
        let chord = Chord::new(group, callback.clone()).unwrap();

        let result = server.send_chord(chord).await.unwrap();
        assert_eq!(result.task_uuid(), callback.uuid);

        let pending = server.broker().get_pending_tasks("chordq_tasks").await.unwrap();
        assert_eq!(pending.len(), 2);
        assert!(pending
            .iter()
            .all(|s| s.chord_callback.as_deref().map(|c| c.uuid.as_str()) == Some(callback.uuid.as_str())));
    }

    #[tokio::test]
    async fn test_workers() {
        let server = server().await;
        let worker = server.new_custom_queue_worker("images-worker", 1, "images");
        assert_eq!(worker.consumer_tag(), "images-worker");
        assert_eq!(
            crate::broker::TaskProcessor::custom_queue(&worker),
            Some("images".to_string())
        );
        assert_eq!(server.new_worker("w", 0).consumer_tag(), "w");
    }
}
