//! In-memory broker implementation for chordq.
//!
//! This broker keeps every queue in process memory. It's perfect for
//! development, testing, and single-process applications where persistence
//! across restarts is not required.
//!
//! # Features
//!
//! - **Named queues**: one FIFO per routing key, priority-ordered (higher first)
//! - **Delayed delivery**: signatures with a future ETA wait in a delayed set
//! - **Dead letters**: deliveries that cannot be handled are kept for inspection
//! - **Concurrent consumer**: up to `concurrency` deliveries in flight

use super::{Broker, BrokerBase, TaskProcessor};
use crate::config::Config;
use crate::error::{ChordqError, ChordqResult};
use crate::tasks::Signature;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, RwLock, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Queue contents guarded by a single lock so publish is all-or-nothing
#[derive(Debug, Default)]
struct QueueState {
    /// Ready signatures per queue name
    queues: HashMap<String, VecDeque<Signature>>,
    /// Signatures waiting for their ETA, sorted by ETA
    delayed: Vec<Signature>,
    /// Deliveries that could not be handled, oldest first
    dead_letters: VecDeque<Signature>,
}

impl QueueState {
    fn len(&self) -> usize {
        self.queues.values().map(VecDeque::len).sum::<usize>() + self.delayed.len()
    }

    /// Insert behind every signature of equal or higher priority
    fn push_ready(&mut self, signature: Signature) {
        let queue = self.queues.entry(signature.routing_key.clone()).or_default();
        let index = queue
            .iter()
            .position(|queued| queued.priority < signature.priority)
            .unwrap_or(queue.len());
        queue.insert(index, signature);
    }

    fn push_delayed(&mut self, signature: Signature) {
        let index = self
            .delayed
            .partition_point(|queued| queued.eta <= signature.eta);
        self.delayed.insert(index, signature);
    }

    /// Move every delayed signature whose ETA has elapsed into its queue
    fn promote_due(&mut self) -> usize {
        let now = Utc::now();
        let due = self
            .delayed
            .partition_point(|queued| !queued.is_delayed(now));
        let promoted: Vec<Signature> = self.delayed.drain(..due).collect();
        let count = promoted.len();
        for signature in promoted {
            self.push_ready(signature);
        }
        count
    }

    /// Keep at most `max` dead letters (0 = unlimited), dropping the oldest
    fn push_dead_letter(&mut self, signature: Signature, max: usize) {
        self.dead_letters.push_back(signature);
        if max > 0 {
            while self.dead_letters.len() > max {
                if let Some(dropped) = self.dead_letters.pop_front() {
                    tracing::debug!("Dropping oldest dead letter {}", dropped.uuid);
                }
            }
        }
    }

    fn pop(&mut self, queue_names: &[String]) -> Option<Signature> {
        queue_names
            .iter()
            .find_map(|name| self.queues.get_mut(name).and_then(VecDeque::pop_front))
    }
}

/// In-memory broker implementation
#[derive(Debug)]
pub struct InMemoryBroker {
    base: BrokerBase,
    state: Arc<RwLock<QueueState>>,
    /// Wakes an idle consumer when something is published
    notify: Arc<Notify>,
}

impl InMemoryBroker {
    /// Create a new in-memory broker
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            base: BrokerBase::new(config),
            state: Arc::new(RwLock::new(QueueState::default())),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Total number of queued and delayed signatures
    pub async fn len(&self) -> usize {
        self.state.read().await.len()
    }

    /// Whether no signature is queued or delayed
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Deliveries that were rejected or failed to process
    pub async fn dead_letters(&self) -> Vec<Signature> {
        self.state.read().await.dead_letters.iter().cloned().collect()
    }

    /// Drop every queued, delayed and dead-lettered signature; returns how many were removed
    pub async fn purge(&self) -> usize {
        let mut state = self.state.write().await;
        let purged = state.len() + state.dead_letters.len();
        *state = QueueState::default();
        tracing::warn!("Purged {} signatures from broker", purged);
        purged
    }

    fn is_full(&self, state: &QueueState) -> bool {
        let max = self.base.config().broker.max_queue_size;
        max > 0 && state.len() >= max
    }

    /// Wait until something is published, the poll interval elapses or `stop` fires.
    /// Returns `false` once stop was requested.
    async fn idle(&self, stop: &CancellationToken, poll_interval: Duration) -> bool {
        tokio::select! {
            _ = stop.cancelled() => false,
            _ = self.notify.notified() => true,
            _ = tokio::time::sleep(poll_interval) => true,
        }
    }

    async fn drain(&self, in_flight: &mut JoinSet<()>) {
        let shutdown_timeout = self
            .base
            .config()
            .worker
            .shutdown_timeout_secs
            .map(Duration::from_secs);

        let drain_all = async {
            while let Some(joined) = in_flight.join_next().await {
                if let Err(e) = joined {
                    tracing::error!("Delivery task panicked: {}", e);
                }
            }
        };

        match shutdown_timeout {
            Some(timeout) => {
                if tokio::time::timeout(timeout, drain_all).await.is_err() {
                    tracing::warn!(
                        "Shutdown timeout of {:?} reached, aborting {} deliveries",
                        timeout,
                        in_flight.len()
                    );
                    in_flight.abort_all();
                }
            }
            None => drain_all.await,
        }
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
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
        concurrency: usize,
        processor: Arc<dyn TaskProcessor>,
    ) -> ChordqResult<()> {
        let session = self.base.begin_session(consumer_tag)?;
        let stop = session.stop_token();
        let max_dead_letters = self.base.config().broker.max_dead_letters;
        let concurrency = self.base.effective_concurrency(concurrency);
        let queue_names = self.base.consume_queues(processor.as_ref());
        let poll_interval = self.base.config().broker.poll_interval();
        let semaphore = Arc::new(Semaphore::new(concurrency));
        let mut in_flight = JoinSet::new();

        tracing::info!(
            "Consumer {} started on {:?} with concurrency {}",
            consumer_tag,
            queue_names,
            concurrency
        );

        while !session.is_stopped() {
            while let Some(joined) = in_flight.try_join_next() {
                if let Err(e) = joined {
                    tracing::error!("Delivery task panicked: {}", e);
                }
            }

            if !processor.pre_consume_handler() {
                tracing::trace!("Pre-consume handler paused consumer {}", consumer_tag);
                if !self.idle(stop, poll_interval).await {
                    break;
                }
                continue;
            }

            let permit = tokio::select! {
                _ = stop.cancelled() => break,
                permit = Arc::clone(&semaphore).acquire_owned() => permit.map_err(|e| {
                    ChordqError::transport("Consumer semaphore closed", e)
                })?,
            };

            let next = {
                let mut state = self.state.write().await;
                let promoted = state.promote_due();
                if promoted > 0 {
                    tracing::debug!("Promoted {} delayed signatures", promoted);
                }
                state.pop(&queue_names)
            };

            let Some(signature) = next else {
                drop(permit);
                if !self.idle(stop, poll_interval).await {
                    break;
                }
                continue;
            };

            if !self.base.is_task_registered(&signature.name).await {
                if signature.ignore_when_task_not_registered {
                    tracing::debug!(
                        "Dropping unregistered task {} ({})",
                        signature.name,
                        signature.uuid
                    );
                } else {
                    tracing::warn!(
                        "Task {} ({}) is not registered, moving to dead letters",
                        signature.name,
                        signature.uuid
                    );
                    self.state
                        .write()
                        .await
                        .push_dead_letter(signature, max_dead_letters);
                }
                continue;
            }

            let processor = Arc::clone(&processor);
            let state = Arc::clone(&self.state);
            let notify = Arc::clone(&self.notify);
            in_flight.spawn(async move {
                let _permit = permit;
                let task_uuid = signature.uuid.clone();
                let retained = signature.clone();

                if let Err(e) = processor.process(signature).await {
                    tracing::error!("Delivery of task {} failed: {}", task_uuid, e);
                    let mut state = state.write().await;
                    if retained.stop_task_deletion_on_error {
                        state.push_ready(retained);
                        notify.notify_one();
                    } else {
                        state.push_dead_letter(retained, max_dead_letters);
                    }
                }
            });
        }

        tracing::info!(
            "Consumer {} stopping, draining {} in-flight deliveries",
            consumer_tag,
            in_flight.len()
        );
        self.drain(&mut in_flight).await;
        drop(session);
        tracing::info!("Consumer {} stopped", consumer_tag);
        Ok(())
    }

    fn stop_consuming(&self) {
        self.base.stop_consuming();
        self.notify.notify_waiters();
    }

    fn stop_consumer(&self, consumer_tag: &str) {
        self.base.stop_consumer(consumer_tag);
    }

    async fn publish(&self, ctx: &CancellationToken, mut signature: Signature) -> ChordqResult<()> {
        if ctx.is_cancelled() {
            return Err(ChordqError::Cancelled {
                task_uuid: signature.uuid,
            });
        }
        self.adjust_routing_key(&mut signature);

        let mut state = tokio::select! {
            biased;
            _ = ctx.cancelled() => {
                return Err(ChordqError::Cancelled { task_uuid: signature.uuid });
            }
            state = self.state.write() => state,
        };

        if self.is_full(&state) {
            return Err(ChordqError::fatal_transport(format!(
                "Queue is full (max size: {})",
                self.base.config().broker.max_queue_size
            )));
        }

        let delayed = signature.is_delayed(Utc::now());
        tracing::debug!(
            "Publishing task {} ({}) to {}{}",
            signature.name,
            signature.uuid,
            signature.routing_key,
            if delayed { " (delayed)" } else { "" }
        );
        if delayed {
            state.push_delayed(signature);
        } else {
            state.push_ready(signature);
        }
        drop(state);

        self.notify.notify_one();
        Ok(())
    }

    async fn get_pending_tasks(&self, queue: &str) -> ChordqResult<Vec<Signature>> {
        let state = self.state.read().await;
        Ok(state
            .queues
            .get(queue)
            .map(|queued| queued.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn get_delayed_tasks(&self) -> ChordqResult<Vec<Signature>> {
        Ok(self.state.read().await.delayed.clone())
    }

    fn adjust_routing_key(&self, signature: &mut Signature) {
        self.base.adjust_routing_key(signature);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    /// Records deliveries and stops the broker after `stop_after` of them
    struct Recorder {
        broker: Arc<InMemoryBroker>,
        seen: Mutex<Vec<Signature>>,
        stop_after: usize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        delay: Duration,
        fail: bool,
        open: AtomicBool,
    }

    impl Recorder {
        fn new(broker: Arc<InMemoryBroker>, stop_after: usize) -> Self {
            Self {
                broker,
                seen: Mutex::new(Vec::new()),
                stop_after,
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                delay: Duration::ZERO,
                fail: false,
                open: AtomicBool::new(true),
            }
        }
    }

    #[async_trait]
    impl TaskProcessor for Recorder {
        async fn process(&self, signature: Signature) -> ChordqResult<()> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let mut seen = self.seen.lock().await;
            seen.push(signature);
            if seen.len() >= self.stop_after {
                self.broker.stop_consuming();
            }
            if self.fail {
                return Err(ChordqError::fatal_transport("backend down"));
            }
            Ok(())
        }

        fn custom_queue(&self) -> Option<String> {
            None
        }

        fn pre_consume_handler(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }
    }

    fn broker() -> Arc<InMemoryBroker> {
        Arc::new(InMemoryBroker::new(Arc::new(Config::testing())))
    }

    async fn registered_broker(names: &[&str]) -> Arc<InMemoryBroker> {
        let broker = broker();
        broker
            .set_registered_task_names(names.iter().map(|n| n.to_string()).collect())
            .await;
        broker
    }

    #[tokio::test]
    async fn test_publish_routes_to_default_queue() {
        let broker = broker();
        let ctx = CancellationToken::new();

        broker.publish(&ctx, Signature::new("add", vec![])).await.unwrap();
        broker
            .publish(&ctx, Signature::new("resize", vec![]).with_routing_key("images"))
            .await
            .unwrap();

        let pending = broker.get_pending_tasks("chordq_tasks").await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].routing_key, "chordq_tasks");
        assert_eq!(broker.get_pending_tasks("images").await.unwrap().len(), 1);
        assert!(broker.get_pending_tasks("unknown").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_priority_order_is_stable() {
        let broker = broker();
        let ctx = CancellationToken::new();

        for (name, priority) in [("low-1", 0), ("high", 9), ("low-2", 0), ("mid", 5)] {
            broker
                .publish(&ctx, Signature::new(name, vec![]).with_priority(priority))
                .await
                .unwrap();
        }

        let names: Vec<String> = broker
            .get_pending_tasks("chordq_tasks")
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(names, vec!["high", "mid", "low-1", "low-2"]);
    }

    #[tokio::test]
    async fn test_cancelled_publish_enqueues_nothing() {
        let broker = broker();
        let ctx = CancellationToken::new();
        ctx.cancel();

        let sig = Signature::new("add", vec![]);
        let uuid = sig.uuid.clone();
        let err = broker.publish(&ctx, sig).await.unwrap_err();

        assert!(matches!(err, ChordqError::Cancelled { task_uuid } if task_uuid == uuid));
        assert!(broker.is_empty().await);
    }

    #[tokio::test]
    async fn test_queue_size_limit() {
        let mut config = Config::testing();
        config.broker.max_queue_size = 2;
        let broker = InMemoryBroker::new(Arc::new(config));
        let ctx = CancellationToken::new();

        broker.publish(&ctx, Signature::new("a", vec![])).await.unwrap();
        broker.publish(&ctx, Signature::new("b", vec![])).await.unwrap();
        let err = broker.publish(&ctx, Signature::new("c", vec![])).await.unwrap_err();

        assert!(!err.is_retryable());
        assert_eq!(broker.len().await, 2);
    }

    #[tokio::test]
    async fn test_delayed_tasks_wait_for_eta() {
        let broker = registered_broker(&["later"]).await;
        let ctx = CancellationToken::new();
        let eta = Utc::now() + chrono::Duration::milliseconds(150);

        broker
            .publish(&ctx, Signature::new("later", vec![]).with_eta(eta))
            .await
            .unwrap();

        assert!(broker.get_pending_tasks("chordq_tasks").await.unwrap().is_empty());
        assert_eq!(broker.get_delayed_tasks().await.unwrap().len(), 1);

        let recorder = Arc::new(Recorder::new(Arc::clone(&broker), 1));
        broker
            .start_consuming("test", 1, Arc::clone(&recorder) as Arc<dyn TaskProcessor>)
            .await
            .unwrap();

        assert!(Utc::now() >= eta);
        assert_eq!(recorder.seen.lock().await.len(), 1);
        assert!(broker.get_delayed_tasks().await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_consumer_respects_concurrency() {
        let names: Vec<String> = (0..12).map(|i| format!("t{i}")).collect();
        let broker = registered_broker(&names.iter().map(String::as_str).collect::<Vec<_>>()).await;
        let ctx = CancellationToken::new();
        for name in &names {
            broker.publish(&ctx, Signature::new(name.clone(), vec![])).await.unwrap();
        }

        let mut recorder = Recorder::new(Arc::clone(&broker), names.len());
        recorder.delay = Duration::from_millis(20);
        let recorder = Arc::new(recorder);

        broker
            .start_consuming("test", 3, Arc::clone(&recorder) as Arc<dyn TaskProcessor>)
            .await
            .unwrap();

        assert_eq!(recorder.seen.lock().await.len(), names.len());
        assert!(recorder.max_in_flight.load(Ordering::SeqCst) <= 3);
        assert!(broker.is_empty().await);
    }

    #[tokio::test]
    async fn test_stop_before_start_is_not_lost() {
        let broker = broker();
        broker.stop_consuming();
        broker.stop_consuming();

        let recorder = Arc::new(Recorder::new(Arc::clone(&broker), usize::MAX));
        let result = tokio::time::timeout(
            Duration::from_secs(1),
            broker.start_consuming("test", 1, recorder as Arc<dyn TaskProcessor>),
        )
        .await;

        assert!(matches!(result, Ok(Ok(()))));
    }

    #[tokio::test]
    async fn test_unregistered_tasks_are_dropped_or_dead_lettered() {
        let broker = registered_broker(&["known"]).await;
        let ctx = CancellationToken::new();

        let mut ignored = Signature::new("ghost", vec![]);
        ignored.ignore_when_task_not_registered = true;
        broker.publish(&ctx, ignored).await.unwrap();
        broker.publish(&ctx, Signature::new("stranger", vec![])).await.unwrap();
        broker.publish(&ctx, Signature::new("known", vec![])).await.unwrap();

        let recorder = Arc::new(Recorder::new(Arc::clone(&broker), 1));
        broker
            .start_consuming("test", 1, Arc::clone(&recorder) as Arc<dyn TaskProcessor>)
            .await
            .unwrap();

        let seen = recorder.seen.lock().await;
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].name, "known");

        let dead = broker.dead_letters().await;
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].name, "stranger");
    }

    #[tokio::test]
    async fn test_failed_delivery_is_requeued_when_deletion_is_stopped() {
        let broker = registered_broker(&["flaky"]).await;
        let ctx = CancellationToken::new();
        let mut sig = Signature::new("flaky", vec![]);
        sig.stop_task_deletion_on_error = true;
        broker.publish(&ctx, sig).await.unwrap();

        let mut recorder = Recorder::new(Arc::clone(&broker), 1);
        recorder.fail = true;
        broker
            .start_consuming("test", 1, Arc::new(recorder) as Arc<dyn TaskProcessor>)
            .await
            .unwrap();

        assert_eq!(broker.get_pending_tasks("chordq_tasks").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_pre_consume_gate_pauses_delivery() {
        let broker = registered_broker(&["gated"]).await;
        let ctx = CancellationToken::new();
        broker.publish(&ctx, Signature::new("gated", vec![])).await.unwrap();

        let recorder = Arc::new(Recorder::new(Arc::clone(&broker), 1));
        recorder.open.store(false, Ordering::SeqCst);

        let consumer = {
            let broker = Arc::clone(&broker);
            let processor = Arc::clone(&recorder) as Arc<dyn TaskProcessor>;
            tokio::spawn(async move { broker.start_consuming("test", 1, processor).await })
        };

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(recorder.seen.lock().await.is_empty());
        assert_eq!(broker.len().await, 1);

        recorder.open.store(true, Ordering::SeqCst);
        consumer.await.unwrap().unwrap();
        assert_eq!(recorder.seen.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_consumers_with_distinct_tags_run_together() {
        let broker = registered_broker(&["shared"]).await;
        let recorder = Arc::new(Recorder::new(Arc::clone(&broker), usize::MAX));

        let spawn_consumer = |tag: &'static str| {
            let broker = Arc::clone(&broker);
            let processor = Arc::clone(&recorder) as Arc<dyn TaskProcessor>;
            tokio::spawn(async move { broker.start_consuming(tag, 1, processor).await })
        };
        let first = spawn_consumer("first");
        let second = spawn_consumer("second");
        tokio::time::sleep(Duration::from_millis(20)).await;

        let duplicate = broker
            .start_consuming("first", 1, Arc::clone(&recorder) as Arc<dyn TaskProcessor>)
            .await;
        assert!(matches!(duplicate, Err(ChordqError::AlreadyRunning)));

        broker.stop_consumer("first");
        first.await.unwrap().unwrap();
        assert!(!second.is_finished());

        let ctx = CancellationToken::new();
        broker.publish(&ctx, Signature::new("shared", vec![])).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(recorder.seen.lock().await.len(), 1);

        broker.stop_consuming();
        second.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_consumer_restarts_after_stop() {
        let broker = registered_broker(&["again"]).await;
        let ctx = CancellationToken::new();

        let recorder = Arc::new(Recorder::new(Arc::clone(&broker), usize::MAX));
        let first = {
            let broker = Arc::clone(&broker);
            let processor = Arc::clone(&recorder) as Arc<dyn TaskProcessor>;
            tokio::spawn(async move { broker.start_consuming("worker", 1, processor).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        broker.stop_consuming();
        first.await.unwrap().unwrap();

        broker.publish(&ctx, Signature::new("again", vec![])).await.unwrap();
        let recorder = Arc::new(Recorder::new(Arc::clone(&broker), 1));
        tokio::time::timeout(
            Duration::from_secs(2),
            broker.start_consuming("worker", 1, Arc::clone(&recorder) as Arc<dyn TaskProcessor>),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(recorder.seen.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_dead_letters_are_capped() {
        let mut config = Config::testing();
        config.broker.max_dead_letters = 2;
        let broker = Arc::new(InMemoryBroker::new(Arc::new(config)));
        broker.set_registered_task_names(vec!["known".into()]).await;
        let ctx = CancellationToken::new();

        for name in ["s1", "s2", "s3"] {
            broker.publish(&ctx, Signature::new(name, vec![])).await.unwrap();
        }
        broker.publish(&ctx, Signature::new("known", vec![])).await.unwrap();

        let recorder = Arc::new(Recorder::new(Arc::clone(&broker), 1));
        broker
            .start_consuming("test", 1, recorder as Arc<dyn TaskProcessor>)
            .await
            .unwrap();

        let names: Vec<String> = broker.dead_letters().await.into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["s2", "s3"]);
    }

    #[tokio::test]
    async fn test_purge() {
        let broker = broker();
        let ctx = CancellationToken::new();
        for i in 0..3 {
            broker
                .publish(&ctx, Signature::new(format!("t{i}"), vec![]))
                .await
                .unwrap();
        }

        assert_eq!(broker.purge().await, 3);
        assert!(broker.is_empty().await);
    }
}
