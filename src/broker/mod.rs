//! Broker and task processor contracts.
//!
//! A broker is the queueing backend: it publishes signatures, delivers them
//! to a [`TaskProcessor`] and answers introspection queries. chordq ships
//! two brokers:
//! - **In-Memory**: single-process, perfect for development and tests
//! - **Redis**: distributed, behind the `redis` feature
//!
//! # Examples
//!
//! ```rust,no_run
//! use chordq::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn example() -> ChordqResult<()> {
//! let broker = InMemoryBroker::new(Arc::new(Config::default()));
//! let ctx = CancellationToken::new();
//! broker.publish(&ctx, Signature::new("add", vec![])).await?;
//! assert_eq!(broker.get_pending_tasks("chordq_tasks").await?.len(), 1);
//! # Ok(())
//! # }
//! ```

use crate::config::Config;
use crate::error::{ChordqError, ChordqResult};
use crate::tasks::Signature;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{RwLock, Semaphore};
use tokio_util::sync::CancellationToken;

pub mod memory;
pub use memory::InMemoryBroker;

#[cfg(feature = "redis")]
#[cfg_attr(docsrs, doc(cfg(feature = "redis")))]
pub mod redis;

#[cfg(feature = "redis")]
#[cfg_attr(docsrs, doc(cfg(feature = "redis")))]
pub use self::redis::RedisBroker;

/// Something that can process a delivered task.
///
/// This is nearly always a [`Worker`](crate::core::Worker).
#[async_trait]
pub trait TaskProcessor: Send + Sync {
    /// Run the task named by `signature`.
    ///
    /// Task failures are handled inside (retry, error chain). An `Err` here
    /// means the delivery itself could not be handled and the broker should
    /// apply its own policy.
    async fn process(&self, signature: Signature) -> ChordqResult<()>;

    /// Extra queue to consume from, or `None` for only the default queue
    fn custom_queue(&self) -> Option<String>;

    /// Gate checked before pulling each delivery; `false` pauses consumption
    fn pre_consume_handler(&self) -> bool;
}

/// Contract every queueing backend implements.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Configuration the broker was constructed with
    fn config(&self) -> Arc<Config>;

    /// Replace the set of task names this process can execute
    async fn set_registered_task_names(&self, names: Vec<String>);

    /// Whether `name` is in the registered set
    async fn is_task_registered(&self, name: &str) -> bool;

    /// Deliver signatures to `processor` with up to `concurrency` in flight.
    ///
    /// Blocks until [`stop_consuming`](Self::stop_consuming) is called, in
    /// which case it drains in-flight deliveries and returns `Ok(())`, or
    /// until a transport error. Errors for which
    /// [`is_retryable`](crate::ChordqError::is_retryable) is true mean the
    /// caller should reconnect and start consuming again.
    async fn start_consuming(
        &self,
        consumer_tag: &str,
        concurrency: usize,
        processor: Arc<dyn TaskProcessor>,
    ) -> ChordqResult<()>;

    /// Ask every running consumer to drain and return. Idempotent.
    ///
    /// A stop requested while nothing consumes applies to the next consumer.
    fn stop_consuming(&self);

    /// Ask only the consumer running under `consumer_tag` to drain and return.
    fn stop_consumer(&self, consumer_tag: &str) {
        let _ = consumer_tag;
        self.stop_consuming();
    }

    /// Enqueue one signature.
    ///
    /// Nothing is enqueued if `ctx` is cancelled; the call then fails with
    /// [`ChordqError::Cancelled`](crate::ChordqError::Cancelled).
    async fn publish(&self, ctx: &CancellationToken, signature: Signature) -> ChordqResult<()>;

    /// Signatures waiting in `queue`, best effort
    async fn get_pending_tasks(&self, queue: &str) -> ChordqResult<Vec<Signature>>;

    /// Signatures whose ETA has not elapsed yet, across all queues
    async fn get_delayed_tasks(&self) -> ChordqResult<Vec<Signature>>;

    /// Resolve the destination queue of `signature` in place
    fn adjust_routing_key(&self, signature: &mut Signature);
}

/// Stop tokens of the running consumers
#[derive(Debug, Default)]
struct Sessions {
    active: HashMap<String, CancellationToken>,
    /// Stop asked for while nothing consumed
    pending_stop: bool,
    /// Tags stopped before their consumer started
    pending_tags: HashSet<String>,
}

/// State every broker shares: configuration, registered names and consumer stop signals.
#[derive(Debug)]
pub struct BrokerBase {
    config: Arc<Config>,
    registered_task_names: RwLock<HashSet<String>>,
    sessions: Mutex<Sessions>,
}

/// One consumer's stop signal; unregisters itself when dropped.
#[derive(Debug)]
pub struct ConsumerSession<'a> {
    base: &'a BrokerBase,
    consumer_tag: String,
    stop: CancellationToken,
}

impl ConsumerSession<'_> {
    /// Cancelled once this consumer is asked to stop
    pub fn stop_token(&self) -> &CancellationToken {
        &self.stop
    }

    /// Whether this consumer was asked to stop
    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }
}

impl Drop for ConsumerSession<'_> {
    fn drop(&mut self) {
        self.base.sessions().active.remove(&self.consumer_tag);
    }
}

impl BrokerBase {
    /// Create the shared state for a broker
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            config,
            registered_task_names: RwLock::new(HashSet::new()),
            sessions: Mutex::new(Sessions::default()),
        }
    }

    fn sessions(&self) -> MutexGuard<'_, Sessions> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Broker configuration
    pub fn config(&self) -> Arc<Config> {
        Arc::clone(&self.config)
    }

    /// Replace the registered name set
    pub async fn set_registered_task_names(&self, names: Vec<String>) {
        let mut registered = self.registered_task_names.write().await;
        *registered = names.into_iter().collect();
        tracing::debug!("Broker knows {} task names", registered.len());
    }

    /// Whether `name` is registered
    pub async fn is_task_registered(&self, name: &str) -> bool {
        self.registered_task_names.read().await.contains(name)
    }

    /// Register a consumer under `consumer_tag`.
    ///
    /// The session starts out stopped when a stop arrived before it. Fails
    /// with [`ChordqError::AlreadyRunning`] when the tag is already consuming.
    pub fn begin_session(&self, consumer_tag: &str) -> ChordqResult<ConsumerSession<'_>> {
        let mut sessions = self.sessions();
        if sessions.active.contains_key(consumer_tag) {
            return Err(ChordqError::AlreadyRunning);
        }

        let stop = CancellationToken::new();
        let pending_tag = sessions.pending_tags.remove(consumer_tag);
        if std::mem::take(&mut sessions.pending_stop) || pending_tag {
            tracing::debug!("Consumer {} stopped before it started", consumer_tag);
            stop.cancel();
        }
        sessions.active.insert(consumer_tag.to_string(), stop.clone());

        Ok(ConsumerSession {
            base: self,
            consumer_tag: consumer_tag.to_string(),
            stop,
        })
    }

    /// Signal every consumer to stop, or the next one when none is running
    pub fn stop_consuming(&self) {
        let mut sessions = self.sessions();
        if sessions.active.is_empty() {
            sessions.pending_stop = true;
            tracing::info!("Stop requested before any consumer started");
            return;
        }
        for (tag, stop) in &sessions.active {
            if !stop.is_cancelled() {
                tracing::info!("Stop consuming requested for {}", tag);
            }
            stop.cancel();
        }
    }

    /// Signal the consumer running under `consumer_tag` to stop
    pub fn stop_consumer(&self, consumer_tag: &str) {
        let mut sessions = self.sessions();
        match sessions.active.get(consumer_tag) {
            Some(stop) => {
                if !stop.is_cancelled() {
                    tracing::info!("Stop consuming requested for {}", consumer_tag);
                }
                stop.cancel();
            }
            None => {
                sessions.pending_tags.insert(consumer_tag.to_string());
            }
        }
    }

    /// Default routing: fall back to the configured default queue
    pub fn adjust_routing_key(&self, signature: &mut Signature) {
        if signature.routing_key.is_empty() {
            signature.routing_key = self.config.broker.default_queue.clone();
        }
    }

    /// Queues a consumer reads from: the default queue plus the processor's custom queue
    pub fn consume_queues(&self, processor: &dyn TaskProcessor) -> Vec<String> {
        let default_queue = self.config.broker.default_queue.clone();
        match processor.custom_queue() {
            Some(custom) if !custom.is_empty() && custom != default_queue => vec![custom, default_queue],
            _ => vec![default_queue],
        }
    }

    /// Concurrency to use: the configured default when the caller passes 0,
    /// never more than a semaphore can hold
    pub fn effective_concurrency(&self, concurrency: usize) -> usize {
        let concurrency = if concurrency == 0 {
            self.config.worker.concurrency.max(1)
        } else {
            concurrency
        };
        concurrency.min(Semaphore::MAX_PERMITS)
    }
}
