//! Redis broker implementation for chordq.
//!
//! This broker uses Redis as the transport, providing distributed queue
//! capabilities suitable for multi-process and multi-server deployments.
//!
//! # Layout
//!
//! - `{prefix}:queue:{name}`: list of JSON signatures, one per routing key
//! - `{prefix}:delayed`: sorted set of JSON signatures scored by ETA in milliseconds
//! - `{prefix}:dead_letters`: list of deliveries that failed to process
//!
//! Priority is not interpreted: Redis lists are strictly FIFO.

use super::{Broker, BrokerBase, ConsumerSession, TaskProcessor};
use crate::config::{BrokerKind, Config, RedisConfig};
use crate::error::{ChordqError, ChordqResult};
use crate::tasks::Signature;
use async_trait::async_trait;
use chrono::Utc;
use redis::{AsyncCommands, Client, Script, aio::ConnectionManager};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Moves due members of the delayed set onto their queue lists in one step
const PROMOTE_DELAYED: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, tonumber(ARGV[3]))
for _, payload in ipairs(due) do
    redis.call('ZREM', KEYS[1], payload)
    local signature = cjson.decode(payload)
    redis.call('RPUSH', ARGV[2] .. ':queue:' .. signature['routing_key'], payload)
end
return #due
"#;

/// How many delayed signatures a single promotion moves at most
const PROMOTE_BATCH: usize = 100;

/// Redis broker implementation
pub struct RedisBroker {
    base: BrokerBase,
    client: Client,
    /// Shared connection for publish and introspection
    conn: ConnectionManager,
    redis: RedisConfig,
    promote_script: Script,
}

impl std::fmt::Debug for RedisBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBroker")
            .field("base", &self.base)
            .field("redis", &self.redis)
            .finish_non_exhaustive()
    }
}

impl RedisBroker {
    /// Connect using the Redis settings in `config.broker.kind`
    pub async fn new(config: Arc<Config>) -> ChordqResult<Self> {
        let redis = match &config.broker.kind {
            BrokerKind::Redis(redis) => redis.clone(),
            _ => return Err(ChordqError::config("Redis configuration not found in broker config")),
        };

        let client = Client::open(redis.connection_string.as_str())
            .map_err(|e| ChordqError::transport("Failed to create Redis client", e))?;

        let connect_timeout = Duration::from_secs(config.broker.operation_timeout_secs.max(1));
        let conn = timeout(connect_timeout, client.get_connection_manager())
            .await
            .map_err(|e| ChordqError::transport("Timed out connecting to Redis", e))?
            .map_err(|e| ChordqError::transport("Failed to create Redis connection manager", e))?;

        info!("Connected to Redis with key prefix {}", redis.key_prefix);

        Ok(Self {
            base: BrokerBase::new(config),
            client,
            conn,
            redis,
            promote_script: Script::new(PROMOTE_DELAYED),
        })
    }

    fn queue_key(&self, queue: &str) -> String {
        format!("{}:queue:{}", self.redis.key_prefix, queue)
    }

    fn delayed_key(&self) -> String {
        format!("{}:delayed", self.redis.key_prefix)
    }

    fn dead_letters_key(&self) -> String {
        format!("{}:dead_letters", self.redis.key_prefix)
    }

    fn decode_all(payloads: Vec<String>) -> ChordqResult<Vec<Signature>> {
        payloads
            .iter()
            .map(|payload| serde_json::from_str(payload).map_err(ChordqError::from))
            .collect()
    }

    async fn promote_delayed(&self) -> ChordqResult<usize> {
        let mut conn = self.conn.clone();
        let moved: usize = self
            .promote_script
            .key(self.delayed_key())
            .arg(Utc::now().timestamp_millis())
            .arg(&self.redis.key_prefix)
            .arg(PROMOTE_BATCH)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| ChordqError::transport("Failed to promote delayed tasks", e))?;

        if moved > 0 {
            debug!("Moved {} delayed tasks to their queues", moved);
        }
        Ok(moved)
    }

    /// Delete every queue, the delayed set and the dead letters under the key prefix
    pub async fn purge(&self, queues: &[&str]) -> ChordqResult<()> {
        let mut keys: Vec<String> = queues.iter().map(|queue| self.queue_key(queue)).collect();
        keys.push(self.delayed_key());
        keys.push(self.dead_letters_key());

        let mut conn = self.conn.clone();
        conn.del::<_, ()>(&keys)
            .await
            .map_err(|e| ChordqError::transport("Failed to purge broker keys", e))?;
        warn!("Purged {} Redis keys", keys.len());
        Ok(())
    }

    /// Deliveries that failed to process
    pub async fn dead_letters(&self) -> ChordqResult<Vec<Signature>> {
        let mut conn = self.conn.clone();
        let payloads: Vec<String> = conn
            .lrange(self.dead_letters_key(), 0, -1)
            .await
            .map_err(|e| ChordqError::transport("Failed to read dead letters", e))?;
        Self::decode_all(payloads)
    }
}

#[async_trait]
impl Broker for RedisBroker {
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
        self.consume(&session, consumer_tag, concurrency, processor).await
    }

    fn stop_consuming(&self) {
        self.base.stop_consuming();
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
        let payload = serde_json::to_string(&signature)?;
        let mut conn = self.conn.clone();

        let max = self.base.config().broker.max_queue_size;
        if max > 0 {
            let size: usize = tokio::select! {
                biased;
                _ = ctx.cancelled() => {
                    return Err(ChordqError::Cancelled { task_uuid: signature.uuid });
                }
                size = conn.llen::<_, usize>(self.queue_key(&signature.routing_key)) => size
                    .map_err(|e| ChordqError::transport("Failed to check queue size", e))?,
            };
            if size >= max {
                return Err(ChordqError::fatal_transport(format!(
                    "Queue is full (max size: {})",
                    max
                )));
            }
        }

        // A single command either lands or fails, so nothing is half-enqueued
        let enqueue = async {
            match signature.eta.filter(|eta| *eta > Utc::now()) {
                Some(eta) => {
                    conn.zadd::<_, _, _, ()>(self.delayed_key(), &payload, eta.timestamp_millis())
                        .await
                        .map_err(|e| ChordqError::transport("Failed to publish delayed task", e))?;
                    debug!("Published delayed task {} for {}", signature.uuid, eta);
                }
                None => {
                    conn.rpush::<_, _, ()>(self.queue_key(&signature.routing_key), &payload)
                        .await
                        .map_err(|e| ChordqError::transport("Failed to publish task", e))?;
                    debug!(
                        "Published task {} ({}) to {}",
                        signature.name, signature.uuid, signature.routing_key
                    );
                }
            }
            Ok::<(), ChordqError>(())
        };

        tokio::select! {
            biased;
            _ = ctx.cancelled() => Err(ChordqError::Cancelled {
                task_uuid: signature.uuid.clone(),
            }),
            published = enqueue => published,
        }
    }

    async fn get_pending_tasks(&self, queue: &str) -> ChordqResult<Vec<Signature>> {
        let mut conn = self.conn.clone();
        let payloads: Vec<String> = conn
            .lrange(self.queue_key(queue), 0, -1)
            .await
            .map_err(|e| ChordqError::transport("Failed to read pending tasks", e))?;
        Self::decode_all(payloads)
    }

    async fn get_delayed_tasks(&self) -> ChordqResult<Vec<Signature>> {
        let mut conn = self.conn.clone();
        let payloads: Vec<String> = conn
            .zrange(self.delayed_key(), 0, -1)
            .await
            .map_err(|e| ChordqError::transport("Failed to read delayed tasks", e))?;
        Self::decode_all(payloads)
    }

    fn adjust_routing_key(&self, signature: &mut Signature) {
        self.base.adjust_routing_key(signature);
    }
}

impl RedisBroker {
    async fn consume(
        &self,
        session: &ConsumerSession<'_>,
        consumer_tag: &str,
        concurrency: usize,
        processor: Arc<dyn TaskProcessor>,
    ) -> ChordqResult<()> {
        let concurrency = self.base.effective_concurrency(concurrency);
        let queue_keys: Vec<String> = self
            .base
            .consume_queues(processor.as_ref())
            .iter()
            .map(|queue| self.queue_key(queue))
            .collect();
        let poll_interval = self.base.config().broker.poll_interval();
        let block_secs = self.redis.blocking_timeout_secs.max(1) as f64;
        let max_dead_letters = self.base.config().broker.max_dead_letters;
        let stop = session.stop_token();

        // BLPOP blocks its connection, so it gets one of its own
        let mut blocking = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| ChordqError::transport("Failed to open consumer connection", e))?;

        let semaphore = Arc::new(Semaphore::new(concurrency));
        let mut in_flight = JoinSet::new();
        info!(
            "Consumer {} started on {:?} with concurrency {}",
            consumer_tag, queue_keys, concurrency
        );

        let outcome = loop {
            if session.is_stopped() {
                break Ok(());
            }
            while let Some(joined) = in_flight.try_join_next() {
                if let Err(e) = joined {
                    error!("Delivery task panicked: {}", e);
                }
            }

            if !processor.pre_consume_handler() {
                tokio::select! {
                    _ = stop.cancelled() => break Ok(()),
                    _ = tokio::time::sleep(poll_interval) => continue,
                }
            }

            let permit = tokio::select! {
                _ = stop.cancelled() => break Ok(()),
                permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(e) => break Err(ChordqError::transport("Consumer semaphore closed", e)),
                },
            };

            if let Err(e) = self.promote_delayed().await {
                break Err(e);
            }

            let popped: Option<(String, String)> = match blocking.blpop(&queue_keys, block_secs).await {
                Ok(popped) => popped,
                Err(e) => break Err(ChordqError::transport("Failed to pop from queue", e)),
            };
            let Some((queue_key, payload)) = popped else {
                continue;
            };

            let signature: Signature = match serde_json::from_str(&payload) {
                Ok(signature) => signature,
                Err(e) => {
                    error!("Dropping undecodable message from {}: {}", queue_key, e);
                    continue;
                }
            };

            if !self.base.is_task_registered(&signature.name).await {
                if signature.ignore_when_task_not_registered {
                    debug!("Dropping unregistered task {} ({})", signature.name, signature.uuid);
                } else {
                    warn!(
                        "Task {} ({}) is not registered, requeueing in {:?}",
                        signature.name, signature.uuid, poll_interval
                    );
                    // The message is requeued whether or not stop arrives meanwhile
                    tokio::select! {
                        _ = stop.cancelled() => {}
                        _ = tokio::time::sleep(poll_interval) => {}
                    }
                    let mut conn = self.conn.clone();
                    if let Err(e) = conn.rpush::<_, _, ()>(&queue_key, &payload).await {
                        break Err(ChordqError::transport("Failed to requeue unregistered task", e));
                    }
                }
                continue;
            }

            let processor = Arc::clone(&processor);
            let mut conn = self.conn.clone();
            let dead_letters_key = self.dead_letters_key();
            in_flight.spawn(async move {
                let _permit = permit;
                let task_uuid = signature.uuid.clone();
                let keep_on_error = signature.stop_task_deletion_on_error;

                if let Err(e) = processor.process(signature).await {
                    error!("Delivery of task {} failed: {}", task_uuid, e);
                    let parked = if keep_on_error {
                        conn.rpush::<_, _, ()>(&queue_key, &payload).await
                    } else {
                        park_dead_letter(&mut conn, &dead_letters_key, &payload, max_dead_letters).await
                    };
                    if let Err(e) = parked {
                        error!("Failed to park task {} after error: {}", task_uuid, e);
                    }
                }
            });
        };

        info!(
            "Consumer {} stopping, draining {} in-flight deliveries",
            consumer_tag,
            in_flight.len()
        );
        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined {
                error!("Delivery task panicked: {}", e);
            }
        }
        info!("Consumer {} stopped", consumer_tag);
        outcome
    }
}

/// Append to the dead letter list and keep only the newest `max` (0 = unlimited)
async fn park_dead_letter(
    conn: &mut ConnectionManager,
    key: &str,
    payload: &str,
    max: usize,
) -> redis::RedisResult<()> {
    if max == 0 {
        return conn.rpush::<_, _, ()>(key, payload).await;
    }
    let keep = isize::try_from(max).unwrap_or(isize::MAX);
    redis::pipe()
        .atomic()
        .rpush(key, payload)
        .ignore()
        .ltrim(key, -keep, -1)
        .ignore()
        .query_async(conn)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BrokerConfig;

    // These tests need a Redis server on localhost:6379

    async fn broker(prefix: &str) -> RedisBroker {
        let mut config = Config::testing();
        config.broker = BrokerConfig::redis("redis://localhost:6379");
        if let BrokerKind::Redis(redis) = &mut config.broker.kind {
            redis.key_prefix = prefix.to_string();
        }
        let broker = RedisBroker::new(Arc::new(config))
            .await
            .expect("Failed to create Redis broker");
        broker.purge(&["chordq_tasks"]).await.unwrap();
        broker
    }

    #[tokio::test]
    #[ignore]
    async fn test_redis_publish_and_inspect() {
        let broker = broker("chordq_test_publish").await;
        let ctx = CancellationToken::new();

        broker.publish(&ctx, Signature::new("add", vec![])).await.unwrap();
        let eta = Utc::now() + chrono::Duration::seconds(60);
        broker
            .publish(&ctx, Signature::new("later", vec![]).with_eta(eta))
            .await
            .unwrap();

        let pending = broker.get_pending_tasks("chordq_tasks").await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].name, "add");
        assert_eq!(broker.get_delayed_tasks().await.unwrap()[0].name, "later");

        broker.purge(&["chordq_tasks"]).await.unwrap();
    }

    #[tokio::test]
    #[ignore]
    async fn test_redis_delayed_tasks_are_promoted() {
        let broker = broker("chordq_test_delayed").await;
        let ctx = CancellationToken::new();
        let eta = Utc::now() + chrono::Duration::milliseconds(200);

        broker
            .publish(&ctx, Signature::new("later", vec![]).with_eta(eta))
            .await
            .unwrap();
        assert_eq!(broker.promote_delayed().await.unwrap(), 0);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(broker.promote_delayed().await.unwrap(), 1);
        assert_eq!(broker.get_pending_tasks("chordq_tasks").await.unwrap().len(), 1);

        broker.purge(&["chordq_tasks"]).await.unwrap();
    }

    #[tokio::test]
    #[ignore]
    async fn test_redis_cancelled_publish() {
        let broker = broker("chordq_test_cancel").await;
        let ctx = CancellationToken::new();
        ctx.cancel();

        let err = broker
            .publish(&ctx, Signature::new("add", vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, ChordqError::Cancelled { .. }));
        assert!(broker.get_pending_tasks("chordq_tasks").await.unwrap().is_empty());
    }

    struct Noop;

    #[async_trait]
    impl TaskProcessor for Noop {
        async fn process(&self, _signature: Signature) -> ChordqResult<()> {
            Ok(())
        }

        fn custom_queue(&self) -> Option<String> {
            None
        }

        fn pre_consume_handler(&self) -> bool {
            true
        }
    }

    #[tokio::test]
    #[ignore]
    async fn test_redis_unregistered_task_is_requeued_once() {
        let broker = Arc::new(broker("chordq_test_unregistered").await);
        let ctx = CancellationToken::new();
        broker.publish(&ctx, Signature::new("ghost", vec![])).await.unwrap();

        let consumer = {
            let broker = Arc::clone(&broker);
            tokio::spawn(async move { broker.start_consuming("test", 1, Arc::new(Noop)).await })
        };
        tokio::time::sleep(Duration::from_millis(150)).await;
        broker.stop_consumer("test");
        consumer.await.unwrap().unwrap();

        let pending = broker.get_pending_tasks("chordq_tasks").await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].name, "ghost");
        broker.purge(&["chordq_tasks"]).await.unwrap();
    }

    #[tokio::test]
    #[ignore]
    async fn test_redis_publish_stops_once_cancelled() {
        let broker = broker("chordq_test_cancel_midway").await;
        let ctx = CancellationToken::new();

        let mut published = 0;
        for i in 0..200 {
            if i == 50 {
                ctx.cancel();
            }
            match broker.publish(&ctx, Signature::new("add", vec![])).await {
                Ok(()) => published += 1,
                Err(e) => {
                    assert!(matches!(e, ChordqError::Cancelled { .. }));
                    assert!(i >= 50);
                }
            }
        }

        assert_eq!(published, 50);
        assert_eq!(broker.get_pending_tasks("chordq_tasks").await.unwrap().len(), 50);
        broker.purge(&["chordq_tasks"]).await.unwrap();
    }
}
