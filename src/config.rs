//! Configuration types for chordq.
//!
//! This module contains all configuration structures used throughout chordq:
//! broker settings, result backend settings, worker parameters, the retry
//! policy and logging.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main configuration for chordq.
///
/// A broker is constructed with one of these and hands it back, read-only,
/// from [`Broker::config`](crate::broker::Broker::config).
///
/// # Examples
///
/// ```rust
/// use chordq::config::{Config, RetryPolicy, WorkerConfig};
///
/// let config = Config {
///     worker: WorkerConfig {
///         concurrency: 8,
///         task_timeout_secs: Some(600),
///         ..Default::default()
///     },
///     retry: RetryPolicy::exponential(5),
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Broker configuration
    pub broker: BrokerConfig,

    /// Result backend configuration
    pub backend: BackendConfig,

    /// Worker configuration
    pub worker: WorkerConfig,

    /// Retry policy applied to failed tasks
    pub retry: RetryPolicy,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Broker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Queue used when a signature has no routing key
    pub default_queue: String,

    /// Maximum number of pending tasks per broker (0 = unlimited)
    pub max_queue_size: usize,

    /// Dead letters kept for inspection; the oldest are dropped first (0 = unlimited)
    pub max_dead_letters: usize,

    /// How long an idle consumer waits before polling again (in milliseconds)
    pub poll_interval_ms: u64,

    /// Timeout for a single broker operation (in seconds)
    pub operation_timeout_secs: u64,

    /// Transport-specific settings
    pub kind: BrokerKind,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            default_queue: "chordq_tasks".to_string(),
            max_queue_size: 0,
            max_dead_letters: 1000,
            poll_interval_ms: 200,
            operation_timeout_secs: 30,
            kind: BrokerKind::InMemory,
        }
    }
}

impl BrokerConfig {
    /// Configuration for a Redis broker.
    #[cfg(feature = "redis")]
    #[cfg_attr(docsrs, doc(cfg(feature = "redis")))]
    pub fn redis(connection_string: impl Into<String>) -> Self {
        Self {
            kind: BrokerKind::Redis(RedisConfig {
                connection_string: connection_string.into(),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Set the default queue.
    pub fn with_default_queue(mut self, queue: impl Into<String>) -> Self {
        self.default_queue = queue.into();
        self
    }

    /// Set the maximum queue size.
    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_queue_size = max_size;
        self
    }

    /// Set how many dead letters are kept.
    pub fn with_max_dead_letters(mut self, max_dead_letters: usize) -> Self {
        self.max_dead_letters = max_dead_letters;
        self
    }

    /// Poll interval as a duration
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Broker transport selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum BrokerKind {
    /// In-process broker (default)
    InMemory,

    /// Redis broker
    #[cfg(feature = "redis")]
    #[cfg_attr(docsrs, doc(cfg(feature = "redis")))]
    Redis(RedisConfig),
}

/// Redis broker configuration.
#[cfg(feature = "redis")]
#[cfg_attr(docsrs, doc(cfg(feature = "redis")))]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis connection string (e.g., "redis://localhost:6379")
    pub connection_string: String,

    /// Key prefix for Redis keys
    pub key_prefix: String,

    /// Seconds a blocking pop waits before the consumer re-checks for stop
    pub blocking_timeout_secs: u64,
}

#[cfg(feature = "redis")]
impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            connection_string: "redis://localhost:6379".to_string(),
            key_prefix: "chordq".to_string(),
            blocking_timeout_secs: 1,
        }
    }
}

/// Result backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// How long task states are kept after completion (in seconds, 0 = forever)
    pub result_expire_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            result_expire_secs: 3600,
        }
    }
}

/// Worker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Default number of deliveries processed concurrently
    pub concurrency: usize,

    /// Maximum time a task can run before it is failed (in seconds)
    pub task_timeout_secs: Option<u64>,

    /// Time to wait for in-flight tasks on shutdown (in seconds)
    pub shutdown_timeout_secs: Option<u64>,

    /// Reconnect attempts after retryable consumer errors before giving up (0 = forever)
    pub max_reconnect_attempts: u32,

    /// Base delay between reconnect attempts (in milliseconds)
    pub reconnect_base_delay_ms: u64,

    /// How many group members are published at once
    pub publish_concurrency: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: num_cpus::get().max(1),
            task_timeout_secs: Some(300),    // 5 minutes
            shutdown_timeout_secs: Some(30), // 30 seconds
            max_reconnect_attempts: 0,
            reconnect_base_delay_ms: 1000,
            publish_concurrency: 16,
        }
    }
}

impl WorkerConfig {
    /// Create a worker configuration with a specific concurrency.
    pub fn with_concurrency(concurrency: usize) -> Self {
        Self {
            concurrency,
            ..Default::default()
        }
    }

    /// Set the task timeout.
    pub fn with_task_timeout(mut self, timeout_secs: u64) -> Self {
        self.task_timeout_secs = Some(timeout_secs);
        self
    }

    /// Set the shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout_secs: u64) -> Self {
        self.shutdown_timeout_secs = Some(timeout_secs);
        self
    }

    /// Set the reconnect ceiling.
    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }
}

/// Retry policy for failed tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retries after the first attempt
    pub max_attempts: u32,

    /// Base delay between retries (in milliseconds)
    pub base_delay_ms: u64,

    /// Maximum delay between retries (in milliseconds)
    pub max_delay_ms: u64,

    /// Backoff strategy
    pub backoff_strategy: BackoffStrategy,

    /// Whether to enable jitter in delay calculations
    pub enable_jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000, // 1 second
            max_delay_ms: 60000, // 1 minute
            backoff_strategy: BackoffStrategy::Exponential { multiplier: 2.0 },
            enable_jitter: false,
        }
    }
}

impl RetryPolicy {
    /// Create a retry policy with exponential backoff.
    pub fn exponential(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            backoff_strategy: BackoffStrategy::Exponential { multiplier: 2.0 },
            ..Default::default()
        }
    }

    /// Create a retry policy with linear backoff.
    pub fn linear(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            backoff_strategy: BackoffStrategy::Linear { increment_ms: 1000 },
            ..Default::default()
        }
    }

    /// Create a retry policy with Fibonacci backoff.
    pub fn fibonacci(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            backoff_strategy: BackoffStrategy::Fibonacci,
            ..Default::default()
        }
    }

    /// Create a retry policy with fixed delays.
    pub fn fixed(max_attempts: u32, delay_ms: u64) -> Self {
        Self {
            max_attempts,
            base_delay_ms: delay_ms,
            max_delay_ms: delay_ms,
            backoff_strategy: BackoffStrategy::Fixed,
            enable_jitter: false,
        }
    }

    /// Disable retries completely.
    pub fn none() -> Self {
        Self {
            max_attempts: 0,
            ..Default::default()
        }
    }

    /// Whether a task that has already been retried `retry_count` times may run again
    pub fn allows_retry(&self, retry_count: u32) -> bool {
        retry_count < self.max_attempts
    }

    /// Delay before retry number `attempt` (1-indexed).
    ///
    /// A non-zero `retry_timeout_secs` from the signature replaces the base
    /// delay. The result is capped at `max_delay_ms`, or at the base delay
    /// when that is larger. With jitter enabled, `jitter_seed` picks the
    /// offset; callers pass something unique to the task so a burst of
    /// failures does not retry at the same instant.
    pub fn next_delay(&self, attempt: u32, retry_timeout_secs: u32, jitter_seed: u64) -> Duration {
        let base_ms = if retry_timeout_secs > 0 {
            u64::from(retry_timeout_secs) * 1000
        } else {
            self.base_delay_ms
        };
        let step = attempt.saturating_sub(1);

        let delay_ms = match &self.backoff_strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Linear { increment_ms } => {
                base_ms.saturating_add(increment_ms.saturating_mul(u64::from(step)))
            }
            BackoffStrategy::Exponential { multiplier } => {
                let scaled = base_ms as f64 * multiplier.powi(step.min(64) as i32);
                if scaled.is_finite() && scaled < u64::MAX as f64 {
                    scaled as u64
                } else {
                    u64::MAX
                }
            }
            BackoffStrategy::Fibonacci => base_ms.saturating_mul(fibonacci(attempt.max(1))),
        };

        let cap = self.max_delay_ms.max(base_ms);
        let mut delay_ms = delay_ms.min(cap);
        if self.enable_jitter {
            delay_ms = crate::utils::apply_jitter(delay_ms, jitter_seed ^ u64::from(attempt));
        }
        Duration::from_millis(delay_ms)
    }
}

fn fibonacci(n: u32) -> u64 {
    let (mut a, mut b) = (1u64, 1u64);
    for _ in 1..n {
        let next = a.saturating_add(b);
        a = b;
        b = next;
    }
    a
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,

    /// Linear backoff (base + attempt * increment)
    Linear {
        /// Increment per attempt (in milliseconds)
        increment_ms: u64,
    },

    /// Exponential backoff (base * multiplier^attempt)
    Exponential {
        /// Multiplier for exponential growth
        multiplier: f64,
    },

    /// Fibonacci backoff (base * fib(attempt))
    Fibonacci,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter
    pub level: LogLevel,

    /// Enable structured JSON logging
    pub json_format: bool,

    /// Enable colored output (ignored if json_format is true)
    pub colored: bool,

    /// Include timestamps in logs
    pub include_timestamps: bool,

    /// Include target module in logs
    pub include_targets: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            json_format: false,
            colored: true,
            include_timestamps: true,
            include_targets: false,
        }
    }
}

/// Log level enumeration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum LogLevel {
    /// Trace level
    Trace,
    /// Debug level
    Debug,
    /// Info level
    Info,
    /// Warn level
    Warn,
    /// Error level
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => tracing::Level::TRACE,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

impl Config {
    /// Create a new configuration optimized for development.
    pub fn development() -> Self {
        Self {
            broker: BrokerConfig {
                max_queue_size: 1000,
                poll_interval_ms: 100,
                ..Default::default()
            },
            worker: WorkerConfig {
                concurrency: 2,
                task_timeout_secs: Some(60),
                ..Default::default()
            },
            retry: RetryPolicy::fixed(3, 1000),
            logging: LoggingConfig {
                level: LogLevel::Debug,
                colored: true,
                include_targets: true,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Create a new configuration optimized for production.
    pub fn production() -> Self {
        Self {
            broker: BrokerConfig {
                poll_interval_ms: 500,
                ..Default::default()
            },
            backend: BackendConfig {
                result_expire_secs: 86400, // 24 hours
            },
            worker: WorkerConfig {
                concurrency: num_cpus::get() * 2,
                task_timeout_secs: Some(300),
                shutdown_timeout_secs: Some(60),
                ..Default::default()
            },
            retry: RetryPolicy {
                enable_jitter: true,
                ..RetryPolicy::exponential(5)
            },
            logging: LoggingConfig {
                level: LogLevel::Info,
                json_format: true,
                colored: false,
                ..Default::default()
            },
        }
    }

    /// Create a configuration for testing.
    pub fn testing() -> Self {
        Self {
            broker: BrokerConfig {
                max_queue_size: 1000,
                poll_interval_ms: 10,
                operation_timeout_secs: 5,
                ..Default::default()
            },
            backend: BackendConfig {
                result_expire_secs: 0,
            },
            worker: WorkerConfig {
                concurrency: 4,
                task_timeout_secs: Some(5),
                shutdown_timeout_secs: Some(5),
                max_reconnect_attempts: 3,
                reconnect_base_delay_ms: 10,
                publish_concurrency: 4,
            },
            retry: RetryPolicy::fixed(2, 10),
            logging: LoggingConfig {
                level: LogLevel::Debug,
                colored: false,
                include_timestamps: false,
                include_targets: true,
                ..Default::default()
            },
        }
    }

    /// Validate the configuration and return any errors.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.broker.default_queue.trim().is_empty() {
            errors.push("Default queue must not be empty".to_string());
        }

        if self.broker.poll_interval_ms == 0 {
            errors.push("Poll interval must be greater than 0".to_string());
        }

        if self.worker.concurrency == 0 {
            errors.push("Worker concurrency must be greater than 0".to_string());
        }

        if self.worker.concurrency > 10_000 {
            errors.push("Worker concurrency should not exceed 10000".to_string());
        }

        if self.worker.publish_concurrency == 0 {
            errors.push("Publish concurrency must be greater than 0".to_string());
        }

        if self.retry.base_delay_ms == 0 {
            errors.push("Retry base delay must be greater than 0".to_string());
        }

        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            errors.push("Retry max delay must be greater than or equal to base delay".to_string());
        }

        if let BackoffStrategy::Exponential { multiplier } = self.retry.backoff_strategy {
            if multiplier < 1.0 {
                errors.push("Exponential backoff multiplier must be at least 1.0".to_string());
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
