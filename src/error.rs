//! Error types for chordq operations.
//!
//! Two families live here. [`ChordqError`] covers the engine itself: broker
//! transport failures, serialization, configuration and workflow contract
//! violations. [`TaskError`] is what a task body returns; the worker turns it
//! into retry or error-chain actions and never hands it back to a broker.

use std::time::Duration;
use thiserror::Error;

/// Result type used throughout chordq.
pub type ChordqResult<T> = Result<T, ChordqError>;

/// Main error type for chordq operations.
#[derive(Error, Debug)]
pub enum ChordqError {
    /// Broker transport error (connection loss, publish failure)
    #[error("Transport error: {message}")]
    Transport {
        /// Error message
        message: String,
        /// Whether the consumer should reconnect and start consuming again
        retryable: bool,
        /// Optional underlying error
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// No handler is registered for the task name
    #[error("Task '{name}' is not registered")]
    TaskNotRegistered {
        /// The task name that wasn't found
        name: String,
    },

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Workflow could not be built from the given signatures
    #[error("Invalid workflow: {message}")]
    InvalidWorkflow {
        /// Error message
        message: String,
    },

    /// Group metadata does not agree with the signature's declared cardinality
    #[error("Group {group_uuid} has {recorded} recorded tasks but signature declares {declared}")]
    GroupMismatch {
        /// Group identifier
        group_uuid: String,
        /// Number of members recorded when the group was sent
        recorded: usize,
        /// `group_task_count` carried by the signature
        declared: usize,
    },

    /// Group metadata was never recorded
    #[error("Group {group_uuid} not found")]
    GroupNotFound {
        /// Group identifier
        group_uuid: String,
    },

    /// Publish was cancelled before the message was enqueued
    #[error("Publish of task {task_uuid} cancelled")]
    Cancelled {
        /// Uuid of the signature that was not published
        task_uuid: String,
    },

    /// Operation timed out
    #[error("Operation timed out after {timeout:?}")]
    Timeout {
        /// Timeout duration
        timeout: Duration,
    },

    /// Task finished in the failure state
    #[error("Task {task_uuid} failed: {message}")]
    TaskFailed {
        /// Uuid of the failed task
        task_uuid: String,
        /// Error text recorded by the worker
        message: String,
    },

    /// Configuration error
    #[error("Configuration error: {message}")]
    ConfigError {
        /// Error message
        message: String,
    },

    /// A consumer with the same tag is already consuming
    #[error("Worker is already running")]
    AlreadyRunning,

    /// Redis error
    #[cfg(feature = "redis")]
    #[cfg_attr(docsrs, doc(cfg(feature = "redis")))]
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

impl ChordqError {
    /// Create a transport error that the consumer may recover from by reconnecting
    pub fn transport<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Transport {
            message: message.into(),
            retryable: true,
            source: Some(Box::new(source)),
        }
    }

    /// Create a transport error that must not be retried
    pub fn fatal_transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
            source: None,
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::ConfigError {
            message: message.into(),
        }
    }

    /// Create an invalid workflow error
    pub fn workflow(message: impl Into<String>) -> Self {
        Self::InvalidWorkflow {
            message: message.into(),
        }
    }

    /// Whether a consumer that stopped with this error should reconnect.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { retryable, .. } => *retryable,
            #[cfg(feature = "redis")]
            Self::Redis(e) => e.is_connection_dropped() || e.is_io_error() || e.is_timeout(),
            _ => false,
        }
    }
}

/// Error returned by a task body.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TaskError {
    /// The task failed; subject to the retry policy
    #[error("{0}")]
    Failed(String),

    /// The task asks to be run again after `delay`, independent of the retry ceiling
    #[error("retry requested in {delay:?}: {message}")]
    RetryLater {
        /// Error message
        message: String,
        /// Delay before the next attempt
        delay: Duration,
    },

    /// Arguments did not match what the task expects
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),

    /// The task exceeded the worker's task timeout
    #[error("task timed out after {0:?}")]
    Timeout(Duration),

    /// The task body panicked
    #[error("task panicked: {0}")]
    Panicked(String),
}

impl TaskError {
    /// Create a plain failure
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    /// Ask for a retry after `delay`
    pub fn retry_later(message: impl Into<String>, delay: Duration) -> Self {
        Self::RetryLater {
            message: message.into(),
            delay,
        }
    }
}

impl From<serde_json::Error> for TaskError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidArgs(err.to_string())
    }
}
