//! Task registry: maps task names to executable handlers.
//!
//! Each worker process owns a [`TaskRegistry`]. Handlers are registered
//! under the name producers put into [`Signature::name`](crate::tasks::Signature),
//! and the worker looks them up for every delivery.
//!
//! # Examples
//!
//! ```rust
//! use chordq::prelude::*;
//!
//! # async fn example() {
//! let registry = TaskRegistry::new();
//! registry
//!     .register(
//!         "add",
//!         task_fn(|args: Vec<Arg>| async move {
//!             let mut sum = 0i64;
//!             for arg in &args {
//!                 sum += arg.decode::<i64>()?;
//!             }
//!             Ok::<_, TaskError>(vec![TaskResult::new("int64", sum)])
//!         }),
//!     )
//!     .await;
//!
//! let results = registry
//!     .execute("add", vec![Arg::new("int64", 2), Arg::new("int64", 3)], None)
//!     .await
//!     .unwrap();
//! assert_eq!(results, vec![TaskResult::new("int64", 5)]);
//! # }
//! ```

use crate::error::TaskError;
use crate::tasks::{Arg, TaskResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// A task body callable with a typed argument list.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Run the task
    async fn call(&self, args: Vec<Arg>) -> Result<Vec<TaskResult>, TaskError>;
}

/// [`TaskHandler`] backed by an async closure. Built by [`task_fn`].
pub struct FnTask<F> {
    f: F,
}

impl<F> std::fmt::Debug for FnTask<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnTask").finish_non_exhaustive()
    }
}

/// Wrap an async closure as a [`TaskHandler`].
pub fn task_fn<F, Fut>(f: F) -> FnTask<F>
where
    F: Fn(Vec<Arg>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<TaskResult>, TaskError>> + Send + 'static,
{
    FnTask { f }
}

#[async_trait]
impl<F, Fut> TaskHandler for FnTask<F>
where
    F: Fn(Vec<Arg>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<TaskResult>, TaskError>> + Send + 'static,
{
    async fn call(&self, args: Vec<Arg>) -> Result<Vec<TaskResult>, TaskError> {
        (self.f)(args).await
    }
}

/// Statistics for a registered task name.
#[derive(Debug, Clone, Default)]
pub struct TaskTypeStats {
    /// Total number of executions
    pub total_executed: u64,
    /// Number of successful executions
    pub successful: u64,
    /// Number of failed executions, panics included
    pub failed: u64,
    /// Number of timed out executions
    pub timed_out: u64,
    /// Average execution time
    pub avg_duration: Option<Duration>,
    /// Last execution time
    pub last_executed: Option<DateTime<Utc>>,
}

/// Summary of the registry state.
#[derive(Debug, Clone)]
pub struct RegistrySummary {
    /// Sorted registered task names
    pub registered_names: Vec<String>,
    /// Total number of executions
    pub total_executed: u64,
    /// Total number of successful executions
    pub total_successful: u64,
    /// Total number of failed or timed out executions
    pub total_failed: u64,
}

/// Per-instance mapping from task name to handler.
#[derive(Default)]
pub struct TaskRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn TaskHandler>>>,
    stats: RwLock<HashMap<String, TaskTypeStats>>,
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRegistry").finish_non_exhaustive()
    }
}

impl TaskRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `name`, replacing any previous handler.
    pub async fn register(&self, name: impl Into<String>, handler: impl TaskHandler + 'static) {
        self.register_arc(name, Arc::new(handler)).await;
    }

    /// Register an already shared handler
    pub async fn register_arc(&self, name: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        let name = name.into();
        tracing::info!("Registering task: {}", name);

        let replaced = self.handlers.write().await.insert(name.clone(), handler);
        if replaced.is_some() {
            tracing::warn!("Task {} was already registered, handler replaced", name);
        }
        self.stats.write().await.entry(name).or_default();
    }

    /// Whether `name` has a handler
    pub async fn is_registered(&self, name: &str) -> bool {
        self.handlers.read().await.contains_key(name)
    }

    /// Registered task names, sorted
    pub async fn registered_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of registered tasks
    pub async fn len(&self) -> usize {
        self.handlers.read().await.len()
    }

    /// Whether nothing is registered
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Run the handler registered for `name`.
    ///
    /// The body runs on its own tokio task so a panic is contained and
    /// reported as [`TaskError::Panicked`]. With a `timeout` the body is
    /// aborted once it elapses and [`TaskError::Timeout`] is returned.
    pub async fn execute(
        &self,
        name: &str,
        args: Vec<Arg>,
        timeout: Option<Duration>,
    ) -> Result<Vec<TaskResult>, TaskError> {
        let handler = self
            .handlers
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| TaskError::failed(format!("Task '{}' is not registered", name)))?;

        let start = Instant::now();
        let mut running = tokio::spawn(async move { handler.call(args).await });

        let joined = match timeout {
            Some(limit) => match tokio::time::timeout(limit, &mut running).await {
                Ok(joined) => joined,
                Err(_) => {
                    running.abort();
                    Ok(Err(TaskError::Timeout(limit)))
                }
            },
            None => running.await,
        };

        let result = match joined {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(TaskError::Panicked(panic_message(e.into_panic()))),
            Err(e) => Err(TaskError::failed(format!("Task was cancelled: {}", e))),
        };

        let duration = start.elapsed();
        self.update_stats(name, &result, duration).await;
        result
    }

    /// Statistics for one task name
    pub async fn get_stats(&self, name: &str) -> Option<TaskTypeStats> {
        self.stats.read().await.get(name).cloned()
    }

    /// Statistics for every task name
    pub async fn get_all_stats(&self) -> HashMap<String, TaskTypeStats> {
        self.stats.read().await.clone()
    }

    /// Reset statistics for all task names.
    pub async fn reset_stats(&self) {
        let mut stats = self.stats.write().await;
        for task_stats in stats.values_mut() {
            *task_stats = TaskTypeStats::default();
        }
        tracing::info!("Task registry statistics reset");
    }

    /// Get a summary of the registry state.
    pub async fn summary(&self) -> RegistrySummary {
        let registered_names = self.registered_names().await;
        let all_stats = self.get_all_stats().await;

        RegistrySummary {
            registered_names,
            total_executed: all_stats.values().map(|s| s.total_executed).sum(),
            total_successful: all_stats.values().map(|s| s.successful).sum(),
            total_failed: all_stats.values().map(|s| s.failed + s.timed_out).sum(),
        }
    }

    async fn update_stats(
        &self,
        name: &str,
        result: &Result<Vec<TaskResult>, TaskError>,
        duration: Duration,
    ) {
        let mut stats = self.stats.write().await;
        let task_stats = stats.entry(name.to_string()).or_default();

        task_stats.total_executed += 1;
        task_stats.last_executed = Some(Utc::now());

        match result {
            Ok(_) => task_stats.successful += 1,
            Err(TaskError::Timeout(_)) => task_stats.timed_out += 1,
            Err(_) => task_stats.failed += 1,
        }

        // Exponential moving average
        task_stats.avg_duration = Some(match task_stats.avg_duration {
            Some(avg) => {
                let alpha = 0.1;
                let nanos = alpha * duration.as_nanos() as f64 + (1.0 - alpha) * avg.as_nanos() as f64;
                Duration::from_nanos(nanos as u64)
            }
            None => duration,
        });
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "task panicked".to_string()
    }
}
