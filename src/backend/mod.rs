//! Result backends: task state storage and group completion tracking.
//!
//! A result backend is the durable side of fan-in. It records every task's
//! state, remembers which tasks make up a group and owns the test-and-set
//! flag that lets exactly one worker publish a chord callback.

use crate::error::{ChordqError, ChordqResult};
use crate::tasks::{Signature, TaskResult, TaskState, TaskStatus};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

pub mod memory;
pub use memory::InMemoryBackend;

#[cfg(feature = "redis")]
#[cfg_attr(docsrs, doc(cfg(feature = "redis")))]
pub mod redis;

#[cfg(feature = "redis")]
#[cfg_attr(docsrs, doc(cfg(feature = "redis")))]
pub use self::redis::RedisBackend;

/// Storage for task states and group metadata.
///
/// Implementations must never let a non-terminal update overwrite a
/// `Success` state: redelivered duplicates would otherwise un-complete a
/// group member.
#[async_trait]
pub trait ResultBackend: Send + Sync {
    /// Record the member list of a group before its tasks are published
    async fn init_group(&self, group_uuid: &str, task_uuids: &[String]) -> ChordqResult<()>;

    /// Whether every member of the group has succeeded.
    ///
    /// Fails with [`ChordqError::GroupMismatch`] when `group_task_count`
    /// disagrees with the recorded member list.
    async fn group_completed(&self, group_uuid: &str, group_task_count: usize) -> ChordqResult<bool>;

    /// States of every group member, in the order they were recorded
    async fn group_task_states(
        &self,
        group_uuid: &str,
        group_task_count: usize,
    ) -> ChordqResult<Vec<TaskState>>;

    /// Atomically mark the group's chord as triggered.
    ///
    /// Returns `true` for exactly one caller per group.
    async fn trigger_chord(&self, group_uuid: &str) -> ChordqResult<bool>;

    /// Give back a [`trigger_chord`](Self::trigger_chord) claim whose
    /// callback could not be published, so a redelivered member can claim it again.
    async fn release_chord(&self, group_uuid: &str) -> ChordqResult<()>;

    /// Store a state
    async fn set_state(&self, state: TaskState) -> ChordqResult<()>;

    /// Fetch the state of a task
    async fn get_state(&self, task_uuid: &str) -> ChordqResult<Option<TaskState>>;

    /// Forget a task state
    async fn purge_state(&self, task_uuid: &str) -> ChordqResult<()>;

    /// Forget group metadata, including the chord claim
    async fn purge_group_meta(&self, group_uuid: &str) -> ChordqResult<()>;

    /// Mark a task as sent
    async fn set_state_pending(&self, signature: &Signature) -> ChordqResult<()> {
        self.set_state(TaskState::new(signature, TaskStatus::Pending)).await
    }

    /// Mark a task as delivered
    async fn set_state_received(&self, signature: &Signature) -> ChordqResult<()> {
        self.set_state(TaskState::new(signature, TaskStatus::Received)).await
    }

    /// Mark a task as running
    async fn set_state_started(&self, signature: &Signature) -> ChordqResult<()> {
        self.set_state(TaskState::new(signature, TaskStatus::Started)).await
    }

    /// Mark a task as waiting for another attempt
    async fn set_state_retry(&self, signature: &Signature) -> ChordqResult<()> {
        self.set_state(TaskState::new(signature, TaskStatus::Retry)).await
    }

    /// Mark a task as succeeded
    async fn set_state_success(
        &self,
        signature: &Signature,
        results: Vec<TaskResult>,
    ) -> ChordqResult<()> {
        self.set_state(TaskState::success(signature, results)).await
    }

    /// Mark a task as failed
    async fn set_state_failure(&self, signature: &Signature, error: &str) -> ChordqResult<()> {
        self.set_state(TaskState::failure(signature, error)).await
    }
}

/// Handle for waiting on the outcome of a sent task.
#[derive(Clone)]
pub struct AsyncResult {
    task_uuid: String,
    backend: Arc<dyn ResultBackend>,
}

impl std::fmt::Debug for AsyncResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncResult")
            .field("task_uuid", &self.task_uuid)
            .finish_non_exhaustive()
    }
}

impl AsyncResult {
    /// Track `task_uuid` in `backend`
    pub fn new(task_uuid: impl Into<String>, backend: Arc<dyn ResultBackend>) -> Self {
        Self {
            task_uuid: task_uuid.into(),
            backend,
        }
    }

    /// The tracked task
    pub fn task_uuid(&self) -> &str {
        &self.task_uuid
    }

    /// Current state, if any was recorded
    pub async fn state(&self) -> ChordqResult<Option<TaskState>> {
        self.backend.get_state(&self.task_uuid).await
    }

    /// Poll every `poll` until the task completes; returns its results.
    pub async fn get(&self, poll: Duration) -> ChordqResult<Vec<TaskResult>> {
        loop {
            if let Some(state) = self.state().await? {
                match state.status {
                    TaskStatus::Success => return Ok(state.results),
                    TaskStatus::Failure => {
                        return Err(ChordqError::TaskFailed {
                            task_uuid: state.task_uuid,
                            message: state.error.unwrap_or_default(),
                        });
                    }
                    _ => {}
                }
            }
            tokio::time::sleep(poll).await;
        }
    }

    /// Like [`get`](Self::get) but gives up after `timeout`.
    pub async fn get_with_timeout(
        &self,
        timeout: Duration,
        poll: Duration,
    ) -> ChordqResult<Vec<TaskResult>> {
        tokio::time::timeout(timeout, self.get(poll))
            .await
            .map_err(|_| ChordqError::Timeout { timeout })?
    }
}
