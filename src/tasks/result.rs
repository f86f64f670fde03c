//! Task results and the state a task moves through.

use super::signature::{Arg, Signature};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A typed value returned by a task body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    /// Type tag, same vocabulary as [`Arg::arg_type`]
    #[serde(rename = "type")]
    pub result_type: String,
    /// The value itself
    pub value: Value,
}

impl TaskResult {
    /// Create a result
    pub fn new(result_type: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            result_type: result_type.into(),
            value: value.into(),
        }
    }
}

impl From<&TaskResult> for Arg {
    fn from(result: &TaskResult) -> Self {
        Arg::new(result.result_type.clone(), result.value.clone())
    }
}

/// Lifecycle of a task
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TaskStatus {
    /// Sent by a producer, not yet delivered
    Pending,
    /// Delivered to a worker
    Received,
    /// Task body is running
    Started,
    /// Failed and republished for another attempt
    Retry,
    /// Completed successfully
    Success,
    /// Failed permanently
    Failure,
}

impl TaskStatus {
    /// Whether the task will not move again
    pub fn is_completed(self) -> bool {
        matches!(self, TaskStatus::Success | TaskStatus::Failure)
    }
}

/// Stored state of one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskState {
    pub task_uuid: String,
    pub task_name: String,
    pub status: TaskStatus,
    pub results: Vec<TaskResult>,
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl TaskState {
    /// Create a state for `signature` with no results
    pub fn new(signature: &Signature, status: TaskStatus) -> Self {
        Self {
            task_uuid: signature.uuid.clone(),
            task_name: signature.name.clone(),
            status,
            results: Vec::new(),
            error: None,
            updated_at: Utc::now(),
        }
    }

    /// Successful state carrying results
    pub fn success(signature: &Signature, results: Vec<TaskResult>) -> Self {
        Self {
            results,
            ..Self::new(signature, TaskStatus::Success)
        }
    }

    /// Failed state carrying the error text
    pub fn failure(signature: &Signature, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::new(signature, TaskStatus::Failure)
        }
    }

    /// Whether the task will not move again
    pub fn is_completed(&self) -> bool {
        self.status.is_completed()
    }

    /// Whether the task succeeded
    pub fn is_success(&self) -> bool {
        self.status == TaskStatus::Success
    }
}
