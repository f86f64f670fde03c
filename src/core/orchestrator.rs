//! Continuation rules applied after a task finishes.
//!
//! The free functions compute what has to be published: they only copy and
//! never touch the signature that was delivered. [`Orchestrator`] records
//! the outcome in the result backend and publishes what the rules produce.

use crate::backend::ResultBackend;
use crate::broker::Broker;
use crate::config::RetryPolicy;
use crate::error::{ChordqError, ChordqResult, TaskError};
use crate::tasks::{Arg, Signature, TaskResult, TaskState, copy_signature};
use crate::utils::hash_seed;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Copies of `signature.on_success`, in order, ready to publish.
///
/// `results` are appended to each continuation's args unless the finished
/// task or the continuation is immutable.
pub fn success_continuations(signature: &Signature, results: &[TaskResult]) -> Vec<Signature> {
    signature
        .on_success
        .iter()
        .map(|next| {
            let mut next = copy_signature(next);
            if !signature.immutable && !next.immutable {
                next.args.extend(results.iter().map(Arg::from));
            }
            next
        })
        .collect()
}

/// Copies of `signature.on_error`, in order, each receiving the error text as first argument.
pub fn error_continuations(signature: &Signature, error: &str) -> Vec<Signature> {
    signature
        .on_error
        .iter()
        .map(|handler| {
            let mut handler = copy_signature(handler);
            handler.args.insert(0, Arg::new("string", error));
            handler
        })
        .collect()
}

/// The next attempt of `signature`, or `None` once the retry ceiling is reached.
pub fn retry_signature(signature: &Signature, policy: &RetryPolicy) -> Option<Signature> {
    if !policy.allows_retry(signature.retry_count) {
        return None;
    }
    let attempt = signature.retry_count + 1;
    let delay = policy.next_delay(attempt, signature.retry_timeout, hash_seed(&signature.uuid));
    Some(delayed_attempt(signature, delay))
}

/// The next attempt of `signature` after `delay`, regardless of the retry ceiling.
pub fn retry_later_signature(signature: &Signature, delay: Duration) -> Signature {
    delayed_attempt(signature, delay)
}

fn delayed_attempt(signature: &Signature, delay: Duration) -> Signature {
    let mut next = copy_signature(signature);
    next.retry_count = signature.retry_count.saturating_add(1);
    next.eta = Some(eta_after(delay));
    next
}

fn eta_after(delay: Duration) -> DateTime<Utc> {
    let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
    Utc::now()
        .checked_add_signed(delay)
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Copy of the chord callback carrying the group results in member order.
pub fn chord_callback_signature(callback: &Signature, member_states: &[TaskState]) -> Signature {
    let mut callback = copy_signature(callback);
    if !callback.immutable {
        callback.args.extend(
            member_states
                .iter()
                .flat_map(|state| state.results.iter().map(Arg::from)),
        );
    }
    callback
}

/// `None` when the group's metadata is gone
fn finished_group<T>(result: ChordqResult<T>) -> ChordqResult<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(ChordqError::GroupNotFound { .. }) => Ok(None),
        Err(e) => Err(e),
    }
}

/// What happened to a failed task.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureOutcome {
    /// A copy was published for another attempt
    Retried {
        /// `retry_count` of the published copy
        attempt: u32,
        /// When the copy becomes deliverable
        eta: Option<DateTime<Utc>>,
    },
    /// The task failed for good; error continuations were published
    Failed,
}

/// Records task outcomes and publishes their continuations.
#[derive(Clone)]
pub struct Orchestrator {
    broker: Arc<dyn Broker>,
    backend: Arc<dyn ResultBackend>,
    retry: RetryPolicy,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Build an orchestrator over `broker` and `backend`.
    pub fn new(broker: Arc<dyn Broker>, backend: Arc<dyn ResultBackend>, retry: RetryPolicy) -> Self {
        Self {
            broker,
            backend,
            retry,
        }
    }

    /// Result backend outcomes are recorded in
    pub fn backend(&self) -> &Arc<dyn ResultBackend> {
        &self.backend
    }

    /// Retry policy in use
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Record success, publish the chain and take part in chord fan-in.
    pub async fn on_success(
        &self,
        ctx: &CancellationToken,
        signature: &Signature,
        results: Vec<TaskResult>,
    ) -> ChordqResult<()> {
        let continuations = success_continuations(signature, &results);
        self.backend.set_state_success(signature, results).await?;

        for next in continuations {
            tracing::debug!(
                "Task {} succeeded, publishing continuation {} ({})",
                signature.uuid,
                next.name,
                next.uuid
            );
            self.broker.publish(ctx, next).await?;
        }

        if signature.in_group() {
            self.complete_group_member(ctx, signature).await?;
        }
        Ok(())
    }

    /// Publish the chord callback if `signature` completed its group and nobody else did.
    ///
    /// Group metadata is dropped once the group has nothing left to do, so a
    /// late duplicate finding no metadata is treated as already finished.
    async fn complete_group_member(
        &self,
        ctx: &CancellationToken,
        signature: &Signature,
    ) -> ChordqResult<()> {
        let group = &signature.group_uuid;
        let count = signature.group_task_count;

        let Some(completed) = finished_group(self.backend.group_completed(group, count).await)? else {
            tracing::debug!("Group {} already finished", group);
            return Ok(());
        };
        if !completed {
            tracing::debug!("Group {} not completed yet", group);
            return Ok(());
        }

        let Some(callback) = signature.chord_callback.as_deref() else {
            tracing::debug!("Group {} completed", group);
            return self.backend.purge_group_meta(group).await;
        };

        match finished_group(self.backend.trigger_chord(group).await)? {
            Some(true) => {}
            _ => {
                tracing::debug!("Chord for group {} already triggered", group);
                return Ok(());
            }
        }

        if let Err(e) = self.publish_chord_callback(ctx, signature, callback).await {
            tracing::warn!(
                "Chord callback for group {} was not published, releasing claim: {}",
                group,
                e
            );
            self.backend.release_chord(group).await?;
            return Err(e);
        }
        self.backend.purge_group_meta(group).await
    }

    async fn publish_chord_callback(
        &self,
        ctx: &CancellationToken,
        signature: &Signature,
        callback: &Signature,
    ) -> ChordqResult<()> {
        let group = &signature.group_uuid;
        let states = self
            .backend
            .group_task_states(group, signature.group_task_count)
            .await?;
        let callback = chord_callback_signature(callback, &states);
        tracing::info!(
            "Group {} completed, publishing chord callback {} ({})",
            group,
            callback.name,
            callback.uuid
        );
        self.broker.publish(ctx, callback).await
    }

    /// Retry `signature` or, once retries are exhausted, record failure and publish the error chain.
    pub async fn on_failure(
        &self,
        ctx: &CancellationToken,
        signature: &Signature,
        error: &TaskError,
    ) -> ChordqResult<FailureOutcome> {
        let next = match error {
            TaskError::RetryLater { delay, .. } => Some(retry_later_signature(signature, *delay)),
            TaskError::InvalidArgs(_) => None,
            _ => retry_signature(signature, &self.retry),
        };

        if let Some(next) = next {
            let outcome = FailureOutcome::Retried {
                attempt: next.retry_count,
                eta: next.eta,
            };
            tracing::warn!(
                "Task {} failed (attempt {}/{}), retrying at {:?}: {}",
                signature.uuid,
                next.retry_count,
                self.retry.max_attempts,
                next.eta,
                error
            );
            self.backend.set_state_retry(signature).await?;
            self.broker.publish(ctx, next).await?;
            return Ok(outcome);
        }

        let message = error.to_string();
        tracing::error!(
            "Task {} permanently failed after {} retries: {}",
            signature.uuid,
            signature.retry_count,
            message
        );
        self.backend.set_state_failure(signature, &message).await?;
        for handler in error_continuations(signature, &message) {
            self.broker.publish(ctx, handler).await?;
        }
        Ok(FailureOutcome::Failed)
    }
}
