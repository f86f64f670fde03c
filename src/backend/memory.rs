//! In-memory result backend.
//!
//! Keeps task states and group metadata in process memory. Useful for tests
//! and for single-process deployments where the broker is in-memory too.

use super::ResultBackend;
use crate::config::BackendConfig;
use crate::error::{ChordqError, ChordqResult};
use crate::tasks::{TaskState, TaskStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::sync::RwLock;

/// Longest gap between two sweeps of expired states
const MAX_PURGE_INTERVAL_SECS: i64 = 60;

/// Recorded membership of a group
#[derive(Debug, Clone)]
struct GroupMeta {
    task_uuids: Vec<String>,
    chord_triggered: bool,
    created_at: DateTime<Utc>,
}

/// In-memory result backend implementation
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    /// Task states indexed by task uuid
    states: Arc<RwLock<HashMap<String, TaskState>>>,
    /// Group metadata indexed by group uuid
    groups: Arc<RwLock<HashMap<String, GroupMeta>>>,
    /// Completed states older than this are treated as gone
    result_expire: Option<chrono::Duration>,
    /// Unix milliseconds after which the next write sweeps expired states
    next_purge_ms: AtomicI64,
}

impl InMemoryBackend {
    /// Create an empty backend that keeps states forever
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty backend honouring `result_expire_secs`
    pub fn with_config(config: &BackendConfig) -> Self {
        let result_expire = i64::try_from(config.result_expire_secs)
            .ok()
            .filter(|secs| *secs > 0)
            .and_then(chrono::Duration::try_seconds);
        let first_purge_ms = result_expire.map_or(0, |expire| {
            Utc::now().timestamp_millis()
                + expire.num_milliseconds().min(MAX_PURGE_INTERVAL_SECS * 1000)
        });
        Self {
            result_expire,
            next_purge_ms: AtomicI64::new(first_purge_ms),
            ..Self::default()
        }
    }

    fn is_expired(&self, state: &TaskState, now: DateTime<Utc>) -> bool {
        match self.result_expire {
            Some(expire) => state.is_completed() && state.updated_at + expire <= now,
            None => false,
        }
    }

    /// Drop completed states past their expiry; returns how many were removed
    pub async fn purge_expired(&self) -> usize {
        let mut states = self.states.write().await;
        self.sweep(&mut states, Utc::now())
    }

    fn sweep(&self, states: &mut HashMap<String, TaskState>, now: DateTime<Utc>) -> usize {
        let before = states.len();
        states.retain(|_, state| !self.is_expired(state, now));
        let purged = before - states.len();
        if purged > 0 {
            tracing::debug!("Purged {} expired task states", purged);
        }
        purged
    }

    /// Sweep on writes, at most once per expiry period (capped at a minute)
    fn sweep_if_due(&self, states: &mut HashMap<String, TaskState>, now: DateTime<Utc>) {
        let Some(expire) = self.result_expire else {
            return;
        };
        let now_ms = now.timestamp_millis();
        if now_ms < self.next_purge_ms.load(Ordering::Relaxed) {
            return;
        }
        let interval_ms = expire.num_milliseconds().min(MAX_PURGE_INTERVAL_SECS * 1000);
        self.next_purge_ms
            .store(now_ms.saturating_add(interval_ms), Ordering::Relaxed);
        self.sweep(states, now);
    }

    /// Number of recorded groups
    pub async fn group_count(&self) -> usize {
        self.groups.read().await.len()
    }

    /// Number of stored task states
    pub async fn state_count(&self) -> usize {
        self.states.read().await.len()
    }

    fn check_count(group_uuid: &str, meta: &GroupMeta, declared: usize) -> ChordqResult<()> {
        if meta.task_uuids.len() != declared {
            return Err(ChordqError::GroupMismatch {
                group_uuid: group_uuid.to_string(),
                recorded: meta.task_uuids.len(),
                declared,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ResultBackend for InMemoryBackend {
    async fn init_group(&self, group_uuid: &str, task_uuids: &[String]) -> ChordqResult<()> {
        let mut groups = self.groups.write().await;
        groups.insert(
            group_uuid.to_string(),
            GroupMeta {
                task_uuids: task_uuids.to_vec(),
                chord_triggered: false,
                created_at: Utc::now(),
            },
        );
        tracing::debug!("Recorded group {} with {} tasks", group_uuid, task_uuids.len());
        Ok(())
    }

    async fn group_completed(&self, group_uuid: &str, group_task_count: usize) -> ChordqResult<bool> {
        let groups = self.groups.read().await;
        let meta = groups.get(group_uuid).ok_or_else(|| ChordqError::GroupNotFound {
            group_uuid: group_uuid.to_string(),
        })?;
        Self::check_count(group_uuid, meta, group_task_count)?;

        let states = self.states.read().await;
        let completed = meta
            .task_uuids
            .iter()
            .filter(|uuid| states.get(*uuid).is_some_and(TaskState::is_success))
            .count();

        Ok(completed == group_task_count)
    }

    async fn group_task_states(
        &self,
        group_uuid: &str,
        group_task_count: usize,
    ) -> ChordqResult<Vec<TaskState>> {
        let groups = self.groups.read().await;
        let meta = groups.get(group_uuid).ok_or_else(|| ChordqError::GroupNotFound {
            group_uuid: group_uuid.to_string(),
        })?;
        Self::check_count(group_uuid, meta, group_task_count)?;

        let states = self.states.read().await;
        Ok(meta
            .task_uuids
            .iter()
            .filter_map(|uuid| states.get(uuid).cloned())
            .collect())
    }

    async fn trigger_chord(&self, group_uuid: &str) -> ChordqResult<bool> {
        let mut groups = self.groups.write().await;
        let meta = groups
            .get_mut(group_uuid)
            .ok_or_else(|| ChordqError::GroupNotFound {
                group_uuid: group_uuid.to_string(),
            })?;

        if meta.chord_triggered {
            return Ok(false);
        }
        meta.chord_triggered = true;
        tracing::debug!(
            "Chord for group {} triggered {:?} after creation",
            group_uuid,
            Utc::now() - meta.created_at
        );
        Ok(true)
    }

    async fn release_chord(&self, group_uuid: &str) -> ChordqResult<()> {
        if let Some(meta) = self.groups.write().await.get_mut(group_uuid) {
            meta.chord_triggered = false;
            tracing::debug!("Released chord claim for group {}", group_uuid);
        }
        Ok(())
    }

    async fn set_state(&self, state: TaskState) -> ChordqResult<()> {
        let mut states = self.states.write().await;
        if let Some(existing) = states.get(&state.task_uuid) {
            if existing.status == TaskStatus::Success && state.status != TaskStatus::Success {
                tracing::debug!(
                    "Ignoring {:?} for task {} which already succeeded",
                    state.status,
                    state.task_uuid
                );
                return Ok(());
            }
        }
        states.insert(state.task_uuid.clone(), state);
        self.sweep_if_due(&mut states, Utc::now());
        Ok(())
    }

    async fn get_state(&self, task_uuid: &str) -> ChordqResult<Option<TaskState>> {
        let now = Utc::now();
        Ok(self
            .states
            .read()
            .await
            .get(task_uuid)
            .filter(|state| !self.is_expired(state, now))
            .cloned())
    }

    async fn purge_state(&self, task_uuid: &str) -> ChordqResult<()> {
        self.states.write().await.remove(task_uuid);
        Ok(())
    }

    async fn purge_group_meta(&self, group_uuid: &str) -> ChordqResult<()> {
        self.groups.write().await.remove(group_uuid);
        Ok(())
    }
}
