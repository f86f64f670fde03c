//! Redis result backend.
//!
//! Shares task states and group metadata between processes, so a producer
//! and the workers consuming its groups see the same fan-in state.
//!
//! # Layout
//!
//! - `{prefix}:state:{task_uuid}`: JSON task state; completed states expire after `result_expire_secs`
//! - `{prefix}:group:{group_uuid}`: JSON array of member uuids in recorded order
//! - `{prefix}:chord:{group_uuid}`: present once the chord callback was claimed

use super::ResultBackend;
use crate::config::{BackendConfig, RedisConfig};
use crate::error::{ChordqError, ChordqResult};
use crate::tasks::TaskState;
use async_trait::async_trait;
use redis::{AsyncCommands, Client, Script, aio::ConnectionManager};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info};

/// Stores a state unless it would replace a success with anything else
const SET_STATE: &str = r#"
local current = redis.call('GET', KEYS[1])
if current and ARGV[2] ~= 'Success' then
    local ok, decoded = pcall(cjson.decode, current)
    if ok and decoded['status'] == 'Success' then
        return 0
    end
end
local ttl = tonumber(ARGV[3])
if ttl > 0 then
    redis.call('SET', KEYS[1], ARGV[1], 'EX', ttl)
else
    redis.call('SET', KEYS[1], ARGV[1])
end
return 1
"#;

/// 1 when claimed, 0 when already claimed, -1 when the group is unknown
const TRIGGER_CHORD: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
    return -1
end
if redis.call('SET', KEYS[2], '1', 'NX') then
    return 1
end
return 0
"#;

/// Redis result backend implementation
pub struct RedisBackend {
    conn: ConnectionManager,
    key_prefix: String,
    /// Seconds completed states live (0 = forever)
    result_expire_secs: u64,
    set_state_script: Script,
    trigger_chord_script: Script,
}

impl std::fmt::Debug for RedisBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBackend")
            .field("key_prefix", &self.key_prefix)
            .field("result_expire_secs", &self.result_expire_secs)
            .finish_non_exhaustive()
    }
}

impl RedisBackend {
    /// Connect to the server named in `redis`, keeping keys under its prefix
    pub async fn new(
        redis: &RedisConfig,
        backend: &BackendConfig,
        connect_timeout: Duration,
    ) -> ChordqResult<Self> {
        let client = Client::open(redis.connection_string.as_str())
            .map_err(|e| ChordqError::transport("Failed to create Redis client", e))?;
        let conn = timeout(connect_timeout, client.get_connection_manager())
            .await
            .map_err(|e| ChordqError::transport("Timed out connecting to Redis", e))?
            .map_err(|e| ChordqError::transport("Failed to create Redis connection manager", e))?;

        info!("Redis result backend ready with key prefix {}", redis.key_prefix);

        Ok(Self {
            conn,
            key_prefix: redis.key_prefix.clone(),
            result_expire_secs: backend.result_expire_secs,
            set_state_script: Script::new(SET_STATE),
            trigger_chord_script: Script::new(TRIGGER_CHORD),
        })
    }

    fn state_key(&self, task_uuid: &str) -> String {
        format!("{}:state:{}", self.key_prefix, task_uuid)
    }

    fn group_key(&self, group_uuid: &str) -> String {
        format!("{}:group:{}", self.key_prefix, group_uuid)
    }

    fn chord_key(&self, group_uuid: &str) -> String {
        format!("{}:chord:{}", self.key_prefix, group_uuid)
    }

    async fn group_members(&self, group_uuid: &str, declared: usize) -> ChordqResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let encoded: Option<String> = conn
            .get(self.group_key(group_uuid))
            .await
            .map_err(|e| ChordqError::transport("Failed to read group metadata", e))?;
        let encoded = encoded.ok_or_else(|| ChordqError::GroupNotFound {
            group_uuid: group_uuid.to_string(),
        })?;

        let members: Vec<String> = serde_json::from_str(&encoded)?;
        if members.len() != declared {
            return Err(ChordqError::GroupMismatch {
                group_uuid: group_uuid.to_string(),
                recorded: members.len(),
                declared,
            });
        }
        Ok(members)
    }

    /// States of `task_uuids` in the same order; missing states are `None`
    async fn states_of(&self, task_uuids: &[String]) -> ChordqResult<Vec<Option<TaskState>>> {
        if task_uuids.is_empty() {
            return Ok(Vec::new());
        }
        let keys: Vec<String> = task_uuids.iter().map(|uuid| self.state_key(uuid)).collect();
        let mut conn = self.conn.clone();
        // Explicit MGET: the typed helper sends GET for a single key
        let encoded: Vec<Option<String>> = redis::cmd("MGET")
            .arg(&keys)
            .query_async(&mut conn)
            .await
            .map_err(|e| ChordqError::transport("Failed to read task states", e))?;

        encoded
            .into_iter()
            .map(|state| {
                state
                    .map(|state| serde_json::from_str(&state).map_err(ChordqError::from))
                    .transpose()
            })
            .collect()
    }
}

#[async_trait]
impl ResultBackend for RedisBackend {
    async fn init_group(&self, group_uuid: &str, task_uuids: &[String]) -> ChordqResult<()> {
        let encoded = serde_json::to_string(task_uuids)?;
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(self.group_key(group_uuid), encoded)
            .await
            .map_err(|e| ChordqError::transport("Failed to record group", e))?;
        debug!("Recorded group {} with {} tasks", group_uuid, task_uuids.len());
        Ok(())
    }

    async fn group_completed(&self, group_uuid: &str, group_task_count: usize) -> ChordqResult<bool> {
        let members = self.group_members(group_uuid, group_task_count).await?;
        let completed = self
            .states_of(&members)
            .await?
            .iter()
            .filter(|state| state.as_ref().is_some_and(TaskState::is_success))
            .count();
        Ok(completed == group_task_count)
    }

    async fn group_task_states(
        &self,
        group_uuid: &str,
        group_task_count: usize,
    ) -> ChordqResult<Vec<TaskState>> {
        let members = self.group_members(group_uuid, group_task_count).await?;
        Ok(self.states_of(&members).await?.into_iter().flatten().collect())
    }

    async fn trigger_chord(&self, group_uuid: &str) -> ChordqResult<bool> {
        let mut conn = self.conn.clone();
        let claimed: i64 = self
            .trigger_chord_script
            .key(self.group_key(group_uuid))
            .key(self.chord_key(group_uuid))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| ChordqError::transport("Failed to trigger chord", e))?;

        match claimed {
            -1 => Err(ChordqError::GroupNotFound {
                group_uuid: group_uuid.to_string(),
            }),
            claimed => Ok(claimed == 1),
        }
    }

    async fn release_chord(&self, group_uuid: &str) -> ChordqResult<()> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(self.chord_key(group_uuid))
            .await
            .map_err(|e| ChordqError::transport("Failed to release chord claim", e))?;
        debug!("Released chord claim for group {}", group_uuid);
        Ok(())
    }

    async fn set_state(&self, state: TaskState) -> ChordqResult<()> {
        let ttl = if state.is_completed() {
            self.result_expire_secs
        } else {
            0
        };
        let status = serde_json::to_value(state.status)?;
        let encoded = serde_json::to_string(&state)?;

        let mut conn = self.conn.clone();
        let stored: i64 = self
            .set_state_script
            .key(self.state_key(&state.task_uuid))
            .arg(encoded)
            .arg(status.as_str().unwrap_or_default())
            .arg(ttl)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| ChordqError::transport("Failed to store task state", e))?;

        if stored == 0 {
            debug!(
                "Ignoring {:?} for task {} which already succeeded",
                state.status, state.task_uuid
            );
        }
        Ok(())
    }

    async fn get_state(&self, task_uuid: &str) -> ChordqResult<Option<TaskState>> {
        let mut conn = self.conn.clone();
        let encoded: Option<String> = conn
            .get(self.state_key(task_uuid))
            .await
            .map_err(|e| ChordqError::transport("Failed to read task state", e))?;
        Ok(encoded.map(|state| serde_json::from_str(&state)).transpose()?)
    }

    async fn purge_state(&self, task_uuid: &str) -> ChordqResult<()> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(self.state_key(task_uuid))
            .await
            .map_err(|e| ChordqError::transport("Failed to purge task state", e))
    }

    async fn purge_group_meta(&self, group_uuid: &str) -> ChordqResult<()> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(vec![self.group_key(group_uuid), self.chord_key(group_uuid)])
            .await
            .map_err(|e| ChordqError::transport("Failed to purge group metadata", e))
    }
}
