//! Chains, groups and chords.
//!
//! These builders only lay out continuation fields on signatures. Running
//! them is the orchestrator's job once the signatures are published.

use super::signature::Signature;
use crate::error::{ChordqError, ChordqResult};
use std::collections::HashSet;

/// Prefix for group identifiers.
pub const GROUP_UUID_PREFIX: &str = "group_";

/// Signatures that run one after another.
///
/// The head carries the rest of the chain nested through `on_success`.
#[derive(Debug, Clone)]
pub struct Chain {
    head: Signature,
    task_uuids: Vec<String>,
}

impl Chain {
    /// Nest `signatures` so each one runs after its predecessor succeeds.
    pub fn new(signatures: Vec<Signature>) -> ChordqResult<Self> {
        if signatures.is_empty() {
            return Err(ChordqError::workflow("chain needs at least one signature"));
        }

        let task_uuids = signatures.iter().map(|s| s.uuid.clone()).collect();
        let mut next: Option<Signature> = None;
        for mut signature in signatures.into_iter().rev() {
            if let Some(successor) = next.take() {
                signature.on_success.push(successor);
            }
            next = Some(signature);
        }

        let head = next.ok_or_else(|| ChordqError::workflow("chain needs at least one signature"))?;
        Ok(Self { head, task_uuids })
    }

    /// First signature of the chain
    pub fn head(&self) -> &Signature {
        &self.head
    }

    /// Consume the chain, returning the head to publish
    pub fn into_head(self) -> Signature {
        self.head
    }

    /// Uuids in execution order
    pub fn task_uuids(&self) -> &[String] {
        &self.task_uuids
    }
}

/// Signatures published together and tracked for joint completion.
#[derive(Debug, Clone)]
pub struct Group {
    group_uuid: String,
    tasks: Vec<Signature>,
}

impl Group {
    /// Assign a fresh group id and cardinality to every member.
    pub fn new(signatures: Vec<Signature>) -> ChordqResult<Self> {
        if signatures.is_empty() {
            return Err(ChordqError::workflow("group needs at least one signature"));
        }

        let mut seen = HashSet::new();
        for signature in &signatures {
            if !seen.insert(signature.uuid.as_str()) {
                return Err(ChordqError::workflow(format!(
                    "duplicate task uuid {} in group",
                    signature.uuid
                )));
            }
        }

        let group_uuid = format!("{}{}", GROUP_UUID_PREFIX, uuid::Uuid::new_v4());
        let count = signatures.len();
        let tasks = signatures
            .into_iter()
            .map(|mut signature| {
                signature.group_uuid = group_uuid.clone();
                signature.group_task_count = count;
                signature
            })
            .collect();

        Ok(Self { group_uuid, tasks })
    }

    /// Group identifier
    pub fn group_uuid(&self) -> &str {
        &self.group_uuid
    }

    /// Members in declaration order
    pub fn tasks(&self) -> &[Signature] {
        &self.tasks
    }

    /// Member uuids in declaration order
    pub fn task_uuids(&self) -> Vec<String> {
        self.tasks.iter().map(|s| s.uuid.clone()).collect()
    }

    /// Number of members
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Always false for a constructed group
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub(crate) fn into_tasks(self) -> Vec<Signature> {
        self.tasks
    }
}

/// A group plus a callback published once every member has succeeded.
#[derive(Debug, Clone)]
pub struct Chord {
    group: Group,
    callback: Signature,
}

impl Chord {
    /// Attach `callback` to every member of `group`.
    pub fn new(mut group: Group, callback: Signature) -> ChordqResult<Self> {
        if group.tasks.iter().any(|task| task.uuid == callback.uuid) {
            return Err(ChordqError::workflow("chord callback cannot be a group member"));
        }
        for task in &mut group.tasks {
            task.chord_callback = Some(Box::new(callback.clone()));
        }
        Ok(Self { group, callback })
    }

    /// The member group
    pub fn group(&self) -> &Group {
        &self.group
    }

    /// The fan-in callback
    pub fn callback(&self) -> &Signature {
        &self.callback
    }

    pub(crate) fn into_parts(self) -> (Group, Signature) {
        (self.group, self.callback)
    }
}
