//! The task signature: one invocation plus its continuation graph.

use super::headers::Headers;
use crate::error::TaskError;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Prefix distinguishing task identifiers from other id namespaces.
pub const TASK_UUID_PREFIX: &str = "task_";

/// A positional task argument with an explicit type tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Arg {
    /// Optional argument name
    #[serde(default)]
    pub name: String,
    /// Type tag, e.g. `int64`, `string`, `[]float64`
    #[serde(rename = "type")]
    pub arg_type: String,
    /// The value itself
    pub value: Value,
}

impl Arg {
    /// Create an unnamed argument
    pub fn new(arg_type: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            name: String::new(),
            arg_type: arg_type.into(),
            value: value.into(),
        }
    }

    /// Create a named argument
    pub fn named(name: impl Into<String>, arg_type: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            arg_type: arg_type.into(),
            value: value.into(),
        }
    }

    /// Return the value after checking it against the type tag.
    pub fn typed_value(&self) -> Result<&Value, TaskError> {
        if value_matches(&self.arg_type, &self.value) {
            Ok(&self.value)
        } else {
            Err(TaskError::InvalidArgs(format!(
                "argument {:?} declared as {} but holds {}",
                self.name, self.arg_type, self.value
            )))
        }
    }

    /// Check the type tag and deserialize the value.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, TaskError> {
        let value = self.typed_value()?;
        Ok(serde_json::from_value(value.clone())?)
    }
}

fn value_matches(arg_type: &str, value: &Value) -> bool {
    if let Some(element) = arg_type.strip_prefix("[]") {
        return match value {
            Value::Array(items) => items.iter().all(|item| value_matches(element, item)),
            _ => false,
        };
    }

    match arg_type {
        "bool" => value.is_boolean(),
        "string" => value.is_string(),
        "int" | "int8" | "int16" | "int32" | "int64" => value.is_i64(),
        "uint" | "uint8" | "uint16" | "uint32" | "uint64" => value.is_u64(),
        "float32" | "float64" => value.is_number(),
        _ => false,
    }
}

/// One task invocation.
///
/// Cloning is deep: every continuation reachable through `on_success`,
/// `on_error` and `chord_callback` is owned, so a clone shares nothing with
/// its source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Signature {
    pub uuid: String,
    pub name: String,
    pub routing_key: String,
    pub eta: Option<DateTime<Utc>>,
    pub group_uuid: String,
    pub group_task_count: usize,
    pub args: Vec<Arg>,
    pub headers: Headers,
    pub priority: u8,
    pub immutable: bool,
    pub retry_count: u32,
    /// Seconds to wait before the next attempt; 0 defers to the retry policy
    pub retry_timeout: u32,
    pub on_success: Vec<Signature>,
    pub on_error: Vec<Signature>,
    pub chord_callback: Option<Box<Signature>>,
    /// Ordering group for brokers with partitioned FIFO queues
    pub broker_message_group_id: String,
    /// Receipt handle of an SQS-like delivery
    pub sqs_receipt_handle: String,
    /// Leave failed messages on the source queue so a dead-letter policy can pick them up
    pub stop_task_deletion_on_error: bool,
    /// Drop deliveries with no local handler instead of treating them as failures
    pub ignore_when_task_not_registered: bool,
}

impl Signature {
    /// Create a signature with a fresh uuid; every other field is zeroed.
    pub fn new(name: impl Into<String>, args: Vec<Arg>) -> Self {
        Self {
            uuid: format!("{}{}", TASK_UUID_PREFIX, uuid::Uuid::new_v4()),
            name: name.into(),
            args,
            ..Default::default()
        }
    }

    /// Set the destination queue hint.
    pub fn with_routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = routing_key.into();
        self
    }

    /// Deliver no earlier than `eta`.
    pub fn with_eta(mut self, eta: DateTime<Utc>) -> Self {
        self.eta = Some(eta);
        self
    }

    /// Set the broker-interpreted priority.
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    /// Keep `args` untouched when results are passed down the chain.
    pub fn immutable(mut self) -> Self {
        self.immutable = true;
        self
    }

    /// Override the base retry delay in seconds.
    pub fn with_retry_timeout(mut self, secs: u32) -> Self {
        self.retry_timeout = secs;
        self
    }

    /// Append a success continuation.
    pub fn then(mut self, next: Signature) -> Self {
        self.on_success.push(next);
        self
    }

    /// Append an error continuation.
    pub fn or_else(mut self, handler: Signature) -> Self {
        self.on_error.push(handler);
        self
    }

    /// Whether the signature belongs to a group.
    pub fn in_group(&self) -> bool {
        !self.group_uuid.is_empty()
    }

    /// Whether the ETA is set and still in the future.
    pub fn is_delayed(&self, now: DateTime<Utc>) -> bool {
        self.eta.is_some_and(|eta| eta > now)
    }
}

/// Produce an independent copy of `signature`, continuations included.
pub fn copy_signature(signature: &Signature) -> Signature {
    Signature {
        uuid: signature.uuid.clone(),
        name: signature.name.clone(),
        routing_key: signature.routing_key.clone(),
        eta: signature.eta,
        group_uuid: signature.group_uuid.clone(),
        group_task_count: signature.group_task_count,
        args: signature.args.clone(),
        headers: signature.headers.clone(),
        priority: signature.priority,
        immutable: signature.immutable,
        retry_count: signature.retry_count,
        retry_timeout: signature.retry_timeout,
        on_success: copy_signatures(&signature.on_success),
        on_error: copy_signatures(&signature.on_error),
        chord_callback: signature
            .chord_callback
            .as_deref()
            .map(|callback| Box::new(copy_signature(callback))),
        broker_message_group_id: signature.broker_message_group_id.clone(),
        sqs_receipt_handle: signature.sqs_receipt_handle.clone(),
        stop_task_deletion_on_error: signature.stop_task_deletion_on_error,
        ignore_when_task_not_registered: signature.ignore_when_task_not_registered,
    }
}

/// Copy every signature, preserving order.
pub fn copy_signatures(signatures: &[Signature]) -> Vec<Signature> {
    signatures.iter().map(copy_signature).collect()
}
