//! String-keyed metadata carried by a [`Signature`](super::Signature).
//!
//! Headers may hold arbitrary JSON values, but the propagation accessors
//! only ever write and read strings. This lets payload metadata sit next to
//! cross-process trace headers without either getting in the way.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A single header value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderValue {
    /// String value, visible to [`Headers::foreach_key`]
    Text(String),
    /// Any other JSON value, skipped during iteration
    Other(serde_json::Value),
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        HeaderValue::Text(value)
    }
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        HeaderValue::Text(value.to_string())
    }
}

impl From<serde_json::Value> for HeaderValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::String(s) => HeaderValue::Text(s),
            other => HeaderValue::Other(other),
        }
    }
}

/// Mapping from header name to value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Headers(HashMap<String, HeaderValue>);

impl Headers {
    /// Create an empty header map
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a string value under `key`, replacing any previous value.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), HeaderValue::Text(value.into()));
    }

    /// Store an arbitrary value under `key`.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<HeaderValue>) {
        self.0.insert(key.into(), value.into());
    }

    /// Visit every string-valued entry.
    ///
    /// Non-string entries are skipped. The first error returned by `handler`
    /// stops the iteration and is handed back to the caller. Visit order
    /// follows the underlying map and is not stable.
    pub fn foreach_key<F, E>(&self, mut handler: F) -> Result<(), E>
    where
        F: FnMut(&str, &str) -> Result<(), E>,
    {
        for (key, value) in &self.0 {
            let HeaderValue::Text(text) = value else {
                continue;
            };
            handler(key, text)?;
        }
        Ok(())
    }

    /// Look up a value
    pub fn get(&self, key: &str) -> Option<&HeaderValue> {
        self.0.get(key)
    }

    /// Look up a string value; `None` for missing or non-string entries
    pub fn get_str(&self, key: &str) -> Option<&str> {
        match self.0.get(key) {
            Some(HeaderValue::Text(text)) => Some(text),
            _ => None,
        }
    }

    /// Remove an entry
    pub fn remove(&mut self, key: &str) -> Option<HeaderValue> {
        self.0.remove(key)
    }

    /// Number of entries, string or not
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether there are no entries
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, HeaderValue)> for Headers {
    fn from_iter<T: IntoIterator<Item = (String, HeaderValue)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}
