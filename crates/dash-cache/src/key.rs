//! Structured query keys and canonicalization.
//!
//! A `QueryKey` is an ordered sequence of JSON segments (strings, numbers,
//! nested objects). Its canonical string form is the sole identity used by
//! the cache store, in-flight registry, and subscription bus, so two keys
//! that are semantically equal must canonicalize identically regardless of
//! object property insertion order.

use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CacheError;

/// An ordered sequence of JSON-serializable key segments.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryKey {
    segments: Vec<Value>,
}

impl QueryKey {
    /// Create an empty key.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a key from JSON segments.
    pub fn of(segments: impl IntoIterator<Item = Value>) -> Self {
        Self {
            segments: segments.into_iter().collect(),
        }
    }

    /// Append a serializable segment.
    pub fn push(mut self, segment: impl Serialize) -> Result<Self, CacheError> {
        self.segments.push(serde_json::to_value(segment)?);
        Ok(self)
    }

    /// Append a segment that is already a JSON value.
    pub fn segment(mut self, segment: impl Into<Value>) -> Self {
        self.segments.push(segment.into());
        self
    }

    /// The raw segments.
    pub fn segments(&self) -> &[Value] {
        &self.segments
    }

    /// Number of segments.
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// Whether the key has no segments.
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Compute the canonical form.
    ///
    /// Total for any JSON value: object properties are emitted in sorted key
    /// order at every nesting depth, numbers and strings keep their JSON
    /// representations (so `1` and `"1"` stay distinct).
    pub fn canonicalize(&self) -> CanonicalKey {
        let segments: Vec<String> = self.segments.iter().map(canonical_segment).collect();
        let key = format!("[{}]", segments.join(","));
        CanonicalKey { key, segments }
    }
}

/// Build a [`QueryKey`] from JSON-literal segments.
///
/// # Example
///
/// ```rust,ignore
/// let key = query_key!["dao", dao_address, "proposals", { "status": "active" }];
/// ```
#[macro_export]
macro_rules! query_key {
    [$($segment:tt)+] => {
        // One json! array so object-literal segments parse; expr fragments
        // cannot match `{ ... }`.
        match ::serde_json::json!([$($segment)+]) {
            ::serde_json::Value::Array(segments) => $crate::QueryKey::of(segments),
            _ => ::std::unreachable!(),
        }
    };
}

/// The deterministic string form of a [`QueryKey`].
///
/// Equality and hashing use the full canonical string; prefix checks operate
/// on segments, never raw string prefixes, so `["dao","A"]` is not treated
/// as a prefix of `["dao","AB"]`.
#[derive(Debug, Clone, Eq)]
pub struct CanonicalKey {
    key: String,
    segments: Vec<String>,
}

impl CanonicalKey {
    /// The canonical string.
    pub fn as_str(&self) -> &str {
        &self.key
    }

    /// Canonical forms of the individual segments (for prefix checks and
    /// debugging).
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Whether this key's segments start with `prefix`'s segments.
    pub fn starts_with(&self, prefix: &CanonicalKey) -> bool {
        self.segments.len() >= prefix.segments.len()
            && self.segments[..prefix.segments.len()] == prefix.segments[..]
    }
}

impl PartialEq for CanonicalKey {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Hash for CanonicalKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

impl std::fmt::Display for CanonicalKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.key)
    }
}

/// Canonical JSON text for one segment, with sorted object properties.
fn canonical_segment(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, &Value> = map.iter().collect();
            out.push('{');
            for (i, (k, v)) in sorted.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::from(k.as_str()).to_string());
                out.push(':');
                write_canonical(v, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}
