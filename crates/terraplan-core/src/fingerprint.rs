//! Content-addressed keys for compute-once results.
//!
//! A key is the SHA-256 of a canonical JSON document holding the operation id
//! and its semantic arguments. Object keys are sorted recursively, so the
//! order in which arguments are supplied never changes the key.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use crate::error::PlanError;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

const KEY_LEN: usize = 64;

/// Deterministic identity of an operation call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CacheKey(String);

impl CacheKey {
    /// Parse an already computed key (e.g. read back from a lease store).
    pub fn from_hex(hex: impl Into<String>) -> Result<Self, PlanError> {
        let hex = hex.into();
        if hex.len() != KEY_LEN || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(PlanError::coordination(format!(
                "'{}' is not a {}-digit hex key",
                hex.escape_default(),
                KEY_LEN
            )));
        }
        Ok(Self(hex.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short prefix for log lines.
    pub fn short(&self) -> &str {
        self.0.get(..12).unwrap_or(&self.0)
    }
}

impl TryFrom<String> for CacheKey {
    type Error = PlanError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_hex(value)
    }
}

impl From<CacheKey> for String {
    fn from(key: CacheKey) -> Self {
        key.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Published result of a compute-once call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Storage path of the result payload
    pub location: String,
    pub created_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn new(location: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            created_at: Utc::now(),
        }
    }
}

/// Which existing entries count as hits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "rule", content = "value", rename_all = "snake_case")]
pub enum Staleness {
    #[default]
    Any,
    /// Entries older than this are recomputed
    MaxAge(Duration),
    /// Entries created before this instant are recomputed
    CreatedBefore(DateTime<Utc>),
}

impl Staleness {
    pub fn accepts(&self, entry: &CacheEntry) -> bool {
        match self {
            Staleness::Any => true,
            Staleness::MaxAge(max_age) => Utc::now()
                .signed_duration_since(entry.created_at)
                .to_std()
                .map(|age| age <= *max_age)
                .unwrap_or(true),
            Staleness::CreatedBefore(cutoff) => entry.created_at >= *cutoff,
        }
    }

    pub fn is_any(&self) -> bool {
        matches!(self, Staleness::Any)
    }
}

/// Named arguments of a cacheable call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallArgs {
    semantic: BTreeMap<String, Value>,
    /// Recorded for callers but excluded from the key (e.g. serving format)
    non_semantic: BTreeMap<String, Value>,
    /// First argument that could not be encoded
    #[serde(skip)]
    invalid: Option<String>,
}

impl CallArgs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an argument that participates in the key. A value that fails to
    /// serialize makes [`fingerprint`] fail for these arguments.
    pub fn arg(mut self, name: &str, value: impl Serialize) -> Self {
        if let Some(value) = self.encode(name, value) {
            self.semantic.insert(name.to_string(), value);
        }
        self
    }

    /// Add an argument that does not change the computed result.
    pub fn non_semantic(mut self, name: &str, value: impl Serialize) -> Self {
        if let Some(value) = self.encode(name, value) {
            self.non_semantic.insert(name.to_string(), value);
        }
        self
    }

    fn encode(&mut self, name: &str, value: impl Serialize) -> Option<Value> {
        match serde_json::to_value(value) {
            Ok(value) => Some(value),
            Err(err) => {
                self.invalid
                    .get_or_insert_with(|| format!("argument '{}': {}", name, err));
                None
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.semantic
            .get(name)
            .or_else(|| self.non_semantic.get(name))
    }

    pub fn semantic(&self) -> &BTreeMap<String, Value> {
        &self.semantic
    }
}

/// Encode a canonical value with object keys in sorted order regardless of
/// how `serde_json` orders its maps.
fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (idx, key) in keys.into_iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (idx, item) in items.iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

/// Compute the key of `operation_id` called with `args`.
pub fn fingerprint(operation_id: &str, args: &CallArgs) -> Result<CacheKey, PlanError> {
    if let Some(reason) = &args.invalid {
        return Err(PlanError::config(format!(
            "cannot fingerprint {}: {}",
            operation_id, reason
        )));
    }
    let mut doc = Map::new();
    for (name, value) in &args.semantic {
        doc.insert(name.clone(), value.clone());
    }

    let mut encoded = String::new();
    encoded.push_str(&Value::String(operation_id.to_string()).to_string());
    encoded.push('|');
    write_canonical(&Value::Object(doc), &mut encoded);

    let mut hasher = Sha256::new();
    hasher.update(encoded.as_bytes());
    Ok(CacheKey(hex::encode(hasher.finalize())))
}
