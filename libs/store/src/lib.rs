//! Session-scoped key/value state for the sandbox.
//!
//! The [`StateStore`] trait is the single contract rule actions mutate state
//! through; it is implemented by three backends (in-memory with a timing
//! wheel, append-log file with snapshot compaction, and redis with atomic
//! merge) plus the [`ScopedStore`] decorator that namespaces keys per
//! session. The store itself only ever sees flat keys.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

mod file;
mod memory;
mod redis_store;
mod scoped;
mod session;

pub use file::{FileStore, FileStoreConfig};
pub use memory::{MemoryStore, MemoryStoreConfig};
pub use redis_store::{RedisStore, RedisStoreConfig};
pub use scoped::ScopedStore;
pub use session::{Scope, SessionContext, GLOBAL_SESSION};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("state store I/O failure")]
    Io(#[from] std::io::Error),

    #[error("state store serialization failure")]
    Serde(#[from] serde_json::Error),

    #[error("state store backend failure: {0}")]
    Backend(String),
}

/// A stored entry. Timestamps are epoch milliseconds; expiry is absolute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entry {
    pub value: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Entry {
    pub fn new(value: Value, ttl_secs: Option<u64>, now_ms: i64) -> Self {
        Self {
            value,
            expires_at: ttl_secs.map(|t| now_ms + (t as i64) * 1000),
            created_at: now_ms,
            updated_at: now_ms,
        }
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        matches!(self.expires_at, Some(at) if at <= now_ms)
    }
}

/// The uniform store contract. All operations may fail with a backend error;
/// the request pipeline surfaces those as 500-class problem documents.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError>;

    /// Absolute expiry when `ttl` (seconds) is given; a `set` never inherits
    /// a prior entry's expiry.
    async fn set(&self, key: &str, value: Value, ttl: Option<u64>) -> Result<(), StoreError>;

    async fn del(&self, key: &str) -> Result<(), StoreError>;

    /// Numeric add. Absent or non-numeric prior values count as 0; the prior
    /// expiry is preserved. Returns the new value (integer when exact).
    async fn increment(&self, key: &str, by: f64) -> Result<Value, StoreError>;

    /// Merge `value` into the existing entry (see [`merge_values`]),
    /// preserving the prior expiry.
    async fn patch(&self, key: &str, value: Value) -> Result<(), StoreError>;

    /// Flush and release. Idempotent.
    async fn close(&self) -> Result<(), StoreError>;
}

/// Merge semantics shared by every backend:
/// object + object → shallow key override, array + array → concatenation
/// (existing first), anything else → replace.
pub fn merge_values(existing: &Value, incoming: Value) -> Value {
    match (existing, incoming) {
        (Value::Object(old), Value::Object(new)) => {
            let mut merged = old.clone();
            for (k, v) in new {
                merged.insert(k, v);
            }
            Value::Object(merged)
        }
        (Value::Array(old), Value::Array(new)) => {
            let mut merged = old.clone();
            merged.extend(new);
            Value::Array(merged)
        }
        (_, incoming) => incoming,
    }
}

/// Render an f64 as a JSON number, using the integer form when exact.
pub(crate) fn numeric_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < (i64::MAX as f64) {
        Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Numeric reading of a stored value; anything non-numeric counts as 0.
pub(crate) fn as_number(value: Option<&Value>) -> f64 {
    value.and_then(Value::as_f64).unwrap_or(0.0)
}
