use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::{StateStore, StoreError};

/// Decorator that prefixes every key with a namespace and defers `close()`
/// to the owner of the shared inner store.
#[derive(Clone)]
pub struct ScopedStore {
    inner: Arc<dyn StateStore>,
    prefix: String,
}

impl ScopedStore {
    pub fn new(inner: Arc<dyn StateStore>, prefix: impl Into<String>) -> Self {
        Self {
            inner,
            prefix: prefix.into(),
        }
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }
}

#[async_trait]
impl StateStore for ScopedStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        self.inner.get(&self.full_key(key)).await
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<u64>) -> Result<(), StoreError> {
        self.inner.set(&self.full_key(key), value, ttl).await
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        self.inner.del(&self.full_key(key)).await
    }

    async fn increment(&self, key: &str, by: f64) -> Result<Value, StoreError> {
        self.inner.increment(&self.full_key(key), by).await
    }

    async fn patch(&self, key: &str, value: Value) -> Result<(), StoreError> {
        self.inner.patch(&self.full_key(key), value).await
    }

    /// The inner store is shared; closing a scoped view is a no-op.
    async fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
