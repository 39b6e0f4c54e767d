use std::sync::Arc;

use serde_json::{Map, Value};

use sandbox_store::StateStore;

use crate::TemplateError;

/// The evaluation environment for one render: the enumerated bindings
/// (`req`, `session`, `vars`, `now`) plus an optional session-scoped store
/// behind the `state` name. Nothing else is in scope.
#[derive(Clone, Default)]
pub struct EvalContext {
    bindings: Map<String, Value>,
    state: Option<Arc<dyn StateStore>>,
}

impl EvalContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_binding(mut self, name: impl Into<String>, value: Value) -> Self {
        self.bindings.insert(name.into(), value);
        self
    }

    /// Wire the read-only `state` projection to a (scoped) store.
    pub fn with_state(mut self, store: Arc<dyn StateStore>) -> Self {
        self.state = Some(store);
        self
    }

    pub(crate) fn binding(&self, name: &str) -> Option<&Value> {
        self.bindings.get(name)
    }

    pub(crate) fn has_state(&self) -> bool {
        self.state.is_some()
    }

    /// Read-through to the live store so expressions observe writes made
    /// earlier in the same action list. Absent keys read as null.
    pub(crate) async fn state_get(&self, key: &str) -> Result<Value, TemplateError> {
        match &self.state {
            Some(store) => Ok(store.get(key).await?.unwrap_or(Value::Null)),
            None => Ok(Value::Null),
        }
    }
}

impl std::fmt::Debug for EvalContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvalContext")
            .field("bindings", &self.bindings.keys().collect::<Vec<_>>())
            .field("state", &self.state.is_some())
            .finish()
    }
}
