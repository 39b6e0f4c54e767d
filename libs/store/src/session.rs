/// The reserved identifier designating the global scope.
pub const GLOBAL_SESSION: &str = "GLOBAL";

/// Logical namespace for state keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Session,
    Global,
}

impl Scope {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "session" => Some(Self::Session),
            "global" => Some(Self::Global),
            _ => None,
        }
    }
}

/// Opaque session identifier extracted by the request pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContext {
    id: String,
}

impl SessionContext {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    pub fn global() -> Self {
        Self::new(GLOBAL_SESSION)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_global(&self) -> bool {
        self.id == GLOBAL_SESSION
    }

    pub fn scope(&self) -> Scope {
        if self.is_global() {
            Scope::Global
        } else {
            Scope::Session
        }
    }

    /// Key prefix for a scope: `session:<sid>:` or `global:`. A session
    /// whose identifier is the `GLOBAL` sentinel always lands in the global
    /// namespace.
    pub fn key_prefix(&self, scope: Scope) -> String {
        match scope {
            Scope::Global => "global:".to_string(),
            Scope::Session if self.is_global() => "global:".to_string(),
            Scope::Session => format!("session:{}:", self.id),
        }
    }

    /// Namespace a logical key under this session; `scope` defaults to the
    /// session's own scope.
    pub fn namespaced(&self, scope: Option<Scope>, key: &str) -> String {
        let scope = scope.unwrap_or_else(|| self.scope());
        format!("{}{}", self.key_prefix(scope), key)
    }
}
