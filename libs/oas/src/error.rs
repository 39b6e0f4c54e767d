use thiserror::Error;

/// Load-time specification failures. All of these are fatal at startup.
#[derive(Debug, Error)]
pub enum SpecError {
    #[error("failed to read spec file '{path}'")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse spec document: {0}")]
    Parse(String),

    #[error("dangling $ref '{0}'")]
    DanglingRef(String),

    #[error("non-local $ref '{0}' (only '#/...' references are resolved)")]
    NonLocalRef(String),

    #[error("invalid path template '{template}': {reason}")]
    InvalidTemplate { template: String, reason: String },

    #[error("spec document has no 'paths' object")]
    NoPaths,
}
