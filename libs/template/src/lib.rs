//! Template interpolation and sandboxed expression evaluation.
//!
//! Strings may carry `{{ expr }}` placeholders; trees may mark subtrees with
//! `$template: true` for deep rendering. Expressions run in a small
//! hand-written interpreter over the enumerated environment (`req`,
//! `session`, `state`, `vars`, `now`, `uuid`, `rand`, `faker.*`, `math.*`,
//! `util.*`) — never in a host-language evaluator. All pseudo-randomness
//! flows from one mulberry32 stream per engine so identical seeds replay
//! identically.

mod context;
mod engine;
mod expr;
mod faker;
mod rng;

use thiserror::Error;

pub use context::EvalContext;
pub use engine::{TemplateConfig, TemplateEngine};
pub use faker::Faker;
pub use rng::Mulberry32;

pub(crate) use expr::{display, truthy};

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("expression exceeds the {0}-character limit")]
    TooLong(usize),

    #[error("expression contains forbidden token '{0}'")]
    Forbidden(String),

    #[error("expression parse error: {0}")]
    Parse(String),

    #[error("expression evaluation error: {0}")]
    Eval(String),

    #[error("expression evaluation timed out")]
    Timeout,

    #[error("state read failed")]
    State(#[from] sandbox_store::StoreError),
}

/// String form of a value for interpolation: null is empty, scalars render
/// plainly, arrays and objects as JSON text.
pub fn to_display_string(value: &serde_json::Value) -> String {
    display(value)
}

/// Truthiness used by `if` conditions and logical operators: null, false,
/// zero and the empty string are falsy, everything else is truthy.
pub fn is_truthy(value: &serde_json::Value) -> bool {
    truthy(value)
}
