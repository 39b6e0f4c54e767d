//! The rules DSL: declarative scenarios that select operations and run
//! ordered, side-effecting actions against per-session state before a
//! response is rendered.

mod engine;
mod load;
mod model;

use thiserror::Error;

pub use engine::{ActionRunner, ResponseDraft, RuleEngine};
pub use load::{load_rules_file, load_rules_value};
pub use model::{
    Action, DelaySpec, EmitAction, EmitLevel, IfAction, MatchConditions, RespondAction, Rule,
    Selector, StateDelAction, StateIncrementAction, StatePatchAction, StateSetAction,
};

/// Load-time rule problems. Fatal at startup.
#[derive(Debug, Error)]
pub enum RuleError {
    #[error("failed to read rules file '{path}'")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse rules document: {0}")]
    Parse(String),

    #[error("rules document has no top-level 'scenarios' array")]
    NoScenarios,

    #[error("scenario #{index} is missing required key '{key}'")]
    MissingKey { index: usize, key: &'static str },

    #[error("scenario #{index} is invalid: {reason}")]
    Invalid { index: usize, reason: String },
}

/// Runtime action failures. They abort the remaining action list and the
/// pipeline turns them into a 500-class problem document.
#[derive(Debug, Error)]
pub enum RuleFailure {
    #[error("template evaluation failed")]
    Template(#[from] sandbox_template::TemplateError),

    #[error("state operation failed")]
    Store(#[from] sandbox_store::StoreError),

    #[error("invalid delay spec '{0}'")]
    BadDelay(String),
}
