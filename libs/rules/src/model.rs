use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use sandbox_template::Mulberry32;

/// One scenario: a selector, an ordered action list, and a priority.
/// Higher priorities fire first; equal priorities keep source order.
#[derive(Debug, Clone, Deserialize)]
pub struct Rule {
    pub when: Selector,
    #[serde(rename = "do")]
    pub actions: Vec<Action>,
    #[serde(default)]
    pub priority: i64,
    /// Position in the source document; set by the loader.
    #[serde(skip)]
    pub source_index: usize,
}

/// Matches an operation by `operationId` or by exact `(method, path)`, with
/// optional conditions over query and header values. `negate` flips the
/// entire match outcome.
#[derive(Debug, Clone, Deserialize)]
pub struct Selector {
    #[serde(default, rename = "operationId")]
    pub operation_id: Option<String>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default, rename = "match")]
    pub conditions: Option<MatchConditions>,
    #[serde(default)]
    pub negate: bool,
}

/// Condition values are exact strings or `$regex:<pattern>`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MatchConditions {
    #[serde(default)]
    pub query: HashMap<String, String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

/// One step in a rule's `do` list.
#[derive(Debug, Clone, Deserialize)]
pub enum Action {
    #[serde(rename = "respond")]
    Respond(RespondAction),
    #[serde(rename = "state.set")]
    StateSet(StateSetAction),
    #[serde(rename = "state.patch")]
    StatePatch(StatePatchAction),
    #[serde(rename = "state.increment")]
    StateIncrement(StateIncrementAction),
    #[serde(rename = "state.del")]
    StateDel(StateDelAction),
    #[serde(rename = "delay")]
    Delay(DelaySpec),
    #[serde(rename = "if")]
    If(IfAction),
    /// Declared but not implemented: parsed, logged, skipped.
    #[serde(rename = "proxy")]
    Proxy(Value),
    #[serde(rename = "emit")]
    Emit(EmitAction),
}

#[derive(Debug, Clone, Deserialize)]
pub struct RespondAction {
    #[serde(default)]
    pub status: Option<u16>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: Option<Value>,
    /// Inline schema object, or a `#/...` pointer string into the spec.
    #[serde(default, rename = "$schema")]
    pub schema: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StateSetAction {
    pub key: String,
    pub value: Value,
    #[serde(default)]
    pub ttl: Option<u64>,
    #[serde(default)]
    pub scope: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatePatchAction {
    pub key: String,
    pub value: Value,
    #[serde(default)]
    pub scope: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StateIncrementAction {
    pub key: String,
    #[serde(default = "default_increment")]
    pub by: f64,
    /// Bind the numeric result into rule-local scratch as `vars.<as>`.
    #[serde(default, rename = "as")]
    pub bind_as: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
}

fn default_increment() -> f64 {
    1.0
}

#[derive(Debug, Clone, Deserialize)]
pub struct StateDelAction {
    pub key: String,
    #[serde(default)]
    pub scope: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IfAction {
    pub when: String,
    pub then: Vec<Action>,
    #[serde(default, rename = "else")]
    pub otherwise: Vec<Action>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmitAction {
    #[serde(default)]
    pub level: EmitLevel,
    pub message: String,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EmitLevel {
    #[default]
    Info,
    Warn,
    Error,
}

/// Delay grammar: integer milliseconds, a suffixed literal (`250ms`, `2s`,
/// `1m`, `1h`), a uniform distribution (`100±20ms`), or a percentile form
/// (`p95=200ms`, treated as the scalar value).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DelaySpec {
    Millis(u64),
    Text(String),
}

impl DelaySpec {
    /// Parse into `(mean_ms, jitter_ms)`.
    pub fn parse(&self) -> Option<(f64, f64)> {
        match self {
            Self::Millis(ms) => Some((*ms as f64, 0.0)),
            Self::Text(text) => parse_delay_text(text.trim()),
        }
    }

    /// Sample a concrete delay: `mean + U[-jitter, +jitter]`, floored at 0.
    pub fn sample(&self, rng: &Mulberry32) -> Option<std::time::Duration> {
        let (mean, jitter) = self.parse()?;
        let sampled = if jitter > 0.0 {
            mean + rng.float_in_range(-jitter, jitter)
        } else {
            mean
        };
        Some(std::time::Duration::from_millis(sampled.max(0.0) as u64))
    }
}

fn unit_ms(unit: &str) -> Option<f64> {
    match unit {
        "ms" => Some(1.0),
        "s" => Some(1000.0),
        "m" => Some(60_000.0),
        "h" => Some(3_600_000.0),
        _ => None,
    }
}

/// `<n><unit>` with the unit optional (bare numbers are milliseconds).
fn parse_scalar(text: &str) -> Option<f64> {
    let split = text
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(text.len());
    let (num, unit) = text.split_at(split);
    let n = num.parse::<f64>().ok()?;
    if unit.is_empty() {
        Some(n)
    } else {
        Some(n * unit_ms(unit)?)
    }
}

fn parse_delay_text(text: &str) -> Option<(f64, f64)> {
    // percentile form: the scalar after '=' wins
    if let Some(rest) = text.strip_prefix('p') {
        if let Some((percentile, value)) = rest.split_once('=') {
            if percentile.chars().all(|c| c.is_ascii_digit()) {
                return Some((parse_scalar(value.trim())?, 0.0));
            }
        }
    }
    // distribution form: <mean>±<jitter><unit>, the unit scaling both
    if let Some((mean_part, jitter_part)) = text.split_once('±') {
        let split = jitter_part
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(jitter_part.len());
        let (jitter_num, unit) = jitter_part.split_at(split);
        let scale = if unit.is_empty() { 1.0 } else { unit_ms(unit)? };
        let mean = mean_part.trim().parse::<f64>().ok()? * scale;
        let jitter = jitter_num.trim().parse::<f64>().ok()? * scale;
        return Some((mean, jitter));
    }
    parse_scalar(text).map(|ms| (ms, 0.0))
}
