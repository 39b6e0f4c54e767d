use std::sync::OnceLock;
use std::time::Duration;

use futures::future::BoxFuture;
use regex::Regex;
use serde_json::{Map, Value};

use crate::context::EvalContext;
use crate::expr::{self, Evaluator};
use crate::faker::Faker;
use crate::rng::Mulberry32;
use crate::TemplateError;

/// `{{ expr }}`, permitting balanced single braces inside the expression.
fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{((?:[^{}]|\{[^{}]*\})*?)\}\}").expect("static regex"))
}

/// A string that is exactly one placeholder; its evaluated value keeps its
/// type instead of being stringified.
fn whole_placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\{\{((?:[^{}]|\{[^{}]*\})*?)\}\}$").expect("static regex")
    })
}

/// Coarse token screen applied before parsing. The interpreter only exposes
/// the enumerated environment anyway; this is the first, cheap gate.
fn deny_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?x)
            \b(
                process | child_process | globalThis | global | require | import
                | module | eval | Function | constructor | prototype | __proto__
                | fs | net | http | https | Deno | Bun
            )\b
            | \.\./
            ",
        )
        .expect("static regex")
    })
}

#[derive(Debug, Clone)]
pub struct TemplateConfig {
    /// Expressions longer than this are rejected unparsed.
    pub max_expr_len: usize,
    /// Wall-clock cap per evaluation.
    pub eval_timeout: Duration,
}

impl Default for TemplateConfig {
    fn default() -> Self {
        Self {
            max_expr_len: 1000,
            eval_timeout: Duration::from_millis(100),
        }
    }
}

/// One template engine per request: a single seeded stream drives `uuid()`,
/// `rand()`, `faker.*` and schema generation, and `now` is fixed for the
/// engine's lifetime. Two engines with the same seed produce identical
/// sequences.
pub struct TemplateEngine {
    rng: Mulberry32,
    now_ms: i64,
    config: TemplateConfig,
}

impl TemplateEngine {
    pub fn new(seed_parts: &[&str], now_ms: i64, config: TemplateConfig) -> Self {
        Self {
            rng: Mulberry32::seeded(seed_parts),
            now_ms,
            config,
        }
    }

    pub fn rng(&self) -> &Mulberry32 {
        &self.rng
    }

    pub fn faker(&self) -> Faker<'_> {
        Faker::new(&self.rng, self.now_ms)
    }

    pub fn now_ms(&self) -> i64 {
        self.now_ms
    }

    /// Raw evaluation with no surrounding interpolation. Failures propagate.
    pub async fn evaluate(&self, src: &str, ctx: &EvalContext) -> Result<Value, TemplateError> {
        let src = src.trim();
        if src.len() > self.config.max_expr_len {
            return Err(TemplateError::TooLong(self.config.max_expr_len));
        }
        if let Some(hit) = deny_re().find(src) {
            return Err(TemplateError::Forbidden(hit.as_str().to_string()));
        }
        let parsed = expr::parse(src)?;
        let evaluator = Evaluator::new(&self.rng, self.now_ms, ctx);
        tokio::time::timeout(self.config.eval_timeout, evaluator.run(&parsed))
            .await
            .map_err(|_| TemplateError::Timeout)?
    }

    /// Interpolate every `{{ expr }}` occurrence. A failed expression leaves
    /// its placeholder verbatim; a null result renders as the empty string.
    pub async fn render(&self, input: &str, ctx: &EvalContext) -> String {
        let mut out = String::with_capacity(input.len());
        let mut last = 0;
        for caps in placeholder_re().captures_iter(input) {
            let whole = caps.get(0).expect("capture 0");
            out.push_str(&input[last..whole.start()]);
            match self.evaluate(&caps[1], ctx).await {
                Ok(value) => out.push_str(&crate::display(&value)),
                Err(e) => {
                    tracing::debug!(error = %e, expr = &caps[1], "template expression failed, emitting placeholder");
                    out.push_str(whole.as_str());
                }
            }
            last = whole.end();
        }
        out.push_str(&input[last..]);
        out
    }

    /// Like [`render`](Self::render), but a string that consists of exactly
    /// one placeholder yields the evaluated value with its type intact
    /// (`"{{vars.n}}"` stays a number).
    pub async fn render_value(&self, input: &str, ctx: &EvalContext) -> Value {
        if let Some(caps) = whole_placeholder_re().captures(input) {
            match self.evaluate(&caps[1], ctx).await {
                Ok(value) => return value,
                Err(e) => {
                    tracing::debug!(error = %e, expr = &caps[1], "template expression failed, emitting placeholder");
                    return Value::String(input.to_string());
                }
            }
        }
        Value::String(self.render(input, ctx).await)
    }

    /// Walk an arbitrary data tree. A subtree becomes eligible for
    /// templating when it is an object carrying `$template: true`; the
    /// marker is removed and every string reachable beneath (keys included)
    /// is rendered.
    pub async fn process_template(&self, value: &Value, ctx: &EvalContext) -> Value {
        self.walk(value, ctx, false).await
    }

    /// Render every string in the tree regardless of markers. Used where
    /// the caller already decided the subtree is a template.
    pub async fn render_tree(&self, value: &Value, ctx: &EvalContext) -> Value {
        self.walk(value, ctx, true).await
    }

    fn walk<'a>(
        &'a self,
        value: &'a Value,
        ctx: &'a EvalContext,
        active: bool,
    ) -> BoxFuture<'a, Value> {
        Box::pin(async move {
            match value {
                Value::Object(map) => {
                    let marked = matches!(map.get("$template"), Some(Value::Bool(true)));
                    let active = active || marked;
                    let mut out = Map::with_capacity(map.len());
                    for (k, v) in map {
                        if active && k == "$template" {
                            continue;
                        }
                        let key = if active { self.render(k, ctx).await } else { k.clone() };
                        out.insert(key, self.walk(v, ctx, active).await);
                    }
                    Value::Object(out)
                }
                Value::Array(items) => {
                    let mut out = Vec::with_capacity(items.len());
                    for item in items {
                        out.push(self.walk(item, ctx, active).await);
                    }
                    Value::Array(out)
                }
                Value::String(s) if active => self.render_value(s, ctx).await,
                other => other.clone(),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn engine() -> TemplateEngine {
        TemplateEngine::new(&["seed"], 1_700_000_000_000, TemplateConfig::default())
    }

    fn ctx() -> EvalContext {
        EvalContext::new()
            .with_binding(
                "req",
                json!({
                    "method": "GET",
                    "path": "/pets/42",
                    "headers": { "x-y": "marker", "accept": "application/json" },
                    "query": { "page": "2" },
                    "pathParams": { "id": "42" },
                    "body": { "id": "42", "name": "Ada" }
                }),
            )
            .with_binding("session", json!({ "id": "s-1", "scope": "session" }))
            .with_binding("vars", json!({ "n": 3 }))
            .with_binding("now", json!(1_700_000_000_000_i64))
    }

    #[tokio::test]
    async fn arithmetic_and_precedence() {
        assert_eq!(engine().evaluate("1+2*3", &ctx()).await.unwrap(), json!(7));
        assert_eq!(
            engine().evaluate("(1+2)*3", &ctx()).await.unwrap(),
            json!(9)
        );
    }

    #[tokio::test]
    async fn header_lookup_with_bracket_syntax() {
        assert_eq!(
            engine()
                .evaluate("req.headers['x-y']", &ctx())
                .await
                .unwrap(),
            json!("marker")
        );
    }

    #[tokio::test]
    async fn deny_listed_tokens_refuse() {
        for expr in [
            "process.exit(1)",
            "require('fs')",
            "x.constructor",
            "a.__proto__",
            "util.json.parse('../etc')",
        ] {
            let err = engine().evaluate(expr, &ctx()).await.unwrap_err();
            assert!(
                matches!(err, TemplateError::Forbidden(_)),
                "{expr} should refuse, got {err:?}"
            );
        }
    }

    #[tokio::test]
    async fn oversized_expressions_refuse() {
        let long = format!("1+{}", "1+".repeat(600));
        assert!(matches!(
            engine().evaluate(&long, &ctx()).await.unwrap_err(),
            TemplateError::TooLong(_)
        ));
    }

    #[tokio::test]
    async fn render_substitutes_and_keeps_failed_placeholders() {
        let out = engine()
            .render("id={{req.pathParams.id}} bad={{nope.x}} empty={{null}}", &ctx())
            .await;
        assert_eq!(out, "id=42 bad={{nope.x}} empty=");
    }

    #[tokio::test]
    async fn render_value_keeps_types_for_whole_placeholders() {
        let e = engine();
        assert_eq!(e.render_value("{{vars.n}}", &ctx()).await, json!(3));
        assert_eq!(
            e.render_value("{{req.body}}", &ctx()).await,
            json!({ "id": "42", "name": "Ada" })
        );
        assert_eq!(
            e.render_value("n is {{vars.n}}", &ctx()).await,
            json!("n is 3")
        );
    }

    #[tokio::test]
    async fn process_template_only_touches_marked_subtrees() {
        let e = engine();
        let input = json!({
            "untouched": "{{vars.n}}",
            "payload": {
                "$template": true,
                "count": "{{vars.n}}",
                "{{util.string.lower('KEY')}}": "x",
                "nested": { "deep": "{{req.method}}" }
            }
        });
        let out = e.process_template(&input, &ctx()).await;
        assert_eq!(
            out,
            json!({
                "untouched": "{{vars.n}}",
                "payload": {
                    "count": 3,
                    "key": "x",
                    "nested": { "deep": "GET" }
                }
            })
        );
    }

    #[tokio::test]
    async fn ternary_and_logic() {
        let e = engine();
        assert_eq!(
            e.evaluate("vars.n > 2 ? 'big' : 'small'", &ctx()).await.unwrap(),
            json!("big")
        );
        assert_eq!(
            e.evaluate("req.query.missing || 'fallback'", &ctx())
                .await
                .unwrap(),
            json!("fallback")
        );
    }

    #[tokio::test]
    async fn string_concat_builds_keys() {
        assert_eq!(
            engine()
                .evaluate("'user:' + req.pathParams.id", &ctx())
                .await
                .unwrap(),
            json!("user:42")
        );
    }

    #[tokio::test]
    async fn identical_seeds_produce_identical_streams() {
        let a = engine();
        let b = engine();
        let c = ctx();
        assert_eq!(
            a.evaluate("uuid()", &c).await.unwrap(),
            b.evaluate("uuid()", &c).await.unwrap()
        );
        assert_eq!(
            a.evaluate("rand(1, 100)", &c).await.unwrap(),
            b.evaluate("rand(1, 100)", &c).await.unwrap()
        );
        assert_eq!(
            a.evaluate("faker.internet.email()", &c).await.unwrap(),
            b.evaluate("faker.internet.email()", &c).await.unwrap()
        );
    }

    #[tokio::test]
    async fn now_is_fixed_for_the_engine_lifetime() {
        let e = engine();
        let c = ctx();
        let first = e.evaluate("now", &c).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let second = e.evaluate("now", &c).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first, json!(1_700_000_000_000_i64));
    }

    #[tokio::test]
    async fn util_surface() {
        let e = engine();
        let c = ctx();
        assert_eq!(
            e.evaluate("util.string.upper('abc')", &c).await.unwrap(),
            json!("ABC")
        );
        assert_eq!(
            e.evaluate("util.array.join([1,2,3], '-')", &c).await.unwrap(),
            json!("1-2-3")
        );
        assert_eq!(
            e.evaluate("util.object.keys(req.pathParams)", &c).await.unwrap(),
            json!(["id"])
        );
        assert_eq!(
            e.evaluate("util.json.parse('{\"a\":1}')", &c).await.unwrap(),
            json!({ "a": 1 })
        );
        assert_eq!(
            e.evaluate("util.string.match('abc123', '^[a-z]+[0-9]+$')", &c)
                .await
                .unwrap(),
            json!(true)
        );
    }

    #[tokio::test]
    async fn state_reads_through_the_store() {
        use sandbox_store::{MemoryStore, MemoryStoreConfig, StateStore};
        use std::sync::Arc;

        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new(MemoryStoreConfig::default()));
        store
            .set("user:42", json!({ "name": "Ada" }), None)
            .await
            .unwrap();

        let c = ctx().with_state(store);
        let e = engine();
        assert_eq!(
            e.evaluate("state['user:42'].name", &c).await.unwrap(),
            json!("Ada")
        );
        assert_eq!(e.evaluate("state.missing", &c).await.unwrap(), json!(null));
        assert_eq!(
            e.evaluate("state['user:42'] ? 'hit' : 'miss'", &c).await.unwrap(),
            json!("hit")
        );
    }
}
