use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use regex::Regex;
use serde_json::{Map, Value};

use sandbox_oas::OperationDescriptor;
use sandbox_schema::{Generator, GeneratorConfig, SchemaValidator};
use sandbox_store::{Scope, ScopedStore, SessionContext, StateStore};
use sandbox_template::{is_truthy, EvalContext, TemplateEngine};

use crate::model::{
    Action, EmitLevel, MatchConditions, RespondAction, Rule, StateDelAction,
    StateIncrementAction, StatePatchAction, StateSetAction,
};
use crate::RuleFailure;

/// The response a rule list publishes. `respond` overwrites previous drafts;
/// the last one wins.
#[derive(Debug, Clone, Default)]
pub struct ResponseDraft {
    pub status: Option<u16>,
    pub headers: Vec<(String, String)>,
    pub body: Option<Value>,
}

/// The loaded, sorted rule list. Read-only after startup.
pub struct RuleEngine {
    rules: Vec<Rule>,
}

impl RuleEngine {
    /// `rules` are expected pre-sorted by the loader; construction keeps the
    /// order as-is so selection stays deterministic.
    pub fn new(rules: Vec<Rule>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Rules whose selector matches the operation and whose conditions all
    /// hold, in firing order.
    pub fn select<'a>(
        &'a self,
        op: &OperationDescriptor,
        query: &HashMap<String, String>,
        headers: &HashMap<String, String>,
    ) -> Vec<&'a Rule> {
        self.rules
            .iter()
            .filter(|rule| selector_matches(&rule.when, op, query, headers))
            .collect()
    }
}

fn selector_matches(
    selector: &crate::model::Selector,
    op: &OperationDescriptor,
    query: &HashMap<String, String>,
    headers: &HashMap<String, String>,
) -> bool {
    let op_hit = match (&selector.operation_id, &selector.method, &selector.path) {
        (Some(id), _, _) => id == &op.id,
        (None, Some(method), Some(path)) => {
            method.eq_ignore_ascii_case(&op.method) && path == &op.path
        }
        _ => false,
    };

    let conditions_hit = selector
        .conditions
        .as_ref()
        .map(|c| conditions_match(c, query, headers))
        .unwrap_or(true);

    let hit = op_hit && conditions_hit;
    if selector.negate {
        !hit
    } else {
        hit
    }
}

fn conditions_match(
    conditions: &MatchConditions,
    query: &HashMap<String, String>,
    headers: &HashMap<String, String>,
) -> bool {
    let one = |expected: &str, actual: Option<&String>| -> bool {
        let Some(actual) = actual else {
            // absent actual values never match
            return false;
        };
        match expected.strip_prefix("$regex:") {
            Some(pattern) => match Regex::new(pattern) {
                Ok(re) => re.is_match(actual),
                Err(e) => {
                    tracing::warn!(pattern, error = %e, "bad $regex condition, treating as non-match");
                    false
                }
            },
            None => expected == actual,
        }
    };

    conditions
        .query
        .iter()
        .all(|(k, v)| one(v, query.get(k)))
        && conditions
            .headers
            .iter()
            .all(|(k, v)| one(v, headers.get(&k.to_lowercase())))
}

/// Executes one request's selected rules. Holds the per-request template
/// engine, the shared store, and the accumulating response draft and
/// rule-local scratch (`vars`).
pub struct ActionRunner<'a> {
    engine: &'a TemplateEngine,
    store: Arc<dyn StateStore>,
    session: &'a SessionContext,
    op: &'a OperationDescriptor,
    validator: &'a SchemaValidator,
    document_root: &'a Value,
    /// `req` and `session` bindings, built once by the pipeline.
    request_binding: Value,
    session_binding: Value,
    vars: Mutex<Map<String, Value>>,
    response: Mutex<Option<ResponseDraft>>,
}

impl<'a> ActionRunner<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        engine: &'a TemplateEngine,
        store: Arc<dyn StateStore>,
        session: &'a SessionContext,
        op: &'a OperationDescriptor,
        validator: &'a SchemaValidator,
        document_root: &'a Value,
        request_binding: Value,
    ) -> Self {
        let session_binding = serde_json::json!({
            "id": session.id(),
            "scope": if session.is_global() { "global" } else { "session" },
        });
        Self {
            engine,
            store,
            session,
            op,
            validator,
            document_root,
            request_binding,
            session_binding,
            vars: Mutex::new(Map::new()),
            response: Mutex::new(None),
        }
    }

    /// Run every selected rule in order, then hand back the final draft.
    pub async fn run_rules(&self, rules: &[&Rule]) -> Result<Option<ResponseDraft>, RuleFailure> {
        for rule in rules {
            self.run_actions(&rule.actions).await?;
        }
        Ok(self.response.lock().take())
    }

    /// Evaluation context for one expression: the enumerated bindings plus
    /// the session-scoped state view. Rebuilt per evaluation so `vars`
    /// snapshots stay current.
    fn eval_ctx(&self) -> EvalContext {
        let scoped = ScopedStore::new(
            self.store.clone(),
            self.session.key_prefix(self.session.scope()),
        );
        EvalContext::new()
            .with_binding("req", self.request_binding.clone())
            .with_binding("session", self.session_binding.clone())
            .with_binding("vars", Value::Object(self.vars.lock().clone()))
            .with_binding("now", Value::from(self.engine.now_ms()))
            .with_state(Arc::new(scoped))
    }

    fn scoped_key(&self, scope: Option<&str>, key: &str) -> String {
        let scope = scope.and_then(Scope::parse);
        self.session.namespaced(scope, key)
    }

    fn run_actions<'r>(&'r self, actions: &'r [Action]) -> BoxFuture<'r, Result<(), RuleFailure>> {
        Box::pin(async move {
            for action in actions {
                self.run_action(action).await?;
            }
            Ok(())
        })
    }

    async fn run_action(&self, action: &Action) -> Result<(), RuleFailure> {
        match action {
            Action::Respond(respond) => self.do_respond(respond).await,
            Action::StateSet(set) => self.do_set(set).await,
            Action::StatePatch(patch) => self.do_patch(patch).await,
            Action::StateIncrement(incr) => self.do_increment(incr).await,
            Action::StateDel(del) => self.do_del(del).await,
            Action::Delay(spec) => {
                let delay = spec.sample(self.engine.rng()).ok_or_else(|| {
                    RuleFailure::BadDelay(format!("{spec:?}"))
                })?;
                tokio::time::sleep(delay).await;
                Ok(())
            }
            Action::If(branch) => {
                let ctx = self.eval_ctx();
                let condition = self.engine.evaluate(&branch.when, &ctx).await?;
                let picked = if is_truthy(&condition) {
                    &branch.then
                } else {
                    &branch.otherwise
                };
                self.run_actions(picked).await
            }
            Action::Proxy(_) => {
                tracing::warn!(operation = %self.op.id, "proxy action is not implemented, skipping");
                Ok(())
            }
            Action::Emit(emit) => {
                let ctx = self.eval_ctx();
                let message = self.engine.render(&emit.message, &ctx).await;
                match emit.level {
                    EmitLevel::Info => tracing::info!(operation = %self.op.id, "{message}"),
                    EmitLevel::Warn => tracing::warn!(operation = %self.op.id, "{message}"),
                    EmitLevel::Error => tracing::error!(operation = %self.op.id, "{message}"),
                }
                Ok(())
            }
        }
    }

    async fn do_respond(&self, respond: &RespondAction) -> Result<(), RuleFailure> {
        let ctx = self.eval_ctx();
        let status = respond
            .status
            .or_else(|| self.op.first_success_status())
            .unwrap_or(200);

        let mut headers = Vec::with_capacity(respond.headers.len());
        for (name, value) in &respond.headers {
            headers.push((name.clone(), self.engine.render(value, &ctx).await));
        }

        let mut body = match &respond.body {
            Some(Value::String(s)) => Some(self.engine.render_value(s, &ctx).await),
            Some(tree) => Some(self.engine.process_template(tree, &ctx).await),
            None => None,
        };

        if let Some(schema) = &respond.schema {
            let schema = self.resolve_schema(schema);
            match &body {
                Some(rendered) => {
                    let issues = self
                        .validator
                        .validate(&format!("{}:respond", self.op.id), &schema, rendered, "/body")
                        .unwrap_or_default();
                    if !issues.is_empty() {
                        tracing::warn!(
                            operation = %self.op.id,
                            issues = issues.len(),
                            "respond body does not match its declared $schema"
                        );
                    }
                }
                None => {
                    let generator =
                        Generator::new(self.engine, self.document_root, GeneratorConfig::default());
                    body = Some(generator.generate(&schema));
                }
            }
        }

        *self.response.lock() = Some(ResponseDraft {
            status: Some(status),
            headers,
            body,
        });
        Ok(())
    }

    /// `$schema` may be inline or a `#/...` pointer into the spec document.
    fn resolve_schema(&self, schema: &Value) -> Value {
        if let Value::String(pointer) = schema {
            if let Some(target) = pointer
                .strip_prefix('#')
                .and_then(|p| self.document_root.pointer(p))
            {
                return target.clone();
            }
            return Value::Null;
        }
        schema.clone()
    }

    async fn do_set(&self, set: &StateSetAction) -> Result<(), RuleFailure> {
        let ctx = self.eval_ctx();
        let key = self.engine.render(&set.key, &ctx).await;
        let value = self.engine.render_tree(&set.value, &ctx).await;
        let full_key = self.scoped_key(set.scope.as_deref(), &key);
        self.store.set(&full_key, value, set.ttl).await?;
        Ok(())
    }

    async fn do_patch(&self, patch: &StatePatchAction) -> Result<(), RuleFailure> {
        let ctx = self.eval_ctx();
        let key = self.engine.render(&patch.key, &ctx).await;
        let value = self.engine.render_tree(&patch.value, &ctx).await;
        let full_key = self.scoped_key(patch.scope.as_deref(), &key);
        self.store.patch(&full_key, value).await?;
        Ok(())
    }

    async fn do_increment(&self, incr: &StateIncrementAction) -> Result<(), RuleFailure> {
        let ctx = self.eval_ctx();
        let key = self.engine.render(&incr.key, &ctx).await;
        let full_key = self.scoped_key(incr.scope.as_deref(), &key);
        let result = self.store.increment(&full_key, incr.by).await?;
        if let Some(name) = &incr.bind_as {
            self.vars.lock().insert(name.clone(), result);
        }
        Ok(())
    }

    async fn do_del(&self, del: &StateDelAction) -> Result<(), RuleFailure> {
        let ctx = self.eval_ctx();
        let key = self.engine.render(&del.key, &ctx).await;
        let full_key = self.scoped_key(del.scope.as_deref(), &key);
        self.store.del(&full_key).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use sandbox_oas::{OasDocument, OperationIndex};
    use sandbox_store::{MemoryStore, MemoryStoreConfig};
    use sandbox_template::TemplateConfig;

    fn index() -> OperationIndex {
        OperationIndex::build(
            &OasDocument::from_value(json!({
                "paths": {
                    "/users": { "post": { "operationId": "createUser",
                        "responses": { "201": {} } } },
                    "/users/{id}": { "get": { "operationId": "getUser",
                        "responses": { "200": {} } } },
                    "/counter": { "post": { "operationId": "incr",
                        "responses": { "200": {} } } }
                }
            }))
            .unwrap(),
        )
        .unwrap()
    }

    fn engine() -> TemplateEngine {
        TemplateEngine::new(&["seed", "req-1"], 1_700_000_000_000, TemplateConfig::default())
    }

    fn select_fixture() -> RuleEngine {
        RuleEngine::new(
            crate::load_rules_value(json!({ "scenarios": [
                { "when": { "operationId": "getUser" }, "do": [] },
                { "when": { "method": "GET", "path": "/users/{id}",
                            "match": { "headers": { "X-Variant": "$regex:^beta" } } },
                  "priority": 5, "do": [] },
                { "when": { "operationId": "getUser", "negate": true }, "do": [] }
            ]}))
            .unwrap(),
        )
    }

    #[test]
    fn selection_honors_operation_conditions_and_negate() {
        let idx = index();
        let rules = select_fixture();
        let op = idx.by_id("getUser").unwrap();

        let no_headers = HashMap::new();
        let query = HashMap::new();
        let selected = rules.select(op, &query, &no_headers);
        // plain selector matches; regex condition fails; negated selector misses
        assert_eq!(selected.len(), 1);
        assert!(selected[0].when.conditions.is_none());

        let mut beta = HashMap::new();
        beta.insert("x-variant".to_string(), "beta-7".to_string());
        let selected = rules.select(op, &query, &beta);
        assert_eq!(selected.len(), 2);
        // priority 5 fires first
        assert_eq!(selected[0].priority, 5);

        let other = idx.by_id("createUser").unwrap();
        let selected = rules.select(other, &query, &no_headers);
        // only the negated rule fires for a different operation
        assert_eq!(selected.len(), 1);
        assert!(selected[0].when.negate);
    }

    fn runner<'a>(
        eng: &'a TemplateEngine,
        store: &Arc<dyn StateStore>,
        session: &'a SessionContext,
        op: &'a OperationDescriptor,
        validator: &'a SchemaValidator,
        root: &'a Value,
        req: Value,
    ) -> ActionRunner<'a> {
        ActionRunner::new(eng, store.clone(), session, op, validator, root, req)
    }

    #[tokio::test]
    async fn stateful_create_then_respond_renders_request_data() {
        let idx = index();
        let op = idx.by_id("createUser").unwrap();
        let root = json!({});
        let validator = SchemaValidator::new(Arc::new(root.clone()));
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new(MemoryStoreConfig::default()));
        let session = SessionContext::new("s-1");
        let eng = engine();

        let req = json!({
            "method": "POST", "path": "/users",
            "headers": {}, "cookies": {}, "query": {}, "pathParams": {},
            "body": { "id": "42", "name": "Ada" }
        });
        let rules = crate::load_rules_value(json!({ "scenarios": [{
            "when": { "operationId": "createUser" },
            "do": [
                { "state.set": { "key": "user:{{req.body.id}}",
                                 "value": { "id": "{{req.body.id}}", "name": "{{req.body.name}}" } } },
                { "respond": { "status": 201,
                               "body": { "$template": true,
                                         "id": "{{req.body.id}}", "name": "{{req.body.name}}" } } }
            ]
        }]}))
        .unwrap();

        let r = runner(&eng, &store, &session, op, &validator, &root, req);
        let selected: Vec<&Rule> = rules.iter().collect();
        let draft = r.run_rules(&selected).await.unwrap().unwrap();

        assert_eq!(draft.status, Some(201));
        assert_eq!(draft.body, Some(json!({ "id": "42", "name": "Ada" })));
        assert_eq!(
            store.get("session:s-1:user:42").await.unwrap(),
            Some(json!({ "id": "42", "name": "Ada" }))
        );
    }

    #[tokio::test]
    async fn if_reads_state_written_earlier_in_the_same_request() {
        let idx = index();
        let op = idx.by_id("getUser").unwrap();
        let root = json!({});
        let validator = SchemaValidator::new(Arc::new(root.clone()));
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new(MemoryStoreConfig::default()));
        let session = SessionContext::new("s-1");
        store
            .set("session:s-1:user:42", json!({ "id": "42", "name": "Ada" }), None)
            .await
            .unwrap();
        let eng = engine();

        let req = json!({
            "method": "GET", "path": "/users/42",
            "headers": {}, "cookies": {}, "query": {},
            "pathParams": { "id": "42" }, "body": null
        });
        let rules = crate::load_rules_value(json!({ "scenarios": [{
            "when": { "operationId": "getUser" },
            "do": [ { "if": {
                "when": "state['user:' + req.pathParams.id]",
                "then": [ { "respond": { "status": 200,
                                         "body": "{{state['user:' + req.pathParams.id]}}" } } ],
                "else": [ { "respond": { "status": 404,
                                         "body": { "error": "User not found" } } } ]
            } } ]
        }]}))
        .unwrap();

        let r = runner(&eng, &store, &session, op, &validator, &root, req.clone());
        let selected: Vec<&Rule> = rules.iter().collect();
        let draft = r.run_rules(&selected).await.unwrap().unwrap();
        assert_eq!(draft.status, Some(200));
        assert_eq!(draft.body, Some(json!({ "id": "42", "name": "Ada" })));

        // unknown id takes the else branch
        let req_miss = json!({
            "method": "GET", "path": "/users/99",
            "headers": {}, "cookies": {}, "query": {},
            "pathParams": { "id": "99" }, "body": null
        });
        let r = runner(&eng, &store, &session, op, &validator, &root, req_miss);
        let draft = r.run_rules(&selected).await.unwrap().unwrap();
        assert_eq!(draft.status, Some(404));
        assert_eq!(draft.body, Some(json!({ "error": "User not found" })));
    }

    #[tokio::test]
    async fn increment_binds_vars_for_later_templates() {
        let idx = index();
        let op = idx.by_id("incr").unwrap();
        let root = json!({});
        let validator = SchemaValidator::new(Arc::new(root.clone()));
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new(MemoryStoreConfig::default()));
        let session = SessionContext::new("s-1");

        let rules = crate::load_rules_value(json!({ "scenarios": [{
            "when": { "operationId": "incr" },
            "do": [
                { "state.increment": { "key": "c", "by": 1, "as": "n" } },
                { "respond": { "body": { "$template": true, "count": "{{vars.n}}" } } }
            ]
        }]}))
        .unwrap();
        let selected: Vec<&Rule> = rules.iter().collect();
        let req = json!({ "method": "POST", "path": "/counter", "headers": {},
                          "cookies": {}, "query": {}, "pathParams": {}, "body": null });

        for expected in 1..=3 {
            let eng = engine();
            let r = runner(&eng, &store, &session, op, &validator, &root, req.clone());
            let draft = r.run_rules(&selected).await.unwrap().unwrap();
            assert_eq!(draft.status, Some(200));
            assert_eq!(draft.body, Some(json!({ "count": expected })));
        }
    }

    #[tokio::test]
    async fn respond_synthesizes_body_from_schema_when_absent() {
        let idx = index();
        let op = idx.by_id("getUser").unwrap();
        let root = json!({});
        let validator = SchemaValidator::new(Arc::new(root.clone()));
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new(MemoryStoreConfig::default()));
        let session = SessionContext::new("s-1");
        let eng = engine();

        let rules = crate::load_rules_value(json!({ "scenarios": [{
            "when": { "operationId": "getUser" },
            "do": [ { "respond": { "$schema": {
                "type": "object", "required": ["id"],
                "properties": { "id": { "type": "string", "format": "uuid" } }
            } } } ]
        }]}))
        .unwrap();
        let selected: Vec<&Rule> = rules.iter().collect();
        let req = json!({ "method": "GET", "path": "/users/1", "headers": {},
                          "cookies": {}, "query": {}, "pathParams": { "id": "1" }, "body": null });

        let r = runner(&eng, &store, &session, op, &validator, &root, req);
        let draft = r.run_rules(&selected).await.unwrap().unwrap();
        let body = draft.body.unwrap();
        assert!(body.get("id").and_then(Value::as_str).is_some());
    }

    #[tokio::test]
    async fn store_failure_aborts_the_action_list() {
        use async_trait::async_trait;
        use sandbox_store::StoreError;

        struct FailingStore;

        #[async_trait]
        impl StateStore for FailingStore {
            async fn get(&self, _: &str) -> Result<Option<Value>, StoreError> {
                Err(StoreError::Backend("down".to_string()))
            }
            async fn set(&self, _: &str, _: Value, _: Option<u64>) -> Result<(), StoreError> {
                Err(StoreError::Backend("down".to_string()))
            }
            async fn del(&self, _: &str) -> Result<(), StoreError> {
                Err(StoreError::Backend("down".to_string()))
            }
            async fn increment(&self, _: &str, _: f64) -> Result<Value, StoreError> {
                Err(StoreError::Backend("down".to_string()))
            }
            async fn patch(&self, _: &str, _: Value) -> Result<(), StoreError> {
                Err(StoreError::Backend("down".to_string()))
            }
            async fn close(&self) -> Result<(), StoreError> {
                Ok(())
            }
        }

        let idx = index();
        let op = idx.by_id("incr").unwrap();
        let root = json!({});
        let validator = SchemaValidator::new(Arc::new(root.clone()));
        let store: Arc<dyn StateStore> = Arc::new(FailingStore);
        let session = SessionContext::new("s-1");
        let eng = engine();

        let rules = crate::load_rules_value(json!({ "scenarios": [{
            "when": { "operationId": "incr" },
            "do": [
                { "state.increment": { "key": "c" } },
                { "respond": { "status": 200 } }
            ]
        }]}))
        .unwrap();
        let selected: Vec<&Rule> = rules.iter().collect();
        let req = json!({ "method": "POST", "path": "/counter", "headers": {},
                          "cookies": {}, "query": {}, "pathParams": {}, "body": null });

        let r = runner(&eng, &store, &session, op, &validator, &root, req);
        let err = r.run_rules(&selected).await.unwrap_err();
        assert!(matches!(err, RuleFailure::Store(_)));
    }
}
