use std::sync::Arc;

use serde_json::Value;

use sandbox_oas::{OperationDescriptor, OperationIndex, ResponseDescriptor};
use sandbox_rules::{ActionRunner, ResponseDraft, RuleEngine};
use sandbox_schema::{Generator, GeneratorConfig, RequestSlots, SchemaValidator};
use sandbox_store::StateStore;
use sandbox_template::{TemplateConfig, TemplateEngine};

use crate::config::{PipelineConfig, ResponseValidation};
use crate::problem::{self, Problem, APPLICATION_PROBLEM_JSON};
use crate::request::{ParsedRequest, RawRequest};
use crate::session;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// The value-level response the transport adapter serializes.
#[derive(Debug, Clone)]
pub struct SandboxResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Option<Value>,
    pub content_type: Option<String>,
    pub request_id: String,
}

impl SandboxResponse {
    fn from_problem(problem: Problem, request_id: String) -> Self {
        Self {
            status: problem.status,
            headers: Vec::new(),
            body: serde_json::to_value(&problem).ok(),
            content_type: Some(APPLICATION_PROBLEM_JSON.to_string()),
            request_id,
        }
    }
}

/// Orchestrates one request end to end: parse, match, validate, run rules,
/// render, validate again, emit. Shared, read-only after startup apart from
/// the store.
pub struct SandboxEngine {
    index: Arc<OperationIndex>,
    rules: Arc<RuleEngine>,
    store: Arc<dyn StateStore>,
    validator: Arc<SchemaValidator>,
    config: PipelineConfig,
}

impl SandboxEngine {
    pub fn new(
        index: OperationIndex,
        rules: RuleEngine,
        store: Arc<dyn StateStore>,
        config: PipelineConfig,
    ) -> Self {
        let validator = SchemaValidator::new(index.document_root().clone());
        Self {
            index: Arc::new(index),
            rules: Arc::new(rules),
            store,
            validator: Arc::new(validator),
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    /// Never fails: every error becomes a problem document, and every
    /// egress carries the correlation id.
    pub async fn handle(&self, raw: RawRequest) -> SandboxResponse {
        let request_id = raw
            .request_id
            .clone()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| nanoid::nanoid!());

        let mut response = match self.process(&raw, &request_id).await {
            Ok(response) => response,
            Err(problem) => {
                tracing::warn!(
                    request_id = %request_id,
                    status = problem.status,
                    kind = %problem.type_url,
                    detail = %problem.detail,
                    "request ended with a problem document"
                );
                SandboxResponse::from_problem(problem, request_id.clone())
            }
        };

        response
            .headers
            .retain(|(name, _)| !name.eq_ignore_ascii_case(REQUEST_ID_HEADER));
        response
            .headers
            .push((REQUEST_ID_HEADER.to_string(), request_id));
        response
    }

    async fn process(
        &self,
        raw: &RawRequest,
        request_id: &str,
    ) -> Result<SandboxResponse, Problem> {
        let mut req = ParsedRequest::from_raw(raw);
        let session = session::extract_session(&req);

        // one engine per request: seed composed with the correlation id,
        // and `now` frozen for every template this request renders
        let engine = TemplateEngine::new(
            &[self.config.seed.as_str(), request_id],
            chrono::Utc::now().timestamp_millis(),
            TemplateConfig::default(),
        );

        self.inject_chaos(&engine, &req).await?;

        let Some((op, path_vars)) = self.index.resolve(&req.method, &req.path) else {
            tracing::info!(
                request_id = %request_id,
                method = %req.method,
                path = %req.path,
                category = "match-miss",
                "no operation matches"
            );
            return Err(problem::not_found(format!(
                "no operation matches {} {}",
                req.method, req.path
            ))
            .with_instance(req.path.clone()));
        };
        req.path_vars = path_vars;

        if self.config.validate_requests {
            self.check_request(&op, &req, request_id)?;
        }

        let selected = self.rules.select(&op, &req.query, &req.headers);
        tracing::debug!(
            request_id = %request_id,
            operation = %op.id,
            session = %session.id(),
            rules = selected.len(),
            "dispatching request"
        );

        let draft = if selected.is_empty() {
            None
        } else {
            let runner = ActionRunner::new(
                &engine,
                self.store.clone(),
                &session,
                &op,
                &self.validator,
                self.index.document_root(),
                req.to_binding(),
            );
            let run = runner.run_rules(&selected);
            match tokio::time::timeout(self.config.action_deadline, run).await {
                Ok(Ok(draft)) => draft,
                Ok(Err(failure)) => {
                    tracing::error!(
                        request_id = %request_id,
                        operation = %op.id,
                        category = "rule-failure",
                        error = %failure,
                        "action execution aborted"
                    );
                    return Err(problem::internal_error("rule execution failed")
                        .with_instance(req.path.clone()));
                }
                Err(_) => {
                    tracing::error!(
                        request_id = %request_id,
                        operation = %op.id,
                        category = "deadline",
                        "action execution exceeded its deadline"
                    );
                    return Err(problem::gateway_timeout("rule execution exceeded its deadline")
                        .with_instance(req.path.clone()));
                }
            }
        };

        let draft = match draft {
            Some(draft) => draft,
            None => self.default_response(&op, &engine),
        };

        let status = draft.status.unwrap_or(200);
        let body = draft.body.filter(|b| !b.is_null());

        if let Some(body) = &body {
            self.check_response(&op, status, body, request_id)?;
        }

        Ok(SandboxResponse {
            status,
            headers: draft.headers,
            body,
            content_type: None,
            request_id: request_id.to_string(),
        })
    }

    async fn inject_chaos(
        &self,
        engine: &TemplateEngine,
        req: &ParsedRequest,
    ) -> Result<(), Problem> {
        if let Some(latency) = &self.config.chaos_latency {
            if let Some(delay) = latency.sample(engine.rng()) {
                tokio::time::sleep(delay).await;
            }
        }
        if self.config.chaos_error_rate > 0.0 && engine.rng().chance(self.config.chaos_error_rate)
        {
            return Err(problem::internal_error("injected failure")
                .with_type("urn:sandbox:chaos")
                .with_instance(req.path.clone()));
        }
        Ok(())
    }

    fn check_request(
        &self,
        op: &OperationDescriptor,
        req: &ParsedRequest,
        request_id: &str,
    ) -> Result<(), Problem> {
        let slots = RequestSlots {
            path_vars: &req.path_vars,
            query: &req.query,
            headers: &req.headers,
            cookies: &req.cookies,
            body: req.body.as_ref(),
        };
        let issues = self.validator.validate_request(op, &slots).map_err(|e| {
            tracing::error!(request_id = %request_id, operation = %op.id, error = %e,
                            "request schema failed to compile");
            problem::internal_error("request schema failed to compile")
        })?;
        if issues.is_empty() {
            return Ok(());
        }
        tracing::info!(
            request_id = %request_id,
            operation = %op.id,
            category = "request-invalid",
            issues = issues.len(),
            "request failed validation"
        );
        Err(problem::bad_request("request does not conform to the specification")
            .with_instance(req.path.clone())
            .with_details(issues))
    }

    fn check_response(
        &self,
        op: &OperationDescriptor,
        status: u16,
        body: &Value,
        request_id: &str,
    ) -> Result<(), Problem> {
        if self.config.response_validation == ResponseValidation::Off {
            return Ok(());
        }
        let issues = self
            .validator
            .validate_response(op, status, body)
            .unwrap_or_default();
        if issues.is_empty() {
            return Ok(());
        }
        match self.config.response_validation {
            ResponseValidation::Strict => {
                tracing::error!(
                    request_id = %request_id,
                    operation = %op.id,
                    category = "response-invalid",
                    issues = issues.len(),
                    "response does not conform to the specification"
                );
                Err(
                    problem::internal_error("response does not conform to the specification")
                        .with_type("urn:sandbox:response-invalid")
                        .with_details(issues),
                )
            }
            ResponseValidation::Warn => {
                tracing::warn!(
                    request_id = %request_id,
                    operation = %op.id,
                    category = "response-invalid",
                    issues = issues.len(),
                    "response does not conform to the specification"
                );
                Ok(())
            }
            ResponseValidation::Off => Ok(()),
        }
    }

    /// No rule fired: pick the lexicographically first 2xx response
    /// descriptor (preferring `200`) and synthesize its JSON body.
    fn default_response(&self, op: &OperationDescriptor, engine: &TemplateEngine) -> ResponseDraft {
        let mut literals: Vec<(&String, &ResponseDescriptor)> = op
            .responses
            .iter()
            .filter(|(k, _)| {
                k.len() == 3 && k.starts_with('2') && k.chars().all(|c| c.is_ascii_digit())
            })
            .map(|(k, r)| (k, r))
            .collect();
        literals.sort_by(|a, b| a.0.cmp(b.0));

        let picked = literals
            .iter()
            .find(|(k, _)| k.as_str() == "200")
            .or_else(|| literals.first())
            .map(|(k, r)| (k.parse::<u16>().unwrap_or(200), *r))
            .or_else(|| {
                op.responses
                    .iter()
                    .find(|(k, _)| k.eq_ignore_ascii_case("2XX") || k == "default")
                    .map(|(_, r)| (200, r))
            });

        let Some((status, descriptor)) = picked else {
            return ResponseDraft {
                status: Some(200),
                headers: Vec::new(),
                body: None,
            };
        };

        let body = descriptor.json_schema().map(|schema| {
            Generator::new(engine, self.index.document_root(), GeneratorConfig::default())
                .generate(schema)
        });

        ResponseDraft {
            status: Some(status),
            headers: Vec::new(),
            body,
        }
    }
}
