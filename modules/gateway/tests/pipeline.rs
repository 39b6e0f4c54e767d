//! Router-level end-to-end scenarios: stateful create/read, counters with
//! TTL, session isolation, validation strictness, and the default
//! schema-generated response.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use sandbox_gateway::{
    HttpOptions, PipelineConfig, ResponseValidation, SandboxEngine, REQUEST_ID_HEADER,
};
use sandbox_oas::{OasDocument, OperationIndex};
use sandbox_rules::{load_rules_value, RuleEngine};
use sandbox_store::{MemoryStore, MemoryStoreConfig, StateStore};

fn users_spec() -> Value {
    json!({
        "openapi": "3.0.3",
        "paths": {
            "/users": {
                "post": {
                    "operationId": "createUser",
                    "requestBody": { "content": { "application/json": { "schema": {
                        "type": "object",
                        "required": ["id", "name"],
                        "properties": {
                            "id": { "type": "string" },
                            "name": { "type": "string" }
                        }
                    }}}},
                    "responses": { "201": { "description": "created" } }
                }
            },
            "/users/{id}": {
                "get": {
                    "operationId": "getUser",
                    "parameters": [
                        { "name": "id", "in": "path", "required": true,
                          "schema": { "type": "string" } }
                    ],
                    "responses": { "200": { "description": "found" } }
                }
            },
            "/counter": {
                "post": { "operationId": "incr",
                          "responses": { "200": { "description": "count" } } }
            },
            "/pets": {
                "get": {
                    "operationId": "listPets",
                    "responses": { "200": { "description": "pets", "content": {
                        "application/json": { "schema": {
                            "type": "array",
                            "example": [ { "id": 1, "name": "Rex" } ]
                        }}
                    }}}
                }
            },
            "/strict": {
                "get": {
                    "operationId": "strictOp",
                    "responses": { "200": { "description": "typed", "content": {
                        "application/json": { "schema": {
                            "type": "object",
                            "required": ["ok"],
                            "properties": { "ok": { "type": "boolean" } }
                        }}
                    }}}
                }
            }
        }
    })
}

fn users_rules() -> Value {
    json!({ "scenarios": [
        {
            "when": { "operationId": "createUser" },
            "do": [
                { "state.set": { "key": "user:{{req.body.id}}",
                                 "value": { "id": "{{req.body.id}}",
                                            "name": "{{req.body.name}}" } } },
                { "respond": { "status": 201, "body": {
                    "$template": true,
                    "id": "{{req.body.id}}",
                    "name": "{{req.body.name}}"
                } } }
            ]
        },
        {
            "when": { "operationId": "getUser" },
            "do": [ { "if": {
                "when": "state['user:' + req.pathParams.id]",
                "then": [ { "respond": { "status": 200,
                                         "body": "{{state['user:' + req.pathParams.id]}}" } } ],
                "else": [ { "respond": { "status": 404,
                                         "body": { "error": "User not found" } } } ]
            } } ]
        },
        {
            "when": { "operationId": "incr" },
            "do": [
                { "state.increment": { "key": "c", "by": 1, "as": "n" } },
                { "respond": { "body": { "$template": true, "count": "{{vars.n}}" } } }
            ]
        },
        {
            "when": { "operationId": "strictOp" },
            "do": [ { "respond": { "status": 200, "body": { "ok": "not-a-boolean" } } } ]
        }
    ]})
}

fn build(mode: ResponseValidation) -> (axum::Router, Arc<dyn StateStore>) {
    let index = OperationIndex::build(&OasDocument::from_value(users_spec()).unwrap()).unwrap();
    let rules = RuleEngine::new(load_rules_value(users_rules()).unwrap());
    let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new(MemoryStoreConfig::default()));
    let engine = SandboxEngine::new(
        index,
        rules,
        store.clone(),
        PipelineConfig {
            response_validation: mode,
            ..Default::default()
        },
    );
    (
        sandbox_gateway::router(Arc::new(engine), &HttpOptions::default()),
        store,
    )
}

async fn send(router: &axum::Router, req: Request<Body>) -> (StatusCode, Value, Option<String>) {
    let resp = router.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let request_id = resp
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::String(
            String::from_utf8_lossy(&bytes).into_owned(),
        ))
    };
    (status, body, request_id)
}

fn json_request(method: &str, uri: &str, session: Option<&str>, body: Option<Value>) -> Request<Body> {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json");
    if let Some(sid) = session {
        builder = builder.header("x-sandbox-session", sid);
    }
    let body = match body {
        Some(v) => Body::from(serde_json::to_vec(&v).unwrap()),
        None => Body::empty(),
    };
    builder.body(body).unwrap()
}

#[tokio::test]
async fn stateful_create_then_read_roundtrip() {
    let (router, _) = build(ResponseValidation::Warn);

    let (status, body, rid) = send(
        &router,
        json_request(
            "POST",
            "/users",
            Some("s-1"),
            Some(json!({ "id": "42", "name": "Ada" })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body, json!({ "id": "42", "name": "Ada" }));
    assert!(rid.is_some(), "every egress carries X-Request-ID");

    let (status, body, _) = send(
        &router,
        json_request("GET", "/users/42", Some("s-1"), None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "id": "42", "name": "Ada" }));

    let (status, body, _) = send(
        &router,
        json_request("GET", "/users/99", Some("s-1"), None),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body, json!({ "error": "User not found" }));
}

#[tokio::test]
async fn counter_increments_and_expires_with_ttl() {
    let (router, store) = build(ResponseValidation::Warn);

    for expected in 1..=3 {
        let (status, body, _) =
            send(&router, json_request("POST", "/counter", None, None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "count": expected }));
    }

    // re-arm the same key with a one-second TTL; the next hit starts over
    store
        .set("global:c", json!(3), Some(1))
        .await
        .unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(1300)).await;

    let (_, body, _) = send(&router, json_request("POST", "/counter", None, None)).await;
    assert_eq!(body, json!({ "count": 1 }));
}

#[tokio::test]
async fn sessions_are_isolated_and_global_is_its_own_scope() {
    let (router, store) = build(ResponseValidation::Warn);

    for (session, name) in [(Some("a"), "from-a"), (Some("b"), "from-b"), (None, "anon")] {
        let (status, _, _) = send(
            &router,
            json_request(
                "POST",
                "/users",
                session,
                Some(json!({ "id": "k", "name": name })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
    }

    assert_eq!(
        store.get("session:a:user:k").await.unwrap().unwrap()["name"],
        json!("from-a")
    );
    assert_eq!(
        store.get("session:b:user:k").await.unwrap().unwrap()["name"],
        json!("from-b")
    );
    assert_eq!(
        store.get("global:user:k").await.unwrap().unwrap()["name"],
        json!("anon")
    );

    // reads stay inside the caller's scope
    let (status, body, _) = send(&router, json_request("GET", "/users/k", Some("a"), None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["name"], json!("from-a"));
}

#[tokio::test]
async fn unmatched_requests_yield_problem_documents() {
    let (router, _) = build(ResponseValidation::Warn);
    let (status, body, rid) = send(&router, json_request("GET", "/nope", None, None)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["title"], json!("Not Found"));
    assert_eq!(body["status"], json!(404));
    assert!(body.get("type").is_some());
    assert!(rid.is_some());
}

#[tokio::test]
async fn invalid_request_bodies_are_rejected_with_details() {
    let (router, _) = build(ResponseValidation::Warn);
    let (status, body, _) = send(
        &router,
        json_request("POST", "/users", None, Some(json!({ "id": "42" }))),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["title"], json!("Bad Request"));
    let details = body["details"].as_array().unwrap();
    assert!(!details.is_empty());
    assert!(details[0]["instancePath"]
        .as_str()
        .unwrap()
        .starts_with("/body"));
}

#[tokio::test]
async fn default_response_uses_the_schema_example() {
    let (router, _) = build(ResponseValidation::Warn);
    let (status, body, _) = send(&router, json_request("GET", "/pets", None, None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!([ { "id": 1, "name": "Rex" } ]));
}

#[tokio::test]
async fn strict_mode_replaces_invalid_responses() {
    let (router, _) = build(ResponseValidation::Strict);
    let (status, body, _) = send(&router, json_request("GET", "/strict", None, None)).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["type"], json!("urn:sandbox:response-invalid"));
    assert!(body["details"].as_array().is_some());
}

#[tokio::test]
async fn warn_mode_sends_the_response_as_is() {
    let (router, _) = build(ResponseValidation::Warn);
    let (status, body, _) = send(&router, json_request("GET", "/strict", None, None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "ok": "not-a-boolean" }));
}

#[tokio::test]
async fn chaos_error_rate_injects_problem_documents() {
    let index = OperationIndex::build(&OasDocument::from_value(users_spec()).unwrap()).unwrap();
    let rules = RuleEngine::new(load_rules_value(users_rules()).unwrap());
    let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new(MemoryStoreConfig::default()));
    let engine = SandboxEngine::new(
        index,
        rules,
        store,
        PipelineConfig {
            chaos_error_rate: 1.0,
            ..Default::default()
        },
    );
    let router = sandbox_gateway::router(Arc::new(engine), &HttpOptions::default());

    let (status, body, _) = send(&router, json_request("GET", "/pets", None, None)).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["type"], json!("urn:sandbox:chaos"));
}

#[tokio::test]
async fn delay_and_emit_actions_run_before_respond() {
    let index = OperationIndex::build(&OasDocument::from_value(users_spec()).unwrap()).unwrap();
    let rules = RuleEngine::new(
        load_rules_value(json!({ "scenarios": [{
            "when": { "operationId": "listPets" },
            "do": [
                { "delay": "40ms" },
                { "emit": { "level": "info", "message": "serving {{req.path}}" } },
                { "respond": { "status": 200, "body": { "delayed": true } } }
            ]
        }]}))
        .unwrap(),
    );
    let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new(MemoryStoreConfig::default()));
    let engine = SandboxEngine::new(index, rules, store, PipelineConfig::default());
    let router = sandbox_gateway::router(Arc::new(engine), &HttpOptions::default());

    let started = std::time::Instant::now();
    let (status, body, _) = send(&router, json_request("GET", "/pets", None, None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "delayed": true }));
    assert!(started.elapsed() >= std::time::Duration::from_millis(40));
}

#[tokio::test]
async fn incoming_request_id_is_propagated() {
    let (router, _) = build(ResponseValidation::Warn);
    let req = Request::builder()
        .method("GET")
        .uri("/pets")
        .header("x-request-id", "trace-me-123")
        .body(Body::empty())
        .unwrap();
    let (_, _, rid) = send(&router, req).await;
    assert_eq!(rid.as_deref(), Some("trace-me-123"));
}
