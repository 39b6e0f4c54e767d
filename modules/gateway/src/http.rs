use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderName, HeaderValue, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use serde_json::Value;
use tower_http::{
    cors::CorsLayer,
    limit::RequestBodyLimitLayer,
    request_id::{MakeRequestId, PropagateRequestIdLayer, RequestId, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use crate::pipeline::{SandboxEngine, SandboxResponse, REQUEST_ID_HEADER};
use crate::request::RawRequest;

const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Mints a correlation id for requests that arrive without one. The
/// pipeline reads the resulting header back so logs, problem documents and
/// the echoed `X-Request-ID` all agree.
#[derive(Clone, Default)]
struct MakeCorrelationId;

impl MakeRequestId for MakeCorrelationId {
    fn make_request_id<B>(&mut self, _req: &Request<B>) -> Option<RequestId> {
        HeaderValue::from_str(&nanoid::nanoid!())
            .ok()
            .map(RequestId::new)
    }
}

#[derive(Debug, Clone)]
pub struct HttpOptions {
    pub cors_enabled: bool,
    pub request_timeout: Duration,
}

impl Default for HttpOptions {
    fn default() -> Self {
        Self {
            cors_enabled: false,
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// The transport adapter: every route falls through to the sandbox engine.
///
/// Middleware order, outermost to innermost: propagate request id, set
/// request id when missing, trace, timeout, CORS (optional), body limit.
pub fn router(engine: Arc<SandboxEngine>, options: &HttpOptions) -> Router {
    let x_request_id = HeaderName::from_static(REQUEST_ID_HEADER);

    let mut router = Router::new()
        .route("/healthz", axum::routing::get(|| async { "ok" }))
        .fallback(dispatch)
        .with_state(engine);

    router = router.layer(PropagateRequestIdLayer::new(x_request_id.clone()));
    router = router.layer(SetRequestIdLayer::new(x_request_id, MakeCorrelationId));
    router = router.layer(TraceLayer::new_for_http());
    router = router.layer(TimeoutLayer::new(options.request_timeout));
    if options.cors_enabled {
        router = router.layer(CorsLayer::permissive());
    }
    router = router.layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES));

    router
}

async fn dispatch(
    State(engine): State<Arc<SandboxEngine>>,
    req: axum::extract::Request,
) -> Response {
    let (parts, body) = req.into_parts();

    let request_id = parts
        .headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let headers = parts
        .headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();

    let body = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes.to_vec(),
        Err(e) => {
            tracing::warn!(error = %e, "failed to read request body");
            return StatusCode::PAYLOAD_TOO_LARGE.into_response();
        }
    };

    let raw = RawRequest {
        method: parts.method.as_str().to_string(),
        uri: parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| parts.uri.path().to_string()),
        headers,
        body,
        request_id,
    };

    render(engine.handle(raw).await)
}

fn render(response: SandboxResponse) -> Response {
    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::OK);

    let mut out = match (&response.body, &response.content_type) {
        (None, _) => status.into_response(),
        (Some(Value::String(text)), None) => {
            (status, text.clone()).into_response()
        }
        (Some(body), _) => (status, axum::Json(body.clone())).into_response(),
    };

    if let Some(content_type) = &response.content_type {
        if let Ok(value) = HeaderValue::from_str(content_type) {
            out.headers_mut().insert(header::CONTENT_TYPE, value);
        }
    }
    for (name, value) in &response.headers {
        let Ok(name) = name.parse::<HeaderName>() else {
            continue;
        };
        let Ok(value) = HeaderValue::from_str(value) else {
            continue;
        };
        out.headers_mut().insert(name, value);
    }
    out
}
