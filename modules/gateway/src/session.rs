use sandbox_store::SessionContext;

use crate::request::ParsedRequest;

pub const SESSION_HEADER: &str = "x-sandbox-session";
pub const SESSION_COOKIE: &str = "sandbox_session";

/// Resolution order: `X-Sandbox-Session` header, `sandbox_session` cookie,
/// the `Authorization` header used opaquely, then the `GLOBAL` sentinel.
pub fn extract_session(req: &ParsedRequest) -> SessionContext {
    if let Some(id) = req.headers.get(SESSION_HEADER).filter(|v| !v.is_empty()) {
        return SessionContext::new(id.clone());
    }
    if let Some(id) = req.cookies.get(SESSION_COOKIE).filter(|v| !v.is_empty()) {
        return SessionContext::new(id.clone());
    }
    if let Some(auth) = req.headers.get("authorization").filter(|v| !v.is_empty()) {
        return SessionContext::new(auth.clone());
    }
    SessionContext::global()
}
