use std::collections::HashMap;

use serde_json::{json, Value};

/// The transport-independent shape of one incoming request, before parsing.
#[derive(Debug, Clone, Default)]
pub struct RawRequest {
    pub method: String,
    /// Path plus optional query string, still percent-encoded.
    pub uri: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    /// Correlation id assigned upstream (e.g. by request-id middleware).
    pub request_id: Option<String>,
}

/// Fully parsed request: decoded path, case-folded headers, parsed cookies,
/// first-value-wins query map, decoded body.
#[derive(Debug, Clone)]
pub struct ParsedRequest {
    pub method: String,
    pub path: String,
    pub headers: HashMap<String, String>,
    pub cookies: HashMap<String, String>,
    pub query: HashMap<String, String>,
    pub body: Option<Value>,
    pub path_vars: HashMap<String, String>,
}

impl ParsedRequest {
    pub fn from_raw(raw: &RawRequest) -> Self {
        let (path_part, query_part) = match raw.uri.split_once('?') {
            Some((p, q)) => (p, Some(q)),
            None => (raw.uri.as_str(), None),
        };
        let path = urlencoding::decode(path_part)
            .map(|s| s.into_owned())
            .unwrap_or_else(|_| path_part.to_string());

        let mut headers = HashMap::with_capacity(raw.headers.len());
        for (name, value) in &raw.headers {
            headers
                .entry(name.to_lowercase())
                .or_insert_with(|| value.clone());
        }

        let cookies = headers
            .get("cookie")
            .map(|raw| parse_cookies(raw))
            .unwrap_or_default();

        let query = query_part.map(parse_query).unwrap_or_default();

        let body = parse_body(&raw.body, headers.get("content-type").map(String::as_str));

        Self {
            method: raw.method.to_uppercase(),
            path,
            headers,
            cookies,
            query,
            body,
            path_vars: HashMap::new(),
        }
    }

    /// The `req` binding visible to template expressions.
    pub fn to_binding(&self) -> Value {
        json!({
            "method": self.method,
            "path": self.path,
            "headers": self.headers,
            "cookies": self.cookies,
            "query": self.query,
            "pathParams": self.path_vars,
            "body": self.body.clone().unwrap_or(Value::Null),
        })
    }
}

/// `a=1&b=2`; repeated keys keep the first value; keys and values are
/// percent-decoded, `+` reads as space.
fn parse_query(raw: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for pair in raw.split('&') {
        if pair.is_empty() {
            continue;
        }
        let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
        let decode = |s: &str| {
            urlencoding::decode(&s.replace('+', " "))
                .map(|c| c.into_owned())
                .unwrap_or_else(|_| s.to_string())
        };
        out.entry(decode(k)).or_insert_with(|| decode(v));
    }
    out
}

/// `name=value; other=x` pairs from a Cookie header.
fn parse_cookies(raw: &str) -> HashMap<String, String> {
    raw.split(';')
        .filter_map(|part| {
            let (k, v) = part.trim().split_once('=')?;
            Some((k.trim().to_string(), v.trim().to_string()))
        })
        .collect()
}

/// JSON when the content type says so (or when absent and the bytes parse);
/// anything else is carried as an opaque string.
fn parse_body(bytes: &[u8], content_type: Option<&str>) -> Option<Value> {
    if bytes.is_empty() {
        return None;
    }
    let is_json = content_type
        .map(|ct| ct.contains("json"))
        .unwrap_or(true);
    if is_json {
        if let Ok(value) = serde_json::from_slice(bytes) {
            return Some(value);
        }
    }
    Some(Value::String(
        String::from_utf8_lossy(bytes).into_owned(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn raw(method: &str, uri: &str, headers: &[(&str, &str)], body: &[u8]) -> RawRequest {
        RawRequest {
            method: method.to_string(),
            uri: uri.to_string(),
            headers: headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            body: body.to_vec(),
            request_id: None,
        }
    }

    #[test]
    fn query_first_value_wins_and_decodes() {
        let req = ParsedRequest::from_raw(&raw(
            "get",
            "/pets?page=1&page=2&name=mr%20cat&tag=a+b",
            &[],
            b"",
        ));
        assert_eq!(req.method, "GET");
        assert_eq!(req.path, "/pets");
        assert_eq!(req.query["page"], "1");
        assert_eq!(req.query["name"], "mr cat");
        assert_eq!(req.query["tag"], "a b");
    }

    #[test]
    fn headers_are_case_folded_and_cookies_parsed() {
        let req = ParsedRequest::from_raw(&raw(
            "GET",
            "/",
            &[
                ("X-Trace", "abc"),
                ("Cookie", "sandbox_session=s1; theme=dark"),
            ],
            b"",
        ));
        assert_eq!(req.headers["x-trace"], "abc");
        assert_eq!(req.cookies["sandbox_session"], "s1");
        assert_eq!(req.cookies["theme"], "dark");
    }

    #[test]
    fn json_body_parses_and_raw_bodies_stay_opaque() {
        let req = ParsedRequest::from_raw(&raw(
            "POST",
            "/users",
            &[("Content-Type", "application/json")],
            br#"{"id":"42"}"#,
        ));
        assert_eq!(req.body, Some(serde_json::json!({ "id": "42" })));

        let req = ParsedRequest::from_raw(&raw(
            "POST",
            "/blob",
            &[("Content-Type", "text/plain")],
            b"hello",
        ));
        assert_eq!(req.body, Some(Value::String("hello".to_string())));
    }

    #[test]
    fn percent_encoded_paths_decode_before_matching() {
        let req = ParsedRequest::from_raw(&raw("GET", "/pets/mr%20cat", &[], b""));
        assert_eq!(req.path, "/pets/mr cat");
    }
}
