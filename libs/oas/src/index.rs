use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::document::OasDocument;
use crate::error::SpecError;
use crate::matcher::PathMatcher;

const METHODS: [&str; 8] = [
    "get", "put", "post", "delete", "options", "head", "patch", "trace",
];

/// Where a parameter lives in the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamLocation {
    Path,
    Query,
    Header,
    Cookie,
}

impl ParamLocation {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "path" => Some(Self::Path),
            "query" => Some(Self::Query),
            "header" => Some(Self::Header),
            "cookie" => Some(Self::Cookie),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ParameterDescriptor {
    pub name: String,
    pub location: ParamLocation,
    pub required: bool,
    pub schema: Option<Value>,
}

/// One response entry, keyed in the parent map by literal status (`"201"`),
/// class pattern (`"2XX"`) or `"default"`.
#[derive(Debug, Clone, Default)]
pub struct ResponseDescriptor {
    pub headers: Map<String, Value>,
    /// media type -> schema (may be Null when the media entry has no schema)
    pub content: Vec<(String, Value)>,
}

impl ResponseDescriptor {
    /// Schema for `application/json`, if declared.
    pub fn json_schema(&self) -> Option<&Value> {
        self.content
            .iter()
            .find(|(mt, _)| mt == "application/json")
            .map(|(_, s)| s)
            .filter(|s| !s.is_null())
    }
}

/// Immutable per-operation descriptor, built once at load.
#[derive(Debug, Clone)]
pub struct OperationDescriptor {
    pub id: String,
    /// Uppercase HTTP method.
    pub method: String,
    /// Literal template form, e.g. `/pets/{id}`.
    pub path: String,
    pub matcher: PathMatcher,
    pub parameters: Vec<ParameterDescriptor>,
    pub request_body: Option<Value>,
    /// status / class / "default" -> descriptor, in document order.
    pub responses: Vec<(String, ResponseDescriptor)>,
}

impl OperationDescriptor {
    /// Response lookup precedence: exact status, class (`2XX`), `default`.
    pub fn response_for(&self, status: u16) -> Option<&ResponseDescriptor> {
        let exact = status.to_string();
        if let Some((_, r)) = self.responses.iter().find(|(k, _)| *k == exact) {
            return Some(r);
        }
        let class = format!("{}XX", status / 100);
        if let Some((_, r)) = self
            .responses
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(&class))
        {
            return Some(r);
        }
        self.responses
            .iter()
            .find(|(k, _)| k == "default")
            .map(|(_, r)| r)
    }

    /// The first declared 2xx status, used when a `respond` action omits one.
    /// Prefers `200`, then the numerically smallest literal 2xx, then `2XX`.
    pub fn first_success_status(&self) -> Option<u16> {
        let mut literals: Vec<u16> = self
            .responses
            .iter()
            .filter_map(|(k, _)| k.parse::<u16>().ok())
            .filter(|s| (200..300).contains(s))
            .collect();
        literals.sort_unstable();
        if literals.contains(&200) {
            return Some(200);
        }
        if let Some(first) = literals.first() {
            return Some(*first);
        }
        self.responses
            .iter()
            .any(|(k, _)| k.eq_ignore_ascii_case("2XX"))
            .then_some(200)
    }
}

/// The operation table: every `(path, method)` pair of the document,
/// compiled and indexed. Created during startup and never mutated.
#[derive(Debug)]
pub struct OperationIndex {
    operations: Vec<Arc<OperationDescriptor>>,
    by_id: HashMap<String, Arc<OperationDescriptor>>,
    root: Arc<Value>,
}

impl OperationIndex {
    pub fn build(doc: &OasDocument) -> Result<Self, SpecError> {
        let root = doc.root().clone();
        let paths = root
            .get("paths")
            .and_then(Value::as_object)
            .ok_or(SpecError::NoPaths)?;

        let mut operations = Vec::new();
        let mut by_id = HashMap::new();

        for (path, item) in paths {
            let Some(item) = item.as_object() else {
                continue;
            };
            let path_params = item
                .get("parameters")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();

            for method in METHODS {
                let Some(op) = item.get(method).and_then(Value::as_object) else {
                    continue;
                };

                let id = op
                    .get("operationId")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| synthesize_operation_id(method, path));

                let matcher = PathMatcher::compile(path)?;
                let parameters = merge_parameters(&path_params, op.get("parameters"));
                let request_body = select_request_body(op.get("requestBody"));
                let responses = collect_responses(op.get("responses"));

                let descriptor = Arc::new(OperationDescriptor {
                    id: id.clone(),
                    method: method.to_uppercase(),
                    path: path.clone(),
                    matcher,
                    parameters,
                    request_body,
                    responses,
                });

                if by_id.insert(id.clone(), descriptor.clone()).is_some() {
                    tracing::warn!(operation = %id, "duplicate operationId, last one wins");
                }
                operations.push(descriptor);
            }
        }

        tracing::debug!(operations = operations.len(), "built operation index");
        Ok(Self {
            operations,
            by_id,
            root,
        })
    }

    /// Dispatch `(method, path)` to the most specific matching operation and
    /// extract its path variables. Ambiguity policy: fewer capture variables
    /// first, longer literal template on ties.
    pub fn resolve(
        &self,
        method: &str,
        path: &str,
    ) -> Option<(Arc<OperationDescriptor>, HashMap<String, String>)> {
        let method = method.to_uppercase();
        self.operations
            .iter()
            .filter(|op| op.method == method)
            .filter_map(|op| op.matcher.capture(path).map(|vars| (op.clone(), vars)))
            .min_by_key(|(op, _)| {
                (
                    op.matcher.var_count(),
                    std::cmp::Reverse(op.matcher.literal_len()),
                )
            })
    }

    pub fn by_id(&self, id: &str) -> Option<&Arc<OperationDescriptor>> {
        self.by_id.get(id)
    }

    pub fn operations(&self) -> &[Arc<OperationDescriptor>] {
        &self.operations
    }

    /// The resolved document root, needed by the schema engine for the
    /// `$ref` remnants that survive cycle inlining.
    pub fn document_root(&self) -> &Arc<Value> {
        &self.root
    }
}

fn synthesize_operation_id(method: &str, path: &str) -> String {
    let sanitized: String = path
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("{method}{sanitized}")
}

/// Path-level and operation-level parameters merged; operation-level wins on
/// `(name, in)` collisions.
fn merge_parameters(path_level: &[Value], op_level: Option<&Value>) -> Vec<ParameterDescriptor> {
    let mut merged: Vec<ParameterDescriptor> = Vec::new();

    let mut push = |raw: &Value, replace: bool| {
        let Some(obj) = raw.as_object() else { return };
        let Some(name) = obj.get("name").and_then(Value::as_str) else {
            return;
        };
        let Some(location) = obj
            .get("in")
            .and_then(Value::as_str)
            .and_then(ParamLocation::parse)
        else {
            return;
        };
        let descriptor = ParameterDescriptor {
            name: name.to_string(),
            location,
            required: obj.get("required").and_then(Value::as_bool).unwrap_or(false)
                || location == ParamLocation::Path,
            schema: obj.get("schema").cloned(),
        };
        if let Some(existing) = merged
            .iter_mut()
            .find(|p| p.name == descriptor.name && p.location == descriptor.location)
        {
            if replace {
                *existing = descriptor;
            }
        } else {
            merged.push(descriptor);
        }
    };

    for raw in path_level {
        push(raw, false);
    }
    if let Some(Value::Array(op_params)) = op_level {
        for raw in op_params {
            push(raw, true);
        }
    }
    merged
}

/// Request body schema precedence: exact `application/json`, then a wildcard
/// media type, then the first declared entry.
fn select_request_body(request_body: Option<&Value>) -> Option<Value> {
    let content = request_body?.get("content")?.as_object()?;

    let pick = |key: &str| content.get(key).and_then(|m| m.get("schema")).cloned();

    if let Some(schema) = pick("application/json") {
        return Some(schema);
    }
    if let Some((_, media)) = content.iter().find(|(mt, _)| mt.contains('*')) {
        if let Some(schema) = media.get("schema") {
            return Some(schema.clone());
        }
    }
    content
        .iter()
        .next()
        .and_then(|(_, media)| media.get("schema"))
        .cloned()
}

fn collect_responses(responses: Option<&Value>) -> Vec<(String, ResponseDescriptor)> {
    let Some(map) = responses.and_then(Value::as_object) else {
        return Vec::new();
    };

    map.iter()
        .map(|(status, body)| {
            let headers = body
                .get("headers")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();
            let content = body
                .get("content")
                .and_then(Value::as_object)
                .map(|c| {
                    c.iter()
                        .map(|(mt, media)| {
                            (
                                mt.clone(),
                                media.get("schema").cloned().unwrap_or(Value::Null),
                            )
                        })
                        .collect()
                })
                .unwrap_or_default();
            (status.clone(), ResponseDescriptor { headers, content })
        })
        .collect()
}
