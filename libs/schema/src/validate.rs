use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use jsonschema::{Draft, JSONSchema};
use serde::Serialize;
use serde_json::{Map, Value};

use sandbox_oas::{OperationDescriptor, ParamLocation};

use crate::SchemaError;

/// One flattened validation error.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ValidationIssue {
    pub instance_path: String,
    pub schema_path: String,
    pub keyword: String,
    pub message: String,
    /// The failing keyword's own parameters, e.g. `{"limit": 5}` for a
    /// `maxLength` violation.
    pub params: Value,
}

/// The request parts a validator looks at, already parsed by the pipeline.
#[derive(Debug)]
pub struct RequestSlots<'a> {
    pub path_vars: &'a HashMap<String, String>,
    pub query: &'a HashMap<String, String>,
    pub headers: &'a HashMap<String, String>,
    pub cookies: &'a HashMap<String, String>,
    pub body: Option<&'a Value>,
}

struct Compiled {
    validator: JSONSchema,
    /// The normalized schema the validator was built from; errors resolve
    /// their `schema_path` against it to recover keyword parameters.
    schema: Value,
}

/// Validator cache: a schema is compiled once per identifier and reused for
/// the life of the process.
pub struct SchemaValidator {
    cache: DashMap<String, Arc<Compiled>>,
    /// Document root; lets compiled schemas resolve `$ref` remnants that
    /// survive cycle-aware inlining.
    root: Arc<Value>,
}

impl SchemaValidator {
    pub fn new(root: Arc<Value>) -> Self {
        Self {
            cache: DashMap::new(),
            root,
        }
    }

    fn compiled(&self, id: &str, schema: &Value) -> Result<Arc<Compiled>, SchemaError> {
        if let Some(hit) = self.cache.get(id) {
            return Ok(hit.value().clone());
        }
        let mut prepared = normalize(schema);
        attach_components(&mut prepared, &self.root);

        let validator = JSONSchema::options()
            .with_draft(Draft::Draft7)
            .compile(&prepared)
            .map_err(|e| SchemaError::Compile(e.to_string()))?;

        let compiled = Arc::new(Compiled {
            validator,
            schema: prepared,
        });
        self.cache.insert(id.to_string(), compiled.clone());
        Ok(compiled)
    }

    /// Validate `value` against `schema`, caching the compilation under
    /// `id`. Paths in the returned issues are prefixed with `prefix`.
    pub fn validate(
        &self,
        id: &str,
        schema: &Value,
        value: &Value,
        prefix: &str,
    ) -> Result<Vec<ValidationIssue>, SchemaError> {
        let compiled = self.compiled(id, schema)?;
        let issues = match compiled.validator.validate(value) {
            Ok(()) => Vec::new(),
            Err(errors) => errors
                .map(|e| {
                    let schema_path = e.schema_path.to_string();
                    let keyword = keyword_of(&schema_path);
                    let params = keyword_params(&keyword, compiled.schema.pointer(&schema_path));
                    ValidationIssue {
                        instance_path: format!("{prefix}{}", e.instance_path),
                        keyword,
                        schema_path,
                        message: e.to_string(),
                        params,
                    }
                })
                .collect(),
        };
        Ok(issues)
    }

    /// Validate every declared parameter and the body of a request.
    /// Issue paths are prefixed `/path/...`, `/query/...`, `/headers/...`,
    /// `/cookies/...` or `/body`.
    pub fn validate_request(
        &self,
        op: &OperationDescriptor,
        slots: &RequestSlots<'_>,
    ) -> Result<Vec<ValidationIssue>, SchemaError> {
        let mut issues = Vec::new();

        for param in &op.parameters {
            let (slot, raw) = match param.location {
                ParamLocation::Path => ("path", slots.path_vars.get(&param.name)),
                ParamLocation::Query => ("query", slots.query.get(&param.name)),
                ParamLocation::Header => ("headers", slots.headers.get(&param.name.to_lowercase())),
                ParamLocation::Cookie => ("cookies", slots.cookies.get(&param.name)),
            };
            let prefix = format!("/{slot}/{}", param.name);

            let Some(raw) = raw else {
                if param.required {
                    issues.push(ValidationIssue {
                        instance_path: prefix,
                        schema_path: "/required".to_string(),
                        keyword: "required".to_string(),
                        message: format!("missing required {} parameter '{}'", slot, param.name),
                        params: serde_json::json!({ "missingProperty": param.name }),
                    });
                }
                continue;
            };

            let Some(schema) = &param.schema else {
                continue;
            };
            let value = coerce_scalar(raw, schema);
            let id = format!("{}:{}:{}", op.id, slot, param.name);
            issues.extend(self.validate(&id, schema, &value, &prefix)?);
        }

        if let Some(schema) = &op.request_body {
            match slots.body {
                Some(body) => {
                    let id = format!("{}:body", op.id);
                    issues.extend(self.validate(&id, schema, body, "/body")?);
                }
                None => issues.push(ValidationIssue {
                    instance_path: "/body".to_string(),
                    schema_path: "/required".to_string(),
                    keyword: "required".to_string(),
                    message: "missing request body".to_string(),
                    params: serde_json::json!({ "missingProperty": "body" }),
                }),
            }
        }

        Ok(issues)
    }

    /// Validate a rendered response body against the operation's declared
    /// schema for `status` (exact, class, then `default`). An operation or
    /// status with no JSON schema validates vacuously.
    pub fn validate_response(
        &self,
        op: &OperationDescriptor,
        status: u16,
        body: &Value,
    ) -> Result<Vec<ValidationIssue>, SchemaError> {
        let Some(schema) = op.response_for(status).and_then(|r| r.json_schema()) else {
            return Ok(Vec::new());
        };
        let id = format!("{}:response:{status}", op.id);
        self.validate(&id, schema, body, "/body")
    }
}

/// The failing keyword's parameters, recovered from the schema value its
/// `schema_path` points at. The bounds family collapses onto `limit` the
/// way ajv reports it; anything else keeps the keyword as the key.
fn keyword_params(keyword: &str, constraint: Option<&Value>) -> Value {
    let Some(constraint) = constraint else {
        return Value::Object(Map::new());
    };
    let key = match keyword {
        "minimum" | "maximum" | "exclusiveMinimum" | "exclusiveMaximum" | "minLength"
        | "maxLength" | "minItems" | "maxItems" | "minProperties" | "maxProperties" => "limit",
        "enum" => "allowedValues",
        other => other,
    };
    let mut params = Map::new();
    params.insert(key.to_string(), constraint.clone());
    Value::Object(params)
}

/// Last non-index segment of the schema path, e.g.
/// `/properties/age/minimum` → `minimum`.
fn keyword_of(schema_path: &str) -> String {
    schema_path
        .rsplit('/')
        .find(|seg| !seg.is_empty() && seg.parse::<usize>().is_err())
        .unwrap_or("schema")
        .to_string()
}

/// Rewrite OpenAPI-isms into draft-7 shapes. `nullable: true` widens the
/// declared type with `"null"`; everything unknown (formats like `int32`,
/// `example`, vendor extensions) passes through as annotations the
/// validator ignores.
pub(crate) fn normalize(schema: &Value) -> Value {
    match schema {
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            let nullable = matches!(map.get("nullable"), Some(Value::Bool(true)));
            for (k, v) in map {
                if k == "nullable" {
                    continue;
                }
                if nullable && k == "type" {
                    let widened = match v {
                        Value::String(t) if t != "null" => {
                            Value::Array(vec![v.clone(), Value::String("null".into())])
                        }
                        Value::Array(types) => {
                            let mut types = types.clone();
                            if !types.iter().any(|t| t == "null") {
                                types.push(Value::String("null".into()));
                            }
                            Value::Array(types)
                        }
                        other => other.clone(),
                    };
                    out.insert(k.clone(), widened);
                    continue;
                }
                out.insert(k.clone(), normalize(v));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(normalize).collect()),
        other => other.clone(),
    }
}

/// Make `#/components/...` references inside a subschema resolvable by
/// grafting the document's components onto the compiled root.
fn attach_components(schema: &mut Value, root: &Value) {
    let Some(components) = root.get("components") else {
        return;
    };
    if let Value::Object(map) = schema {
        if !map.contains_key("components") {
            map.insert("components".to_string(), components.clone());
        }
    }
}

/// Coerce a string-valued slot (query/header/cookie/path) toward the type
/// its schema declares; anything unparseable stays a string and lets the
/// validator report it.
pub fn coerce_scalar(raw: &str, schema: &Value) -> Value {
    let declared = schema.get("type").and_then(Value::as_str).unwrap_or("string");
    match declared {
        "integer" => raw
            .parse::<i64>()
            .map(Value::from)
            .unwrap_or_else(|_| Value::String(raw.to_string())),
        "number" => raw
            .parse::<f64>()
            .ok()
            .and_then(|f| serde_json::Number::from_f64(f).map(Value::Number))
            .unwrap_or_else(|| Value::String(raw.to_string())),
        "boolean" => match raw {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            _ => Value::String(raw.to_string()),
        },
        _ => Value::String(raw.to_string()),
    }
}
