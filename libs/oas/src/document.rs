use std::path::Path;
use std::sync::Arc;

use serde_json::Value;

use crate::error::SpecError;

/// A parsed OpenAPI 3.0/3.1 document with local `$ref` pointers inlined.
///
/// Inlining deep-clones the referenced subtree into place. A reference that
/// is revisited while it is still being expanded (a cycle, common for
/// recursive schemas) is left in the tree as-is; the schema engine breaks
/// those cycles itself at validation/generation time.
#[derive(Debug, Clone)]
pub struct OasDocument {
    root: Arc<Value>,
}

impl OasDocument {
    /// Load a document from a file path. `.json`, `.yaml` and `.yml`
    /// extensions pick the parser; anything else tries JSON first and falls
    /// back to YAML.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, SpecError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| SpecError::Io {
            path: path.display().to_string(),
            source,
        })?;

        let value = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => parse_json(&raw)?,
            Some("yaml") | Some("yml") => parse_yaml(&raw)?,
            _ => parse_json(&raw).or_else(|_| parse_yaml(&raw))?,
        };
        Self::from_value(value)
    }

    /// Build a document from an in-memory value, inlining local references.
    pub fn from_value(value: Value) -> Result<Self, SpecError> {
        let mut stack = Vec::new();
        let resolved = inline_refs(&value, &value, &mut stack)?;
        Ok(Self {
            root: Arc::new(resolved),
        })
    }

    /// The resolved document root.
    pub fn root(&self) -> &Arc<Value> {
        &self.root
    }
}

fn parse_json(raw: &str) -> Result<Value, SpecError> {
    serde_json::from_str(raw).map_err(|e| SpecError::Parse(e.to_string()))
}

fn parse_yaml(raw: &str) -> Result<Value, SpecError> {
    serde_yaml::from_str(raw).map_err(|e| SpecError::Parse(e.to_string()))
}

/// One pass over the tree, replacing `{"$ref": "#/..."}` nodes by a deep
/// clone of their target. `stack` holds the pointers currently being
/// expanded; hitting one again means a cycle, and the `$ref` node is kept
/// verbatim in that case.
fn inline_refs(node: &Value, root: &Value, stack: &mut Vec<String>) -> Result<Value, SpecError> {
    match node {
        Value::Object(map) => {
            if let Some(Value::String(target)) = map.get("$ref") {
                if !target.starts_with("#/") {
                    return Err(SpecError::NonLocalRef(target.clone()));
                }
                if stack.iter().any(|seen| seen == target) {
                    return Ok(node.clone());
                }
                let pointer = &target[1..];
                let resolved = root
                    .pointer(pointer)
                    .ok_or_else(|| SpecError::DanglingRef(target.clone()))?
                    .clone();
                stack.push(target.clone());
                let inlined = inline_refs(&resolved, root, stack);
                stack.pop();
                return inlined;
            }
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), inline_refs(v, root, stack)?);
            }
            Ok(Value::Object(out))
        }
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(inline_refs(item, root, stack)?);
            }
            Ok(Value::Array(out))
        }
        other => Ok(other.clone()),
    }
}
