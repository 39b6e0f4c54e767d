use std::path::Path;

use serde_json::Value;

use crate::model::{Action, DelaySpec, Rule, Selector};
use crate::RuleError;

/// Load a rules document from a file (YAML or JSON). The document must have
/// a top-level `scenarios` array; each entry needs `when` and `do`.
pub fn load_rules_file(path: impl AsRef<Path>) -> Result<Vec<Rule>, RuleError> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path).map_err(|source| RuleError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let value: Value = match path.extension().and_then(|e| e.to_str()) {
        Some("json") => serde_json::from_str(&raw).map_err(|e| RuleError::Parse(e.to_string()))?,
        _ => serde_yaml::from_str(&raw).map_err(|e| RuleError::Parse(e.to_string()))?,
    };
    load_rules_value(value)
}

/// Normalize an in-memory rules document into the sorted rule list:
/// `(priority DESC, source order ASC)`, stable.
pub fn load_rules_value(document: Value) -> Result<Vec<Rule>, RuleError> {
    let scenarios = document
        .get("scenarios")
        .and_then(Value::as_array)
        .ok_or(RuleError::NoScenarios)?;

    let mut rules = Vec::with_capacity(scenarios.len());
    for (index, raw) in scenarios.iter().enumerate() {
        let entry = raw
            .as_object()
            .ok_or_else(|| RuleError::Invalid {
                index,
                reason: "scenario must be a mapping".to_string(),
            })?;
        if !entry.contains_key("when") {
            return Err(RuleError::MissingKey { index, key: "when" });
        }
        if !entry.contains_key("do") {
            return Err(RuleError::MissingKey { index, key: "do" });
        }

        let mut rule: Rule =
            serde_json::from_value(raw.clone()).map_err(|e| RuleError::Invalid {
                index,
                reason: e.to_string(),
            })?;
        rule.source_index = index;
        validate_selector(index, &rule.when)?;
        validate_actions(index, &rule.actions)?;
        rules.push(rule);
    }

    rules.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then(a.source_index.cmp(&b.source_index))
    });
    tracing::debug!(rules = rules.len(), "loaded rule set");
    Ok(rules)
}

fn validate_selector(index: usize, selector: &Selector) -> Result<(), RuleError> {
    let has_op = selector.operation_id.is_some();
    let has_pair = selector.method.is_some() && selector.path.is_some();
    if !has_op && !has_pair {
        return Err(RuleError::Invalid {
            index,
            reason: "selector needs 'operationId' or both 'method' and 'path'".to_string(),
        });
    }
    Ok(())
}

/// Delay specs and regex conditions are cheap to check up front; a typo
/// should fail the load, not a request.
fn validate_actions(index: usize, actions: &[Action]) -> Result<(), RuleError> {
    for action in actions {
        match action {
            Action::Delay(spec) => {
                if spec.parse().is_none() {
                    let text = match spec {
                        DelaySpec::Text(t) => t.clone(),
                        DelaySpec::Millis(ms) => ms.to_string(),
                    };
                    return Err(RuleError::Invalid {
                        index,
                        reason: format!("bad delay spec '{text}'"),
                    });
                }
            }
            Action::If(branch) => {
                validate_actions(index, &branch.then)?;
                validate_actions(index, &branch.otherwise)?;
            }
            _ => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn loads_and_sorts_by_priority_then_source_order() {
        let rules = load_rules_value(json!({ "scenarios": [
            { "when": { "operationId": "a" }, "do": [], "priority": 0 },
            { "when": { "operationId": "b" }, "do": [], "priority": 5 },
            { "when": { "operationId": "c" }, "do": [] },
            { "when": { "operationId": "d" }, "do": [], "priority": 5 }
        ]}))
        .unwrap();

        let ids: Vec<&str> = rules
            .iter()
            .map(|r| r.when.operation_id.as_deref().unwrap())
            .collect();
        assert_eq!(ids, ["b", "d", "a", "c"]);
    }

    #[test]
    fn missing_when_or_do_is_positional() {
        let err = load_rules_value(json!({ "scenarios": [
            { "when": { "operationId": "a" }, "do": [] },
            { "do": [] }
        ]}))
        .unwrap_err();
        assert!(matches!(err, RuleError::MissingKey { index: 1, key: "when" }));

        let err = load_rules_value(json!({ "scenarios": [
            { "when": { "operationId": "a" } }
        ]}))
        .unwrap_err();
        assert!(matches!(err, RuleError::MissingKey { index: 0, key: "do" }));
    }

    #[test]
    fn selector_must_name_an_operation_or_pair() {
        let err = load_rules_value(json!({ "scenarios": [
            { "when": { "method": "GET" }, "do": [] }
        ]}))
        .unwrap_err();
        assert!(matches!(err, RuleError::Invalid { index: 0, .. }));
    }

    #[test]
    fn bad_delay_fails_the_load() {
        let err = load_rules_value(json!({ "scenarios": [
            { "when": { "operationId": "a" },
              "do": [ { "delay": "sometime" } ] }
        ]}))
        .unwrap_err();
        assert!(matches!(err, RuleError::Invalid { index: 0, .. }));
    }

    #[test]
    fn scenarios_yaml_round_trips() {
        let yaml = r#"
scenarios:
  - when:
      operationId: createUser
    do:
      - state.set:
          key: "user:{{req.body.id}}"
          value: { id: "{{req.body.id}}", name: "{{req.body.name}}" }
      - respond:
          status: 201
          body:
            $template: true
            id: "{{req.body.id}}"
            name: "{{req.body.name}}"
  - when:
      method: GET
      path: /users/{id}
      match:
        headers:
          x-variant: "$regex:^beta-"
    priority: 2
    do:
      - respond: { status: 200 }
"#;
        let doc: Value = serde_yaml::from_str(yaml).unwrap();
        let rules = load_rules_value(doc).unwrap();
        assert_eq!(rules.len(), 2);
        // priority 2 sorts first
        assert_eq!(rules[0].when.method.as_deref(), Some("GET"));
        assert_eq!(rules[1].actions.len(), 2);
    }
}
