use std::collections::HashMap;

use regex::Regex;

use crate::error::SpecError;

/// A compiled path template.
///
/// `/pets/{id}` compiles to an anchored regex matching the full path and
/// capturing every `{name}` segment as one non-slash run. Specificity is
/// decided by the caller: fewer capture variables first, longer literal
/// template length as tie-break, so `/pets/mine` binds before `/pets/{id}`.
#[derive(Debug, Clone)]
pub struct PathMatcher {
    template: String,
    regex: Regex,
    var_names: Vec<String>,
    literal_len: usize,
}

impl PathMatcher {
    pub fn compile(template: &str) -> Result<Self, SpecError> {
        let var_re = Regex::new(r"\{([^/{}]+)\}").expect("static regex");

        let mut pattern = String::from("^");
        let mut var_names = Vec::new();
        let mut literal_len = 0usize;
        let mut last = 0usize;

        for cap in var_re.captures_iter(template) {
            let whole = cap.get(0).expect("capture 0");
            let name = cap.get(1).expect("capture 1").as_str();
            let literal = &template[last..whole.start()];
            pattern.push_str(&regex::escape(literal));
            literal_len += literal.len();
            pattern.push_str("([^/]+)");
            var_names.push(name.to_string());
            last = whole.end();
        }
        let tail = &template[last..];
        if tail.contains('{') || tail.contains('}') {
            return Err(SpecError::InvalidTemplate {
                template: template.to_string(),
                reason: "unbalanced braces".to_string(),
            });
        }
        pattern.push_str(&regex::escape(tail));
        literal_len += tail.len();
        pattern.push('$');

        let regex = Regex::new(&pattern).map_err(|e| SpecError::InvalidTemplate {
            template: template.to_string(),
            reason: e.to_string(),
        })?;

        Ok(Self {
            template: template.to_string(),
            regex,
            var_names,
            literal_len,
        })
    }

    /// Match a concrete path, returning the captured variables on success.
    pub fn capture(&self, path: &str) -> Option<HashMap<String, String>> {
        let caps = self.regex.captures(path)?;
        let mut vars = HashMap::with_capacity(self.var_names.len());
        for (i, name) in self.var_names.iter().enumerate() {
            vars.insert(name.clone(), caps.get(i + 1)?.as_str().to_string());
        }
        Some(vars)
    }

    pub fn is_match(&self, path: &str) -> bool {
        self.regex.is_match(path)
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    pub fn var_names(&self) -> &[String] {
        &self.var_names
    }

    pub fn var_count(&self) -> usize {
        self.var_names.len()
    }

    pub fn literal_len(&self) -> usize {
        self.literal_len
    }

    /// Substitute variables back into the template. Used by tests to check
    /// the capture round-trip and by callers that rebuild concrete paths.
    pub fn render(&self, vars: &HashMap<String, String>) -> String {
        let mut out = self.template.clone();
        for name in &self.var_names {
            if let Some(v) = vars.get(name) {
                out = out.replace(&format!("{{{name}}}"), v);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn captures_variables_in_template_order() {
        let m = PathMatcher::compile("/stores/{store}/orders/{order}").unwrap();
        assert_eq!(m.var_names(), &["store".to_string(), "order".to_string()]);

        let vars = m.capture("/stores/s1/orders/o9").unwrap();
        assert_eq!(vars["store"], "s1");
        assert_eq!(vars["order"], "o9");
    }

    #[test]
    fn matches_full_path_only() {
        let m = PathMatcher::compile("/pets/{id}").unwrap();
        assert!(m.capture("/pets/1").is_some());
        assert!(m.capture("/pets/1/toys").is_none());
        assert!(m.capture("/api/pets/1").is_none());
        assert!(m.capture("/pets/").is_none());
    }

    #[test]
    fn variable_never_spans_segments() {
        let m = PathMatcher::compile("/pets/{id}").unwrap();
        assert!(m.capture("/pets/a/b").is_none());
    }

    #[test]
    fn literal_dots_are_escaped() {
        let m = PathMatcher::compile("/v1.0/pets").unwrap();
        assert!(m.is_match("/v1.0/pets"));
        assert!(!m.is_match("/v1x0/pets"));
    }

    #[test]
    fn round_trips_captured_variables() {
        let m = PathMatcher::compile("/users/{uid}/posts/{pid}").unwrap();
        let mut vars = HashMap::new();
        vars.insert("uid".to_string(), "u-42".to_string());
        vars.insert("pid".to_string(), "p.7".to_string());

        let path = m.render(&vars);
        assert_eq!(path, "/users/u-42/posts/p.7");
        assert_eq!(m.capture(&path).unwrap(), vars);
    }

    #[test]
    fn unbalanced_braces_are_rejected() {
        assert!(PathMatcher::compile("/pets/{id").is_err());
    }

    #[test]
    fn specificity_inputs() {
        let literal = PathMatcher::compile("/pets/mine").unwrap();
        let templated = PathMatcher::compile("/pets/{id}").unwrap();
        assert_eq!(literal.var_count(), 0);
        assert_eq!(templated.var_count(), 1);
        assert!(literal.literal_len() > templated.literal_len());
    }
}
