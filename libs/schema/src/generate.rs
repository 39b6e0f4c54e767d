use serde_json::{Map, Value};

use sandbox_template::TemplateEngine;

/// Caps that keep synthesized documents small and generation total.
#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    /// Prefer a schema's `example` / first of `examples` when present.
    pub use_examples: bool,
    /// Recursion budget; beyond it a subtree yields null.
    pub max_depth: usize,
    /// Upper bound on generated string length.
    pub string_cap: usize,
    /// Upper bound on generated array length.
    pub array_cap: usize,
    /// Upper bound on `additionalProperties` entries.
    pub extra_props_cap: usize,
    /// Probability of including a declared-but-optional property.
    pub optional_prop_probability: f64,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            use_examples: true,
            max_depth: 10,
            string_cap: 64,
            array_cap: 5,
            extra_props_cap: 3,
            optional_prop_probability: 0.7,
        }
    }
}

/// Deterministic, schema-driven data synthesis. Every random decision draws
/// from the engine's seeded stream, so identical seeds yield identical
/// documents. Failures are contained: a subtree that cannot be generated
/// becomes null, never an error.
pub struct Generator<'a> {
    engine: &'a TemplateEngine,
    root: &'a Value,
    config: GeneratorConfig,
}

impl<'a> Generator<'a> {
    pub fn new(engine: &'a TemplateEngine, root: &'a Value, config: GeneratorConfig) -> Self {
        Self {
            engine,
            root,
            config,
        }
    }

    pub fn generate(&self, schema: &Value) -> Value {
        let mut stack = Vec::new();
        self.gen(schema, 0, &mut stack)
    }

    fn gen(&self, schema: &Value, depth: usize, stack: &mut Vec<String>) -> Value {
        if depth > self.config.max_depth {
            return Value::Null;
        }
        let Some(map) = schema.as_object() else {
            return Value::Null;
        };

        // $ref: resolve against the document; a revisit on the current
        // stack is a cycle and yields null
        if let Some(Value::String(target)) = map.get("$ref") {
            if !target.starts_with("#/") || stack.iter().any(|seen| seen == target) {
                return Value::Null;
            }
            let Some(resolved) = self.root.pointer(&target[1..]) else {
                return Value::Null;
            };
            stack.push(target.clone());
            let value = self.gen(&resolved.clone(), depth, stack);
            stack.pop();
            return value;
        }

        if self.config.use_examples {
            if let Some(example) = map.get("example") {
                return example.clone();
            }
            if let Some(Value::Array(examples)) = map.get("examples") {
                if let Some(first) = examples.first() {
                    return first.clone();
                }
            }
        }

        if let Some(path) = vendor_hint(map, "faker").and_then(Value::as_str) {
            if let Some(value) = self.engine.faker().invoke(path) {
                return value;
            }
        }

        if let Some(Value::Array(items)) = map.get("enum") {
            if items.is_empty() {
                return Value::Null;
            }
            let weights = vendor_hint(map, "enumWeights").and_then(Value::as_object);
            return self.pick_enum(items, weights);
        }

        if let Some(Value::Array(subs)) = map.get("allOf") {
            let merged = self.merge_all(subs, stack);
            return self.gen(&merged, depth + 1, stack);
        }
        for combinator in ["anyOf", "oneOf"] {
            if let Some(Value::Array(subs)) = map.get(combinator) {
                if subs.is_empty() {
                    return Value::Null;
                }
                let idx = self.engine.rng().int_in_range(0, subs.len() as i64 - 1) as usize;
                return self.gen(&subs[idx], depth + 1, stack);
            }
        }

        match declared_type(map, self.engine) {
            "string" => self.gen_string(map),
            "integer" => self.gen_number(map, true),
            "number" => self.gen_number(map, false),
            "boolean" => Value::Bool(self.engine.rng().chance(0.5)),
            "array" => self.gen_array(map, depth, stack),
            "object" => self.gen_object(map, depth, stack),
            _ => Value::Null,
        }
    }

    fn pick_enum(&self, items: &[Value], weights: Option<&Map<String, Value>>) -> Value {
        let Some(weights) = weights else {
            return self.engine.rng().pick(items).clone();
        };
        let ws: Vec<f64> = items
            .iter()
            .map(|item| {
                let key = match item {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                weights.get(&key).and_then(Value::as_f64).unwrap_or(1.0)
            })
            .collect();
        let total: f64 = ws.iter().sum();
        if total <= 0.0 {
            return self.engine.rng().pick(items).clone();
        }
        let mut roll = self.engine.rng().next_f64() * total;
        for (item, w) in items.iter().zip(&ws) {
            if roll < *w {
                return item.clone();
            }
            roll -= w;
        }
        items.last().cloned().unwrap_or(Value::Null)
    }

    /// `allOf` merging: property union, required union, first-level keys of
    /// later subschemas otherwise override earlier ones.
    fn merge_all(&self, subs: &[Value], stack: &mut Vec<String>) -> Value {
        let mut merged = Map::new();
        for sub in subs {
            let resolved = self.deref(sub, stack);
            let Some(sub_map) = resolved.as_object() else {
                continue;
            };
            for (k, v) in sub_map {
                match k.as_str() {
                    "properties" => {
                        let props = merged
                            .entry("properties")
                            .or_insert_with(|| Value::Object(Map::new()));
                        if let (Some(into), Some(from)) = (props.as_object_mut(), v.as_object()) {
                            for (pk, pv) in from {
                                into.insert(pk.clone(), pv.clone());
                            }
                        }
                    }
                    "required" => {
                        let req = merged
                            .entry("required")
                            .or_insert_with(|| Value::Array(Vec::new()));
                        if let (Some(into), Some(from)) = (req.as_array_mut(), v.as_array()) {
                            for name in from {
                                if !into.contains(name) {
                                    into.push(name.clone());
                                }
                            }
                        }
                    }
                    _ => {
                        merged.insert(k.clone(), v.clone());
                    }
                }
            }
        }
        Value::Object(merged)
    }

    fn deref(&self, schema: &Value, stack: &[String]) -> Value {
        if let Some(Value::String(target)) = schema.get("$ref") {
            if target.starts_with("#/") && !stack.iter().any(|seen| seen == target) {
                if let Some(resolved) = self.root.pointer(&target[1..]) {
                    return resolved.clone();
                }
            }
            return Value::Object(Map::new());
        }
        schema.clone()
    }

    fn gen_string(&self, map: &Map<String, Value>) -> Value {
        let rng = self.engine.rng();
        let faker = self.engine.faker();

        if let Some(format) = map.get("format").and_then(Value::as_str) {
            let formatted = match format {
                "uuid" => Some(rng.uuid()),
                "email" => Some(faker.email()),
                "uri" | "url" => Some(faker.url()),
                "hostname" => Some(format!(
                    "{}.example.com",
                    faker.first_name().to_lowercase()
                )),
                "ipv4" => Some(format!(
                    "{}.{}.{}.{}",
                    rng.int_in_range(1, 254),
                    rng.int_in_range(0, 255),
                    rng.int_in_range(0, 255),
                    rng.int_in_range(1, 254)
                )),
                "ipv6" => Some(
                    (0..8)
                        .map(|_| format!("{:04x}", rng.int_in_range(0, 0xffff)))
                        .collect::<Vec<_>>()
                        .join(":"),
                ),
                "date" => Some(faker.recent_date()[..10].to_string()),
                "date-time" => Some(faker.recent_date()),
                "time" => Some(format!(
                    "{:02}:{:02}:{:02}",
                    rng.int_in_range(0, 23),
                    rng.int_in_range(0, 59),
                    rng.int_in_range(0, 59)
                )),
                "password" => Some(random_chars(
                    rng,
                    12,
                    b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789",
                )),
                // a multiple-of-four run over the alphabet is valid base64
                "byte" => Some(random_chars(
                    rng,
                    16,
                    b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789+/",
                )),
                "binary" => Some(random_chars(rng, 16, b"0123456789abcdef")),
                _ => None,
            };
            if let Some(s) = formatted {
                return Value::String(s);
            }
        }

        let lo = usize_of(map.get("minLength")).unwrap_or(0);
        let hi = usize_of(map.get("maxLength"))
            .unwrap_or(self.config.string_cap)
            .min(self.config.string_cap)
            .max(lo);
        let target = rng.int_in_range(lo as i64, hi as i64) as usize;

        let mut out = String::new();
        while out.len() < target {
            if !out.is_empty() {
                out.push(' ');
            }
            out.push_str(faker.word());
        }
        out.truncate(target);
        Value::String(out)
    }

    fn gen_number(&self, map: &Map<String, Value>, integer: bool) -> Value {
        let rng = self.engine.rng();
        let mut lo = map.get("minimum").and_then(Value::as_f64).unwrap_or(-1e6);
        let mut hi = map.get("maximum").and_then(Value::as_f64).unwrap_or(1e6);

        // exclusive bounds in both the draft-4 boolean and draft-7 numeric shapes
        match map.get("exclusiveMinimum") {
            Some(Value::Bool(true)) => lo += if integer { 1.0 } else { f64::EPSILON },
            Some(Value::Number(n)) => lo = lo.max(n.as_f64().unwrap_or(lo) + if integer { 1.0 } else { f64::EPSILON }),
            _ => {}
        }
        match map.get("exclusiveMaximum") {
            Some(Value::Bool(true)) => hi -= if integer { 1.0 } else { f64::EPSILON },
            Some(Value::Number(n)) => hi = hi.min(n.as_f64().unwrap_or(hi) - if integer { 1.0 } else { f64::EPSILON }),
            _ => {}
        }
        if hi < lo {
            hi = lo;
        }

        if let Some(step) = map.get("multipleOf").and_then(Value::as_f64).filter(|m| *m > 0.0) {
            let k_lo = (lo / step).ceil() as i64;
            let k_hi = (hi / step).floor() as i64;
            if k_hi < k_lo {
                return Value::Null;
            }
            let k = rng.int_in_range(k_lo, k_hi);
            let n = k as f64 * step;
            return if integer || n.fract() == 0.0 {
                Value::from(n as i64)
            } else {
                serde_json::Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
            };
        }

        if integer {
            Value::from(rng.int_in_range(lo.ceil() as i64, hi.floor() as i64))
        } else {
            serde_json::Number::from_f64(rng.float_in_range(lo, hi))
                .map(Value::Number)
                .unwrap_or(Value::Null)
        }
    }

    fn gen_array(&self, map: &Map<String, Value>, depth: usize, stack: &mut Vec<String>) -> Value {
        let rng = self.engine.rng();
        let lo = usize_of(map.get("minItems")).unwrap_or(0);
        let hi = usize_of(map.get("maxItems"))
            .unwrap_or(self.config.array_cap)
            .min(self.config.array_cap)
            .max(lo);
        let len = rng.int_in_range(lo as i64, hi as i64) as usize;

        let items_schema = map.get("items").cloned().unwrap_or(Value::Null);
        let mut items: Vec<Value> = (0..len)
            .map(|_| self.gen(&items_schema, depth + 1, stack))
            .collect();

        // one-shot dedupe; no retries if collapsing undershoots minItems
        if matches!(map.get("uniqueItems"), Some(Value::Bool(true))) {
            let mut seen = std::collections::HashSet::new();
            items.retain(|item| seen.insert(item.to_string()));
        }
        Value::Array(items)
    }

    fn gen_object(&self, map: &Map<String, Value>, depth: usize, stack: &mut Vec<String>) -> Value {
        let rng = self.engine.rng();
        let required: Vec<&str> = map
            .get("required")
            .and_then(Value::as_array)
            .map(|names| names.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();
        let max_properties = usize_of(map.get("maxProperties")).unwrap_or(usize::MAX);

        let mut out = Map::new();
        if let Some(Value::Object(properties)) = map.get("properties") {
            for (name, prop_schema) in properties {
                if out.len() >= max_properties {
                    break;
                }
                let wanted = required.contains(&name.as_str())
                    || rng.chance(self.config.optional_prop_probability);
                if wanted {
                    out.insert(name.clone(), self.gen(prop_schema, depth + 1, stack));
                }
            }
        }

        if let Some(extra @ Value::Object(_)) = map.get("additionalProperties") {
            let mut i = 1;
            while i <= self.config.extra_props_cap && out.len() < max_properties {
                out.insert(
                    format!("additionalProp{i}"),
                    self.gen(extra, depth + 1, stack),
                );
                i += 1;
            }
        }
        Value::Object(out)
    }
}

fn vendor_hint<'v>(map: &'v Map<String, Value>, key: &str) -> Option<&'v Value> {
    map.get("x-sandbox").and_then(|ext| ext.get(key))
}

fn declared_type<'m>(map: &'m Map<String, Value>, engine: &TemplateEngine) -> &'m str {
    match map.get("type") {
        Some(Value::String(t)) => t.as_str(),
        Some(Value::Array(types)) if !types.is_empty() => {
            let idx = engine.rng().int_in_range(0, types.len() as i64 - 1) as usize;
            types[idx].as_str().unwrap_or("null")
        }
        _ => {
            // infer from shape the way lenient tooling does
            if map.contains_key("properties") || map.contains_key("additionalProperties") {
                "object"
            } else if map.contains_key("items") {
                "array"
            } else {
                "null"
            }
        }
    }
}

fn usize_of(value: Option<&Value>) -> Option<usize> {
    value.and_then(Value::as_u64).map(|n| n as usize)
}

fn random_chars(rng: &sandbox_template::Mulberry32, len: usize, alphabet: &[u8]) -> String {
    (0..len)
        .map(|_| alphabet[rng.int_in_range(0, alphabet.len() as i64 - 1) as usize] as char)
        .collect()
}
