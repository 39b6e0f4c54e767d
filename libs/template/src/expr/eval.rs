use futures::future::BoxFuture;
use serde_json::{Map, Value};

use super::{BinOp, Expr, UnaryOp};
use crate::context::EvalContext;
use crate::faker::Faker;
use crate::rng::Mulberry32;
use crate::TemplateError;

/// Intermediate result of evaluating a subexpression: a plain value, the
/// `state` projection root, a namespace on the way to a function, or a
/// fully-qualified callable.
enum Operand {
    Value(Value),
    StateRoot,
    Namespace(String),
    Function(String),
}

const NAMESPACES: &[&str] = &[
    "faker",
    "faker.name",
    "faker.internet",
    "faker.address",
    "faker.company",
    "faker.commerce",
    "faker.random",
    "faker.date",
    "math",
    "util",
    "util.json",
    "util.string",
    "util.array",
    "util.object",
];

pub(crate) struct Evaluator<'a> {
    rng: &'a Mulberry32,
    now_ms: i64,
    ctx: &'a EvalContext,
}

impl<'a> Evaluator<'a> {
    pub(crate) fn new(rng: &'a Mulberry32, now_ms: i64, ctx: &'a EvalContext) -> Self {
        Self { rng, now_ms, ctx }
    }

    pub(crate) async fn run(&self, expr: &Expr) -> Result<Value, TemplateError> {
        match self.eval(expr).await? {
            Operand::Value(v) => Ok(v),
            Operand::StateRoot | Operand::Namespace(_) | Operand::Function(_) => Err(
                TemplateError::Eval("expression does not reduce to a value".to_string()),
            ),
        }
    }

    fn eval<'e>(&'e self, expr: &'e Expr) -> BoxFuture<'e, Result<Operand, TemplateError>> {
        Box::pin(async move {
            match expr {
                Expr::Null => Ok(Operand::Value(Value::Null)),
                Expr::Bool(b) => Ok(Operand::Value(Value::Bool(*b))),
                Expr::Number(n) => Ok(Operand::Value(number(*n))),
                Expr::Str(s) => Ok(Operand::Value(Value::String(s.clone()))),
                Expr::Array(items) => {
                    let mut out = Vec::with_capacity(items.len());
                    for item in items {
                        out.push(self.value(item).await?);
                    }
                    Ok(Operand::Value(Value::Array(out)))
                }
                Expr::Ident(name) => self.lookup_ident(name),
                Expr::Member(base, name) => {
                    let base = self.eval(base).await?;
                    self.member(base, name).await
                }
                Expr::Index(base, idx) => {
                    let base = self.eval(base).await?;
                    let idx = self.value(idx).await?;
                    self.index(base, idx).await
                }
                Expr::Call(target, args) => {
                    let target = self.eval(target).await?;
                    let Operand::Function(path) = target else {
                        return Err(TemplateError::Eval("not a function".to_string()));
                    };
                    let mut values = Vec::with_capacity(args.len());
                    for arg in args {
                        values.push(self.value(arg).await?);
                    }
                    self.call(&path, values).map(Operand::Value)
                }
                Expr::Unary(op, inner) => {
                    let v = self.value(inner).await?;
                    let out = match op {
                        UnaryOp::Not => Value::Bool(!truthy(&v)),
                        UnaryOp::Neg => number(-num(&v)?),
                    };
                    Ok(Operand::Value(out))
                }
                Expr::Binary(op, lhs, rhs) => self.binary(*op, lhs, rhs).await.map(Operand::Value),
                Expr::Ternary(cond, then, alt) => {
                    let cond = self.value(cond).await?;
                    let picked = if truthy(&cond) { then } else { alt };
                    Ok(Operand::Value(self.value(picked).await?))
                }
            }
        })
    }

    async fn value(&self, expr: &Expr) -> Result<Value, TemplateError> {
        match self.eval(expr).await? {
            Operand::Value(v) => Ok(v),
            _ => Err(TemplateError::Eval(
                "expected a value, found a namespace".to_string(),
            )),
        }
    }

    fn lookup_ident(&self, name: &str) -> Result<Operand, TemplateError> {
        match name {
            "state" if self.ctx.has_state() => Ok(Operand::StateRoot),
            "uuid" | "rand" => Ok(Operand::Function(name.to_string())),
            _ if NAMESPACES.contains(&name) => Ok(Operand::Namespace(name.to_string())),
            _ => match self.ctx.binding(name) {
                Some(v) => Ok(Operand::Value(v.clone())),
                None => Err(TemplateError::Eval(format!("unknown name '{name}'"))),
            },
        }
    }

    async fn member(&self, base: Operand, name: &str) -> Result<Operand, TemplateError> {
        match base {
            Operand::StateRoot => Ok(Operand::Value(self.ctx.state_get(name).await?)),
            Operand::Namespace(ns) => {
                let path = format!("{ns}.{name}");
                if NAMESPACES.contains(&path.as_str()) {
                    Ok(Operand::Namespace(path))
                } else {
                    Ok(Operand::Function(path))
                }
            }
            Operand::Value(Value::Object(map)) => {
                Ok(Operand::Value(map.get(name).cloned().unwrap_or(Value::Null)))
            }
            Operand::Value(Value::Null) => Err(TemplateError::Eval(format!(
                "cannot read '{name}' of null"
            ))),
            Operand::Value(_) => Err(TemplateError::Eval(format!(
                "cannot read '{name}' of a non-object"
            ))),
            Operand::Function(_) => Err(TemplateError::Eval(
                "functions have no members".to_string(),
            )),
        }
    }

    async fn index(&self, base: Operand, idx: Value) -> Result<Operand, TemplateError> {
        match base {
            Operand::StateRoot => {
                let key = match idx {
                    Value::String(s) => s,
                    other => display(&other),
                };
                Ok(Operand::Value(self.ctx.state_get(&key).await?))
            }
            Operand::Value(Value::Object(map)) => {
                let key = match idx {
                    Value::String(s) => s,
                    other => display(&other),
                };
                Ok(Operand::Value(map.get(&key).cloned().unwrap_or(Value::Null)))
            }
            Operand::Value(Value::Array(items)) => {
                let i = idx
                    .as_f64()
                    .ok_or_else(|| TemplateError::Eval("array index must be numeric".to_string()))?
                    as usize;
                Ok(Operand::Value(items.get(i).cloned().unwrap_or(Value::Null)))
            }
            _ => Err(TemplateError::Eval("cannot index this value".to_string())),
        }
    }

    async fn binary(&self, op: BinOp, lhs: &Expr, rhs: &Expr) -> Result<Value, TemplateError> {
        // short-circuiting forms first; they return operand values
        match op {
            BinOp::And => {
                let l = self.value(lhs).await?;
                if !truthy(&l) {
                    return Ok(l);
                }
                return self.value(rhs).await;
            }
            BinOp::Or => {
                let l = self.value(lhs).await?;
                if truthy(&l) {
                    return Ok(l);
                }
                return self.value(rhs).await;
            }
            _ => {}
        }

        let l = self.value(lhs).await?;
        let r = self.value(rhs).await?;
        match op {
            BinOp::Add => {
                if l.is_string() || r.is_string() {
                    Ok(Value::String(format!("{}{}", display(&l), display(&r))))
                } else {
                    Ok(number(num(&l)? + num(&r)?))
                }
            }
            BinOp::Sub => Ok(number(num(&l)? - num(&r)?)),
            BinOp::Mul => Ok(number(num(&l)? * num(&r)?)),
            BinOp::Div => Ok(number(num(&l)? / num(&r)?)),
            BinOp::Rem => Ok(number(num(&l)? % num(&r)?)),
            BinOp::Lt => compare(&l, &r, |o| o.is_lt()),
            BinOp::Le => compare(&l, &r, |o| o.is_le()),
            BinOp::Gt => compare(&l, &r, |o| o.is_gt()),
            BinOp::Ge => compare(&l, &r, |o| o.is_ge()),
            BinOp::Eq => Ok(Value::Bool(loose_eq(&l, &r))),
            BinOp::Ne => Ok(Value::Bool(!loose_eq(&l, &r))),
            BinOp::And | BinOp::Or => unreachable!("handled above"),
        }
    }

    fn call(&self, path: &str, args: Vec<Value>) -> Result<Value, TemplateError> {
        let faker = Faker::new(self.rng, self.now_ms);
        let arity = |n: usize| -> Result<(), TemplateError> {
            if args.len() == n {
                Ok(())
            } else {
                Err(TemplateError::Eval(format!(
                    "{path} expects {n} argument(s), got {}",
                    args.len()
                )))
            }
        };

        if let Some(generator) = path.strip_prefix("faker.") {
            arity(0)?;
            return faker
                .invoke(generator)
                .ok_or_else(|| TemplateError::Eval(format!("unknown faker generator '{generator}'")));
        }

        match path {
            "uuid" => {
                arity(0)?;
                Ok(Value::String(self.rng.uuid()))
            }
            "rand" => {
                arity(2)?;
                let lo = num(&args[0])? as i64;
                let hi = num(&args[1])? as i64;
                Ok(Value::from(self.rng.int_in_range(lo, hi)))
            }

            "math.floor" => unary_math(path, &args, f64::floor),
            "math.ceil" => unary_math(path, &args, f64::ceil),
            "math.round" => unary_math(path, &args, f64::round),
            "math.trunc" => unary_math(path, &args, f64::trunc),
            "math.abs" => unary_math(path, &args, f64::abs),
            "math.sqrt" => unary_math(path, &args, f64::sqrt),
            "math.min" => {
                arity(2)?;
                Ok(number(num(&args[0])?.min(num(&args[1])?)))
            }
            "math.max" => {
                arity(2)?;
                Ok(number(num(&args[0])?.max(num(&args[1])?)))
            }
            "math.pow" => {
                arity(2)?;
                Ok(number(num(&args[0])?.powf(num(&args[1])?)))
            }

            "util.json.parse" => {
                arity(1)?;
                let s = str_arg(path, &args, 0)?;
                serde_json::from_str(s).map_err(|e| TemplateError::Eval(e.to_string()))
            }
            "util.json.stringify" => {
                arity(1)?;
                serde_json::to_string(&args[0])
                    .map(Value::String)
                    .map_err(|e| TemplateError::Eval(e.to_string()))
            }

            "util.string.upper" => {
                arity(1)?;
                Ok(Value::String(str_arg(path, &args, 0)?.to_uppercase()))
            }
            "util.string.lower" => {
                arity(1)?;
                Ok(Value::String(str_arg(path, &args, 0)?.to_lowercase()))
            }
            "util.string.trim" => {
                arity(1)?;
                Ok(Value::String(str_arg(path, &args, 0)?.trim().to_string()))
            }
            "util.string.replace" => {
                arity(3)?;
                let s = str_arg(path, &args, 0)?;
                let from = str_arg(path, &args, 1)?;
                let to = str_arg(path, &args, 2)?;
                Ok(Value::String(s.replace(from, to)))
            }
            "util.string.match" => {
                arity(2)?;
                let s = str_arg(path, &args, 0)?;
                let pattern = str_arg(path, &args, 1)?;
                let re = regex::Regex::new(pattern)
                    .map_err(|e| TemplateError::Eval(format!("bad pattern: {e}")))?;
                Ok(Value::Bool(re.is_match(s)))
            }

            "util.array.length" => {
                arity(1)?;
                match &args[0] {
                    Value::Array(items) => Ok(Value::from(items.len())),
                    Value::String(s) => Ok(Value::from(s.chars().count())),
                    _ => Err(TemplateError::Eval("length expects an array".to_string())),
                }
            }
            "util.array.join" => {
                arity(2)?;
                let Value::Array(items) = &args[0] else {
                    return Err(TemplateError::Eval("join expects an array".to_string()));
                };
                let sep = str_arg(path, &args, 1)?;
                let parts: Vec<String> = items.iter().map(display).collect();
                Ok(Value::String(parts.join(sep)))
            }
            "util.array.slice" => {
                if args.len() != 2 && args.len() != 3 {
                    return Err(TemplateError::Eval(
                        "slice expects (array, from[, to])".to_string(),
                    ));
                }
                let Value::Array(items) = &args[0] else {
                    return Err(TemplateError::Eval("slice expects an array".to_string()));
                };
                let from = (num(&args[1])? as usize).min(items.len());
                let to = match args.get(2) {
                    Some(v) => (num(v)? as usize).clamp(from, items.len()),
                    None => items.len(),
                };
                Ok(Value::Array(items[from..to].to_vec()))
            }

            "util.object.keys" => {
                arity(1)?;
                let map = obj_arg(path, &args, 0)?;
                Ok(Value::Array(
                    map.keys().map(|k| Value::String(k.clone())).collect(),
                ))
            }
            "util.object.values" => {
                arity(1)?;
                let map = obj_arg(path, &args, 0)?;
                Ok(Value::Array(map.values().cloned().collect()))
            }
            "util.object.entries" => {
                arity(1)?;
                let map = obj_arg(path, &args, 0)?;
                Ok(Value::Array(
                    map.iter()
                        .map(|(k, v)| Value::Array(vec![Value::String(k.clone()), v.clone()]))
                        .collect(),
                ))
            }

            other => Err(TemplateError::Eval(format!("unknown function '{other}'"))),
        }
    }
}

fn unary_math(path: &str, args: &[Value], f: fn(f64) -> f64) -> Result<Value, TemplateError> {
    if args.len() != 1 {
        return Err(TemplateError::Eval(format!("{path} expects 1 argument")));
    }
    Ok(number(f(num(&args[0])?)))
}

fn str_arg<'v>(path: &str, args: &'v [Value], i: usize) -> Result<&'v str, TemplateError> {
    args.get(i)
        .and_then(Value::as_str)
        .ok_or_else(|| TemplateError::Eval(format!("{path}: argument {i} must be a string")))
}

fn obj_arg<'v>(
    path: &str,
    args: &'v [Value],
    i: usize,
) -> Result<&'v Map<String, Value>, TemplateError> {
    args.get(i)
        .and_then(Value::as_object)
        .ok_or_else(|| TemplateError::Eval(format!("{path}: argument {i} must be an object")))
}

/// Render an f64 as a JSON number, integer form when exact.
pub(crate) fn number(n: f64) -> Value {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < (i64::MAX as f64) {
        Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

fn num(v: &Value) -> Result<f64, TemplateError> {
    v.as_f64()
        .ok_or_else(|| TemplateError::Eval(format!("'{}' is not a number", display(v))))
}

pub(crate) fn truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// String form used for interpolation: null renders empty, scalars plainly,
/// composites as JSON text.
pub(crate) fn display(v: &Value) -> String {
    match v {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

fn loose_eq(l: &Value, r: &Value) -> bool {
    match (l.as_f64(), r.as_f64()) {
        (Some(a), Some(b)) => a == b,
        _ => l == r,
    }
}

fn compare(
    l: &Value,
    r: &Value,
    check: fn(std::cmp::Ordering) -> bool,
) -> Result<Value, TemplateError> {
    let ordering = match (l, r) {
        (Value::String(a), Value::String(b)) => a.cmp(b),
        _ => num(l)?
            .partial_cmp(&num(r)?)
            .ok_or_else(|| TemplateError::Eval("values are not comparable".to_string()))?,
    };
    Ok(Value::Bool(check(ordering)))
}
