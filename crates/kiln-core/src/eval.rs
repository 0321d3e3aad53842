use crate::expr::{BinaryOp, Expr, ObjectEntry, UnaryOp};
use crate::value::{as_f64, as_i64, compare, display_string, loose_eq, number, truthy, type_name};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub type EvalResult = Result<Value, EvalError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{message}")]
pub struct EvalError {
    pub message: String,
}

impl EvalError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self {
            message: msg.into(),
        }
    }
}

/// Name resolution and helper dispatch for [`evaluate`].
pub trait Scope {
    fn lookup(&self, name: &str) -> Option<Value>;
    fn call(&self, name: &str, args: &[Value]) -> EvalResult;
}

pub fn evaluate(expr: &Expr, scope: &dyn Scope) -> EvalResult {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Ident(name) => Ok(scope.lookup(name).unwrap_or(Value::Null)),
        Expr::Member {
            object,
            property,
            optional,
        } => {
            let base = evaluate(object, scope)?;
            if base.is_null() {
                if *optional {
                    return Ok(Value::Null);
                }
                return Err(undefined_access(property, object));
            }
            Ok(property_of(&base, property))
        }
        Expr::Index {
            object,
            index,
            optional,
        } => {
            let base = evaluate(object, scope)?;
            let key = evaluate(index, scope)?;
            if base.is_null() {
                if *optional {
                    return Ok(Value::Null);
                }
                return Err(undefined_access(&display_string(&key), object));
            }
            Ok(index_of(&base, &key))
        }
        Expr::Call { callee, args } => {
            let mut values = Vec::with_capacity(args.len());
            for arg in args {
                values.push(evaluate(arg, scope)?);
            }
            scope.call(callee, &values)
        }
        Expr::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(evaluate(item, scope)?);
            }
            Ok(Value::Array(out))
        }
        Expr::Object(entries) => {
            let mut out = Map::new();
            for entry in entries {
                match entry {
                    ObjectEntry::Pair(key, value) => {
                        out.insert(key.to_string(), evaluate(value, scope)?);
                    }
                    ObjectEntry::Spread(inner) => match evaluate(inner, scope)? {
                        Value::Object(map) => {
                            for (k, v) in map {
                                out.insert(k, v);
                            }
                        }
                        Value::Null => {}
                        other => {
                            return Err(EvalError::new(format!(
                                "cannot spread {} into an object",
                                type_name(&other)
                            )));
                        }
                    },
                }
            }
            Ok(Value::Object(out))
        }
        Expr::Unary(op, operand) => {
            let v = evaluate(operand, scope)?;
            Ok(match op {
                UnaryOp::Not => Value::Bool(!truthy(&v)),
                UnaryOp::Neg => number(-as_f64(&v).unwrap_or(f64::NAN)),
                UnaryOp::Plus => number(as_f64(&v).unwrap_or(f64::NAN)),
            })
        }
        Expr::Binary(op, left, right) => binary(*op, left, right, scope),
        Expr::Conditional(cond, then, otherwise) => {
            if truthy(&evaluate(cond, scope)?) {
                evaluate(then, scope)
            } else {
                evaluate(otherwise, scope)
            }
        }
    }
}

fn undefined_access(property: &str, object: &Expr) -> EvalError {
    let path = object
        .path_text()
        .map(|p| format!("{p}.{property}"))
        .unwrap_or_else(|| property.to_string());
    EvalError::new(format!(
        "cannot read property '{property}' of undefined (evaluating '{path}')"
    ))
}

pub fn property_of(base: &Value, property: &str) -> Value {
    match base {
        Value::Object(map) => map.get(property).cloned().unwrap_or(Value::Null),
        Value::Array(items) => {
            if property == "length" {
                Value::from(items.len())
            } else {
                property
                    .parse::<usize>()
                    .ok()
                    .and_then(|i| items.get(i).cloned())
                    .unwrap_or(Value::Null)
            }
        }
        Value::String(s) if property == "length" => Value::from(s.chars().count()),
        _ => Value::Null,
    }
}

fn index_of(base: &Value, key: &Value) -> Value {
    match (base, key) {
        (Value::Array(items), Value::Number(_)) => as_i64(key)
            .and_then(|i| usize::try_from(i).ok())
            .and_then(|i| items.get(i).cloned())
            .unwrap_or(Value::Null),
        (Value::String(s), Value::Number(_)) => as_i64(key)
            .and_then(|i| usize::try_from(i).ok())
            .and_then(|i| s.chars().nth(i))
            .map(|c| Value::String(c.to_string()))
            .unwrap_or(Value::Null),
        _ => property_of(base, &display_string(key)),
    }
}

fn binary(op: BinaryOp, left: &Expr, right: &Expr, scope: &dyn Scope) -> EvalResult {
    let a = evaluate(left, scope)?;
    match op {
        BinaryOp::And => {
            return if truthy(&a) {
                evaluate(right, scope)
            } else {
                Ok(a)
            };
        }
        BinaryOp::Or => {
            return if truthy(&a) {
                Ok(a)
            } else {
                evaluate(right, scope)
            };
        }
        BinaryOp::Coalesce => {
            return if a.is_null() {
                evaluate(right, scope)
            } else {
                Ok(a)
            };
        }
        _ => {}
    }

    let b = evaluate(right, scope)?;
    let result = match op {
        BinaryOp::Add => {
            if a.is_string() || b.is_string() {
                Value::String(format!("{}{}", display_string(&a), display_string(&b)))
            } else if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
                x.checked_add(y)
                    .map(Value::from)
                    .unwrap_or_else(|| number(x as f64 + y as f64))
            } else {
                number(num(&a) + num(&b))
            }
        }
        BinaryOp::Sub => match (a.as_i64(), b.as_i64()) {
            (Some(x), Some(y)) => x
                .checked_sub(y)
                .map(Value::from)
                .unwrap_or_else(|| number(x as f64 - y as f64)),
            _ => number(num(&a) - num(&b)),
        },
        BinaryOp::Mul => match (a.as_i64(), b.as_i64()) {
            (Some(x), Some(y)) => x
                .checked_mul(y)
                .map(Value::from)
                .unwrap_or_else(|| number(x as f64 * y as f64)),
            _ => number(num(&a) * num(&b)),
        },
        BinaryOp::Div => {
            let denom = num(&b);
            if denom == 0.0 {
                return Err(EvalError::new("div by zero"));
            }
            number(num(&a) / denom)
        }
        BinaryOp::Mod => {
            let denom = as_i64(&b).unwrap_or(0);
            if denom == 0 {
                return Err(EvalError::new("mod by zero"));
            }
            as_i64(&a)
                .unwrap_or(0)
                .checked_rem(denom)
                .map(Value::from)
                .ok_or_else(|| EvalError::new("mod overflow"))?
        }
        BinaryOp::Eq => Value::Bool(loose_eq(&a, &b)),
        BinaryOp::Neq => Value::Bool(!loose_eq(&a, &b)),
        BinaryOp::StrictEq => Value::Bool(strict_eq(&a, &b)),
        BinaryOp::StrictNeq => Value::Bool(!strict_eq(&a, &b)),
        BinaryOp::Lt => Value::Bool(compare(&a, &b).is_some_and(|o| o.is_lt())),
        BinaryOp::Lte => Value::Bool(compare(&a, &b).is_some_and(|o| o.is_le())),
        BinaryOp::Gt => Value::Bool(compare(&a, &b).is_some_and(|o| o.is_gt())),
        BinaryOp::Gte => Value::Bool(compare(&a, &b).is_some_and(|o| o.is_ge())),
        BinaryOp::And | BinaryOp::Or | BinaryOp::Coalesce => unreachable!(),
    };
    Ok(result)
}

fn num(v: &Value) -> f64 {
    as_f64(v).unwrap_or(f64::NAN)
}

fn strict_eq(a: &Value, b: &Value) -> bool {
    type_name(a) == type_name(b) && loose_eq(a, b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::parse_expr;
    use serde_json::json;
    use std::collections::HashMap;

    struct MapScope(HashMap<String, Value>);

    impl Scope for MapScope {
        fn lookup(&self, name: &str) -> Option<Value> {
            self.0.get(name).cloned()
        }

        fn call(&self, name: &str, args: &[Value]) -> EvalResult {
            match name {
                "str.upper" => Ok(json!(display_string(&args[0]).to_uppercase())),
                _ => Err(EvalError::new(format!("unknown helper '{name}'"))),
            }
        }
    }

    fn eval(src: &str, vars: Value) -> EvalResult {
        let scope = MapScope(
            vars.as_object()
                .cloned()
                .unwrap_or_default()
                .into_iter()
                .collect(),
        );
        evaluate(&parse_expr(src).expect("parse"), &scope)
    }

    #[test]
    fn arithmetic_and_concatenation() {
        assert_eq!(eval("1 + 2 * 3", json!({})).expect("eval"), json!(7));
        assert_eq!(eval("'n' + 1", json!({})).expect("eval"), json!("n1"));
        assert_eq!(eval("7 / 2", json!({})).expect("eval"), json!(3.5));
        assert!(eval("1 / 0", json!({})).is_err());
    }

    #[test]
    fn remainder_overflow_is_an_error() {
        let vars = json!({ "a": i64::MIN, "b": -1 });
        let err = eval("a % b", vars).expect_err("should fail");
        assert_eq!(err.message, "mod overflow");
        assert_eq!(eval("7 % -2", json!({})).expect("eval"), json!(1));
        assert!(eval("7 % 0", json!({})).is_err());
    }

    #[test]
    fn logical_operators_return_operands() {
        let vars = json!({ "name": "", "fallback": "anon" });
        assert_eq!(eval("name || fallback", vars.clone()).expect("eval"), json!("anon"));
        assert_eq!(eval("missing ?? 'x'", vars.clone()).expect("eval"), json!("x"));
        assert_eq!(eval("name ?? 'x'", vars).expect("eval"), json!(""));
    }

    #[test]
    fn member_access_on_absent_value_names_the_path() {
        let err = eval("it.user.name", json!({ "it": {} })).expect_err("should fail");
        assert!(err.message.contains("'name'"));
        assert!(err.message.contains("it.user.name"));
        assert_eq!(
            eval("it.user?.name", json!({ "it": {} })).expect("eval"),
            Value::Null
        );
    }

    #[test]
    fn spread_is_last_write_wins() {
        let vars = json!({ "base": { "class": "a", "id": "x" } });
        let out = eval("{ class: 'z', ...base, id: 'y' }", vars).expect("eval");
        assert_eq!(out, json!({ "class": "a", "id": "y" }));
    }

    #[test]
    fn helper_calls_and_lengths() {
        let vars = json!({ "items": [1, 2, 3], "who": "kiln" });
        assert_eq!(eval("items.length", vars.clone()).expect("eval"), json!(3));
        assert_eq!(eval("items[1]", vars.clone()).expect("eval"), json!(2));
        assert_eq!(eval("str.upper(who)", vars).expect("eval"), json!("KILN"));
    }
}
