//! Built-in helper functions callable from template expressions.
//!
//! Helpers are plain functions over evaluated arguments. Plugins add their own
//! through `Engine::helper`; a dotted name such as `str.slug` groups helpers
//! under a namespace.

use crate::eval::{EvalError, EvalResult};
use crate::value::{as_f64, as_i64, display_string, escape_html, render_attributes, truthy};
use serde_json::{Value, json};
use std::rc::Rc;

pub type Helper = Rc<dyn Fn(&[Value]) -> EvalResult>;

type HelperFn = fn(&[Value]) -> EvalResult;

const MAX_RANGE_LEN: usize = 100_000;

const BUILTINS: &[(&str, HelperFn)] = &[
    ("len", helper_len),
    ("upper", helper_upper),
    ("lower", helper_lower),
    ("trim", helper_trim),
    ("concat", helper_concat),
    ("contains", helper_contains),
    ("json", helper_json),
    ("to_int", helper_to_int),
    ("to_float", helper_to_float),
    ("to_string", helper_to_string),
    ("escape", helper_escape),
    ("attrs", helper_attrs),
    ("range", helper_range),
    ("join", helper_join),
    ("keys", helper_keys),
    ("values", helper_values),
];

pub fn builtins() -> impl Iterator<Item = (&'static str, Helper)> {
    BUILTINS
        .iter()
        .map(|(name, f)| (*name, Rc::new(*f) as Helper))
}

fn require_arg<'a>(args: &'a [Value], index: usize, helper: &str) -> Result<&'a Value, EvalError> {
    args.get(index)
        .ok_or_else(|| EvalError::new(format!("{helper} requires argument {index}")))
}

fn helper_len(args: &[Value]) -> EvalResult {
    let len = match require_arg(args, 0, "len")? {
        Value::Array(items) => items.len(),
        Value::Object(map) => map.len(),
        Value::String(s) => s.chars().count(),
        Value::Null => 0,
        _ => return Err(EvalError::new("len expects array, object or string")),
    };
    Ok(json!(len))
}

fn helper_upper(args: &[Value]) -> EvalResult {
    Ok(json!(display_string(require_arg(args, 0, "upper")?).to_uppercase()))
}

fn helper_lower(args: &[Value]) -> EvalResult {
    Ok(json!(display_string(require_arg(args, 0, "lower")?).to_lowercase()))
}

fn helper_trim(args: &[Value]) -> EvalResult {
    Ok(json!(display_string(require_arg(args, 0, "trim")?).trim()))
}

fn helper_concat(args: &[Value]) -> EvalResult {
    if let Some(Value::Array(_)) = args.first() {
        let mut out = Vec::new();
        for arg in args {
            match arg {
                Value::Array(items) => out.extend(items.iter().cloned()),
                other => out.push(other.clone()),
            }
        }
        return Ok(Value::Array(out));
    }
    Ok(Value::String(args.iter().map(display_string).collect()))
}

fn helper_contains(args: &[Value]) -> EvalResult {
    let haystack = require_arg(args, 0, "contains")?;
    let needle = require_arg(args, 1, "contains")?;
    let found = match haystack {
        Value::Array(items) => items.iter().any(|v| v == needle),
        Value::Object(map) => map.contains_key(&display_string(needle)),
        Value::String(s) => s.contains(&display_string(needle)),
        _ => false,
    };
    Ok(Value::Bool(found))
}

fn helper_json(args: &[Value]) -> EvalResult {
    let value = args.first().unwrap_or(&Value::Null);
    let pretty = args.get(1).is_some_and(truthy);
    let text = if pretty {
        serde_json::to_string_pretty(value)
    } else {
        serde_json::to_string(value)
    };
    text.map(Value::String)
        .map_err(|e| EvalError::new(format!("json failed: {e}")))
}

fn helper_to_int(args: &[Value]) -> EvalResult {
    Ok(as_i64(require_arg(args, 0, "to_int")?)
        .map(Value::from)
        .unwrap_or(Value::Null))
}

fn helper_to_float(args: &[Value]) -> EvalResult {
    Ok(as_f64(require_arg(args, 0, "to_float")?)
        .map(|f| json!(f))
        .unwrap_or(Value::Null))
}

fn helper_to_string(args: &[Value]) -> EvalResult {
    Ok(json!(display_string(require_arg(args, 0, "to_string")?)))
}

fn helper_escape(args: &[Value]) -> EvalResult {
    Ok(json!(escape_html(&display_string(require_arg(args, 0, "escape")?))))
}

fn helper_attrs(args: &[Value]) -> EvalResult {
    Ok(Value::String(render_attributes(args.first().unwrap_or(&Value::Null))))
}

fn helper_range(args: &[Value]) -> EvalResult {
    let (start, end) = match (args.first(), args.get(1)) {
        (Some(a), Some(b)) => (as_i64(a).unwrap_or(0), as_i64(b).unwrap_or(0)),
        (Some(a), None) => (0, as_i64(a).unwrap_or(0)),
        _ => return Err(EvalError::new("range requires argument 0")),
    };
    let step = args.get(2).and_then(as_i64).unwrap_or(1);
    if step == 0 {
        return Err(EvalError::new("range step cannot be zero"));
    }
    let mut out = Vec::new();
    let mut next = Some(start);
    while let Some(i) = next.filter(|&i| (step > 0 && i < end) || (step < 0 && i > end)) {
        if out.len() == MAX_RANGE_LEN {
            return Err(EvalError::new(format!(
                "range exceeds {MAX_RANGE_LEN} items"
            )));
        }
        out.push(Value::from(i));
        next = i.checked_add(step);
    }
    Ok(Value::Array(out))
}

fn helper_join(args: &[Value]) -> EvalResult {
    let sep = args.get(1).map(display_string).unwrap_or_else(|| ",".into());
    match require_arg(args, 0, "join")? {
        Value::Array(items) => Ok(json!(
            items.iter().map(display_string).collect::<Vec<_>>().join(&sep)
        )),
        other => Ok(json!(display_string(other))),
    }
}

fn helper_keys(args: &[Value]) -> EvalResult {
    match require_arg(args, 0, "keys")? {
        Value::Object(map) => Ok(Value::Array(
            map.keys().map(|k| Value::String(k.clone())).collect(),
        )),
        Value::Array(items) => Ok(Value::Array((0..items.len()).map(Value::from).collect())),
        _ => Ok(json!([])),
    }
}

fn helper_values(args: &[Value]) -> EvalResult {
    match require_arg(args, 0, "values")? {
        Value::Object(map) => Ok(Value::Array(map.values().cloned().collect())),
        Value::Array(items) => Ok(Value::Array(items.clone())),
        _ => Ok(json!([])),
    }
}
