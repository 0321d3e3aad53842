//! Node tree produced by the parser and consumed by the code generator.

use serde::Serialize;
use std::collections::BTreeMap;

/// Byte range into the template source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Node {
    Text {
        value: String,
    },
    Interpolation {
        expr: String,
        escaped: bool,
        span: Span,
    },
    Directive {
        name: String,
        /// Text between the parentheses, `None` when the head had no `(...)`.
        raw_args: Option<String>,
        /// Top-level comma separated arguments of `raw_args`.
        args: Vec<String>,
        children: Option<Vec<Node>>,
        /// The head as written (`@name(args)`), used for pass-through.
        head: String,
        span: Span,
    },
    Element(Element),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Element {
    pub tag: String,
    pub attributes: Vec<Attribute>,
    pub inner: Vec<Node>,
    pub slots: BTreeMap<String, Vec<Node>>,
    pub self_closing: bool,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Attribute {
    /// Empty for spread attributes.
    pub name: String,
    pub value: AttrValue,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "camelCase")]
pub enum AttrValue {
    Literal(String),
    Expression(String),
    Spread(String),
    /// Bare attribute without a value (`disabled`).
    Flag,
}

impl Element {
    pub fn attribute(&self, name: &str) -> Option<&AttrValue> {
        self.attributes
            .iter()
            .rev()
            .find(|a| a.name == name)
            .map(|a| &a.value)
    }

    /// True when every attribute is known at compile time.
    pub fn has_static_attributes(&self) -> bool {
        self.attributes
            .iter()
            .all(|a| matches!(a.value, AttrValue::Literal(_) | AttrValue::Flag))
    }
}

/// Split a directive argument list at top-level commas.
pub fn split_args(raw: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut depth = 0i32;
    let mut quote: Option<char> = None;
    let mut escaped = false;
    let mut current = String::new();

    for ch in raw.chars() {
        if let Some(q) = quote {
            current.push(ch);
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == q {
                quote = None;
            }
            continue;
        }
        match ch {
            '"' | '\'' | '`' => {
                quote = Some(ch);
                current.push(ch);
            }
            '(' | '[' | '{' => {
                depth += 1;
                current.push(ch);
            }
            ')' | ']' | '}' => {
                depth -= 1;
                current.push(ch);
            }
            ',' if depth == 0 => {
                out.push(current.trim().to_string());
                current.clear();
            }
            _ => current.push(ch),
        }
    }
    if !current.trim().is_empty() || !out.is_empty() {
        out.push(current.trim().to_string());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_args_respects_nesting_and_quotes() {
        assert_eq!(
            split_args("'a,b', fn(1, 2), { x: [1, 2] }"),
            vec!["'a,b'", "fn(1, 2)", "{ x: [1, 2] }"]
        );
        assert!(split_args("  ").is_empty());
    }
}
