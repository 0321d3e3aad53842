//! Expression language used inside interpolations, directive arguments and
//! routine statements.
//!
//! Expressions are parsed once, when a routine is compiled, into a typed
//! [`Expr`] tree. Evaluation lives in [`crate::eval`].

use serde_json::Value;
use std::fmt;
use std::iter::Peekable;
use std::rc::Rc;
use std::str::CharIndices;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Ident(Rc<str>),
    Member {
        object: Box<Expr>,
        property: Rc<str>,
        optional: bool,
    },
    Index {
        object: Box<Expr>,
        index: Box<Expr>,
        optional: bool,
    },
    /// Helper call. Dotted callees (`str.upper(x)`) address namespaced helpers.
    Call { callee: Rc<str>, args: Vec<Expr> },
    Array(Vec<Expr>),
    Object(Vec<ObjectEntry>),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Conditional(Box<Expr>, Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ObjectEntry {
    Pair(Rc<str>, Expr),
    Spread(Expr),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
    Plus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Neq,
    StrictEq,
    StrictNeq,
    Lt,
    Lte,
    Gt,
    Gte,
    And,
    Or,
    Coalesce,
}

impl BinaryOp {
    fn from_punct(p: &str) -> Option<(BinaryOp, u8)> {
        let op = match p {
            "??" => (BinaryOp::Coalesce, 1),
            "||" => (BinaryOp::Or, 2),
            "&&" => (BinaryOp::And, 3),
            "==" => (BinaryOp::Eq, 4),
            "!=" => (BinaryOp::Neq, 4),
            "===" => (BinaryOp::StrictEq, 4),
            "!==" => (BinaryOp::StrictNeq, 4),
            "<" => (BinaryOp::Lt, 5),
            "<=" => (BinaryOp::Lte, 5),
            ">" => (BinaryOp::Gt, 5),
            ">=" => (BinaryOp::Gte, 5),
            "+" => (BinaryOp::Add, 6),
            "-" => (BinaryOp::Sub, 6),
            "*" => (BinaryOp::Mul, 7),
            "/" => (BinaryOp::Div, 7),
            "%" => (BinaryOp::Mod, 7),
            _ => return None,
        };
        Some(op)
    }
}

impl Expr {
    /// Source-like rendering of identifier/member chains, used in error messages.
    pub fn path_text(&self) -> Option<String> {
        match self {
            Expr::Ident(name) => Some(name.to_string()),
            Expr::Member {
                object,
                property,
                optional,
            } => {
                let base = object.path_text()?;
                let sep = if *optional { "?." } else { "." };
                Some(format!("{base}{sep}{property}"))
            }
            Expr::Index { object, index, .. } => {
                let base = object.path_text()?;
                let idx = match index.as_ref() {
                    Expr::Literal(v) => v.to_string(),
                    other => other.path_text().unwrap_or_else(|| "…".to_string()),
                };
                Some(format!("{base}[{idx}]"))
            }
            _ => None,
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.path_text() {
            Some(path) => f.write_str(&path),
            None => write!(f, "{self:?}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} at offset {offset}")]
pub struct ExprError {
    pub message: String,
    pub offset: usize,
}

impl ExprError {
    fn new(message: impl Into<String>, offset: usize) -> Self {
        Self {
            message: message.into(),
            offset,
        }
    }
}

/// Parse a complete expression; trailing tokens are an error.
pub fn parse_expr(src: &str) -> Result<Expr, ExprError> {
    let (expr, consumed) = parse_expr_prefix(src)?;
    if src[consumed..].trim().is_empty() {
        Ok(expr)
    } else {
        Err(ExprError::new(
            format!("unexpected `{}`", src[consumed..].trim()),
            consumed,
        ))
    }
}

/// Parse the longest expression at the start of `src`.
///
/// Returns the expression and the byte offset where parsing stopped, so
/// statements like `include <expr> with <expr>` can continue from there.
pub fn parse_expr_prefix(src: &str) -> Result<(Expr, usize), ExprError> {
    let tokens = tokenize(src)?;
    let mut parser = ExprParser { tokens, pos: 0 };
    if parser.peek_is_eof() {
        return Err(ExprError::new("empty expression", 0));
    }
    let expr = parser.parse_conditional()?;
    let stop = parser.tokens[parser.pos].start;
    Ok((expr, stop))
}

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Num(Value),
    Str(String),
    Ident(String),
    Punct(&'static str),
    Eof,
}

#[derive(Debug, Clone)]
struct Token {
    tok: Tok,
    start: usize,
}

const PUNCTS: &[&str] = &[
    "...", "===", "!==", "?.", "??", "==", "!=", "<=", ">=", "&&", "||", "(", ")", "[", "]", "{",
    "}", ",", ":", ".", "?", "!", "+", "-", "*", "/", "%", "<", ">",
];

fn tokenize(src: &str) -> Result<Vec<Token>, ExprError> {
    let mut chars: Peekable<CharIndices> = src.char_indices().peekable();
    let mut out = Vec::new();

    while let Some(&(start, c)) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }

        if c == '"' || c == '\'' || c == '`' {
            chars.next();
            let quote = c;
            let mut s = String::new();
            let mut closed = false;
            while let Some((_, nc)) = chars.next() {
                if nc == '\\' {
                    match chars.next() {
                        Some((_, 'n')) => s.push('\n'),
                        Some((_, 't')) => s.push('\t'),
                        Some((_, 'r')) => s.push('\r'),
                        Some((at, 'u')) => {
                            let hex: String = src[at + 1..].chars().take(4).collect();
                            let decoded = u32::from_str_radix(&hex, 16)
                                .ok()
                                .filter(|_| hex.len() == 4)
                                .and_then(char::from_u32);
                            match decoded {
                                Some(ch) => {
                                    s.push(ch);
                                    for _ in 0..4 {
                                        chars.next();
                                    }
                                }
                                None => s.push('u'),
                            }
                        }
                        Some((_, other)) => s.push(other),
                        None => break,
                    }
                } else if nc == quote {
                    closed = true;
                    break;
                } else {
                    s.push(nc);
                }
            }
            if !closed {
                return Err(ExprError::new("unterminated string literal", start));
            }
            out.push(Token {
                tok: Tok::Str(s),
                start,
            });
            continue;
        }

        if c.is_ascii_digit() {
            let mut end = start;
            let mut seen_dot = false;
            while let Some(&(i, nc)) = chars.peek() {
                if nc.is_ascii_digit() || nc == '_' {
                    end = i + nc.len_utf8();
                    chars.next();
                } else if nc == '.' && !seen_dot {
                    // `1.toString` is not supported, but `items.0` style access is
                    // not number syntax either, so a dot must be followed by a digit.
                    let rest = &src[i + 1..];
                    if rest.starts_with(|ch: char| ch.is_ascii_digit()) {
                        seen_dot = true;
                        end = i + 1;
                        chars.next();
                    } else {
                        break;
                    }
                } else {
                    break;
                }
            }
            let text: String = src[start..end].chars().filter(|ch| *ch != '_').collect();
            let value = if seen_dot {
                text.parse::<f64>()
                    .ok()
                    .and_then(serde_json::Number::from_f64)
                    .map(Value::Number)
            } else {
                text.parse::<i64>().ok().map(Value::from)
            };
            let value =
                value.ok_or_else(|| ExprError::new(format!("invalid number `{text}`"), start))?;
            out.push(Token {
                tok: Tok::Num(value),
                start,
            });
            continue;
        }

        if c.is_alphabetic() || c == '_' || c == '$' {
            let mut end = start;
            while let Some(&(i, nc)) = chars.peek() {
                if nc.is_alphanumeric() || nc == '_' || nc == '$' {
                    end = i + nc.len_utf8();
                    chars.next();
                } else {
                    break;
                }
            }
            out.push(Token {
                tok: Tok::Ident(src[start..end].to_string()),
                start,
            });
            continue;
        }

        let rest = &src[start..];
        let Some(punct) = PUNCTS.iter().find(|p| rest.starts_with(**p)) else {
            return Err(ExprError::new(format!("unexpected character `{c}`"), start));
        };
        // `?.5` is a ternary on a number, not optional chaining.
        let punct: &'static str = if *punct == "?."
            && rest[2..].starts_with(|ch: char| ch.is_ascii_digit())
        {
            "?"
        } else {
            punct
        };
        for _ in 0..punct.chars().count() {
            chars.next();
        }
        out.push(Token {
            tok: Tok::Punct(punct),
            start,
        });
    }

    out.push(Token {
        tok: Tok::Eof,
        start: src.len(),
    });
    Ok(out)
}

struct ExprParser {
    tokens: Vec<Token>,
    pos: usize,
}

impl ExprParser {
    fn peek(&self) -> &Tok {
        &self.tokens[self.pos].tok
    }

    fn peek_is_eof(&self) -> bool {
        matches!(self.peek(), Tok::Eof)
    }

    fn offset(&self) -> usize {
        self.tokens[self.pos].start
    }

    fn advance(&mut self) -> Tok {
        let tok = self.tokens[self.pos].tok.clone();
        if !matches!(tok, Tok::Eof) {
            self.pos += 1;
        }
        tok
    }

    fn eat(&mut self, punct: &str) -> bool {
        if matches!(self.peek(), Tok::Punct(p) if *p == punct) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, punct: &str) -> Result<(), ExprError> {
        if self.eat(punct) {
            Ok(())
        } else {
            Err(ExprError::new(
                format!("expected `{punct}`, found {}", describe(self.peek())),
                self.offset(),
            ))
        }
    }

    fn parse_conditional(&mut self) -> Result<Expr, ExprError> {
        let cond = self.parse_binary(1)?;
        if self.eat("?") {
            let then = self.parse_conditional()?;
            self.expect(":")?;
            let otherwise = self.parse_conditional()?;
            return Ok(Expr::Conditional(
                Box::new(cond),
                Box::new(then),
                Box::new(otherwise),
            ));
        }
        Ok(cond)
    }

    fn parse_binary(&mut self, min_prec: u8) -> Result<Expr, ExprError> {
        let mut left = self.parse_unary()?;
        loop {
            let Tok::Punct(p) = self.peek() else {
                break;
            };
            let Some((op, prec)) = BinaryOp::from_punct(p) else {
                break;
            };
            if prec < min_prec {
                break;
            }
            self.pos += 1;
            let right = self.parse_binary(prec + 1)?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, ExprError> {
        if self.eat("!") {
            return Ok(Expr::Unary(UnaryOp::Not, Box::new(self.parse_unary()?)));
        }
        if self.eat("-") {
            return Ok(Expr::Unary(UnaryOp::Neg, Box::new(self.parse_unary()?)));
        }
        if self.eat("+") {
            return Ok(Expr::Unary(UnaryOp::Plus, Box::new(self.parse_unary()?)));
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> Result<Expr, ExprError> {
        let mut expr = self.parse_primary()?;
        loop {
            if self.eat(".") {
                let property = self.expect_property()?;
                expr = Expr::Member {
                    object: Box::new(expr),
                    property: Rc::from(property.as_str()),
                    optional: false,
                };
            } else if self.eat("?.") {
                if self.eat("[") {
                    let index = self.parse_conditional()?;
                    self.expect("]")?;
                    expr = Expr::Index {
                        object: Box::new(expr),
                        index: Box::new(index),
                        optional: true,
                    };
                } else {
                    let property = self.expect_property()?;
                    expr = Expr::Member {
                        object: Box::new(expr),
                        property: Rc::from(property.as_str()),
                        optional: true,
                    };
                }
            } else if self.eat("[") {
                let index = self.parse_conditional()?;
                self.expect("]")?;
                expr = Expr::Index {
                    object: Box::new(expr),
                    index: Box::new(index),
                    optional: false,
                };
            } else if matches!(self.peek(), Tok::Punct("(")) {
                let offset = self.offset();
                let Some(callee) = callee_name(&expr) else {
                    return Err(ExprError::new(
                        "only named helpers can be called",
                        offset,
                    ));
                };
                self.pos += 1;
                let args = self.parse_list(")")?;
                expr = Expr::Call {
                    callee: Rc::from(callee.as_str()),
                    args,
                };
            } else {
                break;
            }
        }
        Ok(expr)
    }

    fn expect_property(&mut self) -> Result<String, ExprError> {
        let offset = self.offset();
        match self.advance() {
            Tok::Ident(name) => Ok(name),
            other => Err(ExprError::new(
                format!("expected property name, found {}", describe(&other)),
                offset,
            )),
        }
    }

    fn parse_list(&mut self, close: &str) -> Result<Vec<Expr>, ExprError> {
        let mut items = Vec::new();
        if self.eat(close) {
            return Ok(items);
        }
        loop {
            items.push(self.parse_conditional()?);
            if self.eat(close) {
                return Ok(items);
            }
            self.expect(",")?;
            if self.eat(close) {
                return Ok(items);
            }
        }
    }

    fn parse_primary(&mut self) -> Result<Expr, ExprError> {
        let offset = self.offset();
        match self.advance() {
            Tok::Num(v) => Ok(Expr::Literal(v)),
            Tok::Str(s) => Ok(Expr::Literal(Value::String(s))),
            Tok::Ident(name) => Ok(match name.as_str() {
                "true" => Expr::Literal(Value::Bool(true)),
                "false" => Expr::Literal(Value::Bool(false)),
                "null" | "undefined" => Expr::Literal(Value::Null),
                _ => Expr::Ident(Rc::from(name.as_str())),
            }),
            Tok::Punct("(") => {
                let inner = self.parse_conditional()?;
                self.expect(")")?;
                Ok(inner)
            }
            Tok::Punct("[") => Ok(Expr::Array(self.parse_list("]")?)),
            Tok::Punct("{") => self.parse_object(),
            other => Err(ExprError::new(
                format!("unexpected {}", describe(&other)),
                offset,
            )),
        }
    }

    fn parse_object(&mut self) -> Result<Expr, ExprError> {
        let mut entries = Vec::new();
        loop {
            if self.eat("}") {
                return Ok(Expr::Object(entries));
            }
            if self.eat("...") {
                entries.push(ObjectEntry::Spread(self.parse_conditional()?));
            } else {
                let offset = self.offset();
                let key = match self.advance() {
                    Tok::Ident(name) => name,
                    Tok::Str(s) => s,
                    Tok::Num(n) => n.to_string(),
                    other => {
                        return Err(ExprError::new(
                            format!("expected object key, found {}", describe(&other)),
                            offset,
                        ));
                    }
                };
                let value = if self.eat(":") {
                    self.parse_conditional()?
                } else {
                    Expr::Ident(Rc::from(key.as_str()))
                };
                entries.push(ObjectEntry::Pair(Rc::from(key.as_str()), value));
            }
            if self.eat("}") {
                return Ok(Expr::Object(entries));
            }
            self.expect(",")?;
        }
    }
}

fn callee_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Ident(name) => Some(name.to_string()),
        Expr::Member {
            object,
            property,
            optional: false,
        } => Some(format!("{}.{property}", callee_name(object)?)),
        _ => None,
    }
}

fn describe(tok: &Tok) -> String {
    match tok {
        Tok::Num(n) => format!("number `{n}`"),
        Tok::Str(_) => "string literal".to_string(),
        Tok::Ident(name) => format!("`{name}`"),
        Tok::Punct(p) => format!("`{p}`"),
        Tok::Eof => "end of expression".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_member_chains_and_calls() {
        let expr = parse_expr("user.profile?.name").expect("parse");
        assert_eq!(expr.path_text().as_deref(), Some("user.profile?.name"));

        let call = parse_expr("str.upper(name, 'x')").expect("parse");
        match call {
            Expr::Call { callee, args } => {
                assert_eq!(&*callee, "str.upper");
                assert_eq!(args.len(), 2);
            }
            other => panic!("expected call, got {other:?}"),
        }
    }

    #[test]
    fn respects_precedence() {
        let expr = parse_expr("1 + 2 * 3 == 7 && !done").expect("parse");
        let Expr::Binary(BinaryOp::And, left, right) = expr else {
            panic!("expected && at the root");
        };
        assert!(matches!(*left, Expr::Binary(BinaryOp::Eq, _, _)));
        assert!(matches!(*right, Expr::Unary(UnaryOp::Not, _)));
    }

    #[test]
    fn object_literals_support_spread_and_shorthand() {
        let expr = parse_expr("{ ...attrs, \"class\": 'x', id }").expect("parse");
        let Expr::Object(entries) = expr else {
            panic!("expected object");
        };
        assert!(matches!(entries[0], ObjectEntry::Spread(_)));
        assert_eq!(
            entries[1],
            ObjectEntry::Pair(Rc::from("class"), Expr::Literal(json!("x")))
        );
        assert_eq!(
            entries[2],
            ObjectEntry::Pair(Rc::from("id"), Expr::Ident(Rc::from("id")))
        );
    }

    #[test]
    fn prefix_parse_stops_at_keyword() {
        let src = "'partials.nav' with { active: true }";
        let (expr, stop) = parse_expr_prefix(src).expect("parse");
        assert_eq!(expr, Expr::Literal(json!("partials.nav")));
        assert!(src[stop..].starts_with("with"));
    }

    #[test]
    fn reports_trailing_garbage() {
        let err = parse_expr("a b").expect_err("trailing token");
        assert_eq!(err.offset, 2);
        assert!(parse_expr("").is_err());
        assert!(parse_expr("'open").is_err());
    }
}
