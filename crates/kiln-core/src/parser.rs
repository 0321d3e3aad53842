//! Template parser.
//!
//! A single forward scan over the source. At each position the constructs are
//! tried in a fixed priority order: verbatim regions, comments, escaped
//! sentinels, raw then escaped interpolation, directive heads and finally
//! element boundaries. Anything else accumulates as text.

use crate::ast::{AttrValue, Attribute, Element, Node, Span, split_args};
use crate::error::ParseError;
use crate::registry::{Children, Registry};
use std::collections::{BTreeMap, HashMap};

const VERBATIM_OPEN: &str = "@verbatim";
const VERBATIM_CLOSE: &str = "@endverbatim";
const SLOT_TAG: &str = "slot";

pub fn parse(source: &str, registry: &Registry) -> Result<Vec<Node>, ParseError> {
    let mut parser = Parser {
        src: source,
        pos: 0,
        registry,
        open_elements: Vec::new(),
        open_blocks: 0,
        auto_blocks: HashMap::new(),
    };
    let (nodes, _) = parser.parse_nodes()?;
    Ok(nodes)
}

enum Terminator {
    Eof,
    End,
    CloseTag(String, usize),
}

enum DirectiveOutcome {
    Node(Node),
    Text(String),
    End,
}

struct Parser<'a> {
    src: &'a str,
    pos: usize,
    registry: &'a Registry,
    open_elements: Vec<String>,
    open_blocks: usize,
    /// Outcome of each `Children::Auto` block attempt, keyed by body start
    /// and enclosing elements. `None` means no `@end` closed it.
    auto_blocks: HashMap<(usize, Vec<String>), Option<(Vec<Node>, usize)>>,
}

fn flush_text(nodes: &mut Vec<Node>, text: &mut String) {
    if !text.is_empty() {
        nodes.push(Node::Text {
            value: std::mem::take(text),
        });
    }
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn is_tag_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, ':' | '_' | '.' | '-')
}

impl<'a> Parser<'a> {
    fn error(&self, message: impl Into<String>, offset: usize) -> ParseError {
        ParseError::new(message, self.src, offset)
    }

    fn parse_nodes(&mut self) -> Result<(Vec<Node>, Terminator), ParseError> {
        let mut nodes = Vec::new();
        let mut text = String::new();

        while self.pos < self.src.len() {
            let rest = &self.src[self.pos..];

            if rest.starts_with(VERBATIM_OPEN) && !self.ident_follows(self.pos + VERBATIM_OPEN.len())
            {
                let body = self.pos + VERBATIM_OPEN.len();
                let Some(rel) = self.src[body..].find(VERBATIM_CLOSE) else {
                    return Err(self.error("unterminated @verbatim block", self.pos));
                };
                text.push_str(&self.src[body..body + rel]);
                self.pos = body + rel + VERBATIM_CLOSE.len();
                continue;
            }

            if rest.starts_with("{{--") {
                let Some(rel) = rest[4..].find("--}}") else {
                    return Err(self.error("unterminated comment", self.pos));
                };
                self.pos += 4 + rel + 4;
                continue;
            }

            if rest.starts_with("@@") {
                text.push('@');
                self.pos += 2;
                continue;
            }

            if rest.starts_with("\\{{") {
                text.push_str("{{");
                self.pos += 3;
                continue;
            }

            if rest.starts_with("{{{") {
                flush_text(&mut nodes, &mut text);
                nodes.push(self.parse_interpolation("{{{", "}}}", false)?);
                continue;
            }

            if rest.starts_with("{{") {
                flush_text(&mut nodes, &mut text);
                nodes.push(self.parse_interpolation("{{", "}}", true)?);
                continue;
            }

            if rest.starts_with('@') && self.at_directive() {
                match self.parse_directive()? {
                    DirectiveOutcome::Node(node) => {
                        flush_text(&mut nodes, &mut text);
                        nodes.push(node);
                    }
                    DirectiveOutcome::Text(literal) => text.push_str(&literal),
                    DirectiveOutcome::End => {
                        flush_text(&mut nodes, &mut text);
                        return Ok((nodes, Terminator::End));
                    }
                }
                continue;
            }

            if rest.starts_with("</") {
                if let Some(term) = self.parse_close_tag()? {
                    flush_text(&mut nodes, &mut text);
                    return Ok((nodes, term));
                }
            } else if rest.starts_with('<') {
                if let Some(node) = self.parse_element()? {
                    flush_text(&mut nodes, &mut text);
                    nodes.push(node);
                    continue;
                }
            }

            let Some(ch) = rest.chars().next() else {
                break;
            };
            text.push(ch);
            self.pos += ch.len_utf8();
        }

        flush_text(&mut nodes, &mut text);
        Ok((nodes, Terminator::Eof))
    }

    fn ident_follows(&self, at: usize) -> bool {
        self.src[at..].chars().next().is_some_and(is_ident_char)
    }

    fn at_directive(&self) -> bool {
        self.src[self.pos + 1..]
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
    }

    /// `@` glued to a preceding word (`user@example.com`).
    fn glued(&self, at: usize) -> bool {
        self.src[..at]
            .chars()
            .next_back()
            .is_some_and(|c| is_ident_char(c) || c == '.')
    }

    fn scan_while(&self, from: usize, pred: impl Fn(char) -> bool) -> usize {
        let mut end = from;
        for c in self.src[from..].chars() {
            if !pred(c) {
                break;
            }
            end += c.len_utf8();
        }
        end
    }

    fn skip_whitespace(&mut self) {
        self.pos = self.scan_while(self.pos, char::is_whitespace);
    }

    /// Index of the bracket closing the one at `open`, honouring nesting and
    /// quoted strings.
    fn find_balanced(&self, open: usize) -> Option<usize> {
        let mut depth = 0usize;
        let mut quote: Option<char> = None;
        let mut escaped = false;
        for (i, c) in self.src[open..].char_indices() {
            if let Some(q) = quote {
                if escaped {
                    escaped = false;
                } else if c == '\\' {
                    escaped = true;
                } else if c == q {
                    quote = None;
                }
                continue;
            }
            match c {
                '"' | '\'' | '`' => quote = Some(c),
                '(' | '[' | '{' => depth += 1,
                ')' | ']' | '}' => {
                    depth = depth.saturating_sub(1);
                    if depth == 0 {
                        return Some(open + i);
                    }
                }
                _ => {}
            }
        }
        None
    }

    /// Start of `close` at bracket depth zero, outside of string literals.
    fn find_close(&self, from: usize, close: &str) -> Option<usize> {
        let mut depth = 0usize;
        let mut quote: Option<char> = None;
        let mut escaped = false;
        for (i, c) in self.src[from..].char_indices() {
            if let Some(q) = quote {
                if escaped {
                    escaped = false;
                } else if c == '\\' {
                    escaped = true;
                } else if c == q {
                    quote = None;
                }
                continue;
            }
            if depth == 0 && self.src[from + i..].starts_with(close) {
                return Some(from + i);
            }
            match c {
                '"' | '\'' | '`' => quote = Some(c),
                '(' | '[' | '{' => depth += 1,
                ')' | ']' | '}' => depth = depth.saturating_sub(1),
                _ => {}
            }
        }
        None
    }

    fn parse_interpolation(
        &mut self,
        open: &str,
        close: &str,
        escaped: bool,
    ) -> Result<Node, ParseError> {
        let start = self.pos;
        let body = start + open.len();
        let Some(end) = self.find_close(body, close) else {
            return Err(self.error(format!("unterminated `{open}` interpolation"), start));
        };
        let expr = self.src[body..end].trim();
        if expr.is_empty() {
            return Err(self.error("empty interpolation", start));
        }
        self.pos = end + close.len();
        Ok(Node::Interpolation {
            expr: expr.to_string(),
            escaped,
            span: Span::new(start, self.pos),
        })
    }

    /// Registered inline directive without parameters (or `end`) that
    /// prefixes `name` and is followed by a non-lowercase character: `@elseB`
    /// is `@else` + `B`.
    fn split_prefix(&self, name: &'a str) -> Option<&'a str> {
        let candidates = self
            .registry
            .directives()
            .filter(|d| d.params.is_empty() && d.children == Children::No)
            .map(|d| d.name.as_str())
            .chain(std::iter::once("end"));
        let mut best: Option<usize> = None;
        for candidate in candidates {
            if candidate.len() < name.len()
                && name.starts_with(candidate)
                && !name[candidate.len()..].starts_with(|c: char| c.is_ascii_lowercase())
                && best.is_none_or(|b| candidate.len() > b)
            {
                best = Some(candidate.len());
            }
        }
        best.map(|len| &name[..len])
    }

    fn parse_directive(&mut self) -> Result<DirectiveOutcome, ParseError> {
        let start = self.pos;
        let name_start = start + 1;
        let full_end = self.scan_while(name_start, is_ident_char);
        let src = self.src;
        let mut name = &src[name_start..full_end];
        let mut split = false;

        if name != "end" && self.registry.directive(name).is_none() {
            if let Some(prefix) = self.split_prefix(name) {
                name = prefix;
                split = true;
            }
        }
        let name_end = name_start + name.len();

        // Only registered names may follow a word character directly.
        if name != "end" && self.registry.directive(name).is_none() && self.glued(start) {
            self.pos = start + 1;
            return Ok(DirectiveOutcome::Text("@".to_string()));
        }

        if name == "end" {
            self.pos = name_end;
            if self.open_blocks > 0 {
                return Ok(DirectiveOutcome::End);
            }
            return Ok(DirectiveOutcome::Text("@end".to_string()));
        }

        let (raw_args, head_end) = if !split && src[name_end..].starts_with('(') {
            let Some(close) = self.find_balanced(name_end) else {
                return Err(self.error(format!("unterminated arguments for @{name}"), start));
            };
            (Some(src[name_end + 1..close].to_string()), close + 1)
        } else {
            (None, name_end)
        };

        self.pos = head_end;
        let head = src[start..head_end].to_string();
        let args = raw_args.as_deref().map(split_args).unwrap_or_default();

        let mode = self.registry.directive(name).map(|d| d.children);
        let children = match mode {
            None | Some(Children::No) => None,
            Some(Children::Yes) => Some(self.parse_block(name, start)?),
            Some(Children::Auto) => self.try_parse_block(),
        };

        Ok(DirectiveOutcome::Node(Node::Directive {
            name: name.to_string(),
            raw_args,
            args,
            children,
            head,
            span: Span::new(start, self.pos),
        }))
    }

    fn parse_block(&mut self, name: &str, start: usize) -> Result<Vec<Node>, ParseError> {
        self.open_blocks += 1;
        let result = self.parse_nodes();
        self.open_blocks -= 1;
        let (nodes, term) = result?;
        match term {
            Terminator::End => Ok(nodes),
            Terminator::Eof => Err(self.error(
                format!("unclosed @{name} block: expected @end before end of template"),
                start,
            )),
            Terminator::CloseTag(tag, _) => Err(self.error(
                format!("unclosed @{name} block: expected @end before </{tag}>"),
                start,
            )),
        }
    }

    fn try_parse_block(&mut self) -> Option<Vec<Node>> {
        let checkpoint = self.pos;
        let key = (checkpoint, self.open_elements.clone());
        let outcome = match self.auto_blocks.get(&key) {
            Some(known) => known.clone(),
            None => {
                self.open_blocks += 1;
                let result = self.parse_nodes();
                self.open_blocks -= 1;
                let outcome = match result {
                    Ok((nodes, Terminator::End)) => Some((nodes, self.pos)),
                    _ => None,
                };
                self.auto_blocks.insert(key, outcome.clone());
                outcome
            }
        };
        match outcome {
            Some((nodes, end)) => {
                self.pos = end;
                Some(nodes)
            }
            None => {
                self.pos = checkpoint;
                None
            }
        }
    }

    fn parse_close_tag(&mut self) -> Result<Option<Terminator>, ParseError> {
        let start = self.pos;
        let name_end = self.scan_while(start + 2, is_tag_char);
        if name_end == start + 2 {
            return Ok(None);
        }
        let tag = &self.src[start + 2..name_end];
        let after = self.scan_while(name_end, char::is_whitespace);
        if !self.src[after..].starts_with('>') {
            return Ok(None);
        }
        if self.open_elements.iter().any(|t| t == tag) {
            self.pos = after + 1;
            return Ok(Some(Terminator::CloseTag(tag.to_string(), start)));
        }
        if self.registry.element(tag).is_some_and(|d| d.void) {
            return Err(self.error(
                format!("void element <{tag}> cannot have a closing tag"),
                start,
            ));
        }
        Ok(None)
    }

    fn parse_element(&mut self) -> Result<Option<Node>, ParseError> {
        let start = self.pos;
        if !self.src[start + 1..].starts_with(|c: char| c.is_ascii_alphabetic()) {
            return Ok(None);
        }
        let name_end = self.scan_while(start + 1, is_tag_char);
        let tag = &self.src[start + 1..name_end];
        let is_slot = tag == SLOT_TAG && !self.open_elements.is_empty();
        let def = self.registry.element(tag);
        if def.is_none() && !is_slot {
            return Ok(None);
        }
        let void = def.is_some_and(|d| d.void);

        self.pos = name_end;
        let (attributes, self_closing) = self.parse_attributes(tag, start)?;
        let mut element = Element {
            tag: tag.to_string(),
            attributes,
            inner: Vec::new(),
            slots: BTreeMap::new(),
            self_closing,
            span: Span::new(start, self.pos),
        };
        if self_closing || void {
            return Ok(Some(Node::Element(element)));
        }

        self.open_elements.push(tag.to_string());
        let result = self.parse_nodes();
        self.open_elements.pop();
        let (inner, term) = result?;
        match term {
            Terminator::CloseTag(closed, _) if closed == tag => {}
            Terminator::CloseTag(closed, at) => {
                return Err(self.error(
                    format!("expected </{tag}> but found </{closed}>"),
                    at,
                ));
            }
            Terminator::End => {
                return Err(self.error(format!("unexpected @end inside <{tag}>"), self.pos));
            }
            Terminator::Eof => {
                return Err(self.error(format!("unclosed <{tag}>: missing </{tag}>"), start));
            }
        }

        let (inner, slots) = extract_slots(inner);
        element.inner = inner;
        element.slots = slots;
        element.span.end = self.pos;
        Ok(Some(Node::Element(element)))
    }

    fn parse_attributes(
        &mut self,
        tag: &str,
        start: usize,
    ) -> Result<(Vec<Attribute>, bool), ParseError> {
        let mut attrs = Vec::new();
        loop {
            self.skip_whitespace();
            let rest = &self.src[self.pos..];
            if rest.is_empty() {
                return Err(self.error(format!("unterminated <{tag}> tag"), start));
            }
            if rest.starts_with("/>") {
                self.pos += 2;
                return Ok((attrs, true));
            }
            if rest.starts_with('>') {
                self.pos += 1;
                return Ok((attrs, false));
            }

            if rest.starts_with('{') {
                let Some(close) = self.find_balanced(self.pos) else {
                    return Err(self.error(format!("unbalanced `{{` in <{tag}>"), self.pos));
                };
                let inner = self.src[self.pos + 1..close].trim();
                let Some(expr) = inner.strip_prefix("...") else {
                    return Err(self.error(
                        format!("expected `{{...expr}}` spread attribute in <{tag}>"),
                        self.pos,
                    ));
                };
                attrs.push(Attribute {
                    name: String::new(),
                    value: AttrValue::Spread(expr.trim().to_string()),
                });
                self.pos = close + 1;
                continue;
            }

            let name_start = self.pos;
            let src = self.src;
            let mut name_end = name_start;
            for (i, c) in src[name_start..].char_indices() {
                let at = name_start + i;
                if c.is_whitespace()
                    || matches!(c, '=' | '>' | '"' | '\'' | '{')
                    || src[at..].starts_with("/>")
                {
                    break;
                }
                name_end = at + c.len_utf8();
            }
            if name_end == name_start {
                return Err(self.error(format!("invalid attribute in <{tag}>"), self.pos));
            }
            let name = src[name_start..name_end].to_string();
            self.pos = name_end;

            let after_name = self.pos;
            self.skip_whitespace();
            if !self.src[self.pos..].starts_with('=') {
                self.pos = after_name;
                attrs.push(Attribute {
                    name,
                    value: AttrValue::Flag,
                });
                continue;
            }
            self.pos += 1;
            self.skip_whitespace();

            let value = match self.src[self.pos..].chars().next() {
                Some(q @ ('"' | '\'')) => {
                    let body = self.pos + 1;
                    let Some(rel) = self.src[body..].find(q) else {
                        return Err(self.error(
                            format!("unterminated value for attribute `{name}`"),
                            self.pos,
                        ));
                    };
                    self.pos = body + rel + 1;
                    AttrValue::Literal(self.src[body..body + rel].to_string())
                }
                Some('{') => {
                    let Some(close) = self.find_balanced(self.pos) else {
                        return Err(self.error(
                            format!("unbalanced expression for attribute `{name}`"),
                            self.pos,
                        ));
                    };
                    let expr = self.src[self.pos + 1..close].trim().to_string();
                    self.pos = close + 1;
                    AttrValue::Expression(expr)
                }
                Some(_) => {
                    let value_start = self.pos;
                    let mut end = value_start;
                    for (i, c) in src[value_start..].char_indices() {
                        let at = value_start + i;
                        if c.is_whitespace() || c == '>' || src[at..].starts_with("/>") {
                            break;
                        }
                        end = at + c.len_utf8();
                    }
                    self.pos = end;
                    AttrValue::Literal(src[value_start..end].to_string())
                }
                None => return Err(self.error(format!("unterminated <{tag}> tag"), start)),
            };
            attrs.push(Attribute { name, value });
        }
    }
}

fn extract_slots(nodes: Vec<Node>) -> (Vec<Node>, BTreeMap<String, Vec<Node>>) {
    let mut inner = Vec::new();
    let mut slots: BTreeMap<String, Vec<Node>> = BTreeMap::new();
    for node in nodes {
        match node {
            Node::Element(el) if el.tag == SLOT_TAG => {
                let name = match el.attribute("name") {
                    Some(AttrValue::Literal(n)) => Some(n.clone()),
                    _ => None,
                };
                match name {
                    Some(name) => slots.entry(name).or_default().extend(el.inner),
                    None => inner.push(Node::Element(el)),
                }
            }
            other => inner.push(other),
        }
    }
    (inner, slots)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{DirectiveDefinition, ElementDefinition};

    fn registry() -> Registry {
        let mut r = Registry::new();
        r.add_directive(
            DirectiveDefinition::new("if", |_| Ok(()))
                .params(&["cond"])
                .children(Children::Yes),
        );
        r.add_directive(DirectiveDefinition::new("else", |_| Ok(())));
        r.add_directive(
            DirectiveDefinition::new("section", |_| Ok(()))
                .params(&["name:string"])
                .children(Children::Auto),
        );
        r.add_element(ElementDefinition::new("x-card", |_| Ok(())));
        r.add_element(ElementDefinition::new("x-icon", |_| Ok(())).void(true));
        r
    }

    fn text(value: &str) -> Node {
        Node::Text {
            value: value.to_string(),
        }
    }

    #[test]
    fn text_and_interpolations() {
        let nodes = parse("Hi {{ name }} and {{{ html }}}!", &registry()).expect("parse");
        assert_eq!(nodes.len(), 5);
        assert_eq!(nodes[0], text("Hi "));
        assert!(matches!(
            &nodes[1],
            Node::Interpolation { expr, escaped: true, .. } if expr == "name"
        ));
        assert!(matches!(
            &nodes[3],
            Node::Interpolation { expr, escaped: false, .. } if expr == "html"
        ));
    }

    #[test]
    fn interpolation_close_is_found_past_nested_braces() {
        let nodes = parse("{{ attrs({ a: '}}' }) }}", &registry()).expect("parse");
        assert!(matches!(
            &nodes[0],
            Node::Interpolation { expr, .. } if expr == "attrs({ a: '}}' })"
        ));
    }

    #[test]
    fn sentinels_comments_and_verbatim() {
        let nodes = parse(
            "@@if {{-- hidden --}}\\{{ x }} @verbatim{{ raw }} @if@endverbatim",
            &registry(),
        )
        .expect("parse");
        assert_eq!(nodes, vec![text("@if {{ x }} {{ raw }} @if")]);
    }

    #[test]
    fn email_addresses_are_text() {
        let nodes = parse("mail me@example.com", &registry()).expect("parse");
        assert_eq!(nodes, vec![text("mail me@example.com")]);
    }

    #[test]
    fn unknown_directives_and_stray_end_are_preserved() {
        let nodes = parse("@foo(1, 2)x@end", &registry()).expect("parse");
        match &nodes[0] {
            Node::Directive {
                name,
                args,
                children,
                head,
                ..
            } => {
                assert_eq!(name, "foo");
                assert_eq!(args, &vec!["1".to_string(), "2".to_string()]);
                assert!(children.is_none());
                assert_eq!(head, "@foo(1, 2)");
            }
            other => panic!("expected directive, got {other:?}"),
        }
        assert_eq!(nodes[1], text("x@end"));
    }

    #[test]
    fn else_is_split_from_following_text() {
        let nodes = parse("@if(true)A@elseB@end", &registry()).expect("parse");
        let Node::Directive {
            children: Some(children),
            ..
        } = &nodes[0]
        else {
            panic!("expected block directive");
        };
        assert_eq!(children.len(), 3);
        assert_eq!(children[0], text("A"));
        assert!(matches!(&children[1], Node::Directive { name, .. } if name == "else"));
        assert_eq!(children[2], text("B"));
    }

    #[test]
    fn unclosed_block_names_directive_and_position() {
        let err = parse("line\n  @if(x) never closed", &registry()).expect_err("unclosed");
        assert!(err.message.contains("@if"));
        assert_eq!((err.position.line, err.position.column), (2, 3));
    }

    #[test]
    fn auto_directives_are_inline_without_end() {
        let nodes = parse("@section('a') rest", &registry()).expect("parse");
        assert!(matches!(&nodes[0], Node::Directive { children: None, .. }));

        let nodes = parse("@section('a')body@end", &registry()).expect("parse");
        assert!(matches!(&nodes[0], Node::Directive { children: Some(c), .. } if c.len() == 1));
    }

    #[test]
    fn long_runs_of_auto_heads_stay_inline() {
        let source = "@section('a') ".repeat(48);
        let nodes = parse(&source, &registry()).expect("parse");
        let heads = nodes
            .iter()
            .filter(|n| matches!(n, Node::Directive { children: None, .. }))
            .count();
        assert_eq!(heads, 48);

        let source = format!("{}x@end", "@section('a') ".repeat(40));
        let nodes = parse(&source, &registry()).expect("parse");
        let blocks: Vec<_> = nodes
            .iter()
            .filter_map(|n| match n {
                Node::Directive { children, .. } => Some(children.is_some()),
                _ => None,
            })
            .collect();
        assert_eq!(blocks.len(), 40);
        assert_eq!(blocks.iter().filter(|b| **b).count(), 1);
        assert!(blocks[39]);
    }

    #[test]
    fn registered_elements_with_attributes_and_slots() {
        let src = r#"<x-card title="Hi" count={ n + 1 } {...rest} open><slot name="footer">F</slot>body</x-card>"#;
        let nodes = parse(src, &registry()).expect("parse");
        let Node::Element(el) = &nodes[0] else {
            panic!("expected element");
        };
        assert_eq!(el.tag, "x-card");
        assert_eq!(el.attribute("title"), Some(&AttrValue::Literal("Hi".into())));
        assert_eq!(
            el.attribute("count"),
            Some(&AttrValue::Expression("n + 1".into()))
        );
        assert_eq!(el.attributes[2].value, AttrValue::Spread("rest".into()));
        assert_eq!(el.attribute("open"), Some(&AttrValue::Flag));
        assert_eq!(el.inner, vec![text("body")]);
        assert_eq!(el.slots.get("footer"), Some(&vec![text("F")]));
    }

    #[test]
    fn unregistered_tags_are_text() {
        let nodes = parse("<div class=\"a\">{{ x }}</div>", &registry()).expect("parse");
        assert_eq!(nodes[0], text("<div class=\"a\">"));
        assert_eq!(nodes[2], text("</div>"));
    }

    #[test]
    fn void_elements_reject_closing_tags() {
        let nodes = parse("<x-icon name=\"star\">after", &registry()).expect("parse");
        assert!(matches!(&nodes[0], Node::Element(el) if el.inner.is_empty()));

        let err = parse("<x-icon></x-icon>", &registry()).expect_err("void close");
        assert!(err.message.contains("void element"));
    }

    #[test]
    fn malformed_elements_are_errors() {
        assert!(parse("<x-card title=\"x\"", &registry()).is_err());
        assert!(parse("<x-card>never closed", &registry()).is_err());
        assert!(parse("{{ open", &registry()).is_err());
        assert!(parse("{{   }}", &registry()).is_err());
    }
}
