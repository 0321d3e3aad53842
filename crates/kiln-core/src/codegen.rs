//! Node tree to routine source.
//!
//! Each directive and element handler receives a context with three ordered
//! buffers (`pre`, body, `post`). The generator concatenates them in that
//! order at the node's position; handlers never see each other's output.

use crate::ast::{AttrValue, Attribute, Element, Node};
use crate::error::CompileError;
use crate::expr::{Expr, parse_expr};
use crate::parser::parse;
use crate::registry::{DirectiveDefinition, ElementDefinition, ParamSpec, ParamType, Registry};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

const ID_PREFIX: &str = "__kiln";

/// What to do with a directive that has no registered definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DirectivePolicy {
    /// Emit the directive head as literal text.
    #[default]
    PassThrough,
    /// Fail the compilation.
    Strict,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generated {
    pub code: String,
    pub is_async: bool,
}

pub fn generate(
    nodes: &[Node],
    registry: Rc<RefCell<Registry>>,
    policy: DirectivePolicy,
) -> Result<Generated, CompileError> {
    let mut generator = Generator::new(registry, policy);
    let mut lines = Vec::new();
    generator.nodes(nodes, &mut lines)?;
    Ok(Generated {
        code: lines.join("\n"),
        is_async: generator.is_async,
    })
}

struct BlockFrame {
    name: String,
    data: Map<String, Value>,
}

struct Generator {
    registry: Rc<RefCell<Registry>>,
    policy: DirectivePolicy,
    counter: usize,
    is_async: bool,
    blocks: Vec<BlockFrame>,
}

fn text_line(text: &str) -> String {
    format!("text {}", Value::String(text.to_string()))
}

fn one_line(code: &str) -> String {
    code.replace(['\r', '\n'], " ")
}

fn push_code(buf: &mut Vec<String>, code: &str) {
    buf.extend(code.lines().map(str::to_string));
}

fn check_expr(expr: &str, position: usize) -> Result<Expr, CompileError> {
    parse_expr(expr)
        .map_err(|e| CompileError::at(format!("invalid expression `{expr}`: {}", e.message), position))
}

impl Generator {
    fn new(registry: Rc<RefCell<Registry>>, policy: DirectivePolicy) -> Self {
        Self {
            registry,
            policy,
            counter: 0,
            is_async: false,
            blocks: Vec::new(),
        }
    }

    fn unique_id(&mut self, prefix: &str) -> String {
        let id = format!("{ID_PREFIX}_{prefix}_{}", self.counter);
        self.counter += 1;
        id
    }

    fn nodes(&mut self, nodes: &[Node], out: &mut Vec<String>) -> Result<(), CompileError> {
        for node in nodes {
            self.node(node, out)?;
        }
        Ok(())
    }

    fn node(&mut self, node: &Node, out: &mut Vec<String>) -> Result<(), CompileError> {
        match node {
            Node::Text { value } => {
                if !value.is_empty() {
                    out.push(text_line(value));
                }
                Ok(())
            }
            Node::Interpolation {
                expr,
                escaped,
                span,
            } => {
                let expr = one_line(expr);
                check_expr(&expr, span.start)?;
                out.push(format!("pos {}", span.start));
                let op = if *escaped { "escape" } else { "raw" };
                out.push(format!("{op} {expr}"));
                Ok(())
            }
            Node::Directive {
                name,
                args,
                children,
                head,
                span,
                ..
            } => {
                let def = self.registry.borrow().directive(name).cloned();
                let Some(def) = def else {
                    return self.unknown_directive(name, head, children.as_deref(), span.start, out);
                };
                self.directive(def, args, children.as_deref(), span.start, out)
            }
            Node::Element(element) => {
                let def = self.registry.borrow().element(&element.tag).cloned();
                self.element(def, element, out)
            }
        }
    }

    fn unknown_directive(
        &mut self,
        name: &str,
        head: &str,
        children: Option<&[Node]>,
        position: usize,
        out: &mut Vec<String>,
    ) -> Result<(), CompileError> {
        if self.policy == DirectivePolicy::Strict {
            return Err(CompileError::at(format!("unknown directive @{name}"), position));
        }
        tracing::trace!(directive = name, "passing unknown directive through as text");
        out.push(text_line(head));
        if let Some(children) = children {
            self.nodes(children, out)?;
            out.push(text_line("@end"));
        }
        Ok(())
    }

    fn directive(
        &mut self,
        def: DirectiveDefinition,
        args: &[String],
        children: Option<&[Node]>,
        position: usize,
        out: &mut Vec<String>,
    ) -> Result<(), CompileError> {
        let args: Vec<String> = args.iter().map(String::as_str).map(one_line).collect();
        let params = bind_params(&def, &args, position)?;

        self.blocks.push(BlockFrame {
            name: def.name.clone(),
            data: Map::new(),
        });
        let mut ctx = DirectiveCtx {
            generator: &mut *self,
            name: def.name.clone(),
            args,
            params,
            children,
            position,
            pre: Vec::new(),
            body: Vec::new(),
            post: Vec::new(),
        };
        let result = (def.handler)(&mut ctx);
        let DirectiveCtx { pre, body, post, .. } = ctx;
        self.blocks.pop();

        result.map_err(|mut e| {
            e.position.get_or_insert(position);
            e
        })?;

        out.push(format!("pos {position}"));
        out.extend(pre);
        out.extend(body);
        out.extend(post);
        Ok(())
    }

    fn element(
        &mut self,
        def: Option<ElementDefinition>,
        element: &Element,
        out: &mut Vec<String>,
    ) -> Result<(), CompileError> {
        let position = element.span.start;
        let mut ctx = ElementCtx {
            generator: &mut *self,
            element,
            void: def.as_ref().is_some_and(|d| d.void),
            pre: Vec::new(),
            body: Vec::new(),
            post: Vec::new(),
            replaced: false,
        };
        if let Some(def) = &def {
            (def.handler)(&mut ctx).map_err(|mut e| {
                e.position.get_or_insert(position);
                e
            })?;
        }
        if !ctx.replaced && ctx.body.is_empty() {
            ctx.passthrough()?;
        }
        let ElementCtx { pre, body, post, .. } = ctx;

        out.push(format!("pos {position}"));
        out.extend(pre);
        out.extend(body);
        out.extend(post);
        Ok(())
    }
}

fn string_literal(arg: &str) -> Option<String> {
    let quoted = arg.len() >= 2
        && ["\"", "'", "`"]
            .iter()
            .any(|q| arg.starts_with(q) && arg.ends_with(q));
    if !quoted {
        return None;
    }
    match parse_expr(arg) {
        Ok(Expr::Literal(Value::String(s))) => Some(s),
        _ => None,
    }
}

fn match_type(ty: ParamType, arg: &str) -> Option<String> {
    match ty {
        ParamType::String => string_literal(arg),
        ParamType::Number => match parse_expr(arg) {
            Ok(Expr::Literal(Value::Number(_))) => Some(arg.to_string()),
            Ok(Expr::Unary(_, inner)) if matches!(*inner, Expr::Literal(Value::Number(_))) => {
                Some(arg.to_string())
            }
            _ => None,
        },
        ParamType::Boolean => matches!(arg, "true" | "false").then(|| arg.to_string()),
        ParamType::Identifier => {
            let mut chars = arg.chars();
            let valid = chars
                .next()
                .is_some_and(|c| c.is_alphabetic() || c == '_' || c == '$')
                && chars.all(|c| c.is_alphanumeric() || c == '_' || c == '$');
            valid.then(|| arg.to_string())
        }
        ParamType::Expression => parse_expr(arg).ok().map(|_| arg.to_string()),
    }
}

fn type_list(spec: &ParamSpec) -> String {
    spec.types
        .iter()
        .map(|t| format!("{t:?}").to_lowercase())
        .collect::<Vec<_>>()
        .join("|")
}

fn bind_params(
    def: &DirectiveDefinition,
    args: &[String],
    position: usize,
) -> Result<HashMap<String, String>, CompileError> {
    let mut bound = HashMap::new();
    for (index, spec) in def.params.iter().enumerate() {
        let arg = args.get(index).map(String::as_str).filter(|a| !a.is_empty());
        let Some(arg) = arg else {
            if spec.optional {
                continue;
            }
            return Err(CompileError::at(
                format!("@{} requires argument `{}`", def.name, spec.name),
                position,
            ));
        };
        let Some(value) = spec.types.iter().find_map(|ty| match_type(*ty, arg)) else {
            return Err(CompileError::at(
                format!(
                    "@{}: argument `{}` expects {}, got `{arg}`",
                    def.name,
                    spec.name,
                    type_list(spec)
                ),
                position,
            ));
        };
        bound.insert(spec.name.clone(), value);
    }
    Ok(bound)
}

/// Handler view of a directive invocation.
pub struct DirectiveCtx<'a> {
    generator: &'a mut Generator,
    name: String,
    args: Vec<String>,
    params: HashMap<String, String>,
    children: Option<&'a [Node]>,
    position: usize,
    pre: Vec<String>,
    body: Vec<String>,
    post: Vec<String>,
}

impl DirectiveCtx<'_> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Validated parameter. `string` parameters come back unquoted, every
    /// other type as expression source.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    pub fn argument(&self, index: usize) -> Option<&str> {
        self.args.get(index).map(String::as_str)
    }

    pub fn arguments(&self) -> &[String] {
        &self.args
    }

    pub fn has_children(&self) -> bool {
        self.children.is_some()
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn error(&self, message: impl Into<String>) -> CompileError {
        CompileError::at(message, self.position)
    }

    pub fn raw(&mut self, code: &str) {
        push_code(&mut self.body, code);
    }

    pub fn pre(&mut self, code: &str) {
        push_code(&mut self.pre, code);
    }

    pub fn post(&mut self, code: &str) {
        push_code(&mut self.post, code);
    }

    pub fn mark_async(&mut self) {
        self.generator.is_async = true;
    }

    pub fn render_children(&mut self) -> Result<(), CompileError> {
        if let Some(children) = self.children {
            self.generator.nodes(children, &mut self.body)?;
        }
        Ok(())
    }

    pub fn unique_id(&mut self, prefix: &str) -> String {
        self.generator.unique_id(prefix)
    }

    pub fn set_data(&mut self, key: &str, value: Value) {
        if let Some(frame) = self.generator.blocks.last_mut() {
            frame.data.insert(key.to_string(), value);
        }
    }

    pub fn data(&self, key: &str) -> Option<&Value> {
        self.generator.blocks.last().and_then(|f| f.data.get(key))
    }

    /// Name of the directive whose block immediately contains this one.
    pub fn parent_block(&self) -> Option<&str> {
        let depth = self.generator.blocks.len();
        depth
            .checked_sub(2)
            .and_then(|i| self.generator.blocks.get(i))
            .map(|f| f.name.as_str())
    }

    /// Data of the nearest enclosing block named `name`.
    pub fn enclosing(&self, name: &str) -> Option<&Map<String, Value>> {
        let depth = self.generator.blocks.len();
        self.generator.blocks[..depth.saturating_sub(1)]
            .iter()
            .rev()
            .find(|f| f.name == name)
            .map(|f| &f.data)
    }
}

/// Handler view of a matched element.
pub struct ElementCtx<'a> {
    generator: &'a mut Generator,
    element: &'a Element,
    void: bool,
    pre: Vec<String>,
    body: Vec<String>,
    post: Vec<String>,
    replaced: bool,
}

impl ElementCtx<'_> {
    pub fn tag(&self) -> &str {
        &self.element.tag
    }

    pub fn attributes(&self) -> &[Attribute] {
        &self.element.attributes
    }

    pub fn attribute(&self, name: &str) -> Option<&AttrValue> {
        self.element.attribute(name)
    }

    /// Object-literal expression building the merged attribute map. Spreads
    /// are applied in source order, so later keys win.
    pub fn attributes_object(&self) -> String {
        attributes_object(&self.element.attributes)
    }

    pub fn inner(&self) -> &[Node] {
        &self.element.inner
    }

    pub fn slots(&self) -> &BTreeMap<String, Vec<Node>> {
        &self.element.slots
    }

    pub fn position(&self) -> usize {
        self.element.span.start
    }

    pub fn error(&self, message: impl Into<String>) -> CompileError {
        CompileError::at(message, self.position())
    }

    pub fn raw(&mut self, code: &str) {
        push_code(&mut self.body, code);
    }

    pub fn pre(&mut self, code: &str) {
        push_code(&mut self.pre, code);
    }

    pub fn post(&mut self, code: &str) {
        push_code(&mut self.post, code);
    }

    pub fn mark_async(&mut self) {
        self.generator.is_async = true;
    }

    pub fn unique_id(&mut self, prefix: &str) -> String {
        self.generator.unique_id(prefix)
    }

    pub fn render_inner(&mut self) -> Result<(), CompileError> {
        self.generator.nodes(&self.element.inner, &mut self.body)
    }

    pub fn render_slot(&mut self, name: &str) -> Result<(), CompileError> {
        if let Some(nodes) = self.element.slots.get(name) {
            self.generator.nodes(nodes, &mut self.body)?;
        }
        Ok(())
    }

    /// Render the inner content into the routine variable `var`.
    pub fn capture_inner(&mut self, var: &str) -> Result<(), CompileError> {
        self.body.push(format!("capture {var}"));
        self.generator.nodes(&self.element.inner, &mut self.body)?;
        self.body.push("end".to_string());
        Ok(())
    }

    pub fn capture_slot(&mut self, name: &str, var: &str) -> Result<(), CompileError> {
        self.body.push(format!("capture {var}"));
        if let Some(nodes) = self.element.slots.get(name) {
            self.generator.nodes(nodes, &mut self.body)?;
        }
        self.body.push("end".to_string());
        Ok(())
    }

    /// Substitute the element's output with fixed markup.
    pub fn replace(&mut self, html: &str) {
        self.body.clear();
        self.body.push(text_line(html));
        self.replaced = true;
    }

    /// Substitute the element's output with a template compiled in place.
    pub fn update(&mut self, template: &str) -> Result<(), CompileError> {
        let nodes = {
            let registry = self.generator.registry.borrow();
            parse(template, &registry).map_err(|e| {
                CompileError::at(
                    format!("in <{}> replacement: {}", self.element.tag, e),
                    self.element.span.start,
                )
            })?
        };
        let mut lines = Vec::new();
        self.generator.nodes(&nodes, &mut lines)?;
        self.body = lines;
        self.replaced = true;
        Ok(())
    }

    /// Default rendering: the tag with merged attributes, inner content and
    /// closing tag.
    pub fn passthrough(&mut self) -> Result<(), CompileError> {
        let el = self.element;
        if el.has_static_attributes() {
            self.body
                .push(text_line(&format!("<{}{}", el.tag, static_attributes(&el.attributes))));
        } else {
            for attr in &el.attributes {
                if let AttrValue::Expression(e) | AttrValue::Spread(e) = &attr.value {
                    check_expr(&one_line(e), el.span.start)?;
                }
            }
            self.body.push(text_line(&format!("<{}", el.tag)));
            self.body
                .push(format!("attrs {}", attributes_object(&el.attributes)));
        }

        if el.self_closing {
            self.body.push(text_line(" />"));
            return Ok(());
        }
        self.body.push(text_line(">"));
        if self.void {
            return Ok(());
        }
        self.generator.nodes(&el.inner, &mut self.body)?;
        for (name, nodes) in &el.slots {
            self.body
                .push(text_line(&format!("<slot name=\"{}\">", crate::value::escape_html(name))));
            self.generator.nodes(nodes, &mut self.body)?;
            self.body.push(text_line("</slot>"));
        }
        self.body.push(text_line(&format!("</{}>", el.tag)));
        Ok(())
    }
}

fn attributes_object(attributes: &[Attribute]) -> String {
    let entries: Vec<String> = attributes
        .iter()
        .map(|attr| {
            let key = Value::String(attr.name.clone());
            match &attr.value {
                AttrValue::Literal(v) => format!("{key}: {}", Value::String(v.clone())),
                AttrValue::Expression(e) => format!("{key}: ({})", one_line(e)),
                AttrValue::Spread(e) => format!("...({})", one_line(e)),
                AttrValue::Flag => format!("{key}: true"),
            }
        })
        .collect();
    format!("{{{}}}", entries.join(", "))
}

fn static_attributes(attributes: &[Attribute]) -> String {
    let mut out = String::new();
    for attr in attributes {
        match &attr.value {
            AttrValue::Literal(v) if v.contains('"') && !v.contains('\'') => {
                out.push_str(&format!(" {}='{}'", attr.name, v));
            }
            AttrValue::Literal(v) => out.push_str(&format!(
                " {}=\"{}\"",
                attr.name,
                v.replace('"', "&quot;")
            )),
            _ => {
                out.push(' ');
                out.push_str(&attr.name);
            }
        }
    }
    out
}
