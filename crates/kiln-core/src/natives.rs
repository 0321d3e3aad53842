//! Built-in control directives and helpers.
//!
//! Installed into every new engine through the same registration API third
//! party plugins use.

use crate::codegen::DirectiveCtx;
use crate::engine::Engine;
use crate::error::CompileError;
use crate::expr::parse_expr;
use crate::helpers::builtins;
use crate::plugin::{Plugin, PluginError};
use crate::registry::{Children, DirectiveDefinition};
use serde_json::Value;

pub const NAME: &str = "kiln:natives";

#[derive(Debug, Clone, Copy, Default)]
pub struct Natives;

impl Plugin for Natives {
    fn name(&self) -> &str {
        NAME
    }

    fn load(&self, engine: &Engine) -> Result<(), PluginError> {
        install(engine);
        Ok(())
    }
}

pub(crate) fn install(engine: &Engine) {
    for def in directives() {
        engine.directive(def);
    }
    let registry = engine.registry();
    let mut registry = registry.borrow_mut();
    for (name, helper) in builtins() {
        registry.add_helper(name, helper);
    }
}

fn directives() -> Vec<DirectiveDefinition> {
    vec![
        DirectiveDefinition::new("if", |ctx| {
            let cond = ctx.param("condition").unwrap_or_default().to_string();
            ctx.raw(&format!("if {cond}"));
            ctx.render_children()?;
            ctx.raw("end");
            Ok(())
        })
        .params(&["condition:expression"])
        .children(Children::Yes)
        .describe("Render the block when the condition is truthy.")
        .example("@if(user)Hello {{ user.name }}@elseGuest@end"),
        DirectiveDefinition::new("unless", |ctx| {
            let cond = ctx.param("condition").unwrap_or_default().to_string();
            ctx.raw(&format!("if !({cond})"));
            ctx.render_children()?;
            ctx.raw("end");
            Ok(())
        })
        .params(&["condition:expression"])
        .children(Children::Yes)
        .describe("Render the block when the condition is falsy."),
        DirectiveDefinition::new("elseif", |ctx| {
            require_parent(ctx, &["if", "unless"])?;
            let cond = ctx.param("condition").unwrap_or_default().to_string();
            ctx.raw(&format!("elif {cond}"));
            Ok(())
        })
        .params(&["condition:expression"])
        .describe("Alternative branch of an @if block."),
        DirectiveDefinition::new("else", |ctx| {
            require_parent(ctx, &["if", "unless"])?;
            ctx.raw("else");
            Ok(())
        })
        .describe("Fallback branch of an @if block."),
        DirectiveDefinition::new("for", for_directive)
            .children(Children::Yes)
            .describe("Repeat the block for each entry of an array or object.")
            .example("@for((item, i) in items){{ i }}: {{ item }}@emptyNothing@end"),
        DirectiveDefinition::new("empty", |ctx| {
            require_parent(ctx, &["for"])?;
            let flag = ctx
                .enclosing("for")
                .and_then(|data| data.get("empty"))
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| ctx.error("@empty used outside of @for"))?;
            ctx.raw("end");
            ctx.raw(&format!("if {flag}"));
            Ok(())
        })
        .describe("Block rendered by the enclosing @for when it had no entries."),
        DirectiveDefinition::new("include", |ctx| include(ctx, "include"))
            .params(&["view:expression", "data?:expression"])
            .describe("Render another view in place; a missing view renders nothing.")
            .example("@include('partials.nav', { active: 'home' })"),
        DirectiveDefinition::new("require", |ctx| include(ctx, "include!"))
            .params(&["view:expression", "data?:expression"])
            .describe("Render another view in place; a missing view is an error."),
        DirectiveDefinition::new("let", |ctx| {
            let name = ctx.param("name").unwrap_or_default().to_string();
            let value = ctx.param("value").unwrap_or_default().to_string();
            ctx.raw(&format!("let {name} = {value}"));
            Ok(())
        })
        .params(&["name:identifier", "value:expression"])
        .describe("Bind a template variable.")
        .example("@let(total, price * qty)"),
    ]
}

fn require_parent(ctx: &DirectiveCtx<'_>, parents: &[&str]) -> Result<(), CompileError> {
    match ctx.parent_block() {
        Some(parent) if parents.contains(&parent) => Ok(()),
        _ => Err(ctx.error(format!(
            "@{} must be placed directly inside @{}",
            ctx.name(),
            parents.join(" or @")
        ))),
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_alphabetic() || c == '_' || c == '$')
        && chars.all(|c| c.is_alphanumeric() || c == '_' || c == '$')
}

/// `item in expr` or `(item, key) in expr`.
fn loop_head(head: &str) -> Option<(String, Option<String>, String)> {
    let (vars, iterable) = head.split_once(" in ")?;
    let vars = vars.trim();
    let vars = vars
        .strip_prefix('(')
        .and_then(|v| v.strip_suffix(')'))
        .unwrap_or(vars);
    let (item, key) = match vars.split_once(',') {
        Some((item, key)) => (item.trim(), Some(key.trim())),
        None => (vars.trim(), None),
    };
    if !is_identifier(item) || key.is_some_and(|k| !is_identifier(k)) {
        return None;
    }
    let iterable = iterable.trim();
    parse_expr(iterable).ok()?;
    Some((
        item.to_string(),
        key.map(str::to_string),
        iterable.to_string(),
    ))
}

fn for_directive(ctx: &mut DirectiveCtx<'_>) -> Result<(), CompileError> {
    let head = ctx.arguments().join(", ");
    let Some((item, key, iterable)) = loop_head(&head) else {
        return Err(ctx.error(format!(
            "@for expects `item in items` or `(item, key) in items`, got `{head}`"
        )));
    };
    let flag = ctx.unique_id("empty");
    ctx.set_data("empty", Value::String(flag.clone()));

    ctx.pre(&format!("let {flag} = true"));
    match key {
        Some(key) => ctx.raw(&format!("for {item}, {key} in {iterable}")),
        None => ctx.raw(&format!("for {item} in {iterable}")),
    }
    ctx.raw(&format!("let {flag} = false"));
    ctx.render_children()?;
    ctx.post("end");
    Ok(())
}

fn include(ctx: &mut DirectiveCtx<'_>, statement: &str) -> Result<(), CompileError> {
    let view = ctx.param("view").unwrap_or_default().to_string();
    ctx.mark_async();
    match ctx.param("data").map(str::to_string) {
        Some(data) => ctx.raw(&format!("{statement} {view} with {data}")),
        None => ctx.raw(&format!("{statement} {view}")),
    }
    Ok(())
}
