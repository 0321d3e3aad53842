//! Directive, element and helper registrations.
//!
//! Directives are looked up by exact name. Elements are matched by exact tag
//! first; patterns are only consulted on a miss, newest registration first.

use crate::codegen::{DirectiveCtx, ElementCtx};
use crate::error::CompileError;
use crate::helpers::Helper;
use regex::Regex;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

pub type DirectiveHandler = Rc<dyn Fn(&mut DirectiveCtx<'_>) -> Result<(), CompileError>>;
pub type ElementHandler = Rc<dyn Fn(&mut ElementCtx<'_>) -> Result<(), CompileError>>;

/// Whether a directive wraps a child block closed by `@end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Children {
    #[default]
    No,
    Yes,
    /// Block when a matching `@end` follows, inline otherwise.
    Auto,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Number,
    Boolean,
    Identifier,
    Expression,
}

impl ParamType {
    fn parse(raw: &str) -> Self {
        match raw.trim() {
            "string" => ParamType::String,
            "number" => ParamType::Number,
            "boolean" | "bool" => ParamType::Boolean,
            "identifier" | "ident" => ParamType::Identifier,
            _ => ParamType::Expression,
        }
    }
}

/// Parsed `"name:type|type"` parameter declaration. A trailing `?` on the
/// name marks the parameter optional.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParamSpec {
    pub name: String,
    pub types: Vec<ParamType>,
    pub optional: bool,
}

impl ParamSpec {
    pub fn parse(spec: &str) -> Self {
        let (name, types) = spec.split_once(':').unwrap_or((spec, "any"));
        let name = name.trim();
        let (name, optional) = match name.strip_suffix('?') {
            Some(stripped) => (stripped, true),
            None => (name, false),
        };
        Self {
            name: name.to_string(),
            types: types.split('|').map(ParamType::parse).collect(),
            optional,
        }
    }
}

#[derive(Clone)]
pub struct DirectiveDefinition {
    pub name: String,
    pub params: Vec<ParamSpec>,
    pub children: Children,
    pub handler: DirectiveHandler,
    pub description: Option<String>,
    pub example: Option<String>,
}

impl DirectiveDefinition {
    pub fn new(
        name: impl Into<String>,
        handler: impl Fn(&mut DirectiveCtx<'_>) -> Result<(), CompileError> + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
            children: Children::No,
            handler: Rc::new(handler),
            description: None,
            example: None,
        }
    }

    pub fn params(mut self, specs: &[&str]) -> Self {
        self.params = specs.iter().map(|s| ParamSpec::parse(s)).collect();
        self
    }

    pub fn children(mut self, children: Children) -> Self {
        self.children = children;
        self
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn example(mut self, example: impl Into<String>) -> Self {
        self.example = Some(example.into());
        self
    }
}

impl fmt::Debug for DirectiveDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirectiveDefinition")
            .field("name", &self.name)
            .field("params", &self.params)
            .field("children", &self.children)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub enum ElementMatcher {
    Exact(String),
    Pattern(Regex),
}

impl ElementMatcher {
    pub fn matches(&self, tag: &str) -> bool {
        match self {
            ElementMatcher::Exact(name) => name == tag,
            ElementMatcher::Pattern(re) => re.is_match(tag),
        }
    }

    pub fn label(&self) -> String {
        match self {
            ElementMatcher::Exact(name) => name.clone(),
            ElementMatcher::Pattern(re) => re.as_str().to_string(),
        }
    }
}

/// `x-*` style strings become anchored patterns; anything else is exact.
impl From<&str> for ElementMatcher {
    fn from(name: &str) -> Self {
        if !name.contains('*') {
            return ElementMatcher::Exact(name.to_string());
        }
        let body = name
            .split('*')
            .map(regex::escape)
            .collect::<Vec<_>>()
            .join("[A-Za-z0-9:_.-]*");
        match Regex::new(&format!("^{body}$")) {
            Ok(re) => ElementMatcher::Pattern(re),
            Err(_) => ElementMatcher::Exact(name.to_string()),
        }
    }
}

impl From<String> for ElementMatcher {
    fn from(name: String) -> Self {
        ElementMatcher::from(name.as_str())
    }
}

impl From<Regex> for ElementMatcher {
    fn from(re: Regex) -> Self {
        ElementMatcher::Pattern(re)
    }
}

#[derive(Clone)]
pub struct ElementDefinition {
    pub matcher: ElementMatcher,
    pub void: bool,
    pub handler: ElementHandler,
    pub description: Option<String>,
}

impl ElementDefinition {
    pub fn new(
        matcher: impl Into<ElementMatcher>,
        handler: impl Fn(&mut ElementCtx<'_>) -> Result<(), CompileError> + 'static,
    ) -> Self {
        Self {
            matcher: matcher.into(),
            void: false,
            handler: Rc::new(handler),
            description: None,
        }
    }

    pub fn void(mut self, void: bool) -> Self {
        self.void = void;
        self
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

impl fmt::Debug for ElementDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ElementDefinition")
            .field("matcher", &self.matcher.label())
            .field("void", &self.void)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
pub struct Registry {
    directives: HashMap<String, DirectiveDefinition>,
    elements: HashMap<String, ElementDefinition>,
    patterns: Vec<ElementDefinition>,
    helpers: HashMap<String, Helper>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_directive(&mut self, def: DirectiveDefinition) -> Option<DirectiveDefinition> {
        self.directives.insert(def.name.clone(), def)
    }

    pub fn remove_directive(&mut self, name: &str) -> Option<DirectiveDefinition> {
        self.directives.remove(name)
    }

    pub fn directive(&self, name: &str) -> Option<&DirectiveDefinition> {
        self.directives.get(name)
    }

    pub fn directives(&self) -> impl Iterator<Item = &DirectiveDefinition> {
        self.directives.values()
    }

    pub fn add_element(&mut self, def: ElementDefinition) {
        match &def.matcher {
            ElementMatcher::Exact(name) => {
                self.elements.insert(name.clone(), def);
            }
            ElementMatcher::Pattern(_) => self.patterns.push(def),
        }
    }

    pub fn element(&self, tag: &str) -> Option<&ElementDefinition> {
        if let Some(def) = self.elements.get(tag) {
            return Some(def);
        }
        self.patterns.iter().rev().find(|d| d.matcher.matches(tag))
    }

    pub fn elements(&self) -> impl Iterator<Item = &ElementDefinition> {
        self.elements.values().chain(self.patterns.iter())
    }

    pub fn add_helper(&mut self, name: impl Into<String>, helper: Helper) -> Option<Helper> {
        self.helpers.insert(name.into(), helper)
    }

    pub fn helper(&self, name: &str) -> Option<Helper> {
        self.helpers.get(name).cloned()
    }

    pub fn helper_names(&self) -> impl Iterator<Item = &str> {
        self.helpers.keys().map(String::as_str)
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("directives", &self.directives.len())
            .field("elements", &self.elements.len())
            .field("patterns", &self.patterns.len())
            .field("helpers", &self.helpers.len())
            .finish()
    }
}
