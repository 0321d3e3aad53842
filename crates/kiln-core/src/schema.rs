//! Machine-readable inventory of what an engine understands, for editor
//! tooling.

use crate::namespace::NamespaceMapping;
use crate::registry::{Children, ElementMatcher, ParamSpec, Registry};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageSchema {
    pub name: String,
    pub version: String,
    pub directives: Vec<DirectiveSchema>,
    pub elements: Vec<ElementSchema>,
    pub helpers: Vec<String>,
    pub globals: Vec<String>,
    pub namespaces: Vec<NamespaceSchema>,
    pub plugins: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectiveSchema {
    pub name: String,
    pub params: Vec<ParamSpec>,
    pub children: Children,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub example: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementSchema {
    pub matcher: String,
    pub pattern: bool,
    pub void: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NamespaceSchema {
    pub alias: String,
    pub root: String,
}

impl PackageSchema {
    pub(crate) fn build(
        name: &str,
        registry: &Registry,
        globals: Vec<String>,
        namespaces: impl Iterator<Item = NamespaceMapping>,
        plugins: Vec<String>,
    ) -> Self {
        let mut directives: Vec<DirectiveSchema> = registry
            .directives()
            .map(|d| DirectiveSchema {
                name: d.name.clone(),
                params: d.params.clone(),
                children: d.children,
                description: d.description.clone(),
                example: d.example.clone(),
            })
            .collect();
        directives.sort_by(|a, b| a.name.cmp(&b.name));

        let mut elements: Vec<ElementSchema> = registry
            .elements()
            .map(|e| ElementSchema {
                matcher: e.matcher.label(),
                pattern: matches!(e.matcher, ElementMatcher::Pattern(_)),
                void: e.void,
                description: e.description.clone(),
            })
            .collect();
        elements.sort_by(|a, b| a.matcher.cmp(&b.matcher));

        let mut helpers: Vec<String> = registry.helper_names().map(str::to_string).collect();
        helpers.sort();

        let mut globals = globals;
        globals.sort();

        Self {
            name: name.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            directives,
            elements,
            helpers,
            globals,
            namespaces: namespaces
                .map(|m| NamespaceSchema {
                    alias: m.alias,
                    root: m.root,
                })
                .collect(),
            plugins,
        }
    }

    pub fn directive(&self, name: &str) -> Option<&DirectiveSchema> {
        self.directives.iter().find(|d| d.name == name)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}
