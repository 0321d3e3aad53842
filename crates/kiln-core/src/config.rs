use crate::codegen::DirectivePolicy;
use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineOptions {
    /// Serve cached units without re-reading or re-hashing sources.
    #[serde(default)]
    pub production: bool,
    /// Return failures to the caller instead of rendering a diagnostic page.
    #[serde(default)]
    pub silent: bool,
    #[serde(default = "default_extension")]
    pub extension: String,
    /// Name under which render locals are exposed to templates.
    #[serde(default = "default_variable")]
    pub variable: String,
    #[serde(default)]
    pub strict_directives: bool,
}

fn default_extension() -> String {
    "kiln".to_string()
}

fn default_variable() -> String {
    "it".to_string()
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            production: false,
            silent: false,
            extension: default_extension(),
            variable: default_variable(),
            strict_directives: false,
        }
    }
}

fn flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

impl EngineOptions {
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    /// Defaults overridden by `KILN_ENV`, `KILN_SILENT` and `KILN_EXTENSION`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut options = Self::default();
        if let Some(env) = lookup("KILN_ENV") {
            options.production = env.trim().eq_ignore_ascii_case("production");
        }
        if let Some(silent) = lookup("KILN_SILENT") {
            options.silent = flag(&silent);
        }
        if let Some(ext) = lookup("KILN_EXTENSION").filter(|e| !e.trim().is_empty()) {
            options.extension = ext.trim().trim_start_matches('.').to_string();
        }
        options
    }

    pub fn production(mut self, production: bool) -> Self {
        self.production = production;
        self
    }

    pub fn silent(mut self, silent: bool) -> Self {
        self.silent = silent;
        self
    }

    pub fn extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = extension.into();
        self
    }

    pub fn strict_directives(mut self, strict: bool) -> Self {
        self.strict_directives = strict;
        self
    }

    pub fn policy(&self) -> DirectivePolicy {
        if self.strict_directives {
            DirectivePolicy::Strict
        } else {
            DirectivePolicy::PassThrough
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn json_fields_default_individually() {
        let options = EngineOptions::from_json(r#"{ "production": true, "strictDirectives": true }"#)
            .expect("valid options");
        assert!(options.production);
        assert_eq!(options.extension, "kiln");
        assert_eq!(options.variable, "it");
        assert_eq!(options.policy(), DirectivePolicy::Strict);
    }

    #[test]
    fn environment_overrides() {
        let env: HashMap<&str, &str> = [
            ("KILN_ENV", "production"),
            ("KILN_SILENT", "yes"),
            ("KILN_EXTENSION", ".html"),
        ]
        .into_iter()
        .collect();
        let options = EngineOptions::from_lookup(|k| env.get(k).map(|v| v.to_string()));
        assert!(options.production);
        assert!(options.silent);
        assert_eq!(options.extension, "html");

        let empty = EngineOptions::from_lookup(|_| None);
        assert_eq!(empty, EngineOptions::default());
    }
}
