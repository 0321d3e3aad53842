use crate::engine::Engine;
use thiserror::Error;

/// A bundle of directives, elements, helpers and namespaces installed into an
/// engine (or a fork) in one call. Options are fields of the plugin value.
pub trait Plugin {
    fn name(&self) -> &str;
    fn load(&self, engine: &Engine) -> Result<(), PluginError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("plugin `{plugin}` failed to load: {message}")]
pub struct PluginError {
    pub plugin: String,
    pub message: String,
}

impl PluginError {
    pub fn new(plugin: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            plugin: plugin.into(),
            message: message.into(),
        }
    }
}
