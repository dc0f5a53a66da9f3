//! Model registry: `provider/model` refs resolved before a turn starts.

use std::collections::HashMap;

use oc_domain::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct ModelInfo {
    pub provider: String,
    pub model: String,
    /// Whether the model accepts a thinking-level parameter at all.
    pub supports_thinking: bool,
}

#[derive(Debug, Default)]
pub struct ModelRegistry {
    models: HashMap<String, ModelInfo>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in catalogue plus whatever the config registers.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        for (provider, model, thinking) in [
            ("anthropic", "claude-opus-4", true),
            ("anthropic", "claude-sonnet-4", true),
            ("anthropic", "claude-haiku-3-5", false),
            ("openai", "gpt-4o", false),
            ("openai", "o3", true),
            ("google", "gemini-2-5-pro", true),
        ] {
            registry.register(provider, model, thinking);
        }
        registry
    }

    pub fn register(&mut self, provider: &str, model: &str, supports_thinking: bool) {
        self.models.insert(
            format!("{provider}/{model}"),
            ModelInfo {
                provider: provider.to_owned(),
                model: model.to_owned(),
                supports_thinking,
            },
        );
    }

    /// Resolve a `provider/model` ref. Unknown refs are configuration
    /// errors and never retried.
    pub fn resolve(&self, model_ref: &str) -> Result<&ModelInfo> {
        self.models
            .get(model_ref)
            .ok_or_else(|| Error::Config(format!("unknown-model: {model_ref}")))
    }

    pub fn list(&self) -> Vec<&ModelInfo> {
        let mut all: Vec<&ModelInfo> = self.models.values().collect();
        all.sort_by(|a, b| (&a.provider, &a.model).cmp(&(&b.provider, &b.model)));
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_known_model() {
        let registry = ModelRegistry::with_defaults();
        let info = registry.resolve("anthropic/claude-sonnet-4").unwrap();
        assert_eq!(info.provider, "anthropic");
        assert!(info.supports_thinking);
    }

    #[test]
    fn unknown_model_is_config_error() {
        let registry = ModelRegistry::with_defaults();
        let err = registry.resolve("nope/nothing").unwrap_err();
        assert!(err.to_string().contains("unknown-model"));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn register_overrides() {
        let mut registry = ModelRegistry::new();
        registry.register("local", "llama", false);
        assert!(registry.resolve("local/llama").is_ok());
        assert_eq!(registry.list().len(), 1);
    }
}
