use crate::config::{ImageJobSettings, OpenAiSettings, SignedSettings};
use crate::pricing::UnitPrices;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    OpenAi,
    Signed,
    ImageJob,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAi => "open_ai",
            Self::Signed => "signed",
            Self::ImageJob => "image_job",
        }
    }
}

/// Provider settings, already validated against the provider kind. The
/// catalog rejects malformed settings at registration time so adapters
/// never have to re-check them per call.
#[derive(Debug, Clone)]
pub enum AdapterSettings {
    OpenAi(OpenAiSettings),
    Signed(SignedSettings),
    ImageJob(ImageJobSettings),
}

#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub model: String,
    pub name: String,
    pub provider: ProviderKind,
    pub upstream_model: String,
    pub enabled: bool,
    pub supports_system: bool,
    pub supports_vision: bool,
    pub prices: UnitPrices,
    pub settings: AdapterSettings,
}

/// Raw catalog entry as loaded from configuration. The free-form settings
/// map is parsed into a typed struct by [`ModelConfig::from_entry`].
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelEntry {
    pub model: String,
    #[serde(default)]
    pub name: Option<String>,
    pub provider: ProviderKind,
    #[serde(default)]
    pub upstream_model: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Whether the upstream accepts a system role; when false, system
    /// turns are downgraded to user turns before the call.
    #[serde(default = "default_enabled")]
    pub supports_system: bool,
    #[serde(default)]
    pub supports_vision: bool,
    #[serde(default)]
    pub prices: UnitPrices,
    pub settings: Value,
}

fn default_enabled() -> bool {
    true
}

impl ModelConfig {
    pub fn from_entry(entry: ModelEntry) -> Result<Self, String> {
        let settings = match entry.provider {
            ProviderKind::OpenAi => {
                let parsed: OpenAiSettings = serde_json::from_value(entry.settings)
                    .map_err(|err| format!("invalid open_ai settings for {}: {err}", entry.model))?;
                AdapterSettings::OpenAi(parsed)
            }
            ProviderKind::Signed => {
                let parsed: SignedSettings = serde_json::from_value(entry.settings)
                    .map_err(|err| format!("invalid signed settings for {}: {err}", entry.model))?;
                AdapterSettings::Signed(parsed)
            }
            ProviderKind::ImageJob => {
                let parsed: ImageJobSettings = serde_json::from_value(entry.settings)
                    .map_err(|err| {
                        format!("invalid image_job settings for {}: {err}", entry.model)
                    })?;
                AdapterSettings::ImageJob(parsed)
            }
        };
        Ok(Self {
            name: entry.name.unwrap_or_else(|| entry.model.clone()),
            upstream_model: entry
                .upstream_model
                .unwrap_or_else(|| entry.model.clone()),
            model: entry.model,
            provider: entry.provider,
            enabled: entry.enabled,
            supports_system: entry.supports_system,
            supports_vision: entry.supports_vision,
            prices: entry.prices,
            settings,
        })
    }
}

#[derive(Clone)]
pub struct ModelCatalog {
    inner: Arc<RwLock<HashMap<String, ModelConfig>>>,
}

impl ModelCatalog {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn register(&self, entry: ModelEntry) -> Result<(), String> {
        let config = ModelConfig::from_entry(entry)?;
        let mut guard = self.inner.write().await;
        guard.insert(config.model.clone(), config);
        Ok(())
    }

    pub async fn replace_all(&self, entries: Vec<ModelEntry>) -> Result<(), String> {
        let mut parsed = HashMap::new();
        for entry in entries {
            let config = ModelConfig::from_entry(entry)?;
            parsed.insert(config.model.clone(), config);
        }
        let mut guard = self.inner.write().await;
        *guard = parsed;
        Ok(())
    }

    pub async fn get_enabled(&self, model: &str) -> Option<ModelConfig> {
        let guard = self.inner.read().await;
        guard.get(model).filter(|m| m.enabled).cloned()
    }

    pub async fn list_enabled(&self) -> Vec<ModelConfig> {
        let guard = self.inner.read().await;
        let mut models: Vec<ModelConfig> =
            guard.values().filter(|m| m.enabled).cloned().collect();
        models.sort_by(|a, b| a.model.cmp(&b.model));
        models
    }
}

impl Default for ModelCatalog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn register_rejects_malformed_settings() {
        let catalog = ModelCatalog::new();
        let entry: ModelEntry = serde_json::from_value(json!({
            "model": "gpt-test",
            "provider": "open_ai",
            "settings": { "base_url": "https://api.example.com" }
        }))
        .unwrap();
        // api_key is required for open_ai providers.
        assert!(catalog.register(entry).await.is_err());
    }

    #[tokio::test]
    async fn disabled_models_are_invisible() {
        let catalog = ModelCatalog::new();
        let entry: ModelEntry = serde_json::from_value(json!({
            "model": "gpt-test",
            "provider": "open_ai",
            "enabled": false,
            "settings": { "api_key": "sk-x", "base_url": "https://api.example.com" }
        }))
        .unwrap();
        catalog.register(entry).await.unwrap();
        assert!(catalog.get_enabled("gpt-test").await.is_none());
        assert!(catalog.list_enabled().await.is_empty());
    }
}
