use crate::adapters::ProviderAdapter;
use crate::adapters::imagejob::ImageJobAdapter;
use crate::adapters::openai::{OpenAiChatAdapter, OpenAiImageAdapter};
use crate::adapters::signed::SignedStreamAdapter;
use crate::adapters::tools::{ToolLoopAdapter, ToolRunner};
use crate::catalog::{ModelCatalog, ModelConfig, ProviderKind};
use crate::error::{AppError, AppResult};
use std::sync::Arc;

/// Maps a model id to its catalog entry and the adapter that speaks the
/// model's upstream protocol.
#[derive(Clone)]
pub struct Dispatcher {
    catalog: ModelCatalog,
    tools: Vec<Arc<dyn ToolRunner>>,
}

impl Dispatcher {
    pub fn new(catalog: ModelCatalog, tools: Vec<Arc<dyn ToolRunner>>) -> Self {
        Self { catalog, tools }
    }

    pub async fn resolve(
        &self,
        model_id: &str,
    ) -> AppResult<(ModelConfig, Box<dyn ProviderAdapter>)> {
        let config = self
            .catalog
            .get_enabled(model_id)
            .await
            .ok_or_else(|| AppError::model_not_found(model_id))?;
        let adapter: Box<dyn ProviderAdapter> = match config.provider {
            ProviderKind::OpenAi if config.supports_vision => Box::new(OpenAiImageAdapter),
            ProviderKind::OpenAi if !self.tools.is_empty() => {
                Box::new(ToolLoopAdapter::new(self.tools.clone()))
            }
            ProviderKind::OpenAi => Box::new(OpenAiChatAdapter),
            ProviderKind::Signed => Box::new(SignedStreamAdapter),
            ProviderKind::ImageJob => Box::new(ImageJobAdapter),
        };
        Ok((config, adapter))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn catalog_with(model: &str, extra: serde_json::Value) -> ModelCatalog {
        let catalog = ModelCatalog::new();
        let mut entry = json!({
            "model": model,
            "provider": "open_ai",
            "settings": { "api_key": "sk-x", "base_url": "https://api.example.com" }
        });
        entry
            .as_object_mut()
            .unwrap()
            .extend(extra.as_object().unwrap().clone());
        catalog
            .register(serde_json::from_value(entry).unwrap())
            .await
            .unwrap();
        catalog
    }

    #[tokio::test]
    async fn unknown_model_is_rejected() {
        let dispatcher = Dispatcher::new(ModelCatalog::new(), Vec::new());
        let err = dispatcher.resolve("missing").await.unwrap_err();
        assert_eq!(err.code, "model_not_found");
    }

    #[tokio::test]
    async fn vision_models_get_the_image_adapter() {
        let catalog = catalog_with("draw-1", json!({ "supports_vision": true })).await;
        let dispatcher = Dispatcher::new(catalog, Vec::new());
        let (config, _adapter) = dispatcher.resolve("draw-1").await.unwrap();
        assert!(config.supports_vision);
    }
}
