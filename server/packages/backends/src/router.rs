use std::sync::Arc;

use llm_proxy_error::GatewayError;
use tokio_util::sync::CancellationToken;

use crate::adapter::Adapter;
use crate::types::Model;

/// Picks the first registered adapter that claims a model id.
#[derive(Clone)]
pub struct ModelRouter {
    adapters: Vec<Arc<dyn Adapter>>,
}

impl ModelRouter {
    pub fn new(adapters: Vec<Arc<dyn Adapter>>) -> Self {
        Self { adapters }
    }

    pub async fn adapter_for_model(
        &self,
        model: &str,
        cancel: &CancellationToken,
    ) -> Result<Arc<dyn Adapter>, GatewayError> {
        for adapter in &self.adapters {
            let supported = adapter.supports_model(model, cancel).await.map_err(|err| {
                tracing::warn!(
                    backend = %adapter.backend(),
                    model = %model,
                    error = %err,
                    "failed checking backend models"
                );
                err
            })?;
            if supported {
                tracing::debug!(backend = %adapter.backend(), model = %model, "model routed");
                return Ok(adapter.clone());
            }
        }
        Err(GatewayError::UnsupportedModel {
            model: model.to_string(),
        })
    }

    pub async fn list_models(&self, cancel: &CancellationToken) -> Result<Vec<Model>, GatewayError> {
        let mut models = Vec::new();
        for adapter in &self.adapters {
            models.extend(adapter.list_models(cancel).await?);
        }
        Ok(models)
    }
}
