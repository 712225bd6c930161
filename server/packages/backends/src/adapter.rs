use std::future::Future;

use async_trait::async_trait;
use llm_proxy_error::GatewayError;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

use crate::types::{
    Backend, ChatRequest, ChatResponse, Model, ResponseEvent, ResponsesRequest, ResponsesResponse,
};

/// Receives plain text deltas. Returning an error aborts the in-flight backend call.
pub type DeltaCallback<'a> = dyn FnMut(&str) -> Result<(), GatewayError> + Send + 'a;

/// Receives typed reasoning/output events.
pub type EventCallback<'a> = dyn FnMut(ResponseEvent) -> Result<(), GatewayError> + Send + 'a;

#[async_trait]
pub trait Adapter: Send + Sync {
    fn backend(&self) -> Backend;

    async fn list_models(&self, cancel: &CancellationToken) -> Result<Vec<Model>, GatewayError>;

    async fn supports_model(
        &self,
        model: &str,
        cancel: &CancellationToken,
    ) -> Result<bool, GatewayError>;

    async fn chat(
        &self,
        request: ChatRequest,
        cancel: &CancellationToken,
    ) -> Result<ChatResponse, GatewayError>;

    async fn chat_stream(
        &self,
        request: ChatRequest,
        on_delta: &mut DeltaCallback<'_>,
        cancel: &CancellationToken,
    ) -> Result<ChatResponse, GatewayError>;

    async fn respond(
        &self,
        _request: ResponsesRequest,
        _cancel: &CancellationToken,
    ) -> Result<ResponsesResponse, GatewayError> {
        Err(GatewayError::NotImplemented {
            capability: format!("{} responses", self.backend()),
        })
    }

    /// Streams output text only. Backends with reasoning expose [`EventStreamAdapter`].
    async fn respond_stream(
        &self,
        _request: ResponsesRequest,
        _on_delta: &mut DeltaCallback<'_>,
        _cancel: &CancellationToken,
    ) -> Result<ResponsesResponse, GatewayError> {
        Err(GatewayError::NotImplemented {
            capability: format!("{} streaming responses", self.backend()),
        })
    }

    /// Optional typed-event capability, checked at the call site.
    fn event_stream(&self) -> Option<&dyn EventStreamAdapter> {
        None
    }
}

#[async_trait]
pub trait EventStreamAdapter: Send + Sync {
    async fn respond_stream_events(
        &self,
        request: ResponsesRequest,
        on_event: &mut EventCallback<'_>,
        cancel: &CancellationToken,
    ) -> Result<ResponsesResponse, GatewayError>;
}

/// Caches the first outcome of an auth-mode check for the adapter's lifetime.
#[derive(Debug)]
pub struct AuthGate {
    backend: Backend,
    outcome: OnceCell<Result<(), String>>,
}

impl AuthGate {
    pub fn new(backend: Backend) -> Self {
        Self {
            backend,
            outcome: OnceCell::new(),
        }
    }

    pub async fn ensure<F, Fut>(&self, check: F) -> Result<(), GatewayError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), String>>,
    {
        let outcome = self
            .outcome
            .get_or_init(|| async {
                let outcome = check().await;
                match &outcome {
                    Ok(()) => tracing::info!(backend = %self.backend, "auth check passed"),
                    Err(message) => {
                        tracing::warn!(backend = %self.backend, error = %message, "auth check failed")
                    }
                }
                outcome
            })
            .await;
        outcome
            .as_ref()
            .map(|_| ())
            .map_err(|message| GatewayError::Configuration {
                backend: self.backend.to_string(),
                message: message.clone(),
            })
    }
}
