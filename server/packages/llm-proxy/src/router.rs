use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use llm_proxy_backends::{
    Adapter, ChatRequest, Message, ModelRouter, ResponseEvent, ResponsesRequest,
};
use llm_proxy_error::{ErrorBody, ErrorDetail, ErrorType, GatewayError};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::Span;
use utoipa::{Modify, OpenApi};

use crate::openai::{
    new_id, unix_now, ChatChoice, ChatCompletionRequest, ChatCompletionResponse, ChatMessage,
    ModelListResponse, ModelObject, OutputItem, ResponseObject, ResponsesCreateRequest, TextPart,
};
use crate::sse::{self, ChatStreamEmitter, ResponseStreamEmitter};
use crate::usage::{
    estimate_input_tokens, estimate_messages_tokens, estimate_text_tokens, TracingUsageObserver,
    UsageObserver,
};

pub struct AppState {
    router: ModelRouter,
    usage: Arc<dyn UsageObserver>,
}

impl AppState {
    pub fn new(router: ModelRouter) -> Self {
        Self::with_usage(router, Arc::new(TracingUsageObserver))
    }

    pub fn with_usage(router: ModelRouter, usage: Arc<dyn UsageObserver>) -> Self {
        Self { router, usage }
    }
}

pub fn build_router(state: AppState) -> Router {
    build_router_with_state(Arc::new(state)).0
}

pub fn build_router_with_state(shared: Arc<AppState>) -> (Router, Arc<AppState>) {
    let v1_router = Router::new()
        .route("/models", get(list_models))
        .route("/chat/completions", post(create_chat_completion))
        .route("/responses", post(create_response))
        .route("/openapi.json", get(get_openapi))
        .with_state(shared.clone());

    let mut router = Router::new().nest("/v1", v1_router).fallback(not_found);

    let http_logging = match std::env::var("LLM_PROXY_LOG_HTTP") {
        Ok(value) if value == "0" || value.eq_ignore_ascii_case("false") => false,
        _ => true,
    };
    if http_logging {
        let trace_layer = TraceLayer::new_for_http()
            .make_span_with(|req: &Request<_>| {
                tracing::info_span!(
                    "http.request",
                    method = %req.method(),
                    uri = %req.uri()
                )
            })
            .on_request(|_req: &Request<_>, span: &Span| {
                tracing::info!(parent: span, "request");
            })
            .on_response(|res: &Response<_>, latency: Duration, span: &Span| {
                tracing::info!(
                    parent: span,
                    status = %res.status(),
                    latency_ms = latency.as_millis()
                );
            });
        router = router.layer(trace_layer);
    }

    (router, shared)
}

#[derive(OpenApi)]
#[openapi(
    paths(list_models, create_chat_completion, create_response),
    components(
        schemas(
            ModelObject,
            ModelListResponse,
            ChatMessage,
            ChatCompletionRequest,
            ChatChoice,
            ChatCompletionResponse,
            ResponsesCreateRequest,
            ResponseObject,
            OutputItem,
            TextPart,
            ErrorBody,
            ErrorDetail,
            ErrorType
        )
    ),
    tags((name = "openai", description = "OpenAI-compatible endpoints")),
    modifiers(&ServerAddon)
)]
pub struct ApiDoc;

struct ServerAddon;

impl Modify for ServerAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        openapi.servers = Some(vec![utoipa::openapi::Server::new("http://localhost:8080")]);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            ApiError::Gateway(err) => (err.error_type().status_code(), err.to_error_body()),
        };
        let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(body)).into_response()
    }
}

async fn not_found() -> Response {
    let body = ErrorBody::new(ErrorType::NotFound, "not found");
    (StatusCode::NOT_FOUND, Json(body)).into_response()
}

async fn get_openapi() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

fn parse_body<T: DeserializeOwned>(body: &Bytes) -> Result<T, GatewayError> {
    serde_json::from_slice(body).map_err(|err| {
        tracing::debug!(error = %err, "rejecting request body");
        GatewayError::invalid_request("invalid JSON body")
    })
}

fn require_model(state: &AppState, model: &str) -> Result<(), GatewayError> {
    if model.is_empty() {
        return Err(GatewayError::invalid_request("model is required"));
    }
    state.usage.observe_model(model);
    Ok(())
}

#[utoipa::path(
    get,
    path = "/v1/models",
    responses(
        (status = 200, body = ModelListResponse),
        (status = 502, body = ErrorBody)
    ),
    tag = "openai"
)]
async fn list_models(State(state): State<Arc<AppState>>) -> Result<Json<ModelListResponse>, ApiError> {
    let models = state.router.list_models(&CancellationToken::new()).await?;
    let data = models
        .into_iter()
        .map(|model| ModelObject {
            id: model.id,
            object: "model".to_string(),
            owned_by: model.backend.to_string(),
        })
        .collect();
    Ok(Json(ModelListResponse {
        object: "list".to_string(),
        data,
    }))
}

#[utoipa::path(
    post,
    path = "/v1/chat/completions",
    request_body = ChatCompletionRequest,
    responses(
        (status = 200, body = ChatCompletionResponse, description = "Completion, or an SSE stream of chunks when `stream` is true"),
        (status = 400, body = ErrorBody),
        (status = 502, body = ErrorBody)
    ),
    tag = "openai"
)]
async fn create_chat_completion(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let request: ChatCompletionRequest = parse_body(&body)?;
    require_model(&state, &request.model)?;
    if request.messages.is_empty() {
        return Err(GatewayError::invalid_request("messages are required").into());
    }

    let stream = request.stream.unwrap_or(false);
    let request = ChatRequest {
        model: request.model,
        messages: request
            .messages
            .into_iter()
            .map(|message| Message::new(message.role, message.content))
            .collect(),
    };
    let adapter = state
        .router
        .adapter_for_model(&request.model, &CancellationToken::new())
        .await?;
    let prompt_tokens = estimate_messages_tokens(&request.messages);

    if stream {
        return Ok(stream_chat_completion(state, adapter, request, prompt_tokens));
    }

    let model = request.model.clone();
    let response = adapter.chat(request, &CancellationToken::new()).await?;
    let text = response.text.trim().to_string();
    state
        .usage
        .observe_usage(&model, prompt_tokens, estimate_text_tokens(&text));
    Ok(Json(ChatCompletionResponse {
        id: new_id("chatcmpl"),
        object: "chat.completion".to_string(),
        model,
        choices: vec![ChatChoice {
            index: 0,
            message: ChatMessage {
                role: "assistant".to_string(),
                content: text,
            },
            finish_reason: Some("stop".to_string()),
        }],
    })
    .into_response())
}

fn stream_chat_completion(
    state: Arc<AppState>,
    adapter: Arc<dyn Adapter>,
    request: ChatRequest,
    prompt_tokens: u64,
) -> Response {
    let cancel = CancellationToken::new();
    let (sink, body) = sse::channel(cancel.clone());
    tokio::spawn(async move {
        let _guard = cancel.clone().drop_guard();
        let model = request.model.clone();
        let mut emitter = ChatStreamEmitter::new(sink, &model);
        if emitter.start().is_err() {
            return;
        }
        let result = {
            let mut on_delta =
                |delta: &str| -> Result<(), GatewayError> { emitter.delta(delta) };
            adapter.chat_stream(request, &mut on_delta, &cancel).await
        };
        match result {
            Ok(_) => {
                state.usage.observe_usage(
                    &model,
                    prompt_tokens,
                    estimate_text_tokens(emitter.text()),
                );
                let _ = emitter.finish();
            }
            Err(err) => {
                tracing::warn!(model = %model, error = %err, "chat stream failed");
                emitter.fail(&err);
            }
        }
    });
    body.into_response()
}

#[utoipa::path(
    post,
    path = "/v1/responses",
    request_body = ResponsesCreateRequest,
    responses(
        (status = 200, body = ResponseObject, description = "Response, or an SSE stream of response events when `stream` is true"),
        (status = 400, body = ErrorBody),
        (status = 501, body = ErrorBody),
        (status = 502, body = ErrorBody)
    ),
    tag = "openai"
)]
async fn create_response(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let request: ResponsesCreateRequest = parse_body(&body)?;
    require_model(&state, &request.model)?;

    let stream = request.stream.unwrap_or(false);
    let request = ResponsesRequest {
        model: request.model,
        input: request.input.unwrap_or(Value::Null),
    };
    let adapter = state
        .router
        .adapter_for_model(&request.model, &CancellationToken::new())
        .await?;
    let prompt_tokens = estimate_input_tokens(&request.input);

    if stream {
        return Ok(stream_response(state, adapter, request, prompt_tokens));
    }

    let model = request.model.clone();
    let response = adapter.respond(request, &CancellationToken::new()).await?;
    state.usage.observe_usage(
        &model,
        prompt_tokens,
        estimate_text_tokens(&response.text) + estimate_text_tokens(&response.reasoning),
    );

    let mut output = Vec::with_capacity(2);
    let reasoning = response.reasoning.trim();
    if !reasoning.is_empty() {
        output.push(OutputItem::reasoning(
            &new_id("rsn"),
            "completed",
            vec![TextPart::summary(reasoning)],
        ));
    }
    output.push(OutputItem::message(&new_id("msg"), "completed", &response.text));
    Ok(Json(ResponseObject {
        id: new_id("resp"),
        object: "response".to_string(),
        created_at: unix_now(),
        model,
        status: "completed".to_string(),
        output,
    })
    .into_response())
}

fn stream_response(
    state: Arc<AppState>,
    adapter: Arc<dyn Adapter>,
    request: ResponsesRequest,
    prompt_tokens: u64,
) -> Response {
    let cancel = CancellationToken::new();
    let (sink, body) = sse::channel(cancel.clone());
    tokio::spawn(async move {
        let _guard = cancel.clone().drop_guard();
        let model = request.model.clone();
        let mut emitter = ResponseStreamEmitter::new(sink, &model);
        if emitter.start().is_err() {
            return;
        }
        let result = match adapter.event_stream() {
            Some(events) => {
                let mut on_event =
                    |event: ResponseEvent| -> Result<(), GatewayError> { emitter.event(event) };
                events
                    .respond_stream_events(request, &mut on_event, &cancel)
                    .await
            }
            None => {
                let mut on_delta =
                    |delta: &str| -> Result<(), GatewayError> { emitter.output_delta(delta) };
                adapter.respond_stream(request, &mut on_delta, &cancel).await
            }
        };
        match result {
            Ok(_) => {
                let completion_tokens = estimate_text_tokens(emitter.output_text())
                    + estimate_text_tokens(emitter.reasoning_text());
                state
                    .usage
                    .observe_usage(&model, prompt_tokens, completion_tokens);
                let _ = emitter.complete();
            }
            Err(err) => {
                tracing::warn!(model = %model, error = %err, "response stream failed");
                emitter.fail(&err);
            }
        }
    });
    body.into_response()
}
