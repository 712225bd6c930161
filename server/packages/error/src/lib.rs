use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    InvalidRequestError,
    ConfigurationError,
    UpstreamError,
    ClientClosed,
    NotImplemented,
    NotFound,
}

impl ErrorType {
    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidRequestError => 400,
            Self::ConfigurationError => 502,
            Self::UpstreamError => 502,
            Self::ClientClosed => 499,
            Self::NotImplemented => 501,
            Self::NotFound => 404,
        }
    }
}

/// OpenAI-style error payload: `{"error": {"type": ..., "message": ...}}`.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorDetail {
    #[serde(rename = "type")]
    pub type_: ErrorType,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i64>,
    #[serde(flatten, default, skip_serializing_if = "Map::is_empty")]
    pub extensions: Map<String, Value>,
}

impl ErrorBody {
    pub fn new(error_type: ErrorType, message: impl Into<String>) -> Self {
        Self {
            error: ErrorDetail {
                type_: error_type,
                message: message.into(),
                code: None,
                extensions: Map::new(),
            },
        }
    }
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("{message}")]
    InvalidRequest { message: String },
    #[error("unsupported model id: {model}")]
    UnsupportedModel { model: String },
    #[error("{backend} configuration error: {message}")]
    Configuration { backend: String, message: String },
    #[error("{message}")]
    Transport { message: String },
    #[error("{method} failed: ({code}) {message}")]
    Protocol {
        method: String,
        code: i64,
        message: String,
    },
    #[error("{backend} stream ended: {stderr}")]
    StreamEnded { backend: String, stderr: String },
    #[error("{backend} returned empty assistant output")]
    EmptyOutput { backend: String },
    #[error("stream consumer failed: {message}")]
    Callback { message: String },
    #[error("request cancelled")]
    Cancelled,
    #[error("not implemented: {capability}")]
    NotImplemented { capability: String },
}

impl GatewayError {
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Protocol violations that did not come with an RPC error object.
    pub fn malformed(method: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Protocol {
            method: method.into(),
            code: 0,
            message: message.into(),
        }
    }

    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::InvalidRequest { .. } | Self::UnsupportedModel { .. } => {
                ErrorType::InvalidRequestError
            }
            Self::Configuration { .. } => ErrorType::ConfigurationError,
            Self::Transport { .. }
            | Self::Protocol { .. }
            | Self::StreamEnded { .. }
            | Self::EmptyOutput { .. } => ErrorType::UpstreamError,
            Self::Callback { .. } | Self::Cancelled => ErrorType::ClientClosed,
            Self::NotImplemented { .. } => ErrorType::NotImplemented,
        }
    }

    /// True when the failure originated in the consumer rather than the backend.
    pub fn is_client_side(&self) -> bool {
        matches!(self, Self::Callback { .. } | Self::Cancelled)
    }

    pub fn to_error_body(&self) -> ErrorBody {
        let mut body = ErrorBody::new(self.error_type(), self.to_string());
        match self {
            Self::Protocol { code, method, .. } => {
                if *code != 0 {
                    body.error.code = Some(*code);
                }
                body.error
                    .extensions
                    .insert("method".to_string(), Value::String(method.clone()));
            }
            Self::UnsupportedModel { model } => {
                body.error
                    .extensions
                    .insert("param".to_string(), Value::String("model".to_string()));
                body.error
                    .extensions
                    .insert("model".to_string(), Value::String(model.clone()));
            }
            Self::Configuration { backend, .. }
            | Self::StreamEnded { backend, .. }
            | Self::EmptyOutput { backend } => {
                body.error
                    .extensions
                    .insert("backend".to_string(), Value::String(backend.clone()));
            }
            _ => {}
        }
        body
    }
}
