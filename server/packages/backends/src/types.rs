use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Claude,
    Codex,
}

impl Backend {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Claude => "claude",
            Self::Codex => "codex",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Model {
    pub id: String,
    pub backend: Backend,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub content: String,
}

impl Message {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<Message>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatResponse {
    pub model: String,
    pub text: String,
}

/// A `/v1/responses` request; `input` is either a plain string or arbitrary JSON.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponsesRequest {
    pub model: String,
    pub input: Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponsesResponse {
    pub model: String,
    pub text: String,
    pub reasoning: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseEventKind {
    Reasoning,
    Output,
}

/// The unit every adapter emits toward the SSE layer. Emission order is the only ordering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseEvent {
    pub kind: ResponseEventKind,
    pub delta: String,
}

impl ResponseEvent {
    pub fn reasoning(delta: impl Into<String>) -> Self {
        Self {
            kind: ResponseEventKind::Reasoning,
            delta: delta.into(),
        }
    }

    pub fn output(delta: impl Into<String>) -> Self {
        Self {
            kind: ResponseEventKind::Output,
            delta: delta.into(),
        }
    }
}
