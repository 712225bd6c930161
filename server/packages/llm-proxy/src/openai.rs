use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use utoipa::ToSchema;

static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// `<prefix>_<nanos><counter>`, unique within the process.
pub fn new_id(prefix: &str) -> String {
    let nanos = OffsetDateTime::now_utc().unix_timestamp_nanos();
    let counter = ID_COUNTER.fetch_add(1, Ordering::Relaxed) % 1000;
    format!("{prefix}_{nanos}{counter:03}")
}

pub fn unix_now() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ModelObject {
    pub id: String,
    pub object: String,
    pub owned_by: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ModelListResponse {
    pub object: String,
    pub data: Vec<ModelObject>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ChatMessage {
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ChatCompletionRequest {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ChatChoice {
    pub index: u32,
    pub message: ChatMessage,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ChatCompletionResponse {
    pub id: String,
    pub object: String,
    pub model: String,
    pub choices: Vec<ChatChoice>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ResponsesCreateRequest {
    #[serde(default)]
    pub model: String,
    /// A prompt string or any JSON input, flattened into the prompt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct TextPart {
    #[serde(rename = "type")]
    pub kind: String,
    pub text: String,
}

impl TextPart {
    pub fn summary(text: impl Into<String>) -> Self {
        Self {
            kind: "summary_text".to_string(),
            text: text.into(),
        }
    }

    pub fn output(text: impl Into<String>) -> Self {
        Self {
            kind: "output_text".to_string(),
            text: text.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputItem {
    Reasoning {
        id: String,
        status: String,
        summary: Vec<TextPart>,
    },
    Message {
        id: String,
        role: String,
        status: String,
        content: Vec<TextPart>,
    },
}

impl OutputItem {
    pub fn reasoning(id: &str, status: &str, summary: Vec<TextPart>) -> Self {
        Self::Reasoning {
            id: id.to_string(),
            status: status.to_string(),
            summary,
        }
    }

    pub fn message(id: &str, status: &str, text: &str) -> Self {
        Self::Message {
            id: id.to_string(),
            role: "assistant".to_string(),
            status: status.to_string(),
            content: vec![TextPart::output(text)],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ResponseObject {
    pub id: String,
    pub object: String,
    pub created_at: i64,
    pub model: String,
    pub status: String,
    pub output: Vec<OutputItem>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ids_carry_prefix_and_are_unique() {
        let first = new_id("resp");
        let second = new_id("resp");
        assert!(first.starts_with("resp_"));
        assert_ne!(first, second);
    }

    #[test]
    fn output_items_serialize_with_type_tag() {
        let item = OutputItem::reasoning("rsn_1", "completed", vec![TextPart::summary("why")]);
        assert_eq!(
            serde_json::to_value(item).expect("serialize"),
            json!({
                "type": "reasoning",
                "id": "rsn_1",
                "status": "completed",
                "summary": [{"type": "summary_text", "text": "why"}],
            })
        );
        let item = OutputItem::message("msg_1", "in_progress", "");
        assert_eq!(
            serde_json::to_value(item).expect("serialize"),
            json!({
                "type": "message",
                "id": "msg_1",
                "role": "assistant",
                "status": "in_progress",
                "content": [{"type": "output_text", "text": ""}],
            })
        );
    }
}
