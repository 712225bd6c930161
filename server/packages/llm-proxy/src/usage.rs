use llm_proxy_backends::Message;
use serde_json::Value;

/// Per-request observation hooks. Aggregation and display live outside the gateway.
pub trait UsageObserver: Send + Sync {
    fn observe_model(&self, model: &str);

    fn observe_usage(&self, model: &str, prompt_tokens: u64, completion_tokens: u64);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingUsageObserver;

impl UsageObserver for TracingUsageObserver {
    fn observe_model(&self, model: &str) {
        tracing::debug!(model = %model, "model requested");
    }

    fn observe_usage(&self, model: &str, prompt_tokens: u64, completion_tokens: u64) {
        tracing::info!(
            model = %model,
            prompt_tokens,
            completion_tokens,
            "estimated token usage"
        );
    }
}

/// Roughly four characters per token, rounded up. Blank text counts as zero.
pub fn estimate_text_tokens(text: &str) -> u64 {
    let text = text.trim();
    if text.is_empty() {
        return 0;
    }
    let chars = text.chars().count() as u64;
    chars.div_ceil(4).max(1)
}

pub fn estimate_messages_tokens(messages: &[Message]) -> u64 {
    messages
        .iter()
        .map(|message| estimate_text_tokens(&message.role) + estimate_text_tokens(&message.content))
        .sum()
}

pub fn estimate_input_tokens(input: &Value) -> u64 {
    match input {
        Value::Null => 0,
        Value::String(text) => estimate_text_tokens(text),
        other => estimate_text_tokens(&other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn text_estimate_rounds_up_on_trimmed_chars() {
        assert_eq!(estimate_text_tokens(""), 0);
        assert_eq!(estimate_text_tokens("   \n"), 0);
        assert_eq!(estimate_text_tokens("a"), 1);
        assert_eq!(estimate_text_tokens("  abcd  "), 1);
        assert_eq!(estimate_text_tokens("abcde"), 2);
        assert_eq!(estimate_text_tokens("héllo"), 2);
    }

    #[test]
    fn message_estimate_sums_role_and_content() {
        let messages = vec![
            Message::new("user", "abcdefgh"),
            Message::new("system", ""),
        ];
        assert_eq!(estimate_messages_tokens(&messages), 1 + 2 + 2);
    }

    #[test]
    fn input_estimate_serializes_structured_input() {
        assert_eq!(estimate_input_tokens(&Value::Null), 0);
        assert_eq!(estimate_input_tokens(&json!("abcd")), 1);
        // {"a":1} is seven chars
        assert_eq!(estimate_input_tokens(&json!({"a": 1})), 2);
    }
}
