use serde_json::Value;

use crate::types::Message;

/// Renders chat messages as `[role] content` lines.
pub fn build_chat_prompt(messages: &[Message]) -> String {
    let lines: Vec<String> = messages
        .iter()
        .map(|message| {
            let role = match message.role.trim() {
                "" => "user",
                role => role,
            };
            format!("[{role}] {}", message.content)
        })
        .collect();
    lines.join("\n").trim().to_string()
}

pub fn build_responses_prompt(input: &Value) -> String {
    match input {
        Value::Null => String::new(),
        Value::String(text) => text.trim().to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn chat_prompt_tags_each_message_with_its_role() {
        let prompt = build_chat_prompt(&[
            Message::new("system", "be brief"),
            Message::new("", "hi there"),
            Message::new("assistant", "hello"),
        ]);
        assert_eq!(prompt, "[system] be brief\n[user] hi there\n[assistant] hello");
    }

    #[test]
    fn chat_prompt_is_trimmed() {
        let prompt = build_chat_prompt(&[Message::new("user", "question  \n")]);
        assert_eq!(prompt, "[user] question");
    }

    #[test]
    fn responses_prompt_accepts_strings_and_json() {
        assert_eq!(build_responses_prompt(&json!("  hello ")), "hello");
        assert_eq!(build_responses_prompt(&Value::Null), "");
        assert_eq!(
            build_responses_prompt(&json!([{"role": "user", "content": "hi"}])),
            r#"[{"content":"hi","role":"user"}]"#
        );
    }
}
