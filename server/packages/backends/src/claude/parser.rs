use std::collections::HashMap;

use serde_json::Value;

/// Turns `stream-json` lines into text deltas.
///
/// Explicit deltas are used as-is. Full `message` snapshots are diffed against the
/// last text seen for each content index: an extension yields the suffix, anything
/// else yields the whole new text. A rewrite therefore re-emits text the consumer
/// has already seen.
#[derive(Debug, Default)]
pub struct DeltaParser {
    seen: HashMap<usize, String>,
}

impl DeltaParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` means the line carries nothing to emit.
    pub fn parse_line(&mut self, line: &str) -> Option<String> {
        let event: Value = serde_json::from_str(line.trim()).ok()?;
        let delta = explicit_delta(&event).or_else(|| self.snapshot_delta(&event))?;
        if delta.is_empty() {
            None
        } else {
            Some(delta)
        }
    }

    fn snapshot_delta(&mut self, event: &Value) -> Option<String> {
        let content = event.pointer("/message/content")?.as_array()?;
        let mut delta = String::new();
        for (index, block) in content.iter().enumerate() {
            let Some(text) = block.get("text").and_then(Value::as_str) else {
                continue;
            };
            match self.seen.get(&index) {
                Some(previous) if text.starts_with(previous.as_str()) => {
                    delta.push_str(&text[previous.len()..]);
                }
                _ => delta.push_str(text),
            }
            self.seen.insert(index, text.to_string());
        }
        Some(delta)
    }
}

fn explicit_delta(event: &Value) -> Option<String> {
    let text = match event.get("type").and_then(Value::as_str)? {
        "content_block_delta" => event.pointer("/delta/text"),
        "content_block_start" => event.pointer("/content_block/text"),
        "message_delta" => event.pointer("/delta/text"),
        _ => None,
    }?;
    text.as_str().map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_block_delta_yields_text() {
        let mut parser = DeltaParser::new();
        assert_eq!(
            parser.parse_line(r#"{"type":"content_block_delta","delta":{"text":"hello"}}"#),
            Some("hello".to_string())
        );
    }

    #[test]
    fn content_block_start_and_message_delta_yield_text() {
        let mut parser = DeltaParser::new();
        assert_eq!(
            parser.parse_line(r#"{"type":"content_block_start","content_block":{"type":"text","text":"Hi"}}"#),
            Some("Hi".to_string())
        );
        assert_eq!(
            parser.parse_line(r#"{"type":"message_delta","delta":{"text":" there"}}"#),
            Some(" there".to_string())
        );
    }

    #[test]
    fn snapshots_emit_suffix_of_previous_text() {
        let mut parser = DeltaParser::new();
        assert_eq!(
            parser.parse_line(r#"{"type":"assistant","message":{"content":[{"type":"text","text":"Hello"}]}}"#),
            Some("Hello".to_string())
        );
        assert_eq!(
            parser.parse_line(r#"{"type":"assistant","message":{"content":[{"type":"text","text":"Hello world"}]}}"#),
            Some(" world".to_string())
        );
        assert_eq!(
            parser.parse_line(r#"{"type":"assistant","message":{"content":[{"type":"text","text":"Hello world"}]}}"#),
            None
        );
    }

    #[test]
    fn snapshot_rewrite_emits_entire_new_text() {
        let mut parser = DeltaParser::new();
        parser.parse_line(
            r#"{"type":"assistant","message":{"content":[{"type":"text","text":"I'll review the codebase"}]}}"#,
        );
        assert_eq!(
            parser.parse_line(
                r#"{"type":"assistant","message":{"content":[{"type":"text","text":"Based on my review, here are the issues"}]}}"#
            ),
            Some("Based on my review, here are the issues".to_string())
        );
    }

    #[test]
    fn non_text_lines_are_ignored() {
        let mut parser = DeltaParser::new();
        assert_eq!(parser.parse_line("not json"), None);
        assert_eq!(parser.parse_line(r#"{"type":"system","subtype":"init"}"#), None);
        assert_eq!(
            parser.parse_line(r#"{"type":"assistant","message":{"content":[{"type":"tool_use","name":"Read"}]}}"#),
            None
        );
    }
}
