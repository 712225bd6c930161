use std::convert::Infallible;

use axum::response::sse::Event;
use axum::response::Sse;
use futures::Stream;
use llm_proxy_backends::{ResponseEvent, ResponseEventKind};
use llm_proxy_error::GatewayError;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::openai::{new_id, unix_now, OutputItem, ResponseObject, TextPart};

const DONE: &str = "[DONE]";

/// Destination for SSE payloads. A send error means the client is gone.
pub trait EventSink: Send {
    fn send_json(&mut self, value: &Value) -> Result<(), GatewayError>;

    fn send_done(&mut self) -> Result<(), GatewayError>;
}

/// Feeds an axum SSE body. Cancels `cancel` as soon as the body is dropped.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Event>,
    cancel: CancellationToken,
}

impl ChannelSink {
    fn send(&mut self, event: Event) -> Result<(), GatewayError> {
        if self.tx.send(event).is_err() {
            self.cancel.cancel();
            return Err(GatewayError::Callback {
                message: "client disconnected".to_string(),
            });
        }
        Ok(())
    }
}

impl EventSink for ChannelSink {
    fn send_json(&mut self, value: &Value) -> Result<(), GatewayError> {
        let event = Event::default()
            .json_data(value)
            .unwrap_or_else(|_| Event::default().data("{}"));
        self.send(event)
    }

    fn send_done(&mut self) -> Result<(), GatewayError> {
        self.send(Event::default().data(DONE))
    }
}

/// Builds a sink and the matching SSE response. The stream ends once the sink is
/// dropped and `cancel` has fired.
pub fn channel(
    cancel: CancellationToken,
) -> (
    ChannelSink,
    Sse<impl Stream<Item = Result<Event, Infallible>>>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let watcher_tx = tx.clone();
    let watcher_cancel = cancel.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = watcher_tx.closed() => {
                tracing::debug!("sse client disconnected");
                watcher_cancel.cancel();
            }
            _ = watcher_cancel.cancelled() => {}
        }
    });
    let stream = UnboundedReceiverStream::new(rx).map(Ok::<Event, Infallible>);
    (ChannelSink { tx, cancel }, Sse::new(stream))
}

/// `chat.completion.chunk` stream: role chunk, content chunks, finish chunk, terminator.
pub struct ChatStreamEmitter<S> {
    sink: S,
    id: String,
    model: String,
    text: String,
}

impl<S: EventSink> ChatStreamEmitter<S> {
    pub fn new(sink: S, model: &str) -> Self {
        Self {
            sink,
            id: new_id("chatcmpl"),
            model: model.to_string(),
            text: String::new(),
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    fn chunk(&self, delta: Value, finish_reason: Option<&str>) -> Value {
        let mut choice = json!({ "index": 0, "delta": delta });
        if let Some(reason) = finish_reason {
            choice["finish_reason"] = json!(reason);
        }
        json!({
            "id": self.id,
            "object": "chat.completion.chunk",
            "model": self.model,
            "choices": [choice],
        })
    }

    pub fn start(&mut self) -> Result<(), GatewayError> {
        let chunk = self.chunk(json!({ "role": "assistant" }), None);
        self.sink.send_json(&chunk)
    }

    /// Whitespace-only deltas are forwarded as-is; only empty ones are dropped.
    pub fn delta(&mut self, delta: &str) -> Result<(), GatewayError> {
        if delta.is_empty() {
            return Ok(());
        }
        self.text.push_str(delta);
        let chunk = self.chunk(json!({ "content": delta }), None);
        self.sink.send_json(&chunk)
    }

    pub fn finish(&mut self) -> Result<(), GatewayError> {
        let chunk = self.chunk(json!({}), Some("stop"));
        self.sink.send_json(&chunk)?;
        self.sink.send_done()
    }

    /// Emits an error object and still terminates the stream.
    pub fn fail(&mut self, err: &GatewayError) {
        let body = err.to_error_body();
        let payload = json!({
            "id": self.id,
            "object": "error",
            "error": body.error,
        });
        let _ = self.sink.send_json(&payload);
        let _ = self.sink.send_done();
    }
}

#[derive(Debug, Clone)]
struct ItemSlot {
    id: String,
    index: u32,
}

/// Responses API event stream with at most one reasoning and one message item.
pub struct ResponseStreamEmitter<S> {
    sink: S,
    response_id: String,
    model: String,
    created_at: i64,
    sequence: u64,
    next_index: u32,
    reasoning: Option<ItemSlot>,
    message: Option<ItemSlot>,
    reasoning_text: String,
    output_text: String,
}

impl<S: EventSink> ResponseStreamEmitter<S> {
    pub fn new(sink: S, model: &str) -> Self {
        Self {
            sink,
            response_id: new_id("resp"),
            model: model.to_string(),
            created_at: unix_now(),
            sequence: 1,
            next_index: 0,
            reasoning: None,
            message: None,
            reasoning_text: String::new(),
            output_text: String::new(),
        }
    }

    pub fn output_text(&self) -> &str {
        &self.output_text
    }

    pub fn reasoning_text(&self) -> &str {
        &self.reasoning_text
    }

    fn next_sequence(&mut self) -> u64 {
        let sequence = self.sequence;
        self.sequence += 1;
        sequence
    }

    fn emit(&mut self, mut payload: Value) -> Result<(), GatewayError> {
        payload["sequence_number"] = json!(self.next_sequence());
        self.sink.send_json(&payload)
    }

    fn claim_index(&mut self) -> u32 {
        let index = self.next_index;
        self.next_index += 1;
        index
    }

    fn response(&self, status: &str, output: Vec<OutputItem>) -> ResponseObject {
        ResponseObject {
            id: self.response_id.clone(),
            object: "response".to_string(),
            created_at: self.created_at,
            model: self.model.clone(),
            status: status.to_string(),
            output,
        }
    }

    pub fn start(&mut self) -> Result<(), GatewayError> {
        let payload = json!({
            "type": "response.created",
            "response": self.response("in_progress", Vec::new()),
        });
        self.sink.send_json(&payload)
    }

    fn reasoning_slot(&mut self) -> Result<ItemSlot, GatewayError> {
        if let Some(slot) = &self.reasoning {
            return Ok(slot.clone());
        }
        let slot = ItemSlot {
            id: new_id("rsn"),
            index: self.claim_index(),
        };
        self.reasoning = Some(slot.clone());
        self.emit(json!({
            "type": "response.output_item.added",
            "output_index": slot.index,
            "item": OutputItem::reasoning(&slot.id, "in_progress", Vec::new()),
        }))?;
        self.emit(json!({
            "type": "response.reasoning_summary_part.added",
            "item_id": slot.id,
            "output_index": slot.index,
            "summary_index": 0,
            "part": TextPart::summary(""),
        }))?;
        Ok(slot)
    }

    fn message_slot(&mut self) -> Result<ItemSlot, GatewayError> {
        if let Some(slot) = &self.message {
            return Ok(slot.clone());
        }
        let slot = ItemSlot {
            id: new_id("msg"),
            index: self.claim_index(),
        };
        self.message = Some(slot.clone());
        self.emit(json!({
            "type": "response.output_item.added",
            "output_index": slot.index,
            "item": OutputItem::message(&slot.id, "in_progress", ""),
        }))?;
        Ok(slot)
    }

    pub fn reasoning_delta(&mut self, delta: &str) -> Result<(), GatewayError> {
        if delta.is_empty() {
            return Ok(());
        }
        let slot = self.reasoning_slot()?;
        self.reasoning_text.push_str(delta);
        self.emit(json!({
            "type": "response.reasoning_summary_text.delta",
            "item_id": slot.id,
            "output_index": slot.index,
            "summary_index": 0,
            "delta": delta,
        }))?;
        self.emit(json!({
            "type": "response.reasoning_text.delta",
            "item_id": slot.id,
            "output_index": slot.index,
            "content_index": 0,
            "delta": delta,
        }))
    }

    pub fn output_delta(&mut self, delta: &str) -> Result<(), GatewayError> {
        if delta.is_empty() {
            return Ok(());
        }
        let slot = self.message_slot()?;
        self.output_text.push_str(delta);
        self.emit(json!({
            "type": "response.output_text.delta",
            "item_id": slot.id,
            "output_index": slot.index,
            "content_index": 0,
            "delta": delta,
            "logprobs": [],
        }))
    }

    pub fn event(&mut self, event: ResponseEvent) -> Result<(), GatewayError> {
        match event.kind {
            ResponseEventKind::Reasoning => self.reasoning_delta(&event.delta),
            ResponseEventKind::Output => self.output_delta(&event.delta),
        }
    }

    pub fn complete(&mut self) -> Result<(), GatewayError> {
        let message = self.message_slot()?;
        let mut output = Vec::with_capacity(2);

        if let Some(reasoning) = self.reasoning.clone() {
            let text = self.reasoning_text.clone();
            self.emit(json!({
                "type": "response.reasoning_summary_text.done",
                "item_id": reasoning.id,
                "output_index": reasoning.index,
                "summary_index": 0,
                "text": text,
            }))?;
            self.emit(json!({
                "type": "response.reasoning_summary_part.done",
                "item_id": reasoning.id,
                "output_index": reasoning.index,
                "summary_index": 0,
                "part": TextPart::summary(text.as_str()),
            }))?;
            self.emit(json!({
                "type": "response.reasoning_text.done",
                "item_id": reasoning.id,
                "output_index": reasoning.index,
                "content_index": 0,
                "text": text,
            }))?;
            let item = OutputItem::reasoning(
                &reasoning.id,
                "completed",
                vec![TextPart::summary(text.as_str())],
            );
            self.emit(json!({
                "type": "response.output_item.done",
                "output_index": reasoning.index,
                "item": item,
            }))?;
            output.push((reasoning.index, item));
        }

        let text = self.output_text.clone();
        self.emit(json!({
            "type": "response.output_text.done",
            "item_id": message.id,
            "output_index": message.index,
            "content_index": 0,
            "text": text,
            "logprobs": [],
        }))?;
        let item = OutputItem::message(&message.id, "completed", &text);
        self.emit(json!({
            "type": "response.output_item.done",
            "output_index": message.index,
            "item": item,
        }))?;
        output.push((message.index, item));

        output.sort_by_key(|(index, _)| *index);
        let output = output.into_iter().map(|(_, item)| item).collect();
        let payload = json!({
            "type": "response.completed",
            "response": self.response("completed", output),
        });
        self.emit(payload)?;
        self.sink.send_done()
    }

    /// Emits an error event and still terminates the stream.
    pub fn fail(&mut self, err: &GatewayError) {
        let body = err.to_error_body();
        let payload = json!({
            "type": "error",
            "error": body.error,
        });
        let _ = self.sink.send_json(&payload);
        let _ = self.sink.send_done();
    }
}
