use llm_proxy_error::GatewayError;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::adapter::EventCallback;
use crate::rpc::{Observer, RpcMessage};
use crate::types::ResponseEvent;

pub(crate) const REASONING_SUMMARY_DELTA: &str = "item/reasoning/summaryTextDelta";
pub(crate) const AGENT_MESSAGE_DELTA: &str = "item/agentMessage/delta";
pub(crate) const ITEM_STARTED: &str = "item/started";
pub(crate) const ITEM_COMPLETED: &str = "item/completed";
pub(crate) const TASK_COMPLETE: &str = "codex/event/task_complete";
pub(crate) const TURN_COMPLETED: &str = "turn/completed";

/// Text accumulated over one turn.
#[derive(Debug, Default)]
pub struct TurnState {
    open_message: String,
    completed_messages: Vec<String>,
    reasoning: String,
    message_open: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnResult {
    pub output: String,
    pub reasoning: String,
}

impl TurnState {
    pub fn append_reasoning(&mut self, delta: &str) {
        if delta.trim().is_empty() {
            return;
        }
        self.reasoning.push_str(delta);
    }

    pub fn append_agent_delta(&mut self, delta: &str) {
        self.open_message.push_str(delta);
        self.message_open = true;
    }

    /// A new agent message item; flushes one that never saw `item/completed`.
    pub fn start_agent_message(&mut self) {
        if !self.open_message.is_empty() {
            self.finalize();
        }
        self.message_open = true;
    }

    pub fn finalize(&mut self) {
        let text = self.open_message.trim();
        if !text.is_empty() {
            self.completed_messages.push(text.to_string());
        }
        self.open_message.clear();
        self.message_open = false;
    }

    /// Output is the backend's last agent message when given, else the last completed
    /// message. Earlier completed messages are treated as intermediate reasoning.
    pub fn result(&mut self, last_agent_message: &str) -> TurnResult {
        if self.message_open || !self.open_message.is_empty() {
            self.finalize();
        }

        let last_agent_message = last_agent_message.trim();
        let output = if last_agent_message.is_empty() {
            self.completed_messages.last().cloned().unwrap_or_default()
        } else {
            last_agent_message.to_string()
        };

        let mut reasoning = self.reasoning.trim().to_string();
        if self.completed_messages.len() > 1 {
            let intermediate =
                self.completed_messages[..self.completed_messages.len() - 1].join("\n\n");
            if !reasoning.is_empty() {
                reasoning.push_str("\n\n");
            }
            reasoning.push_str(&intermediate);
        }

        TurnResult { output, reasoning }
    }
}

/// Routes turn notifications into a [`TurnState`] and forwards reasoning deltas.
#[derive(Debug, Default)]
pub struct TurnDriver {
    state: TurnState,
    last_agent_message: String,
    completed: bool,
    reasoning_streamed: bool,
}

impl TurnDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn completed(&self) -> bool {
        self.completed
    }

    pub fn handle(
        &mut self,
        message: &RpcMessage,
        on_event: Option<&mut EventCallback<'_>>,
    ) -> Result<(), GatewayError> {
        match message.method() {
            TURN_COMPLETED => self.completed = true,
            REASONING_SUMMARY_DELTA => {
                if let Some(delta) = message.param_str("/delta").filter(|delta| !delta.is_empty()) {
                    self.state.append_reasoning(delta);
                    self.reasoning_streamed = true;
                    if let Some(on_event) = on_event {
                        on_event(ResponseEvent::reasoning(delta))?;
                    }
                }
            }
            AGENT_MESSAGE_DELTA => {
                if let Some(delta) = message.param_str("/delta").filter(|delta| !delta.is_empty()) {
                    self.state.append_agent_delta(delta);
                }
            }
            ITEM_STARTED if is_agent_message(message) => self.state.start_agent_message(),
            ITEM_COMPLETED if is_agent_message(message) => self.state.finalize(),
            TASK_COMPLETE => {
                if let Some(last) = message.param_str("/msg/last_agent_message") {
                    self.last_agent_message = last.to_string();
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Computes the result and emits the end-of-turn events: derived reasoning when
    /// none was streamed, then the full output text.
    pub fn finish(
        mut self,
        backend: &str,
        on_event: Option<&mut EventCallback<'_>>,
    ) -> Result<TurnResult, GatewayError> {
        let result = self.state.result(&self.last_agent_message);
        if result.output.is_empty() {
            return Err(GatewayError::EmptyOutput {
                backend: backend.to_string(),
            });
        }
        if let Some(on_event) = on_event {
            if !self.reasoning_streamed && !result.reasoning.is_empty() {
                on_event(ResponseEvent::reasoning(result.reasoning.clone()))?;
            }
            on_event(ResponseEvent::output(result.output.clone()))?;
        }
        Ok(result)
    }
}

fn is_agent_message(message: &RpcMessage) -> bool {
    message
        .param_str("/item/type")
        .is_some_and(|kind| kind.eq_ignore_ascii_case("agentMessage"))
}

/// Feeds notifications to `notify` until `turn/completed`, the queue closes or
/// `cancel` fires. Returns at once when completion was already observed.
pub async fn wait_for_turn_completed(
    messages: &mut mpsc::Receiver<RpcMessage>,
    notify: &mut Observer<'_>,
    already_completed: bool,
    cancel: &CancellationToken,
) -> Result<(), GatewayError> {
    if already_completed {
        return Ok(());
    }
    loop {
        let message = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
            message = messages.recv() => message,
        };
        let Some(message) = message else {
            return Ok(());
        };
        notify(&message)?;
        if message.method() == TURN_COMPLETED {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn agent_item(method: &str) -> RpcMessage {
        RpcMessage::notification(method, json!({"item": {"type": "agentMessage", "id": "m1"}}))
    }

    fn delta(method: &str, text: &str) -> RpcMessage {
        RpcMessage::notification(method, json!({"delta": text}))
    }

    #[test]
    fn last_agent_message_takes_precedence() {
        let mut driver = TurnDriver::new();
        for message in [
            agent_item(ITEM_STARTED),
            delta(AGENT_MESSAGE_DELTA, "derived"),
            agent_item(ITEM_COMPLETED),
            RpcMessage::notification(TASK_COMPLETE, json!({"msg": {"last_agent_message": "authoritative"}})),
        ] {
            driver.handle(&message, None).expect("handle");
        }
        let result = driver.finish("codex", None).expect("result");
        assert_eq!(result.output, "authoritative");
        assert_eq!(result.reasoning, "");
    }

    #[test]
    fn earlier_messages_are_demoted_to_reasoning() {
        let mut state = TurnState::default();
        state.append_reasoning("plan");
        state.start_agent_message();
        state.append_agent_delta("step one");
        state.finalize();
        state.start_agent_message();
        state.append_agent_delta("step two");
        // no item/completed for step two
        state.start_agent_message();
        state.append_agent_delta(" final answer ");

        let result = state.result("");
        assert_eq!(result.output, "final answer");
        assert_eq!(result.reasoning, "plan\n\nstep one\n\nstep two");
    }

    #[test]
    fn empty_output_fails_the_turn() {
        let mut driver = TurnDriver::new();
        driver
            .handle(&delta(REASONING_SUMMARY_DELTA, "thinking"), None)
            .expect("handle");
        let err = driver.finish("codex", None).expect_err("empty");
        assert!(matches!(err, GatewayError::EmptyOutput { .. }));
    }

    #[test]
    fn finish_emits_synthetic_reasoning_then_full_output() {
        let mut driver = TurnDriver::new();
        for message in [
            agent_item(ITEM_STARTED),
            delta(AGENT_MESSAGE_DELTA, "looking around"),
            agent_item(ITEM_COMPLETED),
            agent_item(ITEM_STARTED),
            delta(AGENT_MESSAGE_DELTA, "done"),
            agent_item(ITEM_COMPLETED),
        ] {
            driver.handle(&message, None).expect("handle");
        }
        let mut events = Vec::new();
        let mut on_event = |event: ResponseEvent| -> Result<(), GatewayError> {
            events.push(event);
            Ok(())
        };
        driver.finish("codex", Some(&mut on_event)).expect("result");
        assert_eq!(
            events,
            vec![
                ResponseEvent::reasoning("looking around"),
                ResponseEvent::output("done"),
            ]
        );
    }

    #[test]
    fn streamed_reasoning_is_not_repeated() {
        let mut driver = TurnDriver::new();
        let mut events = Vec::new();
        let mut on_event = |event: ResponseEvent| -> Result<(), GatewayError> {
            events.push(event);
            Ok(())
        };
        driver
            .handle(&delta(REASONING_SUMMARY_DELTA, "hmm"), Some(&mut on_event))
            .expect("handle");
        driver
            .handle(&delta(AGENT_MESSAGE_DELTA, "answer"), Some(&mut on_event))
            .expect("handle");
        driver.finish("codex", Some(&mut on_event)).expect("result");
        assert_eq!(
            events,
            vec![ResponseEvent::reasoning("hmm"), ResponseEvent::output("answer")]
        );
    }

    #[tokio::test]
    async fn wait_returns_immediately_when_already_completed() {
        let (tx, mut rx) = mpsc::channel(8);
        tx.send(delta(AGENT_MESSAGE_DELTA, "pending"))
            .await
            .expect("send");
        let mut seen = 0;
        let mut notify = |_: &RpcMessage| -> Result<(), GatewayError> {
            seen += 1;
            Ok(())
        };
        wait_for_turn_completed(&mut rx, &mut notify, true, &CancellationToken::new())
            .await
            .expect("wait");
        assert_eq!(seen, 0);
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn wait_observes_every_message_until_completion() {
        let (tx, mut rx) = mpsc::channel(8);
        let sent = vec![
            delta(REASONING_SUMMARY_DELTA, "a"),
            delta(AGENT_MESSAGE_DELTA, "b"),
            RpcMessage::notification(TURN_COMPLETED, json!({})),
            delta(AGENT_MESSAGE_DELTA, "after"),
        ];
        for message in &sent {
            tx.send(message.clone()).await.expect("send");
        }
        let mut seen = Vec::new();
        let mut notify = |message: &RpcMessage| -> Result<(), GatewayError> {
            seen.push(message.clone());
            Ok(())
        };
        wait_for_turn_completed(&mut rx, &mut notify, false, &CancellationToken::new())
            .await
            .expect("wait");
        assert_eq!(seen, sent[..3].to_vec());
    }

    #[tokio::test]
    async fn wait_surfaces_cancellation() {
        let (_tx, mut rx) = mpsc::channel::<RpcMessage>(8);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut notify = |_: &RpcMessage| -> Result<(), GatewayError> { Ok(()) };
        let err = wait_for_turn_completed(&mut rx, &mut notify, false, &cancel)
            .await
            .expect_err("cancelled");
        assert!(matches!(err, GatewayError::Cancelled));
    }

    #[tokio::test]
    async fn wait_ends_when_queue_closes() {
        let (tx, mut rx) = mpsc::channel::<RpcMessage>(8);
        drop(tx);
        let mut notify = |_: &RpcMessage| -> Result<(), GatewayError> { Ok(()) };
        wait_for_turn_completed(&mut rx, &mut notify, false, &CancellationToken::new())
            .await
            .expect("closed queue");
    }
}
