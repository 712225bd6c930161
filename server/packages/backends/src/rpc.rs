//! Line-delimited JSON-RPC over a [`ProcessTransport`].
//!
//! A reader task parses stdout into a bounded queue that closes when the process
//! exits. [`RpcClient::call`] takes `&mut self`, so one client never has more than
//! one call in flight; the shared queue could not demultiplex concurrent calls.

use std::time::Instant;

use llm_proxy_error::GatewayError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::transport::{LaunchSpec, LineStream, ProcessTransport};

/// Notifications beyond this back up into the subprocess pipe.
pub const NOTIFICATION_QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RpcMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcErrorObject>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RpcErrorObject {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub message: String,
}

impl RpcMessage {
    pub fn notification(method: impl Into<String>, params: Value) -> Self {
        Self {
            method: Some(method.into()),
            params: Some(params),
            ..Self::default()
        }
    }

    pub fn method(&self) -> &str {
        self.method.as_deref().unwrap_or("")
    }

    pub fn param(&self, pointer: &str) -> Option<&Value> {
        self.params.as_ref().and_then(|params| params.pointer(pointer))
    }

    pub fn param_str(&self, pointer: &str) -> Option<&str> {
        self.param(pointer).and_then(Value::as_str)
    }
}

/// Observer for messages that do not resolve the pending call.
pub type Observer<'a> = dyn FnMut(&RpcMessage) -> Result<(), GatewayError> + Send + 'a;

pub struct RpcClient {
    name: &'static str,
    transport: ProcessTransport,
    messages: mpsc::Receiver<RpcMessage>,
    reader: JoinHandle<()>,
    next_id: u64,
}

impl RpcClient {
    pub fn spawn(name: &'static str, launch: &LaunchSpec) -> Result<Self, GatewayError> {
        let mut transport = ProcessTransport::spawn(name, launch, true)?;
        let lines = transport.take_lines()?;
        let (tx, messages) = mpsc::channel(NOTIFICATION_QUEUE_CAPACITY);
        let reader = spawn_reader(name, lines, tx);
        Ok(Self {
            name,
            transport,
            messages,
            reader,
            next_id: 0,
        })
    }

    pub async fn initialize(
        &mut self,
        client_name: &str,
        version: &str,
        cancel: &CancellationToken,
    ) -> Result<Value, GatewayError> {
        self.call(
            "initialize",
            json!({
                "clientInfo": {
                    "name": client_name,
                    "version": version,
                },
                "capabilities": {
                    "experimentalApi": true,
                },
            }),
            None,
            cancel,
        )
        .await
    }

    /// Sends `method` and waits for its response. Returns `Cancelled` as soon as
    /// `cancel` fires; the caller owns shutting the process down.
    pub async fn call(
        &mut self,
        method: &str,
        params: Value,
        mut observer: Option<&mut Observer<'_>>,
        cancel: &CancellationToken,
    ) -> Result<Value, GatewayError> {
        if cancel.is_cancelled() {
            return Err(GatewayError::Cancelled);
        }
        self.next_id += 1;
        let id = self.next_id.to_string();
        let started = Instant::now();

        tracing::debug!(backend = self.name, method = %method, id = %id, "rpc request");
        self.transport
            .write_json(&json!({
                "jsonrpc": "2.0",
                "id": id,
                "method": method,
                "params": params,
            }))
            .await?;

        loop {
            let message = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::debug!(backend = self.name, method = %method, id = %id, "rpc call cancelled");
                    return Err(GatewayError::Cancelled);
                }
                message = self.messages.recv() => message,
            };
            let Some(message) = message else {
                break;
            };
            let matches = message.id.as_ref().is_some_and(|value| id_matches(value, &id));
            if !matches {
                if message.id.is_some() && message.method.is_none() {
                    tracing::warn!(
                        backend = self.name,
                        id = ?message.id,
                        "rpc response has no matching pending request"
                    );
                    continue;
                }
                if let Some(observer) = observer.as_deref_mut() {
                    observer(&message)?;
                }
                continue;
            }

            tracing::debug!(
                backend = self.name,
                method = %method,
                id = %id,
                response_ms = started.elapsed().as_millis() as u64,
                "rpc response"
            );
            if let Some(error) = message.error {
                return Err(GatewayError::Protocol {
                    method: method.to_string(),
                    code: error.code,
                    message: error.message,
                });
            }
            return Ok(message.result.unwrap_or(Value::Null));
        }

        let stderr = self.transport.stderr_text().await;
        Err(GatewayError::StreamEnded {
            backend: self.name.to_string(),
            stderr: if stderr.is_empty() {
                format!("{} app-server exited before responding to {method}", self.name)
            } else {
                stderr
            },
        })
    }

    pub async fn call_as<T: DeserializeOwned>(
        &mut self,
        method: &str,
        params: Value,
        observer: Option<&mut Observer<'_>>,
        cancel: &CancellationToken,
    ) -> Result<T, GatewayError> {
        let result = self.call(method, params, observer, cancel).await?;
        serde_json::from_value(result)
            .map_err(|err| GatewayError::malformed(method, format!("unexpected result: {err}")))
    }

    /// Messages that arrive after the last call resolved.
    pub fn notifications(&mut self) -> &mut mpsc::Receiver<RpcMessage> {
        &mut self.messages
    }

    pub async fn close(self) {
        self.transport.close().await;
        self.reader.abort();
    }
}

fn id_matches(value: &Value, expected: &str) -> bool {
    match value {
        Value::String(id) => id == expected,
        Value::Number(id) => id.to_string() == expected,
        _ => false,
    }
}

fn spawn_reader(
    name: &'static str,
    mut lines: LineStream,
    tx: mpsc::Sender<RpcMessage>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut line_count: u64 = 0;
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(err) => {
                    tracing::warn!(backend = name, error = %err, "backend stdout read failed");
                    break;
                }
            };
            line_count += 1;
            let message = match serde_json::from_slice::<RpcMessage>(&line) {
                Ok(message) => message,
                Err(err) => {
                    tracing::debug!(
                        backend = name,
                        error = %err,
                        line_number = line_count,
                        "backend stdout: dropping non-json line"
                    );
                    continue;
                }
            };
            if tx.send(message).await.is_err() {
                break;
            }
        }
        tracing::debug!(backend = name, total_lines = line_count, "backend stdout: stream ended");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_parses_notifications_and_responses() {
        let notification: RpcMessage = serde_json::from_str(
            r#"{"jsonrpc":"2.0","method":"item/agentMessage/delta","params":{"delta":"hi"}}"#,
        )
        .expect("parse");
        assert!(notification.id.is_none());
        assert_eq!(notification.method(), "item/agentMessage/delta");
        assert_eq!(notification.param_str("/delta"), Some("hi"));

        let response: RpcMessage =
            serde_json::from_str(r#"{"id":"3","error":{"code":-32601,"message":"nope"}}"#)
                .expect("parse");
        let error = response.error.expect("error object");
        assert_eq!(error.code, -32601);
        assert_eq!(error.message, "nope");
    }

    #[test]
    fn ids_match_as_strings_or_numbers() {
        assert!(id_matches(&json!("7"), "7"));
        assert!(id_matches(&json!(7), "7"));
        assert!(!id_matches(&json!("8"), "7"));
        assert!(!id_matches(&Value::Null, "7"));
    }
}
