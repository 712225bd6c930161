mod parser;

use std::future::Future;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use llm_proxy_error::GatewayError;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

pub use parser::DeltaParser;

use crate::adapter::{Adapter, AuthGate, DeltaCallback};
use crate::prompt::{build_chat_prompt, build_responses_prompt};
use crate::transport::{LaunchSpec, ProcessTransport};
use crate::types::{
    Backend, ChatRequest, ChatResponse, Model, ResponsesRequest, ResponsesResponse,
};

const NAME: &str = "claude";
pub const DEFAULT_MODELS: [&str; 3] = ["haiku", "sonnet", "opus"];
const API_KEY_ENV: &str = "ANTHROPIC_API_KEY";

#[derive(Debug, Clone)]
pub struct ClaudeConfig {
    pub bin: PathBuf,
    pub models: Vec<String>,
    /// Appends `--dangerously-skip-permissions`.
    pub skip_permissions: bool,
}

impl Default for ClaudeConfig {
    fn default() -> Self {
        Self {
            bin: PathBuf::from("claude"),
            models: DEFAULT_MODELS.iter().map(|model| model.to_string()).collect(),
            skip_permissions: false,
        }
    }
}

impl ClaudeConfig {
    /// Comma separated model ids; blanks are dropped and an empty list falls back to the defaults.
    pub fn parse_models(raw: &str) -> Vec<String> {
        let models: Vec<String> = raw
            .split(',')
            .map(str::trim)
            .filter(|model| !model.is_empty())
            .map(str::to_string)
            .collect();
        if models.is_empty() {
            DEFAULT_MODELS.iter().map(|model| model.to_string()).collect()
        } else {
            models
        }
    }
}

/// Outcome of one streaming run: the result plus whether any delta reached the consumer.
#[derive(Debug)]
pub(crate) struct StreamOutcome {
    pub result: Result<String, GatewayError>,
    pub emitted: bool,
}

pub struct ClaudeAdapter {
    config: ClaudeConfig,
    auth: AuthGate,
}

impl ClaudeAdapter {
    pub fn new(config: ClaudeConfig) -> Self {
        Self {
            config,
            auth: AuthGate::new(Backend::Claude),
        }
    }

    async fn ensure_auth(&self) -> Result<(), GatewayError> {
        self.auth
            .ensure(|| async {
                match std::env::var(API_KEY_ENV) {
                    Ok(value) if !value.trim().is_empty() => Err(format!(
                        "{API_KEY_ENV} is set; only subscription login is supported"
                    )),
                    _ => Ok(()),
                }
            })
            .await
    }

    fn text_args(&self, model: &str, prompt: &str) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            "--output-format".to_string(),
            "text".to_string(),
            "--model".to_string(),
            model.to_string(),
        ];
        self.push_tail_args(&mut args, prompt);
        args
    }

    fn stream_args(&self, model: &str, prompt: &str) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            "--verbose".to_string(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--include-partial-messages".to_string(),
            "--model".to_string(),
            model.to_string(),
        ];
        self.push_tail_args(&mut args, prompt);
        args
    }

    fn push_tail_args(&self, args: &mut Vec<String>, prompt: &str) {
        if self.config.skip_permissions {
            args.push("--dangerously-skip-permissions".to_string());
        }
        args.push(prompt.to_string());
    }

    async fn run_text(
        &self,
        model: &str,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> Result<String, GatewayError> {
        let launch = LaunchSpec::new(&self.config.bin, self.text_args(model, prompt));
        let mut command = Command::new(&launch.program);
        command
            .args(&launch.args)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        tracing::info!(backend = NAME, model = %model, "running claude in text mode");
        let output = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
            output = command.output() => output,
        };
        let output = output.map_err(|err| {
            GatewayError::transport(format!("failed to spawn `{}`: {err}", launch.display()))
        })?;

        if !output.status.success() {
            return Err(GatewayError::transport(format!(
                "claude command failed: {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn run_stream(
        &self,
        model: &str,
        prompt: &str,
        on_delta: &mut DeltaCallback<'_>,
        cancel: &CancellationToken,
    ) -> StreamOutcome {
        let launch = LaunchSpec::new(&self.config.bin, self.stream_args(model, prompt));
        let mut process = match ProcessTransport::spawn(NAME, &launch, false) {
            Ok(process) => process,
            Err(err) => {
                return StreamOutcome {
                    result: Err(err),
                    emitted: false,
                }
            }
        };
        let mut lines = match process.take_lines() {
            Ok(lines) => lines,
            Err(err) => {
                process.kill().await;
                return StreamOutcome {
                    result: Err(err),
                    emitted: false,
                };
            }
        };

        let mut parser = DeltaParser::new();
        let mut text = String::new();
        let mut emitted = false;

        loop {
            let line = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(GatewayError::Cancelled),
                line = lines.next_line() => line,
            };
            let line = match line {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(err) => {
                    process.kill().await;
                    return StreamOutcome {
                        result: Err(err),
                        emitted,
                    };
                }
            };
            let Ok(line) = std::str::from_utf8(&line) else {
                tracing::debug!(backend = NAME, "claude stdout: dropping non-utf8 line");
                continue;
            };
            let Some(delta) = parser.parse_line(line) else {
                continue;
            };
            text.push_str(&delta);
            emitted = true;
            if let Err(err) = on_delta(&delta) {
                process.kill().await;
                return StreamOutcome {
                    result: Err(err),
                    emitted,
                };
            }
        }

        let result = match process.wait().await {
            Ok(status) if status.success() => Ok(text.trim().to_string()),
            Ok(status) => Err(GatewayError::transport(format!(
                "claude stream command failed: {status}: {}",
                process.stderr_text().await
            ))),
            Err(err) => Err(err),
        };
        StreamOutcome { result, emitted }
    }

    async fn stream_text(
        &self,
        model: &str,
        prompt: &str,
        on_delta: &mut DeltaCallback<'_>,
        cancel: &CancellationToken,
    ) -> Result<String, GatewayError> {
        self.ensure_auth().await?;
        let outcome = self.run_stream(model, prompt, on_delta, cancel).await;
        recover_stream(outcome, || self.run_text(model, prompt, cancel), on_delta).await
    }
}

/// Falls back to a plain-text run when streaming failed or produced only whitespace.
///
/// Consumer-side failures are returned as-is. If the stream itself failed and the
/// fallback fails too, the stream error wins. When the failed stream emitted nothing,
/// the fallback text is delivered as one delta.
pub(crate) async fn recover_stream<F, Fut>(
    outcome: StreamOutcome,
    fallback: F,
    on_delta: &mut DeltaCallback<'_>,
) -> Result<String, GatewayError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<String, GatewayError>>,
{
    let text = match outcome.result {
        Err(err) if err.is_client_side() => return Err(err),
        Err(err) => {
            tracing::warn!(backend = NAME, error = %err, "stream run failed, retrying in text mode");
            match fallback().await {
                Ok(text) => text,
                Err(fallback_err) => {
                    tracing::warn!(backend = NAME, error = %fallback_err, "text fallback failed");
                    return Err(err);
                }
            }
        }
        Ok(text) if text.trim().is_empty() => {
            tracing::warn!(backend = NAME, "stream run produced no text, retrying in text mode");
            fallback().await?
        }
        Ok(text) => return Ok(text),
    };

    let text = text.trim().to_string();
    if !outcome.emitted && !text.is_empty() {
        on_delta(&text)?;
    }
    Ok(text)
}

#[async_trait]
impl Adapter for ClaudeAdapter {
    fn backend(&self) -> Backend {
        Backend::Claude
    }

    async fn list_models(&self, _cancel: &CancellationToken) -> Result<Vec<Model>, GatewayError> {
        self.ensure_auth().await?;
        Ok(self
            .config
            .models
            .iter()
            .map(|id| Model {
                id: id.clone(),
                backend: Backend::Claude,
            })
            .collect())
    }

    async fn supports_model(
        &self,
        model: &str,
        _cancel: &CancellationToken,
    ) -> Result<bool, GatewayError> {
        let model = model.trim();
        Ok(self.config.models.iter().any(|known| known == model))
    }

    async fn chat(
        &self,
        request: ChatRequest,
        cancel: &CancellationToken,
    ) -> Result<ChatResponse, GatewayError> {
        self.ensure_auth().await?;
        let prompt = build_chat_prompt(&request.messages);
        let text = self.run_text(&request.model, &prompt, cancel).await?;
        Ok(ChatResponse {
            model: request.model,
            text: text.trim().to_string(),
        })
    }

    async fn chat_stream(
        &self,
        request: ChatRequest,
        on_delta: &mut DeltaCallback<'_>,
        cancel: &CancellationToken,
    ) -> Result<ChatResponse, GatewayError> {
        let prompt = build_chat_prompt(&request.messages);
        let text = self
            .stream_text(&request.model, &prompt, on_delta, cancel)
            .await?;
        Ok(ChatResponse {
            model: request.model,
            text,
        })
    }

    async fn respond(
        &self,
        request: ResponsesRequest,
        cancel: &CancellationToken,
    ) -> Result<ResponsesResponse, GatewayError> {
        self.ensure_auth().await?;
        let prompt = build_responses_prompt(&request.input);
        let text = self.run_text(&request.model, &prompt, cancel).await?;
        Ok(ResponsesResponse {
            model: request.model,
            text: text.trim().to_string(),
            reasoning: String::new(),
        })
    }

    async fn respond_stream(
        &self,
        request: ResponsesRequest,
        on_delta: &mut DeltaCallback<'_>,
        cancel: &CancellationToken,
    ) -> Result<ResponsesResponse, GatewayError> {
        let prompt = build_responses_prompt(&request.input);
        let text = self
            .stream_text(&request.model, &prompt, on_delta, cancel)
            .await?;
        Ok(ResponsesResponse {
            model: request.model,
            text,
            reasoning: String::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_models_drops_blanks_and_falls_back() {
        assert_eq!(
            ClaudeConfig::parse_models(" sonnet, ,opus "),
            vec!["sonnet".to_string(), "opus".to_string()]
        );
        assert_eq!(ClaudeConfig::parse_models(" , "), ClaudeConfig::default().models);
    }

    #[test]
    fn args_carry_model_prompt_and_bypass_flag() {
        let adapter = ClaudeAdapter::new(ClaudeConfig {
            skip_permissions: true,
            ..ClaudeConfig::default()
        });
        assert_eq!(
            adapter.text_args("sonnet", "[user] hi"),
            vec![
                "-p",
                "--output-format",
                "text",
                "--model",
                "sonnet",
                "--dangerously-skip-permissions",
                "[user] hi"
            ]
        );
        let stream = adapter.stream_args("opus", "[user] hi");
        assert_eq!(&stream[..5], ["-p", "--verbose", "--output-format", "stream-json", "--include-partial-messages"]);
        assert_eq!(stream.last().map(String::as_str), Some("[user] hi"));
    }

    #[tokio::test]
    async fn failed_stream_without_deltas_delivers_fallback_once() {
        let mut deltas = Vec::new();
        let mut on_delta = |delta: &str| -> Result<(), GatewayError> {
            deltas.push(delta.to_string());
            Ok(())
        };
        let outcome = StreamOutcome {
            result: Err(GatewayError::transport("claude stream command failed")),
            emitted: false,
        };
        let text = recover_stream(outcome, || async { Ok("  fallback answer \n".to_string()) }, &mut on_delta)
            .await
            .expect("fallback succeeds");
        assert_eq!(text, "fallback answer");
        assert_eq!(deltas, vec!["fallback answer".to_string()]);
    }

    #[tokio::test]
    async fn failed_stream_with_deltas_does_not_repeat_text() {
        let mut calls = 0;
        let mut on_delta = |_: &str| -> Result<(), GatewayError> {
            calls += 1;
            Ok(())
        };
        let outcome = StreamOutcome {
            result: Err(GatewayError::transport("broken pipe")),
            emitted: true,
        };
        let text = recover_stream(outcome, || async { Ok("full".to_string()) }, &mut on_delta)
            .await
            .expect("fallback succeeds");
        assert_eq!(text, "full");
        assert_eq!(calls, 0);
    }

    #[tokio::test]
    async fn stream_error_wins_when_fallback_fails() {
        let mut on_delta = |_: &str| -> Result<(), GatewayError> { Ok(()) };
        let outcome = StreamOutcome {
            result: Err(GatewayError::transport("stream broke")),
            emitted: false,
        };
        let err = recover_stream(
            outcome,
            || async { Err(GatewayError::transport("text broke")) },
            &mut on_delta,
        )
        .await
        .expect_err("both failed");
        assert_eq!(err.to_string(), "stream broke");
    }

    #[tokio::test]
    async fn blank_stream_surfaces_fallback_error() {
        let mut on_delta = |_: &str| -> Result<(), GatewayError> { Ok(()) };
        let outcome = StreamOutcome {
            result: Ok("  \n".to_string()),
            emitted: false,
        };
        let err = recover_stream(
            outcome,
            || async { Err(GatewayError::transport("text broke")) },
            &mut on_delta,
        )
        .await
        .expect_err("fallback failed");
        assert_eq!(err.to_string(), "text broke");
    }

    #[tokio::test]
    async fn consumer_failure_skips_fallback() {
        let mut on_delta = |_: &str| -> Result<(), GatewayError> { Ok(()) };
        let outcome = StreamOutcome {
            result: Err(GatewayError::Callback {
                message: "client went away".to_string(),
            }),
            emitted: true,
        };
        let mut fallback_ran = false;
        let err = recover_stream(
            outcome,
            || {
                fallback_ran = true;
                async { Ok("unused".to_string()) }
            },
            &mut on_delta,
        )
        .await
        .expect_err("callback error");
        assert!(err.is_client_side());
        assert!(!fallback_ran);
    }
}
