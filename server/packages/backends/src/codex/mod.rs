mod turn;

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use llm_proxy_error::GatewayError;
use serde::Deserialize;
use serde_json::json;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

pub use turn::{wait_for_turn_completed, TurnDriver, TurnResult, TurnState};

use crate::adapter::{Adapter, AuthGate, DeltaCallback, EventCallback, EventStreamAdapter};
use crate::prompt::{build_chat_prompt, build_responses_prompt};
use crate::rpc::{RpcClient, RpcMessage};
use crate::transport::LaunchSpec;
use crate::types::{
    Backend, ChatRequest, ChatResponse, Model, ResponsesRequest, ResponsesResponse,
};

const NAME: &str = "codex";
const CLIENT_NAME: &str = "llm-proxy";

#[derive(Debug, Clone)]
pub struct CodexConfig {
    pub bin: PathBuf,
    /// Passes `--dangerously-bypass-approvals-and-sandbox` before `app-server`.
    pub bypass_approvals: bool,
    /// Login state written by `codex login`; `None` skips the file check.
    pub auth_file: Option<PathBuf>,
}

impl Default for CodexConfig {
    fn default() -> Self {
        Self {
            bin: PathBuf::from("codex"),
            bypass_approvals: false,
            auth_file: dirs::home_dir().map(|home| home.join(".codex").join("auth.json")),
        }
    }
}

#[derive(Debug, Deserialize)]
struct AuthState {
    #[serde(default)]
    auth_mode: String,
}

#[derive(Debug, Deserialize)]
struct ModelList {
    #[serde(default)]
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ThreadStart {
    thread: ThreadInfo,
}

#[derive(Debug, Deserialize)]
struct ThreadInfo {
    #[serde(default)]
    id: String,
}

pub struct CodexAdapter {
    config: CodexConfig,
    auth: AuthGate,
}

impl CodexAdapter {
    pub fn new(config: CodexConfig) -> Self {
        Self {
            config,
            auth: AuthGate::new(Backend::Codex),
        }
    }

    fn launch(&self) -> LaunchSpec {
        let mut args = Vec::new();
        if self.config.bypass_approvals {
            args.push("--dangerously-bypass-approvals-and-sandbox".to_string());
        }
        args.push("app-server".to_string());
        LaunchSpec::new(&self.config.bin, args)
    }

    async fn ensure_auth(&self) -> Result<(), GatewayError> {
        self.auth
            .ensure(|| async {
                if let Some(path) = &self.config.auth_file {
                    if auth_file_has_chatgpt(path).await {
                        return Ok(());
                    }
                }
                self.check_login_status().await
            })
            .await
    }

    async fn check_login_status(&self) -> Result<(), String> {
        let output = Command::new(&self.config.bin)
            .args(["login", "status"])
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|err| format!("failed to check codex login status: {err}"))?;
        if !output.status.success() {
            return Err(format!(
                "failed to check codex login status: {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        let status = String::from_utf8_lossy(&output.stdout);
        if status.to_lowercase().contains("chatgpt") {
            Ok(())
        } else {
            Err(format!(
                "codex auth mode is not ChatGPT subscription: {}",
                status.trim()
            ))
        }
    }

    async fn open_client(&self, cancel: &CancellationToken) -> Result<RpcClient, GatewayError> {
        let mut client = RpcClient::spawn(NAME, &self.launch())?;
        if let Err(err) = client
            .initialize(CLIENT_NAME, env!("CARGO_PKG_VERSION"), cancel)
            .await
        {
            client.close().await;
            return Err(err);
        }
        Ok(client)
    }

    async fn fetch_models(&self, cancel: &CancellationToken) -> Result<Vec<Model>, GatewayError> {
        self.ensure_auth().await?;
        let mut client = self.open_client(cancel).await?;
        let result = client
            .call_as::<ModelList>("model/list", json!({}), None, cancel)
            .await;
        client.close().await;

        let models = result?;
        if models.data.is_empty() {
            return Err(GatewayError::malformed("model/list", "codex returned no models"));
        }
        Ok(models
            .data
            .into_iter()
            .map(|entry| Model {
                id: entry.id,
                backend: Backend::Codex,
            })
            .collect())
    }

    /// One ephemeral thread, one turn.
    async fn run_turn(
        &self,
        model: &str,
        prompt: &str,
        on_event: Option<&mut EventCallback<'_>>,
        cancel: &CancellationToken,
    ) -> Result<TurnResult, GatewayError> {
        self.ensure_auth().await?;
        let mut client = self.open_client(cancel).await?;
        let result = drive_turn(&mut client, model, prompt, on_event, cancel).await;
        client.close().await;
        result
    }
}

async fn drive_turn(
    client: &mut RpcClient,
    model: &str,
    prompt: &str,
    mut on_event: Option<&mut EventCallback<'_>>,
    cancel: &CancellationToken,
) -> Result<TurnResult, GatewayError> {
    let thread: ThreadStart = client
        .call_as(
            "thread/start",
            json!({
                "model": model,
                "ephemeral": true,
            }),
            None,
            cancel,
        )
        .await?;
    if thread.thread.id.is_empty() {
        return Err(GatewayError::malformed(
            "thread/start",
            "codex returned empty thread id",
        ));
    }
    tracing::debug!(backend = NAME, thread_id = %thread.thread.id, model = %model, "thread started");

    let mut driver = TurnDriver::new();
    {
        let mut observer =
            |message: &RpcMessage| driver.handle(message, on_event.as_deref_mut());
        client
            .call(
                "turn/start",
                json!({
                    "threadId": thread.thread.id,
                    "model": model,
                    "input": [{
                        "type": "text",
                        "text": prompt,
                    }],
                }),
                Some(&mut observer),
                cancel,
            )
            .await?;
    }

    let already_completed = driver.completed();
    {
        let mut observer =
            |message: &RpcMessage| driver.handle(message, on_event.as_deref_mut());
        wait_for_turn_completed(
            client.notifications(),
            &mut observer,
            already_completed,
            cancel,
        )
        .await?;
    }

    driver.finish(NAME, on_event)
}

async fn auth_file_has_chatgpt(path: &Path) -> bool {
    let Ok(data) = tokio::fs::read(path).await else {
        return false;
    };
    serde_json::from_slice::<AuthState>(&data)
        .map(|state| state.auth_mode.trim().eq_ignore_ascii_case("chatgpt"))
        .unwrap_or(false)
}

/// Delivers the final text as a single delta.
fn deliver_once(text: &str, on_delta: &mut DeltaCallback<'_>) -> Result<(), GatewayError> {
    if text.trim().is_empty() {
        return Ok(());
    }
    on_delta(text)
}

#[async_trait]
impl Adapter for CodexAdapter {
    fn backend(&self) -> Backend {
        Backend::Codex
    }

    async fn list_models(&self, cancel: &CancellationToken) -> Result<Vec<Model>, GatewayError> {
        self.fetch_models(cancel).await
    }

    async fn supports_model(
        &self,
        model: &str,
        cancel: &CancellationToken,
    ) -> Result<bool, GatewayError> {
        let models = self.fetch_models(cancel).await?;
        Ok(models.iter().any(|known| known.id == model))
    }

    async fn chat(
        &self,
        request: ChatRequest,
        cancel: &CancellationToken,
    ) -> Result<ChatResponse, GatewayError> {
        let prompt = build_chat_prompt(&request.messages);
        let turn = self.run_turn(&request.model, &prompt, None, cancel).await?;
        Ok(ChatResponse {
            model: request.model,
            text: turn.output,
        })
    }

    async fn chat_stream(
        &self,
        request: ChatRequest,
        on_delta: &mut DeltaCallback<'_>,
        cancel: &CancellationToken,
    ) -> Result<ChatResponse, GatewayError> {
        let prompt = build_chat_prompt(&request.messages);
        let turn = self.run_turn(&request.model, &prompt, None, cancel).await?;
        deliver_once(&turn.output, on_delta)?;
        Ok(ChatResponse {
            model: request.model,
            text: turn.output,
        })
    }

    async fn respond(
        &self,
        request: ResponsesRequest,
        cancel: &CancellationToken,
    ) -> Result<ResponsesResponse, GatewayError> {
        let prompt = build_responses_prompt(&request.input);
        let turn = self.run_turn(&request.model, &prompt, None, cancel).await?;
        Ok(ResponsesResponse {
            model: request.model,
            text: turn.output,
            reasoning: turn.reasoning,
        })
    }

    async fn respond_stream(
        &self,
        request: ResponsesRequest,
        on_delta: &mut DeltaCallback<'_>,
        cancel: &CancellationToken,
    ) -> Result<ResponsesResponse, GatewayError> {
        let prompt = build_responses_prompt(&request.input);
        let turn = self.run_turn(&request.model, &prompt, None, cancel).await?;
        deliver_once(&turn.output, on_delta)?;
        Ok(ResponsesResponse {
            model: request.model,
            text: turn.output,
            reasoning: turn.reasoning,
        })
    }

    fn event_stream(&self) -> Option<&dyn EventStreamAdapter> {
        Some(self)
    }
}

#[async_trait]
impl EventStreamAdapter for CodexAdapter {
    async fn respond_stream_events(
        &self,
        request: ResponsesRequest,
        on_event: &mut EventCallback<'_>,
        cancel: &CancellationToken,
    ) -> Result<ResponsesResponse, GatewayError> {
        let prompt = build_responses_prompt(&request.input);
        let turn = self
            .run_turn(&request.model, &prompt, Some(on_event), cancel)
            .await?;
        Ok(ResponsesResponse {
            model: request.model,
            text: turn.output,
            reasoning: turn.reasoning,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn launch_puts_bypass_flag_before_subcommand() {
        let adapter = CodexAdapter::new(CodexConfig {
            bypass_approvals: true,
            ..CodexConfig::default()
        });
        assert_eq!(
            adapter.launch().args,
            vec!["--dangerously-bypass-approvals-and-sandbox", "app-server"]
        );

        let adapter = CodexAdapter::new(CodexConfig::default());
        assert_eq!(adapter.launch().args, vec!["app-server"]);
    }

    #[tokio::test]
    async fn auth_file_accepts_chatgpt_mode_case_insensitively() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("auth.json");

        std::fs::write(&path, r#"{"auth_mode":" ChatGPT "}"#).expect("write");
        assert!(auth_file_has_chatgpt(&path).await);

        std::fs::write(&path, r#"{"auth_mode":"apikey"}"#).expect("write");
        assert!(!auth_file_has_chatgpt(&path).await);

        assert!(!auth_file_has_chatgpt(&dir.path().join("missing.json")).await);
    }
}
