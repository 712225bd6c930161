use std::path::PathBuf;
use std::sync::Arc;

use clap::builder::BoolishValueParser;
use clap::Parser;
use llm_proxy_backends::{
    Adapter, ClaudeAdapter, ClaudeConfig, CodexAdapter, CodexConfig, ModelRouter,
};
use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::router::{build_router_with_state, AppState};

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 8080;

#[derive(Parser, Debug)]
#[command(name = "llm-proxy", bin_name = "llm-proxy", version)]
#[command(about = "OpenAI-compatible gateway for the Claude and Codex CLIs")]
#[command(args_override_self = true)]
pub struct LlmProxyCli {
    #[arg(long, short = 'H', env = "LLM_PROXY_HOST", default_value = DEFAULT_HOST)]
    host: String,

    #[arg(long, short = 'p', env = "LLM_PROXY_PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Full listen address; overrides --host and --port. `:8080` binds every interface.
    #[arg(long, env = "ADDR")]
    addr: Option<String>,

    /// Skip permission prompts and sandboxing in both CLIs.
    #[arg(long, env = "LLM_PROXY_YOLO", value_parser = BoolishValueParser::new())]
    yolo: bool,

    #[arg(long, env = "CLAUDE_BIN", default_value = "claude")]
    claude_bin: PathBuf,

    /// Comma separated model ids served by the Claude CLI.
    #[arg(long, env = "CLAUDE_MODELS", default_value = "haiku,sonnet,opus")]
    claude_models: String,

    #[arg(long, env = "CODEX_BIN", default_value = "codex")]
    codex_bin: PathBuf,
}

impl LlmProxyCli {
    pub fn listen_addr(&self) -> String {
        match self.addr.as_deref().map(str::trim) {
            Some(addr) if addr.starts_with(':') => format!("0.0.0.0{addr}"),
            Some(addr) if !addr.is_empty() => addr.to_string(),
            _ => format!("{}:{}", self.host, self.port),
        }
    }

    pub fn claude_config(&self) -> ClaudeConfig {
        ClaudeConfig {
            bin: self.claude_bin.clone(),
            models: ClaudeConfig::parse_models(&self.claude_models),
            skip_permissions: self.yolo,
        }
    }

    pub fn codex_config(&self) -> CodexConfig {
        CodexConfig {
            bin: self.codex_bin.clone(),
            bypass_approvals: self.yolo,
            ..CodexConfig::default()
        }
    }

    /// Claude first, then Codex; the first adapter claiming a model wins.
    pub fn model_router(&self) -> ModelRouter {
        let adapters: Vec<Arc<dyn Adapter>> = vec![
            Arc::new(ClaudeAdapter::new(self.claude_config())),
            Arc::new(CodexAdapter::new(self.codex_config())),
        ];
        ModelRouter::new(adapters)
    }
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("server error: {0}")]
    Server(String),
}

pub fn run_llm_proxy() -> Result<(), CliError> {
    let cli = LlmProxyCli::parse();
    if let Err(err) = init_logging() {
        eprintln!("failed to init logging: {err}");
        return Err(err);
    }
    run_server(&cli)
}

pub fn init_logging() -> Result<(), CliError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_logfmt::builder()
                .layer()
                .with_writer(std::io::stderr),
        )
        .try_init()
        .map_err(|err| CliError::Server(err.to_string()))
}

fn run_server(cli: &LlmProxyCli) -> Result<(), CliError> {
    let state = Arc::new(AppState::new(cli.model_router()));
    let (router, _state) = build_router_with_state(state);

    let addr = cli.listen_addr();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| CliError::Server(err.to_string()))?;

    runtime.block_on(async move {
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        tracing::info!(addr = %addr, "server listening");
        if cli.yolo {
            tracing::warn!("yolo mode enabled; permission prompts and sandboxing are bypassed");
        }
        axum::serve(listener, router)
            .with_graceful_shutdown(async {
                let _ = tokio::signal::ctrl_c().await;
                tracing::info!("shutting down");
            })
            .await
            .map_err(|err| CliError::Server(err.to_string()))
    })
}
