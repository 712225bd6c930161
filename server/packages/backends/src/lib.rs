//! Backend adapters for the gateway: a single-shot/streaming text CLI (`claude`) and a
//! persistent JSON-RPC app-server (`codex`), behind one [`Adapter`] surface.

pub mod adapter;
pub mod claude;
pub mod codex;
pub mod prompt;
pub mod router;
pub mod rpc;
pub mod transport;
pub mod types;

pub use adapter::{Adapter, AuthGate, DeltaCallback, EventCallback, EventStreamAdapter};
pub use claude::{ClaudeAdapter, ClaudeConfig};
pub use codex::{CodexAdapter, CodexConfig};
pub use router::ModelRouter;
pub use types::{
    Backend, ChatRequest, ChatResponse, Message, Model, ResponseEvent, ResponseEventKind,
    ResponsesRequest, ResponsesResponse,
};
