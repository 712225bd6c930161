//! OpenAI-compatible HTTP gateway over the Claude and Codex CLIs.

pub mod cli;
pub mod openai;
pub mod router;
pub mod sse;
pub mod usage;
