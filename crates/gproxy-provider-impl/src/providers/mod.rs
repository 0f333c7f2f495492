//! Concrete `UpstreamProvider` implementations, one module per upstream.

mod http_client;
mod oauth_common;

pub mod aistudio;
pub mod antigravity;
pub mod claude;
pub mod claudecode;
pub mod codex;
pub mod custom;
pub mod deepseek;
pub mod geminicli;
pub mod glm;
pub mod iflow;
pub mod lmstudio;
pub mod nvidia;
pub mod openai;
pub mod qwen;
pub mod vertex;
pub mod vertexexpress;
