//! Protocol-dialect transformation: conversions between the OpenAI Chat
//! Completions, OpenAI Responses, Claude Messages and Gemini wire shapes,
//! plus the provider-quirk compatibility layer that runs after dialect
//! normalization and before the provider-native HTTP call.

pub mod compat;
pub mod count_tokens;
pub mod generate_content;
pub mod get_model;
pub mod list_models;
pub mod middleware;
pub mod stream2nostream;
