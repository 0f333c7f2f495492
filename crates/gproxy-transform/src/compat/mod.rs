//! Provider-quirk compatibility layer.
//!
//! Runs after a request has been normalized to the OpenAI Chat Completions
//! shape (by [`crate::middleware`]) and before the provider-native HTTP
//! call, and symmetrically on the way back. Operates on `serde_json::Value`
//! rather than the typed DTOs, since the rule engine below addresses fields
//! by dotted path and several providers need to see or produce shapes the
//! typed Chat Completions DTO does not model (e.g. Qwen's extra `input[]`).

mod field_rules;
pub mod glm;
pub mod iflow;
pub mod qwen;
mod response_shape;
mod tool_args;
mod tool_result;

pub use field_rules::{TransformationRule, TransformKind, apply_rules};
pub use response_shape::synthesize_openai_response_shape;
pub use tool_args::canonicalize_tool_call_arguments;
pub use tool_result::flatten_tool_result_content;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CompatError {
    #[error("tool result content flattened to an empty string")]
    ToolTextEmpty,
    #[error("tool_calls[*].function.arguments is not valid JSON: {0}")]
    ToolCallArgsInvalid(String),
    #[error("field rule {0} referenced an unsupported path shape")]
    UnsupportedPath(String),
}

pub type CompatResult<T> = Result<T, CompatError>;

/// Per-request context the compat layer needs but that isn't itself part of
/// the wire body (e.g. the resolved provider model alias).
#[derive(Debug, Clone, Default)]
pub struct CompatContext {
    pub provider: String,
    pub requested_model: String,
}

/// One compatibility module per provider family.
pub trait CompatModule: Send + Sync {
    /// OpenAI/Anthropic shape (already normalized to OpenAI Chat) → the
    /// shape this provider's HTTP API actually expects.
    fn process_incoming(
        &self,
        request: &mut serde_json::Value,
        ctx: &CompatContext,
    ) -> CompatResult<()>;

    /// Provider-native shape → OpenAI Chat Completions shape.
    fn process_outgoing(
        &self,
        response: &mut serde_json::Value,
        ctx: &CompatContext,
    ) -> CompatResult<()>;
}

/// Cleans up the shared shape issues every provider family in this module
/// needs: flattens `role=tool` message content, and canonicalizes
/// `tool_calls[*].function.arguments` to a JSON-encoded string.
pub fn normalize_common_chat_shape(request: &mut serde_json::Value) -> CompatResult<()> {
    let Some(messages) = request.get_mut("messages").and_then(|m| m.as_array_mut()) else {
        return Ok(());
    };
    for message in messages.iter_mut() {
        let Some(obj) = message.as_object_mut() else {
            continue;
        };
        if obj.get("role").and_then(|r| r.as_str()) == Some("tool") {
            if let Some(content) = obj.get("content").cloned() {
                let flattened = flatten_tool_result_content(&content)?;
                obj.insert("content".to_string(), serde_json::Value::String(flattened));
            }
        }
        if let Some(tool_calls) = obj.get_mut("tool_calls").and_then(|t| t.as_array_mut()) {
            for call in tool_calls.iter_mut() {
                let Some(function) = call.get_mut("function").and_then(|f| f.as_object_mut())
                else {
                    continue;
                };
                if let Some(arguments) = function.get("arguments").cloned() {
                    let canonical = canonicalize_tool_call_arguments(&arguments)?;
                    function.insert(
                        "arguments".to_string(),
                        serde_json::Value::String(canonical),
                    );
                }
            }
        }
    }
    Ok(())
}

/// Removes tool fields a provider's function-calling implementation does not
/// recognize (e.g. iFlow rejects `function.strict`).
pub fn strip_unsupported_tool_fields(request: &mut serde_json::Value, fields: &[&str]) {
    let Some(tools) = request.get_mut("tools").and_then(|t| t.as_array_mut()) else {
        return;
    };
    for tool in tools.iter_mut() {
        let Some(function) = tool.get_mut("function").and_then(|f| f.as_object_mut()) else {
            continue;
        };
        for field in fields {
            function.remove(*field);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_message_content_is_flattened_to_string() {
        let mut request = serde_json::json!({
            "messages": [
                {"role": "tool", "content": [{"type": "text", "text": "result"}]},
            ]
        });
        normalize_common_chat_shape(&mut request).unwrap();
        assert_eq!(request["messages"][0]["content"], "result");
    }

    #[test]
    fn empty_tool_result_is_an_error() {
        let mut request = serde_json::json!({
            "messages": [ {"role": "tool", "content": []} ]
        });
        let err = normalize_common_chat_shape(&mut request).unwrap_err();
        assert_eq!(err, CompatError::ToolTextEmpty);
    }

    #[test]
    fn tool_call_arguments_object_is_json_encoded() {
        let mut request = serde_json::json!({
            "messages": [{
                "role": "assistant",
                "tool_calls": [{"function": {"name": "f", "arguments": {"a": 1}}}]
            }]
        });
        normalize_common_chat_shape(&mut request).unwrap();
        let args = request["messages"][0]["tool_calls"][0]["function"]["arguments"]
            .as_str()
            .unwrap();
        assert_eq!(serde_json::from_str::<serde_json::Value>(args).unwrap(), serde_json::json!({"a": 1}));
    }

    #[test]
    fn unsupported_tool_fields_are_stripped() {
        let mut request = serde_json::json!({
            "tools": [{"function": {"name": "f", "strict": true}}]
        });
        strip_unsupported_tool_fields(&mut request, &["strict"]);
        assert!(request["tools"][0]["function"].get("strict").is_none());
    }
}
