//! Synthesizes the OpenAI Chat Completions response envelope out of a
//! provider's native (and sometimes partial) response body, so a malformed
//! or trimmed-down upstream reply still decodes against the typed DTO
//! instead of failing strict deserialization further up the stack.

use serde_json::Value;

use super::CompatContext;
use super::canonicalize_tool_call_arguments;

const KNOWN_FINISH_REASONS: &[&str] =
    &["stop", "length", "tool_calls", "content_filter", "function_call"];

/// Fills in every field `CreateChatCompletionResponse` requires but a
/// provider's native response may omit, and reshapes the parts it does send
/// into OpenAI's shape. Never errors: a best-effort normalization, not a
/// validator.
pub fn synthesize_openai_response_shape(response: &mut Value, ctx: &CompatContext) {
    let Some(obj) = response.as_object_mut() else {
        return;
    };

    obj.entry("object")
        .or_insert_with(|| Value::String("chat.completion".to_string()));
    obj.entry("id")
        .or_insert_with(|| Value::String(format!("chatcmpl_{}", random_id())));
    obj.entry("created")
        .or_insert_with(|| Value::Number(unix_seconds_now().into()));

    let model_default = if ctx.requested_model.is_empty() {
        "unknown".to_string()
    } else {
        ctx.requested_model.clone()
    };
    obj.entry("model")
        .or_insert_with(|| Value::String(model_default));

    match obj.get_mut("choices").and_then(|c| c.as_array_mut()) {
        Some(choices) => {
            for choice in choices.iter_mut() {
                normalize_choice(choice);
            }
        }
        None => {
            obj.insert("choices".to_string(), Value::Array(Vec::new()));
        }
    }
}

fn normalize_choice(choice: &mut Value) {
    let Some(choice_obj) = choice.as_object_mut() else {
        return;
    };

    let finish_reason = match choice_obj.get("finish_reason").and_then(|v| v.as_str()) {
        Some(reason) if KNOWN_FINISH_REASONS.contains(&reason) => reason.to_string(),
        _ => "stop".to_string(),
    };
    choice_obj.insert("finish_reason".to_string(), Value::String(finish_reason));

    let message = choice_obj
        .entry("message")
        .or_insert_with(|| Value::Object(serde_json::Map::new()));
    let Some(message_obj) = message.as_object_mut() else {
        return;
    };
    message_obj
        .entry("role")
        .or_insert_with(|| Value::String("assistant".to_string()));

    match message_obj.get("content") {
        Some(Value::String(_)) => {}
        Some(Value::Null) | None => {
            message_obj.insert("content".to_string(), Value::String(String::new()));
        }
        Some(other) => {
            let text = other.as_str().map(str::to_string).unwrap_or_else(|| other.to_string());
            message_obj.insert("content".to_string(), Value::String(text));
        }
    }

    if let Some(tool_calls) = message_obj.get_mut("tool_calls").and_then(|t| t.as_array_mut()) {
        for call in tool_calls.iter_mut() {
            rebuild_tool_call(call);
        }
    }
}

fn rebuild_tool_call(call: &mut Value) {
    let Some(call_obj) = call.as_object_mut() else {
        return;
    };
    call_obj
        .entry("type")
        .or_insert_with(|| Value::String("function".to_string()));
    call_obj
        .entry("id")
        .or_insert_with(|| Value::String(format!("call_{}", random_id())));

    let function = call_obj
        .entry("function")
        .or_insert_with(|| Value::Object(serde_json::Map::new()));
    let Some(function_obj) = function.as_object_mut() else {
        return;
    };
    let arguments = function_obj
        .get("arguments")
        .cloned()
        .unwrap_or(Value::Null);
    if let Ok(canonical) = canonicalize_tool_call_arguments(&arguments) {
        function_obj.insert("arguments".to_string(), Value::String(canonical));
    }
}

fn random_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

fn unix_seconds_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_envelope_fields_are_synthesized() {
        let mut response = serde_json::json!({
            "choices": [{"index": 0, "message": {"role": "assistant", "content": "hi"}}]
        });
        let ctx = CompatContext {
            provider: "qwen".to_string(),
            requested_model: "qwen3-coder-plus".to_string(),
        };
        synthesize_openai_response_shape(&mut response, &ctx);

        assert_eq!(response["object"], "chat.completion");
        assert!(response["id"].as_str().unwrap().starts_with("chatcmpl_"));
        assert!(response["created"].as_i64().unwrap() > 0);
        assert_eq!(response["model"], "qwen3-coder-plus");
        assert_eq!(response["choices"][0]["finish_reason"], "stop");
    }

    #[test]
    fn missing_model_falls_back_to_unknown() {
        let mut response = serde_json::json!({"choices": []});
        synthesize_openai_response_shape(&mut response, &CompatContext::default());
        assert_eq!(response["model"], "unknown");
    }

    #[test]
    fn existing_envelope_fields_are_left_untouched() {
        let mut response = serde_json::json!({
            "id": "chatcmpl_original",
            "object": "chat.completion",
            "created": 42,
            "model": "qwen-turbo",
            "choices": []
        });
        synthesize_openai_response_shape(&mut response, &CompatContext::default());
        assert_eq!(response["id"], "chatcmpl_original");
        assert_eq!(response["created"], 42);
        assert_eq!(response["model"], "qwen-turbo");
    }

    #[test]
    fn null_content_becomes_empty_string() {
        let mut response = serde_json::json!({
            "choices": [{"message": {"content": serde_json::Value::Null}}]
        });
        synthesize_openai_response_shape(&mut response, &CompatContext::default());
        assert_eq!(response["choices"][0]["message"]["content"], "");
    }

    #[test]
    fn unknown_finish_reason_defaults_to_stop() {
        let mut response = serde_json::json!({
            "choices": [{"finish_reason": "provider_specific_reason", "message": {}}]
        });
        synthesize_openai_response_shape(&mut response, &CompatContext::default());
        assert_eq!(response["choices"][0]["finish_reason"], "stop");
    }

    #[test]
    fn recognized_finish_reason_passes_through() {
        let mut response = serde_json::json!({
            "choices": [{"finish_reason": "tool_calls", "message": {}}]
        });
        synthesize_openai_response_shape(&mut response, &CompatContext::default());
        assert_eq!(response["choices"][0]["finish_reason"], "tool_calls");
    }

    #[test]
    fn tool_calls_are_rebuilt_into_openai_shape() {
        let mut response = serde_json::json!({
            "choices": [{
                "message": {
                    "tool_calls": [{"function": {"name": "lookup", "arguments": {"q": "rust"}}}]
                }
            }]
        });
        synthesize_openai_response_shape(&mut response, &CompatContext::default());
        let call = &response["choices"][0]["message"]["tool_calls"][0];
        assert_eq!(call["type"], "function");
        assert!(call["id"].as_str().unwrap().starts_with("call_"));
        assert_eq!(call["function"]["arguments"], r#"{"q":"rust"}"#);
    }
}
