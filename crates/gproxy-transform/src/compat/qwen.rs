//! Qwen portal compat: model-name remapping and the `messages` + `input[]`
//! dual representation its chat endpoint expects.

use serde_json::Value;

use super::{
    CompatContext, CompatModule, CompatResult, normalize_common_chat_shape,
    synthesize_openai_response_shape,
};

pub struct QwenCompat;

fn map_model(requested: &str) -> &'static str {
    match requested {
        "gpt-3.5-turbo" => "qwen-turbo",
        "gpt-4" | "gpt-4-turbo" | "gpt-4o" => "qwen3-coder-plus",
        _ => "qwen3-coder-plus",
    }
}

fn normalize_part(part: &Value) -> Value {
    match part {
        Value::Object(obj) if obj.get("type").and_then(|t| t.as_str()) == Some("input_text") => {
            serde_json::json!({ "text": obj.get("text").cloned().unwrap_or(Value::Null) })
        }
        Value::Object(obj) if obj.contains_key("text") => {
            serde_json::json!({ "text": obj.get("text").cloned().unwrap_or(Value::Null) })
        }
        Value::String(text) => serde_json::json!({ "text": text }),
        other => other.clone(),
    }
}

impl CompatModule for QwenCompat {
    fn process_incoming(&self, request: &mut Value, ctx: &CompatContext) -> CompatResult<()> {
        normalize_common_chat_shape(request)?;

        if let Some(model) = request.get("model").and_then(|m| m.as_str()).map(str::to_string) {
            request["model"] = Value::String(map_model(&model).to_string());
        } else if !ctx.requested_model.is_empty() {
            request["model"] = Value::String(map_model(&ctx.requested_model).to_string());
        }

        let messages = request
            .get("messages")
            .cloned()
            .unwrap_or(Value::Array(Vec::new()));
        let Value::Array(message_list) = &messages else {
            return Ok(());
        };

        let input: Vec<Value> = message_list
            .iter()
            .map(|message| {
                let role = message.get("role").cloned().unwrap_or(Value::Null);
                let content = match message.get("content") {
                    Some(Value::Array(parts)) => {
                        Value::Array(parts.iter().map(normalize_part).collect())
                    }
                    Some(Value::String(text)) => {
                        Value::Array(vec![serde_json::json!({ "text": text })])
                    }
                    Some(other) => Value::Array(vec![normalize_part(other)]),
                    None => Value::Array(Vec::new()),
                };
                serde_json::json!({ "role": role, "content": content })
            })
            .collect();

        request["input"] = Value::Array(input);
        Ok(())
    }

    fn process_outgoing(&self, response: &mut Value, ctx: &CompatContext) -> CompatResult<()> {
        synthesize_openai_response_shape(response, ctx);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incomplete_response_is_synthesized_into_chat_completion_shape() {
        let mut response = serde_json::json!({
            "choices": [{"message": {"role": "assistant", "content": "hi"}}]
        });
        let ctx = CompatContext {
            provider: "qwen".to_string(),
            requested_model: "qwen3-coder-plus".to_string(),
        };
        QwenCompat.process_outgoing(&mut response, &ctx).unwrap();
        assert_eq!(response["object"], "chat.completion");
        assert!(response["id"].as_str().unwrap().starts_with("chatcmpl_"));
        assert_eq!(response["model"], "qwen3-coder-plus");
        assert_eq!(response["choices"][0]["finish_reason"], "stop");
    }

    #[test]
    fn gpt_models_are_remapped_to_qwen_models() {
        assert_eq!(map_model("gpt-3.5-turbo"), "qwen-turbo");
        assert_eq!(map_model("gpt-4o"), "qwen3-coder-plus");
    }

    #[test]
    fn input_array_mirrors_messages_with_flattened_parts() {
        let mut request = serde_json::json!({
            "model": "gpt-4",
            "messages": [
                {"role": "user", "content": [{"type": "input_text", "text": "hi"}]},
            ]
        });
        let ctx = CompatContext::default();
        QwenCompat.process_incoming(&mut request, &ctx).unwrap();
        assert_eq!(request["model"], "qwen3-coder-plus");
        assert_eq!(request["input"][0]["role"], "user");
        assert_eq!(request["input"][0]["content"][0]["text"], "hi");
        assert_eq!(request["messages"][0]["content"][0]["type"], "input_text");
    }
}
