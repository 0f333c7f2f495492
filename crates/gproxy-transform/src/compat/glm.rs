//! GLM (Zhipu BigModel) compat: GLM's OpenAI-Chat-compatible endpoint needs
//! only the shared tool-result/tool-call normalization, no field renames.

use serde_json::Value;

use super::{
    CompatContext, CompatModule, CompatResult, normalize_common_chat_shape,
    synthesize_openai_response_shape,
};

pub struct GlmCompat;

impl CompatModule for GlmCompat {
    fn process_incoming(&self, request: &mut Value, _ctx: &CompatContext) -> CompatResult<()> {
        normalize_common_chat_shape(request)
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
        let mut response = serde_json::json!({"choices": [{"message": {}}]});
        GlmCompat
            .process_outgoing(&mut response, &CompatContext::default())
            .unwrap();
        assert_eq!(response["object"], "chat.completion");
        assert!(response["id"].as_str().unwrap().starts_with("chatcmpl_"));
    }

    #[test]
    fn tool_results_are_flattened_like_every_other_module() {
        let mut request = serde_json::json!({
            "messages": [{"role": "tool", "content": "ok"}]
        });
        GlmCompat
            .process_incoming(&mut request, &CompatContext::default())
            .unwrap();
        assert_eq!(request["messages"][0]["content"], "ok");
    }
}
