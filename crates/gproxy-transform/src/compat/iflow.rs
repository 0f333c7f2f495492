//! iFlow compat: parameter renames into a `parameters` block and removal of
//! tool fields its function-calling implementation does not recognize.

use serde_json::Value;

use super::{
    CompatContext, CompatModule, CompatResult, TransformationRule, apply_rules,
    normalize_common_chat_shape, strip_unsupported_tool_fields, synthesize_openai_response_shape,
};

const PASS_THROUGH_TOP_LEVEL: &[&str] = &[
    "stream",
    "response_format",
    "user",
    "tools",
    "metadata",
];

fn rules() -> Vec<TransformationRule> {
    vec![
        TransformationRule::rename("max_tokens_to_parameters", "max_tokens", "parameters.max_output_tokens"),
        TransformationRule::rename("temperature_to_parameters", "temperature", "parameters.temperature"),
        TransformationRule::rename("top_p_to_parameters", "top_p", "parameters.top_p"),
        TransformationRule::rename(
            "frequency_penalty_to_parameters",
            "frequency_penalty",
            "parameters.frequency_penalty",
        ),
        TransformationRule::rename(
            "presence_penalty_to_parameters",
            "presence_penalty",
            "parameters.presence_penalty",
        ),
        TransformationRule::rename("stop_to_parameters", "stop", "parameters.stop_sequences"),
    ]
}

pub struct IflowCompat;

impl CompatModule for IflowCompat {
    fn process_incoming(&self, request: &mut Value, _ctx: &CompatContext) -> CompatResult<()> {
        normalize_common_chat_shape(request)?;
        apply_rules(request, &rules())?;
        strip_unsupported_tool_fields(request, &["strict"]);

        // `PASS_THROUGH_TOP_LEVEL` fields are already top-level on the
        // normalized Chat shape; nothing to move for them. Named here so
        // the provider's accepted surface stays documented alongside the
        // renamed parameters above.
        let _ = PASS_THROUGH_TOP_LEVEL;
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
        let mut response = serde_json::json!({"choices": [{"message": {}}]});
        IflowCompat
            .process_outgoing(&mut response, &CompatContext::default())
            .unwrap();
        assert_eq!(response["object"], "chat.completion");
        assert_eq!(response["model"], "unknown");
        assert_eq!(response["choices"][0]["message"]["content"], "");
    }

    #[test]
    fn sampling_params_move_under_parameters() {
        let mut request = serde_json::json!({
            "messages": [],
            "max_tokens": 512,
            "temperature": 0.7,
            "stop": ["\n"],
        });
        IflowCompat
            .process_incoming(&mut request, &CompatContext::default())
            .unwrap();
        assert_eq!(request["parameters"]["max_output_tokens"], 512);
        assert_eq!(request["parameters"]["temperature"], 0.7);
        assert_eq!(request["parameters"]["stop_sequences"][0], "\n");
        assert!(request.get("max_tokens").is_none());
    }

    #[test]
    fn strict_tool_field_is_stripped() {
        let mut request = serde_json::json!({
            "messages": [],
            "tools": [{"function": {"name": "f", "strict": true}}],
        });
        IflowCompat
            .process_incoming(&mut request, &CompatContext::default())
            .unwrap();
        assert!(request["tools"][0]["function"].get("strict").is_none());
    }
}
