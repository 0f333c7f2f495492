//! Canonicalizes `tool_calls[*].function.arguments`: accepts string or
//! object on input, always emits a JSON-encoded string.

use serde_json::Value;

use super::{CompatError, CompatResult};

pub fn canonicalize_tool_call_arguments(arguments: &Value) -> CompatResult<String> {
    match arguments {
        Value::String(raw) => {
            serde_json::from_str::<Value>(raw)
                .map_err(|err| CompatError::ToolCallArgsInvalid(err.to_string()))?;
            Ok(raw.clone())
        }
        Value::Object(_) | Value::Array(_) => {
            serde_json::to_string(arguments).map_err(|err| CompatError::ToolCallArgsInvalid(err.to_string()))
        }
        Value::Null => Ok("{}".to_string()),
        other => Ok(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_arguments_are_json_encoded() {
        let arguments = serde_json::json!({"a": 1});
        assert_eq!(
            canonicalize_tool_call_arguments(&arguments).unwrap(),
            r#"{"a":1}"#
        );
    }

    #[test]
    fn valid_json_string_passes_through_unchanged() {
        let arguments = serde_json::json!("{\"a\":1}");
        assert_eq!(canonicalize_tool_call_arguments(&arguments).unwrap(), "{\"a\":1}");
    }

    #[test]
    fn invalid_json_string_is_rejected() {
        let arguments = serde_json::json!("not json");
        assert!(matches!(
            canonicalize_tool_call_arguments(&arguments),
            Err(CompatError::ToolCallArgsInvalid(_))
        ));
    }
}
