//! Provider-agnostic extraction of a single string from a `role=tool`
//! message's `content`, which inbound clients may send as a string, an
//! array of parts, or a structured object.

use serde_json::Value;

use super::{CompatError, CompatResult};

pub fn flatten_tool_result_content(content: &Value) -> CompatResult<String> {
    let flattened = match content {
        Value::String(text) => text.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(extract_text_part)
            .collect::<Vec<_>>()
            .join(""),
        Value::Object(_) => serde_json::to_string(content).unwrap_or_default(),
        Value::Null => String::new(),
        other => other.to_string(),
    };
    if flattened.is_empty() {
        return Err(CompatError::ToolTextEmpty);
    }
    Ok(flattened)
}

fn extract_text_part(part: &Value) -> Option<String> {
    match part {
        Value::String(text) => Some(text.clone()),
        Value::Object(obj) => obj
            .get("text")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .or_else(|| {
                obj.get("content")
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
            }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_content_passes_through() {
        let content = serde_json::json!("plain result");
        assert_eq!(flatten_tool_result_content(&content).unwrap(), "plain result");
    }

    #[test]
    fn array_of_text_parts_is_joined() {
        let content = serde_json::json!([{"type": "text", "text": "a"}, {"type": "text", "text": "b"}]);
        assert_eq!(flatten_tool_result_content(&content).unwrap(), "ab");
    }

    #[test]
    fn structured_object_is_json_encoded() {
        let content = serde_json::json!({"ok": true});
        assert_eq!(flatten_tool_result_content(&content).unwrap(), r#"{"ok":true}"#);
    }

    #[test]
    fn empty_array_is_rejected() {
        let content = serde_json::json!([]);
        assert_eq!(
            flatten_tool_result_content(&content).unwrap_err(),
            CompatError::ToolTextEmpty
        );
    }
}
