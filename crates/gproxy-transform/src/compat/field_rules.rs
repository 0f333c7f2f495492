//! Ordered field-mapping engine shared by every compat module.
//!
//! Paths use dotted keys, with `*` standing in for "every element" when a
//! path segment addresses an array.

use std::collections::HashMap;

use serde_json::Value;

use super::{CompatError, CompatResult};

#[derive(Debug, Clone)]
pub enum TransformKind {
    /// Renames `source_path` to `target_path`, keeping the value.
    Rename,
    /// Maps the value at `source_path` through `mapping`, writing the result
    /// to `target_path`. Values missing from `mapping` pass through
    /// unchanged.
    Mapping,
    /// Removes the value at `source_path`.
    Delete,
    /// Writes a fixed `Value` to `target_path`, ignoring any source.
    Constant,
}

#[derive(Debug, Clone)]
pub struct TransformationRule {
    pub id: &'static str,
    pub kind: TransformKind,
    pub source_path: &'static str,
    pub target_path: &'static str,
    pub mapping: Option<HashMap<String, Value>>,
    pub constant: Option<Value>,
}

impl TransformationRule {
    pub const fn rename(id: &'static str, source_path: &'static str, target_path: &'static str) -> Self {
        Self {
            id,
            kind: TransformKind::Rename,
            source_path,
            target_path,
            mapping: None,
            constant: None,
        }
    }

    pub fn delete(id: &'static str, source_path: &'static str) -> Self {
        Self {
            id,
            kind: TransformKind::Delete,
            source_path,
            target_path: "",
            mapping: None,
            constant: None,
        }
    }
}

/// Applies every rule, in order, to `value`.
pub fn apply_rules(value: &mut Value, rules: &[TransformationRule]) -> CompatResult<()> {
    for rule in rules {
        match rule.kind {
            TransformKind::Rename => {
                if let Some(found) = take_path(value, rule.source_path)? {
                    set_path(value, rule.target_path, found)?;
                }
            }
            TransformKind::Mapping => {
                if let Some(found) = get_path(value, rule.source_path)?.cloned() {
                    let mapped = found
                        .as_str()
                        .and_then(|key| rule.mapping.as_ref()?.get(key).cloned())
                        .unwrap_or(found);
                    set_path(value, rule.target_path, mapped)?;
                }
            }
            TransformKind::Delete => {
                let _ = take_path(value, rule.source_path)?;
            }
            TransformKind::Constant => {
                let constant = rule.constant.clone().unwrap_or(Value::Null);
                set_path(value, rule.target_path, constant)?;
            }
        }
    }
    Ok(())
}

fn split_path(path: &str) -> impl Iterator<Item = &str> {
    path.split('.').filter(|segment| !segment.is_empty())
}

fn get_path<'a>(value: &'a Value, path: &str) -> CompatResult<Option<&'a Value>> {
    let mut current = value;
    for segment in split_path(path) {
        if segment == "*" {
            return Err(CompatError::UnsupportedPath(
                "get_path does not support wildcard segments".to_string(),
            ));
        }
        current = match current.get(segment) {
            Some(next) => next,
            None => return Ok(None),
        };
    }
    Ok(Some(current))
}

fn take_path(value: &mut Value, path: &str) -> CompatResult<Option<Value>> {
    let segments: Vec<&str> = split_path(path).collect();
    let Some((last, parents)) = segments.split_last() else {
        return Ok(None);
    };
    let mut current = value;
    for segment in parents {
        current = match current.get_mut(*segment) {
            Some(next) => next,
            None => return Ok(None),
        };
    }
    let Some(obj) = current.as_object_mut() else {
        return Ok(None);
    };
    Ok(obj.remove(*last))
}

fn set_path(value: &mut Value, path: &str, new_value: Value) -> CompatResult<()> {
    let segments: Vec<&str> = split_path(path).collect();
    let Some((last, parents)) = segments.split_last() else {
        return Ok(());
    };
    let mut current = value;
    for segment in parents {
        if !current.is_object() {
            *current = Value::Object(serde_json::Map::new());
        }
        current = current
            .as_object_mut()
            .expect("just ensured object")
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
    }
    if !current.is_object() {
        *current = Value::Object(serde_json::Map::new());
    }
    current
        .as_object_mut()
        .expect("just ensured object")
        .insert(last.to_string(), new_value);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rename_moves_value_between_paths() {
        let mut value = serde_json::json!({"max_tokens": 256});
        let rules = [TransformationRule::rename(
            "max_tokens_to_parameters",
            "max_tokens",
            "parameters.max_output_tokens",
        )];
        apply_rules(&mut value, &rules).unwrap();
        assert_eq!(value["parameters"]["max_output_tokens"], 256);
        assert!(value.get("max_tokens").is_none());
    }

    #[test]
    fn delete_removes_the_source_path() {
        let mut value = serde_json::json!({"a": {"b": 1}});
        let rules = [TransformationRule::delete("drop_b", "a.b")];
        apply_rules(&mut value, &rules).unwrap();
        assert!(value["a"].get("b").is_none());
    }

    #[test]
    fn mapping_falls_through_when_key_is_unmapped() {
        let mut mapping = HashMap::new();
        mapping.insert("gpt-4".to_string(), Value::String("qwen3-coder-plus".to_string()));
        let mut value = serde_json::json!({"model": "custom-model"});
        let rules = [TransformationRule {
            id: "model_map",
            kind: TransformKind::Mapping,
            source_path: "model",
            target_path: "model",
            mapping: Some(mapping),
            constant: None,
        }];
        apply_rules(&mut value, &rules).unwrap();
        assert_eq!(value["model"], "custom-model");
    }
}
