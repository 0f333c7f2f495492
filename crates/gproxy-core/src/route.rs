//! Pattern-based route table: picks an ordered module chain for a request.
//!
//! A route's module chain must end in an `llmswitch` module (Tools Unique
//! Entrance) so tool-call semantics are normalized in exactly one place.

use std::sync::Arc;

use regex::Regex;
use serde_json::Value;
use thiserror::Error;

use crate::pool::{InstancePool, ModuleInstance, PoolError};

pub const LLMSWITCH_MARKER: &str = "llmswitch";

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("route {route_id:?}: {reason}")]
    Invalid { route_id: String, reason: String },
    #[error(transparent)]
    Pool(#[from] PoolError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionOperator {
    Equals,
    Contains,
    Matches,
    Exists,
    Gt,
    Lt,
}

#[derive(Debug, Clone)]
pub struct Condition {
    pub field: String,
    pub operator: ConditionOperator,
    pub value: Value,
}

impl Condition {
    /// Evaluates against a request's canonical JSON data, looking the field
    /// up as a dotted path (`messages.0.role`).
    pub fn evaluate(&self, data: &Value) -> bool {
        let found = lookup_path(data, &self.field);
        match self.operator {
            ConditionOperator::Exists => found.is_some(),
            ConditionOperator::Equals => found.is_some_and(|v| v == &self.value),
            ConditionOperator::Contains => match found {
                Some(Value::String(s)) => self
                    .value
                    .as_str()
                    .map(|needle| s.contains(needle))
                    .unwrap_or(false),
                Some(Value::Array(items)) => items.contains(&self.value),
                _ => false,
            },
            ConditionOperator::Matches => match (found, self.value.as_str()) {
                (Some(Value::String(s)), Some(pattern)) => {
                    Regex::new(pattern).map(|re| re.is_match(s)).unwrap_or(false)
                }
                _ => false,
            },
            ConditionOperator::Gt => match (found.and_then(Value::as_f64), self.value.as_f64()) {
                (Some(a), Some(b)) => a > b,
                _ => false,
            },
            ConditionOperator::Lt => match (found.and_then(Value::as_f64), self.value.as_f64()) {
                (Some(a), Some(b)) => a < b,
                _ => false,
            },
        }
    }
}

fn lookup_path<'a>(data: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(data, |cur, segment| match cur {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

#[derive(Debug, Clone)]
pub enum ModelMatch {
    Exact(String),
    Regex(String),
}

impl ModelMatch {
    fn matches(&self, model: &str) -> bool {
        match self {
            ModelMatch::Exact(expected) => expected == model,
            ModelMatch::Regex(pattern) => Regex::new(pattern)
                .map(|re| re.is_match(model))
                .unwrap_or(false),
        }
    }

    /// A literal value consistent with this pattern, for dry-run simulation.
    pub fn sample(&self) -> String {
        match self {
            ModelMatch::Exact(expected) => expected.clone(),
            ModelMatch::Regex(_) => "simulated-model".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RoutePattern {
    pub model: Option<ModelMatch>,
    pub has_tools: Option<bool>,
}

impl RoutePattern {
    fn matches(&self, model: Option<&str>, has_tools: bool) -> bool {
        if let Some(expected) = &self.model {
            match model {
                Some(model) if expected.matches(model) => {}
                _ => return false,
            }
        }
        if let Some(expected) = self.has_tools
            && expected != has_tools
        {
            return false;
        }
        true
    }
}

#[derive(Debug, Clone)]
pub struct ModuleSpecification {
    pub module_type: String,
    pub config: Value,
    pub condition: Option<Condition>,
}

#[derive(Debug, Clone)]
pub struct RouteDefinition {
    pub id: String,
    pub pattern: RoutePattern,
    pub modules: Vec<ModuleSpecification>,
    pub priority: u32,
}

impl RouteDefinition {
    /// Enforces the Tools Unique Entrance rule: the last declared module must
    /// carry an `llmswitch` type. This is a static property of the route
    /// definition, independent of which conditional modules end up active
    /// for a given request, so the last module may not itself be gated by a
    /// `condition`.
    pub fn validate(&self) -> Result<(), RouteError> {
        match self.modules.last() {
            Some(last) if last.condition.is_none() && last.module_type.contains(LLMSWITCH_MARKER) => {
                Ok(())
            }
            _ => Err(RouteError::Invalid {
                route_id: self.id.clone(),
                reason: "Tools Unique Entrance: last module must have type containing \"llmswitch\""
                    .to_string(),
            }),
        }
    }

    /// Modules whose condition holds for this request's data.
    fn active_modules(&self, data: &Value) -> Vec<&ModuleSpecification> {
        self.modules
            .iter()
            .filter(|m| m.condition.as_ref().is_none_or(|c| c.evaluate(data)))
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct MatchedRoute {
    pub route_id: String,
    pub score: u32,
}

#[derive(Debug, Default)]
pub struct RouteTable {
    pub routes: Vec<RouteDefinition>,
    pub default_route: Option<String>,
}

impl RouteTable {
    pub fn new(routes: Vec<RouteDefinition>, default_route: Option<String>) -> Result<Self, RouteError> {
        for route in &routes {
            route.validate()?;
        }
        Ok(Self {
            routes,
            default_route,
        })
    }

    pub fn find(&self, id: &str) -> Option<&RouteDefinition> {
        self.routes.iter().find(|r| r.id == id)
    }

    pub fn match_route(&self, model: Option<&str>, has_tools: bool) -> Option<MatchedRoute> {
        let mut candidates: Vec<&RouteDefinition> = self
            .routes
            .iter()
            .filter(|r| r.pattern.matches(model, has_tools))
            .collect();
        candidates.sort_by(|a, b| b.priority.cmp(&a.priority));
        if let Some(route) = candidates.first() {
            return Some(MatchedRoute {
                route_id: route.id.clone(),
                score: route.priority,
            });
        }
        self.default_route
            .as_ref()
            .and_then(|id| self.find(id))
            .map(|route| MatchedRoute {
                route_id: route.id.clone(),
                score: 0,
            })
    }
}

pub struct Chain {
    pub route_id: String,
    pub instances: Vec<Arc<dyn ModuleInstance>>,
}

impl Chain {
    pub fn validate_health(&self) -> bool {
        self.instances.iter().all(|i| i.is_healthy())
    }

    /// No-op for shared instances: nothing is held per-request.
    pub fn cleanup_connections(&self) {}
}

pub async fn build_module_chain(
    route: &RouteDefinition,
    request_data: &Value,
    pool: &InstancePool,
) -> Result<Chain, RouteError> {
    route.validate()?;
    let mut instances = Vec::with_capacity(route.modules.len());
    for module in route.active_modules(request_data) {
        let instance = pool.get_instance(&module.module_type, &module.config).await?;
        instances.push(instance);
    }
    Ok(Chain {
        route_id: route.id.clone(),
        instances,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn llmswitch_route(id: &str, priority: u32, pattern: RoutePattern) -> RouteDefinition {
        RouteDefinition {
            id: id.to_string(),
            pattern,
            modules: vec![
                ModuleSpecification {
                    module_type: "provider-qwen".to_string(),
                    config: Value::Null,
                    condition: None,
                },
                ModuleSpecification {
                    module_type: "llmswitch-default".to_string(),
                    config: Value::Null,
                    condition: None,
                },
            ],
            priority,
        }
    }

    #[test]
    fn missing_llmswitch_last_fails_validation() {
        let route = RouteDefinition {
            id: "bad".to_string(),
            pattern: RoutePattern::default(),
            modules: vec![
                ModuleSpecification {
                    module_type: "provider-qwen".to_string(),
                    config: Value::Null,
                    condition: None,
                },
                ModuleSpecification {
                    module_type: "compat-qwen".to_string(),
                    config: Value::Null,
                    condition: None,
                },
            ],
            priority: 0,
        };
        let err = route.validate().unwrap_err();
        assert!(err.to_string().contains("Tools Unique Entrance"));
    }

    #[test]
    fn higher_priority_route_wins_on_multi_match() {
        let low = llmswitch_route("low", 1, RoutePattern::default());
        let high = llmswitch_route("high", 5, RoutePattern::default());
        let table = RouteTable::new(vec![low, high], None).unwrap();
        let matched = table.match_route(Some("gpt-4"), false).unwrap();
        assert_eq!(matched.route_id, "high");
    }

    #[test]
    fn falls_back_to_default_route_when_nothing_matches() {
        let route = llmswitch_route(
            "specific",
            1,
            RoutePattern {
                model: Some(ModelMatch::Exact("only-this-model".to_string())),
                has_tools: None,
            },
        );
        let default = llmswitch_route("default", 0, RoutePattern::default());
        let table = RouteTable::new(vec![route, default], Some("default".to_string())).unwrap();
        let matched = table.match_route(Some("other-model"), false).unwrap();
        assert_eq!(matched.route_id, "default");
    }

    #[test]
    fn regex_model_pattern_matches() {
        let route = llmswitch_route(
            "regex",
            0,
            RoutePattern {
                model: Some(ModelMatch::Regex("^gpt-4.*".to_string())),
                has_tools: None,
            },
        );
        let table = RouteTable::new(vec![route], None).unwrap();
        assert!(table.match_route(Some("gpt-4o"), false).is_some());
        assert!(table.match_route(Some("claude-3"), false).is_none());
    }

    #[test]
    fn condition_gt_evaluates_numeric_field() {
        let condition = Condition {
            field: "usage.count".to_string(),
            operator: ConditionOperator::Gt,
            value: serde_json::json!(10),
        };
        let data = serde_json::json!({"usage": {"count": 20}});
        assert!(condition.evaluate(&data));
    }
}
