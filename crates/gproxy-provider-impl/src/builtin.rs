//! Default provider rows seeded into storage on first boot.

pub struct BuiltinProviderSeed {
    pub name: &'static str,
    pub config_json: String,
    pub enabled: bool,
}

fn seed(name: &'static str, kind: &str, channel_settings: serde_json::Value) -> BuiltinProviderSeed {
    let config_json = serde_json::json!({
        "kind": kind,
        "channel_settings": channel_settings,
    })
    .to_string();
    BuiltinProviderSeed {
        name,
        config_json,
        enabled: false,
    }
}

/// Builtin providers seeded on first boot, disabled until the operator
/// supplies credentials through the admin surface.
pub fn builtin_provider_seeds() -> Vec<BuiltinProviderSeed> {
    vec![
        seed("openai", "openai", serde_json::json!({})),
        seed("claude", "claude", serde_json::json!({})),
        seed("aistudio", "aistudio", serde_json::json!({})),
        seed("vertexexpress", "vertexexpress", serde_json::json!({})),
        seed("vertex", "vertex", serde_json::json!({})),
        seed("geminicli", "geminicli", serde_json::json!({})),
        seed("claudecode", "claudecode", serde_json::json!({})),
        seed("codex", "codex", serde_json::json!({})),
        seed("antigravity", "antigravity", serde_json::json!({})),
        seed("nvidia", "nvidia", serde_json::json!({})),
        seed("deepseek", "deepseek", serde_json::json!({})),
        seed("qwen", "qwen", serde_json::json!({})),
        seed("iflow", "iflow", serde_json::json!({})),
        seed("glm", "glm", serde_json::json!({})),
        seed("lmstudio", "lmstudio", serde_json::json!({})),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use gproxy_provider_core::ProviderConfig;

    #[test]
    fn every_seed_parses_as_a_provider_config() {
        for seed in builtin_provider_seeds() {
            let parsed: Result<ProviderConfig, _> = serde_json::from_str(&seed.config_json);
            assert!(
                parsed.is_ok(),
                "seed {} does not parse: {:?}",
                seed.name,
                parsed.err()
            );
            assert!(!seed.enabled);
        }
    }
}
