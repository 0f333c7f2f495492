use std::sync::Arc;

use gproxy_provider_core::ProviderRegistry;

use crate::providers::aistudio::AistudioProvider;
use crate::providers::antigravity::AntigravityProvider;
use crate::providers::claude::ClaudeProvider;
use crate::providers::claudecode::ClaudeCodeProvider;
use crate::providers::codex::CodexProvider;
use crate::providers::deepseek::DeepSeekProvider;
use crate::providers::geminicli::GeminiCliProvider;
use crate::providers::glm::GlmProvider;
use crate::providers::iflow::IflowProvider;
use crate::providers::lmstudio::LmStudioProvider;
use crate::providers::nvidia::NvidiaProvider;
use crate::providers::openai::OpenAIProvider;
use crate::providers::qwen::QwenProvider;
use crate::providers::vertex::VertexProvider;
use crate::providers::vertexexpress::VertexExpressProvider;

/// Registers every built-in `UpstreamProvider` this workspace ships, keyed by
/// `UpstreamProvider::name()`. User-configured `ProviderConfig::Custom`
/// entries are instantiated separately by the caller, one `CustomProvider`
/// per configured `id`, since their dispatch table and base URL are
/// runtime-configured rather than builtin.
pub fn register_builtin_providers(registry: &mut ProviderRegistry) {
    registry.register(Arc::new(OpenAIProvider::new()));
    registry.register(Arc::new(ClaudeProvider::new()));
    registry.register(Arc::new(AistudioProvider::new()));
    registry.register(Arc::new(VertexExpressProvider::new()));
    registry.register(Arc::new(VertexProvider::new()));
    registry.register(Arc::new(GeminiCliProvider::new()));
    registry.register(Arc::new(ClaudeCodeProvider::new()));
    registry.register(Arc::new(CodexProvider::new()));
    registry.register(Arc::new(AntigravityProvider::new()));
    registry.register(Arc::new(NvidiaProvider::new()));
    registry.register(Arc::new(DeepSeekProvider::new()));
    registry.register(Arc::new(QwenProvider::new()));
    registry.register(Arc::new(IflowProvider::new()));
    registry.register(Arc::new(GlmProvider::new()));
    registry.register(Arc::new(LmStudioProvider::new()));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_every_builtin_provider_name() {
        let mut registry = ProviderRegistry::new();
        register_builtin_providers(&mut registry);
        for name in [
            "openai",
            "claude",
            "aistudio",
            "vertexexpress",
            "vertex",
            "geminicli",
            "claudecode",
            "codex",
            "antigravity",
            "nvidia",
            "deepseek",
            "qwen",
            "iflow",
            "glm",
            "lmstudio",
        ] {
            assert!(registry.get(name).is_some(), "missing provider {name}");
        }
    }
}
