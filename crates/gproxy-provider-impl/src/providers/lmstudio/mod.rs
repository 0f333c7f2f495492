use bytes::Bytes;

use gproxy_provider_core::{
    Credential, DispatchRule, DispatchTable, HttpMethod, Proto, ProviderConfig, ProviderError,
    ProviderResult, UpstreamCtx, UpstreamHttpRequest, UpstreamProvider, credential::ApiKeyCredential,
};

use crate::auth_extractor;

const PROVIDER_NAME: &str = "lmstudio";
const DEFAULT_BASE_URL: &str = "http://localhost:1234/v1";

const DISPATCH_TABLE: DispatchTable = DispatchTable::new([
    // Claude
    DispatchRule::Transform {
        target: Proto::OpenAIChat,
    },
    DispatchRule::Transform {
        target: Proto::OpenAIChat,
    },
    DispatchRule::Transform {
        target: Proto::OpenAI,
    },
    DispatchRule::Transform {
        target: Proto::OpenAI,
    },
    DispatchRule::Transform {
        target: Proto::OpenAI,
    },
    // Gemini
    DispatchRule::Transform {
        target: Proto::OpenAIChat,
    },
    DispatchRule::Transform {
        target: Proto::OpenAIChat,
    },
    DispatchRule::Transform {
        target: Proto::OpenAI,
    },
    DispatchRule::Transform {
        target: Proto::OpenAI,
    },
    DispatchRule::Transform {
        target: Proto::OpenAI,
    },
    // OpenAI chat completions
    DispatchRule::Native,
    DispatchRule::Native,
    // OpenAI Responses (map to chat completions, LM Studio doesn't speak Responses)
    DispatchRule::Transform {
        target: Proto::OpenAIChat,
    },
    DispatchRule::Transform {
        target: Proto::OpenAIChat,
    },
    // OpenAI basic ops
    DispatchRule::Unsupported,
    DispatchRule::Native,
    DispatchRule::Native,
    // OAuth / usage (local server, no auth lifecycle)
    DispatchRule::Unsupported,
    DispatchRule::Unsupported,
    DispatchRule::Unsupported,
]);

/// LM Studio's local server speaks the OpenAI Chat Completions API; the
/// "credential" is whatever bearer value (often a placeholder) the user has
/// configured LM Studio to accept, never a real managed secret.
#[derive(Debug, Default)]
pub struct LmStudioProvider;

impl LmStudioProvider {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl UpstreamProvider for LmStudioProvider {
    fn name(&self) -> &'static str {
        PROVIDER_NAME
    }

    fn dispatch_table(&self, _config: &ProviderConfig) -> DispatchTable {
        DISPATCH_TABLE
    }

    async fn build_openai_chat(
        &self,
        _ctx: &UpstreamCtx,
        config: &ProviderConfig,
        credential: &Credential,
        req: &gproxy_protocol::openai::create_chat_completions::request::CreateChatCompletionRequest,
    ) -> ProviderResult<UpstreamHttpRequest> {
        let base_url = lmstudio_base_url(config)?;
        let url = build_url(base_url, "/chat/completions");
        let is_stream = req.body.stream.unwrap_or(false);
        let body =
            serde_json::to_vec(&req.body).map_err(|err| ProviderError::Other(err.to_string()))?;
        let mut headers = Vec::new();
        if let Some(api_key) = lmstudio_api_key(credential) {
            auth_extractor::set_bearer(&mut headers, api_key);
        }
        auth_extractor::set_accept_json(&mut headers);
        auth_extractor::set_content_type_json(&mut headers);
        Ok(UpstreamHttpRequest {
            method: HttpMethod::Post,
            url,
            headers,
            body: Some(Bytes::from(body)),
            is_stream,
        })
    }

    async fn build_openai_models_list(
        &self,
        _ctx: &UpstreamCtx,
        config: &ProviderConfig,
        credential: &Credential,
        _req: &gproxy_protocol::openai::list_models::request::ListModelsRequest,
    ) -> ProviderResult<UpstreamHttpRequest> {
        let base_url = lmstudio_base_url(config)?;
        let url = build_url(base_url, "/models");
        let mut headers = Vec::new();
        if let Some(api_key) = lmstudio_api_key(credential) {
            auth_extractor::set_bearer(&mut headers, api_key);
        }
        auth_extractor::set_accept_json(&mut headers);
        Ok(UpstreamHttpRequest {
            method: HttpMethod::Get,
            url,
            headers,
            body: None,
            is_stream: false,
        })
    }

    async fn build_openai_models_get(
        &self,
        _ctx: &UpstreamCtx,
        config: &ProviderConfig,
        credential: &Credential,
        req: &gproxy_protocol::openai::get_model::request::GetModelRequest,
    ) -> ProviderResult<UpstreamHttpRequest> {
        let base_url = lmstudio_base_url(config)?;
        let url = build_url(base_url, &format!("/models/{}", req.path.model));
        let mut headers = Vec::new();
        if let Some(api_key) = lmstudio_api_key(credential) {
            auth_extractor::set_bearer(&mut headers, api_key);
        }
        auth_extractor::set_accept_json(&mut headers);
        Ok(UpstreamHttpRequest {
            method: HttpMethod::Get,
            url,
            headers,
            body: None,
            is_stream: false,
        })
    }
}

fn lmstudio_base_url(config: &ProviderConfig) -> ProviderResult<&str> {
    match config {
        ProviderConfig::LmStudio(cfg) => Ok(cfg.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL)),
        _ => Err(ProviderError::InvalidConfig(
            "expected ProviderConfig::LmStudio".to_string(),
        )),
    }
}

fn lmstudio_api_key(credential: &Credential) -> Option<&str> {
    match credential {
        Credential::LmStudio(ApiKeyCredential { api_key }) if !api_key.is_empty() => {
            Some(api_key.as_str())
        }
        _ => None,
    }
}

fn build_url(base_url: &str, path: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), path.trim_start_matches('/'))
}
