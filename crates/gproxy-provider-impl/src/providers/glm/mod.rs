use bytes::Bytes;

use gproxy_provider_core::{
    Credential, DispatchRule, DispatchTable, HttpMethod, Op, Proto, ProviderConfig, ProviderError,
    ProviderResult, Request, UpstreamCtx, UpstreamHttpRequest, UpstreamProvider,
    credential::ApiKeyCredential,
};

use gproxy_transform::compat::{CompatContext, CompatModule, glm::GlmCompat};

use crate::auth_extractor;

const PROVIDER_NAME: &str = "glm";
const DEFAULT_BASE_URL: &str = "https://open.bigmodel.cn/api/paas/v4";

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
    // OpenAI Responses (map to chat completions)
    DispatchRule::Transform {
        target: Proto::OpenAIChat,
    },
    DispatchRule::Transform {
        target: Proto::OpenAIChat,
    },
    // OpenAI basic ops
    DispatchRule::Native,
    DispatchRule::Native,
    DispatchRule::Native,
    // OAuth / usage (GLM is apikey-only)
    DispatchRule::Unsupported,
    DispatchRule::Unsupported,
    DispatchRule::Unsupported,
]);

/// Zhipu/GLM is an OpenAI-Chat-compatible endpoint authenticated with a bare
/// API key, so it's dispatched the same way the `deepseek` provider is.
#[derive(Debug, Default)]
pub struct GlmProvider;

impl GlmProvider {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl UpstreamProvider for GlmProvider {
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
        let base_url = glm_base_url(config)?;
        let api_key = glm_api_key(credential)?;
        let url = build_url(base_url, "/chat/completions");
        let is_stream = req.body.stream.unwrap_or(false);
        let mut value = serde_json::to_value(&req.body)
            .map_err(|err| ProviderError::Other(err.to_string()))?;
        let ctx = CompatContext {
            provider: PROVIDER_NAME.to_string(),
            requested_model: req.body.model.clone(),
        };
        GlmCompat
            .process_incoming(&mut value, &ctx)
            .map_err(|err| ProviderError::Other(err.to_string()))?;
        let body = serde_json::to_vec(&value).map_err(|err| ProviderError::Other(err.to_string()))?;
        let mut headers = Vec::new();
        auth_extractor::set_bearer(&mut headers, api_key);
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
        let base_url = glm_base_url(config)?;
        let api_key = glm_api_key(credential)?;
        let url = build_url(base_url, "/models");
        let mut headers = Vec::new();
        auth_extractor::set_bearer(&mut headers, api_key);
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
        let base_url = glm_base_url(config)?;
        let api_key = glm_api_key(credential)?;
        let url = build_url(base_url, &format!("/models/{}", req.path.model));
        let mut headers = Vec::new();
        auth_extractor::set_bearer(&mut headers, api_key);
        auth_extractor::set_accept_json(&mut headers);
        Ok(UpstreamHttpRequest {
            method: HttpMethod::Get,
            url,
            headers,
            body: None,
            is_stream: false,
        })
    }

    fn normalize_nonstream_response(
        &self,
        _ctx: &UpstreamCtx,
        _config: &ProviderConfig,
        _credential: &Credential,
        proto: Proto,
        _op: Op,
        _req: &Request,
        body: Bytes,
    ) -> ProviderResult<Bytes> {
        if proto != Proto::OpenAI {
            return Ok(body);
        }
        let Ok(mut value) = serde_json::from_slice::<serde_json::Value>(&body) else {
            return Ok(body);
        };
        GlmCompat
            .process_outgoing(&mut value, &CompatContext::default())
            .map_err(|err| ProviderError::Other(err.to_string()))?;
        serde_json::to_vec(&value)
            .map(Bytes::from)
            .map_err(|err| ProviderError::Other(err.to_string()))
    }
}

fn glm_base_url(config: &ProviderConfig) -> ProviderResult<&str> {
    match config {
        ProviderConfig::Glm(cfg) => Ok(cfg.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL)),
        _ => Err(ProviderError::InvalidConfig(
            "expected ProviderConfig::Glm".to_string(),
        )),
    }
}

fn glm_api_key(credential: &Credential) -> ProviderResult<&str> {
    match credential {
        Credential::Glm(ApiKeyCredential { api_key }) => Ok(api_key.as_str()),
        _ => Err(ProviderError::InvalidConfig(
            "expected Credential::Glm".to_string(),
        )),
    }
}

fn build_url(base_url: &str, path: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), path.trim_start_matches('/'))
}
