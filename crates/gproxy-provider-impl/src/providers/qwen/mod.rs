use bytes::Bytes;

use gproxy_provider_core::credential::OAuthTokenCredential;
use gproxy_provider_core::provider::UpstreamFailure;
use gproxy_provider_core::{
    AuthRetryAction, Credential, DispatchRule, DispatchTable, HttpMethod, OAuthCallbackRequest,
    OAuthCallbackResult, OAuthStartRequest, Op, Proto, ProviderConfig, ProviderError,
    ProviderResult, Request, UpstreamCtx, UpstreamHttpRequest, UpstreamHttpResponse,
    UpstreamProvider,
};

use gproxy_transform::compat::{CompatContext, CompatModule, qwen::QwenCompat};

use crate::auth_extractor;

mod oauth;

const PROVIDER_NAME: &str = "qwen";
const DEFAULT_BASE_URL: &str = "https://dashscope.aliyuncs.com/compatible-mode/v1";
const DEFAULT_DEVICE_CODE_URL: &str = "https://chat.qwen.ai/api/v1/oauth2/device/code";
const DEFAULT_TOKEN_URL: &str = "https://chat.qwen.ai/api/v1/oauth2/token";
const CLIENT_ID: &str = "f0304373b74a44d2b584a3fb70ca9e56";

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
    // OpenAI Responses
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
    // OAuth / usage
    DispatchRule::Native,
    DispatchRule::Native,
    DispatchRule::Unsupported,
]);

#[derive(Debug, Default)]
pub struct QwenProvider;

impl QwenProvider {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl UpstreamProvider for QwenProvider {
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
        let base_url = qwen_base_url(config)?;
        let token = qwen_credential(credential)?;
        let url = build_url(base_url, "/chat/completions");
        let is_stream = req.body.stream.unwrap_or(false);
        let mut value = serde_json::to_value(&req.body)
            .map_err(|err| ProviderError::Other(err.to_string()))?;
        let ctx = CompatContext {
            provider: PROVIDER_NAME.to_string(),
            requested_model: req.body.model.clone(),
        };
        QwenCompat
            .process_incoming(&mut value, &ctx)
            .map_err(|err| ProviderError::Other(err.to_string()))?;
        let body = serde_json::to_vec(&value).map_err(|err| ProviderError::Other(err.to_string()))?;
        let mut headers = Vec::new();
        auth_extractor::set_bearer(&mut headers, &token.access_token);
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
        let base_url = qwen_base_url(config)?;
        let token = qwen_credential(credential)?;
        let url = build_url(base_url, "/models");
        let mut headers = Vec::new();
        auth_extractor::set_bearer(&mut headers, &token.access_token);
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
        let base_url = qwen_base_url(config)?;
        let token = qwen_credential(credential)?;
        let url = build_url(base_url, &format!("/models/{}", req.path.model));
        let mut headers = Vec::new();
        auth_extractor::set_bearer(&mut headers, &token.access_token);
        auth_extractor::set_accept_json(&mut headers);
        Ok(UpstreamHttpRequest {
            method: HttpMethod::Get,
            url,
            headers,
            body: None,
            is_stream: false,
        })
    }

    fn oauth_start(
        &self,
        ctx: &UpstreamCtx,
        _config: &ProviderConfig,
        req: &OAuthStartRequest,
    ) -> ProviderResult<UpstreamHttpResponse> {
        oauth::oauth_start(ctx, req)
    }

    fn oauth_callback(
        &self,
        ctx: &UpstreamCtx,
        _config: &ProviderConfig,
        req: &OAuthCallbackRequest,
    ) -> ProviderResult<OAuthCallbackResult> {
        oauth::oauth_callback(ctx, req)
    }

    fn on_auth_failure<'a>(
        &'a self,
        ctx: &'a UpstreamCtx,
        _config: &'a ProviderConfig,
        credential: &'a Credential,
        _req: &'a Request,
        failure: &'a UpstreamFailure,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = AuthRetryAction> + Send + 'a>> {
        Box::pin(async move {
            let UpstreamFailure::Http { status, .. } = failure else {
                return AuthRetryAction::None;
            };
            if *status != 401 {
                return AuthRetryAction::None;
            }
            let Credential::Qwen(token) = credential else {
                return AuthRetryAction::None;
            };
            if token.refresh_token.is_empty() {
                return AuthRetryAction::None;
            }
            match oauth::refresh_access_token(ctx, DEFAULT_TOKEN_URL, &token.refresh_token).await {
                Ok(refreshed) => {
                    AuthRetryAction::UpdateCredential(Box::new(Credential::Qwen(refreshed)))
                }
                Err(_) => AuthRetryAction::None,
            }
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
        QwenCompat
            .process_outgoing(&mut value, &CompatContext::default())
            .map_err(|err| ProviderError::Other(err.to_string()))?;
        serde_json::to_vec(&value)
            .map(Bytes::from)
            .map_err(|err| ProviderError::Other(err.to_string()))
    }
}

fn qwen_base_url(config: &ProviderConfig) -> ProviderResult<&str> {
    match config {
        ProviderConfig::Qwen(cfg) => Ok(cfg.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL)),
        _ => Err(ProviderError::InvalidConfig(
            "expected ProviderConfig::Qwen".to_string(),
        )),
    }
}

fn qwen_credential(credential: &Credential) -> ProviderResult<&OAuthTokenCredential> {
    match credential {
        Credential::Qwen(token) => Ok(token),
        _ => Err(ProviderError::InvalidConfig(
            "expected Credential::Qwen".to_string(),
        )),
    }
}

fn build_url(base_url: &str, path: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), path.trim_start_matches('/'))
}
