use bytes::Bytes;

use gproxy_provider_core::credential::{ApiKeyCredential, IflowCredential};
use gproxy_provider_core::provider::UpstreamFailure;
use gproxy_provider_core::{
    AuthRetryAction, Credential, DispatchRule, DispatchTable, HttpMethod, OAuthCallbackRequest,
    OAuthCallbackResult, OAuthStartRequest, Op, Proto, ProviderConfig, ProviderError,
    ProviderResult, Request, UpstreamCtx, UpstreamHttpRequest, UpstreamHttpResponse,
    UpstreamProvider,
};

use gproxy_transform::compat::{CompatContext, CompatModule, iflow::IflowCompat};

use crate::auth_extractor;

mod oauth;

const PROVIDER_NAME: &str = "iflow";
const DEFAULT_BASE_URL: &str = "https://apis.iflow.cn/v1";
const DEFAULT_AUTH_URL: &str = "https://iflow.cn/oauth/authorize";
const DEFAULT_TOKEN_URL: &str = "https://iflow.cn/oauth/token";
const CLIENT_ID: &str = "iflow-cli";
const REDIRECT_URI: &str = "http://localhost:11451/oauth/callback";

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
pub struct IflowProvider;

impl IflowProvider {
    pub fn new() -> Self {
        Self
    }
}

/// iFlow accepts either the bearer issued by its own OAuth exchange or a
/// plain API key minted from the same account; either unlocks the same
/// OpenAI-Chat-compatible endpoint.
fn bearer_for(credential: &Credential) -> ProviderResult<&str> {
    match credential {
        Credential::Iflow(IflowCredential {
            access_token,
            api_key: Some(api_key),
            ..
        }) if access_token.is_empty() => Ok(api_key.as_str()),
        Credential::Iflow(IflowCredential { access_token, .. }) if !access_token.is_empty() => {
            Ok(access_token.as_str())
        }
        Credential::Custom(ApiKeyCredential { api_key }) => Ok(api_key.as_str()),
        _ => Err(ProviderError::InvalidConfig(
            "expected Credential::Iflow".to_string(),
        )),
    }
}

#[async_trait::async_trait]
impl UpstreamProvider for IflowProvider {
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
        let base_url = iflow_base_url(config)?;
        let bearer = bearer_for(credential)?;
        let url = build_url(base_url, "/chat/completions");
        let is_stream = req.body.stream.unwrap_or(false);
        let mut value = serde_json::to_value(&req.body)
            .map_err(|err| ProviderError::Other(err.to_string()))?;
        let ctx = CompatContext {
            provider: PROVIDER_NAME.to_string(),
            requested_model: req.body.model.clone(),
        };
        IflowCompat
            .process_incoming(&mut value, &ctx)
            .map_err(|err| ProviderError::Other(err.to_string()))?;
        let body = serde_json::to_vec(&value).map_err(|err| ProviderError::Other(err.to_string()))?;
        let mut headers = Vec::new();
        auth_extractor::set_bearer(&mut headers, bearer);
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
        let base_url = iflow_base_url(config)?;
        let bearer = bearer_for(credential)?;
        let url = build_url(base_url, "/models");
        let mut headers = Vec::new();
        auth_extractor::set_bearer(&mut headers, bearer);
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
        let base_url = iflow_base_url(config)?;
        let bearer = bearer_for(credential)?;
        let url = build_url(base_url, &format!("/models/{}", req.path.model));
        let mut headers = Vec::new();
        auth_extractor::set_bearer(&mut headers, bearer);
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
            let Credential::Iflow(token) = credential else {
                return AuthRetryAction::None;
            };
            if token.refresh_token.is_empty() {
                return AuthRetryAction::None;
            }
            match oauth::refresh_access_token(ctx, &token.refresh_token).await {
                Ok(refreshed) => {
                    AuthRetryAction::UpdateCredential(Box::new(Credential::Iflow(refreshed)))
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
        IflowCompat
            .process_outgoing(&mut value, &CompatContext::default())
            .map_err(|err| ProviderError::Other(err.to_string()))?;
        serde_json::to_vec(&value)
            .map(Bytes::from)
            .map_err(|err| ProviderError::Other(err.to_string()))
    }
}

fn iflow_base_url(config: &ProviderConfig) -> ProviderResult<&str> {
    match config {
        ProviderConfig::Iflow(cfg) => Ok(cfg.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL)),
        _ => Err(ProviderError::InvalidConfig(
            "expected ProviderConfig::Iflow".to_string(),
        )),
    }
}

fn build_url(base_url: &str, path: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), path.trim_start_matches('/'))
}
