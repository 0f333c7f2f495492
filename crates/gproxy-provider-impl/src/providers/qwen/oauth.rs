//! Device-code (RFC 8628) activation for Qwen.
//!
//! Mirrors the manual-code fallback style already used by
//! `claudecode::oauth`/`antigravity::oauth`, but the primary path here is
//! polling a `device_code` endpoint rather than waiting on a redirect.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::Deserialize;

use gproxy_provider_core::credential::OAuthTokenCredential;
use gproxy_provider_core::{
    Credential, OAuthCallbackRequest, OAuthCallbackResult, OAuthCredential, OAuthStartRequest,
    ProviderError, ProviderResult, UpstreamBody, UpstreamCtx, UpstreamHttpResponse,
};

use super::{CLIENT_ID, DEFAULT_DEVICE_CODE_URL, DEFAULT_TOKEN_URL, PROVIDER_NAME};
use crate::providers::http_client::{SharedClientKind, client_for_ctx};
use crate::providers::oauth_common::{block_on, parse_query_value};

const DEVICE_CODE_TTL_SECS: u64 = 600;
const POLL_INTERVAL_SECS: u64 = 2;

#[derive(Debug, Clone)]
struct PendingDevice {
    device_code: String,
    created_at: Instant,
}

static PENDING: OnceLock<Mutex<HashMap<String, PendingDevice>>> = OnceLock::new();

fn pending_map() -> &'static Mutex<HashMap<String, PendingDevice>> {
    PENDING.get_or_init(|| Mutex::new(HashMap::new()))
}

#[derive(Debug, Deserialize)]
struct DeviceCodeResponse {
    device_code: String,
    user_code: String,
    verification_uri: String,
    #[serde(default)]
    verification_uri_complete: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TokenPollResponse {
    Ok {
        access_token: String,
        #[serde(default)]
        refresh_token: Option<String>,
        #[serde(default)]
        expires_in: Option<i64>,
        #[serde(default)]
        resource_url: Option<String>,
    },
    Pending {
        error: String,
    },
}

pub(super) fn oauth_start(
    ctx: &UpstreamCtx,
    req: &OAuthStartRequest,
) -> ProviderResult<UpstreamHttpResponse> {
    let base_url = parse_query_value(req.query.as_deref(), "device_code_url")
        .unwrap_or_else(|| DEFAULT_DEVICE_CODE_URL.to_string());
    let response = block_on(request_device_code(ctx, &base_url))?;

    pending_map().lock().unwrap().insert(
        response.device_code.clone(),
        PendingDevice {
            device_code: response.device_code.clone(),
            created_at: Instant::now(),
        },
    );

    let body = serde_json::json!({
        "provider": PROVIDER_NAME,
        "activation_type": "device_code",
        "verification_uri": response.verification_uri,
        "verification_uri_complete": response.verification_uri_complete,
        "user_code": response.user_code,
        "device_code": response.device_code,
        "expires_in": response.expires_in.unwrap_or(DEVICE_CODE_TTL_SECS),
        "interval": POLL_INTERVAL_SECS,
    });
    let bytes = serde_json::to_vec(&body).map_err(|err| ProviderError::Other(err.to_string()))?;
    Ok(UpstreamHttpResponse {
        status: 200,
        headers: vec![("content-type".to_string(), "application/json".to_string())],
        body: UpstreamBody::Bytes(Bytes::from(bytes)),
    })
}

pub(super) fn oauth_callback(
    ctx: &UpstreamCtx,
    req: &OAuthCallbackRequest,
) -> ProviderResult<OAuthCallbackResult> {
    let device_code = parse_query_value(req.query.as_deref(), "device_code")
        .ok_or_else(|| ProviderError::InvalidConfig("missing device_code".to_string()))?;
    let token_url = parse_query_value(req.query.as_deref(), "token_url")
        .unwrap_or_else(|| DEFAULT_TOKEN_URL.to_string());

    {
        let mut guard = pending_map().lock().unwrap();
        if let Some(entry) = guard.get(&device_code) {
            if entry.created_at.elapsed() > Duration::from_secs(DEVICE_CODE_TTL_SECS) {
                guard.remove(&device_code);
                return Err(ProviderError::Other("device_code expired".to_string()));
            }
        }
    }

    let poll = block_on(poll_token(ctx, &token_url, &device_code))?;
    match poll {
        TokenPollResponse::Pending { error } => {
            let body = serde_json::json!({ "status": "authorization_pending", "error": error });
            let bytes =
                serde_json::to_vec(&body).map_err(|err| ProviderError::Other(err.to_string()))?;
            Ok(OAuthCallbackResult {
                response: UpstreamHttpResponse {
                    status: 202,
                    headers: vec![(
                        "content-type".to_string(),
                        "application/json".to_string(),
                    )],
                    body: UpstreamBody::Bytes(Bytes::from(bytes)),
                },
                credential: None,
            })
        }
        TokenPollResponse::Ok {
            access_token,
            refresh_token,
            expires_in,
            resource_url,
        } => {
            pending_map().lock().unwrap().remove(&device_code);
            let expires_at = now_unix() + expires_in.unwrap_or(3600);
            let credential = Credential::Qwen(OAuthTokenCredential {
                access_token,
                refresh_token: refresh_token.unwrap_or_default(),
                expires_at,
                resource_url,
            });
            let body = serde_json::json!({ "status": "authorized" });
            let bytes =
                serde_json::to_vec(&body).map_err(|err| ProviderError::Other(err.to_string()))?;
            Ok(OAuthCallbackResult {
                response: UpstreamHttpResponse {
                    status: 200,
                    headers: vec![(
                        "content-type".to_string(),
                        "application/json".to_string(),
                    )],
                    body: UpstreamBody::Bytes(Bytes::from(bytes)),
                },
                credential: Some(OAuthCredential {
                    name: None,
                    settings_json: None,
                    credential,
                }),
            })
        }
    }
}

pub(super) async fn refresh_access_token(
    ctx: &UpstreamCtx,
    token_url: &str,
    refresh_token: &str,
) -> ProviderResult<OAuthTokenCredential> {
    let client = client_for_ctx(ctx, SharedClientKind::Global)?;
    let params = [
        ("grant_type", "refresh_token"),
        ("refresh_token", refresh_token),
        ("client_id", CLIENT_ID),
    ];
    let resp = client
        .post(token_url)
        .form(&params)
        .send()
        .await
        .map_err(|err| ProviderError::Other(err.to_string()))?;
    if !resp.status().is_success() {
        return Err(ProviderError::Other(format!(
            "qwen refresh failed: {}",
            resp.status()
        )));
    }
    #[derive(Deserialize)]
    struct RefreshResponse {
        access_token: String,
        #[serde(default)]
        refresh_token: Option<String>,
        #[serde(default)]
        expires_in: Option<i64>,
        #[serde(default)]
        resource_url: Option<String>,
    }
    let parsed: RefreshResponse = resp
        .json()
        .await
        .map_err(|err| ProviderError::Other(err.to_string()))?;
    Ok(OAuthTokenCredential {
        access_token: parsed.access_token,
        refresh_token: parsed.refresh_token.unwrap_or_else(|| refresh_token.to_string()),
        expires_at: now_unix() + parsed.expires_in.unwrap_or(3600),
        resource_url: parsed.resource_url,
    })
}

async fn request_device_code(
    ctx: &UpstreamCtx,
    base_url: &str,
) -> ProviderResult<DeviceCodeResponse> {
    let client = client_for_ctx(ctx, SharedClientKind::Global)?;
    let resp = client
        .post(base_url)
        .form(&[("client_id", CLIENT_ID), ("scope", "openid model.completion")])
        .send()
        .await
        .map_err(|err| ProviderError::Other(err.to_string()))?;
    if !resp.status().is_success() {
        return Err(ProviderError::Other(format!(
            "qwen device_code request failed: {}",
            resp.status()
        )));
    }
    resp.json()
        .await
        .map_err(|err| ProviderError::Other(err.to_string()))
}

async fn poll_token(
    ctx: &UpstreamCtx,
    token_url: &str,
    device_code: &str,
) -> ProviderResult<TokenPollResponse> {
    let client = client_for_ctx(ctx, SharedClientKind::Global)?;
    let resp = client
        .post(token_url)
        .form(&[
            ("grant_type", "urn:ietf:params:oauth:grant-type:device_code"),
            ("device_code", device_code),
            ("client_id", CLIENT_ID),
        ])
        .send()
        .await
        .map_err(|err| ProviderError::Other(err.to_string()))?;
    resp.json()
        .await
        .map_err(|err| ProviderError::Other(err.to_string()))
}

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
