//! PKCE authorization-code activation for iFlow, with a manual-code fallback
//! identical in shape to `claudecode::oauth`'s `resolve_manual_code_and_state`.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, Instant};

use base64::Engine;
use bytes::Bytes;
use rand::RngCore;
use serde::Deserialize;
use sha2::{Digest, Sha256};

use gproxy_provider_core::credential::IflowCredential;
use gproxy_provider_core::{
    Credential, OAuthCallbackRequest, OAuthCallbackResult, OAuthCredential, OAuthStartRequest,
    ProviderError, ProviderResult, UpstreamBody, UpstreamCtx, UpstreamHttpResponse,
};

use super::{CLIENT_ID, DEFAULT_AUTH_URL, DEFAULT_TOKEN_URL, PROVIDER_NAME, REDIRECT_URI};
use crate::providers::http_client::{SharedClientKind, client_for_ctx};
use crate::providers::oauth_common::{block_on, resolve_manual_code_and_state};

const OAUTH_STATE_TTL_SECS: u64 = 600;

struct OAuthState {
    code_verifier: String,
    created_at: Instant,
}

static OAUTH_STATES: OnceLock<Mutex<HashMap<String, OAuthState>>> = OnceLock::new();

fn states() -> &'static Mutex<HashMap<String, OAuthState>> {
    OAUTH_STATES.get_or_init(|| Mutex::new(HashMap::new()))
}

fn prune_states(map: &mut HashMap<String, OAuthState>) {
    map.retain(|_, v| v.created_at.elapsed() < Duration::from_secs(OAUTH_STATE_TTL_SECS));
}

fn generate_pkce() -> (String, String) {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    let verifier = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes);
    let digest = Sha256::digest(verifier.as_bytes());
    let challenge = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(digest);
    (verifier, challenge)
}

fn random_state() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

pub(super) fn oauth_start(
    _ctx: &UpstreamCtx,
    _req: &OAuthStartRequest,
) -> ProviderResult<UpstreamHttpResponse> {
    let (verifier, challenge) = generate_pkce();
    let state = random_state();
    {
        let mut guard = states().lock().unwrap();
        prune_states(&mut guard);
        guard.insert(
            state.clone(),
            OAuthState {
                code_verifier: verifier,
                created_at: Instant::now(),
            },
        );
    }

    let url = format!(
        "{base}?response_type=code&client_id={client}&redirect_uri={redirect}&code_challenge={challenge}&code_challenge_method=S256&state={state}&scope=openid+profile+model.completion",
        base = DEFAULT_AUTH_URL,
        client = urlencoding::encode(CLIENT_ID),
        redirect = urlencoding::encode(REDIRECT_URI),
        challenge = challenge,
        state = state,
    );

    let body = serde_json::json!({
        "provider": PROVIDER_NAME,
        "activation_type": "auth_code",
        "authorize_url": url,
        "state": state,
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
    let (code, state) = resolve_manual_code_and_state(req.query.as_deref())
        .map_err(|err| ProviderError::InvalidConfig(err.to_string()))?;
    let Some(state) = state else {
        return Err(ProviderError::InvalidConfig("missing state".to_string()));
    };

    let verifier = {
        let mut guard = states().lock().unwrap();
        prune_states(&mut guard);
        guard
            .remove(&state)
            .ok_or_else(|| ProviderError::InvalidConfig("unknown or expired state".to_string()))?
            .code_verifier
    };

    let token = block_on(exchange_code(ctx, &code, &verifier))?;
    let expires_at = now_unix() + token.expires_in.unwrap_or(3600);
    let credential = Credential::Iflow(IflowCredential {
        access_token: token.access_token,
        refresh_token: token.refresh_token.unwrap_or_default(),
        expires_at,
        api_key: token.api_key,
    });

    let body = serde_json::json!({ "status": "authorized" });
    let bytes = serde_json::to_vec(&body).map_err(|err| ProviderError::Other(err.to_string()))?;
    Ok(OAuthCallbackResult {
        response: UpstreamHttpResponse {
            status: 200,
            headers: vec![("content-type".to_string(), "application/json".to_string())],
            body: UpstreamBody::Bytes(Bytes::from(bytes)),
        },
        credential: Some(OAuthCredential {
            name: None,
            settings_json: None,
            credential,
        }),
    })
}

pub(super) async fn refresh_access_token(
    ctx: &UpstreamCtx,
    refresh_token: &str,
) -> ProviderResult<IflowCredential> {
    let client = client_for_ctx(ctx, SharedClientKind::Global)?;
    let resp = client
        .post(DEFAULT_TOKEN_URL)
        .form(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", CLIENT_ID),
        ])
        .send()
        .await
        .map_err(|err| ProviderError::Other(err.to_string()))?;
    if !resp.status().is_success() {
        return Err(ProviderError::Other(format!(
            "iflow refresh failed: {}",
            resp.status()
        )));
    }
    let token: TokenResponse = resp
        .json()
        .await
        .map_err(|err| ProviderError::Other(err.to_string()))?;
    Ok(IflowCredential {
        access_token: token.access_token,
        refresh_token: token.refresh_token.unwrap_or_else(|| refresh_token.to_string()),
        expires_at: now_unix() + token.expires_in.unwrap_or(3600),
        api_key: token.api_key,
    })
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    api_key: Option<String>,
}

async fn exchange_code(
    ctx: &UpstreamCtx,
    code: &str,
    verifier: &str,
) -> ProviderResult<TokenResponse> {
    let client = client_for_ctx(ctx, SharedClientKind::Global)?;
    let resp = client
        .post(DEFAULT_TOKEN_URL)
        .form(&[
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", REDIRECT_URI),
            ("client_id", CLIENT_ID),
            ("code_verifier", verifier),
        ])
        .send()
        .await
        .map_err(|err| ProviderError::Other(err.to_string()))?;
    if !resp.status().is_success() {
        return Err(ProviderError::Other(format!(
            "iflow token exchange failed: {}",
            resp.status()
        )));
    }
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
