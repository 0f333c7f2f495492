//! Per-flow-type acquisition and refresh against provider OAuth endpoints.

pub mod auth_code;
pub mod device_code;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::store::StoredTokenRecord;

pub const DEFAULT_OAUTH_CLIENTS_FILE: &str = ".routecodex/auth/oauth-clients.local.json";

#[derive(Debug, thiserror::Error)]
pub enum OAuthFlowError {
    #[error("authorization was rejected: {0}")]
    AuthFlowRejected(String),
    #[error("authorization timed out waiting on the user")]
    AuthFlowTimedOut,
    #[error("network error talking to the provider: {0}")]
    NetworkError(String),
    #[error("invalid oauth configuration: {0}")]
    InvalidConfig(String),
}

pub type OAuthFlowResult<T> = Result<T, OAuthFlowError>;

/// Static, per-provider client configuration resolved once at
/// strategy-construction time. Precedence: caller override → environment
/// variable → local clients file → built-in default.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OAuthEndpointConfig {
    pub client_id: String,
    #[serde(default)]
    pub client_secret: Option<String>,
    pub device_code_url: Option<String>,
    pub auth_url: Option<String>,
    pub token_url: Option<String>,
    #[serde(default)]
    pub redirect_uri: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
    /// Provider-specific headers merged into every request (iFlow's
    /// `Origin`/`Referer`, Qwen's `X-Goog-Api-Client`, ...).
    #[serde(default)]
    pub extra_headers: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct LocalClientsFile {
    #[serde(flatten)]
    providers: HashMap<String, OAuthEndpointConfig>,
}

/// Resolves final endpoint config for `provider`, applying the documented
/// override precedence over `builtin_default`.
pub fn resolve_endpoint_config(
    provider: &str,
    env_prefix: &str,
    builtin_default: OAuthEndpointConfig,
    override_config: Option<OAuthEndpointConfig>,
) -> OAuthEndpointConfig {
    let mut resolved = builtin_default;
    if let Some(from_file) = read_local_clients_file(provider) {
        merge_config(&mut resolved, from_file);
    }
    if let Some(from_env) = read_env_overrides(env_prefix) {
        merge_config(&mut resolved, from_env);
    }
    if let Some(explicit) = override_config {
        merge_config(&mut resolved, explicit);
    }
    resolved
}

fn merge_config(base: &mut OAuthEndpointConfig, overlay: OAuthEndpointConfig) {
    if !overlay.client_id.is_empty() {
        base.client_id = overlay.client_id;
    }
    if overlay.client_secret.is_some() {
        base.client_secret = overlay.client_secret;
    }
    if overlay.device_code_url.is_some() {
        base.device_code_url = overlay.device_code_url;
    }
    if overlay.auth_url.is_some() {
        base.auth_url = overlay.auth_url;
    }
    if overlay.token_url.is_some() {
        base.token_url = overlay.token_url;
    }
    if overlay.redirect_uri.is_some() {
        base.redirect_uri = overlay.redirect_uri;
    }
    if overlay.scope.is_some() {
        base.scope = overlay.scope;
    }
    base.extra_headers.extend(overlay.extra_headers);
}

fn read_local_clients_file(provider: &str) -> Option<OAuthEndpointConfig> {
    let home = std::env::var_os("HOME")?;
    let path = std::path::Path::new(&home).join(DEFAULT_OAUTH_CLIENTS_FILE);
    let raw = std::fs::read(path).ok()?;
    let parsed: LocalClientsFile = serde_json::from_slice(&raw).ok()?;
    parsed.providers.get(provider).cloned()
}

fn read_env_overrides(env_prefix: &str) -> Option<OAuthEndpointConfig> {
    let client_id = std::env::var(format!("{env_prefix}_CLIENT_ID")).ok()?;
    Some(OAuthEndpointConfig {
        client_id,
        client_secret: std::env::var(format!("{env_prefix}_CLIENT_SECRET")).ok(),
        device_code_url: std::env::var(format!("{env_prefix}_DEVICE_CODE_URL")).ok(),
        auth_url: std::env::var(format!("{env_prefix}_AUTH_URL")).ok(),
        token_url: std::env::var(format!("{env_prefix}_TOKEN_URL")).ok(),
        redirect_uri: std::env::var(format!("{env_prefix}_REDIRECT_URI")).ok(),
        scope: std::env::var(format!("{env_prefix}_SCOPE")).ok(),
        extra_headers: HashMap::new(),
    })
}

/// Provider-specific enrichment run after a token is acquired or refreshed,
/// before it is persisted via the token store.
#[async_trait::async_trait]
pub trait PostAcquireEnrichment: Send + Sync {
    async fn enrich(
        &self,
        client: &wreq::Client,
        record: &mut StoredTokenRecord,
    ) -> OAuthFlowResult<()>;
}

/// No-op enrichment for providers without a post-acquire step.
pub struct NoEnrichment;

#[async_trait::async_trait]
impl PostAcquireEnrichment for NoEnrichment {
    async fn enrich(
        &self,
        _client: &wreq::Client,
        _record: &mut StoredTokenRecord,
    ) -> OAuthFlowResult<()> {
        Ok(())
    }
}

/// Refreshes an access token. Shared by both flows whenever the stored
/// record carries a `refresh_token`; preserves the existing refresh token if
/// the provider omits one from the response.
pub async fn refresh(
    client: &wreq::Client,
    config: &OAuthEndpointConfig,
    refresh_token: &str,
) -> OAuthFlowResult<StoredTokenRecord> {
    let token_url = config
        .token_url
        .as_deref()
        .ok_or_else(|| OAuthFlowError::InvalidConfig("missing token_url".to_string()))?;
    let mut params = vec![
        ("grant_type", "refresh_token"),
        ("refresh_token", refresh_token),
        ("client_id", config.client_id.as_str()),
    ];
    if let Some(secret) = &config.client_secret {
        params.push(("client_secret", secret));
    }
    let mut req = client.post(token_url).form(&params);
    for (key, value) in &config.extra_headers {
        req = req.header(key, value);
    }
    let resp = req.send().await.map_err(map_reqwest_err)?;
    if !resp.status().is_success() {
        return Err(OAuthFlowError::AuthFlowRejected(format!(
            "refresh failed: {}",
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
    }
    let parsed: RefreshResponse = resp.json().await.map_err(map_reqwest_err)?;
    Ok(StoredTokenRecord {
        access_token: Some(parsed.access_token),
        refresh_token: Some(
            parsed
                .refresh_token
                .unwrap_or_else(|| refresh_token.to_string()),
        ),
        expires_at: Some(now_unix() + parsed.expires_in.unwrap_or(3600)),
        ..Default::default()
    })
}

pub(crate) fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

pub(crate) fn map_reqwest_err(err: wreq::Error) -> OAuthFlowError {
    OAuthFlowError::NetworkError(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_default_survives_when_no_overrides_present() {
        let builtin = OAuthEndpointConfig {
            client_id: "builtin-id".to_string(),
            token_url: Some("https://example.com/token".to_string()),
            ..Default::default()
        };
        let resolved = resolve_endpoint_config("nonexistent-provider", "GPROXY_OAUTH_TEST_XYZ", builtin.clone(), None);
        assert_eq!(resolved.client_id, builtin.client_id);
        assert_eq!(resolved.token_url, builtin.token_url);
    }

    #[test]
    fn explicit_override_wins_over_builtin_default() {
        let builtin = OAuthEndpointConfig {
            client_id: "builtin-id".to_string(),
            ..Default::default()
        };
        let override_config = OAuthEndpointConfig {
            client_id: "override-id".to_string(),
            ..Default::default()
        };
        let resolved = resolve_endpoint_config(
            "nonexistent-provider",
            "GPROXY_OAUTH_TEST_XYZ",
            builtin,
            Some(override_config),
        );
        assert_eq!(resolved.client_id, "override-id");
    }
}
