//! RFC 8628 device-code flow (qwen default; iflow fallback; google device
//! endpoint).

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::pkce;
use crate::store::StoredTokenRecord;

use super::{OAuthEndpointConfig, OAuthFlowError, OAuthFlowResult, map_reqwest_err, now_unix};

#[derive(Debug, Deserialize)]
pub struct DeviceCodeResponse {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    #[serde(default)]
    pub verification_uri_complete: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub interval: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PollResponse {
    Ok {
        access_token: String,
        #[serde(default)]
        refresh_token: Option<String>,
        #[serde(default)]
        expires_in: Option<i64>,
    },
    Pending {
        error: String,
    },
}

/// Starts the flow: requests a device/user code pair. Callers surface
/// `verification_uri_complete`/`user_code` to the user (token portal or
/// upstream verification URL), optionally opening a browser when
/// `activationType=auto_browser`.
pub async fn request_device_code(
    client: &wreq::Client,
    config: &OAuthEndpointConfig,
) -> OAuthFlowResult<DeviceCodeResponse> {
    let url = config
        .device_code_url
        .as_deref()
        .ok_or_else(|| OAuthFlowError::InvalidConfig("missing device_code_url".to_string()))?;
    if config.client_id.is_empty() {
        return Err(OAuthFlowError::InvalidConfig("missing client_id".to_string()));
    }
    let pkce = pkce::generate();
    let mut req = client.post(url).form(&[
        ("client_id", config.client_id.as_str()),
        ("scope", config.scope.as_deref().unwrap_or("")),
        ("code_challenge", pkce.challenge.as_str()),
        ("code_challenge_method", "S256"),
    ]);
    for (key, value) in &config.extra_headers {
        req = req.header(key, value);
    }
    let resp = req.send().await.map_err(map_reqwest_err)?;
    if !resp.status().is_success() {
        return Err(OAuthFlowError::AuthFlowRejected(format!(
            "device_code request failed: {}",
            resp.status()
        )));
    }
    resp.json().await.map_err(map_reqwest_err)
}

/// Polls until the user completes the flow or it times out. Returns the
/// persisted-ready token record on success.
pub async fn poll_until_complete(
    client: &wreq::Client,
    config: &OAuthEndpointConfig,
    device: &DeviceCodeResponse,
) -> OAuthFlowResult<StoredTokenRecord> {
    let url = config
        .token_url
        .as_deref()
        .ok_or_else(|| OAuthFlowError::InvalidConfig("missing token_url".to_string()))?;
    let deadline_secs = device.expires_in.unwrap_or(600);
    let mut interval_secs = device.interval.unwrap_or(5);
    let started = now_unix();

    loop {
        if now_unix() - started > deadline_secs as i64 {
            return Err(OAuthFlowError::AuthFlowTimedOut);
        }
        tokio::time::sleep(Duration::from_secs(interval_secs)).await;

        let mut req = client.post(url).form(&[
            (
                "grant_type",
                "urn:ietf:params:oauth:grant-type:device_code",
            ),
            ("device_code", device.device_code.as_str()),
            ("client_id", config.client_id.as_str()),
        ]);
        for (key, value) in &config.extra_headers {
            req = req.header(key, value);
        }
        let resp = req.send().await.map_err(map_reqwest_err)?;
        let status = resp.status();
        let poll: PollResponse = resp.json().await.map_err(map_reqwest_err)?;

        match poll {
            PollResponse::Pending { error } => match error.as_str() {
                "authorization_pending" => continue,
                "slow_down" => {
                    interval_secs += 5;
                    continue;
                }
                other => return Err(OAuthFlowError::AuthFlowRejected(other.to_string())),
            },
            PollResponse::Ok {
                access_token,
                refresh_token,
                expires_in,
            } => {
                if !status.is_success() {
                    return Err(OAuthFlowError::AuthFlowRejected(format!(
                        "token poll returned {status} with a success-shaped body"
                    )));
                }
                return Ok(StoredTokenRecord {
                    access_token: Some(access_token),
                    refresh_token,
                    expires_at: Some(now_unix() + expires_in.unwrap_or(3600)),
                    ..Default::default()
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_device_code_url_is_invalid_config() {
        let client = wreq::Client::new();
        let config = OAuthEndpointConfig {
            client_id: "id".to_string(),
            ..Default::default()
        };
        let result = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
            .block_on(request_device_code(&client, &config));
        assert!(matches!(result, Err(OAuthFlowError::InvalidConfig(_))));
    }
}
