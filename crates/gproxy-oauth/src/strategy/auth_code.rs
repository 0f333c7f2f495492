//! Authorization-code flow (iflow primary, gemini family, antigravity).

use std::time::Duration;

use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use crate::pkce;
use crate::store::StoredTokenRecord;

use super::{OAuthEndpointConfig, OAuthFlowError, OAuthFlowResult, map_reqwest_err, now_unix};

pub struct AuthorizationRequest {
    pub url: String,
    pub state: String,
    pub code_verifier: String,
}

/// Builds the authorization URL and the PKCE pair the caller must hold on to
/// until the callback arrives.
pub fn build_authorization_request(
    config: &OAuthEndpointConfig,
    request_offline_access: bool,
) -> OAuthFlowResult<AuthorizationRequest> {
    let auth_url = config
        .auth_url
        .as_deref()
        .ok_or_else(|| OAuthFlowError::InvalidConfig("missing auth_url".to_string()))?;
    let redirect_uri = config
        .redirect_uri
        .as_deref()
        .ok_or_else(|| OAuthFlowError::InvalidConfig("missing redirect_uri".to_string()))?;
    if config.client_id.is_empty() {
        return Err(OAuthFlowError::InvalidConfig("missing client_id".to_string()));
    }

    let pkce = pkce::generate();
    let state = pkce::random_token(16);
    let mut url = format!(
        "{auth_url}?response_type=code&client_id={client_id}&redirect_uri={redirect_uri}&state={state}&code_challenge={challenge}&code_challenge_method=S256",
        client_id = urlencoding::encode(&config.client_id),
        redirect_uri = urlencoding::encode(redirect_uri),
        state = state,
        challenge = pkce.challenge,
    );
    if let Some(scope) = &config.scope {
        url.push_str(&format!("&scope={}", urlencoding::encode(scope)));
    }
    if request_offline_access {
        url.push_str("&access_type=offline&prompt=consent");
    }

    Ok(AuthorizationRequest {
        url,
        state,
        code_verifier: pkce.verifier,
    })
}

/// Starts a one-shot local HTTP/1.0 responder on `redirect_uri`'s port and
/// waits (up to `idle_timeout`) for `GET /oauth/callback?code=...&state=...`.
pub async fn await_callback(
    listen_addr: &str,
    expected_state: &str,
    idle_timeout: Duration,
) -> OAuthFlowResult<String> {
    let listener = TcpListener::bind(listen_addr)
        .await
        .map_err(|err| OAuthFlowError::InvalidConfig(format!("cannot bind {listen_addr}: {err}")))?;

    let accepted = tokio::time::timeout(idle_timeout, listener.accept())
        .await
        .map_err(|_| OAuthFlowError::AuthFlowTimedOut)?
        .map_err(|err| OAuthFlowError::NetworkError(err.to_string()))?;
    let (mut stream, _) = accepted;

    let mut buf = vec![0u8; 4096];
    let read = tokio::time::timeout(Duration::from_secs(10), stream.read(&mut buf))
        .await
        .map_err(|_| OAuthFlowError::AuthFlowTimedOut)?
        .map_err(|err| OAuthFlowError::NetworkError(err.to_string()))?;
    let request_line = String::from_utf8_lossy(&buf[..read]);
    let first_line = request_line.lines().next().unwrap_or_default();
    let query = first_line
        .split_whitespace()
        .nth(1)
        .and_then(|target| target.split_once('?'))
        .map(|(_, q)| q.to_string())
        .unwrap_or_default();

    let code = parse_query_value(&query, "code");
    let state = parse_query_value(&query, "state");

    let body = "You can close this window and return to the terminal.";
    let response = format!(
        "HTTP/1.0 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n\r\n{}",
        body.len(),
        body
    );
    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.shutdown().await;

    let Some(code) = code else {
        return Err(OAuthFlowError::AuthFlowRejected(
            "callback did not include a code".to_string(),
        ));
    };
    if state.as_deref() != Some(expected_state) {
        return Err(OAuthFlowError::AuthFlowRejected(
            "callback state did not match".to_string(),
        ));
    }
    Ok(code)
}

fn parse_query_value(query: &str, key: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        if k != key {
            return None;
        }
        urlencoding::decode(v).ok().map(|s| s.into_owned())
    })
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

/// Exchanges the authorization code for a token at `token_url`.
pub async fn exchange_code(
    client: &wreq::Client,
    config: &OAuthEndpointConfig,
    code: &str,
    code_verifier: &str,
) -> OAuthFlowResult<StoredTokenRecord> {
    let token_url = config
        .token_url
        .as_deref()
        .ok_or_else(|| OAuthFlowError::InvalidConfig("missing token_url".to_string()))?;
    let redirect_uri = config.redirect_uri.as_deref().unwrap_or_default();
    let mut params = vec![
        ("grant_type", "authorization_code"),
        ("code", code),
        ("redirect_uri", redirect_uri),
        ("client_id", config.client_id.as_str()),
        ("code_verifier", code_verifier),
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
            "code exchange failed: {}",
            resp.status()
        )));
    }
    let token: TokenResponse = resp.json().await.map_err(map_reqwest_err)?;
    Ok(StoredTokenRecord {
        access_token: Some(token.access_token),
        refresh_token: token.refresh_token,
        expires_at: Some(now_unix() + token.expires_in.unwrap_or(3600)),
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authorization_url_includes_pkce_and_state() {
        let config = OAuthEndpointConfig {
            client_id: "iflow-cli".to_string(),
            auth_url: Some("https://iflow.cn/oauth/authorize".to_string()),
            redirect_uri: Some("http://localhost:11451/oauth/callback".to_string()),
            scope: Some("openid profile".to_string()),
            ..Default::default()
        };
        let request = build_authorization_request(&config, true).unwrap();
        assert!(request.url.contains("code_challenge="));
        assert!(request.url.contains("code_challenge_method=S256"));
        assert!(request.url.contains(&format!("state={}", request.state)));
        assert!(request.url.contains("access_type=offline"));
        assert!(!request.code_verifier.is_empty());
    }

    #[test]
    fn parse_query_value_decodes_percent_encoding() {
        assert_eq!(
            parse_query_value("code=a%2Bb&state=s1", "code"),
            Some("a+b".to_string())
        );
    }
}
