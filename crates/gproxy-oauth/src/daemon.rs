//! Background scanner that calls the lifecycle for tokens nearing expiry and
//! suspends silent refresh after repeated user-timeout failures.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::lifecycle::{self, EnsureOptions, OAuthFlowRunner};
use crate::store::{self, TokenDescriptor};
use crate::strategy::OAuthFlowError;

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub scan_interval: Duration,
    pub refresh_ahead: Duration,
    pub per_token_throttle: Duration,
    pub max_consecutive_user_timeouts: u32,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(60),
            refresh_ahead: Duration::from_secs(300),
            per_token_throttle: Duration::from_secs(300),
            max_consecutive_user_timeouts: 3,
        }
    }
}

pub struct WatchedToken {
    pub descriptor: TokenDescriptor,
    pub runner: Arc<dyn OAuthFlowRunner>,
    pub client: wreq::Client,
}

#[derive(Default)]
struct History {
    consecutive_user_timeouts: u32,
    last_attempt: i64,
    suspended: bool,
    suspended_since_mtime: Option<i64>,
}

/// Periodically scans every watched token file and silently refreshes the
/// ones that are near expiry. One daemon per process; tokens from every
/// provider share the same scan loop rather than one task per credential.
pub struct TokenDaemon {
    config: DaemonConfig,
    tokens: Vec<WatchedToken>,
    history: Mutex<HashMap<String, History>>,
}

impl TokenDaemon {
    pub fn new(config: DaemonConfig, tokens: Vec<WatchedToken>) -> Self {
        Self {
            config,
            tokens,
            history: Mutex::new(HashMap::new()),
        }
    }

    /// Runs forever on `tokio::time::interval`. Intended to be spawned once
    /// from the binary crate's bootstrap.
    pub async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.scan_interval);
        loop {
            ticker.tick().await;
            self.scan_once().await;
        }
    }

    pub async fn scan_once(&self) {
        for watched in &self.tokens {
            self.scan_token(watched).await;
        }
    }

    async fn scan_token(&self, watched: &WatchedToken) {
        let key = history_key(&watched.descriptor);

        let Ok(Some(record)) = store::read(&watched.descriptor.path) else {
            return;
        };
        if record.is_static_alias() || record.norefresh.unwrap_or(false) {
            return;
        }

        {
            let mut guard = self.history.lock().expect("daemon history lock poisoned");
            let entry = guard.entry(key.clone()).or_default();
            if entry.suspended {
                let current_mtime = store::mtime(&watched.descriptor.path);
                if current_mtime == entry.suspended_since_mtime {
                    return;
                }
                entry.suspended = false;
                entry.consecutive_user_timeouts = 0;
            }
            if now_unix() - entry.last_attempt < self.config.per_token_throttle.as_secs() as i64 {
                return;
            }
        }

        let has_refresh = record
            .refresh_token
            .as_deref()
            .map(|token| !token.is_empty())
            .unwrap_or(false);
        let near_expiry = match record.expires_at {
            Some(expires_at) => {
                expires_at - now_unix() <= self.config.refresh_ahead.as_secs() as i64
            }
            None => true,
        };
        if !(has_refresh && near_expiry) {
            return;
        }

        {
            let mut guard = self.history.lock().expect("daemon history lock poisoned");
            guard.entry(key.clone()).or_default().last_attempt = now_unix();
        }

        let opts = EnsureOptions {
            force_reauthorize: false,
            force_reacquire_if_refresh_fails: false,
        };
        let result = lifecycle::ensure_valid_token(
            &watched.descriptor,
            &watched.client,
            watched.runner.as_ref(),
            opts,
        )
        .await;

        let mut guard = self.history.lock().expect("daemon history lock poisoned");
        let entry = guard.entry(key).or_default();
        match result {
            Ok(_) => entry.consecutive_user_timeouts = 0,
            Err(OAuthFlowError::AuthFlowTimedOut) => {
                entry.consecutive_user_timeouts += 1;
                if entry.consecutive_user_timeouts >= self.config.max_consecutive_user_timeouts {
                    entry.suspended = true;
                    entry.suspended_since_mtime = store::mtime(&watched.descriptor.path);
                }
            }
            Err(_) => {}
        }
    }
}

fn history_key(descriptor: &TokenDescriptor) -> String {
    format!("{}::{}", descriptor.provider, descriptor.path.display())
}

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::FlowKind;
    use crate::store::StoredTokenRecord;

    struct TimeoutRunner;

    #[async_trait::async_trait]
    impl OAuthFlowRunner for TimeoutRunner {
        fn flow_order(&self) -> &[FlowKind] {
            &[FlowKind::AuthCode]
        }

        async fn run_interactive(
            &self,
            _kind: FlowKind,
            _client: &wreq::Client,
        ) -> crate::strategy::OAuthFlowResult<StoredTokenRecord> {
            Err(OAuthFlowError::AuthFlowTimedOut)
        }

        async fn refresh(
            &self,
            _client: &wreq::Client,
            _refresh_token: &str,
        ) -> crate::strategy::OAuthFlowResult<StoredTokenRecord> {
            Err(OAuthFlowError::AuthFlowTimedOut)
        }
    }

    #[tokio::test]
    async fn repeated_user_timeouts_suspend_the_token() {
        let dir = std::env::temp_dir().join(format!(
            "gproxy-oauth-daemon-{}",
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("token.json");
        let record = StoredTokenRecord {
            access_token: Some("stale".to_string()),
            refresh_token: Some("ref".to_string()),
            expires_at: Some(now_unix() - 10),
            ..Default::default()
        };
        store::write(&path, &record).unwrap();

        let descriptor = TokenDescriptor::new("test-provider", path);
        let watched = WatchedToken {
            descriptor,
            runner: Arc::new(TimeoutRunner),
            client: wreq::Client::new(),
        };
        let daemon = TokenDaemon::new(
            DaemonConfig {
                per_token_throttle: Duration::from_secs(0),
                max_consecutive_user_timeouts: 2,
                ..Default::default()
            },
            vec![watched],
        );

        daemon.scan_once().await;
        daemon.scan_once().await;

        let guard = daemon.history.lock().unwrap();
        let entry = guard.values().next().unwrap();
        assert!(entry.suspended);

        let _ = std::fs::remove_dir_all(&dir);
    }
}
