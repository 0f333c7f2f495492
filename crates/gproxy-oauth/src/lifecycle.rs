//! Single-flight + throttled orchestration on top of the token store and
//! OAuth strategy: decide refresh vs. reauth vs. no-op, and react to
//! upstream-reported invalid tokens.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use crate::store::{self, StoredTokenRecord, TokenDescriptor};
use crate::strategy::{OAuthFlowError, OAuthFlowResult};

const THROTTLE_SECS: i64 = 60;

/// `isExpiredOrNear` skew (C3): fixed, not caller-configurable. Distinct
/// from C4's daemon-only proactive refresh-ahead window (default 5 min,
/// `DaemonConfig::refresh_ahead`), which only decides whether the daemon
/// bothers calling into this module at all.
const ISEXPIRED_OR_NEAR_SKEW_SECS: i64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowKind {
    DeviceCode,
    AuthCode,
}

/// Provider-specific glue the lifecycle drives through. One implementation
/// per provider, wrapping its `strategy::device_code`/`strategy::auth_code`
/// calls and post-acquire enrichment.
#[async_trait::async_trait]
pub trait OAuthFlowRunner: Send + Sync {
    /// Flows tried in order; short-circuits on first success (iFlow:
    /// auth-code primary, device-code fallback).
    fn flow_order(&self) -> &[FlowKind];

    async fn run_interactive(
        &self,
        kind: FlowKind,
        client: &wreq::Client,
    ) -> OAuthFlowResult<StoredTokenRecord>;

    async fn refresh(
        &self,
        client: &wreq::Client,
        refresh_token: &str,
    ) -> OAuthFlowResult<StoredTokenRecord>;

    async fn enrich(
        &self,
        _client: &wreq::Client,
        _record: &mut StoredTokenRecord,
    ) -> OAuthFlowResult<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EnsureOptions {
    pub force_reauthorize: bool,
    pub force_reacquire_if_refresh_fails: bool,
}

static SINGLE_FLIGHT: OnceLock<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>> =
    OnceLock::new();
static THROTTLE: OnceLock<Mutex<HashMap<String, i64>>> = OnceLock::new();
static INTERACTIVE_QUEUE: OnceLock<tokio::sync::Mutex<()>> = OnceLock::new();

fn single_flight_key(descriptor: &TokenDescriptor) -> String {
    format!("{}::{}", descriptor.provider, descriptor.path.display())
}

fn single_flight_lock(key: &str) -> Arc<tokio::sync::Mutex<()>> {
    let map = SINGLE_FLIGHT.get_or_init(|| Mutex::new(HashMap::new()));
    let mut guard = map.lock().expect("single-flight map lock poisoned");
    guard
        .entry(key.to_string())
        .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
        .clone()
}

fn throttled_recently(key: &str) -> bool {
    let map = THROTTLE.get_or_init(|| Mutex::new(HashMap::new()));
    let guard = map.lock().expect("throttle map lock poisoned");
    match guard.get(key) {
        Some(last) => now_unix() - last < THROTTLE_SECS,
        None => false,
    }
}

fn mark_throttle(key: &str) {
    let map = THROTTLE.get_or_init(|| Mutex::new(HashMap::new()));
    let mut guard = map.lock().expect("throttle map lock poisoned");
    guard.insert(key.to_string(), now_unix());
}

/// A token is only valid while it has an access token AND is not within the
/// 60s expiry skew — one second past that boundary and it needs a refresh.
fn is_valid_access(record: &StoredTokenRecord) -> bool {
    match (&record.access_token, record.expires_at) {
        (Some(token), Some(expires_at)) => {
            !token.is_empty() && expires_at - now_unix() > ISEXPIRED_OR_NEAR_SKEW_SECS
        }
        (Some(token), None) => !token.is_empty(),
        _ => false,
    }
}

/// True once fewer than 60s remain before `expires_at`, or there's no
/// expiry to check at all.
fn is_expired_or_near(record: &StoredTokenRecord) -> bool {
    match record.expires_at {
        Some(expires_at) => expires_at - now_unix() <= ISEXPIRED_OR_NEAR_SKEW_SECS,
        None => true,
    }
}

fn to_flow_err(err: store::TokenStoreError) -> OAuthFlowError {
    OAuthFlowError::NetworkError(err.to_string())
}

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Top-level entry point. Single-flights concurrent callers for the same
/// `(provider, tokenFilePath)`, throttles repeated benign calls, and drives
/// the refresh-vs-reauth-vs-noop decision table.
pub async fn ensure_valid_token(
    descriptor: &TokenDescriptor,
    client: &wreq::Client,
    runner: &dyn OAuthFlowRunner,
    opts: EnsureOptions,
) -> OAuthFlowResult<StoredTokenRecord> {
    let key = single_flight_key(descriptor);
    let lock = single_flight_lock(&key);
    let _guard = lock.lock().await;

    let existing = store::read(&descriptor.path).map_err(to_flow_err)?;

    if let Some(record) = &existing {
        if record.is_static_alias() || record.norefresh.unwrap_or(false) {
            return Ok(record.clone());
        }
    }

    if !opts.force_reauthorize && throttled_recently(&key) {
        if let Some(record) = existing.clone() {
            return Ok(record);
        }
    }

    match existing {
        Some(mut record) if is_valid_access(&record) && !opts.force_reauthorize => {
            if record.project_id.is_none() {
                let _ = runner.enrich(client, &mut record).await;
            }
            mark_throttle(&key);
            Ok(record)
        }
        Some(record)
            if is_expired_or_near(&record)
                && record.refresh_token.is_some()
                && !opts.force_reauthorize =>
        {
            let refresh_token = record.refresh_token.clone().unwrap_or_default();
            match runner.refresh(client, &refresh_token).await {
                Ok(mut refreshed) => {
                    let _ = runner.enrich(client, &mut refreshed).await;
                    store::write(&descriptor.path, &refreshed).map_err(to_flow_err)?;
                    mark_throttle(&key);
                    Ok(refreshed)
                }
                Err(err) if opts.force_reacquire_if_refresh_fails => {
                    run_interactive(descriptor, client, runner).await
                }
                Err(err) => Err(err),
            }
        }
        _ => run_interactive(descriptor, client, runner).await,
    }
}

/// Interactive authorization, serialized process-wide so only one browser
/// popup is in flight at a time. Backs up the existing token file before a
/// forced reset; discards the backup on success, restores it on failure.
async fn run_interactive(
    descriptor: &TokenDescriptor,
    client: &wreq::Client,
    runner: &dyn OAuthFlowRunner,
) -> OAuthFlowResult<StoredTokenRecord> {
    let queue = INTERACTIVE_QUEUE.get_or_init(|| tokio::sync::Mutex::new(()));
    let _queue_guard = queue.lock().await;

    let backup_path = store::backup(&descriptor.path).map_err(to_flow_err)?;

    let mut last_err: Option<OAuthFlowError> = None;
    for kind in runner.flow_order() {
        match runner.run_interactive(*kind, client).await {
            Ok(mut record) => {
                let _ = runner.enrich(client, &mut record).await;
                store::write(&descriptor.path, &record).map_err(to_flow_err)?;
                if let Some(backup) = backup_path {
                    let _ = std::fs::remove_file(backup);
                }
                mark_throttle(&single_flight_key(descriptor));
                return Ok(record);
            }
            Err(err) => last_err = Some(err),
        }
    }

    if let Some(backup) = backup_path {
        let _ = store::restore(&backup, &descriptor.path);
    }
    Err(last_err.unwrap_or(OAuthFlowError::AuthFlowRejected(
        "no oauth flow configured".to_string(),
    )))
}

/// Inspects an upstream error for 401/403 or well-known invalid-token
/// phrases and, when matched, forces reauthorization. Returns whether a
/// recovery attempt was made.
pub async fn handle_upstream_invalid_oauth_token(
    descriptor: &TokenDescriptor,
    client: &wreq::Client,
    runner: &dyn OAuthFlowRunner,
    status: Option<u16>,
    error_text: &str,
) -> bool {
    let is_auth_error = matches!(status, Some(401) | Some(403))
        || ["invalid_token", "invalid_grant", "unauthenticated", "token has expired"]
            .iter()
            .any(|phrase| error_text.to_lowercase().contains(phrase));
    if !is_auth_error {
        return false;
    }
    let opts = EnsureOptions {
        force_reauthorize: true,
        ..Default::default()
    };
    ensure_valid_token(descriptor, client, runner, opts)
        .await
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AlwaysValidRunner;

    #[async_trait::async_trait]
    impl OAuthFlowRunner for AlwaysValidRunner {
        fn flow_order(&self) -> &[FlowKind] {
            &[FlowKind::AuthCode]
        }

        async fn run_interactive(
            &self,
            _kind: FlowKind,
            _client: &wreq::Client,
        ) -> OAuthFlowResult<StoredTokenRecord> {
            Ok(StoredTokenRecord {
                access_token: Some("fresh".to_string()),
                refresh_token: Some("refresh".to_string()),
                expires_at: Some(now_unix() + 3600),
                ..Default::default()
            })
        }

        async fn refresh(
            &self,
            _client: &wreq::Client,
            _refresh_token: &str,
        ) -> OAuthFlowResult<StoredTokenRecord> {
            Ok(StoredTokenRecord {
                access_token: Some("refreshed".to_string()),
                refresh_token: Some("refresh".to_string()),
                expires_at: Some(now_unix() + 3600),
                ..Default::default()
            })
        }
    }

    #[tokio::test]
    async fn missing_token_runs_interactive_flow() {
        let dir = std::env::temp_dir().join(format!("gproxy-oauth-lifecycle-{}", uuid_like()));
        std::fs::create_dir_all(&dir).unwrap();
        let descriptor = TokenDescriptor::new("test-provider", dir.join("token.json"));
        let client = wreq::Client::new();
        let runner = AlwaysValidRunner;

        let record = ensure_valid_token(&descriptor, &client, &runner, EnsureOptions::default())
            .await
            .unwrap();
        assert_eq!(record.access_token.as_deref(), Some("fresh"));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn static_alias_is_always_a_noop() {
        let dir = std::env::temp_dir().join(format!("gproxy-oauth-lifecycle-static-{}", uuid_like()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("token.json");
        let record = StoredTokenRecord {
            access_token: Some("static-key".to_string()),
            alias: Some("static".to_string()),
            ..Default::default()
        };
        store::write(&path, &record).unwrap();

        let descriptor = TokenDescriptor::new("test-provider", path);
        let client = wreq::Client::new();
        let runner = AlwaysValidRunner;

        let resolved = ensure_valid_token(&descriptor, &client, &runner, EnsureOptions::default())
            .await
            .unwrap();
        assert_eq!(resolved.access_token.as_deref(), Some("static-key"));

        let _ = std::fs::remove_dir_all(&dir);
    }

    fn uuid_like() -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos() as u64
    }

    struct CountingRunner {
        interactive_calls: std::sync::atomic::AtomicU32,
        refresh_calls: std::sync::atomic::AtomicU32,
    }

    impl CountingRunner {
        fn new() -> Self {
            Self {
                interactive_calls: std::sync::atomic::AtomicU32::new(0),
                refresh_calls: std::sync::atomic::AtomicU32::new(0),
            }
        }
    }

    #[async_trait::async_trait]
    impl OAuthFlowRunner for CountingRunner {
        fn flow_order(&self) -> &[FlowKind] {
            &[FlowKind::AuthCode]
        }

        async fn run_interactive(
            &self,
            _kind: FlowKind,
            _client: &wreq::Client,
        ) -> OAuthFlowResult<StoredTokenRecord> {
            self.interactive_calls
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(StoredTokenRecord {
                access_token: Some("fresh".to_string()),
                refresh_token: Some("refresh".to_string()),
                expires_at: Some(now_unix() + 3600),
                ..Default::default()
            })
        }

        async fn refresh(
            &self,
            _client: &wreq::Client,
            _refresh_token: &str,
        ) -> OAuthFlowResult<StoredTokenRecord> {
            self.refresh_calls
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(StoredTokenRecord {
                access_token: Some("refreshed".to_string()),
                refresh_token: Some("refresh".to_string()),
                expires_at: Some(now_unix() + 3600),
                ..Default::default()
            })
        }
    }

    /// A token 30s from expiry (within the 60s skew) with a refresh token
    /// present must trigger exactly one refresh call, not be treated as
    /// still valid.
    #[tokio::test]
    async fn near_expiry_token_triggers_exactly_one_refresh() {
        let dir = std::env::temp_dir().join(format!("gproxy-oauth-lifecycle-near-{}", uuid_like()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("token.json");
        let record = StoredTokenRecord {
            access_token: Some("stale".to_string()),
            refresh_token: Some("refresh".to_string()),
            expires_at: Some(now_unix() + 30),
            ..Default::default()
        };
        store::write(&path, &record).unwrap();

        let descriptor = TokenDescriptor::new("test-provider", path);
        let client = wreq::Client::new();
        let runner = CountingRunner::new();

        let resolved = ensure_valid_token(&descriptor, &client, &runner, EnsureOptions::default())
            .await
            .unwrap();
        assert_eq!(resolved.access_token.as_deref(), Some("refreshed"));
        assert_eq!(
            runner.refresh_calls.load(std::sync::atomic::Ordering::SeqCst),
            1
        );
        assert_eq!(
            runner
                .interactive_calls
                .load(std::sync::atomic::Ordering::SeqCst),
            0
        );

        let _ = std::fs::remove_dir_all(&dir);
    }

    /// A repeat call within the throttle window must not re-run the
    /// interactive flow, even though the on-disk record is still invalid.
    #[tokio::test]
    async fn throttle_window_suppresses_duplicate_interactive_runs() {
        let dir =
            std::env::temp_dir().join(format!("gproxy-oauth-lifecycle-throttle-{}", uuid_like()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("token.json");
        let descriptor = TokenDescriptor::new("test-provider", path.clone());
        let client = wreq::Client::new();
        let runner = CountingRunner::new();

        let first = ensure_valid_token(&descriptor, &client, &runner, EnsureOptions::default())
            .await
            .unwrap();
        assert_eq!(first.access_token.as_deref(), Some("fresh"));
        assert_eq!(
            runner
                .interactive_calls
                .load(std::sync::atomic::Ordering::SeqCst),
            1
        );

        // Overwrite with an invalid record directly, bypassing the lifecycle,
        // to prove the second call returns this stale value from the throttle
        // path rather than re-deriving a valid one via another flow run.
        let stale = StoredTokenRecord::default();
        store::write(&path, &stale).unwrap();

        let second = ensure_valid_token(&descriptor, &client, &runner, EnsureOptions::default())
            .await
            .unwrap();
        assert_eq!(second, stale);
        assert_eq!(
            runner
                .interactive_calls
                .load(std::sync::atomic::Ordering::SeqCst),
            1
        );

        let _ = std::fs::remove_dir_all(&dir);
    }

    /// `handle_upstream_invalid_oauth_token` forces reauthorization on a 401
    /// even when the stored token still looks valid.
    #[tokio::test]
    async fn upstream_401_forces_reauthorization_of_a_valid_token() {
        let dir = std::env::temp_dir().join(format!("gproxy-oauth-lifecycle-401-{}", uuid_like()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("token.json");
        let record = StoredTokenRecord {
            access_token: Some("still-valid".to_string()),
            refresh_token: Some("refresh".to_string()),
            expires_at: Some(now_unix() + 3600),
            ..Default::default()
        };
        store::write(&path, &record).unwrap();

        let descriptor = TokenDescriptor::new("test-provider", path.clone());
        let client = wreq::Client::new();
        let runner = CountingRunner::new();

        let recovered =
            handle_upstream_invalid_oauth_token(&descriptor, &client, &runner, Some(401), "")
                .await;
        assert!(recovered);
        assert_eq!(
            runner
                .interactive_calls
                .load(std::sync::atomic::Ordering::SeqCst),
            1
        );
        let on_disk = store::read(&path).unwrap().unwrap();
        assert_eq!(on_disk.access_token.as_deref(), Some("fresh"));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn non_auth_error_does_not_trigger_recovery() {
        let dir = std::env::temp_dir().join(format!("gproxy-oauth-lifecycle-noauth-{}", uuid_like()));
        std::fs::create_dir_all(&dir).unwrap();
        let descriptor = TokenDescriptor::new("test-provider", dir.join("token.json"));
        let client = wreq::Client::new();
        let runner = CountingRunner::new();

        let recovered =
            handle_upstream_invalid_oauth_token(&descriptor, &client, &runner, Some(500), "boom")
                .await;
        assert!(!recovered);
        assert_eq!(
            runner
                .interactive_calls
                .load(std::sync::atomic::Ordering::SeqCst),
            0
        );

        let _ = std::fs::remove_dir_all(&dir);
    }
}
