//! Parallel Runner: optional, non-blocking shadow execution of a secondary
//! pipeline version for comparison against the primary response.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use gproxy_provider_core::Headers;

const HISTORY_CAP: usize = 1000;
const METRICS_WINDOW: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComparisonMode {
    Strict,
    Lenient,
    None,
}

impl ComparisonMode {
    fn matches(self, similarity: f64) -> bool {
        match self {
            ComparisonMode::Strict => similarity > 0.95,
            ComparisonMode::Lenient => similarity > 0.7,
            ComparisonMode::None => true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ParallelConfig {
    pub enabled: bool,
    pub sample_rate: f64,
    pub max_concurrency: usize,
    pub timeout: Duration,
    pub comparison_mode: ComparisonMode,
    pub metrics_collection: bool,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            sample_rate: 0.0,
            max_concurrency: 1,
            timeout: Duration::from_secs(5),
            comparison_mode: ComparisonMode::Lenient,
            metrics_collection: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResponseFingerprint {
    pub status: u16,
    pub headers: Headers,
    pub body: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ShadowOutcome {
    Matched { similarity: f64 },
    Mismatched { similarity: f64 },
    TimedOut,
    ConcurrencyDropped,
    Skipped,
}

#[derive(Debug, Clone)]
pub struct ShadowRunRecord {
    pub request_id: String,
    pub outcome: ShadowOutcome,
    pub primary_duration: Duration,
    pub shadow_duration: Option<Duration>,
}

#[derive(Debug, Default, Clone)]
struct Counters {
    total_requests: u64,
    sampled: u64,
    concurrency_drops: u64,
    timeouts: u64,
    matched: u64,
    mismatched: u64,
}

pub struct ParallelRunner {
    config: ParallelConfig,
    active_runs: AtomicU64,
    counters: Mutex<Counters>,
    history: Mutex<VecDeque<ShadowRunRecord>>,
}

fn similarity(primary: &ResponseFingerprint, shadow: &ResponseFingerprint) -> f64 {
    let mut sum = 0.0;
    let mut checks = 0.0;

    checks += 1.0;
    if primary.status == shadow.status {
        sum += 1.0;
    }

    checks += 0.8;
    let primary_keys: std::collections::BTreeSet<&str> =
        primary.headers.iter().map(|(k, _)| k.as_str()).collect();
    let shadow_keys: std::collections::BTreeSet<&str> =
        shadow.headers.iter().map(|(k, _)| k.as_str()).collect();
    if primary_keys == shadow_keys {
        sum += 0.8;
    }

    checks += 1.0;
    match (&primary.body, &shadow.body) {
        (Some(a), Some(b)) if a == b => sum += 1.0,
        (Some(a), Some(b)) => {
            sum += structural_similarity(a, b);
        }
        _ => {}
    }

    sum / checks
}

fn structural_similarity(a: &[u8], b: &[u8]) -> f64 {
    let (Ok(a), Ok(b)) = (
        serde_json::from_slice::<serde_json::Value>(a),
        serde_json::from_slice::<serde_json::Value>(b),
    ) else {
        return 0.0;
    };
    let (Some(a), Some(b)) = (a.as_object(), b.as_object()) else {
        return 0.0;
    };
    let a_keys: std::collections::BTreeSet<&String> = a.keys().collect();
    let b_keys: std::collections::BTreeSet<&String> = b.keys().collect();
    let common = a_keys.intersection(&b_keys).count();
    let max = a_keys.len().max(b_keys.len());
    if max == 0 { 0.0 } else { common as f64 / max as f64 }
}

#[derive(Debug, Default, Clone)]
pub struct ParallelMetrics {
    pub sample_count: usize,
    pub success_rate: f64,
    pub average_similarity: f64,
    pub average_primary_duration: Duration,
    pub average_shadow_duration: Duration,
}

impl ParallelRunner {
    pub fn new(config: ParallelConfig) -> Self {
        Self {
            config,
            active_runs: AtomicU64::new(0),
            counters: Mutex::new(Counters::default()),
            history: Mutex::new(VecDeque::with_capacity(HISTORY_CAP)),
        }
    }

    /// Runs `shadow` (the secondary pipeline) against `primary`'s already
    /// completed response, never delaying or affecting the primary request.
    pub async fn process_parallel<F>(
        &self,
        request_id: &str,
        primary: &ResponseFingerprint,
        primary_duration: Duration,
        shadow: F,
    ) where
        F: Future<Output = ResponseFingerprint> + Send,
    {
        self.counters.lock().expect("counters poisoned").total_requests += 1;

        if !self.config.enabled || !sampled(self.config.sample_rate) {
            return;
        }
        self.counters.lock().expect("counters poisoned").sampled += 1;

        if self.active_runs.load(Ordering::SeqCst) as usize >= self.config.max_concurrency {
            self.counters.lock().expect("counters poisoned").concurrency_drops += 1;
            self.push_record(ShadowRunRecord {
                request_id: request_id.to_string(),
                outcome: ShadowOutcome::ConcurrencyDropped,
                primary_duration,
                shadow_duration: None,
            });
            return;
        }

        self.active_runs.fetch_add(1, Ordering::SeqCst);
        let started = std::time::Instant::now();
        let result = tokio::time::timeout(self.config.timeout, shadow).await;
        self.active_runs.fetch_sub(1, Ordering::SeqCst);
        let elapsed = started.elapsed();

        let outcome = match result {
            Err(_) => {
                self.counters.lock().expect("counters poisoned").timeouts += 1;
                ShadowOutcome::TimedOut
            }
            Ok(shadow_resp) => {
                let score = similarity(primary, &shadow_resp);
                if self.config.comparison_mode.matches(score) {
                    self.counters.lock().expect("counters poisoned").matched += 1;
                    ShadowOutcome::Matched { similarity: score }
                } else {
                    self.counters.lock().expect("counters poisoned").mismatched += 1;
                    ShadowOutcome::Mismatched { similarity: score }
                }
            }
        };

        self.push_record(ShadowRunRecord {
            request_id: request_id.to_string(),
            outcome,
            primary_duration,
            shadow_duration: Some(elapsed),
        });
    }

    fn push_record(&self, record: ShadowRunRecord) {
        if !self.config.metrics_collection {
            return;
        }
        let mut history = self.history.lock().expect("history poisoned");
        if history.len() >= HISTORY_CAP {
            history.pop_front();
        }
        history.push_back(record);
    }

    /// Aggregate metrics over the last `METRICS_WINDOW` shadow runs.
    pub fn metrics(&self) -> ParallelMetrics {
        let history = self.history.lock().expect("history poisoned");
        let window: Vec<&ShadowRunRecord> = history.iter().rev().take(METRICS_WINDOW).collect();
        if window.is_empty() {
            return ParallelMetrics::default();
        }

        let mut matched = 0usize;
        let mut similarity_sum = 0.0;
        let mut similarity_count = 0usize;
        let mut primary_total = Duration::ZERO;
        let mut shadow_total = Duration::ZERO;
        let mut shadow_count = 0usize;

        for record in &window {
            match record.outcome {
                ShadowOutcome::Matched { similarity } => {
                    matched += 1;
                    similarity_sum += similarity;
                    similarity_count += 1;
                }
                ShadowOutcome::Mismatched { similarity } => {
                    similarity_sum += similarity;
                    similarity_count += 1;
                }
                _ => {}
            }
            primary_total += record.primary_duration;
            if let Some(d) = record.shadow_duration {
                shadow_total += d;
                shadow_count += 1;
            }
        }

        ParallelMetrics {
            sample_count: window.len(),
            success_rate: matched as f64 / window.len() as f64,
            average_similarity: if similarity_count > 0 {
                similarity_sum / similarity_count as f64
            } else {
                0.0
            },
            average_primary_duration: primary_total / window.len() as u32,
            average_shadow_duration: if shadow_count > 0 {
                shadow_total / shadow_count as u32
            } else {
                Duration::ZERO
            },
        }
    }
}

fn sampled(rate: f64) -> bool {
    if rate <= 0.0 {
        return false;
    }
    if rate >= 1.0 {
        return true;
    }
    rand::random::<f64>() < rate
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fingerprint(status: u16, body: &str) -> ResponseFingerprint {
        ResponseFingerprint {
            status,
            headers: vec![("content-type".to_string(), "application/json".to_string())],
            body: Some(body.as_bytes().to_vec()),
        }
    }

    #[tokio::test]
    async fn disabled_runner_never_samples() {
        let runner = ParallelRunner::new(ParallelConfig {
            enabled: false,
            ..ParallelConfig::default()
        });
        let primary = fingerprint(200, "{}");
        runner
            .process_parallel("req-1", &primary, Duration::from_millis(1), async {
                fingerprint(200, "{}")
            })
            .await;
        assert_eq!(runner.history.lock().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn identical_responses_match_strictly() {
        let runner = ParallelRunner::new(ParallelConfig {
            enabled: true,
            sample_rate: 1.0,
            max_concurrency: 4,
            comparison_mode: ComparisonMode::Strict,
            ..ParallelConfig::default()
        });
        let primary = fingerprint(200, r#"{"a":1}"#);
        runner
            .process_parallel("req-2", &primary, Duration::from_millis(5), async {
                fingerprint(200, r#"{"a":1}"#)
            })
            .await;
        let metrics = runner.metrics();
        assert_eq!(metrics.sample_count, 1);
        assert_eq!(metrics.success_rate, 1.0);
    }

    #[tokio::test]
    async fn concurrency_cap_drops_excess_shadow_runs() {
        let runner = ParallelRunner::new(ParallelConfig {
            enabled: true,
            sample_rate: 1.0,
            max_concurrency: 0,
            ..ParallelConfig::default()
        });
        let primary = fingerprint(200, "{}");
        runner
            .process_parallel("req-3", &primary, Duration::from_millis(1), async {
                fingerprint(200, "{}")
            })
            .await;
        let history = runner.history.lock().unwrap();
        assert!(matches!(
            history.back().unwrap().outcome,
            ShadowOutcome::ConcurrencyDropped
        ));
    }

    #[tokio::test]
    async fn shadow_timeout_is_recorded() {
        let runner = ParallelRunner::new(ParallelConfig {
            enabled: true,
            sample_rate: 1.0,
            max_concurrency: 4,
            timeout: Duration::from_millis(5),
            ..ParallelConfig::default()
        });
        let primary = fingerprint(200, "{}");
        runner
            .process_parallel("req-4", &primary, Duration::from_millis(1), async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                fingerprint(200, "{}")
            })
            .await;
        let history = runner.history.lock().unwrap();
        assert!(matches!(history.back().unwrap().outcome, ShadowOutcome::TimedOut));
    }

    #[test]
    fn structural_similarity_counts_common_keys() {
        let a = serde_json::json!({"a":1,"b":2}).to_string();
        let b = serde_json::json!({"a":1,"c":3}).to_string();
        let score = structural_similarity(a.as_bytes(), b.as_bytes());
        assert!((score - (1.0 / 2.0)).abs() < 1e-9);
    }
}
