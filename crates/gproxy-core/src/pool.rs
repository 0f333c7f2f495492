//! Module instance pool: caches loaded module instances (provider clients,
//! compatibility adapters, switches) keyed by `(moduleType, configHash)` so a
//! route referencing the same module config twice shares one instance.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use gproxy_provider_core::Headers;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("no factory registered for module type {0:?}")]
    UnknownModuleType(String),
    #[error("module {module_type:?} failed to initialize: {message}")]
    InitFailed { module_type: String, message: String },
    #[error("pool for module type {0:?} is at capacity")]
    Capacity(String),
}

/// Canonical internal request shape a module chain operates on end to end.
#[derive(Debug, Clone)]
pub struct RequestDto {
    pub data: Value,
    pub route: RequestRoute,
    pub metadata: RequestMetadata,
    pub debug: RequestDebug,
}

#[derive(Debug, Clone, Default)]
pub struct RequestRoute {
    pub provider_id: String,
    pub model_id: String,
    pub request_id: String,
    pub pipeline_id: String,
    pub timestamp_ms: u64,
}

#[derive(Debug, Clone, Default)]
pub struct RequestMetadata {
    pub entry_endpoint: String,
    pub headers: Headers,
    pub stream: Option<bool>,
    pub target_protocol: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct RequestDebug {
    pub enabled: bool,
    pub stages: Vec<String>,
}

impl RequestDto {
    pub fn record_stage(&mut self, stage: impl Into<String>) {
        if self.debug.enabled {
            self.debug.stages.push(stage.into());
        }
    }
}

/// One loaded module: provider client, compatibility adapter, or switch.
/// Instances are shared across concurrent requests; state mutated while
/// processing a call must live on `RequestDto`, never on `self`.
pub trait ModuleInstance: Send + Sync {
    fn module_type(&self) -> &str;

    fn initialize<'a>(&'a self) -> Pin<Box<dyn Future<Output = Result<(), PoolError>> + Send + 'a>>;

    fn process<'a>(
        &'a self,
        req: &'a mut RequestDto,
    ) -> Pin<Box<dyn Future<Output = Result<(), PoolError>> + Send + 'a>>;

    fn cleanup<'a>(&'a self) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

    fn is_healthy(&self) -> bool {
        true
    }
}

pub type ModuleFactory =
    Arc<dyn Fn(&Value) -> Result<Arc<dyn ModuleInstance>, PoolError> + Send + Sync>;

#[derive(Debug, Clone, Copy)]
pub struct PoolLimits {
    pub max_instances_per_type: usize,
    pub warmup_instances: usize,
    pub idle_timeout: Duration,
}

impl Default for PoolLimits {
    fn default() -> Self {
        Self {
            max_instances_per_type: 8,
            warmup_instances: 0,
            idle_timeout: Duration::from_secs(600),
        }
    }
}

struct Entry {
    instance: Arc<dyn ModuleInstance>,
    last_used: Instant,
}

#[derive(Debug, Default)]
pub struct WarmupReport {
    pub preloaded_instances: usize,
    pub failed_instances: Vec<String>,
    pub warnings: Vec<String>,
    pub success: bool,
}

/// Compute a stable hash over a JSON config, independent of key order.
pub fn config_hash(config: &Value) -> u64 {
    let canonical = canonicalize(config);
    let digest = blake3::hash(canonical.as_bytes());
    let bytes = digest.as_bytes();
    u64::from_be_bytes(bytes[..8].try_into().expect("blake3 digest is 32 bytes"))
}

fn canonicalize(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut out = String::from("{");
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key).unwrap_or_default());
                out.push(':');
                out.push_str(&canonicalize(&map[*key]));
            }
            out.push('}');
            out
        }
        Value::Array(items) => {
            let mut out = String::from("[");
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&canonicalize(item));
            }
            out.push(']');
            out
        }
        other => other.to_string(),
    }
}

pub struct InstancePool {
    limits: PoolLimits,
    factories: Mutex<HashMap<String, ModuleFactory>>,
    instances: Mutex<HashMap<(String, u64), Entry>>,
}

impl InstancePool {
    pub fn new(limits: PoolLimits) -> Self {
        Self {
            limits,
            factories: Mutex::new(HashMap::new()),
            instances: Mutex::new(HashMap::new()),
        }
    }

    pub fn register_factory(&self, module_type: impl Into<String>, factory: ModuleFactory) {
        self.factories
            .lock()
            .expect("pool factory lock poisoned")
            .insert(module_type.into(), factory);
    }

    pub async fn get_instance(
        &self,
        module_type: &str,
        config: &Value,
    ) -> Result<Arc<dyn ModuleInstance>, PoolError> {
        let hash = config_hash(config);
        let key = (module_type.to_string(), hash);

        if let Some(entry) = self.instances.lock().expect("pool lock poisoned").get_mut(&key) {
            entry.last_used = Instant::now();
            return Ok(entry.instance.clone());
        }

        let factory = self
            .factories
            .lock()
            .expect("pool factory lock poisoned")
            .get(module_type)
            .cloned()
            .ok_or_else(|| PoolError::UnknownModuleType(module_type.to_string()))?;

        let instance = factory(config)?;
        instance.initialize().await.map_err(|err| PoolError::InitFailed {
            module_type: module_type.to_string(),
            message: err.to_string(),
        })?;

        self.evict_idle_and_enforce_capacity(module_type);

        let mut guard = self.instances.lock().expect("pool lock poisoned");
        let entry = guard.entry(key).or_insert(Entry {
            instance: instance.clone(),
            last_used: Instant::now(),
        });
        entry.last_used = Instant::now();
        Ok(entry.instance.clone())
    }

    fn evict_idle_and_enforce_capacity(&self, module_type: &str) {
        let mut guard = self.instances.lock().expect("pool lock poisoned");
        let now = Instant::now();
        guard.retain(|(mt, _), entry| {
            mt != module_type || now.duration_since(entry.last_used) < self.limits.idle_timeout
        });

        let mut of_type: Vec<(String, u64)> = guard
            .iter()
            .filter(|((mt, _), _)| mt == module_type)
            .map(|(k, _)| k.clone())
            .collect();
        if of_type.len() < self.limits.max_instances_per_type {
            return;
        }
        of_type.sort_by_key(|key| guard.get(key).map(|e| e.last_used).unwrap_or(now));
        let overflow = of_type.len() + 1 - self.limits.max_instances_per_type;
        for key in of_type.into_iter().take(overflow) {
            guard.remove(&key);
        }
    }

    /// Walks every module spec in `specs`, constructing instances up front.
    pub async fn preload_instances(&self, specs: &[(&str, Value)]) -> WarmupReport {
        let mut report = WarmupReport {
            success: true,
            ..Default::default()
        };
        for (module_type, config) in specs {
            match self.get_instance(module_type, config).await {
                Ok(_) => report.preloaded_instances += 1,
                Err(err) => {
                    report.failed_instances.push(format!("{module_type}: {err}"));
                    report.success = false;
                }
            }
        }
        report
    }

    pub async fn shutdown(&self) {
        let instances: Vec<Arc<dyn ModuleInstance>> = {
            let mut guard = self.instances.lock().expect("pool lock poisoned");
            guard.drain().map(|(_, e)| e.instance).collect()
        };
        for instance in instances {
            instance.cleanup().await;
        }
    }

    pub fn len(&self) -> usize {
        self.instances.lock().expect("pool lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoModule {
        kind: String,
    }

    impl ModuleInstance for EchoModule {
        fn module_type(&self) -> &str {
            &self.kind
        }

        fn initialize<'a>(
            &'a self,
        ) -> Pin<Box<dyn Future<Output = Result<(), PoolError>> + Send + 'a>> {
            Box::pin(async { Ok(()) })
        }

        fn process<'a>(
            &'a self,
            req: &'a mut RequestDto,
        ) -> Pin<Box<dyn Future<Output = Result<(), PoolError>> + Send + 'a>> {
            req.record_stage(self.kind.clone());
            Box::pin(async { Ok(()) })
        }

        fn cleanup<'a>(&'a self) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
            Box::pin(async {})
        }
    }

    fn dummy_request() -> RequestDto {
        RequestDto {
            data: Value::Null,
            route: RequestRoute::default(),
            metadata: RequestMetadata::default(),
            debug: RequestDebug {
                enabled: true,
                stages: Vec::new(),
            },
        }
    }

    #[test]
    fn config_hash_is_order_independent() {
        let a = serde_json::json!({"a": 1, "b": 2});
        let b = serde_json::json!({"b": 2, "a": 1});
        assert_eq!(config_hash(&a), config_hash(&b));
    }

    #[test]
    fn config_hash_differs_on_value_change() {
        let a = serde_json::json!({"a": 1});
        let b = serde_json::json!({"a": 2});
        assert_ne!(config_hash(&a), config_hash(&b));
    }

    #[tokio::test]
    async fn same_config_returns_same_instance() {
        let pool = InstancePool::new(PoolLimits::default());
        pool.register_factory(
            "echo",
            Arc::new(|_cfg| {
                Ok(Arc::new(EchoModule {
                    kind: "echo".to_string(),
                }) as Arc<dyn ModuleInstance>)
            }),
        );
        let cfg = serde_json::json!({"x": 1});
        let a = pool.get_instance("echo", &cfg).await.unwrap();
        let b = pool.get_instance("echo", &cfg).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn unknown_module_type_errors() {
        let pool = InstancePool::new(PoolLimits::default());
        let err = pool
            .get_instance("missing", &Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::UnknownModuleType(_)));
    }

    #[tokio::test]
    async fn capacity_limit_evicts_oldest() {
        let pool = InstancePool::new(PoolLimits {
            max_instances_per_type: 1,
            warmup_instances: 0,
            idle_timeout: Duration::from_secs(600),
        });
        pool.register_factory(
            "echo",
            Arc::new(|_cfg| {
                Ok(Arc::new(EchoModule {
                    kind: "echo".to_string(),
                }) as Arc<dyn ModuleInstance>)
            }),
        );
        pool.get_instance("echo", &serde_json::json!({"id": 1}))
            .await
            .unwrap();
        pool.get_instance("echo", &serde_json::json!({"id": 2}))
            .await
            .unwrap();
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test]
    async fn module_process_records_stage() {
        let module = EchoModule {
            kind: "llmswitch".to_string(),
        };
        let mut req = dummy_request();
        module.process(&mut req).await.unwrap();
        assert_eq!(req.debug.stages, vec!["llmswitch".to_string()]);
    }
}
