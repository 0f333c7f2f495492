//! Pipeline Manager: assembles and executes a request through the module
//! chain a route selects, and owns the cross-cutting lifecycle operations
//! (preload, validation, dry-run simulation, mode switching, reload).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use serde_json::Value;
use thiserror::Error;

use crate::parallel::ParallelRunner;
use crate::pool::{InstancePool, ModuleFactory, PoolLimits, RequestDebug, RequestDto, RequestMetadata, RequestRoute};
use crate::route::{self, RouteDefinition, RouteError, RouteTable};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Route(#[from] RouteError),
    #[error("no route matched and no default route is configured")]
    NoRouteMatched,
    #[error("pipeline is not initialized")]
    NotInitialized,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineMode {
    V1,
    V2,
    Hybrid,
}

#[derive(Debug, Clone)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    fn ok() -> Self {
        Self {
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct FailedRoute {
    pub route_id: String,
    pub error: String,
}

#[derive(Debug, Clone)]
pub struct PreRunReport {
    pub total_routes: usize,
    pub successful_routes: usize,
    pub failed_routes: Vec<FailedRoute>,
    pub warnings: Vec<String>,
    pub success: bool,
}

#[derive(Debug, Clone)]
pub struct RouteSimulationOutcome {
    pub route_id: String,
    pub success: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SwitchReport {
    pub from: String,
    pub to: String,
    pub success: bool,
    pub duration: Duration,
    pub errors: Vec<String>,
}

pub struct PipelineConfig {
    pub routes: Vec<RouteDefinition>,
    pub default_route: Option<String>,
    pub recoverable_init_failures: bool,
}

/// Assembles C8 (instance pool), C9 (router) and optionally C11 (parallel
/// runner) into a single request-processing surface.
pub struct PipelineManager {
    pool: InstancePool,
    routes: ArcSwap<RouteTable>,
    mode: ArcSwap<PipelineMode>,
    parallel: Option<Arc<ParallelRunner>>,
    recoverable_init_failures: AtomicBool,
}

impl PipelineManager {
    pub fn new(pool_limits: PoolLimits, parallel: Option<Arc<ParallelRunner>>) -> Self {
        Self {
            pool: InstancePool::new(pool_limits),
            routes: ArcSwap::from_pointee(RouteTable::default()),
            mode: ArcSwap::from_pointee(PipelineMode::V2),
            parallel,
            recoverable_init_failures: AtomicBool::new(false),
        }
    }

    pub fn register_factory(&self, module_type: impl Into<String>, factory: ModuleFactory) {
        self.pool.register_factory(module_type, factory);
    }

    /// The shadow-execution runner (C11), if configured. Callers drive it
    /// themselves alongside `process_request` since shadow runs must never
    /// block or affect the primary response.
    pub fn parallel(&self) -> Option<&Arc<ParallelRunner>> {
        self.parallel.as_ref()
    }

    /// One-shot wiring: installs the route table, preloads instances. Fails
    /// if any instance fails to initialize unless the config marks failures
    /// recoverable.
    pub async fn initialize(&self, config: PipelineConfig) -> Result<(), PipelineError> {
        let table = RouteTable::new(config.routes, config.default_route)?;
        self.recoverable_init_failures
            .store(config.recoverable_init_failures, Ordering::Relaxed);

        let specs: Vec<(&str, Value)> = table
            .routes
            .iter()
            .flat_map(|r| r.modules.iter())
            .map(|m| (m.module_type.as_str(), m.config.clone()))
            .collect();
        let report = self.pool.preload_instances(&specs).await;
        self.routes.store(Arc::new(table));

        if !report.success && !config.recoverable_init_failures {
            self.pool.shutdown().await;
            return Err(PipelineError::Route(RouteError::Invalid {
                route_id: "<preload>".to_string(),
                reason: report.failed_instances.join("; "),
            }));
        }
        Ok(())
    }

    pub async fn process_request(&self, mut req: RequestDto) -> Result<RequestDto, PipelineError> {
        let table = self.routes.load();
        let model = req
            .data
            .get("model")
            .and_then(Value::as_str)
            .map(str::to_string);
        let has_tools = req
            .data
            .get("tools")
            .map(|t| matches!(t, Value::Array(items) if !items.is_empty()))
            .unwrap_or(false);

        let matched = table
            .match_route(model.as_deref(), has_tools)
            .ok_or(PipelineError::NoRouteMatched)?;
        let route = table
            .find(&matched.route_id)
            .expect("match_route returned an id present in the table");

        let chain = route::build_module_chain(route, &req.data, &self.pool).await?;
        req.route.pipeline_id = matched.route_id.clone();
        for instance in &chain.instances {
            instance.process(&mut req).await.map_err(RouteError::from)?;
        }
        chain.cleanup_connections();
        Ok(req)
    }

    /// Cross-checks every route against the module registry and Tools
    /// Unique Entrance (self-validating by construction via `RouteTable`).
    pub fn validate_configuration(&self, routes: &[RouteDefinition]) -> ValidationReport {
        let mut report = ValidationReport::ok();
        for route in routes {
            if let Err(err) = route.validate() {
                report.errors.push(err.to_string());
            }
            if route.modules.is_empty() {
                report
                    .warnings
                    .push(format!("route {:?} has no modules", route.id));
            }
        }
        report
    }

    /// `validateConfiguration` + instance preload + per-route mock dry run.
    pub async fn execute_pre_run(&self, routes: &[RouteDefinition]) -> PreRunReport {
        let validation = self.validate_configuration(routes);
        let mut report = PreRunReport {
            total_routes: routes.len(),
            successful_routes: 0,
            failed_routes: Vec::new(),
            warnings: validation.warnings.clone(),
            success: validation.is_valid(),
        };

        for route in routes {
            if let Err(err) = route.validate() {
                report.failed_routes.push(FailedRoute {
                    route_id: route.id.clone(),
                    error: err.to_string(),
                });
                continue;
            }
            let mock = mock_request_for(route);
            match route::build_module_chain(route, &mock.data, &self.pool).await {
                Ok(chain) if chain.validate_health() => {
                    chain.cleanup_connections();
                    report.successful_routes += 1;
                }
                Ok(_) => {
                    report.failed_routes.push(FailedRoute {
                        route_id: route.id.clone(),
                        error: "instance failed health check during pre-run".to_string(),
                    });
                }
                Err(err) => {
                    report.failed_routes.push(FailedRoute {
                        route_id: route.id.clone(),
                        error: err.to_string(),
                    });
                }
            }
        }

        if !report.failed_routes.is_empty() {
            report.success = false;
        }
        report
    }

    /// For every route, builds a request consistent with its pattern and
    /// runs it through the chain, recording the outcome.
    pub async fn simulate_data_flow(&self, routes: &[RouteDefinition]) -> Vec<RouteSimulationOutcome> {
        let mut outcomes = Vec::with_capacity(routes.len());
        for route in routes {
            let mock = mock_request_for(route);
            let outcome = match route::build_module_chain(route, &mock.data, &self.pool).await {
                Ok(chain) => {
                    let mut req = mock;
                    let mut result = Ok(());
                    for instance in &chain.instances {
                        if let Err(err) = instance.process(&mut req).await {
                            result = Err(err.to_string());
                            break;
                        }
                    }
                    chain.cleanup_connections();
                    RouteSimulationOutcome {
                        route_id: route.id.clone(),
                        success: result.is_ok(),
                        error: result.err(),
                    }
                }
                Err(err) => RouteSimulationOutcome {
                    route_id: route.id.clone(),
                    success: false,
                    error: Some(err.to_string()),
                },
            };
            outcomes.push(outcome);
        }
        outcomes
    }

    pub fn switch_mode(&self, target: PipelineMode) -> SwitchReport {
        let started = Instant::now();
        let from = **self.mode.load();
        self.mode.store(Arc::new(target));
        SwitchReport {
            from: mode_label(from).to_string(),
            to: mode_label(target).to_string(),
            success: true,
            duration: started.elapsed(),
            errors: Vec::new(),
        }
    }

    pub fn mode(&self) -> PipelineMode {
        **self.mode.load()
    }

    pub async fn reload_configuration(&self, config: PipelineConfig) -> Result<(), PipelineError> {
        self.shutdown().await;
        self.initialize(config).await
    }

    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
    }
}

fn mode_label(mode: PipelineMode) -> &'static str {
    match mode {
        PipelineMode::V1 => "v1",
        PipelineMode::V2 => "v2",
        PipelineMode::Hybrid => "hybrid",
    }
}

fn mock_request_for(route: &RouteDefinition) -> RequestDto {
    let model = match &route.pattern.model {
        Some(m) => m.sample(),
        None => "simulated-model".to_string(),
    };
    let mut data = serde_json::json!({ "model": model, "messages": [] });
    if route.pattern.has_tools == Some(true) {
        data["tools"] = serde_json::json!([{ "name": "simulated_tool" }]);
    }
    RequestDto {
        data,
        route: RequestRoute {
            pipeline_id: route.id.clone(),
            ..Default::default()
        },
        metadata: RequestMetadata::default(),
        debug: RequestDebug {
            enabled: true,
            stages: Vec::new(),
        },
    }
}

#[cfg(test)]
mod tests {
    use std::future::Future;
    use std::pin::Pin;

    use super::*;
    use crate::pool::{ModuleInstance, PoolError};
    use crate::route::{ModuleSpecification, RoutePattern};

    struct LlmSwitch;

    impl ModuleInstance for LlmSwitch {
        fn module_type(&self) -> &str {
            "llmswitch-default"
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
            req.record_stage("llmswitch");
            Box::pin(async { Ok(()) })
        }

        fn cleanup<'a>(&'a self) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
            Box::pin(async {})
        }
    }

    fn route_fixture() -> RouteDefinition {
        RouteDefinition {
            id: "r1".to_string(),
            pattern: RoutePattern::default(),
            modules: vec![ModuleSpecification {
                module_type: "llmswitch-default".to_string(),
                config: Value::Null,
                condition: None,
            }],
            priority: 0,
        }
    }

    fn manager() -> PipelineManager {
        let manager = PipelineManager::new(PoolLimits::default(), None);
        manager.register_factory(
            "llmswitch-default",
            std::sync::Arc::new(|_cfg| Ok(std::sync::Arc::new(LlmSwitch) as std::sync::Arc<dyn ModuleInstance>)),
        );
        manager
    }

    #[tokio::test]
    async fn process_request_routes_through_chain_and_records_stage() {
        let manager = manager();
        manager
            .initialize(PipelineConfig {
                routes: vec![route_fixture()],
                default_route: None,
                recoverable_init_failures: false,
            })
            .await
            .unwrap();

        let req = RequestDto {
            data: serde_json::json!({"model": "any-model"}),
            route: RequestRoute::default(),
            metadata: RequestMetadata::default(),
            debug: RequestDebug {
                enabled: true,
                stages: Vec::new(),
            },
        };
        let result = manager.process_request(req).await.unwrap();
        assert_eq!(result.debug.stages, vec!["llmswitch".to_string()]);
        assert_eq!(result.route.pipeline_id, "r1");
    }

    #[tokio::test]
    async fn execute_pre_run_reports_tools_unique_entrance_violation() {
        let manager = manager();
        let bad_route = RouteDefinition {
            id: "bad".to_string(),
            pattern: RoutePattern::default(),
            modules: vec![
                ModuleSpecification {
                    module_type: "provider-qwen".to_string(),
                    config: Value::Null,
                    condition: None,
                },
                ModuleSpecification {
                    module_type: "compat-qwen".to_string(),
                    config: Value::Null,
                    condition: None,
                },
            ],
            priority: 0,
        };
        let report = manager.execute_pre_run(&[bad_route]).await;
        assert!(!report.success);
        assert!(report.failed_routes[0].error.contains("Tools Unique Entrance"));
    }

    #[tokio::test]
    async fn switch_mode_reports_transition() {
        let manager = manager();
        let report = manager.switch_mode(PipelineMode::Hybrid);
        assert_eq!(report.from, "v2");
        assert_eq!(report.to, "hybrid");
        assert!(report.success);
    }
}
