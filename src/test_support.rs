//! Fixtures shared by unit tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use uuid::Uuid;

use crate::config::{
    ConvoyConfig, DockerBackendConfig, LocalBackendConfig, ParallelConfig, ResourceConfig, RunnerBackend,
};
use crate::coordinator::ParallelCoordinator;
use crate::events::{self, EventReceiver, EventSender};
use crate::invoker::{InvocationPayload, InvokeError, InvokeResult, Invoker};
use crate::model::{
    AllocationStatus, Capabilities, Execution, ExecutionStatus, HealthStatus, LoadBalancingRule,
    ResourceAllocation, RuleType, Runner, RunnerStatus,
};
use crate::registry::RunnerRegistry;
use crate::resources::ResourceManager;
use crate::scheduler::ExecutionScheduler;
use crate::store::Store;

pub fn execution(test_suite: &str, priority: i32) -> Execution {
    let now = Utc::now();
    Execution {
        id: Uuid::new_v4().to_string(),
        test_suite: test_suite.to_string(),
        environment: "staging".to_string(),
        priority,
        requested_runner_type: None,
        requested_runner_id: None,
        estimated_duration_secs: None,
        metadata: BTreeMap::new(),
        status: ExecutionStatus::Queued,
        runner_id: None,
        queued_at: now,
        assigned_at: None,
        started_at: None,
        completed_at: None,
        timeout_at: now + Duration::minutes(30),
        results: None,
        error_message: None,
        sequence: 0,
    }
}

pub fn local_backend() -> RunnerBackend {
    RunnerBackend::Local(LocalBackendConfig {
        command: "true".to_string(),
        working_dir: None,
        env: HashMap::new(),
        shell: "/bin/sh".to_string(),
    })
}

fn runner(name: &str, backend: RunnerBackend, max_concurrent_jobs: u32) -> Runner {
    Runner {
        id: Uuid::new_v4().to_string(),
        name: name.to_string(),
        backend,
        status: RunnerStatus::Active,
        health: HealthStatus::Unknown,
        last_health_check: None,
        health_response_ms: None,
        health_error: None,
        max_concurrent_jobs,
        current_jobs: 0,
        priority: 50,
        capabilities: Capabilities::default(),
        health_check_url: None,
        registered_at: Utc::now(),
        sequence: 0,
    }
}

pub fn local_runner(name: &str, max_concurrent_jobs: u32) -> Runner {
    runner(name, local_backend(), max_concurrent_jobs)
}

pub fn local_runner_with(name: &str, config: LocalBackendConfig) -> Runner {
    runner(name, RunnerBackend::Local(config), 1)
}

pub fn docker_runner(name: &str, max_concurrent_jobs: u32) -> Runner {
    let backend = RunnerBackend::Docker(DockerBackendConfig {
        image: "alpine:3".to_string(),
        command: Vec::new(),
        env: HashMap::new(),
        network_mode: "bridge".to_string(),
        docker_host: None,
    });
    runner(name, backend, max_concurrent_jobs)
}

pub fn rule(name: &str, rule_type: RuleType, priority: i32) -> LoadBalancingRule {
    LoadBalancingRule {
        id: Uuid::new_v4().to_string(),
        name: name.to_string(),
        rule_type,
        suite_pattern: None,
        env_pattern: None,
        runner_type: None,
        priority,
        active: true,
        sequence: 0,
    }
}

pub fn allocation(id: &str, execution_id: &str, runner_id: &str) -> ResourceAllocation {
    ResourceAllocation {
        id: id.to_string(),
        execution_id: execution_id.to_string(),
        runner_id: runner_id.to_string(),
        cpu_percent: 10.0,
        memory_mb: 256,
        status: AllocationStatus::Allocated,
        allocated_at: Utc::now(),
        released_at: None,
    }
}

pub fn manager() -> (ResourceManager, Store) {
    let store = Store::new();
    let manager = ResourceManager::new(store.clone(), ResourceConfig::default(), EventSender::disabled());
    (manager, store)
}

pub fn manager_with_events() -> (ResourceManager, Store, EventReceiver) {
    let store = Store::new();
    let (tx, rx) = events::channel();
    let manager = ResourceManager::new(store.clone(), ResourceConfig::default(), tx);
    (manager, store, rx)
}

pub fn scheduler_with(invoker: Arc<dyn Invoker>) -> (ExecutionScheduler, RunnerRegistry, Store) {
    let store = Store::new();
    let registry = RunnerRegistry::new(store.clone());
    let resources = ResourceManager::new(store.clone(), ResourceConfig::default(), EventSender::disabled());
    let scheduler = ExecutionScheduler::new(
        store.clone(),
        registry.clone(),
        resources,
        invoker,
        EventSender::disabled(),
        ConvoyConfig::default(),
    );
    (scheduler, registry, store)
}

pub fn coordinator_with(invoker: Arc<dyn Invoker>) -> (ParallelCoordinator, RunnerRegistry, Store) {
    let (scheduler, registry, store) = scheduler_with(invoker);
    let coordinator = ParallelCoordinator::new(
        store.clone(),
        scheduler,
        EventSender::disabled(),
        ParallelConfig::default(),
    );
    (coordinator, registry, store)
}

/// Records every trigger; fails for runners named in `failing`.
#[derive(Default)]
pub struct MockInvoker {
    triggered: Mutex<Vec<(String, InvocationPayload)>>,
    failing: Vec<String>,
}

impl MockInvoker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_for(names: &[&str]) -> Self {
        Self {
            triggered: Mutex::default(),
            failing: names.iter().map(|n| n.to_string()).collect(),
        }
    }

    /// `(runner id, payload)` for every successful trigger, in order.
    pub fn triggered(&self) -> Vec<(String, InvocationPayload)> {
        self.triggered.lock().unwrap().clone()
    }
}

#[async_trait]
impl Invoker for MockInvoker {
    async fn trigger(&self, runner: &Runner, payload: &InvocationPayload) -> InvokeResult<()> {
        if self.failing.contains(&runner.name) {
            return Err(InvokeError::Launch(format!("{} refused the job", runner.name)));
        }
        self.triggered
            .lock()
            .unwrap()
            .push((runner.id.clone(), payload.clone()));
        Ok(())
    }
}
