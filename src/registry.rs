//! Runner registry and load balancing rule configuration.
//!
//! The registry answers one question for the scheduler: which runners can
//! take this work right now. A runner is eligible when it is `active`, its
//! health is not `unhealthy`, it satisfies the execution's type/id pin and it
//! has a free job slot. Runners whose health has never been checked
//! (`unknown`) are eligible, so a freshly registered runner is usable before
//! the first probe completes.
//!
//! Health itself is written by an external monitor through
//! [`RunnerRegistry::record_health`], or by driving a [`HealthProbe`] with
//! [`RunnerRegistry::probe_all`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::balancer::RulePattern;
use crate::config::schema::{default_max_concurrent_jobs, default_runner_priority};
use crate::config::{RuleConfig, RunnerBackend, RunnerConfig};
use crate::model::{
    Capabilities, Execution, HealthStatus, LoadBalancingRule, RuleType, Runner, RunnerStatus,
    RunnerType,
};
use crate::store::{Store, StoreError};

/// Result type for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("invalid runner: {0}")]
    InvalidRunner(String),

    #[error("invalid rule {name}: pattern {pattern:?}: {source}")]
    InvalidPattern {
        name: String,
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("invalid rule: {0}")]
    InvalidRule(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Registration request for a runner.
///
/// Unset fields take the usual defaults: 5 job slots, priority 50 and
/// 400% CPU / 16384 MB of capacity.
#[derive(Debug, Clone)]
pub struct RunnerSpec {
    pub name: String,
    pub backend: RunnerBackend,
    pub max_concurrent_jobs: Option<u32>,
    pub priority: Option<i32>,
    pub capabilities: Option<Capabilities>,
    pub health_check_url: Option<String>,
}

impl RunnerSpec {
    pub fn new(name: impl Into<String>, backend: RunnerBackend) -> Self {
        Self {
            name: name.into(),
            backend,
            max_concurrent_jobs: None,
            priority: None,
            capabilities: None,
            health_check_url: None,
        }
    }

    pub fn max_concurrent_jobs(mut self, jobs: u32) -> Self {
        self.max_concurrent_jobs = Some(jobs);
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = Some(capabilities);
        self
    }

    pub fn health_check_url(mut self, url: impl Into<String>) -> Self {
        self.health_check_url = Some(url.into());
        self
    }
}

impl From<&RunnerConfig> for RunnerSpec {
    fn from(config: &RunnerConfig) -> Self {
        Self {
            name: config.name.clone(),
            backend: config.backend.clone(),
            max_concurrent_jobs: Some(config.max_concurrent_jobs),
            priority: Some(config.priority),
            capabilities: Some(config.capabilities),
            health_check_url: config.health_check_url.clone(),
        }
    }
}

/// Configuration request for a load balancing rule.
#[derive(Debug, Clone)]
pub struct RuleSpec {
    pub name: String,
    pub rule_type: RuleType,
    pub suite_pattern: Option<String>,
    pub env_pattern: Option<String>,
    pub runner_type: Option<RunnerType>,
    pub priority: Option<i32>,
    pub active: bool,
}

impl RuleSpec {
    pub fn new(name: impl Into<String>, rule_type: RuleType) -> Self {
        Self {
            name: name.into(),
            rule_type,
            suite_pattern: None,
            env_pattern: None,
            runner_type: None,
            priority: None,
            active: true,
        }
    }

    pub fn suite_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.suite_pattern = Some(pattern.into());
        self
    }

    pub fn env_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.env_pattern = Some(pattern.into());
        self
    }

    pub fn runner_type(mut self, runner_type: RunnerType) -> Self {
        self.runner_type = Some(runner_type);
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }
}

impl From<&RuleConfig> for RuleSpec {
    fn from(config: &RuleConfig) -> Self {
        Self {
            name: config.name.clone(),
            rule_type: config.rule_type,
            suite_pattern: config.suite_pattern.clone(),
            env_pattern: config.env_pattern.clone(),
            runner_type: config.runner_type,
            priority: Some(config.priority),
            active: config.active,
        }
    }
}

/// Outcome of one health probe.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub response_time_ms: Option<u64>,
    pub error: Option<String>,
}

impl HealthReport {
    pub fn healthy(response_time_ms: u64) -> Self {
        Self {
            status: HealthStatus::Healthy,
            response_time_ms: Some(response_time_ms),
            error: None,
        }
    }

    pub fn unhealthy(error: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Unhealthy,
            response_time_ms: None,
            error: Some(error.into()),
        }
    }
}

/// Checks whether a runner is reachable.
///
/// How a runner is probed (HTTP, vendor API, `docker ping`) is up to the
/// implementation; the registry only stores the outcome.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, runner: &Runner) -> HealthReport;
}

/// Known runners and the rules used to choose among them.
#[derive(Clone)]
pub struct RunnerRegistry {
    store: Store,
}

impl RunnerRegistry {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Registers a runner and returns its id.
    ///
    /// New runners start `active` with `unknown` health and no jobs.
    pub async fn register(&self, spec: RunnerSpec) -> RegistryResult<String> {
        if spec.name.trim().is_empty() {
            return Err(RegistryError::InvalidRunner("name must not be empty".into()));
        }
        let max_concurrent_jobs = spec
            .max_concurrent_jobs
            .unwrap_or_else(default_max_concurrent_jobs);
        if max_concurrent_jobs == 0 {
            return Err(RegistryError::InvalidRunner(format!(
                "{}: max_concurrent_jobs must be at least 1",
                spec.name
            )));
        }
        let capabilities = spec.capabilities.unwrap_or_default();
        if capabilities.max_cpu_percent <= 0.0 || capabilities.max_memory_mb == 0 {
            return Err(RegistryError::InvalidRunner(format!(
                "{}: capabilities must be positive",
                spec.name
            )));
        }

        let runner = Runner {
            id: Uuid::new_v4().to_string(),
            name: spec.name,
            backend: spec.backend,
            status: RunnerStatus::Active,
            health: HealthStatus::Unknown,
            last_health_check: None,
            health_response_ms: None,
            health_error: None,
            max_concurrent_jobs,
            current_jobs: 0,
            priority: spec.priority.unwrap_or_else(default_runner_priority),
            capabilities,
            health_check_url: spec.health_check_url,
            registered_at: Utc::now(),
            sequence: 0,
        };
        let runner = self.store.insert_runner(runner).await?;

        info!(
            runner_id = %runner.id,
            name = %runner.name,
            runner_type = %runner.runner_type(),
            max_jobs = runner.max_concurrent_jobs,
            "Registered runner"
        );
        Ok(runner.id)
    }

    /// Stores a load balancing rule and returns its id.
    ///
    /// Patterns are compiled here so a broken rule is rejected up front
    /// instead of silently never matching.
    pub async fn configure_rule(&self, spec: RuleSpec) -> RegistryResult<String> {
        if spec.name.trim().is_empty() {
            return Err(RegistryError::InvalidRule("name must not be empty".into()));
        }
        for pattern in [&spec.suite_pattern, &spec.env_pattern].into_iter().flatten() {
            RulePattern::parse(pattern).map_err(|source| RegistryError::InvalidPattern {
                name: spec.name.clone(),
                pattern: pattern.clone(),
                source,
            })?;
        }

        let rule = LoadBalancingRule {
            id: Uuid::new_v4().to_string(),
            name: spec.name,
            rule_type: spec.rule_type,
            suite_pattern: spec.suite_pattern,
            env_pattern: spec.env_pattern,
            runner_type: spec.runner_type,
            priority: spec.priority.unwrap_or(0),
            active: spec.active,
            sequence: 0,
        };
        let rule = self.store.insert_rule(rule).await?;
        info!(rule_id = %rule.id, name = %rule.name, "Configured load balancing rule");
        Ok(rule.id)
    }

    pub async fn rules(&self) -> Vec<LoadBalancingRule> {
        self.store.list_rules().await
    }

    pub async fn get(&self, runner_id: &str) -> Option<Runner> {
        self.store.get_runner(runner_id).await
    }

    /// All runners in registration order.
    pub async fn list(&self) -> Vec<Runner> {
        self.store.list_runners().await
    }

    /// Runners that can accept `execution` now, in registration order.
    pub async fn eligible_runners(&self, execution: &Execution) -> Vec<Runner> {
        self.store
            .list_runners()
            .await
            .into_iter()
            .filter(|r| accepts_work(r) && execution.accepts_runner(r))
            .collect()
    }

    /// Runners that can accept a shard now, optionally of one type.
    pub async fn available_runners(&self, runner_type: Option<RunnerType>) -> Vec<Runner> {
        self.store
            .list_runners()
            .await
            .into_iter()
            .filter(|r| accepts_work(r) && runner_type.is_none_or(|t| t == r.runner_type()))
            .collect()
    }

    /// Stores the outcome of a health check.
    pub async fn record_health(
        &self,
        runner_id: &str,
        report: HealthReport,
        checked_at: DateTime<Utc>,
    ) -> RegistryResult<()> {
        if report.status == HealthStatus::Unhealthy {
            warn!(
                runner_id = %runner_id,
                error = report.error.as_deref().unwrap_or("unknown"),
                "Runner unhealthy"
            );
        }
        self.store
            .set_runner_health(
                runner_id,
                report.status,
                report.response_time_ms,
                report.error,
                checked_at,
            )
            .await?;
        Ok(())
    }

    /// Probes every registered runner concurrently and records the results.
    pub async fn probe_all(&self, probe: &dyn HealthProbe) -> Vec<(String, HealthReport)> {
        let runners = self.store.list_runners().await;
        let reports = join_all(runners.iter().map(|r| probe.probe(r))).await;

        let checked_at = Utc::now();
        let mut results = Vec::with_capacity(runners.len());
        for (runner, report) in runners.into_iter().zip(reports) {
            if let Err(e) = self.record_health(&runner.id, report.clone(), checked_at).await {
                debug!(runner_id = %runner.id, error = %e, "could not record health");
                continue;
            }
            results.push((runner.id, report));
        }
        results
    }

    pub async fn set_status(&self, runner_id: &str, status: RunnerStatus) -> RegistryResult<()> {
        self.store.set_runner_status(runner_id, status).await?;
        info!(runner_id = %runner_id, status = ?status, "Runner status changed");
        Ok(())
    }
}

fn accepts_work(runner: &Runner) -> bool {
    runner.status == RunnerStatus::Active
        && runner.health != HealthStatus::Unhealthy
        && runner.has_free_slot()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{allocation, execution, local_backend};

    async fn registry_with(names: &[&str]) -> (RunnerRegistry, Vec<String>) {
        let registry = RunnerRegistry::new(Store::new());
        let mut ids = Vec::new();
        for name in names {
            ids.push(
                registry
                    .register(RunnerSpec::new(*name, local_backend()).max_concurrent_jobs(1))
                    .await
                    .unwrap(),
            );
        }
        (registry, ids)
    }

    #[tokio::test]
    async fn test_register_applies_defaults() {
        let registry = RunnerRegistry::new(Store::new());
        let id = registry
            .register(RunnerSpec::new("r1", local_backend()))
            .await
            .unwrap();

        let runner = registry.get(&id).await.unwrap();
        assert_eq!(runner.max_concurrent_jobs, 5);
        assert_eq!(runner.priority, 50);
        assert_eq!(runner.capabilities.max_cpu_percent, 400.0);
        assert_eq!(runner.capabilities.max_memory_mb, 16_384);
        assert_eq!(runner.status, RunnerStatus::Active);
        assert_eq!(runner.health, HealthStatus::Unknown);
    }

    #[tokio::test]
    async fn test_register_rejects_zero_slots_and_duplicates() {
        let registry = RunnerRegistry::new(Store::new());
        let err = registry
            .register(RunnerSpec::new("r1", local_backend()).max_concurrent_jobs(0))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidRunner(_)));

        registry
            .register(RunnerSpec::new("r1", local_backend()))
            .await
            .unwrap();
        let err = registry
            .register(RunnerSpec::new("r1", local_backend()))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Store(StoreError::AlreadyExists { .. })));
    }

    #[tokio::test]
    async fn test_unknown_health_is_eligible_unhealthy_is_not() {
        let (registry, ids) = registry_with(&["fresh", "sick", "well"]).await;
        let now = Utc::now();
        registry
            .record_health(&ids[1], HealthReport::unhealthy("connection refused"), now)
            .await
            .unwrap();
        registry
            .record_health(&ids[2], HealthReport::healthy(12), now)
            .await
            .unwrap();

        let exec = execution("unit", 50);
        let eligible: Vec<String> = registry
            .eligible_runners(&exec)
            .await
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(eligible, vec![ids[0].clone(), ids[2].clone()]);
    }

    #[tokio::test]
    async fn test_eligibility_honors_pins_status_and_slots() {
        let (registry, ids) = registry_with(&["a", "b", "c"]).await;
        registry.set_status(&ids[0], RunnerStatus::Inactive).await.unwrap();
        registry
            .store
            .claim_allocation(allocation("a1", "e1", &ids[1]))
            .await
            .unwrap();

        let exec = execution("unit", 50);
        let eligible = registry.eligible_runners(&exec).await;
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].id, ids[2]);

        let mut pinned = execution("unit", 50);
        pinned.requested_runner_id = Some(ids[1].clone());
        assert!(registry.eligible_runners(&pinned).await.is_empty());

        let mut docker_only = execution("unit", 50);
        docker_only.requested_runner_type = Some(RunnerType::Docker);
        assert!(registry.eligible_runners(&docker_only).await.is_empty());
        assert!(registry.available_runners(Some(RunnerType::Docker)).await.is_empty());
        assert_eq!(registry.available_runners(Some(RunnerType::Local)).await.len(), 1);
    }

    #[tokio::test]
    async fn test_configure_rule_validates_patterns() {
        let registry = RunnerRegistry::new(Store::new());
        let err = registry
            .configure_rule(RuleSpec::new("bad", RuleType::Custom).suite_pattern("regex:[z-a]"))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidPattern { .. }));

        registry
            .configure_rule(
                RuleSpec::new("ui", RuleType::ResourceBased)
                    .suite_pattern("ui-*")
                    .priority(10),
            )
            .await
            .unwrap();
        let rules = registry.rules().await;
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].priority, 10);
        assert!(rules[0].active);
    }

    struct FlakyProbe;

    #[async_trait]
    impl HealthProbe for FlakyProbe {
        async fn probe(&self, runner: &Runner) -> HealthReport {
            if runner.name == "down" {
                HealthReport::unhealthy("timeout")
            } else {
                HealthReport::healthy(5)
            }
        }
    }

    #[tokio::test]
    async fn test_probe_all_records_every_runner() {
        let (registry, ids) = registry_with(&["up", "down"]).await;
        let results = registry.probe_all(&FlakyProbe).await;
        assert_eq!(results.len(), 2);

        let up = registry.get(&ids[0]).await.unwrap();
        assert_eq!(up.health, HealthStatus::Healthy);
        assert_eq!(up.health_response_ms, Some(5));
        assert!(up.last_health_check.is_some());

        let down = registry.get(&ids[1]).await.unwrap();
        assert_eq!(down.health, HealthStatus::Unhealthy);
        assert_eq!(down.health_error.as_deref(), Some("timeout"));
    }
}
