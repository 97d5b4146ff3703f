//! Execution scheduler: the queue and its placement loop.
//!
//! # Lifecycle
//!
//! 1. [`submit`](ExecutionScheduler::submit) validates a request and stores
//!    it as `queued` with a timeout deadline of
//!    `max(estimated × timeout_multiplier, timeout_floor)` from now.
//! 2. Each [`scheduling_pass`](ExecutionScheduler::scheduling_pass) walks the
//!    queue by `(priority desc, enqueue time asc)`. For every item it asks the
//!    registry for eligible runners, drops runners without the capacity the
//!    item needs, lets the balancer pick one, claims an allocation and moves
//!    the item to `assigned`. The runner invocation is spawned; the pass
//!    moves straight on to the next item.
//! 3. A runner reports `started` (`assigned → running`) and later a
//!    completion (`→ completed | failed`), which releases the allocation.
//! 4. [`timeout_sweep`](ExecutionScheduler::timeout_sweep) forces anything
//!    still active past its deadline to `timeout`.
//!
//! Items nobody can take stay `queued` and are retried every pass without
//! backoff; their own deadline eventually times them out. An invocation that
//! can't be issued fails its item immediately and is never retried.
//!
//! Timing out does not stop a runner that is still working. A late
//! completion for a timed-out item is acknowledged and ignored.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::balancer::{CompiledRule, LoadBalancer};
use crate::config::ConvoyConfig;
use crate::events::{Event, EventSender};
use crate::invoker::{CompletionReport, InvocationPayload, Invoker};
use crate::model::{
    Execution, ExecutionStatus, HealthStatus, ResourceAllocation, Runner,
    RunnerStatus, SubmitRequest,
};
use crate::registry::RunnerRegistry;
use crate::resources::{Requirement, ResourceManager, RunnerUsage, can_allocate};
use crate::store::{Store, StoreError, StoreResult};

/// Result type for scheduler operations.
pub type SchedulerResult<T> = Result<T, SchedulerError>;

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// The submission was malformed.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What one scheduling pass did.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PassReport {
    /// `(execution id, runner id)` for every placement.
    pub assigned: Vec<(String, String)>,
    /// Executions left queued for lack of a runner.
    pub deferred: Vec<String>,
    /// Executions whose placement bookkeeping failed.
    pub failed: Vec<String>,
}

/// How a completion callback was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CompletionOutcome {
    /// The terminal status was recorded and resources released.
    Recorded,
    /// The item was already terminal; nothing changed.
    AlreadyFinished,
    /// The item is still queued and can't be completed.
    NotStarted,
    /// No execution has this id.
    Unknown,
}

/// Executions per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueDepth {
    pub queued: usize,
    pub assigned: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub timeout: usize,
}

impl QueueDepth {
    /// Executions not yet terminal.
    pub fn active(&self) -> usize {
        self.queued + self.assigned + self.running
    }
}

/// Aggregate runner capacity and utilization.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CapacitySummary {
    pub total_runners: usize,
    pub active_runners: usize,
    pub healthy_runners: usize,
    pub total_slots: u32,
    pub used_slots: u32,
    pub total_cpu_percent: f64,
    pub allocated_cpu_percent: f64,
    pub total_memory_mb: u64,
    pub allocated_memory_mb: u64,
}

impl CapacitySummary {
    pub fn slot_utilization(&self) -> f64 {
        if self.total_slots == 0 {
            return 0.0;
        }
        f64::from(self.used_slots) / f64::from(self.total_slots)
    }
}

/// Filter and window for [`ExecutionScheduler::history`].
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryFilter {
    pub status: Option<ExecutionStatus>,
    pub test_suite: Option<String>,
    pub environment: Option<String>,
    pub offset: usize,
    pub limit: usize,
}

impl Default for HistoryFilter {
    fn default() -> Self {
        Self {
            status: None,
            test_suite: None,
            environment: None,
            offset: 0,
            limit: 50,
        }
    }
}

/// One page of results.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Matches before pagination.
    pub total: usize,
    pub offset: usize,
    pub limit: usize,
}

/// The execution queue and its placement, timeout and completion logic.
///
/// Cloning is cheap; clones share state and in-flight invocations.
#[derive(Clone)]
pub struct ExecutionScheduler {
    store: Store,
    registry: RunnerRegistry,
    resources: ResourceManager,
    balancer: LoadBalancer,
    invoker: Arc<dyn Invoker>,
    events: EventSender,
    config: ConvoyConfig,
    in_flight: Arc<Mutex<JoinSet<()>>>,
}

impl ExecutionScheduler {
    pub fn new(
        store: Store,
        registry: RunnerRegistry,
        resources: ResourceManager,
        invoker: Arc<dyn Invoker>,
        events: EventSender,
        config: ConvoyConfig,
    ) -> Self {
        Self {
            store,
            registry,
            resources,
            balancer: LoadBalancer::new(),
            invoker,
            events,
            config,
            in_flight: Arc::new(Mutex::new(JoinSet::new())),
        }
    }

    /// Enqueues a request and returns the new execution id.
    pub async fn submit(&self, request: SubmitRequest) -> SchedulerResult<String> {
        self.submit_at(request, Utc::now()).await
    }

    pub async fn submit_at(&self, request: SubmitRequest, now: DateTime<Utc>) -> SchedulerResult<String> {
        if request.test_suite.trim().is_empty() {
            return Err(SchedulerError::InvalidRequest("test_suite is required".into()));
        }
        if request.environment.trim().is_empty() {
            return Err(SchedulerError::InvalidRequest("environment is required".into()));
        }

        let execution = Execution {
            id: Uuid::new_v4().to_string(),
            priority: request.priority.unwrap_or(self.config.default_priority),
            timeout_at: now + self.timeout_for(request.estimated_duration_secs),
            test_suite: request.test_suite,
            environment: request.environment,
            requested_runner_type: request.requested_runner_type,
            requested_runner_id: request.requested_runner_id,
            estimated_duration_secs: request.estimated_duration_secs,
            metadata: request.metadata,
            status: ExecutionStatus::Queued,
            runner_id: None,
            queued_at: now,
            assigned_at: None,
            started_at: None,
            completed_at: None,
            results: None,
            error_message: None,
            sequence: 0,
        };
        let execution = self.store.insert_execution(execution).await?;

        info!(
            execution_id = %execution.id,
            suite = %execution.test_suite,
            environment = %execution.environment,
            priority = execution.priority,
            "Queued execution"
        );
        let id = execution.id.clone();
        self.events.emit(Event::ExecutionQueued(execution));
        Ok(id)
    }

    /// `max(estimated × multiplier, floor)`; the floor alone when no estimate is given.
    fn timeout_for(&self, estimated_secs: Option<u64>) -> Duration {
        let floor = self.config.timeout_floor_secs;
        let scaled = estimated_secs
            .map(|secs| (secs as f64 * self.config.timeout_multiplier).ceil() as u64)
            .unwrap_or(0);
        Duration::seconds(i64::try_from(scaled.max(floor)).unwrap_or(i64::MAX))
    }

    /// Places as many queued executions as capacity allows.
    ///
    /// Per-item problems are logged and recorded in the report; they never
    /// abort the pass.
    pub async fn scheduling_pass(&self) -> SchedulerResult<PassReport> {
        let queued = self.store.queued_executions().await;
        let mut report = PassReport::default();
        if queued.is_empty() {
            return Ok(report);
        }

        let rules = CompiledRule::compile_all(&self.registry.rules().await);
        let mut usage = self.resources.usage().await;

        for execution in queued {
            match self.place(&execution, &rules, &mut usage).await {
                Ok(Some(runner_id)) => report.assigned.push((execution.id, runner_id)),
                Ok(None) => report.deferred.push(execution.id),
                Err(e) => {
                    warn!(execution_id = %execution.id, error = %e, "Placement failed");
                    report.failed.push(execution.id);
                }
            }
        }

        if !report.assigned.is_empty() || !report.failed.is_empty() {
            info!(
                assigned = report.assigned.len(),
                deferred = report.deferred.len(),
                failed = report.failed.len(),
                "Scheduling pass"
            );
        }
        Ok(report)
    }

    /// Tries to place one execution. Returns the runner id on success.
    async fn place(
        &self,
        execution: &Execution,
        rules: &[CompiledRule],
        usage: &mut HashMap<String, RunnerUsage>,
    ) -> StoreResult<Option<String>> {
        let mut fitting = Vec::new();
        let mut requirements = HashMap::new();
        for runner in self.registry.eligible_runners(execution).await {
            if let Some(req) = self.fits(&runner, &execution.test_suite, &execution.metadata, usage) {
                requirements.insert(runner.id.clone(), req);
                fitting.push(runner);
            }
        }

        let Some(runner) = self.balancer.select(&fitting, execution, rules, usage) else {
            debug!(execution_id = %execution.id, "no runner available, deferring");
            return Ok(None);
        };
        let requirement = requirements[&runner.id];

        let Some(allocation) = self.resources.allocate(&execution.id, &runner, &requirement).await? else {
            return Ok(None);
        };

        let now = Utc::now();
        let assigned = self
            .store
            .transition_execution(&execution.id, &[ExecutionStatus::Queued], ExecutionStatus::Assigned, |e| {
                e.runner_id = Some(runner.id.clone());
                e.assigned_at = Some(now);
            })
            .await?;
        let Some(assigned) = assigned else {
            // Another tick moved it first; give the claim back.
            self.store.release_allocation(&allocation.id, now).await?;
            return Ok(None);
        };

        usage.entry(runner.id.clone()).or_default().add(&allocation);
        info!(
            execution_id = %assigned.id,
            runner = %runner.name,
            cpu = allocation.cpu_percent,
            memory_mb = allocation.memory_mb,
            "Assigned execution"
        );
        self.events.emit(Event::ExecutionAssigned(assigned.clone()));
        self.spawn_invocation(runner.clone(), self.payload(&assigned, &allocation));

        Ok(Some(runner.id))
    }

    /// The requirement for a work item on `runner`, if the runner has room for it.
    pub(crate) fn fits(
        &self,
        runner: &Runner,
        test_suite: &str,
        metadata: &BTreeMap<String, serde_json::Value>,
        usage: &HashMap<String, RunnerUsage>,
    ) -> Option<Requirement> {
        let requirement = self.resources.compute_requirement(test_suite, metadata, runner);
        let available = self.resources.available_capacity(runner, usage);
        can_allocate(&available, &requirement).then_some(requirement)
    }

    /// Claims capacity on `runner` for a work item other than a queued
    /// execution (a shard). Returns `None` if the runner lacks room.
    pub async fn reserve(
        &self,
        owner_id: &str,
        test_suite: &str,
        metadata: &BTreeMap<String, serde_json::Value>,
        runner: &Runner,
        usage: &HashMap<String, RunnerUsage>,
    ) -> StoreResult<Option<ResourceAllocation>> {
        let Some(requirement) = self.fits(runner, test_suite, metadata, usage) else {
            return Ok(None);
        };
        self.resources.allocate(owner_id, runner, &requirement).await
    }

    pub(crate) fn callback_address(&self) -> &str {
        &self.config.callback_address
    }

    pub(crate) fn invoker(&self) -> &Arc<dyn Invoker> {
        &self.invoker
    }

    pub(crate) fn resources(&self) -> &ResourceManager {
        &self.resources
    }

    pub(crate) fn registry(&self) -> &RunnerRegistry {
        &self.registry
    }

    fn payload(&self, execution: &Execution, allocation: &ResourceAllocation) -> InvocationPayload {
        InvocationPayload::new(
            &execution.id,
            &execution.test_suite,
            &execution.environment,
            &self.config.callback_address,
        )
        .resources(allocation.cpu_percent, allocation.memory_mb)
        .metadata(execution.metadata.clone())
    }

    fn spawn_invocation(&self, runner: Runner, payload: InvocationPayload) {
        let scheduler = self.clone();
        let task = async move {
            if let Err(e) = scheduler.invoker.trigger(&runner, &payload).await {
                warn!(
                    execution_id = %payload.execution_id,
                    runner = %runner.name,
                    error = %e,
                    "Invocation failed"
                );
                if let Err(e) = scheduler
                    .fail_invocation(&payload.execution_id, e.to_string())
                    .await
                {
                    warn!(execution_id = %payload.execution_id, error = %e, "could not record invocation failure");
                }
            }
        };

        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        while in_flight.try_join_next().is_some() {}
        in_flight.spawn(task);
    }

    async fn fail_invocation(&self, execution_id: &str, error: String) -> StoreResult<()> {
        let now = Utc::now();
        let failed = self
            .store
            .transition_execution(execution_id, &[ExecutionStatus::Assigned], ExecutionStatus::Failed, |e| {
                e.completed_at = Some(now);
                e.error_message = Some(error);
            })
            .await?;
        if let Some(failed) = failed {
            self.resources.release_at(execution_id, now).await?;
            self.events.emit(Event::ExecutionFinished(failed));
        }
        Ok(())
    }

    /// Waits for every invocation spawned so far to return.
    pub async fn drain_invocations(&self) {
        let mut pending = {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *in_flight)
        };
        while pending.join_next().await.is_some() {}
    }

    pub async fn timeout_sweep(&self) -> SchedulerResult<Vec<String>> {
        self.timeout_sweep_at(Utc::now()).await
    }

    /// Forces every active execution whose deadline is at or before `now` to
    /// `timeout` and releases its allocation. Returns the timed-out ids.
    pub async fn timeout_sweep_at(&self, now: DateTime<Utc>) -> SchedulerResult<Vec<String>> {
        let mut timed_out = Vec::new();
        for execution in self.store.executions_with_status(&ExecutionStatus::ACTIVE).await {
            if execution.timeout_at > now {
                continue;
            }
            let was = execution.status;
            let updated = self
                .store
                .transition_execution(&execution.id, &ExecutionStatus::ACTIVE, ExecutionStatus::Timeout, |e| {
                    e.completed_at = Some(now);
                    e.error_message = Some(format!("no completion report before deadline {}", e.timeout_at));
                })
                .await?;
            let Some(updated) = updated else {
                continue;
            };

            self.resources.release_at(&execution.id, now).await?;
            warn!(
                execution_id = %execution.id,
                previous = %was,
                runner_id = execution.runner_id.as_deref().unwrap_or("-"),
                "Execution timed out"
            );
            self.events.emit(Event::ExecutionFinished(updated));
            timed_out.push(execution.id);
        }
        Ok(timed_out)
    }

    /// Records that a runner began work on an assigned execution.
    ///
    /// Returns `false` if the execution is unknown or not `assigned`.
    pub async fn report_started(&self, execution_id: &str) -> SchedulerResult<bool> {
        let now = Utc::now();
        let result = self
            .store
            .transition_execution(execution_id, &[ExecutionStatus::Assigned], ExecutionStatus::Running, |e| {
                e.started_at = Some(now);
            })
            .await;
        match result {
            Ok(updated) => {
                if updated.is_some() {
                    debug!(execution_id = %execution_id, "execution running");
                }
                Ok(updated.is_some())
            }
            Err(StoreError::NotFound { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Records a terminal report from a runner.
    ///
    /// Safe to call any number of times: only the first report for an
    /// active execution changes anything, and resources are released once.
    /// Runners that skip the started callback may complete straight from
    /// `assigned`.
    pub async fn report_completion(&self, report: CompletionReport) -> SchedulerResult<CompletionOutcome> {
        let Some(current) = self.store.get_execution(&report.id).await else {
            debug!(id = %report.id, "completion for unknown execution");
            return Ok(CompletionOutcome::Unknown);
        };
        if current.status.is_terminal() {
            debug!(execution_id = %report.id, status = %current.status, "duplicate completion ignored");
            return Ok(CompletionOutcome::AlreadyFinished);
        }
        if current.status == ExecutionStatus::Queued {
            return Ok(CompletionOutcome::NotStarted);
        }

        let now = Utc::now();
        let status = report.status.execution_status();
        let updated = self
            .store
            .transition_execution(
                &report.id,
                &[ExecutionStatus::Assigned, ExecutionStatus::Running],
                status,
                |e| {
                    e.completed_at = Some(now);
                    e.started_at.get_or_insert(now);
                    e.results = report.results;
                    e.error_message = report.error_message;
                },
            )
            .await?;
        let Some(updated) = updated else {
            return Ok(CompletionOutcome::AlreadyFinished);
        };

        self.resources.release_at(&updated.id, now).await?;
        info!(
            execution_id = %updated.id,
            status = %updated.status,
            passed = updated.results.as_ref().map(|r| r.passed),
            failed = updated.results.as_ref().map(|r| r.failed),
            "Execution finished"
        );
        self.events.emit(Event::ExecutionFinished(updated));
        Ok(CompletionOutcome::Recorded)
    }

    pub async fn execution(&self, id: &str) -> Option<Execution> {
        self.store.get_execution(id).await
    }

    pub async fn queue_depth(&self) -> QueueDepth {
        let mut depth = QueueDepth::default();
        for execution in self.store.list_executions().await {
            match execution.status {
                ExecutionStatus::Queued => depth.queued += 1,
                ExecutionStatus::Assigned => depth.assigned += 1,
                ExecutionStatus::Running => depth.running += 1,
                ExecutionStatus::Completed => depth.completed += 1,
                ExecutionStatus::Failed => depth.failed += 1,
                ExecutionStatus::Timeout => depth.timeout += 1,
            }
        }
        depth
    }

    pub async fn capacity_summary(&self) -> CapacitySummary {
        let runners = self.registry.list().await;
        let usage = self.resources.usage().await;

        let mut summary = CapacitySummary {
            total_runners: runners.len(),
            ..Default::default()
        };
        for runner in &runners {
            if runner.status == RunnerStatus::Active {
                summary.active_runners += 1;
                summary.total_slots += runner.max_concurrent_jobs;
                summary.total_cpu_percent += runner.capabilities.max_cpu_percent;
                summary.total_memory_mb += runner.capabilities.max_memory_mb;
            }
            if runner.health == HealthStatus::Healthy {
                summary.healthy_runners += 1;
            }
            summary.used_slots += runner.current_jobs;
            if let Some(used) = usage.get(&runner.id) {
                summary.allocated_cpu_percent += used.cpu_percent;
                summary.allocated_memory_mb += used.memory_mb;
            }
        }
        summary
    }

    /// Executions matching `filter`, newest first.
    pub async fn history(&self, filter: &HistoryFilter) -> Page<Execution> {
        let mut matching: Vec<Execution> = self
            .store
            .list_executions()
            .await
            .into_iter()
            .filter(|e| filter.status.is_none_or(|s| s == e.status))
            .filter(|e| filter.test_suite.as_deref().is_none_or(|s| s == e.test_suite))
            .filter(|e| filter.environment.as_deref().is_none_or(|env| env == e.environment))
            .collect();
        matching.reverse();

        let total = matching.len();
        let items = matching
            .into_iter()
            .skip(filter.offset)
            .take(filter.limit)
            .collect();
        Page {
            items,
            total,
            offset: filter.offset,
            limit: filter.limit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invoker::CompletionReport;
    use crate::model::{ReportedStatus, TestResults};
    use crate::registry::RunnerSpec;
    use crate::test_support::{MockInvoker, local_backend, scheduler_with};

    #[tokio::test]
    async fn test_submit_defaults_and_validation() {
        let (scheduler, _, _) = scheduler_with(Arc::new(MockInvoker::new()));
        let now = Utc::now();

        let id = scheduler
            .submit_at(SubmitRequest::new("unit", "ci"), now)
            .await
            .unwrap();
        let exec = scheduler.execution(&id).await.unwrap();
        assert_eq!(exec.status, ExecutionStatus::Queued);
        assert_eq!(exec.priority, 50);
        assert_eq!(exec.timeout_at, now + Duration::seconds(1800));

        // 3600 × 1.3 = 4680 beats the floor.
        let long = scheduler
            .submit_at(SubmitRequest::new("e2e", "ci").estimated_duration_secs(3600), now)
            .await
            .unwrap();
        let long = scheduler.execution(&long).await.unwrap();
        assert_eq!(long.timeout_at, now + Duration::seconds(4680));

        let err = scheduler.submit(SubmitRequest::new("", "ci")).await.unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidRequest(_)));
        let err = scheduler.submit(SubmitRequest::new("unit", " ")).await.unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_higher_priority_is_placed_first() {
        let invoker = Arc::new(MockInvoker::new());
        let (scheduler, registry, _) = scheduler_with(invoker.clone());
        registry
            .register(RunnerSpec::new("solo", local_backend()).max_concurrent_jobs(1))
            .await
            .unwrap();

        let normal = scheduler
            .submit(SubmitRequest::new("unit", "ci").priority(50))
            .await
            .unwrap();
        let urgent = scheduler
            .submit(SubmitRequest::new("unit", "ci").priority(90))
            .await
            .unwrap();

        let report = scheduler.scheduling_pass().await.unwrap();
        assert_eq!(report.assigned.len(), 1);
        assert_eq!(report.assigned[0].0, urgent);
        assert_eq!(report.deferred, vec![normal.clone()]);

        scheduler.drain_invocations().await;
        assert_eq!(invoker.triggered()[0].1.execution_id, urgent);
        assert_eq!(
            scheduler.execution(&normal).await.unwrap().status,
            ExecutionStatus::Queued
        );
    }

    #[tokio::test]
    async fn test_slot_limit_holds_third_item_until_completion() {
        let (scheduler, registry, store) = scheduler_with(Arc::new(MockInvoker::new()));
        let runner_id = registry
            .register(RunnerSpec::new("pair", local_backend()).max_concurrent_jobs(2))
            .await
            .unwrap();

        let a = scheduler.submit(SubmitRequest::new("unit", "ci")).await.unwrap();
        let b = scheduler.submit(SubmitRequest::new("unit", "ci")).await.unwrap();
        let c = scheduler.submit(SubmitRequest::new("unit", "ci")).await.unwrap();

        let report = scheduler.scheduling_pass().await.unwrap();
        assert_eq!(report.assigned.len(), 2);
        for id in [&a, &b] {
            let exec = scheduler.execution(id).await.unwrap();
            assert_eq!(exec.status, ExecutionStatus::Assigned);
            assert_eq!(exec.runner_id.as_deref(), Some(runner_id.as_str()));
        }
        assert_eq!(store.get_runner(&runner_id).await.unwrap().current_jobs, 2);
        assert_eq!(scheduler.execution(&c).await.unwrap().status, ExecutionStatus::Queued);

        // Still full on the next pass.
        let report = scheduler.scheduling_pass().await.unwrap();
        assert!(report.assigned.is_empty());

        scheduler.report_started(&a).await.unwrap();
        scheduler
            .report_completion(CompletionReport::completed(&a, None))
            .await
            .unwrap();
        assert_eq!(store.get_runner(&runner_id).await.unwrap().current_jobs, 1);

        let report = scheduler.scheduling_pass().await.unwrap();
        assert_eq!(report.assigned, vec![(c.clone(), runner_id.clone())]);
        assert_eq!(store.get_runner(&runner_id).await.unwrap().current_jobs, 2);
    }

    #[tokio::test]
    async fn test_timeout_sweep_releases_allocation() {
        let (scheduler, registry, store) = scheduler_with(Arc::new(MockInvoker::new()));
        let runner_id = registry
            .register(RunnerSpec::new("r", local_backend()).max_concurrent_jobs(1))
            .await
            .unwrap();
        let now = Utc::now();
        let id = scheduler
            .submit_at(SubmitRequest::new("unit", "ci").estimated_duration_secs(60), now)
            .await
            .unwrap();
        scheduler.scheduling_pass().await.unwrap();
        scheduler.report_started(&id).await.unwrap();

        // max(60 × 1.3, 1800) = 1800 seconds.
        let early = scheduler
            .timeout_sweep_at(now + Duration::seconds(1799))
            .await
            .unwrap();
        assert!(early.is_empty());

        let swept = scheduler
            .timeout_sweep_at(now + Duration::seconds(1800))
            .await
            .unwrap();
        assert_eq!(swept, vec![id.clone()]);

        let exec = scheduler.execution(&id).await.unwrap();
        assert_eq!(exec.status, ExecutionStatus::Timeout);
        assert!(store.active_allocation_for(&id).await.is_none());
        assert_eq!(store.get_runner(&runner_id).await.unwrap().current_jobs, 0);

        // A late completion doesn't resurrect it.
        let outcome = scheduler
            .report_completion(CompletionReport::completed(&id, None))
            .await
            .unwrap();
        assert_eq!(outcome, CompletionOutcome::AlreadyFinished);
        assert_eq!(scheduler.execution(&id).await.unwrap().status, ExecutionStatus::Timeout);
    }

    #[tokio::test]
    async fn test_duplicate_completion_releases_once() {
        let (scheduler, registry, store) = scheduler_with(Arc::new(MockInvoker::new()));
        let runner_id = registry
            .register(RunnerSpec::new("r", local_backend()).max_concurrent_jobs(3))
            .await
            .unwrap();
        let first = scheduler.submit(SubmitRequest::new("unit", "ci")).await.unwrap();
        let second = scheduler.submit(SubmitRequest::new("unit", "ci")).await.unwrap();
        scheduler.scheduling_pass().await.unwrap();
        scheduler.report_started(&first).await.unwrap();

        let results = TestResults {
            total: 12,
            passed: 12,
            ..Default::default()
        };
        let report = CompletionReport::completed(&first, Some(results.clone()));
        assert_eq!(
            scheduler.report_completion(report.clone()).await.unwrap(),
            CompletionOutcome::Recorded
        );
        assert_eq!(
            scheduler.report_completion(report).await.unwrap(),
            CompletionOutcome::AlreadyFinished
        );

        // Only `first`'s slot came back; `second` still holds one.
        assert_eq!(store.get_runner(&runner_id).await.unwrap().current_jobs, 1);
        assert!(store.active_allocation_for(&second).await.is_some());
        assert_eq!(scheduler.execution(&first).await.unwrap().results, Some(results));

        assert_eq!(
            scheduler
                .report_completion(CompletionReport::completed("nope", None))
                .await
                .unwrap(),
            CompletionOutcome::Unknown
        );
    }

    #[tokio::test]
    async fn test_invocation_failure_fails_only_that_item() {
        let invoker = Arc::new(MockInvoker::failing_for(&["flaky"]));
        let (scheduler, registry, store) = scheduler_with(invoker.clone());
        let flaky = registry
            .register(RunnerSpec::new("flaky", local_backend()).max_concurrent_jobs(1).priority(90))
            .await
            .unwrap();
        registry
            .register(RunnerSpec::new("steady", local_backend()).max_concurrent_jobs(1))
            .await
            .unwrap();

        let doomed = scheduler.submit(SubmitRequest::new("unit", "ci").priority(90)).await.unwrap();
        let fine = scheduler.submit(SubmitRequest::new("unit", "ci")).await.unwrap();

        let report = scheduler.scheduling_pass().await.unwrap();
        assert_eq!(report.assigned.len(), 2);
        scheduler.drain_invocations().await;

        let doomed = scheduler.execution(&doomed).await.unwrap();
        assert_eq!(doomed.status, ExecutionStatus::Failed);
        assert!(doomed.error_message.unwrap().contains("refused"));
        assert_eq!(store.get_runner(&flaky).await.unwrap().current_jobs, 0);

        assert_eq!(scheduler.execution(&fine).await.unwrap().status, ExecutionStatus::Assigned);
        assert_eq!(invoker.triggered().len(), 1);
    }

    #[tokio::test]
    async fn test_completion_from_queued_is_rejected() {
        let (scheduler, _, _) = scheduler_with(Arc::new(MockInvoker::new()));
        let id = scheduler.submit(SubmitRequest::new("unit", "ci")).await.unwrap();
        let outcome = scheduler
            .report_completion(CompletionReport {
                id: id.clone(),
                status: ReportedStatus::Failed,
                results: None,
                error_message: Some("boom".into()),
            })
            .await
            .unwrap();
        assert_eq!(outcome, CompletionOutcome::NotStarted);
        assert!(!scheduler.report_started(&id).await.unwrap());
        assert!(!scheduler.report_started("missing").await.unwrap());
    }

    #[tokio::test]
    async fn test_status_queries() {
        let (scheduler, registry, _) = scheduler_with(Arc::new(MockInvoker::new()));
        registry
            .register(RunnerSpec::new("r", local_backend()).max_concurrent_jobs(1))
            .await
            .unwrap();
        for suite in ["unit", "api", "unit"] {
            scheduler.submit(SubmitRequest::new(suite, "ci")).await.unwrap();
        }
        scheduler.submit(SubmitRequest::new("unit", "prod")).await.unwrap();
        scheduler.scheduling_pass().await.unwrap();

        let depth = scheduler.queue_depth().await;
        assert_eq!(depth.assigned, 1);
        assert_eq!(depth.queued, 3);
        assert_eq!(depth.active(), 4);

        let capacity = scheduler.capacity_summary().await;
        assert_eq!(capacity.active_runners, 1);
        assert_eq!(capacity.total_slots, 1);
        assert_eq!(capacity.used_slots, 1);
        assert_eq!(capacity.slot_utilization(), 1.0);

        let units = scheduler
            .history(&HistoryFilter {
                test_suite: Some("unit".into()),
                ..Default::default()
            })
            .await;
        assert_eq!(units.total, 3);
        assert_eq!(units.items[0].environment, "prod");

        let page = scheduler
            .history(&HistoryFilter {
                environment: Some("ci".into()),
                offset: 1,
                limit: 1,
                ..Default::default()
            })
            .await;
        assert_eq!(page.total, 3);
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].test_suite, "api");

        let queued = scheduler
            .history(&HistoryFilter {
                status: Some(ExecutionStatus::Queued),
                ..Default::default()
            })
            .await;
        assert_eq!(queued.total, 3);
    }
}
