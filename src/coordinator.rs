//! Parallel (sharded) execution.
//!
//! A parallel run splits one suite into N shards. Each shard is placed,
//! invoked and completed like an execution, but it is tracked here rather
//! than in the queue.
//!
//! # Flow
//!
//! ```text
//!  orchestrate(request)
//!        │  create N pending shards
//!        ▼
//!  ┌───────────────────────┐  capacity-weighted   ┌──────────┐
//!  │ place pending shards  │ ───round robin─────► │ runners  │
//!  └──────────┬────────────┘                      └────┬─────┘
//!             │ trigger all (join_all)                 │ completion
//!             ▼                                        ▼
//!  pending ─► running ─► completed | failed ◄── report_shard_completion
//!                                   │
//!                   coordinate_parent (immediately, and every pass)
//!                                   ▼
//!                     all terminal? ─► aggregate + finalize
//! ```
//!
//! Shards that find no runner with room stay `pending` and are retried by
//! every coordination pass. A parent with no running shard and no shard
//! start or completion for `stuck_after_secs` has its remaining shards
//! failed as stuck, and a shard
//! running longer than `shard_timeout_secs` is failed by the shard timeout
//! sweep. A failed shard never cancels its siblings.

pub mod aggregate;

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use futures::future::join_all;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ParallelConfig;
use crate::events::{Event, EventSender};
use crate::invoker::{CompletionReport, InvocationPayload};
use crate::model::{ParallelRun, ResourceAllocation, Runner, RunnerType, Shard, ShardStatus};
use crate::scheduler::{CompletionOutcome, ExecutionScheduler};
use crate::store::{Store, StoreError};
use aggregate::{AggregatedResult, ParallelStatus};

/// Result type for coordinator operations.
pub type CoordinatorResult<T> = Result<T, CoordinatorError>;

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("invalid parallel request: {0}")]
    InvalidRequest(String),

    #[error("unknown parallel run: {0}")]
    UnknownParent(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A request to run one suite as N shards.
///
/// # Example
///
/// ```
/// use convoy::coordinator::ParallelRequest;
/// use convoy::model::RunnerType;
///
/// let request = ParallelRequest::new("e2e", "staging", 4)
///     .parent_id("nightly-2024-06-01")
///     .runner_type(RunnerType::Docker);
/// assert_eq!(request.total_shards, 4);
/// ```
#[derive(Debug, Clone, Default)]
pub struct ParallelRequest {
    /// Generated when not given.
    pub parent_id: Option<String>,
    pub test_suite: String,
    pub environment: String,
    pub total_shards: u32,

    /// Only runners of this type receive shards.
    pub runner_type: Option<RunnerType>,
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl ParallelRequest {
    pub fn new(test_suite: impl Into<String>, environment: impl Into<String>, total_shards: u32) -> Self {
        Self {
            test_suite: test_suite.into(),
            environment: environment.into(),
            total_shards,
            ..Default::default()
        }
    }

    pub fn parent_id(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn runner_type(mut self, runner_type: RunnerType) -> Self {
        self.runner_type = Some(runner_type);
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Creates, places and finalizes parallel runs.
#[derive(Clone)]
pub struct ParallelCoordinator {
    store: Store,
    scheduler: ExecutionScheduler,
    events: EventSender,
    config: ParallelConfig,
}

impl ParallelCoordinator {
    pub fn new(store: Store, scheduler: ExecutionScheduler, events: EventSender, config: ParallelConfig) -> Self {
        Self {
            store,
            scheduler,
            events,
            config,
        }
    }

    /// Creates the shards of a parallel run and starts as many as capacity
    /// allows. Returns every shard, placed or not, by index.
    pub async fn orchestrate(&self, request: ParallelRequest) -> CoordinatorResult<Vec<Shard>> {
        if request.test_suite.trim().is_empty() || request.environment.trim().is_empty() {
            return Err(CoordinatorError::InvalidRequest(
                "test_suite and environment are required".into(),
            ));
        }
        if request.total_shards == 0 || request.total_shards > self.config.max_shards {
            return Err(CoordinatorError::InvalidRequest(format!(
                "total_shards must be between 1 and {}, got {}",
                self.config.max_shards, request.total_shards
            )));
        }

        let now = Utc::now();
        let parent_id = request
            .parent_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let shards: Vec<Shard> = (0..request.total_shards)
            .map(|index| Shard {
                id: Uuid::new_v4().to_string(),
                parent_id: parent_id.clone(),
                shard_index: index,
                total_shards: request.total_shards,
                status: ShardStatus::Pending,
                runner_id: None,
                results: None,
                error_message: None,
                created_at: now,
                started_at: None,
                completed_at: None,
            })
            .collect();
        let run = ParallelRun {
            parent_id: parent_id.clone(),
            test_suite: request.test_suite,
            environment: request.environment,
            total_shards: request.total_shards,
            runner_type: request.runner_type,
            metadata: request.metadata,
            created_at: now,
            finalized_at: None,
            result: None,
        };
        self.store.insert_parallel_run(run.clone(), shards).await?;

        info!(
            parent_id = %parent_id,
            suite = %run.test_suite,
            total_shards = run.total_shards,
            "Created parallel run"
        );
        self.events.emit(Event::ParallelStarted {
            parent_id: parent_id.clone(),
            total_shards: run.total_shards,
        });

        self.place_pending(&run).await?;
        Ok(self.store.shards_for_parent(&parent_id).await)
    }

    /// Places unassigned pending shards of `run` and triggers them.
    ///
    /// Runners are ranked by spare-slot ratio and taken in turn; a runner
    /// without room is skipped for the next. Shards left over when no runner
    /// has room stay pending. Returns how many shards were placed.
    async fn place_pending(&self, run: &ParallelRun) -> CoordinatorResult<usize> {
        let pending: Vec<Shard> = self
            .store
            .shards_for_parent(&run.parent_id)
            .await
            .into_iter()
            .filter(|s| s.status == ShardStatus::Pending && s.runner_id.is_none())
            .collect();
        if pending.is_empty() {
            return Ok(0);
        }

        let mut runners = self.scheduler.registry().available_runners(run.runner_type).await;
        if runners.is_empty() {
            debug!(parent_id = %run.parent_id, pending = pending.len(), "no runners for pending shards");
            return Ok(0);
        }
        runners.sort_by(|a, b| b.spare_ratio().total_cmp(&a.spare_ratio()));
        let mut usage = self.scheduler.resources().usage().await;

        let mut cursor = 0;
        let mut launches = Vec::new();
        for shard in pending {
            let mut placed = None;
            for step in 0..runners.len() {
                let index = (cursor + step) % runners.len();
                let allocation = self
                    .scheduler
                    .reserve(&shard.id, &run.test_suite, &run.metadata, &runners[index], &usage)
                    .await?;
                if let Some(allocation) = allocation {
                    placed = Some((index, allocation));
                    break;
                }
            }
            let Some((index, allocation)) = placed else {
                debug!(parent_id = %run.parent_id, shard_index = shard.shard_index, "no capacity, shard stays pending");
                break;
            };
            cursor = index + 1;

            let runner = &mut runners[index];
            runner.current_jobs += 1;
            usage.entry(runner.id.clone()).or_default().add(&allocation);

            if !self.store.assign_shard(&shard.id, &runner.id).await? {
                self.store.release_allocation(&allocation.id, Utc::now()).await?;
                continue;
            }
            launches.push((shard, runner.clone(), allocation));
        }

        let placed = launches.len();
        let outcomes = join_all(
            launches
                .into_iter()
                .map(|(shard, runner, allocation)| self.launch(run, shard, runner, allocation)),
        )
        .await;
        for outcome in outcomes {
            if let Err(e) = outcome {
                warn!(parent_id = %run.parent_id, error = %e, "shard bookkeeping failed");
            }
        }
        Ok(placed)
    }

    /// Triggers one placed shard. A trigger error fails only this shard.
    async fn launch(
        &self,
        run: &ParallelRun,
        shard: Shard,
        runner: Runner,
        allocation: ResourceAllocation,
    ) -> CoordinatorResult<()> {
        let payload = InvocationPayload::new(
            &shard.id,
            &run.test_suite,
            &run.environment,
            self.scheduler.callback_address(),
        )
        .shard(&run.parent_id, shard.shard_index, shard.total_shards)
        .resources(allocation.cpu_percent, allocation.memory_mb)
        .metadata(run.metadata.clone());

        match self.scheduler.invoker().trigger(&runner, &payload).await {
            Ok(()) => {
                let now = Utc::now();
                self.store
                    .transition_shard(&shard.id, &[ShardStatus::Pending], ShardStatus::Running, |s| {
                        s.started_at.get_or_insert(now);
                    })
                    .await?;
                debug!(shard_id = %shard.id, shard_index = shard.shard_index, runner = %runner.name, "shard started");
            }
            Err(e) => {
                warn!(
                    parent_id = %run.parent_id,
                    shard_index = shard.shard_index,
                    runner = %runner.name,
                    error = %e,
                    "Shard invocation failed"
                );
                self.fail_shard(&shard.id, &[ShardStatus::Pending], e.to_string(), Utc::now())
                    .await?;
            }
        }
        Ok(())
    }

    /// Fails a shard still in one of `from` and releases its allocation.
    async fn fail_shard(
        &self,
        shard_id: &str,
        from: &[ShardStatus],
        reason: String,
        now: DateTime<Utc>,
    ) -> CoordinatorResult<bool> {
        let failed = self
            .store
            .transition_shard(shard_id, from, ShardStatus::Failed, |s| {
                s.completed_at = Some(now);
                s.error_message = Some(reason);
            })
            .await?;
        let Some(failed) = failed else {
            return Ok(false);
        };
        self.scheduler.resources().release_at(shard_id, now).await?;
        self.events.emit(Event::ShardFinished(failed));
        Ok(true)
    }

    /// Coordinates every active parallel run. Returns runs finalized by
    /// this pass.
    pub async fn coordination_pass(&self) -> CoordinatorResult<Vec<AggregatedResult>> {
        self.coordination_pass_at(Utc::now()).await
    }

    pub async fn coordination_pass_at(&self, now: DateTime<Utc>) -> CoordinatorResult<Vec<AggregatedResult>> {
        let mut finalized = Vec::new();
        for run in self.store.active_parallel_runs().await {
            match self.coordinate_parent_at(&run.parent_id, now).await {
                Ok(Some(result)) => finalized.push(result),
                Ok(None) => {}
                Err(e) => warn!(parent_id = %run.parent_id, error = %e, "coordination failed"),
            }
        }
        Ok(finalized)
    }

    pub async fn coordinate_parent(&self, parent_id: &str) -> CoordinatorResult<Option<AggregatedResult>> {
        self.coordinate_parent_at(parent_id, Utc::now()).await
    }

    /// Places pending shards, escalates a stuck parent and finalizes it once
    /// every shard is terminal.
    ///
    /// Returns the aggregate if the parent is (now or already) finalized.
    pub async fn coordinate_parent_at(
        &self,
        parent_id: &str,
        now: DateTime<Utc>,
    ) -> CoordinatorResult<Option<AggregatedResult>> {
        let run = self
            .store
            .get_parallel_run(parent_id)
            .await
            .ok_or_else(|| CoordinatorError::UnknownParent(parent_id.to_string()))?;
        if run.finalized_at.is_some() {
            return Ok(run.result);
        }

        self.place_pending(&run).await?;
        let mut shards = self.store.shards_for_parent(parent_id).await;

        let all_terminal = shards.iter().all(|s| s.status.is_terminal());
        if !all_terminal {
            let any_running = shards.iter().any(|s| s.status == ShardStatus::Running);
            let stuck_after = Duration::seconds(self.config.stuck_after_secs as i64);
            let last_progress = shards
                .iter()
                .flat_map(|s| [s.started_at, s.completed_at])
                .flatten()
                .fold(run.created_at, |latest, at| latest.max(at));
            if any_running || now - last_progress < stuck_after {
                return Ok(None);
            }

            warn!(
                parent_id = %parent_id,
                waiting = shards.iter().filter(|s| !s.status.is_terminal()).count(),
                "Parallel run stuck, failing remaining shards"
            );
            let reason = format!("stuck: no shard progress for {}s", self.config.stuck_after_secs);
            for shard in shards.iter().filter(|s| !s.status.is_terminal()) {
                self.fail_shard(&shard.id, &[ShardStatus::Pending, ShardStatus::Running], reason.clone(), now)
                    .await?;
            }
            shards = self.store.shards_for_parent(parent_id).await;
            if !shards.iter().all(|s| s.status.is_terminal()) {
                return Ok(None);
            }
        }

        self.finalize(&run, &shards, now).await
    }

    async fn finalize(
        &self,
        run: &ParallelRun,
        shards: &[Shard],
        now: DateTime<Utc>,
    ) -> CoordinatorResult<Option<AggregatedResult>> {
        let result = aggregate::aggregate(run, shards, now);
        if !self
            .store
            .finalize_parallel_run(&run.parent_id, result.clone())
            .await?
        {
            return Ok(self.parallel_result(&run.parent_id).await);
        }

        info!(
            parent_id = %run.parent_id,
            status = %result.status,
            completed = result.completed_shards,
            failed = result.failed_shards,
            passed = result.totals.passed,
            "Parallel run finished"
        );
        self.events.emit(Event::ParallelFinished(result.clone()));
        Ok(Some(result))
    }

    pub async fn shard_timeout_sweep(&self) -> CoordinatorResult<Vec<String>> {
        self.shard_timeout_sweep_at(Utc::now()).await
    }

    /// Fails every shard that has been running for `shard_timeout_secs` or
    /// longer. Returns the failed shard ids.
    pub async fn shard_timeout_sweep_at(&self, now: DateTime<Utc>) -> CoordinatorResult<Vec<String>> {
        let budget = Duration::seconds(self.config.shard_timeout_secs as i64);
        let mut timed_out = Vec::new();
        for shard in self.store.shards_with_status(&[ShardStatus::Running]).await {
            let started = shard.started_at.unwrap_or(shard.created_at);
            if now - started < budget {
                continue;
            }
            let reason = format!("timed out after {}s", self.config.shard_timeout_secs);
            if self.fail_shard(&shard.id, &[ShardStatus::Running], reason, now).await? {
                warn!(
                    parent_id = %shard.parent_id,
                    shard_index = shard.shard_index,
                    "Shard timed out"
                );
                timed_out.push(shard.id);
            }
        }
        Ok(timed_out)
    }

    /// Records that a runner began work on a shard.
    pub async fn report_shard_started(&self, shard_id: &str) -> CoordinatorResult<bool> {
        let now = Utc::now();
        match self
            .store
            .transition_shard(shard_id, &[ShardStatus::Pending], ShardStatus::Running, |s| {
                s.started_at.get_or_insert(now);
            })
            .await
        {
            Ok(updated) => Ok(updated.is_some()),
            Err(StoreError::NotFound { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Records a shard's terminal report and coordinates its parent.
    ///
    /// Idempotent like [`ExecutionScheduler::report_completion`].
    pub async fn report_shard_completion(&self, report: CompletionReport) -> CoordinatorResult<CompletionOutcome> {
        let Some(shard) = self.store.get_shard(&report.id).await else {
            return Ok(CompletionOutcome::Unknown);
        };
        if shard.status.is_terminal() {
            debug!(shard_id = %shard.id, "duplicate shard completion ignored");
            return Ok(CompletionOutcome::AlreadyFinished);
        }
        if shard.runner_id.is_none() {
            return Ok(CompletionOutcome::NotStarted);
        }

        let now = Utc::now();
        let updated = self
            .store
            .transition_shard(
                &shard.id,
                &[ShardStatus::Pending, ShardStatus::Running],
                report.status.shard_status(),
                |s| {
                    s.started_at.get_or_insert(now);
                    s.completed_at = Some(now);
                    s.results = report.results;
                    s.error_message = report.error_message;
                },
            )
            .await?;
        let Some(updated) = updated else {
            return Ok(CompletionOutcome::AlreadyFinished);
        };

        self.scheduler.resources().release_at(&updated.id, now).await?;
        info!(
            parent_id = %updated.parent_id,
            shard_index = updated.shard_index,
            status = %updated.status,
            "Shard finished"
        );
        self.events.emit(Event::ShardFinished(updated));

        self.coordinate_parent(&shard.parent_id).await?;
        Ok(CompletionOutcome::Recorded)
    }

    /// Live status of a parallel run, derived from its shards.
    pub async fn parent_status(&self, parent_id: &str) -> Option<ParallelStatus> {
        self.store.get_parallel_run(parent_id).await?;
        Some(aggregate::derive_status(&self.store.shards_for_parent(parent_id).await))
    }

    /// Final aggregate, once the run is finalized.
    pub async fn parallel_result(&self, parent_id: &str) -> Option<AggregatedResult> {
        self.store.get_parallel_run(parent_id).await?.result
    }

    pub async fn shards(&self, parent_id: &str) -> Vec<Shard> {
        self.store.shards_for_parent(parent_id).await
    }

    pub async fn is_shard(&self, id: &str) -> bool {
        self.store.get_shard(id).await.is_some()
    }
}
