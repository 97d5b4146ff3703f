//! Shared state: executions, runners, allocations, rules, shards and
//! parallel runs.
//!
//! The [`Store`] is the only serialization point between the scheduler,
//! the allocation manager and the coordinator. Each public method is one
//! atomic statement; nothing holds the lock across an `.await`.
//!
//! Mutations are conditional. A status change names the statuses it expects
//! to find (the moral equivalent of `UPDATE ... WHERE status IN (...)`), and
//! returns `None` when the row has moved on. Callers treat `None` as "another
//! tick got there first", which makes every transition safe to re-apply or
//! interleave.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::debug;

use crate::coordinator::aggregate::AggregatedResult;
use crate::model::{
    AllocationStatus, Execution, ExecutionStatus, HealthStatus, LoadBalancingRule, ParallelRun,
    ResourceAllocation, Runner, RunnerStatus, Shard, ShardStatus,
};

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors returned by the store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("{entity} already exists: {id}")]
    AlreadyExists { entity: &'static str, id: String },
}

impl StoreError {
    fn not_found(entity: &'static str, id: &str) -> Self {
        StoreError::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

#[derive(Default)]
struct Tables {
    executions: HashMap<String, Execution>,
    runners: HashMap<String, Runner>,
    allocations: HashMap<String, ResourceAllocation>,
    rules: HashMap<String, LoadBalancingRule>,
    shards: HashMap<String, Shard>,
    parallel_runs: HashMap<String, ParallelRun>,
    sequence: u64,
}

impl Tables {
    fn next_sequence(&mut self) -> u64 {
        self.sequence += 1;
        self.sequence
    }

    /// Frees an active allocation and its job slot exactly once.
    fn release_allocation(&mut self, id: &str, at: DateTime<Utc>) -> StoreResult<Option<ResourceAllocation>> {
        let allocation = self
            .allocations
            .get_mut(id)
            .ok_or_else(|| StoreError::not_found("allocation", id))?;
        if !allocation.status.is_active() {
            return Ok(None);
        }
        allocation.status = AllocationStatus::Released;
        allocation.released_at = Some(at);
        let released = allocation.clone();

        if let Some(runner) = self.runners.get_mut(&released.runner_id) {
            runner.current_jobs = runner.current_jobs.saturating_sub(1);
        }
        Ok(Some(released))
    }
}

/// Thread-safe in-process state store.
///
/// Cloning is cheap; clones share the same tables.
#[derive(Clone, Default)]
pub struct Store {
    tables: Arc<RwLock<Tables>>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Executions ─────────────────────────────────────────────────

    /// Inserts a new execution, assigning its sequence number.
    pub async fn insert_execution(&self, mut execution: Execution) -> StoreResult<Execution> {
        let mut tables = self.tables.write().await;
        if tables.executions.contains_key(&execution.id) {
            return Err(StoreError::AlreadyExists {
                entity: "execution",
                id: execution.id,
            });
        }
        execution.sequence = tables.next_sequence();
        tables
            .executions
            .insert(execution.id.clone(), execution.clone());
        debug!(execution_id = %execution.id, "execution stored");
        Ok(execution)
    }

    pub async fn get_execution(&self, id: &str) -> Option<Execution> {
        self.tables.read().await.executions.get(id).cloned()
    }

    /// Queued executions in placement order: priority descending, then
    /// enqueue time ascending.
    pub async fn queued_executions(&self) -> Vec<Execution> {
        let tables = self.tables.read().await;
        let mut queued: Vec<Execution> = tables
            .executions
            .values()
            .filter(|e| e.status == ExecutionStatus::Queued)
            .cloned()
            .collect();
        queued.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.queued_at.cmp(&b.queued_at))
                .then(a.sequence.cmp(&b.sequence))
        });
        queued
    }

    /// Executions whose status is one of `statuses`, in enqueue order.
    pub async fn executions_with_status(&self, statuses: &[ExecutionStatus]) -> Vec<Execution> {
        let tables = self.tables.read().await;
        let mut found: Vec<Execution> = tables
            .executions
            .values()
            .filter(|e| statuses.contains(&e.status))
            .cloned()
            .collect();
        found.sort_by_key(|e| e.sequence);
        found
    }

    /// All executions in enqueue order.
    pub async fn list_executions(&self) -> Vec<Execution> {
        let tables = self.tables.read().await;
        let mut all: Vec<Execution> = tables.executions.values().cloned().collect();
        all.sort_by_key(|e| e.sequence);
        all
    }

    /// Moves an execution to `to` if its current status is in `from`.
    ///
    /// `update` runs on the row inside the same statement, so timestamps and
    /// results land together with the status. Returns the updated row, or
    /// `None` if the precondition didn't hold.
    pub async fn transition_execution<F>(
        &self,
        id: &str,
        from: &[ExecutionStatus],
        to: ExecutionStatus,
        update: F,
    ) -> StoreResult<Option<Execution>>
    where
        F: FnOnce(&mut Execution),
    {
        let mut tables = self.tables.write().await;
        let execution = tables
            .executions
            .get_mut(id)
            .ok_or_else(|| StoreError::not_found("execution", id))?;

        if !from.contains(&execution.status) || !execution.status.can_transition_to(to) {
            debug!(
                execution_id = %id,
                current = %execution.status,
                wanted = %to,
                "execution transition skipped"
            );
            return Ok(None);
        }

        execution.status = to;
        update(execution);
        Ok(Some(execution.clone()))
    }

    // ── Runners ────────────────────────────────────────────────────

    pub async fn insert_runner(&self, mut runner: Runner) -> StoreResult<Runner> {
        let mut tables = self.tables.write().await;
        if tables.runners.contains_key(&runner.id)
            || tables.runners.values().any(|r| r.name == runner.name)
        {
            return Err(StoreError::AlreadyExists {
                entity: "runner",
                id: runner.name,
            });
        }
        runner.sequence = tables.next_sequence();
        tables.runners.insert(runner.id.clone(), runner.clone());
        Ok(runner)
    }

    pub async fn get_runner(&self, id: &str) -> Option<Runner> {
        self.tables.read().await.runners.get(id).cloned()
    }

    /// All runners in registration order.
    pub async fn list_runners(&self) -> Vec<Runner> {
        let tables = self.tables.read().await;
        let mut runners: Vec<Runner> = tables.runners.values().cloned().collect();
        runners.sort_by_key(|r| r.sequence);
        runners
    }

    /// Overwrites the job count if it still equals `expected`.
    pub async fn reset_job_count(
        &self,
        runner_id: &str,
        expected: u32,
        actual: u32,
    ) -> StoreResult<bool> {
        let mut tables = self.tables.write().await;
        let runner = tables
            .runners
            .get_mut(runner_id)
            .ok_or_else(|| StoreError::not_found("runner", runner_id))?;
        if runner.current_jobs != expected {
            return Ok(false);
        }
        runner.current_jobs = actual;
        Ok(true)
    }

    pub async fn set_runner_health(
        &self,
        runner_id: &str,
        health: HealthStatus,
        response_ms: Option<u64>,
        error: Option<String>,
        checked_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        let runner = tables
            .runners
            .get_mut(runner_id)
            .ok_or_else(|| StoreError::not_found("runner", runner_id))?;
        runner.health = health;
        runner.health_response_ms = response_ms;
        runner.health_error = error;
        runner.last_health_check = Some(checked_at);
        Ok(())
    }

    pub async fn set_runner_status(&self, runner_id: &str, status: RunnerStatus) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        let runner = tables
            .runners
            .get_mut(runner_id)
            .ok_or_else(|| StoreError::not_found("runner", runner_id))?;
        runner.status = status;
        Ok(())
    }

    // ── Allocations ────────────────────────────────────────────────

    /// Takes a job slot on the allocation's runner and records the
    /// allocation, or does neither if the runner has no free slot.
    pub async fn claim_allocation(&self, allocation: ResourceAllocation) -> StoreResult<bool> {
        let mut tables = self.tables.write().await;
        if tables.allocations.contains_key(&allocation.id) {
            return Err(StoreError::AlreadyExists {
                entity: "allocation",
                id: allocation.id,
            });
        }
        let runner = tables
            .runners
            .get_mut(&allocation.runner_id)
            .ok_or_else(|| StoreError::not_found("runner", &allocation.runner_id))?;
        if runner.current_jobs >= runner.max_concurrent_jobs {
            return Ok(false);
        }
        runner.current_jobs += 1;
        tables
            .allocations
            .insert(allocation.id.clone(), allocation);
        Ok(true)
    }

    /// Releases an active allocation and gives its job slot back.
    ///
    /// Returns `None` if the allocation was already released, so the slot is
    /// returned exactly once however many callers race here.
    pub async fn release_allocation(
        &self,
        id: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<Option<ResourceAllocation>> {
        self.tables.write().await.release_allocation(id, at)
    }

    /// Releases allocation `id` only if its owner is neither a live
    /// execution nor a live shard, checked under the same write lock.
    ///
    /// Returns `None` when the owner is live or the allocation was already
    /// released.
    pub async fn release_if_orphaned(
        &self,
        id: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<Option<ResourceAllocation>> {
        let mut tables = self.tables.write().await;
        let owner = tables
            .allocations
            .get(id)
            .map(|a| a.execution_id.clone())
            .ok_or_else(|| StoreError::not_found("allocation", id))?;
        let live = tables.executions.get(&owner).is_some_and(|e| !e.status.is_terminal())
            || tables.shards.get(&owner).is_some_and(|s| !s.status.is_terminal());
        if live {
            return Ok(None);
        }
        tables.release_allocation(id, at)
    }

    /// Allocations that still hold capacity, oldest first.
    pub async fn active_allocations(&self) -> Vec<ResourceAllocation> {
        let tables = self.tables.read().await;
        let mut active: Vec<ResourceAllocation> = tables
            .allocations
            .values()
            .filter(|a| a.status.is_active())
            .cloned()
            .collect();
        active.sort_by(|a, b| a.allocated_at.cmp(&b.allocated_at).then(a.id.cmp(&b.id)));
        active
    }

    /// Active allocations on one runner, oldest first.
    pub async fn active_allocations_for_runner(&self, runner_id: &str) -> Vec<ResourceAllocation> {
        let mut active = self.active_allocations().await;
        active.retain(|a| a.runner_id == runner_id);
        active
    }

    /// The active allocation held by an execution or shard, if any.
    pub async fn active_allocation_for(&self, execution_id: &str) -> Option<ResourceAllocation> {
        let tables = self.tables.read().await;
        tables
            .allocations
            .values()
            .find(|a| a.execution_id == execution_id && a.status.is_active())
            .cloned()
    }

    /// All allocations ever recorded for an execution or shard.
    pub async fn allocations_for(&self, execution_id: &str) -> Vec<ResourceAllocation> {
        let tables = self.tables.read().await;
        tables
            .allocations
            .values()
            .filter(|a| a.execution_id == execution_id)
            .cloned()
            .collect()
    }

    /// Flags an `allocated` row as `exceeded`. It keeps holding capacity.
    pub async fn mark_exceeded(&self, id: &str) -> StoreResult<bool> {
        let mut tables = self.tables.write().await;
        let allocation = tables
            .allocations
            .get_mut(id)
            .ok_or_else(|| StoreError::not_found("allocation", id))?;
        if allocation.status != AllocationStatus::Allocated {
            return Ok(false);
        }
        allocation.status = AllocationStatus::Exceeded;
        Ok(true)
    }

    /// Shrinks a still-active allocation. Returns `false` if it was released.
    pub async fn resize_allocation(
        &self,
        id: &str,
        cpu_percent: f64,
        memory_mb: u64,
    ) -> StoreResult<bool> {
        let mut tables = self.tables.write().await;
        let allocation = tables
            .allocations
            .get_mut(id)
            .ok_or_else(|| StoreError::not_found("allocation", id))?;
        if !allocation.status.is_active() {
            return Ok(false);
        }
        allocation.cpu_percent = cpu_percent;
        allocation.memory_mb = memory_mb;
        Ok(true)
    }

    // ── Rules ──────────────────────────────────────────────────────

    pub async fn insert_rule(&self, mut rule: LoadBalancingRule) -> StoreResult<LoadBalancingRule> {
        let mut tables = self.tables.write().await;
        if tables.rules.values().any(|r| r.name == rule.name) {
            return Err(StoreError::AlreadyExists {
                entity: "rule",
                id: rule.name,
            });
        }
        rule.sequence = tables.next_sequence();
        tables.rules.insert(rule.id.clone(), rule.clone());
        Ok(rule)
    }

    /// All rules in configuration order.
    pub async fn list_rules(&self) -> Vec<LoadBalancingRule> {
        let tables = self.tables.read().await;
        let mut rules: Vec<LoadBalancingRule> = tables.rules.values().cloned().collect();
        rules.sort_by_key(|r| r.sequence);
        rules
    }

    // ── Shards ─────────────────────────────────────────────────────

    /// Inserts a parallel run together with all of its shards.
    pub async fn insert_parallel_run(&self, run: ParallelRun, shards: Vec<Shard>) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        if tables.parallel_runs.contains_key(&run.parent_id) {
            return Err(StoreError::AlreadyExists {
                entity: "parallel run",
                id: run.parent_id,
            });
        }
        for shard in shards {
            tables.shards.insert(shard.id.clone(), shard);
        }
        tables.parallel_runs.insert(run.parent_id.clone(), run);
        Ok(())
    }

    pub async fn get_parallel_run(&self, parent_id: &str) -> Option<ParallelRun> {
        self.tables.read().await.parallel_runs.get(parent_id).cloned()
    }

    /// Parallel runs not yet finalized, oldest first.
    pub async fn active_parallel_runs(&self) -> Vec<ParallelRun> {
        let tables = self.tables.read().await;
        let mut runs: Vec<ParallelRun> = tables
            .parallel_runs
            .values()
            .filter(|r| r.finalized_at.is_none())
            .cloned()
            .collect();
        runs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.parent_id.cmp(&b.parent_id)));
        runs
    }

    /// Records the final result of a parallel run, once.
    pub async fn finalize_parallel_run(
        &self,
        parent_id: &str,
        result: AggregatedResult,
    ) -> StoreResult<bool> {
        let mut tables = self.tables.write().await;
        let run = tables
            .parallel_runs
            .get_mut(parent_id)
            .ok_or_else(|| StoreError::not_found("parallel run", parent_id))?;
        if run.finalized_at.is_some() {
            return Ok(false);
        }
        run.finalized_at = Some(result.finished_at);
        run.result = Some(result);
        Ok(true)
    }

    pub async fn get_shard(&self, id: &str) -> Option<Shard> {
        self.tables.read().await.shards.get(id).cloned()
    }

    /// Shards of one parent, by shard index.
    pub async fn shards_for_parent(&self, parent_id: &str) -> Vec<Shard> {
        let tables = self.tables.read().await;
        let mut shards: Vec<Shard> = tables
            .shards
            .values()
            .filter(|s| s.parent_id == parent_id)
            .cloned()
            .collect();
        shards.sort_by_key(|s| s.shard_index);
        shards
    }

    /// Shards whose status is one of `statuses`.
    pub async fn shards_with_status(&self, statuses: &[ShardStatus]) -> Vec<Shard> {
        let tables = self.tables.read().await;
        let mut found: Vec<Shard> = tables
            .shards
            .values()
            .filter(|s| statuses.contains(&s.status))
            .cloned()
            .collect();
        found.sort_by(|a, b| {
            a.parent_id
                .cmp(&b.parent_id)
                .then(a.shard_index.cmp(&b.shard_index))
        });
        found
    }

    /// Binds a pending shard to a runner if it has none yet.
    pub async fn assign_shard(&self, id: &str, runner_id: &str) -> StoreResult<bool> {
        let mut tables = self.tables.write().await;
        let shard = tables
            .shards
            .get_mut(id)
            .ok_or_else(|| StoreError::not_found("shard", id))?;
        if shard.status != ShardStatus::Pending || shard.runner_id.is_some() {
            return Ok(false);
        }
        shard.runner_id = Some(runner_id.to_string());
        Ok(true)
    }

    /// Moves a shard to `to` if its status is in `from` and `to` is forward.
    pub async fn transition_shard<F>(
        &self,
        id: &str,
        from: &[ShardStatus],
        to: ShardStatus,
        update: F,
    ) -> StoreResult<Option<Shard>>
    where
        F: FnOnce(&mut Shard),
    {
        let mut tables = self.tables.write().await;
        let shard = tables
            .shards
            .get_mut(id)
            .ok_or_else(|| StoreError::not_found("shard", id))?;
        if !from.contains(&shard.status) || shard.status.is_terminal() || to.rank() <= shard.status.rank()
        {
            return Ok(None);
        }
        shard.status = to;
        update(shard);
        Ok(Some(shard.clone()))
    }
}
