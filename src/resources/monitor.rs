//! Periodic allocation monitoring and orphan cleanup.
//!
//! The monitor never releases work because of a health problem or an
//! overage. It flags (`AllocationAtRisk`, `exceeded` + `ResourceViolation`)
//! and leaves the decision to whoever consumes the events. The only thing it
//! corrects is bookkeeping: a runner's `current_jobs` is reset to the number
//! of allocations it actually holds.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use super::ResourceManager;
use crate::events::Event;
use crate::model::{AllocationStatus, HealthStatus, ResourceAllocation, RunnerStatus};
use crate::store::StoreResult;

/// An over-commitment found by one monitoring pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Violation {
    pub runner_id: String,
    pub cpu_percent: f64,
    pub memory_mb: u64,
    pub max_cpu_percent: f64,
    pub max_memory_mb: u64,
    /// Allocations newly marked `exceeded`, newest first.
    pub exceeded: Vec<String>,
}

/// What one monitoring pass found.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MonitorReport {
    /// Allocations held on runners that are unhealthy, inactive or gone.
    pub at_risk: Vec<String>,
    pub violations: Vec<Violation>,
    /// Runners whose job count was corrected.
    pub reconciled: Vec<String>,
}

impl ResourceManager {
    pub async fn monitor_pass(&self) -> StoreResult<MonitorReport> {
        self.monitor_pass_at(Utc::now()).await
    }

    /// Runs the health, overage and reconciliation checks once.
    ///
    /// `now` only stamps the log lines; the checks depend on current state.
    pub async fn monitor_pass_at(&self, now: DateTime<Utc>) -> StoreResult<MonitorReport> {
        let mut report = MonitorReport::default();
        let runners = self.store.list_runners().await;
        let active = self.store.active_allocations().await;

        let mut by_runner: HashMap<&str, Vec<&ResourceAllocation>> = HashMap::new();
        for allocation in &active {
            by_runner
                .entry(allocation.runner_id.as_str())
                .or_default()
                .push(allocation);
        }

        for allocation in &active {
            let runner = runners.iter().find(|r| r.id == allocation.runner_id);
            let reason = match runner {
                None => Some("runner no longer registered".to_string()),
                Some(r) if r.health == HealthStatus::Unhealthy => Some(format!(
                    "runner {} is unhealthy: {}",
                    r.name,
                    r.health_error.as_deref().unwrap_or("no detail")
                )),
                Some(r) if r.status != RunnerStatus::Active => {
                    Some(format!("runner {} is not active", r.name))
                }
                Some(_) => None,
            };
            if let Some(reason) = reason {
                warn!(
                    allocation_id = %allocation.id,
                    runner_id = %allocation.runner_id,
                    reason = %reason,
                    "Allocation at risk"
                );
                report.at_risk.push(allocation.id.clone());
                self.events.emit(Event::AllocationAtRisk {
                    allocation: allocation.clone(),
                    reason,
                });
            }
        }

        for runner in &runners {
            let held = by_runner.get(runner.id.as_str()).cloned().unwrap_or_default();

            if let Some(violation) = self.check_overage(runner, &held).await? {
                warn!(
                    runner_id = %runner.id,
                    cpu = violation.cpu_percent,
                    memory_mb = violation.memory_mb,
                    exceeded = violation.exceeded.len(),
                    at = %now,
                    "Resource violation"
                );
                self.events.emit(Event::ResourceViolation {
                    runner_id: violation.runner_id.clone(),
                    cpu_percent: violation.cpu_percent,
                    memory_mb: violation.memory_mb,
                    max_cpu_percent: violation.max_cpu_percent,
                    max_memory_mb: violation.max_memory_mb,
                    exceeded: violation.exceeded.clone(),
                });
                report.violations.push(violation);
            }

            let holding = u32::try_from(held.len()).unwrap_or(u32::MAX);
            if runner.current_jobs != holding
                && self
                    .store
                    .reset_job_count(&runner.id, runner.current_jobs, holding)
                    .await?
            {
                info!(
                    runner_id = %runner.id,
                    recorded = runner.current_jobs,
                    actual = holding,
                    "Reconciled runner job count"
                );
                report.reconciled.push(runner.id.clone());
            }
        }

        Ok(report)
    }

    /// Marks the newest `allocated` rows on `runner` as `exceeded` until the
    /// remaining `allocated` rows fit its declared limits.
    async fn check_overage(
        &self,
        runner: &crate::model::Runner,
        held: &[&ResourceAllocation],
    ) -> StoreResult<Option<Violation>> {
        let counted: Vec<&ResourceAllocation> = held
            .iter()
            .copied()
            .filter(|a| a.status == AllocationStatus::Allocated)
            .collect();
        let mut cpu: f64 = counted.iter().map(|a| a.cpu_percent).sum();
        let mut memory: u64 = counted.iter().map(|a| a.memory_mb).sum();
        let limits = runner.capabilities;

        if cpu <= limits.max_cpu_percent && memory <= limits.max_memory_mb {
            return Ok(None);
        }

        let mut violation = Violation {
            runner_id: runner.id.clone(),
            cpu_percent: cpu,
            memory_mb: memory,
            max_cpu_percent: limits.max_cpu_percent,
            max_memory_mb: limits.max_memory_mb,
            exceeded: Vec::new(),
        };

        // `held` is oldest first.
        for allocation in counted.iter().rev() {
            if cpu <= limits.max_cpu_percent && memory <= limits.max_memory_mb {
                break;
            }
            if self.store.mark_exceeded(&allocation.id).await? {
                violation.exceeded.push(allocation.id.clone());
            }
            cpu -= allocation.cpu_percent;
            memory = memory.saturating_sub(allocation.memory_mb);
        }

        Ok(Some(violation))
    }

    /// Releases active allocations whose owner is neither a live execution
    /// nor a live shard. Returns the reclaimed allocations.
    ///
    /// Liveness is checked per allocation inside the release itself, so an
    /// owner inserted while the pass runs is never mistaken for an orphan.
    pub async fn cleanup_orphans(&self) -> StoreResult<Vec<ResourceAllocation>> {
        let now = Utc::now();
        let mut reclaimed = Vec::new();

        for allocation in self.store.active_allocations().await {
            if let Some(released) = self.store.release_if_orphaned(&allocation.id, now).await? {
                info!(
                    allocation_id = %released.id,
                    owner_id = %released.execution_id,
                    runner_id = %released.runner_id,
                    "Reclaimed orphaned allocation"
                );
                self.events.emit(Event::OrphanReclaimed(released.clone()));
                reclaimed.push(released);
            }
        }

        Ok(reclaimed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::Requirement;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use crate::invoker::CompletionReport;
    use crate::model::{ExecutionStatus, SubmitRequest};
    use crate::registry::RunnerSpec;
    use crate::test_support::{
        MockInvoker, execution, local_backend, local_runner, manager_with_events, scheduler_with,
    };

    fn req(cpu: f64, memory_mb: u64) -> Requirement {
        Requirement {
            cpu_percent: cpu,
            memory_mb,
            slots: 1,
        }
    }

    #[tokio::test]
    async fn test_unhealthy_runner_flags_allocations_without_releasing() {
        let (manager, store, mut events) = manager_with_events();
        let runner = store.insert_runner(local_runner("r", 2)).await.unwrap();
        manager.allocate("e1", &runner, &req(50.0, 1024)).await.unwrap();
        store
            .set_runner_health(&runner.id, HealthStatus::Unhealthy, None, Some("503".into()), Utc::now())
            .await
            .unwrap();

        let report = manager.monitor_pass().await.unwrap();
        assert_eq!(report.at_risk.len(), 1);
        assert!(report.violations.is_empty());
        assert_eq!(store.active_allocations().await.len(), 1);
        assert!(matches!(events.try_recv().unwrap(), Event::AllocationAtRisk { .. }));
    }

    #[tokio::test]
    async fn test_overage_marks_newest_allocations_exceeded() {
        let (manager, store, mut events) = manager_with_events();
        let runner = store.insert_runner(local_runner("r", 5)).await.unwrap();
        // Default capacity is 400% CPU; three 150% claims overshoot by one.
        let first = manager.allocate("e1", &runner, &req(150.0, 1024)).await.unwrap().unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        let second = manager.allocate("e2", &runner, &req(150.0, 1024)).await.unwrap().unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        let third = manager.allocate("e3", &runner, &req(150.0, 1024)).await.unwrap().unwrap();

        let report = manager.monitor_pass().await.unwrap();
        assert_eq!(report.violations.len(), 1);
        assert_eq!(report.violations[0].exceeded, vec![third.id.clone()]);
        assert_eq!(report.violations[0].cpu_percent, 450.0);

        let active = store.active_allocations().await;
        let status_of = |id: &str| active.iter().find(|a| a.id == id).unwrap().status;
        assert_eq!(status_of(&first.id), AllocationStatus::Allocated);
        assert_eq!(status_of(&second.id), AllocationStatus::Allocated);
        assert_eq!(status_of(&third.id), AllocationStatus::Exceeded);
        assert!(matches!(events.try_recv().unwrap(), Event::ResourceViolation { .. }));

        // Flagged rows no longer count, so the next pass is quiet.
        let again = manager.monitor_pass().await.unwrap();
        assert!(again.violations.is_empty());
    }

    #[tokio::test]
    async fn test_reconciles_drifted_job_count() {
        let (manager, store, _events) = manager_with_events();
        let runner = store.insert_runner(local_runner("r", 5)).await.unwrap();
        manager.allocate("e1", &runner, &req(10.0, 256)).await.unwrap();
        store.reset_job_count(&runner.id, 1, 4).await.unwrap();

        let report = manager.monitor_pass().await.unwrap();
        assert_eq!(report.reconciled, vec![runner.id.clone()]);
        assert_eq!(store.get_runner(&runner.id).await.unwrap().current_jobs, 1);
    }

    #[tokio::test]
    async fn test_cleanup_releases_only_orphans() {
        let (manager, store, mut events) = manager_with_events();
        let runner = store.insert_runner(local_runner("r", 5)).await.unwrap();
        let live = store.insert_execution(execution("unit", 50)).await.unwrap();

        manager.allocate(&live.id, &runner, &req(10.0, 256)).await.unwrap();
        manager.allocate("vanished", &runner, &req(10.0, 256)).await.unwrap();

        let reclaimed = manager.cleanup_orphans().await.unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].execution_id, "vanished");
        assert!(store.active_allocation_for(&live.id).await.is_some());
        assert_eq!(store.get_runner(&runner.id).await.unwrap().current_jobs, 1);
        assert!(matches!(events.try_recv().unwrap(), Event::OrphanReclaimed(_)));

        assert!(manager.cleanup_orphans().await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cleanup_concurrent_with_scheduling_keeps_live_allocations() {
        let (scheduler, registry, store) = scheduler_with(Arc::new(MockInvoker::new()));
        registry
            .register(RunnerSpec::new("r", local_backend()).max_concurrent_jobs(1))
            .await
            .unwrap();

        let resources = scheduler.resources().clone();
        let stop = Arc::new(AtomicBool::new(false));
        let cleaner = {
            let stop = stop.clone();
            tokio::spawn(async move {
                let mut reclaimed = 0;
                while !stop.load(Ordering::SeqCst) {
                    reclaimed += resources.cleanup_orphans().await.unwrap().len();
                    tokio::task::yield_now().await;
                }
                reclaimed
            })
        };

        let mut missing = 0;
        for _ in 0..1000 {
            let id = scheduler.submit(SubmitRequest::new("unit", "ci")).await.unwrap();
            scheduler.scheduling_pass().await.unwrap();
            let execution = scheduler.execution(&id).await.unwrap();
            if execution.status == ExecutionStatus::Assigned && store.active_allocation_for(&id).await.is_none() {
                missing += 1;
            }
            scheduler
                .report_completion(CompletionReport::completed(&id, None))
                .await
                .unwrap();
        }
        stop.store(true, Ordering::SeqCst);

        assert_eq!(missing, 0);
        assert_eq!(cleaner.await.unwrap(), 0);
        scheduler.drain_invocations().await;
    }
}
