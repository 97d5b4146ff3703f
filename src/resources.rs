//! Resource allocation manager.
//!
//! Tracks CPU, memory and job-slot claims per runner. Every placement holds
//! exactly one [`ResourceAllocation`], and the runner's job slot lives and
//! dies with it: [`ResourceManager::allocate`] takes the slot and writes the
//! row in one store statement, [`ResourceManager::release`] closes the row and
//! gives the slot back in another. No other component touches
//! `current_jobs` or the allocation table.
//!
//! # Requirements
//!
//! A work item's requirement starts from the configured defaults (50% CPU,
//! 2048 MB), which the item's `cpu_percent` / `memory_mb` metadata may
//! override. The suite name then scales CPU and memory independently:
//!
//! | Suite tokens | CPU | Memory |
//! |--------------|-----|--------|
//! | `unit`, `lint`, `smoke` | 0.7 | 0.8 |
//! | `api`, `contract` | 0.9 | 0.9 |
//! | `integration` | 1.1 | 1.2 |
//! | `ui`, `e2e`, `browser` | 1.3 | 1.5 |
//! | `perf`, `performance`, `load`, `stress`, `benchmark` | 1.5 | 1.3 |
//!
//! Both values are finally clamped to the runner's declared limits.
//!
//! Background passes live in [`monitor`] (health/overage/reconciliation and
//! orphan cleanup) and [`optimize`] (scale-down suggestions).

pub mod monitor;
pub mod optimize;

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use crate::config::ResourceConfig;
use crate::events::EventSender;
use crate::model::{AllocationStatus, ResourceAllocation, Runner, RunnerType};
use crate::store::{Store, StoreResult};

pub use monitor::{MonitorReport, Violation};
pub use optimize::OptimizationSuggestion;

/// Capacity a work item needs on a runner.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Requirement {
    pub cpu_percent: f64,
    pub memory_mb: u64,
    pub slots: u32,
}

/// Capacity a runner has left.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Capacity {
    pub cpu_percent: f64,
    pub memory_mb: u64,
    pub slots: u32,
}

/// CPU and memory held by a runner's active allocations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct RunnerUsage {
    pub cpu_percent: f64,
    pub memory_mb: u64,
    pub allocations: usize,
}

impl RunnerUsage {
    /// Combined load used by resource-based balancing.
    pub fn load_score(&self) -> f64 {
        self.cpu_percent + self.memory_mb as f64 / 1024.0
    }

    pub(crate) fn add(&mut self, allocation: &ResourceAllocation) {
        self.cpu_percent += allocation.cpu_percent;
        self.memory_mb += allocation.memory_mb;
        self.allocations += 1;
    }
}

/// Suite weight class derived from the suite name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuiteProfile {
    Lightweight,
    Api,
    Standard,
    Integration,
    Ui,
    Performance,
}

impl SuiteProfile {
    /// Classifies a suite by the tokens in its name.
    ///
    /// When a name carries tokens of several classes the heaviest wins.
    ///
    /// ```
    /// use convoy::resources::SuiteProfile;
    ///
    /// assert_eq!(SuiteProfile::classify("unit-tests"), SuiteProfile::Lightweight);
    /// assert_eq!(SuiteProfile::classify("checkout_e2e"), SuiteProfile::Ui);
    /// assert_eq!(SuiteProfile::classify("Perf.Nightly"), SuiteProfile::Performance);
    /// assert_eq!(SuiteProfile::classify("build"), SuiteProfile::Standard);
    /// ```
    pub fn classify(test_suite: &str) -> Self {
        let lowered = test_suite.to_lowercase();
        lowered
            .split(|c: char| !c.is_ascii_alphanumeric())
            .filter_map(Self::from_token)
            .max_by_key(|profile| profile.weight())
            .unwrap_or(SuiteProfile::Standard)
    }

    fn from_token(token: &str) -> Option<Self> {
        let profile = match token {
            "unit" | "lint" | "smoke" => SuiteProfile::Lightweight,
            "api" | "contract" => SuiteProfile::Api,
            "integration" => SuiteProfile::Integration,
            "ui" | "e2e" | "browser" => SuiteProfile::Ui,
            "perf" | "performance" | "load" | "stress" | "benchmark" => SuiteProfile::Performance,
            _ => return None,
        };
        Some(profile)
    }

    fn weight(&self) -> u8 {
        match self {
            SuiteProfile::Lightweight => 0,
            SuiteProfile::Api => 1,
            SuiteProfile::Standard => 2,
            SuiteProfile::Integration => 3,
            SuiteProfile::Ui => 4,
            SuiteProfile::Performance => 5,
        }
    }

    /// `(cpu, memory)` multipliers.
    pub fn multipliers(&self) -> (f64, f64) {
        match self {
            SuiteProfile::Lightweight => (0.7, 0.8),
            SuiteProfile::Api => (0.9, 0.9),
            SuiteProfile::Standard => (1.0, 1.0),
            SuiteProfile::Integration => (1.1, 1.2),
            SuiteProfile::Ui => (1.3, 1.5),
            SuiteProfile::Performance => (1.5, 1.3),
        }
    }
}

/// Returns `true` if `available` covers `required` on every axis.
pub fn can_allocate(available: &Capacity, required: &Requirement) -> bool {
    available.cpu_percent >= required.cpu_percent
        && available.memory_mb >= required.memory_mb
        && available.slots >= required.slots
}

/// One runner's line in the allocation report.
#[derive(Debug, Clone, Serialize)]
pub struct RunnerAllocationReport {
    pub runner_id: String,
    pub name: String,
    pub runner_type: RunnerType,
    pub max_cpu_percent: f64,
    pub max_memory_mb: u64,
    pub allocated_cpu_percent: f64,
    pub allocated_memory_mb: u64,
    pub cpu_utilization: f64,
    pub memory_utilization: f64,
    pub current_jobs: u32,
    pub max_concurrent_jobs: u32,
    pub allocations: Vec<ResourceAllocation>,
}

/// Writes and inspects resource allocations.
#[derive(Clone)]
pub struct ResourceManager {
    store: Store,
    config: ResourceConfig,
    events: EventSender,
}

impl ResourceManager {
    pub fn new(store: Store, config: ResourceConfig, events: EventSender) -> Self {
        Self {
            store,
            config,
            events,
        }
    }

    /// Capacity `test_suite` needs on `runner`.
    pub fn compute_requirement(
        &self,
        test_suite: &str,
        metadata: &BTreeMap<String, serde_json::Value>,
        runner: &Runner,
    ) -> Requirement {
        let base_cpu = metadata
            .get("cpu_percent")
            .and_then(serde_json::Value::as_f64)
            .filter(|cpu| *cpu > 0.0)
            .unwrap_or(self.config.default_cpu_percent);
        let base_memory = metadata
            .get("memory_mb")
            .and_then(serde_json::Value::as_f64)
            .filter(|mem| *mem > 0.0)
            .unwrap_or(self.config.default_memory_mb as f64);

        let (cpu_factor, memory_factor) = SuiteProfile::classify(test_suite).multipliers();
        let cpu = (base_cpu * cpu_factor).min(runner.capabilities.max_cpu_percent);
        let memory = (base_memory * memory_factor).round() as u64;

        Requirement {
            cpu_percent: cpu,
            memory_mb: memory.min(runner.capabilities.max_memory_mb),
            slots: 1,
        }
    }

    /// CPU and memory held by active allocations, per runner id.
    pub async fn usage(&self) -> HashMap<String, RunnerUsage> {
        let mut usage: HashMap<String, RunnerUsage> = HashMap::new();
        for allocation in self.store.active_allocations().await {
            usage
                .entry(allocation.runner_id.clone())
                .or_default()
                .add(&allocation);
        }
        usage
    }

    /// What `runner` has left, given `usage` from [`usage`](Self::usage).
    pub fn available_capacity(&self, runner: &Runner, usage: &HashMap<String, RunnerUsage>) -> Capacity {
        let used = usage.get(&runner.id).copied().unwrap_or_default();
        Capacity {
            cpu_percent: (runner.capabilities.max_cpu_percent - used.cpu_percent).max(0.0),
            memory_mb: runner.capabilities.max_memory_mb.saturating_sub(used.memory_mb),
            slots: runner.spare_slots(),
        }
    }

    /// Claims capacity on `runner` for `owner_id` (an execution or shard id).
    ///
    /// Returns `None` without writing anything if the runner has no free job
    /// slot at the moment of the claim.
    pub async fn allocate(
        &self,
        owner_id: &str,
        runner: &Runner,
        requirement: &Requirement,
    ) -> StoreResult<Option<ResourceAllocation>> {
        let allocation = ResourceAllocation {
            id: Uuid::new_v4().to_string(),
            execution_id: owner_id.to_string(),
            runner_id: runner.id.clone(),
            cpu_percent: requirement.cpu_percent,
            memory_mb: requirement.memory_mb,
            status: AllocationStatus::Allocated,
            allocated_at: Utc::now(),
            released_at: None,
        };
        if !self.store.claim_allocation(allocation.clone()).await? {
            debug!(runner_id = %runner.id, owner_id = %owner_id, "runner has no free slot");
            return Ok(None);
        }
        debug!(
            allocation_id = %allocation.id,
            runner_id = %runner.id,
            owner_id = %owner_id,
            cpu = allocation.cpu_percent,
            memory_mb = allocation.memory_mb,
            "allocated"
        );
        Ok(Some(allocation))
    }

    /// Releases whatever allocation `owner_id` still holds.
    ///
    /// Returns `false` if there was none, which makes repeated calls harmless.
    pub async fn release(&self, owner_id: &str) -> StoreResult<bool> {
        self.release_at(owner_id, Utc::now()).await
    }

    pub async fn release_at(&self, owner_id: &str, at: DateTime<Utc>) -> StoreResult<bool> {
        let Some(allocation) = self.store.active_allocation_for(owner_id).await else {
            return Ok(false);
        };
        let released = self.store.release_allocation(&allocation.id, at).await?;
        if let Some(allocation) = &released {
            debug!(
                allocation_id = %allocation.id,
                runner_id = %allocation.runner_id,
                owner_id = %owner_id,
                "released"
            );
        }
        Ok(released.is_some())
    }

    /// Per-runner allocation report, in registration order.
    pub async fn allocation_report(&self) -> Vec<RunnerAllocationReport> {
        let runners = self.store.list_runners().await;
        let mut by_runner: HashMap<String, Vec<ResourceAllocation>> = HashMap::new();
        for allocation in self.store.active_allocations().await {
            by_runner
                .entry(allocation.runner_id.clone())
                .or_default()
                .push(allocation);
        }

        runners
            .into_iter()
            .map(|runner| {
                let allocations = by_runner.remove(&runner.id).unwrap_or_default();
                let cpu: f64 = allocations.iter().map(|a| a.cpu_percent).sum();
                let memory: u64 = allocations.iter().map(|a| a.memory_mb).sum();
                RunnerAllocationReport {
                    cpu_utilization: cpu / runner.capabilities.max_cpu_percent,
                    memory_utilization: memory as f64 / runner.capabilities.max_memory_mb as f64,
                    runner_type: runner.runner_type(),
                    max_cpu_percent: runner.capabilities.max_cpu_percent,
                    max_memory_mb: runner.capabilities.max_memory_mb,
                    allocated_cpu_percent: cpu,
                    allocated_memory_mb: memory,
                    current_jobs: runner.current_jobs,
                    max_concurrent_jobs: runner.max_concurrent_jobs,
                    runner_id: runner.id,
                    name: runner.name,
                    allocations,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Capabilities;
    use crate::test_support::{local_runner, manager};

    #[test]
    fn test_requirement_scales_by_suite() {
        let (manager, _) = manager();
        let runner = local_runner("r", 2);
        let empty = BTreeMap::new();

        let unit = manager.compute_requirement("unit", &empty, &runner);
        assert!((unit.cpu_percent - 35.0).abs() < 1e-9);
        assert_eq!(unit.memory_mb, 1638);
        assert_eq!(unit.slots, 1);

        let ui = manager.compute_requirement("ui-checkout", &empty, &runner);
        assert!((ui.cpu_percent - 65.0).abs() < 1e-9);
        assert_eq!(ui.memory_mb, 3072);

        let plain = manager.compute_requirement("build", &empty, &runner);
        assert_eq!(plain.cpu_percent, 50.0);
        assert_eq!(plain.memory_mb, 2048);
    }

    #[test]
    fn test_requirement_metadata_override_and_clamp() {
        let (manager, _) = manager();
        let mut runner = local_runner("small", 2);
        runner.capabilities = Capabilities {
            max_cpu_percent: 100.0,
            max_memory_mb: 1024,
        };

        let mut metadata = BTreeMap::new();
        metadata.insert("cpu_percent".to_string(), serde_json::json!(200));
        metadata.insert("memory_mb".to_string(), serde_json::json!(512));

        let req = manager.compute_requirement("perf", &metadata, &runner);
        // 200 * 1.5 = 300, clamped to the runner's 100.
        assert_eq!(req.cpu_percent, 100.0);
        // 512 * 1.3 = 665.6, rounds to 666.
        assert_eq!(req.memory_mb, 666);
    }

    #[test]
    fn test_can_allocate_checks_every_axis() {
        let required = Requirement {
            cpu_percent: 50.0,
            memory_mb: 2048,
            slots: 1,
        };
        let plenty = Capacity {
            cpu_percent: 400.0,
            memory_mb: 16_384,
            slots: 5,
        };
        assert!(can_allocate(&plenty, &required));
        assert!(!can_allocate(&Capacity { cpu_percent: 40.0, ..plenty }, &required));
        assert!(!can_allocate(&Capacity { memory_mb: 1024, ..plenty }, &required));
        assert!(!can_allocate(&Capacity { slots: 0, ..plenty }, &required));
    }

    #[tokio::test]
    async fn test_allocate_and_release_move_the_job_slot() {
        let (manager, store) = manager();
        let runner = store.insert_runner(local_runner("r", 1)).await.unwrap();
        let req = manager.compute_requirement("unit", &BTreeMap::new(), &runner);

        let first = manager.allocate("e1", &runner, &req).await.unwrap();
        assert!(first.is_some());
        assert!(manager.allocate("e2", &runner, &req).await.unwrap().is_none());
        assert_eq!(store.get_runner(&runner.id).await.unwrap().current_jobs, 1);

        let usage = manager.usage().await;
        let capacity = manager.available_capacity(&store.get_runner(&runner.id).await.unwrap(), &usage);
        assert!((capacity.cpu_percent - 365.0).abs() < 1e-9);
        assert_eq!(capacity.slots, 0);

        assert!(manager.release("e1").await.unwrap());
        assert!(!manager.release("e1").await.unwrap());
        assert_eq!(store.get_runner(&runner.id).await.unwrap().current_jobs, 0);
    }

    #[tokio::test]
    async fn test_allocation_report_sums_active_allocations() {
        let (manager, store) = manager();
        let runner = store.insert_runner(local_runner("r", 3)).await.unwrap();
        let req = Requirement {
            cpu_percent: 100.0,
            memory_mb: 4096,
            slots: 1,
        };
        manager.allocate("e1", &runner, &req).await.unwrap();
        manager.allocate("e2", &runner, &req).await.unwrap();
        manager.release("e2").await.unwrap();

        let report = manager.allocation_report().await;
        assert_eq!(report.len(), 1);
        assert_eq!(report[0].allocations.len(), 1);
        assert_eq!(report[0].allocated_cpu_percent, 100.0);
        assert!((report[0].cpu_utilization - 0.25).abs() < 1e-9);
        assert!((report[0].memory_utilization - 0.25).abs() < 1e-9);
        assert_eq!(report[0].current_jobs, 1);
    }
}
