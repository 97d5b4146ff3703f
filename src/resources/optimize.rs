//! Scale-down suggestions for crowded runners.
//!
//! A runner is a candidate when either utilization ratio passes
//! `high_utilization` (default 0.9), or CPU and memory utilization differ by
//! more than `divergence_threshold` (default 0.3). Suggestions shrink the
//! hotter dimension of each of its active allocations proportionally, never
//! below `min_cpu_percent` / `min_memory_mb`. Applying them only resizes the
//! allocation rows; the executions keep running.

use serde::Serialize;
use tracing::{debug, info};

use super::ResourceManager;
use crate::store::StoreResult;

/// A proposed shrink of one allocation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OptimizationSuggestion {
    pub allocation_id: String,
    pub runner_id: String,
    pub current_cpu_percent: f64,
    pub current_memory_mb: u64,
    pub suggested_cpu_percent: f64,
    pub suggested_memory_mb: u64,
    pub reason: String,
}

impl ResourceManager {
    /// Computes scale-down suggestions for every runner that needs them.
    pub async fn optimize(&self) -> Vec<OptimizationSuggestion> {
        let high = self.config.high_utilization;
        let divergence = self.config.divergence_threshold;
        let mut suggestions = Vec::new();

        for line in self.allocation_report().await {
            if line.allocations.is_empty() {
                continue;
            }
            let cpu_util = line.cpu_utilization;
            let mem_util = line.memory_utilization;

            let mut cpu_scale: f64 = 1.0;
            let mut mem_scale: f64 = 1.0;
            let mut reasons = Vec::new();

            if cpu_util > high {
                cpu_scale = cpu_scale.min(high / cpu_util);
                reasons.push(format!("cpu utilization {:.0}%", cpu_util * 100.0));
            }
            if mem_util > high {
                mem_scale = mem_scale.min(high / mem_util);
                reasons.push(format!("memory utilization {:.0}%", mem_util * 100.0));
            }
            if (cpu_util - mem_util).abs() > divergence {
                // Pull the hotter dimension back to within the threshold.
                if cpu_util > mem_util {
                    cpu_scale = cpu_scale.min((mem_util + divergence) / cpu_util);
                } else {
                    mem_scale = mem_scale.min((cpu_util + divergence) / mem_util);
                }
                reasons.push(format!(
                    "cpu/memory divergence {:.0}%",
                    (cpu_util - mem_util).abs() * 100.0
                ));
            }
            if reasons.is_empty() {
                continue;
            }
            let reason = reasons.join(", ");

            for allocation in &line.allocations {
                let cpu = (allocation.cpu_percent * cpu_scale)
                    .max(self.config.min_cpu_percent)
                    .min(allocation.cpu_percent);
                let memory = ((allocation.memory_mb as f64 * mem_scale).round() as u64)
                    .max(self.config.min_memory_mb)
                    .min(allocation.memory_mb);
                if cpu >= allocation.cpu_percent && memory >= allocation.memory_mb {
                    continue;
                }
                suggestions.push(OptimizationSuggestion {
                    allocation_id: allocation.id.clone(),
                    runner_id: line.runner_id.clone(),
                    current_cpu_percent: allocation.cpu_percent,
                    current_memory_mb: allocation.memory_mb,
                    suggested_cpu_percent: cpu,
                    suggested_memory_mb: memory,
                    reason: reason.clone(),
                });
            }
        }

        debug!(suggestions = suggestions.len(), "optimization pass");
        suggestions
    }

    /// Shrinks allocations per `suggestions`. Allocations released in the
    /// meantime are skipped. Returns how many were resized.
    pub async fn apply_suggestions(&self, suggestions: &[OptimizationSuggestion]) -> StoreResult<usize> {
        let mut applied = 0;
        for s in suggestions {
            let cpu = s.suggested_cpu_percent.min(s.current_cpu_percent);
            let memory = s.suggested_memory_mb.min(s.current_memory_mb);
            if self.store.resize_allocation(&s.allocation_id, cpu, memory).await? {
                applied += 1;
            }
        }
        if applied > 0 {
            info!(applied, "Applied allocation scale-downs");
        }
        Ok(applied)
    }
}

#[cfg(test)]
mod tests {
    use crate::resources::Requirement;
    use crate::test_support::{local_runner, manager};

    #[tokio::test]
    async fn test_balanced_runner_gets_no_suggestions() {
        let (manager, store) = manager();
        let runner = store.insert_runner(local_runner("r", 4)).await.unwrap();
        // 25% cpu, 25% memory.
        let req = Requirement {
            cpu_percent: 100.0,
            memory_mb: 4096,
            slots: 1,
        };
        manager.allocate("e1", &runner, &req).await.unwrap();

        assert!(manager.optimize().await.is_empty());
    }

    #[tokio::test]
    async fn test_hot_cpu_is_scaled_down_and_applied() {
        let (manager, store) = manager();
        let runner = store.insert_runner(local_runner("r", 4)).await.unwrap();
        // Two 200% claims fill the 400% budget; memory sits at 12.5%.
        let req = Requirement {
            cpu_percent: 200.0,
            memory_mb: 1024,
            slots: 1,
        };
        manager.allocate("e1", &runner, &req).await.unwrap();
        manager.allocate("e2", &runner, &req).await.unwrap();

        let suggestions = manager.optimize().await;
        assert_eq!(suggestions.len(), 2);
        for s in &suggestions {
            // Divergence pulls cpu to 0.125 + 0.3 = 42.5% of 400%, split in two.
            assert!((s.suggested_cpu_percent - 85.0).abs() < 1e-6);
            assert_eq!(s.suggested_memory_mb, 1024);
            assert!(s.reason.contains("divergence"));
        }

        assert_eq!(manager.apply_suggestions(&suggestions).await.unwrap(), 2);
        let active = store.active_allocations().await;
        assert!(active.iter().all(|a| (a.cpu_percent - 85.0).abs() < 1e-6));

        // A released allocation is skipped.
        manager.release("e1").await.unwrap();
        assert_eq!(manager.apply_suggestions(&suggestions).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_suggestions_respect_floors() {
        let (manager, store) = manager();
        let runner = store.insert_runner(local_runner("r", 4)).await.unwrap();
        let req = Requirement {
            cpu_percent: 12.0,
            memory_mb: 16_000,
            slots: 1,
        };
        manager.allocate("e1", &runner, &req).await.unwrap();

        let suggestions = manager.optimize().await;
        assert_eq!(suggestions.len(), 1);
        assert_eq!(suggestions[0].suggested_cpu_percent, 12.0);
        assert!(suggestions[0].suggested_memory_mb >= 256);
        assert!(suggestions[0].suggested_memory_mb < 16_000);
    }
}
