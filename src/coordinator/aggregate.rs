//! Folding shard outcomes into one parent result.
//!
//! A parent's status is never stored; it is derived from its shards:
//!
//! | Shards | Parent |
//! |--------|--------|
//! | any `pending` or `running` | `running` |
//! | all terminal, none `failed` | `completed` |
//! | all terminal, at least one `failed` | `failed` |

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{ParallelRun, Shard, ShardStatus, TestResults};

/// Derived status of a parallel run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParallelStatus {
    Running,
    Completed,
    Failed,
}

impl ParallelStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ParallelStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ParallelStatus::Running => "running",
            ParallelStatus::Completed => "completed",
            ParallelStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for ParallelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn derive_status(shards: &[Shard]) -> ParallelStatus {
    if shards.iter().any(|s| !s.status.is_terminal()) {
        ParallelStatus::Running
    } else if shards.iter().any(|s| s.status == ShardStatus::Failed) {
        ParallelStatus::Failed
    } else {
        ParallelStatus::Completed
    }
}

/// Error message reported by (or recorded for) one shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardError {
    pub shard_index: u32,
    pub message: String,
}

/// Final outcome of a parallel run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedResult {
    pub parent_id: String,
    pub test_suite: String,
    pub environment: String,
    pub status: ParallelStatus,
    pub total_shards: u32,
    pub completed_shards: u32,
    pub failed_shards: u32,

    /// Element-wise sum of shard counts. Failed tests carry the index of
    /// the shard that reported them.
    pub totals: TestResults,
    pub shard_errors: Vec<ShardError>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl AggregatedResult {
    pub fn duration(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }
}

/// Combines `shards` (in index order) into the result for `run`.
pub fn aggregate(run: &ParallelRun, shards: &[Shard], finished_at: DateTime<Utc>) -> AggregatedResult {
    let mut totals = TestResults::default();
    let mut shard_errors = Vec::new();
    let mut completed_shards = 0;
    let mut failed_shards = 0;

    for shard in shards {
        match shard.status {
            ShardStatus::Completed => completed_shards += 1,
            ShardStatus::Failed => failed_shards += 1,
            ShardStatus::Pending | ShardStatus::Running => {}
        }

        if let Some(results) = &shard.results {
            let mut stamped = results.clone();
            for test in &mut stamped.failed_tests {
                test.shard_index = Some(shard.shard_index);
            }
            totals.absorb(&stamped);
        }

        if let Some(message) = &shard.error_message {
            shard_errors.push(ShardError {
                shard_index: shard.shard_index,
                message: message.clone(),
            });
        }
    }

    AggregatedResult {
        parent_id: run.parent_id.clone(),
        test_suite: run.test_suite.clone(),
        environment: run.environment.clone(),
        status: derive_status(shards),
        total_shards: run.total_shards,
        completed_shards,
        failed_shards,
        totals,
        shard_errors,
        started_at: run.created_at,
        finished_at,
    }
}
