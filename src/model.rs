//! Core records shared by the scheduler, allocation manager and coordinator.
//!
//! Every record here is plain data. Mutation goes through the
//! [`Store`](crate::store::Store), which applies each change as a single
//! conditional update keyed by id.
//!
//! # Status Machines
//!
//! ```text
//! Execution:  queued ──► assigned ──► running ──► completed | failed | timeout
//!                │            │                         ▲
//!                └────────────┴─────────────────────────┘ (timeout / invocation failure)
//!
//! Shard:      pending ──► running ──► completed | failed
//! ```
//!
//! Transitions only move forward. [`ExecutionStatus::rank`] and
//! [`ShardStatus::rank`] give the ordering used to reject regressions.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::RunnerBackend;

/// Priority assigned to submissions that don't specify one.
pub const DEFAULT_PRIORITY: i32 = 50;

/// Lifecycle state of an [`Execution`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    /// Waiting in the queue for placement.
    Queued,
    /// Placed on a runner; invocation issued but not yet acknowledged.
    Assigned,
    /// The runner accepted the invocation.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished with a failure, or the invocation could not be issued.
    Failed,
    /// No completion report arrived before the deadline.
    Timeout,
}

impl ExecutionStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [ExecutionStatus; 6] = [
        ExecutionStatus::Queued,
        ExecutionStatus::Assigned,
        ExecutionStatus::Running,
        ExecutionStatus::Completed,
        ExecutionStatus::Failed,
        ExecutionStatus::Timeout,
    ];

    /// Statuses that still hold a place in the active queue.
    pub const ACTIVE: [ExecutionStatus; 3] = [
        ExecutionStatus::Queued,
        ExecutionStatus::Assigned,
        ExecutionStatus::Running,
    ];

    /// Returns `true` once no further transition is possible.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Timeout
        )
    }

    /// Position in the lifecycle. Terminal states share the highest rank.
    pub fn rank(&self) -> u8 {
        match self {
            ExecutionStatus::Queued => 0,
            ExecutionStatus::Assigned => 1,
            ExecutionStatus::Running => 2,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Timeout => 3,
        }
    }

    /// Returns `true` if moving from `self` to `next` goes forward.
    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Queued => "queued",
            ExecutionStatus::Assigned => "assigned",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Timeout => "timeout",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ExecutionStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown execution status: {s}"))
    }
}

/// Terminal status carried by a completion callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportedStatus {
    Completed,
    Failed,
}

impl ReportedStatus {
    pub fn execution_status(self) -> ExecutionStatus {
        match self {
            ReportedStatus::Completed => ExecutionStatus::Completed,
            ReportedStatus::Failed => ExecutionStatus::Failed,
        }
    }

    pub fn shard_status(self) -> ShardStatus {
        match self {
            ReportedStatus::Completed => ShardStatus::Completed,
            ReportedStatus::Failed => ShardStatus::Failed,
        }
    }
}

/// A request to run a test suite, as accepted by
/// [`ExecutionScheduler::submit`](crate::scheduler::ExecutionScheduler::submit).
///
/// # Example
///
/// ```
/// use convoy::model::{RunnerType, SubmitRequest};
///
/// let request = SubmitRequest::new("api-tests", "staging")
///     .priority(90)
///     .runner_type(RunnerType::Docker)
///     .estimated_duration_secs(600)
///     .metadata("commit", "3f2a9c1");
///
/// assert_eq!(request.priority, Some(90));
/// assert_eq!(request.metadata.len(), 1);
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub test_suite: String,
    pub environment: String,
    pub priority: Option<i32>,
    pub requested_runner_type: Option<RunnerType>,
    pub requested_runner_id: Option<String>,
    pub estimated_duration_secs: Option<u64>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl SubmitRequest {
    pub fn new(test_suite: impl Into<String>, environment: impl Into<String>) -> Self {
        Self {
            test_suite: test_suite.into(),
            environment: environment.into(),
            ..Default::default()
        }
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Pins the execution to runners of one backend kind.
    pub fn runner_type(mut self, runner_type: RunnerType) -> Self {
        self.requested_runner_type = Some(runner_type);
        self
    }

    /// Pins the execution to a single runner.
    pub fn runner_id(mut self, runner_id: impl Into<String>) -> Self {
        self.requested_runner_id = Some(runner_id.into());
        self
    }

    pub fn estimated_duration_secs(mut self, secs: u64) -> Self {
        self.estimated_duration_secs = Some(secs);
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// One logical test-run request and its progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub id: String,
    pub test_suite: String,
    pub environment: String,

    /// Higher is more urgent.
    pub priority: i32,
    pub requested_runner_type: Option<RunnerType>,
    pub requested_runner_id: Option<String>,
    pub estimated_duration_secs: Option<u64>,
    pub metadata: BTreeMap<String, serde_json::Value>,

    pub status: ExecutionStatus,

    /// Runner the execution was placed on.
    pub runner_id: Option<String>,

    pub queued_at: DateTime<Utc>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,

    /// Deadline after which the timeout sweep forces `timeout`.
    pub timeout_at: DateTime<Utc>,

    pub results: Option<TestResults>,
    pub error_message: Option<String>,

    /// Store-assigned enqueue order.
    pub sequence: u64,
}

impl Execution {
    /// Returns `true` if `runner` satisfies this execution's type/id pin.
    pub fn accepts_runner(&self, runner: &Runner) -> bool {
        let type_ok = self
            .requested_runner_type
            .is_none_or(|wanted| wanted == runner.runner_type());
        let id_ok = self
            .requested_runner_id
            .as_deref()
            .is_none_or(|wanted| wanted == runner.id);
        type_ok && id_ok
    }
}

/// Backend kinds a runner can be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunnerType {
    GithubActions,
    AzureDevops,
    Jenkins,
    Gitlab,
    Docker,
    Local,
}

impl RunnerType {
    pub const ALL: [RunnerType; 6] = [
        RunnerType::GithubActions,
        RunnerType::AzureDevops,
        RunnerType::Jenkins,
        RunnerType::Gitlab,
        RunnerType::Docker,
        RunnerType::Local,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RunnerType::GithubActions => "github-actions",
            RunnerType::AzureDevops => "azure-devops",
            RunnerType::Jenkins => "jenkins",
            RunnerType::Gitlab => "gitlab",
            RunnerType::Docker => "docker",
            RunnerType::Local => "local",
        }
    }
}

impl fmt::Display for RunnerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunnerType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RunnerType::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| {
                format!(
                    "unknown runner type: {s} (expected one of: github-actions, azure-devops, jenkins, gitlab, docker, local)"
                )
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunnerStatus {
    Active,
    Inactive,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    /// No health check has completed yet.
    Unknown,
}

/// Declared resource limits of a runner.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Capabilities {
    /// CPU budget in percent units (400.0 = four cores).
    #[serde(default = "default_max_cpu_percent")]
    pub max_cpu_percent: f64,

    #[serde(default = "default_max_memory_mb")]
    pub max_memory_mb: u64,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            max_cpu_percent: default_max_cpu_percent(),
            max_memory_mb: default_max_memory_mb(),
        }
    }
}

fn default_max_cpu_percent() -> f64 {
    400.0
}

fn default_max_memory_mb() -> u64 {
    16_384
}

/// An execution backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Runner {
    pub id: String,
    pub name: String,

    /// Backend-specific configuration; also determines the runner type.
    pub backend: RunnerBackend,

    pub status: RunnerStatus,
    pub health: HealthStatus,
    pub last_health_check: Option<DateTime<Utc>>,
    pub health_response_ms: Option<u64>,
    pub health_error: Option<String>,

    pub max_concurrent_jobs: u32,

    /// Jobs currently holding a slot. Only the allocation API writes this.
    pub current_jobs: u32,

    /// Selection weight; higher is preferred.
    pub priority: i32,
    pub capabilities: Capabilities,
    pub health_check_url: Option<String>,
    pub registered_at: DateTime<Utc>,

    /// Store-assigned registration order.
    pub sequence: u64,
}

impl Runner {
    pub fn runner_type(&self) -> RunnerType {
        self.backend.runner_type()
    }

    /// Free job slots.
    pub fn spare_slots(&self) -> u32 {
        self.max_concurrent_jobs.saturating_sub(self.current_jobs)
    }

    /// Fraction of job slots still free, in `0.0..=1.0`.
    pub fn spare_ratio(&self) -> f64 {
        if self.max_concurrent_jobs == 0 {
            return 0.0;
        }
        f64::from(self.spare_slots()) / f64::from(self.max_concurrent_jobs)
    }

    pub fn has_free_slot(&self) -> bool {
        self.current_jobs < self.max_concurrent_jobs
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AllocationStatus {
    Allocated,
    Released,
    /// Still held, but flagged by the monitor as over the runner's limits.
    Exceeded,
}

impl AllocationStatus {
    /// Statuses that still consume runner capacity.
    pub const ACTIVE: [AllocationStatus; 2] = [AllocationStatus::Allocated, AllocationStatus::Exceeded];

    pub fn is_active(&self) -> bool {
        !matches!(self, AllocationStatus::Released)
    }
}

/// A capacity claim held on a runner for one execution or shard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceAllocation {
    pub id: String,

    /// Id of the owning execution, or of the shard for parallel runs.
    pub execution_id: String,
    pub runner_id: String,
    pub cpu_percent: f64,
    pub memory_mb: u64,
    pub status: AllocationStatus,
    pub allocated_at: DateTime<Utc>,
    pub released_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RuleType {
    PriorityBased,
    ResourceBased,
    RoundRobin,
    Custom,
}

/// A named runner-selection policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadBalancingRule {
    pub id: String,
    pub name: String,
    pub rule_type: RuleType,

    /// Glob, or regular expression when prefixed with `regex:`.
    pub suite_pattern: Option<String>,
    pub env_pattern: Option<String>,

    /// Restricts candidates to one runner type.
    pub runner_type: Option<RunnerType>,

    /// Rule ordering; the highest matching rule wins.
    pub priority: i32,
    pub active: bool,
    pub sequence: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShardStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl ShardStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ShardStatus::Completed | ShardStatus::Failed)
    }

    pub fn rank(&self) -> u8 {
        match self {
            ShardStatus::Pending => 0,
            ShardStatus::Running => 1,
            ShardStatus::Completed | ShardStatus::Failed => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ShardStatus::Pending => "pending",
            ShardStatus::Running => "running",
            ShardStatus::Completed => "completed",
            ShardStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for ShardStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One partition of a parallel execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shard {
    pub id: String,
    pub parent_id: String,

    /// Zero-based position within the parent.
    pub shard_index: u32,
    pub total_shards: u32,
    pub status: ShardStatus,
    pub runner_id: Option<String>,
    pub results: Option<TestResults>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// A test reported as failing by a runner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedTest {
    pub name: String,
    #[serde(default)]
    pub message: Option<String>,

    /// Set during aggregation to the shard that reported the failure.
    #[serde(default)]
    pub shard_index: Option<u32>,
}

/// Test counts reported by a runner on completion.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestResults {
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub passed: u64,
    #[serde(default)]
    pub failed: u64,
    #[serde(default)]
    pub skipped: u64,
    #[serde(default)]
    pub failed_tests: Vec<FailedTest>,
}

impl TestResults {
    /// Adds `other`'s counts into `self` and appends its failed tests.
    pub fn absorb(&mut self, other: &TestResults) {
        self.total += other.total;
        self.passed += other.passed;
        self.failed += other.failed;
        self.skipped += other.skipped;
        self.failed_tests.extend(other.failed_tests.iter().cloned());
    }
}

/// Tracking record for a parallel execution that has not been finalized.
///
/// The parent's status is never stored here; it is derived from the shards
/// via [`aggregate::derive_status`](crate::coordinator::aggregate::derive_status).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParallelRun {
    pub parent_id: String,
    pub test_suite: String,
    pub environment: String,
    pub total_shards: u32,
    pub runner_type: Option<RunnerType>,
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub finalized_at: Option<DateTime<Utc>>,
    pub result: Option<crate::coordinator::aggregate::AggregatedResult>,
}
