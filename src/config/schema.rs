//! Configuration schema definitions for convoy.
//!
//! This module defines all configuration types that can be deserialized from
//! TOML configuration files. The schema uses serde for serialization and
//! tagged enums for runner backend selection.
//!
//! # Schema Overview
//!
//! ```text
//! Config (root)
//! ├── ConvoyConfig           - Scheduler cadence, priorities, timeout policy
//! ├── ParallelConfig         - Shard timeouts and stuck detection
//! ├── ResourceConfig         - Default requirements and optimization thresholds
//! ├── Vec<RunnerConfig>      - Runners registered at startup
//! │   └── RunnerBackend      - Tagged enum selecting backend type
//! │       ├── Local          - Shell command on this machine
//! │       ├── Docker         - One container per invocation
//! │       └── GithubActions / AzureDevops / Jenkins / Gitlab
//! ├── Vec<RuleConfig>        - Load balancing rules
//! └── ReportConfig           - Output and reporting settings
//! ```

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::model::{Capabilities, RuleType, RunnerType};

/// Root configuration structure for convoy.
///
/// # TOML Structure
///
/// ```toml
/// [convoy]
/// scheduler_interval_secs = 5
/// callback_address = "http://convoy.internal:8080/callbacks"
///
/// [[runners]]
/// name = "local-1"
/// max_concurrent_jobs = 2
///
/// [runners.backend]
/// type = "local"
/// command = "./scripts/run-suite.sh {test_suite} {environment}"
///
/// [[rules]]
/// name = "ui-on-docker"
/// rule_type = "resource-based"
/// suite_pattern = "ui-*"
/// runner_type = "docker"
/// ```
///
/// # Example
///
/// ```
/// use convoy::config::Config;
///
/// let config: Config = toml::from_str(r#"
///     [[runners]]
///     name = "local-1"
///
///     [runners.backend]
///     type = "local"
///     command = "true"
/// "#).unwrap();
///
/// assert_eq!(config.runners.len(), 1);
/// assert_eq!(config.convoy.timeout_floor_secs, 1800);
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Core scheduling settings.
    #[serde(default)]
    pub convoy: ConvoyConfig,

    /// Parallel (sharded) execution settings.
    #[serde(default)]
    pub parallel: ParallelConfig,

    /// Resource accounting settings.
    #[serde(default)]
    pub resources: ResourceConfig,

    /// Runners registered when the engine starts.
    #[serde(default)]
    pub runners: Vec<RunnerConfig>,

    /// Load balancing rules configured when the engine starts.
    #[serde(default)]
    pub rules: Vec<RuleConfig>,

    /// Report configuration for output generation.
    #[serde(default)]
    pub report: ReportConfig,
}

/// Core scheduler settings.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `scheduler_interval_secs` | 5 |
/// | `timeout_sweep_interval_secs` | 60 |
/// | `monitor_interval_secs` | 30 |
/// | `coordination_interval_secs` | 10 |
/// | `default_priority` | 50 |
/// | `timeout_multiplier` | 1.3 |
/// | `timeout_floor_secs` | 1800 (30 minutes) |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConvoyConfig {
    /// Interval between scheduling passes.
    #[serde(default = "default_scheduler_interval")]
    pub scheduler_interval_secs: u64,

    /// Interval between execution timeout sweeps.
    #[serde(default = "default_timeout_sweep_interval")]
    pub timeout_sweep_interval_secs: u64,

    /// Interval between resource monitoring passes (and orphan cleanup).
    #[serde(default = "default_monitor_interval")]
    pub monitor_interval_secs: u64,

    /// Interval between parallel coordination passes.
    #[serde(default = "default_coordination_interval")]
    pub coordination_interval_secs: u64,

    /// Priority assigned to submissions that don't specify one.
    #[serde(default = "default_priority")]
    pub default_priority: i32,

    /// Estimated duration is multiplied by this to get the timeout.
    #[serde(default = "default_timeout_multiplier")]
    pub timeout_multiplier: f64,

    /// Lower bound for an execution's timeout.
    #[serde(default = "default_timeout_floor")]
    pub timeout_floor_secs: u64,

    /// Address runners report completion to. Passed through in every payload.
    #[serde(default = "default_callback_address")]
    pub callback_address: String,
}

impl Default for ConvoyConfig {
    fn default() -> Self {
        Self {
            scheduler_interval_secs: default_scheduler_interval(),
            timeout_sweep_interval_secs: default_timeout_sweep_interval(),
            monitor_interval_secs: default_monitor_interval(),
            coordination_interval_secs: default_coordination_interval(),
            default_priority: default_priority(),
            timeout_multiplier: default_timeout_multiplier(),
            timeout_floor_secs: default_timeout_floor(),
            callback_address: default_callback_address(),
        }
    }
}

fn default_scheduler_interval() -> u64 {
    5
}

fn default_timeout_sweep_interval() -> u64 {
    60
}

fn default_monitor_interval() -> u64 {
    30
}

fn default_coordination_interval() -> u64 {
    10
}

fn default_priority() -> i32 {
    crate::model::DEFAULT_PRIORITY
}

fn default_timeout_multiplier() -> f64 {
    1.3
}

fn default_timeout_floor() -> u64 {
    1800 // 30 minutes
}

fn default_callback_address() -> String {
    "http://127.0.0.1:7070/callbacks".to_string()
}

/// Parallel execution settings.
///
/// ```toml
/// [parallel]
/// shard_timeout_secs = 7200
/// stuck_after_secs = 600
/// max_shards = 64
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ParallelConfig {
    /// A running shard is failed once it has run this long.
    ///
    /// Default: 7200 (2 hours)
    #[serde(default = "default_shard_timeout")]
    pub shard_timeout_secs: u64,

    /// A parent with no running shard is escalated after this long.
    ///
    /// Default: 600 (10 minutes)
    #[serde(default = "default_stuck_after")]
    pub stuck_after_secs: u64,

    /// Upper bound on `total_shards` for one request.
    #[serde(default = "default_max_shards")]
    pub max_shards: u32,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            shard_timeout_secs: default_shard_timeout(),
            stuck_after_secs: default_stuck_after(),
            max_shards: default_max_shards(),
        }
    }
}

fn default_shard_timeout() -> u64 {
    7200
}

fn default_stuck_after() -> u64 {
    600
}

fn default_max_shards() -> u32 {
    64
}

/// Resource accounting settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ResourceConfig {
    /// CPU claimed by an execution before suite scaling, in percent.
    #[serde(default = "default_cpu_percent")]
    pub default_cpu_percent: f64,

    /// Memory claimed by an execution before suite scaling.
    #[serde(default = "default_memory_mb")]
    pub default_memory_mb: u64,

    /// Utilization ratio above which the optimizer proposes scale-downs.
    #[serde(default = "default_high_utilization")]
    pub high_utilization: f64,

    /// CPU/memory utilization gap above which the optimizer proposes scale-downs.
    #[serde(default = "default_divergence")]
    pub divergence_threshold: f64,

    /// Smallest CPU claim the optimizer will suggest.
    #[serde(default = "default_min_cpu_percent")]
    pub min_cpu_percent: f64,

    /// Smallest memory claim the optimizer will suggest.
    #[serde(default = "default_min_memory_mb")]
    pub min_memory_mb: u64,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            default_cpu_percent: default_cpu_percent(),
            default_memory_mb: default_memory_mb(),
            high_utilization: default_high_utilization(),
            divergence_threshold: default_divergence(),
            min_cpu_percent: default_min_cpu_percent(),
            min_memory_mb: default_min_memory_mb(),
        }
    }
}

fn default_cpu_percent() -> f64 {
    50.0
}

fn default_memory_mb() -> u64 {
    2048
}

fn default_high_utilization() -> f64 {
    0.9
}

fn default_divergence() -> f64 {
    0.3
}

fn default_min_cpu_percent() -> f64 {
    10.0
}

fn default_min_memory_mb() -> u64 {
    256
}

/// A runner registered at startup.
///
/// ```toml
/// [[runners]]
/// name = "docker-large"
/// max_concurrent_jobs = 4
/// priority = 80
/// health_check_url = "http://docker-large.internal/health"
///
/// [runners.capabilities]
/// max_cpu_percent = 800
/// max_memory_mb = 32768
///
/// [runners.backend]
/// type = "docker"
/// image = "ghcr.io/acme/test-runner:latest"
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RunnerConfig {
    pub name: String,

    /// How the runner is invoked.
    pub backend: RunnerBackend,

    /// Default: 5
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: u32,

    /// Default: 50
    #[serde(default = "default_runner_priority")]
    pub priority: i32,

    #[serde(default)]
    pub capabilities: Capabilities,

    pub health_check_url: Option<String>,
}

pub(crate) fn default_max_concurrent_jobs() -> u32 {
    5
}

pub(crate) fn default_runner_priority() -> i32 {
    50
}

/// Backend-specific runner configuration.
///
/// This is a tagged enum that selects the backend based on the `type` field
/// in TOML. The variant also determines the runner's [`RunnerType`].
///
/// | Type | Invoker |
/// |------|---------|
/// | `local` | [`LocalInvoker`](crate::invoker::local::LocalInvoker) |
/// | `docker` | [`DockerInvoker`](crate::invoker::docker::DockerInvoker) |
/// | `github-actions`, `azure-devops`, `jenkins`, `gitlab` | supplied by the embedding application |
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RunnerBackend {
    /// Run a shell command on this machine.
    Local(LocalBackendConfig),

    /// Run a container per invocation.
    Docker(DockerBackendConfig),

    /// Dispatch a GitHub Actions workflow.
    GithubActions(GithubActionsConfig),

    /// Queue an Azure DevOps pipeline run.
    AzureDevops(AzureDevopsConfig),

    /// Trigger a Jenkins job.
    Jenkins(JenkinsConfig),

    /// Trigger a GitLab pipeline.
    Gitlab(GitlabConfig),
}

impl RunnerBackend {
    pub fn runner_type(&self) -> RunnerType {
        match self {
            RunnerBackend::Local(_) => RunnerType::Local,
            RunnerBackend::Docker(_) => RunnerType::Docker,
            RunnerBackend::GithubActions(_) => RunnerType::GithubActions,
            RunnerBackend::AzureDevops(_) => RunnerType::AzureDevops,
            RunnerBackend::Jenkins(_) => RunnerType::Jenkins,
            RunnerBackend::Gitlab(_) => RunnerType::Gitlab,
        }
    }
}

/// Configuration for a local command runner.
///
/// The command is a template run via `{shell} -c`. Placeholders are replaced
/// with shell-quoted values:
///
/// | Placeholder | Value |
/// |-------------|-------|
/// | `{execution_id}` | Execution or shard id |
/// | `{test_suite}` | Suite identifier |
/// | `{environment}` | Target environment |
/// | `{shard_index}` | Zero-based shard index (empty for plain executions) |
/// | `{total_shards}` | Shard count (empty for plain executions) |
/// | `{callback_address}` | Completion callback address |
///
/// If the command's last stdout line is a JSON object, it is parsed as the
/// run's test counts (`{"total": 10, "passed": 9, "failed": 1, "skipped": 0}`).
///
/// ```toml
/// [runners.backend]
/// type = "local"
/// command = "pytest -q tests/{test_suite} --shard {shard_index}/{total_shards}"
/// working_dir = "~/src/project"
///
/// [runners.backend.env]
/// PYTHONDONTWRITEBYTECODE = "1"
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct LocalBackendConfig {
    pub command: String,

    /// Working directory for the command. `~` and `$VARS` are expanded.
    pub working_dir: Option<String>,

    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Default: `/bin/sh`
    #[serde(default = "default_shell")]
    pub shell: String,
}

fn default_shell() -> String {
    "/bin/sh".to_string()
}

/// Configuration for a Docker runner.
///
/// ```toml
/// [runners.backend]
/// type = "docker"
/// image = "python:3.12-slim"
/// command = ["sh", "-c", "pytest -q $CONVOY_TEST_SUITE"]
/// network_mode = "bridge"
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DockerBackendConfig {
    pub image: String,

    /// Overrides the image's default command.
    #[serde(default)]
    pub command: Vec<String>,

    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Default: `bridge`
    #[serde(default = "default_network_mode")]
    pub network_mode: String,

    /// Docker daemon URL. Uses the local socket when unset.
    pub docker_host: Option<String>,
}

fn default_network_mode() -> String {
    "bridge".to_string()
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct GithubActionsConfig {
    pub owner: String,
    pub repo: String,
    pub workflow: String,
    #[serde(default = "default_git_ref")]
    pub git_ref: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct AzureDevopsConfig {
    pub organization: String,
    pub project: String,
    pub pipeline_id: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct JenkinsConfig {
    pub url: String,
    pub job: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct GitlabConfig {
    pub project_id: u64,
    #[serde(default = "default_git_ref")]
    pub git_ref: String,
}

fn default_git_ref() -> String {
    "main".to_string()
}

/// A load balancing rule configured at startup.
///
/// ```toml
/// [[rules]]
/// name = "prod-by-weight"
/// rule_type = "priority-based"
/// env_pattern = "regex:^prod(-.*)?$"
/// priority = 20
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RuleConfig {
    pub name: String,
    pub rule_type: RuleType,
    pub suite_pattern: Option<String>,
    pub env_pattern: Option<String>,
    pub runner_type: Option<RunnerType>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_true")]
    pub active: bool,
}

/// Configuration for result reporting.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `output_dir` | `"test-results"` |
/// | `junit` | `true` |
/// | `junit_file` | `"junit.xml"` |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReportConfig {
    /// Directory where report files are written.
    #[serde(default = "default_report_dir")]
    pub output_dir: PathBuf,

    /// Whether to generate a JUnit XML report.
    #[serde(default = "default_true")]
    pub junit: bool,

    /// Filename for the JUnit XML report, written to `{output_dir}/{junit_file}`.
    #[serde(default = "default_junit_file")]
    pub junit_file: String,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            output_dir: default_report_dir(),
            junit: true,
            junit_file: default_junit_file(),
        }
    }
}

fn default_report_dir() -> PathBuf {
    PathBuf::from("test-results")
}

fn default_true() -> bool {
    true
}

fn default_junit_file() -> String {
    "junit.xml".to_string()
}
