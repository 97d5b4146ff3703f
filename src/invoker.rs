//! Runner invocation.
//!
//! An [`Invoker`] starts work on a runner and returns as soon as the runner
//! has accepted it. Progress comes back later as [`RunnerCallback`]s on a
//! completion channel, the same path an external CI system would use to
//! report through the callback address.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  trigger(runner, payload)   ┌───────────────────────┐
//! │  Scheduler / │ ──────────────────────────► │ Invokers              │
//! │  Coordinator │                             │  (dispatch by type)   │
//! └──────▲───────┘                             │   local  ─► Local     │
//!        │                                     │   docker ─► Docker    │
//!        │ RunnerCallback                      │   ...    ─► embedder  │
//!        │ (Started / Finished)                └──────────┬────────────┘
//!        └────────────────────────────────────────────────┘
//!                        CompletionSender
//! ```
//!
//! # Built-in Invokers
//!
//! | Runner type | Invoker | Description |
//! |-------------|---------|-------------|
//! | `local` | [`local::LocalInvoker`] | Shell command on this machine |
//! | `docker` | [`docker::DockerInvoker`] | One container per invocation |
//!
//! Vendor CI backends (`github-actions`, `azure-devops`, `jenkins`,
//! `gitlab`) are registered by the embedding application with
//! [`Invokers::with`].
//!
//! # Error Handling
//!
//! `trigger` fails only when the work could not be handed to the runner.
//! A test run that starts and then fails is not an error: it is reported as
//! a [`ReportedStatus::Failed`] completion.

pub mod docker;
pub mod local;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::model::{ReportedStatus, Runner, RunnerType, TestResults};

/// Result type for invocation.
pub type InvokeResult<T> = Result<T, InvokeError>;

/// Errors raised while handing work to a runner.
#[derive(Debug, thiserror::Error)]
pub enum InvokeError {
    /// No invoker is registered for the runner's type.
    #[error("No invoker registered for runner type {0}")]
    Unsupported(RunnerType),

    /// The runner's backend configuration doesn't fit the invoker.
    #[error("Runner misconfigured: {0}")]
    Misconfigured(String),

    /// The backend refused or failed to start the work.
    #[error("Failed to launch: {0}")]
    Launch(String),

    /// The backend could not be reached.
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Everything a runner needs to start one execution or shard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationPayload {
    /// Execution id, or shard id for parallel runs. Completion reports must
    /// carry this id.
    pub execution_id: String,
    pub test_suite: String,
    pub environment: String,
    pub callback_address: String,
    pub shard_index: Option<u32>,
    pub total_shards: Option<u32>,
    pub parent_execution_id: Option<String>,

    /// Capacity reserved for the run. Backends that can enforce limits may
    /// apply these.
    pub cpu_percent: Option<f64>,
    pub memory_mb: Option<u64>,

    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl InvocationPayload {
    pub fn new(
        execution_id: impl Into<String>,
        test_suite: impl Into<String>,
        environment: impl Into<String>,
        callback_address: impl Into<String>,
    ) -> Self {
        Self {
            execution_id: execution_id.into(),
            test_suite: test_suite.into(),
            environment: environment.into(),
            callback_address: callback_address.into(),
            shard_index: None,
            total_shards: None,
            parent_execution_id: None,
            cpu_percent: None,
            memory_mb: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn shard(mut self, parent_id: impl Into<String>, index: u32, total: u32) -> Self {
        self.parent_execution_id = Some(parent_id.into());
        self.shard_index = Some(index);
        self.total_shards = Some(total);
        self
    }

    pub fn resources(mut self, cpu_percent: f64, memory_mb: u64) -> Self {
        self.cpu_percent = Some(cpu_percent);
        self.memory_mb = Some(memory_mb);
        self
    }

    pub fn metadata(mut self, metadata: BTreeMap<String, serde_json::Value>) -> Self {
        self.metadata = metadata;
        self
    }

    /// `CONVOY_*` environment variables describing the run.
    pub fn env_vars(&self) -> Vec<(String, String)> {
        let mut vars = vec![
            ("CONVOY_EXECUTION_ID".to_string(), self.execution_id.clone()),
            ("CONVOY_TEST_SUITE".to_string(), self.test_suite.clone()),
            ("CONVOY_ENVIRONMENT".to_string(), self.environment.clone()),
            ("CONVOY_CALLBACK_ADDRESS".to_string(), self.callback_address.clone()),
        ];
        if let (Some(index), Some(total)) = (self.shard_index, self.total_shards) {
            vars.push(("CONVOY_SHARD_INDEX".to_string(), index.to_string()));
            vars.push(("CONVOY_TOTAL_SHARDS".to_string(), total.to_string()));
        }
        if let Some(parent) = &self.parent_execution_id {
            vars.push(("CONVOY_PARENT_ID".to_string(), parent.clone()));
        }
        vars
    }
}

/// A terminal report for one execution or shard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionReport {
    /// Execution or shard id.
    pub id: String,
    pub status: ReportedStatus,
    #[serde(default)]
    pub results: Option<TestResults>,
    #[serde(default)]
    pub error_message: Option<String>,
}

impl CompletionReport {
    pub fn completed(id: impl Into<String>, results: Option<TestResults>) -> Self {
        Self {
            id: id.into(),
            status: ReportedStatus::Completed,
            results,
            error_message: None,
        }
    }

    pub fn failed(id: impl Into<String>, error_message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: ReportedStatus::Failed,
            results: None,
            error_message: Some(error_message.into()),
        }
    }
}

/// A message from a runner about work it was given.
#[derive(Debug, Clone, PartialEq)]
pub enum RunnerCallback {
    /// The runner began executing the work item with this id.
    Started(String),
    Finished(CompletionReport),
}

pub type CompletionSender = mpsc::UnboundedSender<RunnerCallback>;
pub type CompletionReceiver = mpsc::UnboundedReceiver<RunnerCallback>;

/// Creates the channel built-in invokers report through.
pub fn completion_channel() -> (CompletionSender, CompletionReceiver) {
    mpsc::unbounded_channel()
}

/// Starts work on a runner.
#[async_trait]
pub trait Invoker: Send + Sync {
    /// Hands `payload` to `runner`. Returns once the runner accepted it; the
    /// outcome arrives later as a completion report.
    async fn trigger(&self, runner: &Runner, payload: &InvocationPayload) -> InvokeResult<()>;
}

/// Dispatches to one invoker per runner type.
///
/// # Example
///
/// ```no_run
/// use convoy::invoker::{Invokers, completion_channel};
///
/// let (completions, _rx) = completion_channel();
/// let invokers = Invokers::builtin(completions);
/// assert!(invokers.supports(convoy::model::RunnerType::Local));
/// ```
#[derive(Clone, Default)]
pub struct Invokers {
    by_type: HashMap<RunnerType, Arc<dyn Invoker>>,
}

impl Invokers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Local and Docker invokers reporting to `completions`.
    pub fn builtin(completions: CompletionSender) -> Self {
        Self::new()
            .with(
                RunnerType::Local,
                Arc::new(local::LocalInvoker::new(completions.clone())),
            )
            .with(
                RunnerType::Docker,
                Arc::new(docker::DockerInvoker::new(completions)),
            )
    }

    /// Registers (or replaces) the invoker for `runner_type`.
    pub fn with(mut self, runner_type: RunnerType, invoker: Arc<dyn Invoker>) -> Self {
        self.by_type.insert(runner_type, invoker);
        self
    }

    pub fn supports(&self, runner_type: RunnerType) -> bool {
        self.by_type.contains_key(&runner_type)
    }
}

#[async_trait]
impl Invoker for Invokers {
    async fn trigger(&self, runner: &Runner, payload: &InvocationPayload) -> InvokeResult<()> {
        let runner_type = runner.runner_type();
        let invoker = self
            .by_type
            .get(&runner_type)
            .ok_or(InvokeError::Unsupported(runner_type))?;
        invoker.trigger(runner, payload).await
    }
}

/// Parses a trailing JSON results line, if the output ends with one.
pub(crate) fn parse_results(output: &str) -> Option<TestResults> {
    let last = output.lines().rev().map(str::trim).find(|l| !l.is_empty())?;
    if !last.starts_with('{') {
        return None;
    }
    serde_json::from_str(last).ok()
}
