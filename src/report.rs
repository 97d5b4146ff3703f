//! Run reporting.
//!
//! Reporters consume the [`Event`] stream. [`pump`] drains an
//! [`EventReceiver`](crate::events::EventReceiver) into one reporter,
//! calling the hook matching each event.

pub mod junit;

use std::sync::Mutex;

use async_trait::async_trait;
use indicatif::{ProgressBar, ProgressStyle};

use crate::coordinator::aggregate::{AggregatedResult, ParallelStatus};
use crate::events::{Event, EventReceiver};
use crate::model::{Execution, ExecutionStatus, Shard, ShardStatus};

pub use junit::JUnitReporter;

/// Receives events from the scheduling core.
#[async_trait]
pub trait Reporter: Send + Sync {
    /// Called when an execution enters the queue.
    async fn on_execution_queued(&self, execution: &Execution);

    /// Called when an execution is placed on a runner.
    async fn on_execution_assigned(&self, execution: &Execution);

    /// Called when an execution reaches a terminal status.
    async fn on_execution_finished(&self, execution: &Execution);

    /// Called when the shards of a parallel run have been created.
    async fn on_parallel_started(&self, parent_id: &str, total_shards: u32);

    async fn on_shard_finished(&self, shard: &Shard);

    /// Called once a parallel run is finalized.
    async fn on_parallel_finished(&self, result: &AggregatedResult);

    /// Called for resource monitor findings: at-risk allocations,
    /// violations and reclaimed orphans.
    async fn on_resource_event(&self, event: &Event);
}

/// Calls the hook of `reporter` matching `event`.
pub async fn dispatch(reporter: &dyn Reporter, event: &Event) {
    match event {
        Event::ExecutionQueued(execution) => reporter.on_execution_queued(execution).await,
        Event::ExecutionAssigned(execution) => reporter.on_execution_assigned(execution).await,
        Event::ExecutionFinished(execution) => reporter.on_execution_finished(execution).await,
        Event::ParallelStarted {
            parent_id,
            total_shards,
        } => reporter.on_parallel_started(parent_id, *total_shards).await,
        Event::ShardFinished(shard) => reporter.on_shard_finished(shard).await,
        Event::ParallelFinished(result) => reporter.on_parallel_finished(result).await,
        Event::AllocationAtRisk { .. } | Event::ResourceViolation { .. } | Event::OrphanReclaimed(_) => {
            reporter.on_resource_event(event).await
        }
    }
}

/// Feeds every event from `events` to `reporter` until the channel closes.
pub async fn pump(mut events: EventReceiver, reporter: &dyn Reporter) {
    while let Some(event) = events.recv().await {
        dispatch(reporter, &event).await;
    }
}

/// A reporter that does nothing (for testing or when output is not needed).
pub struct NullReporter;

#[async_trait]
impl Reporter for NullReporter {
    async fn on_execution_queued(&self, _execution: &Execution) {}
    async fn on_execution_assigned(&self, _execution: &Execution) {}
    async fn on_execution_finished(&self, _execution: &Execution) {}
    async fn on_parallel_started(&self, _parent_id: &str, _total_shards: u32) {}
    async fn on_shard_finished(&self, _shard: &Shard) {}
    async fn on_parallel_finished(&self, _result: &AggregatedResult) {}
    async fn on_resource_event(&self, _event: &Event) {}
}

/// A reporter that combines multiple reporters.
pub struct MultiReporter {
    reporters: Vec<Box<dyn Reporter>>,
}

impl MultiReporter {
    pub fn new() -> Self {
        Self {
            reporters: Vec::new(),
        }
    }

    pub fn with_reporter<R: Reporter + 'static>(mut self, reporter: R) -> Self {
        self.reporters.push(Box::new(reporter));
        self
    }
}

impl Default for MultiReporter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Reporter for MultiReporter {
    async fn on_execution_queued(&self, execution: &Execution) {
        for reporter in &self.reporters {
            reporter.on_execution_queued(execution).await;
        }
    }

    async fn on_execution_assigned(&self, execution: &Execution) {
        for reporter in &self.reporters {
            reporter.on_execution_assigned(execution).await;
        }
    }

    async fn on_execution_finished(&self, execution: &Execution) {
        for reporter in &self.reporters {
            reporter.on_execution_finished(execution).await;
        }
    }

    async fn on_parallel_started(&self, parent_id: &str, total_shards: u32) {
        for reporter in &self.reporters {
            reporter.on_parallel_started(parent_id, total_shards).await;
        }
    }

    async fn on_shard_finished(&self, shard: &Shard) {
        for reporter in &self.reporters {
            reporter.on_shard_finished(shard).await;
        }
    }

    async fn on_parallel_finished(&self, result: &AggregatedResult) {
        for reporter in &self.reporters {
            reporter.on_parallel_finished(result).await;
        }
    }

    async fn on_resource_event(&self, event: &Event) {
        for reporter in &self.reporters {
            reporter.on_resource_event(event).await;
        }
    }
}

/// Console reporter that shows progress in the terminal.
pub struct ConsoleReporter {
    progress: Mutex<Option<ProgressBar>>,
    verbose: bool,
}

impl ConsoleReporter {
    pub fn new(verbose: bool) -> Self {
        Self {
            progress: Mutex::new(None),
            verbose,
        }
    }

    /// Prints above the progress bar when one is showing.
    fn line(&self, message: String) {
        match self.progress.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
            Some(pb) => pb.println(message),
            None => println!("{message}"),
        }
    }
}

#[async_trait]
impl Reporter for ConsoleReporter {
    async fn on_execution_queued(&self, execution: &Execution) {
        if self.verbose {
            self.line(format!(
                "Queued {} on {} ({})",
                execution.test_suite, execution.environment, execution.id
            ));
        }
    }

    async fn on_execution_assigned(&self, execution: &Execution) {
        if self.verbose {
            self.line(format!(
                "Assigned {} to runner {}",
                execution.id,
                execution.runner_id.as_deref().unwrap_or("-")
            ));
        }
    }

    async fn on_execution_finished(&self, execution: &Execution) {
        print_execution_summary(execution);
    }

    async fn on_parallel_started(&self, parent_id: &str, total_shards: u32) {
        println!("Started {parent_id} with {total_shards} shards");

        let pb = ProgressBar::new(u64::from(total_shards));
        let style = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} shards")
            .map(|style| style.progress_chars("#>-"))
            .unwrap_or_else(|_| ProgressStyle::default_bar());
        pb.set_style(style);

        *self.progress.lock().unwrap_or_else(|e| e.into_inner()) = Some(pb);
    }

    async fn on_shard_finished(&self, shard: &Shard) {
        let progress = self.progress.lock().unwrap_or_else(|e| e.into_inner());
        let Some(pb) = progress.as_ref() else {
            return;
        };
        pb.inc(1);

        let status = match shard.status {
            ShardStatus::Completed => console::style("PASS").green(),
            ShardStatus::Failed => console::style("FAIL").red(),
            ShardStatus::Pending | ShardStatus::Running => return,
        };
        if self.verbose || shard.status == ShardStatus::Failed {
            let mut message = format!("{} shard {}/{}", status, shard.shard_index, shard.total_shards);
            if let Some(error) = &shard.error_message {
                message.push_str(&format!(" {}", console::style(error).dim()));
            }
            pb.println(message);
        }
    }

    async fn on_parallel_finished(&self, result: &AggregatedResult) {
        if let Some(pb) = self.progress.lock().unwrap_or_else(|e| e.into_inner()).take() {
            pb.finish_and_clear();
        }
        print_parallel_summary(result);
    }

    async fn on_resource_event(&self, event: &Event) {
        let message = match event {
            Event::AllocationAtRisk { allocation, reason } => {
                format!("allocation {} at risk: {reason}", allocation.id)
            }
            Event::ResourceViolation {
                runner_id,
                cpu_percent,
                memory_mb,
                max_cpu_percent,
                max_memory_mb,
                ..
            } => format!(
                "runner {runner_id} over its limits: {cpu_percent:.0}/{max_cpu_percent:.0}% CPU, {memory_mb}/{max_memory_mb} MB"
            ),
            Event::OrphanReclaimed(allocation) => {
                if !self.verbose {
                    return;
                }
                format!("reclaimed orphaned allocation {}", allocation.id)
            }
            _ => return,
        };
        self.line(format!("{} {message}", console::style("warning:").yellow().bold()));
    }
}

/// Prints the outcome of one execution.
pub fn print_execution_summary(execution: &Execution) {
    println!();
    println!("Execution {} ({})", execution.id, execution.test_suite);
    if let Some(results) = &execution.results {
        println!("  Total:   {}", results.total);
        println!("  Passed:  {}", console::style(results.passed).green());
        println!("  Failed:  {}", console::style(results.failed).red());
        println!("  Skipped: {}", console::style(results.skipped).yellow());
    }
    if let (Some(start), Some(end)) = (execution.started_at.or(execution.assigned_at), execution.completed_at) {
        println!("  Duration: {:.1}s", (end - start).num_milliseconds() as f64 / 1000.0);
    }

    println!();
    match execution.status {
        ExecutionStatus::Completed => {
            println!("{}", console::style("Execution completed.").green().bold());
        }
        ExecutionStatus::Timeout => {
            println!("{}", console::style("Execution timed out.").red().bold());
        }
        _ => {
            println!("{}", console::style("Execution failed.").red().bold());
            if let Some(error) = &execution.error_message {
                println!("  {}", console::style(error).dim());
            }
        }
    }
    print_failed_tests(execution.results.iter().flat_map(|r| &r.failed_tests));
}

/// Prints the aggregate of a parallel run.
pub fn print_parallel_summary(result: &AggregatedResult) {
    println!();
    println!("Parallel run {} ({})", result.parent_id, result.test_suite);
    println!(
        "  Shards:  {} completed, {} failed of {}",
        result.completed_shards, result.failed_shards, result.total_shards
    );
    println!("  Total:   {}", result.totals.total);
    println!("  Passed:  {}", console::style(result.totals.passed).green());
    println!("  Failed:  {}", console::style(result.totals.failed).red());
    println!("  Skipped: {}", console::style(result.totals.skipped).yellow());
    println!("  Duration: {:.1}s", result.duration().num_milliseconds() as f64 / 1000.0);

    println!();
    if result.status == ParallelStatus::Completed {
        println!("{}", console::style("All shards passed!").green().bold());
        return;
    }
    println!("{}", console::style("Some shards failed.").red().bold());
    for error in &result.shard_errors {
        println!("  shard {}: {}", error.shard_index, console::style(&error.message).dim());
    }
    print_failed_tests(result.totals.failed_tests.iter());
}

fn print_failed_tests<'a>(tests: impl Iterator<Item = &'a crate::model::FailedTest>) {
    let mut tests = tests.peekable();
    if tests.peek().is_none() {
        return;
    }
    println!();
    println!("Failed tests:");
    for test in tests {
        match test.shard_index {
            Some(index) => println!("  - {} (shard {index})", test.name),
            None => println!("  - {}", test.name),
        }
        if let Some(message) = &test.message {
            println!("    {}", console::style(message).dim());
        }
    }
}
