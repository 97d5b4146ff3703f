//! Wiring and periodic loops.
//!
//! The [`Engine`] owns one instance of every component, built explicitly
//! from a [`Config`]. [`Engine::spawn`] starts each periodic concern on its
//! own interval:
//!
//! | Loop | Interval | Work |
//! |------|----------|------|
//! | scheduler | `scheduler_interval_secs` | [`ExecutionScheduler::scheduling_pass`] |
//! | timeouts | `timeout_sweep_interval_secs` | [`ExecutionScheduler::timeout_sweep`] |
//! | monitor | `monitor_interval_secs` | resource monitor pass, then orphan cleanup |
//! | coordinator | `coordination_interval_secs` | shard timeout sweep, then coordination pass |
//! | callbacks | on message | runner started/finished callbacks |
//!
//! The loops share nothing but the store. None of them waits on another.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::select;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::coordinator::{CoordinatorError, ParallelCoordinator};
use crate::events::EventSender;
use crate::invoker::{CompletionReceiver, CompletionReport, Invoker, RunnerCallback};
use crate::registry::{RegistryError, RuleSpec, RunnerRegistry, RunnerSpec};
use crate::resources::ResourceManager;
use crate::scheduler::{CompletionOutcome, ExecutionScheduler, SchedulerError};
use crate::store::Store;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),
}

/// Every component, sharing one store.
#[derive(Clone)]
pub struct Engine {
    config: Config,
    store: Store,
    registry: RunnerRegistry,
    resources: ResourceManager,
    scheduler: ExecutionScheduler,
    coordinator: ParallelCoordinator,
}

impl Engine {
    pub fn new(config: &Config, invoker: Arc<dyn Invoker>, events: EventSender) -> Self {
        let store = Store::new();
        let registry = RunnerRegistry::new(store.clone());
        let resources = ResourceManager::new(store.clone(), config.resources.clone(), events.clone());
        let scheduler = ExecutionScheduler::new(
            store.clone(),
            registry.clone(),
            resources.clone(),
            invoker,
            events.clone(),
            config.convoy.clone(),
        );
        let coordinator =
            ParallelCoordinator::new(store.clone(), scheduler.clone(), events, config.parallel.clone());

        Self {
            config: config.clone(),
            store,
            registry,
            resources,
            scheduler,
            coordinator,
        }
    }

    /// Registers the configured runners and rules. Returns the runner ids.
    pub async fn bootstrap(&self) -> EngineResult<Vec<String>> {
        let mut runner_ids = Vec::with_capacity(self.config.runners.len());
        for runner in &self.config.runners {
            runner_ids.push(self.registry.register(RunnerSpec::from(runner)).await?);
        }
        for rule in &self.config.rules {
            self.registry.configure_rule(RuleSpec::from(rule)).await?;
        }
        info!(
            runners = runner_ids.len(),
            rules = self.config.rules.len(),
            "Engine bootstrapped"
        );
        Ok(runner_ids)
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn registry(&self) -> &RunnerRegistry {
        &self.registry
    }

    pub fn resources(&self) -> &ResourceManager {
        &self.resources
    }

    pub fn scheduler(&self) -> &ExecutionScheduler {
        &self.scheduler
    }

    pub fn coordinator(&self) -> &ParallelCoordinator {
        &self.coordinator
    }

    /// Routes a completion report to the coordinator when `report.id` is a
    /// shard, otherwise to the scheduler.
    pub async fn report_completion(&self, report: CompletionReport) -> EngineResult<CompletionOutcome> {
        if self.coordinator.is_shard(&report.id).await {
            Ok(self.coordinator.report_shard_completion(report).await?)
        } else {
            Ok(self.scheduler.report_completion(report).await?)
        }
    }

    pub async fn report_started(&self, id: &str) -> EngineResult<bool> {
        if self.coordinator.is_shard(id).await {
            Ok(self.coordinator.report_shard_started(id).await?)
        } else {
            Ok(self.scheduler.report_started(id).await?)
        }
    }

    async fn handle_callback(&self, callback: RunnerCallback) {
        match callback {
            RunnerCallback::Started(id) => {
                if let Err(e) = self.report_started(&id).await {
                    warn!(id = %id, error = %e, "failed to record start");
                }
            }
            RunnerCallback::Finished(report) => {
                let id = report.id.clone();
                match self.report_completion(report).await {
                    Ok(outcome) => debug!(id = %id, outcome = ?outcome, "completion handled"),
                    Err(e) => warn!(id = %id, error = %e, "failed to record completion"),
                }
            }
        }
    }

    /// Starts the periodic loops and the callback consumer.
    ///
    /// Every loop stops when `cancel` fires; [`EngineHandle::shutdown`]
    /// does both and waits.
    pub fn spawn(&self, mut completions: CompletionReceiver, cancel: CancellationToken) -> EngineHandle {
        let mut tasks = JoinSet::new();
        let intervals = &self.config.convoy;

        let scheduler = self.scheduler.clone();
        every(&mut tasks, "scheduler", intervals.scheduler_interval_secs, &cancel, move || {
            let scheduler = scheduler.clone();
            async move {
                if let Err(e) = scheduler.scheduling_pass().await {
                    warn!(error = %e, "scheduling pass failed");
                }
            }
        });

        let scheduler = self.scheduler.clone();
        every(&mut tasks, "timeouts", intervals.timeout_sweep_interval_secs, &cancel, move || {
            let scheduler = scheduler.clone();
            async move {
                if let Err(e) = scheduler.timeout_sweep().await {
                    warn!(error = %e, "timeout sweep failed");
                }
            }
        });

        let resources = self.resources.clone();
        every(&mut tasks, "monitor", intervals.monitor_interval_secs, &cancel, move || {
            let resources = resources.clone();
            async move {
                if let Err(e) = resources.monitor_pass().await {
                    warn!(error = %e, "monitor pass failed");
                }
                if let Err(e) = resources.cleanup_orphans().await {
                    warn!(error = %e, "orphan cleanup failed");
                }
            }
        });

        let coordinator = self.coordinator.clone();
        every(&mut tasks, "coordinator", intervals.coordination_interval_secs, &cancel, move || {
            let coordinator = coordinator.clone();
            async move {
                if let Err(e) = coordinator.shard_timeout_sweep().await {
                    warn!(error = %e, "shard timeout sweep failed");
                }
                if let Err(e) = coordinator.coordination_pass().await {
                    warn!(error = %e, "coordination pass failed");
                }
            }
        });

        let engine = self.clone();
        let stop = cancel.clone();
        tasks.spawn(async move {
            loop {
                select! {
                    _ = stop.cancelled() => break,
                    callback = completions.recv() => match callback {
                        Some(callback) => engine.handle_callback(callback).await,
                        None => {
                            debug!("completion channel closed");
                            break;
                        }
                    }
                }
            }
        });

        EngineHandle {
            tasks,
            cancel,
            scheduler: self.scheduler.clone(),
        }
    }
}

/// Runs `tick` every `period_secs` until `cancel` fires. The first tick is
/// immediate.
fn every<F, Fut>(tasks: &mut JoinSet<()>, name: &'static str, period_secs: u64, cancel: &CancellationToken, mut tick: F)
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let cancel = cancel.clone();
    tasks.spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(period_secs.max(1)));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            select! {
                _ = cancel.cancelled() => {
                    debug!(loop_name = name, "loop stopped");
                    break;
                }
                _ = interval.tick() => tick().await,
            }
        }
    });
}

/// Running engine loops.
pub struct EngineHandle {
    tasks: JoinSet<()>,
    cancel: CancellationToken,
    scheduler: ExecutionScheduler,
}

impl EngineHandle {
    /// Stops every loop and waits for them and for in-flight invocations.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "engine loop panicked");
            }
        }
        self.scheduler.drain_invocations().await;
        debug!("engine stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::load_config_str;
    use crate::coordinator::ParallelRequest;
    use crate::coordinator::aggregate::ParallelStatus;
    use crate::events::{self, Event};
    use crate::invoker::{Invokers, completion_channel};
    use crate::model::{ExecutionStatus, SubmitRequest};
    use crate::test_support::MockInvoker;

    const CONFIG: &str = r#"
        [convoy]
        scheduler_interval_secs = 1

        [[runners]]
        name = "sh"
        max_concurrent_jobs = 2

        [runners.backend]
        type = "local"
        command = "echo '{\"total\": 2, \"passed\": 2}'"

        [[rules]]
        name = "everything"
        rule_type = "round-robin"
    "#;

    #[tokio::test]
    async fn test_bootstrap_registers_runners_and_rules() {
        let config = load_config_str(CONFIG).unwrap();
        let engine = Engine::new(&config, Arc::new(MockInvoker::new()), EventSender::disabled());
        let ids = engine.bootstrap().await.unwrap();
        assert_eq!(ids.len(), 1);
        assert_eq!(engine.registry().rules().await.len(), 1);
        assert_eq!(engine.registry().get(&ids[0]).await.unwrap().max_concurrent_jobs, 2);
    }

    #[tokio::test]
    async fn test_completion_routing() {
        let config = load_config_str(CONFIG).unwrap();
        let engine = Engine::new(&config, Arc::new(MockInvoker::new()), EventSender::disabled());
        engine.bootstrap().await.unwrap();

        let id = engine.scheduler().submit(SubmitRequest::new("unit", "ci")).await.unwrap();
        engine.scheduler().scheduling_pass().await.unwrap();
        let shards = engine
            .coordinator()
            .orchestrate(ParallelRequest::new("unit", "ci", 1).parent_id("p"))
            .await
            .unwrap();

        let outcome = engine
            .report_completion(CompletionReport::completed(&id, None))
            .await
            .unwrap();
        assert_eq!(outcome, CompletionOutcome::Recorded);
        let outcome = engine
            .report_completion(CompletionReport::completed(&shards[0].id, None))
            .await
            .unwrap();
        assert_eq!(outcome, CompletionOutcome::Recorded);

        assert_eq!(
            engine.scheduler().execution(&id).await.unwrap().status,
            ExecutionStatus::Completed
        );
        assert_eq!(
            engine.coordinator().parent_status("p").await,
            Some(ParallelStatus::Completed)
        );
    }

    #[tokio::test]
    async fn test_spawned_loops_run_a_local_command_to_completion() {
        let config = load_config_str(CONFIG).unwrap();
        let (completions_tx, completions_rx) = completion_channel();
        let (events_tx, mut events_rx) = events::channel();
        let engine = Engine::new(&config, Arc::new(Invokers::builtin(completions_tx)), events_tx);
        engine.bootstrap().await.unwrap();

        let id = engine.scheduler().submit(SubmitRequest::new("unit", "ci")).await.unwrap();
        let handle = engine.spawn(completions_rx, CancellationToken::new());

        let finished = tokio::time::timeout(Duration::from_secs(10), async {
            while let Some(event) = events_rx.recv().await {
                if let Event::ExecutionFinished(execution) = event {
                    return Some(execution);
                }
            }
            None
        })
        .await
        .unwrap()
        .unwrap();
        handle.shutdown().await;

        assert_eq!(finished.id, id);
        assert_eq!(finished.status, ExecutionStatus::Completed);
        assert_eq!(finished.results.unwrap().passed, 2);
    }
}
