//! convoy CLI - test-execution orchestration.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use convoy::config::{self, RunnerBackend};
use convoy::coordinator::ParallelRequest;
use convoy::coordinator::aggregate::ParallelStatus;
use convoy::engine::Engine;
use convoy::events::{self, Event};
use convoy::invoker::{Invokers, completion_channel};
use convoy::model::{ExecutionStatus, RunnerType, SubmitRequest};
use convoy::report::{self, ConsoleReporter, JUnitReporter, MultiReporter};

#[derive(Parser)]
#[command(name = "convoy")]
#[command(about = "Queue, place and shard test runs across runners", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "convoy.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one test suite and wait for its outcome
    Run(RunArgs),

    /// List configured runners and their capacity
    Runners,

    /// Validate configuration file
    Validate,

    /// Initialize a new configuration file
    Init,
}

#[derive(Args)]
struct RunArgs {
    /// Test suite to run
    #[arg(short, long)]
    suite: String,

    /// Target environment
    #[arg(short, long, default_value = "default")]
    environment: String,

    /// Queue priority (higher runs first)
    #[arg(short, long)]
    priority: Option<i32>,

    /// Only use runners of this type
    #[arg(long, value_parser = parse_runner_type)]
    runner_type: Option<RunnerType>,

    /// Split the suite into this many shards
    #[arg(long)]
    shards: Option<u32>,

    /// Estimated duration in seconds, used for the timeout
    #[arg(long)]
    estimate: Option<u64>,

    /// Extra metadata passed to runners (repeatable)
    #[arg(short, long = "meta", value_name = "KEY=VALUE", value_parser = parse_key_val)]
    metadata: Vec<(String, String)>,

    /// JUnit XML output path
    #[arg(long)]
    junit: Option<PathBuf>,
}

fn parse_runner_type(s: &str) -> Result<RunnerType, String> {
    s.parse()
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got {s:?}"))?;
    Ok((key.to_string(), value.to_string()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging; RUST_LOG overrides the default level.
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Run(args) => {
            let code = run(&cli.config, args, cli.verbose).await?;
            std::process::exit(code);
        }
        Commands::Runners => list_runners(&cli.config).await,
        Commands::Validate => validate_config(&cli.config),
        Commands::Init => init_config(&cli.config),
    }
}

/// What `run` waits for.
enum Target {
    Execution(String),
    Parallel(String),
}

impl Target {
    /// Exit code once `event` finishes the target.
    fn exit_code(&self, event: &Event) -> Option<i32> {
        match (self, event) {
            (Target::Execution(id), Event::ExecutionFinished(execution)) if &execution.id == id => {
                Some(match execution.status {
                    ExecutionStatus::Completed => 0,
                    ExecutionStatus::Timeout => 2,
                    _ => 1,
                })
            }
            (Target::Parallel(id), Event::ParallelFinished(result)) if &result.parent_id == id => {
                Some(if result.status == ParallelStatus::Completed { 0 } else { 1 })
            }
            _ => None,
        }
    }
}

async fn run(config_path: &Path, args: RunArgs, verbose: bool) -> Result<i32> {
    let config = config::load_config(config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;
    config.validate()?;
    if config.runners.is_empty() {
        bail!("No runners configured in {}", config_path.display());
    }
    info!("Loaded configuration from {}", config_path.display());

    let (completions, callbacks) = completion_channel();
    let (events, mut event_rx) = events::channel();
    let engine = Engine::new(&config, Arc::new(Invokers::builtin(completions)), events);
    engine.bootstrap().await?;

    let metadata = args
        .metadata
        .into_iter()
        .map(|(key, value)| {
            let value = serde_json::from_str(&value).unwrap_or(serde_json::Value::String(value));
            (key, value)
        })
        .collect();

    let target = match args.shards {
        Some(total_shards) => {
            let mut request = ParallelRequest::new(&args.suite, &args.environment, total_shards);
            request.runner_type = args.runner_type;
            request.metadata = metadata;
            let shards = engine
                .coordinator()
                .orchestrate(request)
                .await
                .context("Failed to start parallel run")?;
            let parent_id = shards
                .first()
                .map(|s| s.parent_id.clone())
                .context("Parallel run created no shards")?;
            Target::Parallel(parent_id)
        }
        None => {
            let mut request = SubmitRequest::new(&args.suite, &args.environment);
            request.priority = args.priority;
            request.requested_runner_type = args.runner_type;
            request.estimated_duration_secs = args.estimate;
            request.metadata = metadata;
            let id = engine
                .scheduler()
                .submit(request)
                .await
                .context("Failed to submit execution")?;
            Target::Execution(id)
        }
    };

    let reporter = create_reporter(&config, args.junit, verbose);
    let handle = engine.spawn(callbacks, CancellationToken::new());

    let code = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted, stopping");
                break 130;
            }
            event = event_rx.recv() => {
                let Some(event) = event else {
                    break 1;
                };
                report::dispatch(&reporter, &event).await;
                if let Some(code) = target.exit_code(&event) {
                    break code;
                }
            }
        }
    };

    handle.shutdown().await;
    Ok(code)
}

async fn list_runners(config_path: &Path) -> Result<()> {
    let config = config::load_config(config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;
    config.validate()?;

    let (completions, _callbacks) = completion_channel();
    let engine = Engine::new(&config, Arc::new(Invokers::builtin(completions)), events::EventSender::disabled());
    engine.bootstrap().await?;

    let runners = engine.registry().list().await;
    if runners.is_empty() {
        println!("No runners configured.");
        return Ok(());
    }

    println!(
        "{:<20} {:<15} {:>5} {:>9} {:>10} {:>8}",
        "NAME", "TYPE", "SLOTS", "CPU %", "MEMORY MB", "PRIORITY"
    );
    for runner in runners {
        println!(
            "{:<20} {:<15} {:>5} {:>9.0} {:>10} {:>8}",
            runner.name,
            runner.runner_type().as_str(),
            runner.max_concurrent_jobs,
            runner.capabilities.max_cpu_percent,
            runner.capabilities.max_memory_mb,
            runner.priority
        );
    }

    let rules = engine.registry().rules().await;
    if !rules.is_empty() {
        println!();
        println!("Rules:");
        for rule in rules {
            println!("  {} ({:?}, priority {})", rule.name, rule.rule_type, rule.priority);
        }
    }
    Ok(())
}

fn validate_config(config_path: &Path) -> Result<()> {
    let config = match config::load_config(config_path).and_then(|c| c.validate().map(|_| c)) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            std::process::exit(1);
        }
    };

    println!("Configuration is valid!");
    println!();
    println!("Settings:");
    println!("  Scheduler interval: {}s", config.convoy.scheduler_interval_secs);
    println!("  Timeout floor: {}s", config.convoy.timeout_floor_secs);
    println!("  Shard timeout: {}s", config.parallel.shard_timeout_secs);
    println!("  Runners: {}", config.runners.len());
    for runner in &config.runners {
        let invoker = match runner.backend {
            RunnerBackend::Local(_) | RunnerBackend::Docker(_) => "built-in",
            _ => "external",
        };
        println!(
            "    {} ({}, {} invoker)",
            runner.name,
            runner.backend.runner_type(),
            invoker
        );
    }
    println!("  Rules: {}", config.rules.len());
    Ok(())
}

const INIT_TEMPLATE: &str = r#"# convoy configuration file

[convoy]
scheduler_interval_secs = 5
timeout_sweep_interval_secs = 60
callback_address = "http://127.0.0.1:7070/callbacks"
# Timeout = max(estimated duration x multiplier, floor)
timeout_multiplier = 1.3
timeout_floor_secs = 1800

[parallel]
shard_timeout_secs = 7200
stuck_after_secs = 600

[[runners]]
name = "local"
max_concurrent_jobs = 2

[runners.backend]
type = "local"
command = "./scripts/run-tests.sh {test_suite} {environment} {shard_index} {total_shards}"

# [[runners]]
# name = "docker"
# max_concurrent_jobs = 4
#
# [runners.backend]
# type = "docker"
# image = "python:3.12-slim"
# command = ["sh", "-c", "pytest -q tests/$CONVOY_TEST_SUITE"]

[[rules]]
name = "default"
rule_type = "round-robin"

[report]
output_dir = "test-results"
junit = true
junit_file = "junit.xml"
"#;

fn init_config(path: &Path) -> Result<()> {
    if path.exists() {
        eprintln!(
            "{} already exists. Remove it first or edit manually.",
            path.display()
        );
        std::process::exit(1);
    }

    std::fs::write(path, INIT_TEMPLATE)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    println!("Created {}", path.display());
    println!();
    println!("Edit the configuration as needed, then run:");
    println!("  convoy run --suite <suite>");

    Ok(())
}

fn create_reporter(config: &config::Config, junit_override: Option<PathBuf>, verbose: bool) -> MultiReporter {
    let mut multi = MultiReporter::new();

    multi = multi.with_reporter(ConsoleReporter::new(verbose));

    if config.report.junit || junit_override.is_some() {
        let junit_path = junit_override.unwrap_or_else(|| config.report.output_dir.join(&config.report.junit_file));
        multi = multi.with_reporter(JUnitReporter::new(junit_path));
    }

    multi
}
