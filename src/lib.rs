//! convoy: test-execution orchestration.
//!
//! This crate queues test-run requests, places them on heterogeneous runners
//! (CI systems, containers, local processes) under per-runner capacity
//! limits, and splits large suites into shards whose results are folded
//! back into one outcome.
//!
//! # Architecture
//!
//! ```text
//!            submit                 orchestrate
//!              │                         │
//!              ▼                         ▼
//!   ┌────────────────────┐     ┌──────────────────────┐
//!   │ ExecutionScheduler │◄────│ ParallelCoordinator  │
//!   └──┬──────┬──────┬───┘     └──────────────────────┘
//!      │      │      │ placement primitives
//!      ▼      ▼      ▼
//!  Registry  LoadBalancer  ResourceManager ──► monitor / optimize
//!      │                         │
//!      └───────────► Store ◄─────┘   (single serialization point)
//!
//!   Invoker (local / docker / embedder)  ──► RunnerCallback ──► Engine
//!   Event channel ──► Reporter (console, JUnit)
//! ```
//!
//! The main components are:
//!
//! - **Registry**: runners, their health and eligibility, load balancing rules
//! - **Resources**: capacity requirements, allocations, monitoring and optimization
//! - **Balancer**: picks one runner among the eligible ones
//! - **Scheduler**: the queue, placement passes, timeouts and completions
//! - **Coordinator**: sharded runs and their aggregation
//! - **Engine**: wiring and periodic loops
//! - **Report**: console and JUnit XML output
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use convoy::config::load_config;
//! use convoy::engine::Engine;
//! use convoy::events::EventSender;
//! use convoy::invoker::{Invokers, completion_channel};
//! use convoy::model::SubmitRequest;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config(std::path::Path::new("convoy.toml"))?;
//!     let (completions, callbacks) = completion_channel();
//!     let engine = Engine::new(&config, Arc::new(Invokers::builtin(completions)), EventSender::disabled());
//!     engine.bootstrap().await?;
//!
//!     engine.scheduler().submit(SubmitRequest::new("api-tests", "staging")).await?;
//!     let handle = engine.spawn(callbacks, CancellationToken::new());
//!     // ...
//!     handle.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod balancer;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod events;
pub mod invoker;
pub mod model;
pub mod registry;
pub mod report;
pub mod resources;
pub mod scheduler;
pub mod store;

#[cfg(test)]
mod test_support;

// Re-export commonly used types
pub use config::{Config, load_config};
pub use coordinator::{ParallelCoordinator, ParallelRequest};
pub use engine::Engine;
pub use invoker::{CompletionReport, Invoker, Invokers};
pub use model::SubmitRequest;
pub use report::Reporter;
pub use scheduler::ExecutionScheduler;
