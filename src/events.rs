//! Typed notifications emitted by the scheduling core.
//!
//! Components never call each other back. Anything another party may care
//! about (a resource violation, a finished parallel run) is sent as an
//! [`Event`] over an unbounded channel whose receiver is owned by exactly
//! one consumer, usually a [`Reporter`](crate::report::Reporter) pump.

use tokio::sync::mpsc;
use tracing::debug;

use crate::coordinator::aggregate::AggregatedResult;
use crate::model::{Execution, ResourceAllocation, Shard};

/// A notification from the scheduler, allocation manager or coordinator.
#[derive(Debug, Clone)]
pub enum Event {
    /// A new execution entered the queue.
    ExecutionQueued(Execution),

    /// An execution was placed on a runner.
    ExecutionAssigned(Execution),

    /// An execution reached a terminal status.
    ExecutionFinished(Execution),

    /// An allocation is held on a runner that is unhealthy or not active.
    ///
    /// Nothing is released; the allocation stays until its owner finishes.
    AllocationAtRisk {
        allocation: ResourceAllocation,
        reason: String,
    },

    /// A runner's active allocations exceed its declared limits.
    ResourceViolation {
        runner_id: String,
        cpu_percent: f64,
        memory_mb: u64,
        max_cpu_percent: f64,
        max_memory_mb: u64,
        /// Allocations marked `exceeded` by this pass.
        exceeded: Vec<String>,
    },

    /// An allocation whose owner no longer exists was released.
    OrphanReclaimed(ResourceAllocation),

    /// Shards for a parallel run were created.
    ParallelStarted { parent_id: String, total_shards: u32 },

    /// A shard reached a terminal status.
    ShardFinished(Shard),

    /// A parallel run was finalized.
    ParallelFinished(AggregatedResult),
}

/// Receiving half of the event channel.
pub type EventReceiver = mpsc::UnboundedReceiver<Event>;

/// Sending half of the event channel.
///
/// Sending never fails: once the receiver is gone, events are dropped.
#[derive(Clone)]
pub struct EventSender {
    tx: Option<mpsc::UnboundedSender<Event>>,
}

impl EventSender {
    /// A sender that discards every event.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, event: Event) {
        let Some(tx) = &self.tx else {
            return;
        };
        if tx.send(event).is_err() {
            debug!("event receiver closed, dropping event");
        }
    }
}

/// Creates a connected sender/receiver pair.
pub fn channel() -> (EventSender, EventReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSender { tx: Some(tx) }, rx)
}
