//! Distributed job scheduler engine for Cohort.
//!
//! Peer nodes share one job store and coordinate only through it:
//! - Jobs are claimed with conditional writes, so each runs on at most one node
//! - Every node heartbeats into a shared scheduler registry
//! - Peers that stop heartbeating are reaped and their jobs recovered
//! - Concurrency per node is bounded by a non-queuing worker pool

mod clock;
mod config;
mod error;
mod factory;
mod monitor;
mod node;
mod pool;
mod processor;
mod single;
mod store;
mod types;

#[cfg(test)]
mod testing;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::SchedulerConfig;
pub use error::{BoxError, FactoryError, PoolError, ScheduleError, SchedulerError, StoreError};
pub use factory::{Job, JobFactory, JobScope, RegistryJobFactory};
pub use monitor::{ClusterStateMonitor, MonitorReport};
pub use node::{NodeState, Scheduler};
pub use pool::{WorkerPool, WorkerSlot};
pub use processor::JobProcessor;
pub use single::SingleJobProcessor;
pub use store::{JobManager, JobStore, JobStream, SchedulerMetadataStore};
pub use types::{
    ExecutionContext, Identifier, IntervalSchedule, JobDescriptor, JobExecutionResult,
    JobMetadata, RetryBackoff, Schedule, SchedulerMetadata, UserContext, Version, VersionedId,
    WriteOutcome, execution_after,
};
