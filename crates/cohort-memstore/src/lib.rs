//! In-memory stores for Cohort.
//!
//! Both stores keep their records in a [`dashmap::DashMap`] and implement the
//! optimistic-concurrency contract of the scheduler's store traits. They are
//! meant for single-process clusters, tests, and demos.

mod jobs;
mod schedulers;

pub use jobs::{InMemoryJobStore, JobRecord};
pub use schedulers::InMemorySchedulerStore;
