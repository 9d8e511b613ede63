//! Persistence contracts consumed by the engine.
//!
//! Every mutation of a job record is a conditional write naming the version
//! the writer read. A write against a stale version reports
//! [`WriteOutcome::Conflict`] instead of overwriting.

use std::pin::Pin;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_stream::Stream;

use crate::error::StoreError;
use crate::types::{
    Identifier, JobDescriptor, JobExecutionResult, JobMetadata, SchedulerMetadata, Version,
    VersionedId, WriteOutcome,
};

/// Lazily produced batch of due jobs.
pub type JobStream<J> =
    Pin<Box<dyn Stream<Item = Result<JobDescriptor<J>, StoreError>> + Send + 'static>>;

/// Shared job records.
#[async_trait]
pub trait JobStore<J: Identifier, N: Identifier>: Send + Sync {
    /// Up to `count` jobs that are due and not owned by any node.
    async fn get_jobs_for_execution(&self, count: usize) -> Result<JobStream<J>, StoreError>;

    /// Claim a job for `node`, optionally recording the next execution now.
    ///
    /// Commits only if the record is at `job.version` and unowned.
    async fn start_exclusive_execution(
        &self,
        job: &VersionedId<J>,
        node: &N,
        next_execution: Option<DateTime<Utc>>,
    ) -> Result<WriteOutcome<Version>, StoreError>;

    /// Claim ownership without touching the schedule.
    async fn set_job_owner(
        &self,
        job: &VersionedId<J>,
        node: &N,
    ) -> Result<WriteOutcome<Version>, StoreError> {
        self.start_exclusive_execution(job, node, None).await
    }

    /// Record the start of a non-exclusive run.
    ///
    /// Commits only if the record is at `job.version`; ownership is not set.
    async fn start_execution(
        &self,
        job: &VersionedId<J>,
        node: &N,
        next_execution: Option<DateTime<Utc>>,
    ) -> Result<WriteOutcome<Version>, StoreError>;

    /// Persist the outcome and updated metadata and clear ownership.
    async fn complete_execution(
        &self,
        job: &VersionedId<J>,
        metadata: &JobMetadata,
        result: JobExecutionResult,
    ) -> Result<WriteOutcome<Version>, StoreError>;

    /// Finalize a job on behalf of a node that never did.
    async fn finalize_job(
        &self,
        job: &VersionedId<J>,
        metadata: &JobMetadata,
        result: JobExecutionResult,
    ) -> Result<WriteOutcome<Version>, StoreError> {
        self.complete_execution(job, metadata, result).await
    }

    /// Jobs currently owned by `node`.
    async fn get_executing_jobs(&self, node: &N) -> Result<Vec<JobDescriptor<J>>, StoreError>;

    /// Owned jobs that have run past their timeout.
    async fn get_timeouted_jobs(&self) -> Result<Vec<JobDescriptor<J>>, StoreError>;

    /// Release a job whose owner is presumed dead and make it due immediately.
    async fn recover_job(
        &self,
        job: &VersionedId<J>,
        reason: JobExecutionResult,
    ) -> Result<WriteOutcome<Version>, StoreError>;
}

/// Administrative surface over the job records.
///
/// Pausing and resuming do not touch the record's version, so an execution
/// that is already running still finalizes normally.
#[async_trait]
pub trait JobManager<J: Identifier>: Send + Sync {
    /// Insert or replace a job. Returns the version of the stored record.
    async fn schedule_job(&self, id: J, metadata: JobMetadata) -> Result<Version, StoreError>;

    /// Delete a job. `false` if it did not exist.
    async fn remove_job(&self, id: &J) -> Result<bool, StoreError>;

    /// Keep the job out of every due batch until resumed.
    async fn pause_job(&self, id: &J) -> Result<(), StoreError>;

    async fn resume_job(&self, id: &J) -> Result<(), StoreError>;

    async fn get_job(&self, id: &J) -> Result<Option<JobDescriptor<J>>, StoreError>;
}

/// Liveness records of scheduler nodes.
#[async_trait]
pub trait SchedulerMetadataStore<N: Identifier>: Send + Sync {
    async fn add_scheduler(&self, node: &N, metadata: &SchedulerMetadata)
    -> Result<(), StoreError>;

    /// Refresh the node's last check-in.
    async fn heartbeat(&self, node: &N) -> Result<(), StoreError>;

    async fn get_schedulers(&self) -> Result<Vec<(N, SchedulerMetadata)>, StoreError>;

    /// Nodes whose last heartbeat is older than their timeout at `now`.
    async fn get_stalled_schedulers(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<(N, SchedulerMetadata)>, StoreError> {
        Ok(self
            .get_schedulers()
            .await?
            .into_iter()
            .filter(|(_, metadata)| metadata.is_stalled(now))
            .collect())
    }

    /// Delete a node's record. `Conflict` if it is already gone.
    async fn remove_scheduler(&self, node: &N) -> Result<WriteOutcome<()>, StoreError>;
}
