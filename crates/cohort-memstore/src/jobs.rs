//! In-memory job store.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cohort_scheduler::{
    Clock, Identifier, JobDescriptor, JobExecutionResult, JobManager, JobMetadata, JobStore,
    JobStream, StoreError, SystemClock, Version, VersionedId, WriteOutcome,
};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::trace;

/// Stored state of one job.
#[derive(Debug, Clone)]
pub struct JobRecord<N> {
    pub metadata: JobMetadata,
    pub version: Version,
    /// Node currently executing the job exclusively.
    pub owner: Option<N>,
    /// When the current execution was claimed.
    pub started_at: Option<DateTime<Utc>>,
    pub last_result: Option<JobExecutionResult>,
    /// Completed executions, counting every committed completion.
    pub completions: u64,
    /// Excluded from due batches while set.
    pub paused: bool,
}

impl<N> JobRecord<N> {
    fn new(metadata: JobMetadata) -> Self {
        Self {
            metadata,
            version: Version::default(),
            owner: None,
            started_at: None,
            last_result: None,
            completions: 0,
            paused: false,
        }
    }

    fn descriptor<J: Clone>(&self, id: &J) -> JobDescriptor<J> {
        JobDescriptor::new(VersionedId::new(id.clone(), self.version), self.metadata.clone())
    }

    /// Bump the version after a committed write.
    fn commit(&mut self) -> Version {
        self.version = self.version.next();
        self.version
    }
}

/// Job store backed by a concurrent map.
///
/// Each conditional write checks the version under the record's shard lock,
/// so concurrent claims of one record admit exactly one writer.
pub struct InMemoryJobStore<J: Identifier, N: Identifier> {
    jobs: DashMap<J, JobRecord<N>>,
    clock: Arc<dyn Clock>,
}

impl<J: Identifier, N: Identifier> Default for InMemoryJobStore<J, N> {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl<J: Identifier, N: Identifier> InMemoryJobStore<J, N> {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            jobs: DashMap::new(),
            clock,
        }
    }

    /// Insert or replace a job. Replacing clears ownership and keeps the
    /// paused flag.
    pub fn insert(&self, id: J, metadata: JobMetadata) -> Version {
        match self.jobs.entry(id) {
            Entry::Occupied(mut entry) => {
                let record = entry.get_mut();
                record.metadata = metadata;
                record.owner = None;
                record.started_at = None;
                record.commit()
            }
            Entry::Vacant(entry) => entry.insert(JobRecord::new(metadata)).version,
        }
    }

    pub fn get(&self, id: &J) -> Option<JobRecord<N>> {
        self.jobs.get(id).map(|r| r.value().clone())
    }

    pub fn remove(&self, id: &J) -> bool {
        self.jobs.remove(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    fn set_paused(&self, id: &J, paused: bool) -> Result<(), StoreError> {
        let mut record = self
            .jobs
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        record.paused = paused;
        trace!(job_id = %id, paused, "job pause state changed");
        Ok(())
    }

    /// Total committed completions across all jobs.
    pub fn completions(&self) -> u64 {
        self.jobs.iter().map(|r| r.value().completions).sum()
    }

    /// Apply `write` to the record if it is still at `job.version`.
    fn conditional<F>(
        &self,
        job: &VersionedId<J>,
        write: F,
    ) -> Result<WriteOutcome<Version>, StoreError>
    where
        F: FnOnce(&mut JobRecord<N>) -> bool,
    {
        let mut record = self
            .jobs
            .get_mut(&job.id)
            .ok_or_else(|| StoreError::NotFound(job.id.to_string()))?;
        if record.version != job.version || !write(record.value_mut()) {
            trace!(
                job_id = %job.id,
                expected = %job.version,
                actual = %record.version,
                "conditional write rejected"
            );
            return Ok(WriteOutcome::Conflict);
        }
        Ok(WriteOutcome::Committed(record.commit()))
    }
}

#[async_trait]
impl<J: Identifier, N: Identifier> JobStore<J, N> for InMemoryJobStore<J, N> {
    async fn get_jobs_for_execution(&self, count: usize) -> Result<JobStream<J>, StoreError> {
        let now = self.clock.now();
        let mut due: Vec<_> = self
            .jobs
            .iter()
            .filter(|r| !r.paused && r.owner.is_none() && r.metadata.is_due(now))
            .map(|r| r.descriptor(r.key()))
            .collect();
        due.sort_by_key(|d| d.metadata.next_execution);
        due.truncate(count);
        Ok(Box::pin(tokio_stream::iter(due.into_iter().map(Ok))))
    }

    async fn start_exclusive_execution(
        &self,
        job: &VersionedId<J>,
        node: &N,
        next_execution: Option<DateTime<Utc>>,
    ) -> Result<WriteOutcome<Version>, StoreError> {
        let now = self.clock.now();
        self.conditional(job, |record| {
            if record.owner.is_some() {
                return false;
            }
            record.owner = Some(node.clone());
            record.started_at = Some(now);
            if next_execution.is_some() {
                record.metadata.next_execution = next_execution;
            }
            true
        })
    }

    async fn start_execution(
        &self,
        job: &VersionedId<J>,
        _node: &N,
        next_execution: Option<DateTime<Utc>>,
    ) -> Result<WriteOutcome<Version>, StoreError> {
        let now = self.clock.now();
        self.conditional(job, |record| {
            record.started_at = Some(now);
            if next_execution.is_some() {
                record.metadata.next_execution = next_execution;
            }
            true
        })
    }

    async fn complete_execution(
        &self,
        job: &VersionedId<J>,
        metadata: &JobMetadata,
        result: JobExecutionResult,
    ) -> Result<WriteOutcome<Version>, StoreError> {
        self.conditional(job, |record| {
            record.metadata = metadata.clone();
            record.owner = None;
            record.started_at = None;
            record.last_result = Some(result);
            record.completions += 1;
            true
        })
    }

    async fn get_executing_jobs(&self, node: &N) -> Result<Vec<JobDescriptor<J>>, StoreError> {
        Ok(self
            .jobs
            .iter()
            .filter(|r| r.owner.as_ref() == Some(node))
            .map(|r| r.descriptor(r.key()))
            .collect())
    }

    async fn get_timeouted_jobs(&self) -> Result<Vec<JobDescriptor<J>>, StoreError> {
        let now = self.clock.now();
        Ok(self
            .jobs
            .iter()
            .filter(|r| {
                let deadline = r
                    .metadata
                    .effective_timeout()
                    .and_then(|t| chrono::Duration::from_std(t).ok())
                    .zip(r.started_at)
                    .map(|(timeout, started)| started + timeout);
                r.owner.is_some() && deadline.is_some_and(|d| d < now)
            })
            .map(|r| r.descriptor(r.key()))
            .collect())
    }

    async fn recover_job(
        &self,
        job: &VersionedId<J>,
        reason: JobExecutionResult,
    ) -> Result<WriteOutcome<Version>, StoreError> {
        self.conditional(job, |record| {
            record.owner = None;
            record.started_at = None;
            record.metadata.next_execution = None;
            record.last_result = Some(reason);
            true
        })
    }
}

#[async_trait]
impl<J: Identifier, N: Identifier> JobManager<J> for InMemoryJobStore<J, N> {
    async fn schedule_job(&self, id: J, metadata: JobMetadata) -> Result<Version, StoreError> {
        Ok(self.insert(id, metadata))
    }

    async fn remove_job(&self, id: &J) -> Result<bool, StoreError> {
        Ok(self.remove(id))
    }

    async fn pause_job(&self, id: &J) -> Result<(), StoreError> {
        self.set_paused(id, true)
    }

    async fn resume_job(&self, id: &J) -> Result<(), StoreError> {
        self.set_paused(id, false)
    }

    async fn get_job(&self, id: &J) -> Result<Option<JobDescriptor<J>>, StoreError> {
        Ok(self.jobs.get(id).map(|r| r.descriptor(r.key())))
    }
}
