//! Execution of one job: claim, run, classify, finalize.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::clock::Clock;
use crate::error::SchedulerError;
use crate::factory::JobFactory;
use crate::pool::WorkerPool;
use crate::store::JobStore;
use crate::types::{
    ExecutionContext, Identifier, JobDescriptor, JobExecutionResult, JobMetadata, Version,
    VersionedId, WriteOutcome, execution_after,
};

/// Runs a single job end-to-end on one worker slot.
///
/// The slot is taken before the claim and released only after the finalize
/// write, on every path.
pub struct SingleJobProcessor<J: Identifier, N: Identifier> {
    job_store: Arc<dyn JobStore<J, N>>,
    job_factory: Arc<dyn JobFactory>,
    pool: WorkerPool,
    clock: Arc<dyn Clock>,
}

impl<J: Identifier, N: Identifier> Clone for SingleJobProcessor<J, N> {
    fn clone(&self) -> Self {
        Self {
            job_store: Arc::clone(&self.job_store),
            job_factory: Arc::clone(&self.job_factory),
            pool: self.pool.clone(),
            clock: Arc::clone(&self.clock),
        }
    }
}

impl<J: Identifier, N: Identifier> SingleJobProcessor<J, N> {
    pub fn new(
        job_store: Arc<dyn JobStore<J, N>>,
        job_factory: Arc<dyn JobFactory>,
        pool: WorkerPool,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            job_store,
            job_factory,
            pool,
            clock,
        }
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Execute `descriptor` on behalf of `node`.
    ///
    /// Returns `NotStarted` when no worker is free or another node owns the
    /// job. Only a failing claim write is an error.
    #[tracing::instrument(skip_all, fields(job_id = %descriptor.id, node_id = %node))]
    pub async fn process(
        &self,
        descriptor: JobDescriptor<J>,
        node: &N,
        cancel: &CancellationToken,
    ) -> Result<JobExecutionResult, SchedulerError> {
        let _slot = match self.pool.try_acquire() {
            Ok(slot) => slot,
            Err(e) => {
                trace!(error = %e, "all workers are busy, job not started");
                return Ok(JobExecutionResult::NotStarted);
            }
        };

        let JobDescriptor { id, mut metadata } = descriptor;
        let context = ExecutionContext::for_attempt(&metadata);
        // Shared jobs keep no owner, so the claim itself has to move them out
        // of the due window.
        let schedule = &metadata.schedule;
        let planned = if schedule.delayed_calculation() && schedule.exclusive() {
            None
        } else {
            self.plan_next_execution(&id, &metadata, &context)
        };

        let claimed = match self.claim(&id, node, &metadata, planned).await? {
            WriteOutcome::Committed(version) => id.at(version),
            WriteOutcome::Conflict => {
                debug!("job is already executing on another scheduler");
                return Ok(JobExecutionResult::NotStarted);
            }
        };

        info!(attempt = context.attempt(), "starting job execution");
        let started = Instant::now();
        let result = self.execute(&metadata, &context, cancel).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        self.reschedule(&mut metadata, result, &context, planned);
        metadata.attempt = match result {
            JobExecutionResult::Succeeded => 0,
            _ => context.attempt(),
        };

        self.finalize(&claimed, &metadata, result, node).await;

        info!(%result, elapsed_ms, attempt = context.attempt(), "job execution completed");
        Ok(result)
    }

    /// Next execution computed at claim time for non-delayed schedules.
    fn plan_next_execution(
        &self,
        id: &VersionedId<J>,
        metadata: &JobMetadata,
        context: &ExecutionContext,
    ) -> Option<DateTime<Utc>> {
        let now = self.clock.now();
        let planned = metadata
            .schedule
            .next(context)
            .and_then(|delta| delta.map_or(Ok(now), |d| execution_after(now, d)));
        match planned {
            Ok(at) => Some(at),
            Err(e) => {
                error!(
                    job_id = %id,
                    error = %e,
                    "failed to calculate next execution, please verify next execution manually"
                );
                None
            }
        }
    }

    async fn claim(
        &self,
        id: &VersionedId<J>,
        node: &N,
        metadata: &JobMetadata,
        planned: Option<DateTime<Utc>>,
    ) -> Result<WriteOutcome<Version>, SchedulerError> {
        let outcome = match (metadata.schedule.exclusive(), planned) {
            (true, None) => self.job_store.set_job_owner(id, node).await,
            (true, Some(_)) => {
                self.job_store
                    .start_exclusive_execution(id, node, planned)
                    .await
            }
            (false, _) => self.job_store.start_execution(id, node, planned).await,
        };
        outcome.map_err(|e| {
            error!(error = %e, "claiming job failed");
            SchedulerError::from(e)
        })
    }

    /// Run the job against the caller's token and its own deadline.
    async fn execute(
        &self,
        metadata: &JobMetadata,
        context: &ExecutionContext,
        cancel: &CancellationToken,
    ) -> JobExecutionResult {
        let job_cancel = cancel.child_token();
        let _cancel_on_exit = job_cancel.clone().drop_guard();
        let timeout = metadata.effective_timeout();

        let deadline = async {
            match timeout {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                warn!("job execution was interrupted by external cancellation, job will be retried immediately");
                JobExecutionResult::Cancelled
            }
            _ = deadline => {
                warn!(
                    timeout_ms = timeout.map(|t| t.as_millis() as u64),
                    "job execution timed out, job will be rescheduled as usual"
                );
                JobExecutionResult::Timeouted
            }
            result = self.run_job(metadata, context, job_cancel.clone()) => result,
        }
    }

    async fn run_job(
        &self,
        metadata: &JobMetadata,
        context: &ExecutionContext,
        cancel: CancellationToken,
    ) -> JobExecutionResult {
        let scope = self.job_factory.begin_scope(None);
        let job = match self.job_factory.create_job_instance(&scope, metadata) {
            Ok(job) => job,
            Err(e) => {
                error!(job_class = %metadata.job_class, error = %e, "failed to create job instance");
                return JobExecutionResult::Failed;
            }
        };
        trace!(scope = scope.id(), "job created");

        let started = Instant::now();
        let outcome = AssertUnwindSafe(job.invoke(context, cancel))
            .catch_unwind()
            .await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(Ok(())) => {
                trace!(elapsed_ms, "job executed successfully");
                JobExecutionResult::Succeeded
            }
            Ok(Err(e)) => {
                error!(error = %e, elapsed_ms, "job execution failed, job will be rescheduled as usual");
                JobExecutionResult::Failed
            }
            Err(panic) => {
                error!(
                    panic = %panic_message(panic.as_ref()),
                    elapsed_ms,
                    "job panicked, job will be rescheduled as usual"
                );
                JobExecutionResult::Failed
            }
        }
    }

    fn reschedule(
        &self,
        metadata: &mut JobMetadata,
        result: JobExecutionResult,
        context: &ExecutionContext,
        planned: Option<DateTime<Utc>>,
    ) {
        if !result.reschedules() {
            return;
        }
        if !metadata.schedule.delayed_calculation() {
            metadata.next_execution = planned;
            return;
        }
        match metadata.set_next_execution_time(result, context, self.clock.now()) {
            Ok(()) => trace!(next_execution = ?metadata.next_execution, "next execution time updated"),
            Err(e) => error!(
                error = %e,
                "calculation of next execution time failed, job will be rescheduled immediately"
            ),
        }
    }

    /// Persist the outcome and clear ownership. Never fails the call.
    async fn finalize(
        &self,
        claimed: &VersionedId<J>,
        metadata: &JobMetadata,
        result: JobExecutionResult,
        node: &N,
    ) {
        match self
            .job_store
            .complete_execution(claimed, metadata, result)
            .await
        {
            Ok(WriteOutcome::Committed(version)) => {
                trace!(%version, "job state cleared");
            }
            Ok(WriteOutcome::Conflict) => {
                warn!(%result, "somebody has already updated the job, completion discarded");
            }
            Err(e) => {
                error!(
                    job_id = %claimed,
                    node_id = %node,
                    %result,
                    attempt = metadata.attempt,
                    next_execution = ?metadata.next_execution,
                    error = %e,
                    "failed to complete job execution, job state may be inconsistent"
                );
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
