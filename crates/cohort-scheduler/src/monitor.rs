//! Detection and recovery of stalled peers and timed-out jobs.

use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, trace, warn};

use crate::clock::Clock;
use crate::error::StoreError;
use crate::store::{JobStore, SchedulerMetadataStore};
use crate::types::{
    ExecutionContext, Identifier, JobDescriptor, JobExecutionResult, SchedulerMetadata,
    WriteOutcome,
};

/// What one monitoring pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MonitorReport {
    /// Stalled peers whose registration this node deleted.
    pub removed_schedulers: usize,
    /// Jobs released from stalled peers.
    pub recovered_jobs: usize,
    /// Timed-out jobs finalized on behalf of their owner.
    pub timeouted_jobs: usize,
    /// Store failures; each one only skipped its own item or check.
    pub failures: usize,
    /// The pass stopped early on cancellation.
    pub cancelled: bool,
}

pub struct ClusterStateMonitor<J: Identifier, N: Identifier> {
    scheduler_store: Arc<dyn SchedulerMetadataStore<N>>,
    job_store: Arc<dyn JobStore<J, N>>,
    clock: Arc<dyn Clock>,
}

impl<J: Identifier, N: Identifier> ClusterStateMonitor<J, N> {
    pub fn new(
        scheduler_store: Arc<dyn SchedulerMetadataStore<N>>,
        job_store: Arc<dyn JobStore<J, N>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            scheduler_store,
            job_store,
            clock,
        }
    }

    /// Recover stalled peers, then timed-out jobs. Never fails; failures are
    /// counted in the report.
    #[tracing::instrument(skip_all, fields(node_id = %own))]
    pub async fn monitor_cluster_state(
        &self,
        own: &N,
        cancel: &CancellationToken,
    ) -> MonitorReport {
        let mut report = MonitorReport::default();

        let started = Instant::now();
        match self.monitor_stalled_schedulers(own, cancel, &mut report).await {
            Ok(()) => trace!(
                elapsed_ms = started.elapsed().as_millis() as u64,
                "stalled scheduler check completed"
            ),
            Err(e) => {
                report.failures += 1;
                error!(
                    error = %e,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "stalled scheduler check failed"
                );
            }
        }

        if report.cancelled {
            return report;
        }

        let started = Instant::now();
        match self.monitor_timeouted_jobs(cancel, &mut report).await {
            Ok(()) => trace!(
                elapsed_ms = started.elapsed().as_millis() as u64,
                "timed-out job check completed"
            ),
            Err(e) => {
                report.failures += 1;
                error!(
                    error = %e,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "timed-out job check failed"
                );
            }
        }

        report
    }

    async fn monitor_stalled_schedulers(
        &self,
        own: &N,
        cancel: &CancellationToken,
        report: &mut MonitorReport,
    ) -> Result<(), StoreError> {
        let schedulers = self.scheduler_store.get_schedulers().await?;
        trace!(count = schedulers.len(), "schedulers found");
        if !schedulers.iter().any(|(id, _)| id == own) {
            warn!("own scheduler is not registered");
        }

        let now = self.clock.now();
        let stalled = schedulers
            .into_iter()
            .filter(|(id, metadata)| id != own && metadata.is_stalled(now));

        for (peer, metadata) in stalled {
            if cancel.is_cancelled() {
                info!("stalled scheduler check interrupted by cancellation");
                report.cancelled = true;
                return Ok(());
            }
            if let Err(e) = self.recover_scheduler(&peer, &metadata, report).await {
                report.failures += 1;
                error!(peer_id = %peer, error = %e, "processing stalled scheduler failed");
            }
        }
        Ok(())
    }

    async fn recover_scheduler(
        &self,
        peer: &N,
        metadata: &SchedulerMetadata,
        report: &mut MonitorReport,
    ) -> Result<(), StoreError> {
        warn!(
            peer_id = %peer,
            last_checkin = %metadata.last_checkin,
            timeout_ms = metadata.heartbeat_timeout.as_millis() as u64,
            "scheduler seems to be stalled"
        );

        match self.scheduler_store.remove_scheduler(peer).await? {
            WriteOutcome::Committed(()) => {
                report.removed_schedulers += 1;
                info!(peer_id = %peer, "stalled scheduler removed");
            }
            WriteOutcome::Conflict => {
                info!(peer_id = %peer, "stalled scheduler removed by someone else");
            }
        }

        let executing = self.job_store.get_executing_jobs(peer).await?;
        if executing.is_empty() {
            info!(peer_id = %peer, "no jobs executing at stalled scheduler");
            return Ok(());
        }
        warn!(peer_id = %peer, count = executing.len(), "jobs found executing at stalled scheduler");

        for job in executing {
            match self
                .job_store
                .recover_job(&job.id, JobExecutionResult::SchedulerStalled)
                .await
            {
                Ok(WriteOutcome::Committed(_)) => {
                    report.recovered_jobs += 1;
                    info!(
                        job_id = %job.id,
                        peer_id = %peer,
                        "job recovered and rescheduled immediately"
                    );
                }
                Ok(WriteOutcome::Conflict) => {
                    info!(job_id = %job.id, "job recovered by someone else");
                }
                Err(e) => {
                    report.failures += 1;
                    error!(job_id = %job.id, peer_id = %peer, error = %e, "recovering job failed");
                }
            }
        }
        Ok(())
    }

    async fn monitor_timeouted_jobs(
        &self,
        cancel: &CancellationToken,
        report: &mut MonitorReport,
    ) -> Result<(), StoreError> {
        let jobs = self.job_store.get_timeouted_jobs().await?;
        if jobs.is_empty() {
            trace!("no timed-out jobs detected");
            return Ok(());
        }
        warn!(count = jobs.len(), "timed-out jobs detected");

        for job in jobs {
            if cancel.is_cancelled() {
                info!("timed-out job check interrupted by cancellation");
                report.cancelled = true;
                return Ok(());
            }
            let job_id = job.id.clone();
            match self.finalize_timeouted(job).await {
                Ok(WriteOutcome::Committed(_)) => {
                    report.timeouted_jobs += 1;
                    info!(job_id = %job_id, "timed-out job rescheduled");
                }
                Ok(WriteOutcome::Conflict) => {
                    info!(job_id = %job_id, "timed-out job was recovered by someone else");
                }
                Err(e) => {
                    report.failures += 1;
                    error!(job_id = %job_id, error = %e, "processing timed-out job failed");
                }
            }
        }
        Ok(())
    }

    async fn finalize_timeouted(
        &self,
        job: JobDescriptor<J>,
    ) -> Result<WriteOutcome<crate::types::Version>, StoreError> {
        let JobDescriptor { id, mut metadata } = job;
        let context = ExecutionContext::for_attempt(&metadata);
        if let Err(e) = metadata.set_next_execution_time(
            JobExecutionResult::Timeouted,
            &context,
            self.clock.now(),
        ) {
            error!(
                job_id = %id,
                error = %e,
                "failed to calculate next execution, job will be rescheduled immediately"
            );
        }
        metadata.attempt = context.attempt();

        self.job_store
            .finalize_job(&id, &metadata, JobExecutionResult::Timeouted)
            .await
    }
}
