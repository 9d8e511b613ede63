//! Per-tick dispatch of due jobs.

use std::sync::Arc;
use std::time::Instant;

use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, trace};

use crate::error::SchedulerError;
use crate::single::SingleJobProcessor;
use crate::store::JobStore;
use crate::types::Identifier;

/// Pulls a batch of due jobs and runs each one in the background.
pub struct JobProcessor<J: Identifier, N: Identifier> {
    job_store: Arc<dyn JobStore<J, N>>,
    single: SingleJobProcessor<J, N>,
    tracker: TaskTracker,
}

impl<J: Identifier, N: Identifier> JobProcessor<J, N> {
    pub fn new(job_store: Arc<dyn JobStore<J, N>>, single: SingleJobProcessor<J, N>) -> Self {
        Self {
            job_store,
            single,
            tracker: TaskTracker::new(),
        }
    }

    /// Dispatch up to one job per free worker without waiting for them.
    ///
    /// Returns the number of jobs handed to the pool. Only a failure to read
    /// the batch is reported; every job is its own error boundary.
    #[tracing::instrument(skip_all, fields(node_id = %node))]
    pub async fn process_jobs(
        &self,
        node: &N,
        cancel: &CancellationToken,
    ) -> Result<usize, SchedulerError> {
        let available = self.single.pool().available_workers();
        if available == 0 {
            trace!("no workers available, skipping job processing");
            return Ok(0);
        }

        let mut jobs = self.job_store.get_jobs_for_execution(available).await?;
        let mut dispatched = 0;

        while let Some(job) = jobs.next().await {
            if cancel.is_cancelled() {
                debug!(dispatched, "job dispatch interrupted by cancellation");
                break;
            }
            let descriptor = match job {
                Ok(descriptor) => descriptor,
                Err(e) => {
                    error!(error = %e, "failed to read due job, skipping");
                    continue;
                }
            };

            let single = self.single.clone();
            let node = node.clone();
            let cancel = cancel.clone();
            self.tracker.spawn(async move {
                let job_id = descriptor.id.id.clone();
                let started = Instant::now();
                match single.process(descriptor, &node, &cancel).await {
                    Ok(result) => debug!(
                        job_id = %job_id,
                        node_id = %node,
                        %result,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "job processed"
                    ),
                    Err(e) => error!(
                        job_id = %job_id,
                        node_id = %node,
                        error = %e,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "job processing failed"
                    ),
                }
            });
            dispatched += 1;
        }

        if dispatched > 0 {
            debug!(dispatched, in_flight = self.in_flight(), "jobs dispatched");
        }
        Ok(dispatched)
    }

    /// Jobs dispatched and not yet finished.
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Wait until every dispatched job has finished.
    pub async fn wait_idle(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::factory::RegistryJobFactory;
    use crate::pool::WorkerPool;
    use crate::testing::{Call, FnJob, MockJobStore, Response, descriptor};
    use crate::types::JobExecutionResult;
    use pretty_assertions::assert_eq;
    use tokio::sync::Notify;

    fn processor(
        store: &Arc<MockJobStore>,
        job: Arc<dyn crate::factory::Job>,
        capacity: usize,
    ) -> JobProcessor<String, String> {
        let store = Arc::clone(store) as Arc<dyn JobStore<String, String>>;
        let single = SingleJobProcessor::new(
            Arc::clone(&store),
            Arc::new(RegistryJobFactory::new().register_instance("test", job)),
            WorkerPool::new(capacity).unwrap(),
            Arc::new(ManualClock::default()) as Arc<dyn Clock>,
        );
        JobProcessor::new(store, single)
    }

    fn ok_job() -> Arc<dyn crate::factory::Job> {
        FnJob::new(|_, _| async { Ok(()) })
    }

    fn node() -> String {
        "node-a".to_string()
    }

    #[tokio::test]
    async fn test_no_free_worker_skips_fetch() {
        let store = Arc::new(MockJobStore::default());
        let processor = processor(&store, ok_job(), 1);
        let _busy = processor.single.pool().try_acquire().unwrap();

        let dispatched = processor
            .process_jobs(&node(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(dispatched, 0);
        assert!(store.calls().is_empty());
    }

    #[tokio::test]
    async fn test_fetches_one_job_per_free_worker() {
        let store = Arc::new(MockJobStore::default());
        store.set_due(vec![descriptor("a"), descriptor("b"), descriptor("c")]);
        let processor = processor(&store, ok_job(), 3);
        let busy = processor.single.pool().try_acquire().unwrap();

        let dispatched = processor
            .process_jobs(&node(), &CancellationToken::new())
            .await
            .unwrap();
        drop(busy);
        processor.wait_idle().await;

        assert_eq!(dispatched, 2);
        assert_eq!(store.calls()[0], Call::Fetch(2));
        assert_eq!(store.completed_count(), 2);
    }

    #[tokio::test]
    async fn test_empty_batch_is_a_no_op() {
        let store = Arc::new(MockJobStore::default());
        let processor = processor(&store, ok_job(), 2);

        let dispatched = processor
            .process_jobs(&node(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(dispatched, 0);
        assert_eq!(store.calls(), vec![Call::Fetch(2)]);
        assert_eq!(processor.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_dispatch_does_not_wait_for_jobs() {
        let release = Arc::new(Notify::new());
        let job = {
            let release = Arc::clone(&release);
            FnJob::new(move |_, _| {
                let release = Arc::clone(&release);
                async move {
                    release.notified().await;
                    Ok(())
                }
            })
        };
        let store = Arc::new(MockJobStore::default());
        store.set_due(vec![descriptor("a")]);
        let processor = processor(&store, job, 1);

        let dispatched = processor
            .process_jobs(&node(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(dispatched, 1);
        assert_eq!(processor.in_flight(), 1);

        release.notify_one();
        processor.wait_idle().await;
        assert_eq!(processor.in_flight(), 0);
        assert_eq!(
            store.last_completed().map(|(_, _, result)| result),
            Some(JobExecutionResult::Succeeded)
        );
    }

    #[tokio::test]
    async fn test_fetch_failure_propagates() {
        let store = Arc::new(MockJobStore::default());
        store.set_fetch_fails(true);
        let processor = processor(&store, ok_job(), 1);

        let result = processor
            .process_jobs(&node(), &CancellationToken::new())
            .await;

        assert!(matches!(result, Err(SchedulerError::Store(_))));
    }

    #[tokio::test]
    async fn test_job_errors_stay_inside_the_task() {
        let store = Arc::new(MockJobStore::default());
        store.set_due(vec![descriptor("a")]);
        store.set_claim_response(Response::Fail);
        let processor = processor(&store, ok_job(), 1);

        let dispatched = processor
            .process_jobs(&node(), &CancellationToken::new())
            .await
            .unwrap();
        processor.wait_idle().await;

        assert_eq!(dispatched, 1);
        assert_eq!(store.completed_count(), 0);
        assert_eq!(processor.single.pool().available_workers(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_token_stops_dispatch() {
        let store = Arc::new(MockJobStore::default());
        store.set_due(vec![descriptor("a"), descriptor("b")]);
        let processor = processor(&store, ok_job(), 2);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let dispatched = processor.process_jobs(&node(), &cancel).await.unwrap();

        assert_eq!(dispatched, 0);
    }
}
