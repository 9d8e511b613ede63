//! In-process demo cluster.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use cohort_memstore::{InMemoryJobStore, InMemorySchedulerStore};
use cohort_scheduler::{
    BoxError, Clock, ExecutionContext, IntervalSchedule, Job, JobFactory, JobManager, JobMetadata,
    JobStore, NodeState, RegistryJobFactory, RetryBackoff, Scheduler, SchedulerConfig,
    SchedulerMetadataStore, SystemClock,
};
use miette::{IntoDiagnostic, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Shape of the demo workload.
#[derive(Debug, Clone)]
pub struct ClusterOptions {
    pub nodes: usize,
    pub jobs: usize,
    pub job_interval: Duration,
    pub job_duration: Duration,
    pub job_timeout: Option<Duration>,
    /// Every n-th run fails; 0 disables failures.
    pub fail_every: u64,
    /// Stop after this long; `None` runs until shutdown.
    pub run_for: Option<Duration>,
    /// Dispose the first node halfway through without deregistering it.
    pub crash_node: bool,
}

/// Outcome of a demo run.
#[derive(Debug, Default)]
pub struct Summary {
    pub nodes: usize,
    pub completions: u64,
    /// Last recorded result per outcome.
    pub results: BTreeMap<String, usize>,
    /// Nodes still registered after shutdown.
    pub registered: usize,
}

/// Sleeps for a while, sometimes failing.
struct DemoJob {
    duration: Duration,
    fail_every: u64,
    runs: Arc<AtomicU64>,
}

#[async_trait]
impl Job for DemoJob {
    async fn invoke(
        &self,
        context: &ExecutionContext,
        cancel: CancellationToken,
    ) -> Result<(), BoxError> {
        let run = self.runs.fetch_add(1, Ordering::Relaxed) + 1;
        let job = context.user_context().get("job").map(String::as_str).unwrap_or("?");
        info!(job, attempt = context.attempt(), "demo job running");

        tokio::select! {
            _ = cancel.cancelled() => return Err("interrupted".into()),
            _ = tokio::time::sleep(self.duration) => {}
        }

        if self.fail_every > 0 && run % self.fail_every == 0 {
            return Err(format!("simulated failure on run {run}").into());
        }
        Ok(())
    }
}

fn demo_factory(options: &ClusterOptions) -> RegistryJobFactory {
    let runs = Arc::new(AtomicU64::new(0));
    let duration = options.job_duration;
    let fail_every = options.fail_every;
    RegistryJobFactory::new().register("demo", move |_, _| {
        Ok(Arc::new(DemoJob {
            duration,
            fail_every,
            runs: Arc::clone(&runs),
        }) as Arc<dyn Job>)
    })
}

fn demo_job(index: usize, options: &ClusterOptions) -> Result<JobMetadata> {
    let interval = chrono::Duration::from_std(options.job_interval).into_diagnostic()?;
    let schedule = IntervalSchedule::new(interval)
        .with_retry(RetryBackoff::new(interval, interval * 8));
    let mut metadata =
        JobMetadata::new("demo", Arc::new(schedule)).with_context("job", format!("job-{index}"));
    if let Some(timeout) = options.job_timeout {
        metadata = metadata.with_timeout(timeout);
    }
    Ok(metadata)
}

fn node_id(index: usize) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("node-{index}-{}", &suffix[..8])
}

/// Wait for `duration`, or until shutdown. Returns false on shutdown.
async fn wait(duration: Option<Duration>, shutdown: &CancellationToken) -> bool {
    match duration {
        Some(duration) => tokio::select! {
            _ = shutdown.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        },
        None => {
            shutdown.cancelled().await;
            false
        }
    }
}

/// Run a cluster against shared in-memory stores until `run_for` elapses or
/// `shutdown` fires, then stop every node.
pub async fn run(
    options: ClusterOptions,
    config: SchedulerConfig,
    shutdown: CancellationToken,
) -> Result<Summary> {
    config.validate().into_diagnostic()?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let jobs = Arc::new(InMemoryJobStore::<String, String>::new(Arc::clone(&clock)));
    let schedulers = Arc::new(InMemorySchedulerStore::<String>::new(Arc::clone(&clock)));
    let factory: Arc<dyn JobFactory> = Arc::new(demo_factory(&options));

    for index in 0..options.jobs {
        jobs.schedule_job(format!("job-{index}"), demo_job(index, &options)?)
            .await
            .into_diagnostic()?;
    }

    let mut nodes = Vec::with_capacity(options.nodes);
    for index in 0..options.nodes {
        let node = Scheduler::with_clock(
            node_id(index),
            config.clone(),
            Arc::clone(&jobs) as Arc<dyn JobStore<String, String>>,
            Arc::clone(&schedulers) as Arc<dyn SchedulerMetadataStore<String>>,
            Arc::clone(&factory),
            Arc::clone(&clock),
        )
        .into_diagnostic()?;
        node.start().await.into_diagnostic()?;
        nodes.push(node);
    }
    info!(nodes = nodes.len(), jobs = options.jobs, "cluster started");

    let crash = options.crash_node && nodes.len() > 1;
    let (first, rest) = match (crash, options.run_for) {
        (true, Some(total)) => (Some(total / 2), Some(total - total / 2)),
        (true, None) => (Some(config.heartbeat_timeout), None),
        (false, run_for) => (run_for, None),
    };

    let mut running = wait(first, &shutdown).await;
    if running && crash {
        warn!(node_id = %nodes[0].id(), "disposing node without deregistration");
        nodes[0].dispose().await.into_diagnostic()?;
        running = wait(rest, &shutdown).await;
    }
    if !running {
        info!("shutdown requested");
    }

    for node in &nodes {
        if node.state().await == NodeState::Running {
            node.stop().await.into_diagnostic()?;
        }
    }

    let mut summary = Summary {
        nodes: nodes.len(),
        completions: jobs.completions(),
        registered: schedulers.len(),
        ..Summary::default()
    };
    for index in 0..options.jobs {
        if let Some(result) = jobs
            .get(&format!("job-{index}"))
            .and_then(|record| record.last_result)
        {
            *summary.results.entry(result.to_string()).or_default() += 1;
        }
    }
    Ok(summary)
}
