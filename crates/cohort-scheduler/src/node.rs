//! Scheduler node lifecycle and main loop.

use std::fmt;
use std::future::Future;
use std::ops::ControlFlow;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::SchedulerConfig;
use crate::error::SchedulerError;
use crate::factory::JobFactory;
use crate::monitor::{ClusterStateMonitor, MonitorReport};
use crate::pool::WorkerPool;
use crate::processor::JobProcessor;
use crate::single::SingleJobProcessor;
use crate::store::{JobStore, SchedulerMetadataStore};
use crate::types::{Identifier, SchedulerMetadata, WriteOutcome};

/// Lifecycle state of a [`Scheduler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Created,
    Running,
    Stopped,
    Disposed,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeState::Created => "created",
            NodeState::Running => "running",
            NodeState::Stopped => "stopped",
            NodeState::Disposed => "disposed",
        };
        f.write_str(s)
    }
}

/// Everything the main loop task needs.
struct Node<J: Identifier, N: Identifier> {
    id: N,
    config: SchedulerConfig,
    scheduler_store: Arc<dyn SchedulerMetadataStore<N>>,
    monitor: ClusterStateMonitor<J, N>,
    processor: JobProcessor<J, N>,
}

struct Lifecycle {
    state: NodeState,
    main_loop: Option<JoinHandle<()>>,
}

/// One peer of the cluster.
///
/// `start` registers the node and spawns the main loop; every tick heartbeats,
/// monitors the cluster, and dispatches due jobs.
pub struct Scheduler<J: Identifier, N: Identifier> {
    node: Arc<Node<J, N>>,
    pool: WorkerPool,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
    lifecycle: Mutex<Lifecycle>,
}

impl<J: Identifier, N: Identifier> Scheduler<J, N> {
    pub fn new(
        id: N,
        config: SchedulerConfig,
        job_store: Arc<dyn JobStore<J, N>>,
        scheduler_store: Arc<dyn SchedulerMetadataStore<N>>,
        job_factory: Arc<dyn JobFactory>,
    ) -> Result<Self, SchedulerError> {
        Self::with_clock(
            id,
            config,
            job_store,
            scheduler_store,
            job_factory,
            Arc::new(SystemClock),
        )
    }

    pub fn with_clock(
        id: N,
        config: SchedulerConfig,
        job_store: Arc<dyn JobStore<J, N>>,
        scheduler_store: Arc<dyn SchedulerMetadataStore<N>>,
        job_factory: Arc<dyn JobFactory>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, SchedulerError> {
        config.validate()?;
        let pool = WorkerPool::new(config.worker_capacity)?;

        let single = SingleJobProcessor::new(
            Arc::clone(&job_store),
            job_factory,
            pool.clone(),
            Arc::clone(&clock),
        );
        let node = Node {
            id,
            monitor: ClusterStateMonitor::new(
                Arc::clone(&scheduler_store),
                Arc::clone(&job_store),
                Arc::clone(&clock),
            ),
            processor: JobProcessor::new(job_store, single),
            scheduler_store,
            config,
        };

        Ok(Self {
            node: Arc::new(node),
            pool,
            clock,
            cancel: CancellationToken::new(),
            lifecycle: Mutex::new(Lifecycle {
                state: NodeState::Created,
                main_loop: None,
            }),
        })
    }

    pub fn id(&self) -> &N {
        &self.node.id
    }

    pub async fn state(&self) -> NodeState {
        self.lifecycle.lock().await.state
    }

    /// Jobs dispatched by this node that have not finished yet.
    pub fn in_flight(&self) -> usize {
        self.node.processor.in_flight()
    }

    pub fn available_workers(&self) -> usize {
        self.pool.available_workers()
    }

    /// Register the node and spawn its main loop.
    #[tracing::instrument(skip(self), fields(node_id = %self.node.id))]
    pub async fn start(&self) -> Result<(), SchedulerError> {
        let mut lifecycle = self.lifecycle.lock().await;
        self.require(lifecycle.state, NodeState::Created)?;

        let metadata = SchedulerMetadata::new(
            self.node.config.heartbeat_interval,
            self.node.config.heartbeat_timeout,
            self.clock.now(),
        );
        if let Err(e) = self
            .node
            .scheduler_store
            .add_scheduler(&self.node.id, &metadata)
            .await
        {
            error!(error = %e, "failed to register scheduler");
            return Err(SchedulerError::Registration {
                node: self.node.id.to_string(),
                source: e,
            });
        }

        let node = Arc::clone(&self.node);
        let cancel = self.cancel.clone();
        lifecycle.main_loop = Some(tokio::spawn(async move { node.run(cancel).await }));
        lifecycle.state = NodeState::Running;

        info!(
            capacity = self.pool.capacity(),
            heartbeat_interval_ms = self.node.config.heartbeat_interval.as_millis() as u64,
            "scheduler started"
        );
        Ok(())
    }

    /// Cancel the main loop and running jobs, wait for them, and deregister.
    #[tracing::instrument(skip(self), fields(node_id = %self.node.id))]
    pub async fn stop(&self) -> Result<(), SchedulerError> {
        let mut lifecycle = self.lifecycle.lock().await;
        self.require(lifecycle.state, NodeState::Running)?;

        self.cancel.cancel();
        if let Some(main_loop) = lifecycle.main_loop.take() {
            if let Err(e) = main_loop.await {
                error!(error = %e, "main loop task failed");
            }
        }
        self.node.processor.wait_idle().await;

        if self.node.config.deregister_on_stop {
            match self
                .node
                .scheduler_store
                .remove_scheduler(&self.node.id)
                .await
            {
                Ok(WriteOutcome::Committed(())) => debug!("scheduler deregistered"),
                Ok(WriteOutcome::Conflict) => {
                    info!("scheduler registration was already removed");
                }
                Err(e) => warn!(error = %e, "failed to deregister scheduler"),
            }
        }

        lifecycle.state = NodeState::Stopped;
        info!("scheduler stopped");
        Ok(())
    }

    /// Cancel everything and refuse any further lifecycle call, including a
    /// second `dispose`.
    pub async fn dispose(&self) -> Result<(), SchedulerError> {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.state == NodeState::Disposed {
            return Err(SchedulerError::Disposed(self.node.id.to_string()));
        }
        self.cancel.cancel();
        self.pool.close();
        if let Some(main_loop) = lifecycle.main_loop.take() {
            if let Err(e) = main_loop.await {
                error!(node_id = %self.node.id, error = %e, "main loop task failed");
            }
        }
        lifecycle.state = NodeState::Disposed;
        debug!(node_id = %self.node.id, "scheduler disposed");
        Ok(())
    }

    fn require(&self, current: NodeState, required: NodeState) -> Result<(), SchedulerError> {
        match current {
            NodeState::Disposed => Err(SchedulerError::Disposed(self.node.id.to_string())),
            current if current == required => Ok(()),
            current => Err(SchedulerError::InvalidState { required, current }),
        }
    }
}

impl<J: Identifier, N: Identifier> Drop for Scheduler<J, N> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl<J: Identifier, N: Identifier> Node<J, N> {
    async fn run(&self, cancel: CancellationToken) {
        info!(node_id = %self.id, "main loop started");
        loop {
            let started = Instant::now();
            if self.tick(&cancel).await.is_break() {
                break;
            }

            let remaining = self
                .config
                .heartbeat_interval
                .saturating_sub(started.elapsed());
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = sleep(remaining) => {}
            }
        }
        info!(node_id = %self.id, "main loop stopped");
    }

    async fn tick(&self, cancel: &CancellationToken) -> ControlFlow<()> {
        self.child_action("heartbeat", cancel, async {
            self.scheduler_store
                .heartbeat(&self.id)
                .await
                .map_err(SchedulerError::from)
        })
        .await?;

        self.child_action("monitor_cluster_state", cancel, async {
            let report = self.monitor.monitor_cluster_state(&self.id, cancel).await;
            if report != MonitorReport::default() {
                debug!(?report, "cluster monitoring finished");
            }
            Ok(())
        })
        .await?;

        self.child_action("process_jobs", cancel, async {
            self.processor
                .process_jobs(&self.id, cancel)
                .await
                .map(|_| ())
        })
        .await
    }

    /// Run one step of the tick. Errors are logged and swallowed;
    /// cancellation ends the loop.
    async fn child_action<F>(
        &self,
        action: &'static str,
        cancel: &CancellationToken,
        step: F,
    ) -> ControlFlow<()>
    where
        F: Future<Output = Result<(), SchedulerError>>,
    {
        let started = Instant::now();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!(
                    node_id = %self.id,
                    action,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "main loop action cancelled"
                );
                ControlFlow::Break(())
            }
            result = step => {
                let elapsed_ms = started.elapsed().as_millis() as u64;
                match result {
                    Ok(()) => trace!(node_id = %self.id, action, elapsed_ms, "main loop action completed"),
                    Err(e) => error!(node_id = %self.id, action, elapsed_ms, error = %e, "main loop action failed"),
                }
                ControlFlow::Continue(())
            }
        }
    }
}
