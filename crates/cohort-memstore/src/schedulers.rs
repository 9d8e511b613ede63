//! In-memory scheduler registry.

use std::sync::Arc;

use async_trait::async_trait;
use cohort_scheduler::{
    Clock, Identifier, SchedulerMetadata, SchedulerMetadataStore, StoreError, SystemClock,
    WriteOutcome,
};
use dashmap::DashMap;
use tracing::trace;

/// Scheduler metadata store backed by a concurrent map.
pub struct InMemorySchedulerStore<N: Identifier> {
    schedulers: DashMap<N, SchedulerMetadata>,
    clock: Arc<dyn Clock>,
}

impl<N: Identifier> Default for InMemorySchedulerStore<N> {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl<N: Identifier> InMemorySchedulerStore<N> {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            schedulers: DashMap::new(),
            clock,
        }
    }

    pub fn get(&self, node: &N) -> Option<SchedulerMetadata> {
        self.schedulers.get(node).map(|r| r.value().clone())
    }

    pub fn len(&self) -> usize {
        self.schedulers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schedulers.is_empty()
    }
}

#[async_trait]
impl<N: Identifier> SchedulerMetadataStore<N> for InMemorySchedulerStore<N> {
    async fn add_scheduler(
        &self,
        node: &N,
        metadata: &SchedulerMetadata,
    ) -> Result<(), StoreError> {
        self.schedulers.insert(node.clone(), metadata.clone());
        trace!(node_id = %node, "scheduler registered");
        Ok(())
    }

    async fn heartbeat(&self, node: &N) -> Result<(), StoreError> {
        let mut metadata = self
            .schedulers
            .get_mut(node)
            .ok_or_else(|| StoreError::NotRegistered(node.to_string()))?;
        metadata.last_checkin = self.clock.now();
        Ok(())
    }

    async fn get_schedulers(&self) -> Result<Vec<(N, SchedulerMetadata)>, StoreError> {
        Ok(self
            .schedulers
            .iter()
            .map(|r| (r.key().clone(), r.value().clone()))
            .collect())
    }

    async fn remove_scheduler(&self, node: &N) -> Result<WriteOutcome<()>, StoreError> {
        match self.schedulers.remove(node) {
            Some(_) => Ok(WriteOutcome::Committed(())),
            None => Ok(WriteOutcome::Conflict),
        }
    }
}
