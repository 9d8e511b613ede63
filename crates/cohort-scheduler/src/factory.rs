//! Job instantiation with explicit scope handles.
//!
//! Each execution runs inside its own [`JobScope`]. Scoped resources live
//! exactly as long as the scope. A child scope keeps its parent alive, so a
//! parent is never released before its children.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::error::{BoxError, FactoryError};
use crate::types::{ExecutionContext, JobMetadata};

/// User code executed by the scheduler.
#[async_trait]
pub trait Job: Send + Sync {
    /// Run once. `cancel` fires on node shutdown or when the job's own
    /// timeout elapses.
    async fn invoke(
        &self,
        context: &ExecutionContext,
        cancel: CancellationToken,
    ) -> Result<(), BoxError>;
}

/// Resolves job classes to executable jobs.
pub trait JobFactory: Send + Sync {
    /// Open a scope, nested under `parent` if given.
    fn begin_scope(&self, parent: Option<&JobScope>) -> JobScope {
        match parent {
            Some(parent) => parent.child(),
            None => JobScope::root(),
        }
    }

    fn create_job_instance(
        &self,
        scope: &JobScope,
        metadata: &JobMetadata,
    ) -> Result<Arc<dyn Job>, FactoryError>;
}

static NEXT_SCOPE_ID: AtomicU64 = AtomicU64::new(1);

struct ScopeInner {
    id: u64,
    depth: usize,
    parent: Option<Arc<ScopeInner>>,
    resources: Mutex<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
}

impl Drop for ScopeInner {
    fn drop(&mut self) {
        trace!(scope = self.id, depth = self.depth, "job scope released");
    }
}

/// Owned handle to a resource scope.
pub struct JobScope {
    inner: Arc<ScopeInner>,
}

impl JobScope {
    /// A top-level scope.
    pub fn root() -> Self {
        Self::with_parent(None)
    }

    /// A scope nested in this one.
    pub fn child(&self) -> Self {
        Self::with_parent(Some(Arc::clone(&self.inner)))
    }

    fn with_parent(parent: Option<Arc<ScopeInner>>) -> Self {
        let depth = parent.as_ref().map_or(0, |p| p.depth + 1);
        let id = NEXT_SCOPE_ID.fetch_add(1, Ordering::Relaxed);
        trace!(scope = id, depth, "job scope opened");
        Self {
            inner: Arc::new(ScopeInner {
                id,
                depth,
                parent,
                resources: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Nesting depth; root scopes are at 0.
    pub fn depth(&self) -> usize {
        self.inner.depth
    }

    pub fn parent_id(&self) -> Option<u64> {
        self.inner.parent.as_ref().map(|p| p.id)
    }

    /// The scope's instance of `T`, created on first use.
    pub fn resource<T, F>(&self, init: F) -> Arc<T>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> T,
    {
        let mut resources = self
            .inner
            .resources
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let entry = resources
            .entry(TypeId::of::<T>())
            .or_insert_with(|| Arc::new(init()) as Arc<dyn Any + Send + Sync>);
        match Arc::clone(entry).downcast::<T>() {
            Ok(resource) => resource,
            // Entries are keyed by their own TypeId.
            Err(_) => unreachable!("scope resource stored under a foreign TypeId"),
        }
    }
}

impl fmt::Debug for JobScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobScope")
            .field("id", &self.inner.id)
            .field("depth", &self.inner.depth)
            .finish()
    }
}

type Constructor =
    Arc<dyn Fn(&JobScope, &JobMetadata) -> Result<Arc<dyn Job>, BoxError> + Send + Sync>;

/// Job factory backed by a table of constructors keyed by job class.
#[derive(Default, Clone)]
pub struct RegistryJobFactory {
    constructors: HashMap<String, Constructor>,
}

impl RegistryJobFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a constructor that builds a fresh job per execution.
    pub fn register<F>(mut self, job_class: impl Into<String>, constructor: F) -> Self
    where
        F: Fn(&JobScope, &JobMetadata) -> Result<Arc<dyn Job>, BoxError> + Send + Sync + 'static,
    {
        self.constructors
            .insert(job_class.into(), Arc::new(constructor));
        self
    }

    /// Register one shared instance for every execution of `job_class`.
    pub fn register_instance(self, job_class: impl Into<String>, job: Arc<dyn Job>) -> Self {
        self.register(job_class, move |_, _| Ok(Arc::clone(&job)))
    }

    pub fn job_classes(&self) -> impl Iterator<Item = &str> {
        self.constructors.keys().map(String::as_str)
    }
}

impl JobFactory for RegistryJobFactory {
    fn create_job_instance(
        &self,
        scope: &JobScope,
        metadata: &JobMetadata,
    ) -> Result<Arc<dyn Job>, FactoryError> {
        let constructor = self
            .constructors
            .get(&metadata.job_class)
            .ok_or_else(|| FactoryError::UnknownJobClass(metadata.job_class.clone()))?;
        constructor(scope, metadata).map_err(|e| FactoryError::Construction {
            class: metadata.job_class.clone(),
            reason: e.to_string(),
        })
    }
}

impl fmt::Debug for RegistryJobFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut classes: Vec<_> = self.job_classes().collect();
        classes.sort_unstable();
        f.debug_struct("RegistryJobFactory")
            .field("job_classes", &classes)
            .finish()
    }
}
