//! Scripted stores and jobs for unit tests.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio_util::sync::CancellationToken;

use crate::error::{BoxError, ScheduleError, StoreError};
use crate::factory::Job;
use crate::store::{JobStore, JobStream, SchedulerMetadataStore};
use crate::types::{
    ExecutionContext, JobDescriptor, JobExecutionResult, JobMetadata, Schedule, SchedulerMetadata,
    Version, VersionedId, WriteOutcome,
};

/// How a scripted write answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Response {
    #[default]
    Commit,
    Conflict,
    Fail,
}

impl Response {
    fn answer<T>(self, value: T) -> Result<WriteOutcome<T>, StoreError> {
        match self {
            Response::Commit => Ok(WriteOutcome::Committed(value)),
            Response::Conflict => Ok(WriteOutcome::Conflict),
            Response::Fail => Err(StoreError::Backend("scripted failure".to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Fetch(usize),
    SetOwner(String, String),
    StartExclusive(String, String, Option<DateTime<Utc>>),
    Start(String, String, Option<DateTime<Utc>>),
    Complete(String, JobExecutionResult),
    Executing(String),
    Timeouted,
    Recover(String, JobExecutionResult),
}

type Completed = (VersionedId<String>, JobMetadata, JobExecutionResult);

/// Job store that records calls and answers from a script.
#[derive(Default)]
pub struct MockJobStore {
    calls: Mutex<Vec<Call>>,
    due: Mutex<Vec<JobDescriptor<String>>>,
    fetch_fails: Mutex<bool>,
    claim: Mutex<Response>,
    complete: Mutex<Response>,
    recover: Mutex<Response>,
    executing: Mutex<HashMap<String, Vec<JobDescriptor<String>>>>,
    executing_fails_for: Mutex<HashSet<String>>,
    timeouted: Mutex<Vec<JobDescriptor<String>>>,
    completed: Mutex<Vec<Completed>>,
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl MockJobStore {
    pub fn calls(&self) -> Vec<Call> {
        lock(&self.calls).clone()
    }

    pub fn clear_calls(&self) {
        lock(&self.calls).clear();
    }

    fn record(&self, call: Call) {
        lock(&self.calls).push(call);
    }

    pub fn set_due(&self, jobs: Vec<JobDescriptor<String>>) {
        *lock(&self.due) = jobs;
    }

    pub fn set_fetch_fails(&self, fails: bool) {
        *lock(&self.fetch_fails) = fails;
    }

    pub fn set_claim_response(&self, response: Response) {
        *lock(&self.claim) = response;
    }

    pub fn set_complete_response(&self, response: Response) {
        *lock(&self.complete) = response;
    }

    pub fn set_recover_response(&self, response: Response) {
        *lock(&self.recover) = response;
    }

    pub fn set_executing(&self, node: &str, jobs: Vec<JobDescriptor<String>>) {
        lock(&self.executing).insert(node.to_string(), jobs);
    }

    pub fn fail_executing_for(&self, node: &str) {
        lock(&self.executing_fails_for).insert(node.to_string());
    }

    pub fn set_timeouted(&self, jobs: Vec<JobDescriptor<String>>) {
        *lock(&self.timeouted) = jobs;
    }

    pub fn last_completed(&self) -> Option<Completed> {
        lock(&self.completed).last().cloned()
    }

    pub fn completed_count(&self) -> usize {
        lock(&self.completed).len()
    }
}

#[async_trait]
impl JobStore<String, String> for MockJobStore {
    async fn get_jobs_for_execution(
        &self,
        count: usize,
    ) -> Result<JobStream<String>, StoreError> {
        self.record(Call::Fetch(count));
        if *lock(&self.fetch_fails) {
            return Err(StoreError::Backend("scripted failure".to_string()));
        }
        let jobs: Vec<_> = lock(&self.due).iter().take(count).cloned().map(Ok).collect();
        Ok(Box::pin(tokio_stream::iter(jobs)))
    }

    async fn start_exclusive_execution(
        &self,
        job: &VersionedId<String>,
        node: &String,
        next_execution: Option<DateTime<Utc>>,
    ) -> Result<WriteOutcome<Version>, StoreError> {
        self.record(Call::StartExclusive(
            job.id.clone(),
            node.clone(),
            next_execution,
        ));
        lock(&self.claim).answer(job.version.next())
    }

    async fn set_job_owner(
        &self,
        job: &VersionedId<String>,
        node: &String,
    ) -> Result<WriteOutcome<Version>, StoreError> {
        self.record(Call::SetOwner(job.id.clone(), node.clone()));
        lock(&self.claim).answer(job.version.next())
    }

    async fn start_execution(
        &self,
        job: &VersionedId<String>,
        node: &String,
        next_execution: Option<DateTime<Utc>>,
    ) -> Result<WriteOutcome<Version>, StoreError> {
        self.record(Call::Start(job.id.clone(), node.clone(), next_execution));
        lock(&self.claim).answer(job.version.next())
    }

    async fn complete_execution(
        &self,
        job: &VersionedId<String>,
        metadata: &JobMetadata,
        result: JobExecutionResult,
    ) -> Result<WriteOutcome<Version>, StoreError> {
        self.record(Call::Complete(job.id.clone(), result));
        lock(&self.completed).push((job.clone(), metadata.clone(), result));
        lock(&self.complete).answer(job.version.next())
    }

    async fn get_executing_jobs(
        &self,
        node: &String,
    ) -> Result<Vec<JobDescriptor<String>>, StoreError> {
        self.record(Call::Executing(node.clone()));
        if lock(&self.executing_fails_for).contains(node) {
            return Err(StoreError::Backend("scripted failure".to_string()));
        }
        Ok(lock(&self.executing).get(node).cloned().unwrap_or_default())
    }

    async fn get_timeouted_jobs(&self) -> Result<Vec<JobDescriptor<String>>, StoreError> {
        self.record(Call::Timeouted);
        Ok(lock(&self.timeouted).clone())
    }

    async fn recover_job(
        &self,
        job: &VersionedId<String>,
        reason: JobExecutionResult,
    ) -> Result<WriteOutcome<Version>, StoreError> {
        self.record(Call::Recover(job.id.clone(), reason));
        lock(&self.recover).answer(job.version.next())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerCall {
    Add(String),
    Heartbeat(String),
    List,
    Remove(String),
}

/// Scheduler metadata store that records calls and answers from a script.
#[derive(Default)]
pub struct MockSchedulerStore {
    calls: Mutex<Vec<SchedulerCall>>,
    schedulers: Mutex<Vec<(String, SchedulerMetadata)>>,
    add_fails: Mutex<bool>,
    heartbeat_fails: Mutex<bool>,
    heartbeat_delay: Mutex<std::time::Duration>,
    heartbeat_times: Mutex<Vec<tokio::time::Instant>>,
    list_fails: Mutex<bool>,
    remove: Mutex<HashMap<String, Response>>,
}

impl MockSchedulerStore {
    pub fn calls(&self) -> Vec<SchedulerCall> {
        lock(&self.calls).clone()
    }

    fn record(&self, call: SchedulerCall) {
        lock(&self.calls).push(call);
    }

    pub fn set_schedulers(&self, schedulers: Vec<(String, SchedulerMetadata)>) {
        *lock(&self.schedulers) = schedulers;
    }

    pub fn set_add_fails(&self, fails: bool) {
        *lock(&self.add_fails) = fails;
    }

    pub fn set_heartbeat_fails(&self, fails: bool) {
        *lock(&self.heartbeat_fails) = fails;
    }

    /// Make every heartbeat take `delay` before answering.
    pub fn set_heartbeat_delay(&self, delay: std::time::Duration) {
        *lock(&self.heartbeat_delay) = delay;
    }

    /// When each heartbeat call started.
    pub fn heartbeat_times(&self) -> Vec<tokio::time::Instant> {
        lock(&self.heartbeat_times).clone()
    }

    pub fn set_list_fails(&self, fails: bool) {
        *lock(&self.list_fails) = fails;
    }

    pub fn set_remove_response(&self, node: &str, response: Response) {
        lock(&self.remove).insert(node.to_string(), response);
    }

    pub fn heartbeats(&self) -> usize {
        lock(&self.calls)
            .iter()
            .filter(|c| matches!(c, SchedulerCall::Heartbeat(_)))
            .count()
    }
}

#[async_trait]
impl SchedulerMetadataStore<String> for MockSchedulerStore {
    async fn add_scheduler(
        &self,
        node: &String,
        metadata: &SchedulerMetadata,
    ) -> Result<(), StoreError> {
        self.record(SchedulerCall::Add(node.clone()));
        if *lock(&self.add_fails) {
            return Err(StoreError::Backend("scripted failure".to_string()));
        }
        lock(&self.schedulers).push((node.clone(), metadata.clone()));
        Ok(())
    }

    async fn heartbeat(&self, node: &String) -> Result<(), StoreError> {
        self.record(SchedulerCall::Heartbeat(node.clone()));
        lock(&self.heartbeat_times).push(tokio::time::Instant::now());
        let delay = *lock(&self.heartbeat_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if *lock(&self.heartbeat_fails) {
            return Err(StoreError::Backend("scripted failure".to_string()));
        }
        Ok(())
    }

    async fn get_schedulers(&self) -> Result<Vec<(String, SchedulerMetadata)>, StoreError> {
        self.record(SchedulerCall::List);
        if *lock(&self.list_fails) {
            return Err(StoreError::Backend("scripted failure".to_string()));
        }
        Ok(lock(&self.schedulers).clone())
    }

    async fn remove_scheduler(&self, node: &String) -> Result<WriteOutcome<()>, StoreError> {
        self.record(SchedulerCall::Remove(node.clone()));
        let response = lock(&self.remove).get(node).copied().unwrap_or_default();
        response.answer(())
    }
}

type JobFn = dyn Fn(ExecutionContext, CancellationToken) -> Pin<Box<dyn Future<Output = Result<(), BoxError>> + Send>>
    + Send
    + Sync;

/// Job built from a closure.
pub struct FnJob(Box<JobFn>);

impl FnJob {
    pub fn new<F, Fut>(f: F) -> Arc<dyn Job>
    where
        F: Fn(ExecutionContext, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        Arc::new(Self(Box::new(move |context, cancel| Box::pin(f(context, cancel)))))
    }
}

#[async_trait]
impl Job for FnJob {
    async fn invoke(
        &self,
        context: &ExecutionContext,
        cancel: CancellationToken,
    ) -> Result<(), BoxError> {
        (self.0)(context.clone(), cancel).await
    }
}

/// A due job of class `test` recurring every minute.
pub fn descriptor(id: &str) -> JobDescriptor<String> {
    JobDescriptor::new(
        VersionedId::new(id.to_string(), Version(0)),
        JobMetadata::interval("test", Duration::seconds(60)),
    )
}

/// Schedule whose next run lies past the representable time range.
#[derive(Debug)]
pub struct NeverAgain {
    pub precomputed: bool,
}

impl Schedule for NeverAgain {
    fn delayed_calculation(&self) -> bool {
        !self.precomputed
    }

    fn next(&self, _context: &ExecutionContext) -> Result<Option<Duration>, ScheduleError> {
        Ok(Some(Duration::MAX))
    }
}
