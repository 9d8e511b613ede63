//! Scheduler types.

use std::collections::BTreeMap;
use std::fmt::{self, Debug, Display};
use std::hash::Hash;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ScheduleError;

/// Key type for jobs and scheduler nodes.
///
/// Equality must be structural: stall detection and ownership checks compare
/// keys by value.
pub trait Identifier: Clone + Eq + Hash + Debug + Display + Send + Sync + 'static {}

impl<T> Identifier for T where T: Clone + Eq + Hash + Debug + Display + Send + Sync + 'static {}

/// Optimistic-concurrency token of a job record.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Version(pub u64);

impl Version {
    /// The version a record gets after one more committed write.
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// A job key together with the record version it was read at.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VersionedId<J> {
    pub id: J,
    pub version: Version,
}

impl<J> VersionedId<J> {
    pub fn new(id: J, version: Version) -> Self {
        Self { id, version }
    }

    /// Same key, different version.
    pub fn at(&self, version: Version) -> Self
    where
        J: Clone,
    {
        Self {
            id: self.id.clone(),
            version,
        }
    }
}

impl<J: Display> Display for VersionedId<J> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.version)
    }
}

/// Result of a conditional store write.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome<T> {
    /// The write was applied.
    Committed(T),
    /// The record changed since it was read; someone else won the race.
    Conflict,
}

impl<T> WriteOutcome<T> {
    pub fn is_committed(&self) -> bool {
        matches!(self, WriteOutcome::Committed(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, WriteOutcome::Conflict)
    }
}

/// User key/value context carried across executions.
pub type UserContext = BTreeMap<String, String>;

/// Outcome of one execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobExecutionResult {
    /// Rejected by the worker pool or lost the claim race.
    NotStarted,
    /// The job body returned an error or panicked.
    Failed,
    /// The node shut down while the job was running.
    Cancelled,
    /// The job ran past its own timeout.
    Timeouted,
    /// The job completed normally.
    Succeeded,
    /// The owning node stopped heartbeating and a peer recovered the job.
    SchedulerStalled,
}

impl JobExecutionResult {
    /// Whether this outcome recomputes the next execution time.
    pub fn reschedules(self) -> bool {
        matches!(
            self,
            JobExecutionResult::Succeeded
                | JobExecutionResult::Failed
                | JobExecutionResult::Timeouted
        )
    }
}

impl Display for JobExecutionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobExecutionResult::NotStarted => "not_started",
            JobExecutionResult::Failed => "failed",
            JobExecutionResult::Cancelled => "cancelled",
            JobExecutionResult::Timeouted => "timeouted",
            JobExecutionResult::Succeeded => "succeeded",
            JobExecutionResult::SchedulerStalled => "scheduler_stalled",
        };
        f.write_str(s)
    }
}

/// Per-attempt view handed to the job body.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    user_context: Arc<UserContext>,
    attempt: u32,
}

impl ExecutionContext {
    pub fn new(user_context: UserContext, attempt: u32) -> Self {
        Self {
            user_context: Arc::new(user_context),
            attempt,
        }
    }

    /// Context for the next attempt of a job.
    pub fn for_attempt(metadata: &JobMetadata) -> Self {
        Self::new(metadata.context.clone(), metadata.attempt.saturating_add(1))
    }

    pub fn user_context(&self) -> &UserContext {
        &self.user_context
    }

    /// 1-based attempt number; counts consecutive unsuccessful runs.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

/// Recurrence policy of a job.
///
/// A returned delta of `None` means the job is due again immediately.
pub trait Schedule: Debug + Send + Sync {
    /// Exclusive jobs take ownership of the record while they run.
    fn exclusive(&self) -> bool {
        true
    }

    /// Compute the next execution after the run instead of at claim time.
    fn delayed_calculation(&self) -> bool {
        true
    }

    /// Delay after a successful run.
    fn next(&self, context: &ExecutionContext) -> Result<Option<Duration>, ScheduleError>;

    /// Delay after a failed run.
    fn on_error(&self, context: &ExecutionContext) -> Result<Option<Duration>, ScheduleError> {
        self.next(context)
    }

    /// Delay after a timed-out run.
    fn on_timeout(&self, context: &ExecutionContext) -> Result<Option<Duration>, ScheduleError> {
        self.next(context)
    }
}

/// Exponential backoff for failed attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBackoff {
    pub base: Duration,
    pub max: Duration,
}

impl RetryBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Delay before retrying after the given failed attempt (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let doublings = attempt.saturating_sub(1).min(20);
        self.base
            .checked_mul(1 << doublings)
            .unwrap_or(self.max)
            .min(self.max)
    }
}

impl Default for RetryBackoff {
    fn default() -> Self {
        // 5min, 10min, 20min, 40min, max 1hr
        Self {
            base: Duration::minutes(5),
            max: Duration::hours(1),
        }
    }
}

/// Run every `interval`, optionally backing off after failures.
#[derive(Debug, Clone)]
pub struct IntervalSchedule {
    pub interval: Duration,
    pub retry: Option<RetryBackoff>,
    pub exclusive: bool,
    pub delayed_calculation: bool,
}

impl IntervalSchedule {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            retry: None,
            exclusive: true,
            delayed_calculation: true,
        }
    }

    pub fn with_retry(mut self, retry: RetryBackoff) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Allow overlapping runs of the same job on different nodes.
    pub fn shared(mut self) -> Self {
        self.exclusive = false;
        self
    }

    /// Compute the next execution when the job is claimed.
    pub fn precomputed(mut self) -> Self {
        self.delayed_calculation = false;
        self
    }
}

impl Schedule for IntervalSchedule {
    fn exclusive(&self) -> bool {
        self.exclusive
    }

    fn delayed_calculation(&self) -> bool {
        self.delayed_calculation
    }

    fn next(&self, _context: &ExecutionContext) -> Result<Option<Duration>, ScheduleError> {
        if self.interval < Duration::zero() {
            return Err(ScheduleError::Calculation(format!(
                "negative interval {}",
                self.interval
            )));
        }
        Ok(Some(self.interval))
    }

    fn on_error(&self, context: &ExecutionContext) -> Result<Option<Duration>, ScheduleError> {
        match &self.retry {
            Some(retry) => Ok(Some(retry.delay(context.attempt()))),
            None => self.next(context),
        }
    }
}

/// A schedulable unit of work as stored in the job store.
#[derive(Debug, Clone)]
pub struct JobMetadata {
    /// Name the job factory resolves to an executable job.
    pub job_class: String,
    /// User context carried across executions.
    pub context: UserContext,
    /// Per-execution timeout. `None`, zero, and `Duration::MAX` all disable
    /// it; see [`JobMetadata::effective_timeout`].
    pub timeout: Option<std::time::Duration>,
    /// When this job should next run. `None` means immediately.
    pub next_execution: Option<DateTime<Utc>>,
    /// Number of consecutive unsuccessful attempts (resets on success).
    pub attempt: u32,
    /// Recurrence policy.
    pub schedule: Arc<dyn Schedule>,
}

impl JobMetadata {
    pub fn new(job_class: impl Into<String>, schedule: Arc<dyn Schedule>) -> Self {
        Self {
            job_class: job_class.into(),
            context: UserContext::new(),
            timeout: None,
            next_execution: None,
            attempt: 0,
            schedule,
        }
    }

    /// Create a job that recurs every `interval`.
    pub fn interval(job_class: impl Into<String>, interval: Duration) -> Self {
        Self::new(job_class, Arc::new(IntervalSchedule::new(interval)))
    }

    pub fn with_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn with_next_execution(mut self, at: DateTime<Utc>) -> Self {
        self.next_execution = Some(at);
        self
    }

    /// The timeout to enforce, if it is positive and finite.
    pub fn effective_timeout(&self) -> Option<std::time::Duration> {
        self.timeout
            .filter(|t| !t.is_zero() && *t != std::time::Duration::MAX)
    }

    /// Check if this job is due to run.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_execution.is_none_or(|at| at <= now)
    }

    /// Delay the schedule prescribes after an attempt ended with `result`.
    pub fn next_delta(
        &self,
        result: JobExecutionResult,
        context: &ExecutionContext,
    ) -> Result<Option<Duration>, ScheduleError> {
        match result {
            JobExecutionResult::Succeeded => self.schedule.next(context),
            JobExecutionResult::Failed => self.schedule.on_error(context),
            JobExecutionResult::Timeouted => self.schedule.on_timeout(context),
            _ => Ok(None),
        }
    }

    /// Recompute `next_execution` after an attempt ended with `result`.
    ///
    /// Outcomes that do not reschedule leave the metadata untouched. On a
    /// calculation error the job is left due immediately and the error is
    /// returned for logging.
    pub fn set_next_execution_time(
        &mut self,
        result: JobExecutionResult,
        context: &ExecutionContext,
        now: DateTime<Utc>,
    ) -> Result<(), ScheduleError> {
        if !result.reschedules() {
            return Ok(());
        }
        let next = self
            .next_delta(result, context)
            .and_then(|delta| delta.map(|d| execution_after(now, d)).transpose());
        match next {
            Ok(next) => {
                self.next_execution = next;
                Ok(())
            }
            Err(e) => {
                self.next_execution = None;
                Err(e)
            }
        }
    }
}

/// `now` shifted by `delta`. Deltas past the representable range are a
/// calculation error.
pub fn execution_after(
    now: DateTime<Utc>,
    delta: Duration,
) -> Result<DateTime<Utc>, ScheduleError> {
    now.checked_add_signed(delta).ok_or_else(|| {
        ScheduleError::Calculation(format!("next execution {delta} after {now} is out of range"))
    })
}

/// A job record as read from the store.
#[derive(Debug, Clone)]
pub struct JobDescriptor<J> {
    pub id: VersionedId<J>,
    pub metadata: JobMetadata,
}

impl<J> JobDescriptor<J> {
    pub fn new(id: VersionedId<J>, metadata: JobMetadata) -> Self {
        Self { id, metadata }
    }
}

/// Liveness record of one scheduler node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerMetadata {
    pub heartbeat_interval: std::time::Duration,
    pub heartbeat_timeout: std::time::Duration,
    pub last_checkin: DateTime<Utc>,
}

impl SchedulerMetadata {
    pub fn new(
        heartbeat_interval: std::time::Duration,
        heartbeat_timeout: std::time::Duration,
        last_checkin: DateTime<Utc>,
    ) -> Self {
        Self {
            heartbeat_interval,
            heartbeat_timeout,
            last_checkin,
        }
    }

    /// A node is stalled once its last heartbeat is older than its timeout.
    pub fn is_stalled(&self, now: DateTime<Utc>) -> bool {
        let timeout = Duration::from_std(self.heartbeat_timeout).unwrap_or(Duration::MAX);
        now - self.last_checkin > timeout
    }
}
