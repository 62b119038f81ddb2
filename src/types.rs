//! Core type definitions for the capacity scheduler.
//!
//! This module defines the data structures shared across the scheduling
//! engine: scheduler and task configuration records, capacity and overflow
//! strategies, periodic release rules, failure-recovery strategies, runtime
//! statistics, and the scheduler error type.
//!
//! Configuration records implement serde so they can travel through
//! application config layers; callbacks and recovery hooks are type-erased
//! function objects and are never serialized.

use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::time::Duration;
use uuid::Uuid;

/// Unique identifier for scheduled tasks.
///
/// Ids are never reused, which makes them safe to carry inside timer
/// callbacks: a timer that fires after its task has already settled simply
/// refers to an id the scheduler no longer tracks.
pub type TaskId = Uuid;

/// Boxed error produced by task callbacks and recovery hooks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Shared form of a task error, kept across retry attempts.
pub type TaskError = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// Future returned by a task callback.
pub type TaskFuture<T> = BoxFuture<'static, Result<T, BoxError>>;

/// A caller-supplied unit of work.
///
/// The callback is re-invoked for every retry attempt, so it must be `Fn`
/// rather than `FnOnce`. The scheduler never inspects what the produced
/// future does; it only observes the final `Result`.
pub type TaskCallback<T> = Arc<dyn Fn() -> TaskFuture<T> + Send + Sync>;

/// Context handed to a custom failure-recovery hook.
#[derive(Clone)]
pub struct FailureContext {
    /// The error produced by the attempt that just failed.
    pub error: TaskError,
    /// One-based number of the attempt that just failed.
    pub retry_attempt: u32,
}

impl fmt::Debug for FailureContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FailureContext")
            .field("error", &self.error.to_string())
            .field("retry_attempt", &self.retry_attempt)
            .finish()
    }
}

/// Verdict returned by a custom failure-recovery hook.
#[derive(Debug)]
pub enum RetryDecision {
    /// Re-admit the task after the given delay.
    Retry {
        /// Delay before the task re-enters the queue.
        after: Duration,
    },
    /// Give up and settle the task with the given error.
    Fail {
        /// Error delivered to the task's result channel.
        error: BoxError,
    },
}

/// Custom failure-recovery hook.
///
/// Invoked once per failed attempt. If the hook's future itself fails, the
/// task settles with [`SchedulerError::OnFailure`] wrapping the hook error.
pub type FailureHook =
    Arc<dyn Fn(FailureContext) -> BoxFuture<'static, Result<RetryDecision, BoxError>> + Send + Sync>;

/// How dispatched tasks account against `max_capacity`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CapacityStrategy {
    /// A running task occupies capacity only for its execution lifetime.
    /// Completion (or failure, or timeout) restores exactly what it reserved.
    #[default]
    Reserve,
    /// A running task's capacity remains occupied after completion. Only
    /// release rules or manual adjustment restore it.
    Claim,
}

/// What to do when a task's capacity exceeds `max_capacity` at admission.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskExceedsMaxCapacityStrategy {
    /// Reject the schedule call with [`SchedulerError::MaxCapacityExceeded`].
    #[default]
    ThrowError,
    /// Clamp the task's capacity to `max_capacity`; the task then waits until
    /// the full capacity is free.
    WaitForFullCapacity,
}

/// What to do when admission would exceed `max_queue_size`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueSizeExceededStrategy {
    /// Reject the newcomer with [`SchedulerError::QueueSizeExceeded`].
    #[default]
    ThrowError,
    /// Evict the oldest pending task, settling it with
    /// [`SchedulerError::QueueSizeExceeded`], then admit the newcomer.
    Replace,
    /// Evict the lowest-priority pending task, but only when it is strictly
    /// lower-priority than the newcomer; otherwise reject the newcomer.
    ReplaceByPriority,
}

/// Periodic rule that lowers `used_capacity`.
///
/// Rules only make sense together with `max_capacity`, and are most useful
/// under [`CapacityStrategy::Claim`], where completed work does not release
/// its capacity on its own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ReleaseRule {
    /// Every `interval`, set `used_capacity` to `value`.
    Reset {
        /// Capacity level to reset to. Usually zero.
        value: f64,
        /// Firing period. Must be positive.
        interval: Duration,
    },
    /// Every `interval`, subtract `value` from `used_capacity`, clamped at
    /// zero.
    Reduce {
        /// Amount subtracted per firing. Must be positive.
        value: f64,
        /// Firing period. Must be positive.
        interval: Duration,
    },
}

impl ReleaseRule {
    /// A reset-to-zero rule with the given period.
    pub fn reset_every(interval: Duration) -> Self {
        Self::Reset { value: 0.0, interval }
    }

    /// A reduce-by-`value` rule with the given period.
    pub fn reduce_every(value: f64, interval: Duration) -> Self {
        Self::Reduce { value, interval }
    }

    /// Firing period of the rule.
    pub fn interval(&self) -> Duration {
        match self {
            Self::Reset { interval, .. } | Self::Reduce { interval, .. } => *interval,
        }
    }
}

/// Options for the built-in exponential-backoff retry strategy.
///
/// The delay before 1-based attempt `k` is
/// `min(max_timeout, round(r * max(min_timeout, 1ms) * factor^(k - 1)))`,
/// with `r = 1`, or drawn uniformly from `[1, 2)` when `randomize` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryOptions {
    /// Maximum number of retry attempts after the initial one.
    pub retries: u32,
    /// Base delay before the first retry.
    pub min_timeout: Duration,
    /// Upper bound on any retry delay. `None` means unbounded.
    pub max_timeout: Option<Duration>,
    /// Multiplier applied per attempt.
    pub factor: f64,
    /// Scale each delay by a uniform random factor in `[1, 2)`.
    pub randomize: bool,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            retries: 10,
            min_timeout: Duration::from_millis(1000),
            max_timeout: None,
            factor: 2.0,
            randomize: false,
        }
    }
}

/// Failure-recovery strategy consulted when a task callback fails.
#[derive(Clone, Default)]
pub enum FailRecovery {
    /// Settle the task with the original error. The default.
    #[default]
    None,
    /// Retry with exponential backoff.
    Retry(RetryOptions),
    /// Delegate the decision to a caller-supplied hook.
    Custom(FailureHook),
}

impl FailRecovery {
    /// Retry with the default backoff options.
    pub fn retry() -> Self {
        Self::Retry(RetryOptions::default())
    }
}

impl fmt::Debug for FailRecovery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Retry(opts) => f.debug_tuple("Retry").field(opts).finish(),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Scheduler configuration.
///
/// All limits are optional; an empty record yields a scheduler that admits
/// everything immediately and tracks only concurrency. Validation rules are
/// applied by [`crate::Scheduler::new`] and
/// [`crate::Scheduler::set_options`]; see the individual fields.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulerOptions {
    /// Total capacity budget shared by running tasks. Must be non-negative.
    pub max_capacity: Option<f64>,
    /// Starting value for `used_capacity`. Requires `max_capacity`, and must
    /// lie within `0..=max_capacity`.
    pub initially_used_capacity: Option<f64>,
    /// Maximum number of concurrently executing tasks.
    pub max_concurrent: Option<u32>,
    /// Maximum number of pending tasks; admission beyond this applies
    /// `queue_size_exceeded_strategy`.
    pub max_queue_size: Option<usize>,
    /// Reserve or claim accounting. Requires `max_capacity`.
    pub capacity_strategy: Option<CapacityStrategy>,
    /// Policy for tasks whose capacity exceeds `max_capacity`.
    pub task_exceeds_max_capacity_strategy: TaskExceedsMaxCapacityStrategy,
    /// Policy applied when the queue is full.
    pub queue_size_exceeded_strategy: QueueSizeExceededStrategy,
    /// Wall-time pending tasks may wait before being promoted ahead of all
    /// priorities.
    pub queue_waiting_limit: Option<Duration>,
    /// Wall-time after which a still-pending task fails with
    /// [`SchedulerError::QueueTimeout`].
    pub queue_waiting_timeout: Option<Duration>,
    /// Wall-time after which a running task's result is disowned and its
    /// channel settled with [`SchedulerError::ExecutionTimeout`].
    pub execution_timeout: Option<Duration>,
    /// Minimum wall-time gap between successive dispatches.
    pub min_delay_between_tasks: Option<Duration>,
    /// Periodic capacity-release rules. Requires `max_capacity`.
    pub release_rules: Vec<ReleaseRule>,
    /// Default failure-recovery strategy; tasks may override per-task.
    #[serde(skip)]
    pub fail_recovery: FailRecovery,
}

impl SchedulerOptions {
    pub(crate) fn validate(&self) -> SchedulerResult<()> {
        if let Some(max) = self.max_capacity {
            if !max.is_finite() || max < 0.0 {
                return Err(SchedulerError::InvalidArgument(
                    "max_capacity must be a non-negative number".into(),
                ));
            }
        }
        match (self.initially_used_capacity, self.max_capacity) {
            (Some(_), None) => {
                return Err(SchedulerError::InvalidCall(
                    "cannot set initially_used_capacity without max_capacity".into(),
                ));
            }
            (Some(used), Some(max)) => {
                if !used.is_finite() || used < 0.0 || used > max {
                    return Err(SchedulerError::InvalidArgument(
                        "initially_used_capacity must be within 0..=max_capacity".into(),
                    ));
                }
            }
            _ => {}
        }
        if !self.release_rules.is_empty() && self.max_capacity.is_none() {
            return Err(SchedulerError::InvalidArgument(
                "cannot use release_rules without max_capacity".into(),
            ));
        }
        if self.capacity_strategy.is_some() && self.max_capacity.is_none() {
            return Err(SchedulerError::InvalidArgument(
                "cannot use capacity_strategy without max_capacity".into(),
            ));
        }
        for rule in &self.release_rules {
            if rule.interval().is_zero() {
                return Err(SchedulerError::InvalidArgument(
                    "release rule interval must be positive".into(),
                ));
            }
            match rule {
                ReleaseRule::Reset { value, .. } => {
                    if !value.is_finite() || *value < 0.0 {
                        return Err(SchedulerError::InvalidArgument(
                            "reset rule value must be a non-negative number".into(),
                        ));
                    }
                }
                ReleaseRule::Reduce { value, .. } => {
                    if !value.is_finite() || *value <= 0.0 {
                        return Err(SchedulerError::InvalidArgument(
                            "reduce rule value must be a positive number".into(),
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    pub(crate) fn effective_capacity_strategy(&self) -> CapacityStrategy {
        self.capacity_strategy.unwrap_or_default()
    }
}

/// Per-task parameters, overriding scheduler defaults where set.
#[derive(Debug, Clone, Default)]
pub struct TaskParams {
    /// Capacity the task occupies while running. Defaults to 1.
    pub capacity: Option<f64>,
    /// Priority in `0..=9`, lower is more urgent. Defaults to 5.
    pub priority: Option<u8>,
    /// Overrides the scheduler's `execution_timeout`.
    pub execution_timeout: Option<Duration>,
    /// Overrides the scheduler's `queue_waiting_limit`.
    pub queue_waiting_limit: Option<Duration>,
    /// Overrides the scheduler's `queue_waiting_timeout`.
    pub queue_waiting_timeout: Option<Duration>,
    /// Overrides the scheduler's default failure-recovery strategy.
    pub fail_recovery: Option<FailRecovery>,
}

impl TaskParams {
    /// Parameters with the given capacity, everything else defaulted.
    pub fn with_capacity(capacity: f64) -> Self {
        Self {
            capacity: Some(capacity),
            ..Self::default()
        }
    }

    /// Sets the task priority.
    #[must_use]
    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }
}

/// Default task capacity when none is supplied.
pub const DEFAULT_TASK_CAPACITY: f64 = 1.0;

/// Default task priority.
pub const DEFAULT_TASK_PRIORITY: u8 = 5;

/// Lowest (most urgent) priority value.
pub const MIN_PRIORITY: u8 = 0;

/// Highest (least urgent) priority value.
pub const MAX_PRIORITY: u8 = 9;

/// Parameters for [`crate::Scheduler::stop`].
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct StopParams {
    /// Shorthand for setting the other three flags.
    pub stop_all: bool,
    /// Settle every pending task with [`SchedulerError::Stopped`].
    pub stop_waiting_tasks: bool,
    /// Settle every executing task's channel with
    /// [`SchedulerError::Stopped`]. The underlying work still runs to
    /// completion; its result is discarded.
    pub reject_executing_tasks: bool,
    /// Cancel every retry timer and settle the affected tasks with
    /// [`SchedulerError::Stopped`].
    pub stop_task_retries: bool,
}

impl StopParams {
    /// Stop everything: waiting tasks, executing tasks, and retries.
    pub fn all() -> Self {
        Self {
            stop_all: true,
            ..Self::default()
        }
    }

    pub(crate) fn normalized(self) -> Self {
        if self.stop_all {
            Self {
                stop_all: true,
                stop_waiting_tasks: true,
                reject_executing_tasks: true,
                stop_task_retries: true,
            }
        } else {
            self
        }
    }
}

/// Point-in-time snapshot of scheduler state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerStats {
    /// Number of tasks waiting in the queue.
    pub queued_tasks: usize,
    /// Number of tasks currently executing.
    pub executing_tasks: usize,
    /// Number of tasks sleeping between a failure and the next attempt.
    pub retrying_tasks: usize,
    /// Capacity currently in use.
    pub used_capacity: f64,
    /// Number of concurrency slots in use.
    pub used_concurrent: u32,
    /// Whether the scheduler has been stopped.
    pub stopped: bool,
}

/// Errors produced by the scheduler.
///
/// Misuse errors (`InvalidArgument`, `InvalidCall`) and the throw-error
/// admission strategies (`MaxCapacityExceeded`, `QueueSizeExceeded`) are
/// returned from the offending call. Everything that happens after admission
/// (`QueueTimeout`, `ExecutionTimeout`, `Stopped`, `OnFailure`, `Failed`)
/// arrives on the task's result channel.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// An argument was out of range or otherwise malformed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An operation was called in a configuration that does not support it.
    #[error("invalid call: {0}")]
    InvalidCall(String),

    /// A task's capacity exceeds `max_capacity` under the throw-error
    /// strategy.
    #[error("task capacity {capacity} exceeds maximum capacity {max_capacity}")]
    MaxCapacityExceeded {
        /// The rejected task's capacity.
        capacity: f64,
        /// The configured ceiling.
        max_capacity: f64,
    },

    /// The pending queue is full and the overflow policy rejected the task.
    #[error("queue size limit reached")]
    QueueSizeExceeded,

    /// The task spent longer than `queue_waiting_timeout` in the queue.
    #[error("task timed out waiting in the queue")]
    QueueTimeout,

    /// The task ran longer than its execution timeout. The underlying work
    /// was not cancelled; its eventual result is discarded.
    #[error("task execution timed out after {0:?}")]
    ExecutionTimeout(Duration),

    /// A custom failure-recovery hook itself failed.
    #[error("failure recovery hook failed: {hook_error} (task error: {cause})")]
    OnFailure {
        /// The error produced by the hook.
        hook_error: TaskError,
        /// The task error the hook was consulted about.
        cause: TaskError,
    },

    /// The scheduler was stopped.
    #[error("scheduler is stopped")]
    Stopped,

    /// The task callback failed and recovery declined to (or could not)
    /// retry.
    #[error("{0}")]
    Failed(TaskError),
}

/// Result alias for scheduler operations.
pub type SchedulerResult<T> = Result<T, SchedulerError>;
