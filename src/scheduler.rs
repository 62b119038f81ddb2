//! The scheduling engine.
//!
//! This module implements the scheduler loop and its surrounding state
//! machine: admission control, priority dispatch with capacity packing,
//! waiting-limit ageing, queue-overflow eviction, execution timeouts,
//! failure recovery, and lifecycle management.
//!
//! ## Architecture
//!
//! All scheduler state lives inside a single actor task fed by a command
//! channel. Every external call and every timer turns into one command, and
//! commands are processed one at a time, so no two scheduler steps ever
//! interleave. Dispatched callbacks run in spawned background units that
//! message their completion back into the channel; the actor never awaits a
//! callback itself.
//!
//! ```text
//! schedule / stop / setters ──┐
//!                             ▼
//! timers (waiting, execution, ├──▶ command channel ──▶ actor ──▶ dispatch
//! retry, release rules, delay)┘                         │
//!                                                       ▼
//!                                         spawned task callbacks
//!                                         (completion messages loop back)
//! ```
//!
//! ## Cancellation semantics
//!
//! Waiting tasks can be cancelled cleanly (timers and queue membership are
//! all scheduler-owned). Running callbacks cannot: once dispatched, the
//! underlying work runs to its natural end. An execution timeout or a
//! `reject_executing_tasks` stop only disowns the result.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Duration, Instant};
use tracing::{debug, trace};

use crate::capacity::CapacityAccountant;
use crate::queue::TaskList;
use crate::release::ReleaseDriver;
use crate::retry::backoff_delay;
use crate::types::{
    BoxError, FailRecovery, FailureContext, QueueSizeExceededStrategy, RetryDecision,
    SchedulerError, SchedulerOptions, SchedulerResult, SchedulerStats, StopParams, TaskCallback,
    TaskError, TaskExceedsMaxCapacityStrategy, TaskFuture, TaskId, TaskParams,
    DEFAULT_TASK_CAPACITY, DEFAULT_TASK_PRIORITY, MAX_PRIORITY,
};

/// Handle to a scheduled task's pending result.
///
/// The underlying channel is settled exactly once over the task's lifetime,
/// with either the callback's value or a typed [`SchedulerError`].
pub struct TaskReceipt<T> {
    id: TaskId,
    receiver: async_channel::Receiver<SchedulerResult<T>>,
}

impl<T> TaskReceipt<T> {
    /// Id of the scheduled task.
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Waits for the task to settle.
    pub async fn result(self) -> SchedulerResult<T> {
        match self.receiver.recv().await {
            Ok(result) => result,
            Err(_) => Err(SchedulerError::Stopped),
        }
    }
}

impl<T> std::fmt::Debug for TaskReceipt<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskReceipt").field("id", &self.id).finish()
    }
}

enum Command<T> {
    Schedule {
        params: TaskParams,
        callback: TaskCallback<T>,
        reply: async_channel::Sender<SchedulerResult<TaskReceipt<T>>>,
    },
    GetOptions {
        reply: async_channel::Sender<SchedulerOptions>,
    },
    SetOptions {
        options: SchedulerOptions,
        reply: async_channel::Sender<SchedulerResult<()>>,
    },
    GetUsedCapacity {
        reply: async_channel::Sender<f64>,
    },
    SetUsedCapacity {
        value: f64,
        reply: async_channel::Sender<SchedulerResult<()>>,
    },
    AdjustUsedCapacity {
        delta: f64,
        reply: async_channel::Sender<SchedulerResult<()>>,
    },
    GetStats {
        reply: async_channel::Sender<SchedulerStats>,
    },
    Stop {
        params: StopParams,
        reply: async_channel::Sender<()>,
    },
    TaskFinished {
        id: TaskId,
        result: Result<T, BoxError>,
    },
    ExecutionTimedOut {
        id: TaskId,
        timeout: Duration,
    },
    QueueWaitTimedOut {
        id: TaskId,
    },
    RetryFired {
        id: TaskId,
    },
    RetryDecision {
        id: TaskId,
        decision: Result<RetryDecision, BoxError>,
    },
    RuleFired {
        index: usize,
        epoch: u64,
    },
    DelayElapsed,
}

/// Capacity-aware asynchronous task scheduler.
///
/// The scheduler admits caller-supplied units of work and decides when each
/// may execute under capacity, concurrency, priority, and timing
/// constraints. *Capacity* is an uninterpreted quantity whose meaning the
/// caller chooses: memory pages, API tokens, connection slots.
///
/// Handles are cheap to clone; all clones drive the same scheduler.
///
/// # Examples
///
/// ```rust,no_run
/// use capacity_scheduler::{Scheduler, SchedulerOptions, StopParams, TaskParams};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let scheduler = Scheduler::<u64>::new(SchedulerOptions {
///         max_capacity: Some(10.0),
///         ..SchedulerOptions::default()
///     })?;
///
///     let receipt = scheduler
///         .schedule_task(TaskParams::with_capacity(4.0), || async { Ok(42) })
///         .await?;
///     assert_eq!(receipt.result().await?, 42);
///
///     scheduler.stop(StopParams::default()).await?;
///     Ok(())
/// }
/// ```
pub struct Scheduler<T> {
    cmd_tx: async_channel::Sender<Command<T>>,
}

impl<T> Clone for Scheduler<T> {
    fn clone(&self) -> Self {
        Self {
            cmd_tx: self.cmd_tx.clone(),
        }
    }
}

impl<T: Send + 'static> Scheduler<T> {
    /// Creates a scheduler with the given options.
    ///
    /// Must be called within a tokio runtime; the scheduler runs as a
    /// background task until [`Scheduler::stop`] completes or the runtime
    /// shuts down.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::InvalidArgument`] or
    /// [`SchedulerError::InvalidCall`] when the options violate the
    /// validation rules described on [`SchedulerOptions`].
    pub fn new(options: SchedulerOptions) -> SchedulerResult<Self> {
        options.validate()?;
        let (cmd_tx, cmd_rx) = async_channel::unbounded();
        let core = Core::new(options, cmd_tx.clone());
        tokio::spawn(core.run(cmd_rx));
        Ok(Self { cmd_tx })
    }

    /// Schedules a task with the default capacity of 1.
    pub async fn schedule<F, Fut>(&self, callback: F) -> SchedulerResult<TaskReceipt<T>>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, BoxError>> + Send + 'static,
    {
        self.schedule_task(TaskParams::default(), callback).await
    }

    /// Schedules a task occupying the given capacity.
    pub async fn schedule_with_capacity<F, Fut>(
        &self,
        capacity: f64,
        callback: F,
    ) -> SchedulerResult<TaskReceipt<T>>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, BoxError>> + Send + 'static,
    {
        self.schedule_task(TaskParams::with_capacity(capacity), callback)
            .await
    }

    /// Schedules a task with explicit parameters.
    ///
    /// The callback is invoked once per attempt, so retrying strategies
    /// re-invoke it. The returned receipt settles exactly once.
    ///
    /// # Errors
    ///
    /// Misuse ([`SchedulerError::InvalidArgument`]) and the throw-error
    /// admission strategies ([`SchedulerError::MaxCapacityExceeded`],
    /// [`SchedulerError::QueueSizeExceeded`]) are reported here. A stopped
    /// scheduler returns a receipt already settled with
    /// [`SchedulerError::Stopped`].
    pub async fn schedule_task<F, Fut>(
        &self,
        params: TaskParams,
        callback: F,
    ) -> SchedulerResult<TaskReceipt<T>>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, BoxError>> + Send + 'static,
    {
        let callback: TaskCallback<T> = Arc::new(move || -> TaskFuture<T> {
            Box::pin(callback())
        });
        self.request(|reply| Command::Schedule {
            params,
            callback,
            reply,
        })
        .await?
    }

    /// Returns the options the scheduler was configured with.
    pub async fn options(&self) -> SchedulerResult<SchedulerOptions> {
        self.request(|reply| Command::GetOptions { reply }).await
    }

    /// Replaces the scheduler options.
    ///
    /// Pending and executing tasks are not disturbed; new limits apply to
    /// future admission scans. Release-rule state carries over for rules
    /// whose record is unchanged.
    pub async fn set_options(&self, options: SchedulerOptions) -> SchedulerResult<()> {
        self.request(|reply| Command::SetOptions { options, reply })
            .await?
    }

    /// Current `used_capacity`, applying any pending release-rule catch-up
    /// first.
    pub async fn used_capacity(&self) -> SchedulerResult<f64> {
        self.request(|reply| Command::GetUsedCapacity { reply }).await
    }

    /// Sets `used_capacity` to an absolute value in `0..=max_capacity`.
    pub async fn set_used_capacity(&self, value: f64) -> SchedulerResult<()> {
        self.request(|reply| Command::SetUsedCapacity { value, reply })
            .await?
    }

    /// Adjusts `used_capacity` by a delta, clamped to `[0, max_capacity]`.
    pub async fn adjust_used_capacity(&self, delta: f64) -> SchedulerResult<()> {
        self.request(|reply| Command::AdjustUsedCapacity { delta, reply })
            .await?
    }

    /// Point-in-time snapshot of queue depth, executing and retrying
    /// counts, and resource usage.
    pub async fn stats(&self) -> SchedulerResult<SchedulerStats> {
        self.request(|reply| Command::GetStats { reply }).await
    }

    /// Whether the scheduler has been stopped.
    pub async fn is_stopped(&self) -> SchedulerResult<bool> {
        Ok(self.stats().await?.stopped)
    }

    /// Stops the scheduler.
    ///
    /// Marks the scheduler stopped (further schedules settle with
    /// [`SchedulerError::Stopped`]) and optionally clears waiting tasks,
    /// disowns executing tasks, and cancels retries, per `params`. Resolves
    /// once every remaining queued, executing, and retrying task has
    /// settled; with no clearing flags the queue keeps draining under the
    /// stopped flag first. Stopping an already stopped scheduler is a
    /// no-op that still waits for the drain.
    pub async fn stop(&self, params: StopParams) -> SchedulerResult<()> {
        let (reply, done) = async_channel::bounded(1);
        if self
            .cmd_tx
            .send(Command::Stop { params, reply })
            .await
            .is_err()
        {
            return Ok(());
        }
        let _ = done.recv().await;
        Ok(())
    }

    async fn request<R>(
        &self,
        make: impl FnOnce(async_channel::Sender<R>) -> Command<T>,
    ) -> SchedulerResult<R> {
        let (reply, response) = async_channel::bounded(1);
        self.cmd_tx
            .send(make(reply))
            .await
            .map_err(|_| SchedulerError::Stopped)?;
        response.recv().await.map_err(|_| SchedulerError::Stopped)
    }
}

struct TaskEntry<T> {
    id: TaskId,
    capacity: f64,
    priority: u8,
    time_limit: Option<Instant>,
    reserved_capacity: f64,
    reserved_concurrent: u32,
    retry_attempt: u32,
    callback: TaskCallback<T>,
    params: TaskParams,
    result_tx: Option<async_channel::Sender<SchedulerResult<T>>>,
    last_error: Option<TaskError>,
    wait_timer: Option<JoinHandle<()>>,
    exec_timer: Option<JoinHandle<()>>,
    retry_timer: Option<JoinHandle<()>>,
}

/// Actor state. Owns every task for its whole lifetime: a task is tracked
/// by exactly one of the pending indices, the executing set, or the retry
/// set, and is dropped once its result channel settles.
struct Core<T> {
    opts: SchedulerOptions,
    tasks: HashMap<TaskId, TaskEntry<T>>,
    queue: TaskList,
    by_time_added: TaskList,
    by_time_limit: BTreeSet<(Instant, TaskId)>,
    executing: HashSet<TaskId>,
    retrying: HashSet<TaskId>,
    accountant: CapacityAccountant,
    release: ReleaseDriver,
    rule_timers: Vec<JoinHandle<()>>,
    rule_epoch: u64,
    rules_awake: bool,
    stopped: bool,
    stop_waiters: Vec<async_channel::Sender<()>>,
    last_dispatch: Option<Instant>,
    delay_timer: Option<JoinHandle<()>>,
    cmd_tx: async_channel::Sender<Command<T>>,
}

impl<T: Send + 'static> Core<T> {
    fn new(options: SchedulerOptions, cmd_tx: async_channel::Sender<Command<T>>) -> Self {
        let now = Instant::now();
        let accountant = CapacityAccountant::new(
            options.max_capacity,
            options.max_concurrent,
            options.effective_capacity_strategy(),
            options.initially_used_capacity.unwrap_or(0.0),
        );
        let release = ReleaseDriver::new(&options.release_rules, now);
        Self {
            opts: options,
            tasks: HashMap::new(),
            queue: TaskList::new(),
            by_time_added: TaskList::new(),
            by_time_limit: BTreeSet::new(),
            executing: HashSet::new(),
            retrying: HashSet::new(),
            accountant,
            release,
            rule_timers: Vec::new(),
            rule_epoch: 0,
            rules_awake: false,
            stopped: false,
            stop_waiters: Vec::new(),
            last_dispatch: None,
            delay_timer: None,
            cmd_tx,
        }
    }

    async fn run(mut self, inbox: async_channel::Receiver<Command<T>>) {
        while let Ok(command) = inbox.recv().await {
            self.handle(command);
        }
    }

    fn handle(&mut self, command: Command<T>) {
        match command {
            Command::Schedule {
                params,
                callback,
                reply,
            } => self.handle_schedule(params, callback, reply),
            Command::GetOptions { reply } => {
                let _ = reply.try_send(self.opts.clone());
            }
            Command::SetOptions { options, reply } => {
                let _ = reply.try_send(self.handle_set_options(options));
            }
            Command::GetUsedCapacity { reply } => {
                let _ = reply.try_send(self.handle_get_used_capacity());
            }
            Command::SetUsedCapacity { value, reply } => {
                let _ = reply.try_send(self.handle_set_used_capacity(value));
            }
            Command::AdjustUsedCapacity { delta, reply } => {
                let _ = reply.try_send(self.handle_adjust_used_capacity(delta));
            }
            Command::GetStats { reply } => {
                let _ = reply.try_send(SchedulerStats {
                    queued_tasks: self.queue.len(),
                    executing_tasks: self.executing.len(),
                    retrying_tasks: self.retrying.len(),
                    used_capacity: self.accountant.used_capacity(),
                    used_concurrent: self.accountant.used_concurrent(),
                    stopped: self.stopped,
                });
            }
            Command::Stop { params, reply } => self.handle_stop(params, reply),
            Command::TaskFinished { id, result } => self.handle_task_finished(id, result),
            Command::ExecutionTimedOut { id, timeout } => {
                self.handle_execution_timed_out(id, timeout);
            }
            Command::QueueWaitTimedOut { id } => self.handle_queue_wait_timed_out(id),
            Command::RetryFired { id } => self.handle_retry_fired(id),
            Command::RetryDecision { id, decision } => self.handle_retry_decision(id, decision),
            Command::RuleFired { index, epoch } => self.handle_rule_fired(index, epoch),
            Command::DelayElapsed => {
                self.delay_timer = None;
                self.run_scheduler_loop();
            }
        }
    }

    // ----- admission -----

    fn handle_schedule(
        &mut self,
        params: TaskParams,
        callback: TaskCallback<T>,
        reply: async_channel::Sender<SchedulerResult<TaskReceipt<T>>>,
    ) {
        let (result_tx, receiver) = async_channel::bounded(1);
        let id = TaskId::new_v4();
        let task = TaskEntry {
            id,
            capacity: params.capacity.unwrap_or(DEFAULT_TASK_CAPACITY),
            priority: params.priority.unwrap_or(DEFAULT_TASK_PRIORITY),
            time_limit: None,
            reserved_capacity: 0.0,
            reserved_concurrent: 0,
            retry_attempt: 0,
            callback,
            params,
            result_tx: Some(result_tx),
            last_error: None,
            wait_timer: None,
            exec_timer: None,
            retry_timer: None,
        };
        match self.admit(task) {
            Ok(()) => {
                let _ = reply.try_send(Ok(TaskReceipt { id, receiver }));
            }
            Err((error, _task)) => {
                let _ = reply.try_send(Err(error));
            }
        }
    }

    /// Admission per the scheduling contract: the stopped check settles the
    /// task's channel; every other rejection is returned to the caller
    /// together with the task, so first admissions can surface it at the
    /// call site while retry re-admissions settle the channel instead.
    fn admit(&mut self, mut task: TaskEntry<T>) -> Result<(), (SchedulerError, TaskEntry<T>)> {
        if self.stopped {
            Self::settle_task(&mut task, Err(SchedulerError::Stopped));
            return Ok(());
        }

        if let Some(max) = self.opts.max_capacity {
            if task.capacity > max {
                match self.opts.task_exceeds_max_capacity_strategy {
                    TaskExceedsMaxCapacityStrategy::ThrowError => {
                        let error = SchedulerError::MaxCapacityExceeded {
                            capacity: task.capacity,
                            max_capacity: max,
                        };
                        return Err((error, task));
                    }
                    TaskExceedsMaxCapacityStrategy::WaitForFullCapacity => {
                        // The task needs everything there is; wait for it.
                        task.capacity = max;
                    }
                }
            }
        }

        if !task.capacity.is_finite() || task.capacity < 0.0 {
            let error = SchedulerError::InvalidArgument(
                "task capacity must be a non-negative number".into(),
            );
            return Err((error, task));
        }
        if task.priority > MAX_PRIORITY {
            let error =
                SchedulerError::InvalidArgument("task priority must be within 0..=9".into());
            return Err((error, task));
        }

        if let Some(max_queue) = self.opts.max_queue_size {
            if self.queue.len() >= max_queue {
                match self.opts.queue_size_exceeded_strategy {
                    QueueSizeExceededStrategy::ThrowError => {
                        return Err((SchedulerError::QueueSizeExceeded, task));
                    }
                    QueueSizeExceededStrategy::Replace => {
                        if let Some(victim) = self.by_time_added.peek_front() {
                            self.evict(victim);
                        }
                    }
                    QueueSizeExceededStrategy::ReplaceByPriority => match self.queue.peek_back() {
                        Some((victim, victim_priority)) if victim_priority > task.priority => {
                            self.evict(victim);
                        }
                        _ => return Err((SchedulerError::QueueSizeExceeded, task)),
                    },
                }
            }
        }

        let now = Instant::now();
        let id = task.id;
        if task.time_limit.is_none() {
            let limit = task
                .params
                .queue_waiting_limit
                .or(self.opts.queue_waiting_limit);
            if let Some(limit) = limit {
                task.time_limit = Some(now + limit);
            }
        }
        self.queue.insert_by_priority(id, task.priority);
        self.by_time_added.push_back(id);
        if let Some(limit) = task.time_limit {
            self.by_time_limit.insert((limit, id));
        }

        // Retry re-admissions are exempt from the waiting-timeout budget.
        if task.retry_attempt == 0 {
            let timeout = task
                .params
                .queue_waiting_timeout
                .or(self.opts.queue_waiting_timeout);
            if let Some(timeout) = timeout {
                let tx = self.cmd_tx.clone();
                task.wait_timer = Some(tokio::spawn(async move {
                    sleep(timeout).await;
                    let _ = tx.send(Command::QueueWaitTimedOut { id }).await;
                }));
            }
        }

        debug!(
            task = %id,
            capacity = task.capacity,
            priority = task.priority,
            attempt = task.retry_attempt,
            "task admitted"
        );
        self.tasks.insert(id, task);
        self.wake_rule_timers();
        self.run_scheduler_loop();
        Ok(())
    }

    fn evict(&mut self, id: TaskId) {
        self.remove_from_pending(id);
        if let Some(mut task) = self.tasks.remove(&id) {
            debug!(task = %id, "pending task evicted");
            Self::settle_task(&mut task, Err(SchedulerError::QueueSizeExceeded));
        }
        self.after_pending_removal();
    }

    // ----- the scheduler loop -----

    fn run_scheduler_loop(&mut self) {
        loop {
            if self.stopped && self.queue.is_empty() {
                self.check_stop_complete();
                return;
            }
            if !self.accountant.concurrency_available() {
                return;
            }
            let now = Instant::now();
            if let (Some(gap), Some(last)) = (self.opts.min_delay_between_tasks, self.last_dispatch)
            {
                let ready_at = last + gap;
                if now < ready_at {
                    self.arm_delay_timer(ready_at);
                    return;
                }
            }
            let Some(id) = self.select_next(now) else {
                return;
            };
            self.dispatch(id, now);
            if self.queue.is_empty() {
                // Nothing left to release capacity for; let the process go
                // idle instead of keeping rule timers armed.
                self.sleep_rule_timers();
                return;
            }
        }
    }

    /// Picks the next runnable task: an aged task holds the head and blocks
    /// everything else until it fits; otherwise the first fitting task in
    /// priority order wins.
    fn select_next(&self, now: Instant) -> Option<TaskId> {
        if let Some(&(limit, id)) = self.by_time_limit.iter().next() {
            if limit <= now {
                let capacity = self.tasks[&id].capacity;
                return if self.accountant.fits(capacity) {
                    Some(id)
                } else {
                    None
                };
            }
        }
        self.queue
            .iter()
            .find(|id| self.accountant.fits(self.tasks[id].capacity))
    }

    fn dispatch(&mut self, id: TaskId, now: Instant) {
        self.remove_from_pending(id);
        let Some(task) = self.tasks.get_mut(&id) else {
            return;
        };
        if let Some(timer) = task.wait_timer.take() {
            timer.abort();
        }
        let reserved = self.accountant.charge_dispatch(task.capacity);
        task.reserved_capacity = reserved;
        task.reserved_concurrent = 1;
        self.executing.insert(id);
        self.last_dispatch = Some(now);

        debug!(
            task = %id,
            capacity = task.capacity,
            used = self.accountant.used_capacity(),
            "task dispatched"
        );

        let future = (task.callback)();
        let tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            let result = future.await;
            let _ = tx.send(Command::TaskFinished { id, result }).await;
        });

        let timeout = task.params.execution_timeout.or(self.opts.execution_timeout);
        if let Some(timeout) = timeout {
            let tx = self.cmd_tx.clone();
            task.exec_timer = Some(tokio::spawn(async move {
                sleep(timeout).await;
                let _ = tx.send(Command::ExecutionTimedOut { id, timeout }).await;
            }));
        }
    }

    // ----- execution outcomes -----

    fn handle_task_finished(&mut self, id: TaskId, result: Result<T, BoxError>) {
        if !self.executing.remove(&id) {
            // Already timed out or rejected; the work ran to its natural
            // end but its result is disowned.
            trace!(task = %id, "late result discarded");
            return;
        }
        let Some(mut task) = self.tasks.remove(&id) else {
            return;
        };
        if let Some(timer) = task.exec_timer.take() {
            timer.abort();
        }
        self.accountant
            .release(task.reserved_capacity, task.reserved_concurrent);
        task.reserved_capacity = 0.0;
        task.reserved_concurrent = 0;

        match result {
            Ok(value) => {
                Self::settle_task(&mut task, Ok(value));
                self.check_stop_complete();
            }
            Err(error) => self.handle_failure(task, TaskError::from(error)),
        }
        self.run_scheduler_loop();
    }

    fn handle_execution_timed_out(&mut self, id: TaskId, timeout: Duration) {
        if !self.executing.remove(&id) {
            return;
        }
        let Some(mut task) = self.tasks.remove(&id) else {
            return;
        };
        task.exec_timer = None;
        self.accountant
            .release(task.reserved_capacity, task.reserved_concurrent);
        debug!(task = %id, ?timeout, "execution timed out; result disowned");
        Self::settle_task(&mut task, Err(SchedulerError::ExecutionTimeout(timeout)));
        self.check_stop_complete();
        self.run_scheduler_loop();
    }

    fn handle_queue_wait_timed_out(&mut self, id: TaskId) {
        if !self.queue.contains(id) {
            return;
        }
        self.remove_from_pending(id);
        if let Some(mut task) = self.tasks.remove(&id) {
            task.wait_timer = None;
            debug!(task = %id, "queue waiting timeout");
            Self::settle_task(&mut task, Err(SchedulerError::QueueTimeout));
        }
        self.after_pending_removal();
        self.run_scheduler_loop();
    }

    // ----- failure recovery -----

    fn handle_failure(&mut self, mut task: TaskEntry<T>, error: TaskError) {
        task.last_error = Some(error.clone());
        let strategy = task
            .params
            .fail_recovery
            .clone()
            .unwrap_or_else(|| self.opts.fail_recovery.clone());
        match strategy {
            FailRecovery::None => {
                Self::settle_task(&mut task, Err(SchedulerError::Failed(error)));
                self.check_stop_complete();
            }
            FailRecovery::Retry(retry_opts) => {
                let failed_attempt = task.retry_attempt + 1;
                if failed_attempt > retry_opts.retries {
                    Self::settle_task(&mut task, Err(SchedulerError::Failed(error)));
                    self.check_stop_complete();
                } else {
                    let delay = backoff_delay(&retry_opts, failed_attempt);
                    self.park_for_retry(task, delay);
                }
            }
            FailRecovery::Custom(hook) => {
                let id = task.id;
                let context = FailureContext {
                    error,
                    retry_attempt: task.retry_attempt + 1,
                };
                self.retrying.insert(id);
                self.tasks.insert(id, task);
                let tx = self.cmd_tx.clone();
                tokio::spawn(async move {
                    let decision = hook(context).await;
                    let _ = tx.send(Command::RetryDecision { id, decision }).await;
                });
            }
        }
    }

    fn park_for_retry(&mut self, mut task: TaskEntry<T>, delay: Duration) {
        let id = task.id;
        debug!(task = %id, ?delay, attempt = task.retry_attempt + 1, "retry scheduled");
        let tx = self.cmd_tx.clone();
        task.retry_timer = Some(tokio::spawn(async move {
            sleep(delay).await;
            let _ = tx.send(Command::RetryFired { id }).await;
        }));
        self.retrying.insert(id);
        self.tasks.insert(id, task);
    }

    fn handle_retry_fired(&mut self, id: TaskId) {
        if !self.retrying.remove(&id) {
            return;
        }
        let Some(mut task) = self.tasks.remove(&id) else {
            return;
        };
        task.retry_timer = None;
        task.retry_attempt += 1;
        if let Err((error, mut task)) = self.admit(task) {
            // No call site to report to on re-admission.
            Self::settle_task(&mut task, Err(error));
            self.check_stop_complete();
        }
    }

    fn handle_retry_decision(&mut self, id: TaskId, decision: Result<RetryDecision, BoxError>) {
        if !self.retrying.remove(&id) {
            return;
        }
        let Some(mut task) = self.tasks.remove(&id) else {
            return;
        };
        match decision {
            Ok(RetryDecision::Retry { after }) => self.park_for_retry(task, after),
            Ok(RetryDecision::Fail { error }) => {
                Self::settle_task(&mut task, Err(SchedulerError::Failed(TaskError::from(error))));
                self.check_stop_complete();
            }
            Err(hook_error) => {
                let cause = match task.last_error.clone() {
                    Some(error) => error,
                    None => TaskError::from(BoxError::from("task error unavailable")),
                };
                Self::settle_task(
                    &mut task,
                    Err(SchedulerError::OnFailure {
                        hook_error: TaskError::from(hook_error),
                        cause,
                    }),
                );
                self.check_stop_complete();
            }
        }
    }

    // ----- capacity surface -----

    fn handle_get_used_capacity(&mut self) -> f64 {
        if !self.rules_awake && !self.release.is_empty() {
            if self.release.catch_up(Instant::now(), &mut self.accountant) {
                self.run_scheduler_loop();
            }
        }
        self.accountant.used_capacity()
    }

    fn handle_set_used_capacity(&mut self, value: f64) -> SchedulerResult<()> {
        let Some(max) = self.accountant.max_capacity() else {
            return Err(SchedulerError::InvalidCall(
                "cannot set used capacity without max_capacity".into(),
            ));
        };
        if !value.is_finite() || value < 0.0 || value > max {
            return Err(SchedulerError::InvalidArgument(
                "used capacity must be within 0..=max_capacity".into(),
            ));
        }
        self.accountant.set_used(value);
        self.run_scheduler_loop();
        Ok(())
    }

    fn handle_adjust_used_capacity(&mut self, delta: f64) -> SchedulerResult<()> {
        if self.accountant.max_capacity().is_none() {
            return Err(SchedulerError::InvalidCall(
                "cannot adjust used capacity without max_capacity".into(),
            ));
        }
        if !delta.is_finite() {
            return Err(SchedulerError::InvalidArgument(
                "capacity delta must be a finite number".into(),
            ));
        }
        self.accountant.adjust(delta);
        self.run_scheduler_loop();
        Ok(())
    }

    // ----- reconfiguration and lifecycle -----

    fn handle_set_options(&mut self, options: SchedulerOptions) -> SchedulerResult<()> {
        options.validate()?;
        let now = Instant::now();
        self.accountant.reconfigure(
            options.max_capacity,
            options.max_concurrent,
            options.effective_capacity_strategy(),
        );
        self.release.set_rules(&options.release_rules, now);
        if self.rules_awake {
            for timer in self.rule_timers.drain(..) {
                timer.abort();
            }
            self.arm_rule_timers(now);
            self.rules_awake = !self.release.is_empty();
        }
        self.opts = options;
        debug!("scheduler reconfigured");
        Ok(())
    }

    fn handle_stop(&mut self, params: StopParams, reply: async_channel::Sender<()>) {
        let params = params.normalized();
        self.stopped = true;
        debug!(?params, "scheduler stopping");

        if params.stop_waiting_tasks {
            for id in self.queue.drain_in_order() {
                self.by_time_added.remove(id);
                if let Some(mut task) = self.tasks.remove(&id) {
                    if let Some(limit) = task.time_limit {
                        self.by_time_limit.remove(&(limit, id));
                    }
                    Self::settle_task(&mut task, Err(SchedulerError::Stopped));
                }
            }
            self.sleep_rule_timers();
        }
        if params.reject_executing_tasks {
            let ids: Vec<TaskId> = self.executing.drain().collect();
            for id in ids {
                if let Some(mut task) = self.tasks.remove(&id) {
                    self.accountant
                        .release(task.reserved_capacity, task.reserved_concurrent);
                    Self::settle_task(&mut task, Err(SchedulerError::Stopped));
                }
            }
        }
        if params.stop_task_retries {
            let ids: Vec<TaskId> = self.retrying.drain().collect();
            for id in ids {
                if let Some(mut task) = self.tasks.remove(&id) {
                    Self::settle_task(&mut task, Err(SchedulerError::Stopped));
                }
            }
        }

        self.stop_waiters.push(reply);
        self.check_stop_complete();
        self.run_scheduler_loop();
    }

    fn check_stop_complete(&mut self) {
        if self.stopped && self.tasks.is_empty() {
            self.sleep_rule_timers();
            if let Some(timer) = self.delay_timer.take() {
                timer.abort();
            }
            for waiter in self.stop_waiters.drain(..) {
                let _ = waiter.try_send(());
            }
        }
    }

    // ----- release-rule timers -----

    fn wake_rule_timers(&mut self) {
        if self.rules_awake || self.release.is_empty() {
            return;
        }
        let now = Instant::now();
        self.release.catch_up(now, &mut self.accountant);
        self.arm_rule_timers(now);
        self.rules_awake = true;
    }

    fn sleep_rule_timers(&mut self) {
        if !self.rules_awake {
            return;
        }
        for timer in self.rule_timers.drain(..) {
            timer.abort();
        }
        self.rule_epoch += 1;
        self.rules_awake = false;
    }

    fn arm_rule_timers(&mut self, now: Instant) {
        self.rule_epoch += 1;
        let epoch = self.rule_epoch;
        for timer in self.release.arm_schedule(now) {
            let tx = self.cmd_tx.clone();
            self.rule_timers.push(tokio::spawn(async move {
                sleep(timer.first_delay).await;
                loop {
                    let fired = Command::RuleFired {
                        index: timer.index,
                        epoch,
                    };
                    if tx.send(fired).await.is_err() {
                        return;
                    }
                    sleep(timer.interval).await;
                }
            }));
        }
    }

    fn handle_rule_fired(&mut self, index: usize, epoch: u64) {
        if !self.rules_awake || epoch != self.rule_epoch {
            return;
        }
        self.release
            .apply_fire(index, Instant::now(), &mut self.accountant);
        self.run_scheduler_loop();
    }

    // ----- shared plumbing -----

    fn arm_delay_timer(&mut self, ready_at: Instant) {
        if self.delay_timer.is_some() {
            return;
        }
        let tx = self.cmd_tx.clone();
        self.delay_timer = Some(tokio::spawn(async move {
            sleep_until(ready_at).await;
            let _ = tx.send(Command::DelayElapsed).await;
        }));
    }

    fn remove_from_pending(&mut self, id: TaskId) {
        self.queue.remove(id);
        self.by_time_added.remove(id);
        if let Some(task) = self.tasks.get(&id) {
            if let Some(limit) = task.time_limit {
                self.by_time_limit.remove(&(limit, id));
            }
        }
    }

    fn after_pending_removal(&mut self) {
        if self.queue.is_empty() {
            self.sleep_rule_timers();
        }
        self.check_stop_complete();
    }

    fn settle_task(task: &mut TaskEntry<T>, result: SchedulerResult<T>) {
        let timers = [
            task.wait_timer.take(),
            task.exec_timer.take(),
            task.retry_timer.take(),
        ];
        for timer in timers.into_iter().flatten() {
            timer.abort();
        }
        if let Some(tx) = task.result_tx.take() {
            let _ = tx.try_send(result);
        }
    }
}
