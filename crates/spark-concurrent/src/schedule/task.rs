//! 周期任务的运行时：尝试链、重新调度与取消竞争。

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use arc_swap::ArcSwap;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

use crate::context::ContextSnapshot;
use crate::error::{ConcurrencyError, ConcurrencyResult, Failure, TaskResult, catch};
use crate::executor::ExecutorCore;
use crate::interrupt;
use crate::listener::{Notifier, TaskControl, TaskEvent, TaskListener};
use crate::native::{DROPPED_UNRUN, Handoff, NativeFuture};
use crate::status::{HasNext, TaskState, TaskStatus};
use crate::time::deadline_after;

use super::Schedule;
use super::rate::RateCursor;
use super::trigger::LastExecution;

pub(crate) type RepeatBody<T> = Box<dyn Fn() -> TaskResult<T> + Send + Sync + 'static>;

/// 单次尝试。
struct Attempt<T> {
    number: u64,
    status: TaskStatus<Option<T>>,
    native: OnceLock<Arc<dyn NativeFuture>>,
    due: Instant,
    scheduled_for: SystemTime,
}

impl<T> Attempt<T> {
    fn new(number: u64, due: Instant, scheduled_for: SystemTime) -> Self {
        Self {
            number,
            status: TaskStatus::new(),
            native: OnceLock::new(),
            due,
            scheduled_for,
        }
    }
}

/// 下一次尝试的计划。
#[derive(Clone, Copy, Debug)]
struct NextRun {
    delay: Duration,
    due: Instant,
    scheduled_for: SystemTime,
}

impl NextRun {
    /// 从 `now`/`wall` 起算 `delay`；任一时间点超出可表示范围时返回 `None`。
    fn after(now: Instant, wall: SystemTime, delay: Duration) -> Option<Self> {
        Some(Self {
            delay,
            due: now.checked_add(delay)?,
            scheduled_for: wall.checked_add(delay)?,
        })
    }
}

fn out_of_range(what: &str) -> ConcurrencyError {
    ConcurrencyError::configuration(format!("{what} exceeds the representable time range"))
}

/// 尝试链的推进信号：安装新尝试、落定 `HasNext` 或取消时递增代数。
#[derive(Default)]
struct Progress {
    generation: Mutex<u64>,
    cond: Condvar,
}

impl Progress {
    fn generation(&self) -> u64 {
        *self.generation.lock()
    }

    fn bump(&self) {
        let mut generation = self.generation.lock();
        *generation = generation.wrapping_add(1);
        self.cond.notify_all();
    }

    /// 等待代数离开 `observed`；到达截止时间仍未变化时返回 `false`。
    fn wait_past(&self, observed: u64, deadline: Option<Instant>) -> bool {
        let mut generation = self.generation.lock();
        while *generation == observed {
            match deadline {
                None => self.cond.wait(&mut generation),
                Some(deadline) => {
                    if self.cond.wait_until(&mut generation, deadline).timed_out() {
                        return *generation != observed;
                    }
                }
            }
        }
        true
    }
}

pub(crate) struct ScheduledTask<T> {
    body: RepeatBody<T>,
    context: ContextSnapshot,
    listener: Option<Arc<dyn TaskListener>>,
    core: Arc<ExecutorCore>,
    schedule: Schedule,
    created: SystemTime,
    current: ArcSwap<Attempt<T>>,
    rate: Option<Mutex<RateCursor>>,
    last_execution: Mutex<Option<LastExecution>>,
    progress: Progress,
    cancel_requested: AtomicBool,
    started: AtomicU64,
}

impl<T> ScheduledTask<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// 创建调度并提交第一次尝试。
    ///
    /// 校验失败或首次计划时间超出可表示范围返回 `Configuration`，首次提交被拒返回 `Rejected`。
    pub(crate) fn start(
        core: Arc<ExecutorCore>,
        body: RepeatBody<T>,
        listener: Option<Arc<dyn TaskListener>>,
        context: ContextSnapshot,
        schedule: Schedule,
    ) -> ConcurrencyResult<ManagedScheduledFuture<T>> {
        schedule.validate()?;
        let now = core.clock.now();
        let created = core.clock.wall_now();

        let mut rate = None;
        let first = match &schedule {
            Schedule::Once { delay } | Schedule::FixedDelay { initial: delay, .. } => Some(
                NextRun::after(now, created, *delay).ok_or_else(|| out_of_range("initial delay"))?,
            ),
            Schedule::FixedRate { initial, period } => {
                let cursor = RateCursor::new(now, *initial, *period)
                    .ok_or_else(|| out_of_range("initial delay"))?;
                let scheduled_for = created
                    .checked_add(*initial)
                    .ok_or_else(|| out_of_range("initial delay"))?;
                rate = Some(Mutex::new(cursor));
                Some(NextRun {
                    delay: *initial,
                    due: cursor.first(),
                    scheduled_for,
                })
            }
            Schedule::Triggered(trigger) => {
                let first = catch(|| Ok(trigger.next_run_time(None, created))).map_err(|failure| {
                    ConcurrencyError::rejected(
                        "trigger failed to compute the first run time",
                        Some(failure),
                    )
                })?;
                match first {
                    Some(at) => {
                        let delay = at.duration_since(created).unwrap_or(Duration::ZERO);
                        let due = now
                            .checked_add(delay)
                            .ok_or_else(|| out_of_range("trigger run time"))?;
                        Some(NextRun {
                            delay,
                            due,
                            scheduled_for: at,
                        })
                    }
                    None => None,
                }
            }
        };

        let attempt = Arc::new(Attempt::new(
            1,
            first.map_or(now, |next| next.due),
            first.map_or(created, |next| next.scheduled_for),
        ));
        let task = Arc::new(ScheduledTask {
            body,
            context,
            listener,
            core,
            schedule,
            created,
            current: ArcSwap::new(Arc::clone(&attempt)),
            rate,
            last_execution: Mutex::new(None),
            progress: Progress::default(),
            cancel_requested: AtomicBool::new(false),
            started: AtomicU64::new(0),
        });

        let Some(first) = first else {
            debug!(identity = %task.identity(), "trigger produced no run time; schedule is complete");
            attempt
                .status
                .finish(TaskState::None, TaskState::Done, Ok(None), HasNext::No);
            return Ok(ManagedScheduledFuture { task });
        };

        if let Some(failure) = task.submit_attempt(&attempt) {
            task.abort_attempt(&attempt, ConcurrencyError::Aborted(failure.clone()));
            return Err(ConcurrencyError::rejected(
                "task listener failed during submission",
                Some(failure),
            ));
        }
        if attempt.status.state() == TaskState::Cancelled {
            return Err(ConcurrencyError::rejected(
                "task cancelled during submission",
                None,
            ));
        }
        task.dispatch(&attempt, first.delay)?;
        debug!(
            executor = %task.core.name,
            identity = %task.identity(),
            schedule = ?task.schedule,
            repeating = task.schedule.is_repeating(),
            delay_ms = first.delay.as_millis() as u64,
            "scheduled task submitted"
        );
        Ok(ManagedScheduledFuture { task })
    }

    fn submit_attempt(&self, attempt: &Arc<Attempt<T>>) -> Option<Failure> {
        attempt
            .status
            .transition(TaskState::None, TaskState::Submitted);
        let _window = attempt.status.enter_runner();
        self.notifier(attempt).submitted()
    }

    fn dispatch(self: &Arc<Self>, attempt: &Arc<Attempt<T>>, delay: Duration) -> ConcurrencyResult<()> {
        let handoff = Handoff::new();
        let (task, runner) = (Arc::clone(self), Arc::clone(attempt));
        let (orphan_task, orphan) = (Arc::clone(self), Arc::clone(attempt));
        let work = handoff.wrap(
            move || task.run_attempt(runner),
            move || orphan_task.abort_dropped(&orphan),
        );
        match self.core.native.schedule(work, delay) {
            Ok(native) => {
                let _ = attempt.native.set(Arc::clone(&native));
                if !handoff.accept() {
                    let error = ConcurrencyError::rejected(DROPPED_UNRUN, None);
                    warn!(
                        identity = %self.identity(),
                        attempt = attempt.number,
                        "underlying executor dropped the scheduled task during submission"
                    );
                    self.abort_attempt(attempt, error.clone());
                    return Err(error);
                }
                if attempt.status.state() == TaskState::Cancelled {
                    native.cancel(false);
                }
                Ok(())
            }
            Err(failure) => {
                handoff.reject();
                let error = ConcurrencyError::rejected(
                    "underlying executor rejected the scheduled task",
                    Some(failure),
                );
                warn!(
                    identity = %self.identity(),
                    attempt = attempt.number,
                    error = %error,
                    "scheduling rejected"
                );
                self.abort_attempt(attempt, error.clone());
                Err(error)
            }
        }
    }

    /// 已被接受的尝试未运行就被底层执行器丢弃，调度随之结束。
    fn abort_dropped(&self, attempt: &Attempt<T>) {
        if attempt.status.state() != TaskState::Submitted {
            return;
        }
        warn!(
            identity = %self.identity(),
            attempt = attempt.number,
            "underlying executor dropped the scheduled task without running it; schedule ends"
        );
        self.abort_attempt(attempt, ConcurrencyError::rejected(DROPPED_UNRUN, None));
    }

    fn abort_attempt(&self, attempt: &Attempt<T>, error: ConcurrencyError) {
        if attempt.status.finish(
            TaskState::Submitted,
            TaskState::Aborted,
            Err(error.clone()),
            HasNext::No,
        ) {
            self.progress.bump();
            if attempt.status.claim_notification() {
                self.notifier(attempt).terminal(Some(&error), true);
            }
        }
    }

    fn run_attempt(self: Arc<Self>, attempt: Arc<Attempt<T>>) {
        if !attempt
            .status
            .transition(TaskState::Submitted, TaskState::Starting)
        {
            trace!(identity = %self.identity(), attempt = attempt.number, "attempt cancelled before it started");
            return;
        }
        self.started.fetch_add(1, Ordering::AcqRel);
        let _runner = attempt.status.enter_runner();
        let _interrupt = interrupt::enter(attempt.status.interrupt_flag());
        let notifier = self.notifier(&attempt);

        let mut ran: Option<TaskResult<T>> = None;
        let mut failure: Option<ConcurrencyError> = None;
        match self.context.apply() {
            Err(apply_failure) => failure = Some(ConcurrencyError::Aborted(apply_failure)),
            Ok(applied) => {
                if let Some(cause) = self.evaluate_skip(&attempt) {
                    failure = Some(ConcurrencyError::Skipped(cause));
                } else if let Some(listener_failure) = notifier.starting() {
                    failure = Some(ConcurrencyError::Aborted(listener_failure));
                } else if attempt
                    .status
                    .transition(TaskState::Starting, TaskState::Started)
                {
                    ran = Some(self.run_body(&attempt));
                }
                if let Err(restore_failure) = applied.restore() {
                    if failure.is_none() && matches!(ran, Some(Ok(_))) {
                        ran = Some(Err(restore_failure));
                    }
                }
            }
        }

        let (from, to, outcome) = match (failure, ran) {
            (Some(error @ ConcurrencyError::Skipped(_)), _) => {
                (TaskState::Starting, TaskState::Skipped, Err(error))
            }
            (Some(error), _) => (TaskState::Starting, TaskState::Aborted, Err(error)),
            (None, Some(Ok(value))) => (TaskState::Started, TaskState::Done, Ok(Some(value))),
            (None, Some(Err(body_failure))) => (
                TaskState::Started,
                TaskState::Done,
                Err(ConcurrencyError::Execution(body_failure)),
            ),
            (None, None) => (TaskState::Started, TaskState::Done, Err(ConcurrencyError::Cancelled)),
        };

        let mut next = None;
        let mut outcome = outcome;
        if to != TaskState::Aborted && attempt.status.state() != TaskState::Cancelled {
            match catch(|| self.next_run()) {
                Ok(planned) => next = planned,
                Err(next_failure) => {
                    warn!(identity = %self.identity(), error = %next_failure, "failed to compute next run; schedule ends");
                    if outcome.is_ok() {
                        outcome = Err(ConcurrencyError::Execution(next_failure));
                    }
                }
            }
        }

        let error = outcome.as_ref().err().cloned();
        let has_next = if next.is_some() { HasNext::Yes } else { HasNext::No };
        let native_cancelled = attempt
            .native
            .get()
            .is_some_and(|native| native.is_cancelled());
        let finished = !native_cancelled && attempt.status.finish(from, to, outcome, has_next);
        if !finished {
            let _ = attempt.status.cancel(false);
        }
        self.progress.bump();

        let final_state = attempt.status.state();
        match (&final_state, &error) {
            (TaskState::Done, None) => {
                debug!(identity = %self.identity(), attempt = attempt.number, has_next = ?has_next, "attempt completed")
            }
            (TaskState::Cancelled, _) => {
                debug!(identity = %self.identity(), attempt = attempt.number, "attempt cancelled")
            }
            (TaskState::Skipped, _) => {
                debug!(identity = %self.identity(), attempt = attempt.number, "attempt skipped by trigger")
            }
            (_, Some(error)) => warn!(
                identity = %self.identity(),
                attempt = attempt.number,
                state = ?final_state,
                code = error.code(),
                error = %error,
                "attempt did not complete successfully"
            ),
            _ => {}
        }

        if attempt.status.claim_notification() {
            match final_state {
                TaskState::Cancelled => {
                    notifier.terminal(Some(&ConcurrencyError::Cancelled), true)
                }
                TaskState::Aborted | TaskState::Skipped => notifier.terminal(error.as_ref(), true),
                _ => notifier.terminal(error.as_ref(), false),
            }
        }

        if let (true, Some(next)) = (finished, next) {
            self.reschedule(&attempt, next);
        }
    }

    fn run_body(&self, attempt: &Attempt<T>) -> TaskResult<T> {
        let run_start = self.core.clock.wall_now();
        let result = catch(|| (self.body)());
        if let Schedule::Triggered(_) = self.schedule {
            let run_end = self.core.clock.wall_now();
            let value = result
                .as_ref()
                .ok()
                .map(|value| Arc::new(value.clone()) as Arc<dyn std::any::Any + Send + Sync>);
            *self.last_execution.lock() = Some(LastExecution::new(
                Arc::from(self.identity()),
                attempt.scheduled_for,
                run_start,
                run_end,
                value,
            ));
        }
        result
    }

    /// 触发器判定本次是否跳过：`Some(None)` 跳过，`Some(Some(failure))` 因触发器失败而跳过。
    fn evaluate_skip(&self, attempt: &Attempt<T>) -> Option<Option<Failure>> {
        let Schedule::Triggered(trigger) = &self.schedule else {
            return None;
        };
        let last = self.last_execution.lock().clone();
        match catch(|| trigger.skip_run(last.as_ref(), attempt.scheduled_for)) {
            Ok(false) => None,
            Ok(true) => Some(None),
            Err(failure) => Some(Some(failure)),
        }
    }

    /// 计算下一次尝试；时间点超出可表示范围视为失败，调度随之结束。
    fn next_run(&self) -> TaskResult<Option<NextRun>> {
        let now = self.core.clock.now();
        let wall = self.core.clock.wall_now();
        let unrepresentable = || Failure::msg("next run time exceeds the representable time range");
        let next = match &self.schedule {
            Schedule::Once { .. } => None,
            Schedule::FixedDelay { delay, .. } => {
                Some(NextRun::after(now, wall, *delay).ok_or_else(unrepresentable)?)
            }
            Schedule::FixedRate { .. } => match &self.rate {
                Some(cursor) => {
                    let due = cursor.lock().advance(now).ok_or_else(unrepresentable)?;
                    let delay = due.saturating_duration_since(now);
                    let scheduled_for = wall.checked_add(delay).ok_or_else(unrepresentable)?;
                    Some(NextRun {
                        delay,
                        due,
                        scheduled_for,
                    })
                }
                None => None,
            },
            Schedule::Triggered(trigger) => {
                let last = self.last_execution.lock().clone();
                match catch(|| Ok(trigger.next_run_time(last.as_ref(), self.created)))? {
                    Some(at) => {
                        let delay = at.duration_since(wall).unwrap_or(Duration::ZERO);
                        Some(NextRun {
                            delay,
                            due: now.checked_add(delay).ok_or_else(unrepresentable)?,
                            scheduled_for: at,
                        })
                    }
                    None => None,
                }
            }
        };
        Ok(next)
    }

    /// 安装并提交下一次尝试。调用时上一次尝试已落定为 `HasNext::Yes`。
    fn reschedule(self: &Arc<Self>, previous: &Attempt<T>, next: NextRun) {
        let attempt = Arc::new(Attempt::new(
            previous.number + 1,
            next.due,
            next.scheduled_for,
        ));
        let listener_failure = self.submit_attempt(&attempt);
        self.current.store(Arc::clone(&attempt));
        self.progress.bump();

        if let Some(failure) = listener_failure {
            self.abort_attempt(&attempt, ConcurrencyError::Aborted(failure));
            return;
        }
        if self.cancel_requested.load(Ordering::SeqCst) {
            let _ = self.cancel_attempt(&attempt, false);
            return;
        }
        if self.dispatch(&attempt, next.delay).is_err() {
            return;
        }
        trace!(
            identity = %self.identity(),
            attempt = attempt.number,
            delay_ms = next.delay.as_millis() as u64,
            "next attempt scheduled"
        );
        if self.cancel_requested.load(Ordering::SeqCst) {
            let _ = self.cancel_attempt(&attempt, false);
        }
    }
}

impl<T> ScheduledTask<T> {
    fn identity(&self) -> &str {
        self.context.identity_name()
    }
}

impl<T> ScheduledTask<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn notifier<'a>(&'a self, attempt: &Attempt<T>) -> Notifier<'a> {
        Notifier::new(
            self.listener.as_ref(),
            TaskEvent {
                control: self,
                executor: &self.core.name,
                identity: self.identity(),
                attempt: attempt.number,
            },
        )
    }

    fn cancel_attempt(&self, attempt: &Attempt<T>, interrupt: bool) -> Result<TaskState, TaskState> {
        let previous = attempt.status.cancel(interrupt)?;
        if let Some(native) = attempt.native.get() {
            native.cancel(interrupt);
        }
        self.progress.bump();
        if !previous.is_running() && attempt.status.claim_notification() {
            self.notifier(attempt)
                .terminal(Some(&ConcurrencyError::Cancelled), true);
        }
        Ok(previous)
    }
}

impl<T> TaskControl for ScheduledTask<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn cancel(&self, interrupt: bool) -> bool {
        self.cancel_requested.store(true, Ordering::SeqCst);
        for _ in 0..self.core.config.cancel_retry_limit {
            let attempt = self.current.load_full();
            match self.cancel_attempt(&attempt, interrupt) {
                Ok(previous) => {
                    debug!(
                        identity = %self.identity(),
                        attempt = attempt.number,
                        previous = ?previous,
                        interrupt,
                        "scheduled task cancelled"
                    );
                    return true;
                }
                Err(TaskState::Cancelled) => return false,
                Err(_) => match attempt.status.has_next() {
                    HasNext::No => return false,
                    _ if attempt.status.is_runner_current() => return true,
                    _ => {
                        if Arc::ptr_eq(&*self.current.load(), &attempt) {
                            thread::yield_now();
                        }
                    }
                },
            }
        }
        debug!(
            identity = %self.identity(),
            "cancel retry limit reached; the rescheduler will cancel the next attempt"
        );
        true
    }

    fn is_cancelled(&self) -> bool {
        self.current.load().status.state() == TaskState::Cancelled
    }

    fn is_done(&self) -> bool {
        let attempt = self.current.load();
        let state = attempt.status.state();
        state == TaskState::Cancelled
            || (state.is_terminal() && attempt.status.has_next() == HasNext::No)
    }
}

/// 周期任务的结果句柄。
///
/// `get` 等待整个调度结束：返回最后一次尝试的结果，触发器从未运行任务体时返回 `Ok(None)`。
pub struct ManagedScheduledFuture<T> {
    task: Arc<ScheduledTask<T>>,
}

impl<T> Clone for ManagedScheduledFuture<T> {
    fn clone(&self) -> Self {
        Self {
            task: Arc::clone(&self.task),
        }
    }
}

impl<T> ManagedScheduledFuture<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn cancel(&self, interrupt: bool) -> bool {
        TaskControl::cancel(self.task.as_ref(), interrupt)
    }

    pub fn is_cancelled(&self) -> bool {
        TaskControl::is_cancelled(self.task.as_ref())
    }

    pub fn is_done(&self) -> bool {
        TaskControl::is_done(self.task.as_ref())
    }

    /// 当前尝试的状态。
    pub fn state(&self) -> TaskState {
        self.task.current.load().status.state()
    }

    pub fn identity(&self) -> &str {
        self.task.identity()
    }

    /// 已开始执行的尝试次数（含被跳过与被中止的尝试）。
    pub fn attempts(&self) -> u64 {
        self.task.started.load(Ordering::Acquire)
    }

    /// 距离当前尝试计划时间的剩余时长。
    pub fn delay(&self) -> Duration {
        let due = self.task.current.load().due;
        due.saturating_duration_since(self.task.core.clock.now())
    }

    pub fn get(&self) -> ConcurrencyResult<Option<T>> {
        self.wait(None, Duration::ZERO)
    }

    pub fn get_timeout(&self, timeout: Duration) -> ConcurrencyResult<Option<T>> {
        self.wait(deadline_after(timeout), timeout)
    }

    fn wait(&self, deadline: Option<Instant>, timeout: Duration) -> ConcurrencyResult<Option<T>> {
        loop {
            let generation = self.task.progress.generation();
            let attempt = self.task.current.load_full();
            let state = attempt.status.state();
            if state == TaskState::Cancelled
                || (state.is_terminal() && attempt.status.has_next() == HasNext::No)
            {
                return attempt.status.result();
            }
            if attempt.status.is_runner_current() {
                return Err(ConcurrencyError::Interrupted(
                    "get() called from the thread that is running the scheduled task".into(),
                ));
            }
            let progressed = if state.is_terminal() {
                self.task.progress.wait_past(generation, deadline)
            } else {
                attempt.status.await_terminal(deadline)
            };
            if !progressed {
                return Err(ConcurrencyError::Timeout(timeout));
            }
        }
    }
}

impl<T> fmt::Debug for ManagedScheduledFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let attempt = self.task.current.load();
        f.debug_struct("ManagedScheduledFuture")
            .field("identity", &self.task.identity())
            .field("schedule", &self.task.schedule)
            .field("attempt", &attempt.number)
            .field("state", &attempt.status.state())
            .finish()
    }
}
