//! # 一次性托管任务
//!
//! ## 角色定位（Why）
//! - 把用户任务体包装为可交给底层执行器的工作：执行前施加上下文、发出监听器通知，执行后恢复上下文并落定状态；
//! - [`ManagedFuture`] 是调用方持有的结果句柄，负责取消与阻塞读取。
//!
//! ## 执行步骤（How）
//! 1. CAS `Submitted → Starting`；失败说明已被取消，直接返回（取消方已负责通知）；
//! 2. 施加上下文快照；失败则以 `Aborted` 结束且不运行任务体；
//! 3. 发出 `on_starting`，CAS `Starting → Started`，运行任务体；
//! 4. 无论成败都恢复上下文，第一个失败被记为任务失败，后续失败只记日志；
//! 5. 终态由状态机与底层句柄共同决定，取消优先；
//! 6. 发出 `on_aborted`（仅未正常完成时）与 `on_done`，每次尝试各一次。
//!
//! ## 契约（What）
//! - `get` 在执行线程上对尚未结束的自身调用时立即返回 `Interrupted`，避免自锁；
//! - `cancel` 幂等：只有第一次成功迁移到 `Cancelled` 的调用返回 `true`。

use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::context::ContextSnapshot;
use crate::error::{ConcurrencyError, ConcurrencyResult, Failure, TaskResult, catch};
use crate::executor::ExecutorCore;
use crate::interrupt;
use crate::listener::{Notifier, TaskControl, TaskEvent, TaskListener};
use crate::native::{DROPPED_UNRUN, Handoff, NativeFuture};
use crate::status::{HasNext, TaskState, TaskStatus};
use crate::time::deadline_after;

pub(crate) type Body<T> = Box<dyn FnOnce() -> TaskResult<T> + Send + 'static>;

pub(crate) struct SubmittedTask<T> {
    status: TaskStatus<T>,
    body: Mutex<Option<Body<T>>>,
    context: ContextSnapshot,
    listener: Option<Arc<dyn TaskListener>>,
    executor: Arc<str>,
    native: OnceLock<Arc<dyn NativeFuture>>,
}

impl<T: Send + 'static> SubmittedTask<T> {
    /// 提交到底层执行器。拒绝（含监听器在提交阶段取消或失败）以 `Rejected` 同步返回。
    pub(crate) fn submit(
        core: &ExecutorCore,
        body: Body<T>,
        listener: Option<Arc<dyn TaskListener>>,
        context: ContextSnapshot,
    ) -> ConcurrencyResult<ManagedFuture<T>> {
        let mut policy = core.config.queue_policy();
        policy.long_running |= context.properties().is_long_running();

        let task = Arc::new(SubmittedTask {
            status: TaskStatus::new(),
            body: Mutex::new(Some(body)),
            context,
            listener,
            executor: Arc::clone(&core.name),
            native: OnceLock::new(),
        });
        task.status.transition(TaskState::None, TaskState::Submitted);

        let listener_failure = {
            let _window = task.status.enter_runner();
            task.notifier().submitted()
        };
        if let Some(failure) = listener_failure {
            task.abort_submission(ConcurrencyError::Aborted(failure.clone()));
            return Err(ConcurrencyError::rejected(
                "task listener failed during submission",
                Some(failure),
            ));
        }
        if task.status.state() == TaskState::Cancelled {
            return Err(ConcurrencyError::rejected(
                "task cancelled during submission",
                None,
            ));
        }

        let handoff = Handoff::new();
        let runner = Arc::clone(&task);
        let orphan = Arc::clone(&task);
        let work = handoff.wrap(move || runner.run(), move || orphan.abort_dropped());
        match core.native.submit(work, policy) {
            Ok(native) => {
                let _ = task.native.set(Arc::clone(&native));
                if !handoff.accept() {
                    let error = ConcurrencyError::rejected(DROPPED_UNRUN, None);
                    warn!(
                        executor = %task.executor,
                        identity = %task.identity(),
                        "underlying executor dropped the task during submission"
                    );
                    task.abort_submission(error.clone());
                    return Err(error);
                }
                if task.status.state() == TaskState::Cancelled {
                    native.cancel(false);
                }
                debug!(
                    executor = %task.executor,
                    identity = %task.identity(),
                    "task submitted"
                );
                Ok(ManagedFuture { task })
            }
            Err(failure) => {
                handoff.reject();
                let error = ConcurrencyError::rejected(
                    "underlying executor rejected the task",
                    Some(failure),
                );
                warn!(
                    executor = %task.executor,
                    identity = %task.identity(),
                    error = %error,
                    "task submission rejected"
                );
                task.abort_submission(error.clone());
                Err(error)
            }
        }
    }

    /// 已被接受的工作未运行就被底层执行器丢弃。
    fn abort_dropped(&self) {
        if self.status.state() != TaskState::Submitted {
            return;
        }
        warn!(
            executor = %self.executor,
            identity = %self.identity(),
            "underlying executor dropped the task without running it"
        );
        self.abort_submission(ConcurrencyError::rejected(DROPPED_UNRUN, None));
    }

    fn abort_submission(&self, error: ConcurrencyError) {
        if self.status.finish(
            TaskState::Submitted,
            TaskState::Aborted,
            Err(error.clone()),
            HasNext::No,
        ) && self.status.claim_notification()
        {
            self.notifier().terminal(Some(&error), true);
        }
    }

    fn run(self: Arc<Self>) {
        if !self.status.transition(TaskState::Submitted, TaskState::Starting) {
            trace!(identity = %self.identity(), "task cancelled before it started");
            return;
        }
        let _runner = self.status.enter_runner();
        let _interrupt = interrupt::enter(self.status.interrupt_flag());
        let notifier = self.notifier();

        let mut value: Option<T> = None;
        let mut failure: Option<ConcurrencyError> = None;
        match self.context.apply() {
            Err(apply_failure) => failure = Some(ConcurrencyError::Aborted(apply_failure)),
            Ok(applied) => {
                if let Some(listener_failure) = notifier.starting() {
                    failure = Some(ConcurrencyError::Aborted(listener_failure));
                } else if self.status.transition(TaskState::Starting, TaskState::Started) {
                    let body = self.body.lock().take();
                    match body.map(|body| catch(body)) {
                        Some(Ok(result)) => value = Some(result),
                        Some(Err(body_failure)) => {
                            failure = Some(ConcurrencyError::Execution(body_failure))
                        }
                        None => {
                            failure = Some(ConcurrencyError::Execution(Failure::msg(
                                "task body was already consumed",
                            )))
                        }
                    }
                }
                if let Err(restore_failure) = applied.restore() {
                    if failure.is_none() {
                        value = None;
                        failure = Some(ConcurrencyError::Execution(restore_failure));
                    }
                }
            }
        }

        let native_cancelled = self.native.get().is_some_and(|native| native.is_cancelled());
        let (from, to) = if self.status.state() == TaskState::Started {
            (TaskState::Started, TaskState::Done)
        } else {
            (TaskState::Starting, TaskState::Aborted)
        };
        let error = failure.clone();
        let outcome = match (failure, value) {
            (Some(error), _) => Err(error),
            (None, Some(value)) => Ok(value),
            (None, None) => Err(ConcurrencyError::Cancelled),
        };
        if native_cancelled || !self.status.finish(from, to, outcome, HasNext::No) {
            let _ = self.status.cancel(false);
        }

        let final_state = self.status.state();
        match (&final_state, &error) {
            (TaskState::Done, None) => debug!(identity = %self.identity(), "task completed"),
            (TaskState::Cancelled, _) => debug!(identity = %self.identity(), "task cancelled"),
            (_, Some(error)) => warn!(
                identity = %self.identity(),
                state = ?final_state,
                code = error.code(),
                error = %error,
                "task did not complete successfully"
            ),
            _ => {}
        }

        if self.status.claim_notification() {
            match final_state {
                TaskState::Cancelled => {
                    notifier.terminal(Some(&ConcurrencyError::Cancelled), true)
                }
                TaskState::Aborted => notifier.terminal(error.as_ref(), true),
                _ => notifier.terminal(error.as_ref(), false),
            }
        }
    }
}

impl<T> SubmittedTask<T> {
    fn identity(&self) -> &str {
        self.context.identity_name()
    }

    fn notifier(&self) -> Notifier<'_>
    where
        T: Send + 'static,
    {
        Notifier::new(
            self.listener.as_ref(),
            TaskEvent {
                control: self,
                executor: &self.executor,
                identity: self.identity(),
                attempt: 1,
            },
        )
    }
}

impl<T: Send + 'static> TaskControl for SubmittedTask<T> {
    fn cancel(&self, interrupt: bool) -> bool {
        match self.status.cancel(interrupt) {
            Ok(previous) => {
                if let Some(native) = self.native.get() {
                    native.cancel(interrupt);
                }
                debug!(
                    identity = %self.identity(),
                    previous = ?previous,
                    interrupt,
                    "task cancel requested"
                );
                if !previous.is_running() && self.status.claim_notification() {
                    self.notifier()
                        .terminal(Some(&ConcurrencyError::Cancelled), true);
                }
                true
            }
            Err(_) => false,
        }
    }

    fn is_cancelled(&self) -> bool {
        self.status.state() == TaskState::Cancelled
    }

    fn is_done(&self) -> bool {
        self.status.state().is_terminal()
    }
}

/// 一次性托管任务的结果句柄。
pub struct ManagedFuture<T> {
    task: Arc<SubmittedTask<T>>,
}

impl<T> Clone for ManagedFuture<T> {
    fn clone(&self) -> Self {
        Self {
            task: Arc::clone(&self.task),
        }
    }
}

impl<T: Send + 'static> ManagedFuture<T> {
    /// 取消任务；`interrupt` 为真时同时打断正在运行的任务体。
    pub fn cancel(&self, interrupt: bool) -> bool {
        TaskControl::cancel(self.task.as_ref(), interrupt)
    }

    pub fn is_cancelled(&self) -> bool {
        TaskControl::is_cancelled(self.task.as_ref())
    }

    pub fn is_done(&self) -> bool {
        TaskControl::is_done(self.task.as_ref())
    }

    pub fn state(&self) -> TaskState {
        self.task.status.state()
    }

    pub fn identity(&self) -> &str {
        self.task.identity()
    }

    /// 阻塞直到任务结束。
    pub fn get(&self) -> ConcurrencyResult<T>
    where
        T: Clone,
    {
        self.wait(None, Duration::ZERO)
    }

    /// 带超时的阻塞读取。
    pub fn get_timeout(&self, timeout: Duration) -> ConcurrencyResult<T>
    where
        T: Clone,
    {
        self.wait(deadline_after(timeout), timeout)
    }

    fn wait(&self, deadline: Option<Instant>, timeout: Duration) -> ConcurrencyResult<T>
    where
        T: Clone,
    {
        let status = &self.task.status;
        if !status.state().is_terminal() && status.is_runner_current() {
            return Err(ConcurrencyError::Interrupted(
                "get() called from the thread that is running the task".into(),
            ));
        }
        if !status.await_terminal(deadline) {
            return Err(ConcurrencyError::Timeout(timeout));
        }
        status.result()
    }
}

impl<T: Send + 'static> TaskControl for ManagedFuture<T> {
    fn cancel(&self, interrupt: bool) -> bool {
        ManagedFuture::cancel(self, interrupt)
    }

    fn is_cancelled(&self) -> bool {
        ManagedFuture::is_cancelled(self)
    }

    fn is_done(&self) -> bool {
        ManagedFuture::is_done(self)
    }
}

impl<T> fmt::Debug for ManagedFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedFuture")
            .field("identity", &self.task.identity())
            .field("state", &self.task.status.state())
            .finish()
    }
}
