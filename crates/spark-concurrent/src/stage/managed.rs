//! `ManagedStage`：完成控制、观察与依赖动作的派发机制。

use std::any::type_name;
use std::fmt;
use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::context::ContextSnapshot;
use crate::error::{ConcurrencyError, ConcurrencyResult, Failure, TaskResult, catch};
use crate::native::{DROPPED_UNRUN, Handoff};
use crate::time::deadline_after;

use super::action::{StageAction, StageExecutor};
use super::slot::{Claim, Job, Outcome, StageCore};

/// 依赖动作运行在哪里。
#[derive(Clone)]
pub(crate) enum Mode {
    /// 在完成源阶段的线程上（或注册时源阶段已完成则在注册线程上）运行。
    Sync,
    /// 提交给执行器运行。
    Async(StageExecutor),
}

/// 源阶段完成后依赖阶段要做的事。
pub(crate) enum Reaction<U> {
    /// 不运行用户动作，直接以该结果完成（例如传播源阶段的失败）。
    Settle(Outcome<U>),
    /// 在上下文中运行用户动作，由动作自己完成目标阶段。
    Run(Box<dyn FnOnce(&ManagedStage<U>) + Send + 'static>),
}

impl<U: Clone + Send + 'static> Reaction<U> {
    /// 运行 `produce` 并以其返回值完成目标阶段。
    pub(crate) fn produce(produce: impl FnOnce() -> U + Send + 'static) -> Self {
        Reaction::Run(Box::new(move |target: &ManagedStage<U>| {
            let value = produce();
            target.core.settle(Ok(value));
        }))
    }
}

/// 上下文感知的 CompletionStage。
///
/// # 教案式说明
/// - **意图 (Why)**：依赖动作可能在任意线程上运行，它们应当看到的是"注册动作时"的线程上下文，
///   而不是碰巧执行它的线程的上下文。
/// - **契约 (What)**：
///   - 每个阶段都有默认执行器，`*_async` 变体使用它，派生出的阶段继承它；
///   - 上下文捕获规则：默认执行器是托管执行器时由它捕获；否则若显式执行器是托管执行器则由后者捕获；
///     两者都不是时不捕获；
///   - 外部完成（`complete`/`cancel`/`obtrude_*`）会尽力取消仍在途的异步动作；
///   - `join` 会在当前线程内联运行尚未被工作线程领取的异步动作。
/// - **实现提示 (How)**：结果与依赖回调保存在共享内核中，句柄本身可廉价克隆。
pub struct ManagedStage<T> {
    pub(crate) core: Arc<StageCore<T>>,
    default_executor: StageExecutor,
}

impl<T> Clone for ManagedStage<T> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
            default_executor: self.default_executor.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> ManagedStage<T> {
    pub(crate) fn incomplete(default_executor: StageExecutor) -> Self {
        Self {
            core: Arc::new(StageCore::new()),
            default_executor,
        }
    }

    pub(crate) fn settled(default_executor: StageExecutor, outcome: Outcome<T>) -> Self {
        Self {
            core: Arc::new(StageCore::completed(outcome)),
            default_executor,
        }
    }

    /// 在 `executor` 上运行 `supplier` 并以其结果完成新阶段。
    pub(crate) fn supply_on(
        executor: StageExecutor,
        context: Option<ContextSnapshot>,
        supplier: impl FnOnce() -> TaskResult<T> + Send + 'static,
    ) -> Self {
        let stage = Self::incomplete(executor.clone());
        stage.run_reaction(
            Mode::Async(executor),
            context,
            Box::new(move |target: &ManagedStage<T>| {
                target
                    .core
                    .settle(supplier().map_err(ConcurrencyError::Execution));
            }),
        );
        stage
    }

    pub fn default_executor(&self) -> &StageExecutor {
        &self.default_executor
    }

    /// 与本阶段共享默认执行器的新未完成阶段。
    pub fn new_incomplete<U: Clone + Send + 'static>(&self) -> ManagedStage<U> {
        ManagedStage::incomplete(self.default_executor.clone())
    }

    // ---- 完成控制 ----

    pub fn complete(&self, value: T) -> bool {
        self.complete_externally(Ok(value), true)
    }

    pub fn complete_exceptionally(&self, failure: Failure) -> bool {
        self.complete_externally(Err(ConcurrencyError::Execution(failure)), true)
    }

    pub fn cancel(&self, interrupt: bool) -> bool {
        self.complete_externally(Err(ConcurrencyError::Cancelled), interrupt)
    }

    pub fn obtrude_value(&self, value: T) {
        self.core.overwrite(Ok(value));
        self.core.cancel_backing(true);
    }

    pub fn obtrude_exception(&self, failure: Failure) {
        self.core.overwrite(Err(ConcurrencyError::Execution(failure)));
        self.core.cancel_backing(true);
    }

    fn complete_externally(&self, outcome: Outcome<T>, interrupt: bool) -> bool {
        let completed = self.core.settle(outcome);
        if completed {
            self.core.cancel_backing(interrupt);
        }
        completed
    }

    /// 在默认执行器上计算值并完成本阶段。
    pub fn complete_async<F>(&self, supplier: F) -> Self
    where
        F: FnOnce() -> T + Send + 'static,
    {
        let executor = self.default_executor.clone();
        self.complete_async_on(StageAction::Plain(supplier), &executor)
    }

    /// 在指定执行器上计算值并完成本阶段；本阶段已完成时不做任何事。
    pub fn complete_async_on<F>(&self, supplier: StageAction<F>, executor: &StageExecutor) -> Self
    where
        F: FnOnce() -> T + Send + 'static,
    {
        if self.is_done() {
            return self.clone();
        }
        let (supplier, context) = match supplier.resolve(|| self.capture_for::<F>(executor)) {
            Ok(resolved) => resolved,
            Err(error) => {
                self.core.settle(Err(error));
                return self.clone();
            }
        };
        let handoff = Handoff::new();
        let (target, orphan) = (self.clone(), self.clone());
        let job = handoff.wrap(
            move || {
                let outcome = in_context(context.as_ref(), || Ok(supplier()));
                target.core.settle(outcome);
            },
            move || orphan.abandon(),
        );
        match executor.native().submit(job, executor.policy()) {
            Ok(_) => {
                if !handoff.accept() {
                    self.abandon();
                }
            }
            Err(failure) => {
                handoff.reject();
                self.core.settle(Err(ConcurrencyError::rejected(
                    "stage executor rejected the completion supplier",
                    Some(failure),
                )));
            }
        }
        self.clone()
    }

    /// 超时仍未完成时以 `value` 完成。
    pub fn complete_on_timeout(&self, value: T, timeout: Duration) -> Self {
        self.arm_timeout(timeout, Ok(value));
        self.clone()
    }

    /// 超时仍未完成时以 `Timeout` 失败完成。
    pub fn or_timeout(&self, timeout: Duration) -> Self {
        self.arm_timeout(timeout, Err(ConcurrencyError::Timeout(timeout)));
        self.clone()
    }

    fn arm_timeout(&self, timeout: Duration, outcome: Outcome<T>) {
        if self.is_done() {
            return;
        }
        let target = self.clone();
        let job: Job = Box::new(move || {
            if target.complete_externally(outcome, true) {
                debug!(timeout_ms = timeout.as_millis() as u64, "stage completed by timeout");
            }
        });
        if let Err(failure) = self.default_executor.native().schedule(job, timeout) {
            warn!(
                executor = %self.default_executor.name(),
                error = %failure,
                "failed to arm stage timeout"
            );
        }
    }

    // ---- 观察 ----

    pub fn get(&self) -> ConcurrencyResult<T> {
        self.core
            .wait(None)
            .unwrap_or(Err(ConcurrencyError::Cancelled))
    }

    pub fn get_timeout(&self, timeout: Duration) -> ConcurrencyResult<T> {
        self.core
            .wait(deadline_after(timeout))
            .unwrap_or(Err(ConcurrencyError::Timeout(timeout)))
    }

    /// 阻塞等待；若异步动作尚未被工作线程领取，则在当前线程内联运行它。
    pub fn join(&self) -> ConcurrencyResult<T> {
        if !self.is_done() {
            if let Some(claim) = self.core.take_pending() {
                claim.run();
            }
        }
        self.get()
    }

    /// 已完成时返回结果，否则返回 `Ok(default)`。
    pub fn get_now(&self, default: T) -> ConcurrencyResult<T> {
        self.core.outcome().unwrap_or(Ok(default))
    }

    pub fn is_done(&self) -> bool {
        self.core.is_done()
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.core.outcome(), Some(Err(ConcurrencyError::Cancelled)))
    }

    pub fn is_completed_exceptionally(&self) -> bool {
        matches!(self.core.outcome(), Some(Err(_)))
    }

    pub fn number_of_dependents(&self) -> usize {
        self.core.dependents()
    }

    /// 独立的副本：随本阶段完成而完成，自身的完成不影响本阶段。
    pub fn copy(&self) -> Self {
        let target = self.new_incomplete::<T>();
        let relay = target.clone();
        self.core.subscribe(Box::new(move |outcome: &Outcome<T>| {
            relay.core.settle(outcome.clone());
        }));
        target
    }

    // ---- 派发机制 ----

    /// 按捕获规则为动作类型 `F` 捕获上下文。
    pub(crate) fn capture_for<F>(
        &self,
        executor: &StageExecutor,
    ) -> ConcurrencyResult<Option<ContextSnapshot>> {
        self.default_executor
            .managed()
            .or_else(|| executor.managed())
            .map(|managed| managed.capture_for_stage(type_name::<F>()))
            .transpose()
    }

    /// 注册依赖动作并返回依赖阶段。
    pub(crate) fn react<U, F>(
        &self,
        mode: Mode,
        action: StageAction<F>,
        reaction: impl FnOnce(Outcome<T>, F) -> Reaction<U> + Send + 'static,
    ) -> ManagedStage<U>
    where
        U: Clone + Send + 'static,
        F: Send + 'static,
    {
        let target = self.new_incomplete::<U>();
        let capture_executor = match &mode {
            Mode::Sync => self.default_executor.clone(),
            Mode::Async(executor) => executor.clone(),
        };
        let (action, context) = match action.resolve(|| self.capture_for::<F>(&capture_executor)) {
            Ok(resolved) => resolved,
            Err(error) => {
                debug!(error = %error, "context capture failed; dependent stage completes exceptionally");
                target.core.settle(Err(error));
                return target;
            }
        };
        let dependent = target.clone();
        self.core.subscribe(Box::new(move |outcome: &Outcome<T>| {
            match reaction(outcome.clone(), action) {
                Reaction::Settle(result) => {
                    dependent.core.settle(result);
                }
                Reaction::Run(job) => dependent.run_reaction(mode, context, job),
            }
        }));
        target
    }

    /// 在上下文中运行动作；异步模式下交给执行器并记录在途句柄。
    pub(crate) fn run_reaction(
        &self,
        mode: Mode,
        context: Option<ContextSnapshot>,
        job: Box<dyn FnOnce(&ManagedStage<T>) + Send + 'static>,
    ) {
        let target = self.clone();
        let work: Job = Box::new(move || {
            let result = in_context(context.as_ref(), || {
                job(&target);
                Ok(())
            });
            if let Err(error) = result {
                target.core.settle(Err(error));
            }
        });
        match mode {
            Mode::Sync => work(),
            Mode::Async(executor) => self.submit_backing(&executor, work),
        }
    }

    fn submit_backing(&self, executor: &StageExecutor, work: Job) {
        let claim = Arc::new(Claim::new(work));
        self.core.set_pending(Arc::clone(&claim));
        let handoff = Handoff::new();
        let runner = Arc::clone(&claim);
        let orphan = self.clone();
        let submitted = executor.native().submit(
            handoff.wrap(
                move || {
                    runner.run();
                },
                move || orphan.abandon(),
            ),
            executor.policy(),
        );
        match submitted {
            Ok(native) => {
                if !handoff.accept() {
                    self.abandon();
                } else if self.is_done() {
                    native.cancel(false);
                } else {
                    self.core.set_backing(native);
                }
            }
            Err(failure) => {
                handoff.reject();
                claim.discard();
                warn!(executor = %executor.name(), error = %failure, "stage executor rejected the action");
                self.core.settle(Err(ConcurrencyError::rejected(
                    "stage executor rejected the action",
                    Some(failure),
                )));
            }
        }
    }

    /// 异步动作未运行就被执行器丢弃：放弃在途动作并以 `Rejected` 完成。
    fn abandon(&self) {
        if let Some(claim) = self.core.take_pending() {
            claim.discard();
        }
        if self.core.settle(Err(ConcurrencyError::rejected(DROPPED_UNRUN, None))) {
            warn!(stage = %type_name::<T>(), "stage executor dropped the action without running it");
        }
    }

    /// 两个阶段都成功时以二元组完成；任一失败时以先到的失败完成。
    pub(crate) fn zip<U: Clone + Send + 'static>(
        &self,
        other: &ManagedStage<U>,
    ) -> ManagedStage<(T, U)> {
        let target = self.new_incomplete::<(T, U)>();
        let slots = Arc::new(Mutex::new((None::<T>, None::<U>)));

        let left_target = target.clone();
        let left_slots = Arc::clone(&slots);
        self.core.subscribe(Box::new(move |outcome: &Outcome<T>| match outcome {
            Err(error) => {
                left_target.core.settle(Err(error.clone()));
            }
            Ok(value) => {
                let ready = {
                    let mut slots = left_slots.lock();
                    slots.0 = Some(value.clone());
                    take_pair(&mut slots)
                };
                if let Some(pair) = ready {
                    left_target.core.settle(Ok(pair));
                }
            }
        }));

        let right_target = target.clone();
        other.core.subscribe(Box::new(move |outcome: &Outcome<U>| match outcome {
            Err(error) => {
                right_target.core.settle(Err(error.clone()));
            }
            Ok(value) => {
                let ready = {
                    let mut slots = slots.lock();
                    slots.1 = Some(value.clone());
                    take_pair(&mut slots)
                };
                if let Some(pair) = ready {
                    right_target.core.settle(Ok(pair));
                }
            }
        }));
        target
    }

    /// 以两个阶段中先完成者的结果完成。
    pub(crate) fn race(&self, other: &ManagedStage<T>) -> ManagedStage<T> {
        let target = self.new_incomplete::<T>();
        for source in [self, other] {
            let relay = target.clone();
            source.core.subscribe(Box::new(move |outcome: &Outcome<T>| {
                relay.core.settle(outcome.clone());
            }));
        }
        target
    }
}

fn take_pair<T, U>(slots: &mut (Option<T>, Option<U>)) -> Option<(T, U)> {
    match (slots.0.take(), slots.1.take()) {
        (Some(left), Some(right)) => Some((left, right)),
        (left, right) => {
            slots.0 = left;
            slots.1 = right;
            None
        }
    }
}

/// 施加快照、运行 `body`、恢复快照。
///
/// 施加失败返回 `Aborted`；`body` 失败或 panic 返回 `Execution`；`body` 成功但恢复失败时同样返回 `Execution`。
pub(crate) fn in_context<R>(
    context: Option<&ContextSnapshot>,
    body: impl FnOnce() -> TaskResult<R>,
) -> ConcurrencyResult<R> {
    let applied = match context {
        Some(snapshot) => Some(snapshot.apply().map_err(ConcurrencyError::Aborted)?),
        None => None,
    };
    let result = catch(body).map_err(ConcurrencyError::Execution);
    if let Some(applied) = applied {
        if let Err(failure) = applied.restore() {
            if result.is_ok() {
                return Err(ConcurrencyError::Execution(failure));
            }
        }
    }
    result
}

impl<T> fmt::Debug for ManagedStage<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedStage")
            .field("default_executor", &self.default_executor)
            .finish_non_exhaustive()
    }
}

/// `.await` 一个阶段得到的 Future。
pub struct StageFuture<T> {
    stage: ManagedStage<T>,
    waker: Option<Arc<Mutex<Option<Waker>>>>,
}

impl<T: Clone + Send + 'static> Future for StageFuture<T> {
    type Output = ConcurrencyResult<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if let Some(outcome) = this.stage.core.outcome() {
            return Poll::Ready(outcome);
        }
        match &this.waker {
            Some(slot) => *slot.lock() = Some(cx.waker().clone()),
            None => {
                let slot = Arc::new(Mutex::new(Some(cx.waker().clone())));
                let notify = Arc::clone(&slot);
                this.stage.core.subscribe(Box::new(move |_: &Outcome<T>| {
                    if let Some(waker) = notify.lock().take() {
                        waker.wake();
                    }
                }));
                this.waker = Some(slot);
            }
        }
        match this.stage.core.outcome() {
            Some(outcome) => Poll::Ready(outcome),
            None => Poll::Pending,
        }
    }
}

impl<T: Clone + Send + 'static> IntoFuture for ManagedStage<T> {
    type Output = ConcurrencyResult<T>;
    type IntoFuture = StageFuture<T>;

    fn into_future(self) -> Self::IntoFuture {
        StageFuture {
            stage: self,
            waker: None,
        }
    }
}
