//! # 底层执行器契约
//!
//! ## 契约声明
//! * **协作者接口：** 托管运行时不自带线程池或定时器，真正的执行由实现 [`NativeExecutor`] 的宿主完成；
//!   本模块只描述托管层对它的最低要求。
//! * **拒绝语义：** `submit`/`schedule` 返回 `Err` 即视为拒绝（容量不足、已关闭等），托管层会把它转换为
//!   `ConcurrencyError::Rejected` 并补发监听器通知。
//! * **取消语义：** [`NativeFuture::cancel`] 必须保证尚未开始的工作不再运行；已经开始的工作由托管层通过协作式
//!   中断处理，底层无需强行终止线程。
//!
//! ## 实现提示
//! * [`NativeTask`] 是一个可复用的 [`NativeFuture`] 实现：适配器把工作包进 [`NativeTask::guard`] 返回的闭包，
//!   即可获得"取消后不再运行"的语义；闭包未运行就被丢弃时句柄同样进入取消态。
//! * **丢弃语义：** 底层执行器接受工作后仍可能不运行就丢弃它（例如运行时关闭时清空队列）。托管层通过
//!   `Handoff` 感知这种情况，并把对应任务以 `Rejected` 结束，保证终态通知不会丢失。

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use serde::Deserialize;

use crate::error::TaskResult;

/// 交给底层执行器的一段工作。
pub type Work = Box<dyn FnOnce() + Send + 'static>;

/// `TaskPriority` 描述调度器参考的优先级队列等级。
///
/// # 契约说明（What）
/// - 提交任务时默认使用 [`TaskPriority::Normal`]；实现者可根据内部策略映射到权重或队列索引。
///
/// # 风险提示（Trade-offs）
/// - 过度依赖优先级可能导致饥饿；实现者应结合老化策略避免长期低优先级任务饿死。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum TaskPriority {
    Critical,
    High,
    #[default]
    Normal,
    Low,
    Idle,
}

/// 提交时附带的队列策略。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueuePolicy {
    pub priority: TaskPriority,
    pub long_running: bool,
}

/// 底层执行器返回的工作句柄。
pub trait NativeFuture: Send + Sync {
    /// 取消工作；返回 `true` 表示取消生效（工作尚未完成）。
    fn cancel(&self, interrupt: bool) -> bool;

    fn is_cancelled(&self) -> bool;

    fn is_done(&self) -> bool;
}

/// 底层执行器。
///
/// # 契约说明（What）
/// - `submit`：尽快运行 `work`；
/// - `schedule`：至少延迟 `delay` 后运行 `work`；
/// - 两者返回 `Err` 表示拒绝，此时 `work` 必须不会被运行；
/// - 实现必须是 `Send + Sync`，托管层会从任意线程调用。
pub trait NativeExecutor: Send + Sync + 'static {
    fn submit(&self, work: Work, policy: QueuePolicy) -> TaskResult<Arc<dyn NativeFuture>>;

    fn schedule(&self, work: Work, delay: Duration) -> TaskResult<Arc<dyn NativeFuture>>;

    /// 底层执行器名称，仅用于日志。
    fn name(&self) -> &str {
        "native"
    }
}

const PENDING: u8 = 0;
const RUNNING: u8 = 1;
const DONE: u8 = 2;
const CANCELLED: u8 = 3;

/// 通用的 [`NativeFuture`] 实现。
///
/// # 教案式说明
/// - **意图 (Why)**：多数适配器只需要"取消后不再运行"这一条语义，抽出复用可避免每个适配器重写状态机。
/// - **契约 (What)**：状态按 `Pending → Running → Done` 推进；`cancel` 只在 `Pending` 或 `Running` 时生效，
///   并且 `Running` 状态下的取消只做标记，不会打断正在执行的工作。
/// - **实现提示 (How)**：单个 `AtomicU8` 承载状态，所有迁移使用 CAS。
#[derive(Debug, Default)]
pub struct NativeTask {
    state: AtomicU8,
}

impl NativeTask {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// 将工作包装为"仅在未被取消时运行"的闭包，返回包装后的工作与句柄。
    ///
    /// 包装后的闭包未被调用就被丢弃时，句柄标记为已取消。
    pub fn guard(work: Work) -> (Work, Arc<NativeTask>) {
        let task = NativeTask::new();
        let handle = Arc::clone(&task);
        let unrun = CancelOnDrop(Some(task));
        let guarded: Work = Box::new(move || {
            let mut unrun = unrun;
            if let Some(task) = unrun.0.take() {
                if task.begin() {
                    work();
                    task.finish();
                }
            }
        });
        (guarded, handle)
    }

    /// 尝试进入运行态；已被取消时返回 `false`。
    pub fn begin(&self) -> bool {
        self.state
            .compare_exchange(PENDING, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// 标记完成。运行期间被取消的工作保持取消态。
    pub fn finish(&self) {
        let _ = self
            .state
            .compare_exchange(RUNNING, DONE, Ordering::AcqRel, Ordering::Acquire);
    }
}

struct CancelOnDrop(Option<Arc<NativeTask>>);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if let Some(task) = self.0.take() {
            task.cancel(false);
        }
    }
}

impl NativeFuture for NativeTask {
    fn cancel(&self, _interrupt: bool) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if current == DONE || current == CANCELLED {
                return false;
            }
            match self.state.compare_exchange(
                current,
                CANCELLED,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::Acquire) == CANCELLED
    }

    fn is_done(&self) -> bool {
        matches!(self.state.load(Ordering::Acquire), DONE | CANCELLED)
    }
}

/// 工作未运行即被底层执行器丢弃时的拒绝原因。
pub(crate) const DROPPED_UNRUN: &str = "underlying executor dropped the task without running it";

const HANDOFF_PENDING: u8 = 0;
const HANDOFF_ACCEPTED: u8 = 1;
const HANDOFF_DROPPED: u8 = 2;
const HANDOFF_REJECTED: u8 = 3;

/// 托管层交给底层执行器的工作的移交状态。
///
/// # 教案式说明
/// - **意图 (Why)**：底层执行器可能在 `submit` 返回之前（运行时已关闭，工作被同步丢弃）或之后
///   （关闭时清空队列）丢弃工作而不运行；两种顺序下托管层都必须恰好处理一次"被丢弃"。
/// - **契约 (What)**：
///   - [`Handoff::wrap`] 产出的工作被运行时不触发任何回调；
///   - 工作在 [`Handoff::accept`] 之后被丢弃时，由丢弃方调用 `dropped` 回调；
///   - 工作在 `accept` 之前被丢弃时，`accept` 返回 `false`，由提交方自行处理；
///   - [`Handoff::reject`] 之后的丢弃不再触发回调，拒绝路径自己负责收尾。
/// - **实现提示 (How)**：单个 `AtomicU8` 记录移交状态，丢弃与接受两侧以 CAS 竞争，先到者只做标记。
#[derive(Debug, Default)]
pub(crate) struct Handoff {
    state: AtomicU8,
}

impl Handoff {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// 包装工作：运行时解除丢弃回调。
    pub(crate) fn wrap(
        self: &Arc<Self>,
        run: impl FnOnce() + Send + 'static,
        dropped: impl FnOnce() + Send + 'static,
    ) -> Work {
        let mut fallback = DroppedUnrun {
            handoff: Arc::clone(self),
            dropped: Some(dropped),
        };
        Box::new(move || {
            fallback.dropped = None;
            run();
        })
    }

    /// 底层执行器返回 `Ok` 后调用；工作已在此之前被丢弃时返回 `false`。
    pub(crate) fn accept(&self) -> bool {
        match self.state.compare_exchange(
            HANDOFF_PENDING,
            HANDOFF_ACCEPTED,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => true,
            Err(observed) => observed != HANDOFF_DROPPED,
        }
    }

    /// 底层执行器返回 `Err` 后调用。
    pub(crate) fn reject(&self) {
        self.state.store(HANDOFF_REJECTED, Ordering::Release);
    }

    /// 丢弃方调用；返回 `true` 表示由丢弃方负责收尾。
    fn mark_dropped(&self) -> bool {
        match self.state.compare_exchange(
            HANDOFF_PENDING,
            HANDOFF_DROPPED,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => false,
            Err(observed) => observed == HANDOFF_ACCEPTED,
        }
    }
}

struct DroppedUnrun<D: FnOnce()> {
    handoff: Arc<Handoff>,
    dropped: Option<D>,
}

impl<D: FnOnce()> Drop for DroppedUnrun<D> {
    fn drop(&mut self) {
        if let Some(dropped) = self.dropped.take() {
            if self.handoff.mark_dropped() {
                dropped();
            }
        }
    }
}
