//! 依赖动作的两种形态与阶段执行器。

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::context::ContextSnapshot;
use crate::error::{ConcurrencyResult, Failure, TaskResult};
use crate::executor::ManagedExecutor;
use crate::native::{NativeExecutor, NativeFuture, QueuePolicy, Work};

/// 交给 `*_async_on` 的动作。
///
/// # 契约说明（What）
/// - `Plain`：按阶段规则在注册时捕获上下文；
/// - `Contextual`：已经携带快照（通常来自 [`ManagedExecutor::contextualize`]），不再重新捕获，
///   执行时施加的就是该快照。
pub enum StageAction<F> {
    Plain(F),
    Contextual { action: F, context: ContextSnapshot },
}

impl<F> StageAction<F> {
    pub fn plain(action: F) -> Self {
        StageAction::Plain(action)
    }

    pub fn contextual(action: F, context: ContextSnapshot) -> Self {
        StageAction::Contextual { action, context }
    }

    pub fn is_contextual(&self) -> bool {
        matches!(self, StageAction::Contextual { .. })
    }

    /// 拆出动作与要施加的快照；`Plain` 形态调用 `capture` 决定快照。
    pub(crate) fn resolve(
        self,
        capture: impl FnOnce() -> ConcurrencyResult<Option<ContextSnapshot>>,
    ) -> ConcurrencyResult<(F, Option<ContextSnapshot>)> {
        match self {
            StageAction::Plain(action) => Ok((action, capture()?)),
            StageAction::Contextual { action, context } => Ok((action, Some(context))),
        }
    }
}

impl<F> fmt::Debug for StageAction<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageAction::Plain(_) => f.write_str("StageAction::Plain"),
            StageAction::Contextual { context, .. } => f
                .debug_struct("StageAction::Contextual")
                .field("context", context)
                .finish(),
        }
    }
}

/// 运行异步依赖动作的执行器。
///
/// 托管执行器会参与上下文捕获；普通底层执行器只负责运行。
#[derive(Clone)]
pub enum StageExecutor {
    Managed(ManagedExecutor),
    Plain(Arc<dyn NativeExecutor>),
}

impl StageExecutor {
    pub fn name(&self) -> &str {
        match self {
            StageExecutor::Managed(executor) => executor.name(),
            StageExecutor::Plain(native) => native.name(),
        }
    }

    pub fn managed(&self) -> Option<&ManagedExecutor> {
        match self {
            StageExecutor::Managed(executor) => Some(executor),
            StageExecutor::Plain(_) => None,
        }
    }

    /// 先等待 `delay` 再把动作交给 `executor` 运行的阶段执行器。
    ///
    /// 上下文仍由阶段的默认执行器在注册时捕获。
    pub fn delayed(delay: Duration, executor: impl Into<StageExecutor>) -> StageExecutor {
        let inner = Arc::clone(executor.into().native());
        StageExecutor::Plain(Arc::new(DelayedExecutor { inner, delay }))
    }

    pub(crate) fn native(&self) -> &Arc<dyn NativeExecutor> {
        match self {
            StageExecutor::Managed(executor) => executor.native(),
            StageExecutor::Plain(native) => native,
        }
    }

    pub(crate) fn policy(&self) -> QueuePolicy {
        match self {
            StageExecutor::Managed(executor) => executor.config().queue_policy(),
            StageExecutor::Plain(_) => QueuePolicy::default(),
        }
    }
}

/// 把每次提交推迟固定时长的底层执行器包装。
pub struct DelayedExecutor {
    inner: Arc<dyn NativeExecutor>,
    delay: Duration,
}

impl DelayedExecutor {
    pub fn delay(&self) -> Duration {
        self.delay
    }
}

impl NativeExecutor for DelayedExecutor {
    fn submit(&self, work: Work, _policy: QueuePolicy) -> TaskResult<Arc<dyn NativeFuture>> {
        self.inner.schedule(work, self.delay)
    }

    fn schedule(&self, work: Work, delay: Duration) -> TaskResult<Arc<dyn NativeFuture>> {
        let total = self
            .delay
            .checked_add(delay)
            .ok_or_else(|| Failure::msg("combined delay overflows"))?;
        self.inner.schedule(work, total)
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}

impl fmt::Debug for DelayedExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DelayedExecutor")
            .field("inner", &self.inner.name())
            .field("delay", &self.delay)
            .finish()
    }
}

impl From<ManagedExecutor> for StageExecutor {
    fn from(executor: ManagedExecutor) -> Self {
        StageExecutor::Managed(executor)
    }
}

impl From<Arc<dyn NativeExecutor>> for StageExecutor {
    fn from(native: Arc<dyn NativeExecutor>) -> Self {
        StageExecutor::Plain(native)
    }
}

impl fmt::Debug for StageExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageExecutor::Managed(executor) => {
                f.debug_tuple("Managed").field(&executor.name()).finish()
            }
            StageExecutor::Plain(native) => f.debug_tuple("Plain").field(&native.name()).finish(),
        }
    }
}
