//! 只暴露组合能力的阶段视图。

use std::fmt;

use crate::error::{ConcurrencyError, ConcurrencyResult};

use super::action::{StageAction, StageExecutor};
use super::managed::ManagedStage;

/// 可以作为双输入组合器另一侧输入的阶段。
pub trait AsStage<T> {
    fn as_stage(&self) -> &ManagedStage<T>;
}

impl<T> AsStage<T> for ManagedStage<T> {
    fn as_stage(&self) -> &ManagedStage<T> {
        self
    }
}

impl<T> AsStage<T> for MinimalStage<T> {
    fn as_stage(&self) -> &ManagedStage<T> {
        &self.inner
    }
}

/// 最小阶段视图。
///
/// 类型上不提供 `complete`/`cancel`/`obtrude_*` 与阻塞观察，持有者只能继续组合；
/// 需要完整能力时用 [`MinimalStage::to_stage`] 取得一份独立副本，副本的完成不会影响原阶段。
pub struct MinimalStage<T> {
    inner: ManagedStage<T>,
}

impl<T> Clone for MinimalStage<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> ManagedStage<T> {
    /// 以本阶段的一份副本构造最小视图。
    pub fn minimal(&self) -> MinimalStage<T> {
        MinimalStage { inner: self.copy() }
    }
}

impl<T: Clone + Send + 'static> MinimalStage<T> {
    pub fn to_stage(&self) -> ManagedStage<T> {
        self.inner.copy()
    }

    pub fn default_executor(&self) -> &StageExecutor {
        self.inner.default_executor()
    }

    pub fn is_done(&self) -> bool {
        self.inner.is_done()
    }

    pub fn then_apply<U, F>(&self, action: F) -> MinimalStage<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        MinimalStage::wrap(self.inner.then_apply(action))
    }

    pub fn then_apply_async<U, F>(&self, action: F) -> MinimalStage<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        MinimalStage::wrap(self.inner.then_apply_async(action))
    }

    pub fn then_apply_async_on<U, F>(
        &self,
        action: StageAction<F>,
        executor: &StageExecutor,
    ) -> MinimalStage<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        MinimalStage::wrap(self.inner.then_apply_async_on(action, executor))
    }

    pub fn then_accept<F>(&self, action: F) -> MinimalStage<()>
    where
        F: FnOnce(T) + Send + 'static,
    {
        MinimalStage::wrap(self.inner.then_accept(action))
    }

    pub fn then_run<F>(&self, action: F) -> MinimalStage<()>
    where
        F: FnOnce() + Send + 'static,
    {
        MinimalStage::wrap(self.inner.then_run(action))
    }

    pub fn then_combine<U, V, S, F>(&self, other: &S, action: F) -> MinimalStage<V>
    where
        U: Clone + Send + 'static,
        V: Clone + Send + 'static,
        S: AsStage<U>,
        F: FnOnce(T, U) -> V + Send + 'static,
    {
        MinimalStage::wrap(self.inner.then_combine(other, action))
    }

    pub fn apply_to_either<U, S, F>(&self, other: &S, action: F) -> MinimalStage<U>
    where
        U: Clone + Send + 'static,
        S: AsStage<T>,
        F: FnOnce(T) -> U + Send + 'static,
    {
        MinimalStage::wrap(self.inner.apply_to_either(other, action))
    }

    pub fn then_compose<U, F>(&self, action: F) -> MinimalStage<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> ManagedStage<U> + Send + 'static,
    {
        MinimalStage::wrap(self.inner.then_compose(action))
    }

    pub fn exceptionally<F>(&self, action: F) -> MinimalStage<T>
    where
        F: FnOnce(ConcurrencyError) -> T + Send + 'static,
    {
        MinimalStage::wrap(self.inner.exceptionally(action))
    }

    pub fn handle<U, F>(&self, action: F) -> MinimalStage<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(ConcurrencyResult<T>) -> U + Send + 'static,
    {
        MinimalStage::wrap(self.inner.handle(action))
    }

    pub fn when_complete<F>(&self, action: F) -> MinimalStage<T>
    where
        F: FnOnce(&ConcurrencyResult<T>) + Send + 'static,
    {
        MinimalStage::wrap(self.inner.when_complete(action))
    }

    fn wrap(inner: ManagedStage<T>) -> Self {
        Self { inner }
    }
}

impl<T> fmt::Debug for MinimalStage<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MinimalStage")
            .field("inner", &self.inner)
            .finish()
    }
}
