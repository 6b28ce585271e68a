//! 依赖阶段的各个方法族。
//!
//! 每个方法族都有三种形态：同步形态在完成源阶段的线程上运行动作；`_async` 形态使用阶段的默认执行器；
//! `_async_on` 形态使用显式执行器，并接受已携带上下文的 [`StageAction::Contextual`]。
//! 三种形态最终都走 [`ManagedStage::react`]，因此上下文捕获规则只有一处实现。

use tracing::warn;

use crate::error::{ConcurrencyError, ConcurrencyResult, catch};

use super::action::{StageAction, StageExecutor};
use super::managed::{ManagedStage, Mode, Reaction};
use super::minimal::AsStage;

impl<T: Clone + Send + 'static> ManagedStage<T> {
    fn async_mode(&self) -> Mode {
        Mode::Async(self.default_executor().clone())
    }

    // ---- then_apply ----

    pub fn then_apply<U, F>(&self, action: F) -> ManagedStage<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        self.apply_with(Mode::Sync, StageAction::Plain(action))
    }

    pub fn then_apply_async<U, F>(&self, action: F) -> ManagedStage<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        let mode = self.async_mode();
        self.apply_with(mode, StageAction::Plain(action))
    }

    pub fn then_apply_async_on<U, F>(
        &self,
        action: StageAction<F>,
        executor: &StageExecutor,
    ) -> ManagedStage<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        self.apply_with(Mode::Async(executor.clone()), action)
    }

    fn apply_with<U, F>(&self, mode: Mode, action: StageAction<F>) -> ManagedStage<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        self.react(mode, action, |outcome, action| match outcome {
            Ok(value) => Reaction::produce(move || action(value)),
            Err(error) => Reaction::Settle(Err(error)),
        })
    }

    // ---- then_accept ----

    pub fn then_accept<F>(&self, action: F) -> ManagedStage<()>
    where
        F: FnOnce(T) + Send + 'static,
    {
        self.apply_with(Mode::Sync, StageAction::Plain(action))
    }

    pub fn then_accept_async<F>(&self, action: F) -> ManagedStage<()>
    where
        F: FnOnce(T) + Send + 'static,
    {
        let mode = self.async_mode();
        self.apply_with(mode, StageAction::Plain(action))
    }

    pub fn then_accept_async_on<F>(
        &self,
        action: StageAction<F>,
        executor: &StageExecutor,
    ) -> ManagedStage<()>
    where
        F: FnOnce(T) + Send + 'static,
    {
        self.apply_with(Mode::Async(executor.clone()), action)
    }

    // ---- then_run ----

    pub fn then_run<F>(&self, action: F) -> ManagedStage<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.run_with(Mode::Sync, StageAction::Plain(action))
    }

    pub fn then_run_async<F>(&self, action: F) -> ManagedStage<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let mode = self.async_mode();
        self.run_with(mode, StageAction::Plain(action))
    }

    pub fn then_run_async_on<F>(
        &self,
        action: StageAction<F>,
        executor: &StageExecutor,
    ) -> ManagedStage<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.run_with(Mode::Async(executor.clone()), action)
    }

    fn run_with<F>(&self, mode: Mode, action: StageAction<F>) -> ManagedStage<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.react(mode, action, |outcome, action| match outcome {
            Ok(_) => Reaction::produce(action),
            Err(error) => Reaction::Settle(Err(error)),
        })
    }

    // ---- then_combine / then_accept_both / run_after_both ----

    pub fn then_combine<U, V, S, F>(&self, other: &S, action: F) -> ManagedStage<V>
    where
        U: Clone + Send + 'static,
        V: Clone + Send + 'static,
        S: AsStage<U>,
        F: FnOnce(T, U) -> V + Send + 'static,
    {
        self.combine_with(other, Mode::Sync, StageAction::Plain(action))
    }

    pub fn then_combine_async<U, V, S, F>(&self, other: &S, action: F) -> ManagedStage<V>
    where
        U: Clone + Send + 'static,
        V: Clone + Send + 'static,
        S: AsStage<U>,
        F: FnOnce(T, U) -> V + Send + 'static,
    {
        let mode = self.async_mode();
        self.combine_with(other, mode, StageAction::Plain(action))
    }

    pub fn then_combine_async_on<U, V, S, F>(
        &self,
        other: &S,
        action: StageAction<F>,
        executor: &StageExecutor,
    ) -> ManagedStage<V>
    where
        U: Clone + Send + 'static,
        V: Clone + Send + 'static,
        S: AsStage<U>,
        F: FnOnce(T, U) -> V + Send + 'static,
    {
        self.combine_with(other, Mode::Async(executor.clone()), action)
    }

    fn combine_with<U, V, S, F>(&self, other: &S, mode: Mode, action: StageAction<F>) -> ManagedStage<V>
    where
        U: Clone + Send + 'static,
        V: Clone + Send + 'static,
        S: AsStage<U>,
        F: FnOnce(T, U) -> V + Send + 'static,
    {
        self.zip(other.as_stage())
            .react(mode, action, |outcome, action| match outcome {
                Ok((left, right)) => Reaction::produce(move || action(left, right)),
                Err(error) => Reaction::Settle(Err(error)),
            })
    }

    pub fn then_accept_both<U, S, F>(&self, other: &S, action: F) -> ManagedStage<()>
    where
        U: Clone + Send + 'static,
        S: AsStage<U>,
        F: FnOnce(T, U) + Send + 'static,
    {
        self.combine_with(other, Mode::Sync, StageAction::Plain(action))
    }

    pub fn then_accept_both_async<U, S, F>(&self, other: &S, action: F) -> ManagedStage<()>
    where
        U: Clone + Send + 'static,
        S: AsStage<U>,
        F: FnOnce(T, U) + Send + 'static,
    {
        let mode = self.async_mode();
        self.combine_with(other, mode, StageAction::Plain(action))
    }

    pub fn then_accept_both_async_on<U, S, F>(
        &self,
        other: &S,
        action: StageAction<F>,
        executor: &StageExecutor,
    ) -> ManagedStage<()>
    where
        U: Clone + Send + 'static,
        S: AsStage<U>,
        F: FnOnce(T, U) + Send + 'static,
    {
        self.combine_with(other, Mode::Async(executor.clone()), action)
    }

    pub fn run_after_both<U, S, F>(&self, other: &S, action: F) -> ManagedStage<()>
    where
        U: Clone + Send + 'static,
        S: AsStage<U>,
        F: FnOnce() + Send + 'static,
    {
        self.zip(other.as_stage()).run_with(Mode::Sync, StageAction::Plain(action))
    }

    pub fn run_after_both_async<U, S, F>(&self, other: &S, action: F) -> ManagedStage<()>
    where
        U: Clone + Send + 'static,
        S: AsStage<U>,
        F: FnOnce() + Send + 'static,
    {
        let mode = self.async_mode();
        self.zip(other.as_stage()).run_with(mode, StageAction::Plain(action))
    }

    pub fn run_after_both_async_on<U, S, F>(
        &self,
        other: &S,
        action: StageAction<F>,
        executor: &StageExecutor,
    ) -> ManagedStage<()>
    where
        U: Clone + Send + 'static,
        S: AsStage<U>,
        F: FnOnce() + Send + 'static,
    {
        self.zip(other.as_stage())
            .run_with(Mode::Async(executor.clone()), action)
    }

    // ---- apply_to_either / accept_either / run_after_either ----

    pub fn apply_to_either<U, S, F>(&self, other: &S, action: F) -> ManagedStage<U>
    where
        U: Clone + Send + 'static,
        S: AsStage<T>,
        F: FnOnce(T) -> U + Send + 'static,
    {
        self.race(other.as_stage())
            .apply_with(Mode::Sync, StageAction::Plain(action))
    }

    pub fn apply_to_either_async<U, S, F>(&self, other: &S, action: F) -> ManagedStage<U>
    where
        U: Clone + Send + 'static,
        S: AsStage<T>,
        F: FnOnce(T) -> U + Send + 'static,
    {
        let mode = self.async_mode();
        self.race(other.as_stage()).apply_with(mode, StageAction::Plain(action))
    }

    pub fn apply_to_either_async_on<U, S, F>(
        &self,
        other: &S,
        action: StageAction<F>,
        executor: &StageExecutor,
    ) -> ManagedStage<U>
    where
        U: Clone + Send + 'static,
        S: AsStage<T>,
        F: FnOnce(T) -> U + Send + 'static,
    {
        self.race(other.as_stage())
            .apply_with(Mode::Async(executor.clone()), action)
    }

    pub fn accept_either<S, F>(&self, other: &S, action: F) -> ManagedStage<()>
    where
        S: AsStage<T>,
        F: FnOnce(T) + Send + 'static,
    {
        self.race(other.as_stage())
            .apply_with(Mode::Sync, StageAction::Plain(action))
    }

    pub fn accept_either_async<S, F>(&self, other: &S, action: F) -> ManagedStage<()>
    where
        S: AsStage<T>,
        F: FnOnce(T) + Send + 'static,
    {
        let mode = self.async_mode();
        self.race(other.as_stage()).apply_with(mode, StageAction::Plain(action))
    }

    pub fn accept_either_async_on<S, F>(
        &self,
        other: &S,
        action: StageAction<F>,
        executor: &StageExecutor,
    ) -> ManagedStage<()>
    where
        S: AsStage<T>,
        F: FnOnce(T) + Send + 'static,
    {
        self.race(other.as_stage())
            .apply_with(Mode::Async(executor.clone()), action)
    }

    /// 任一阶段完成后运行；两个阶段的值类型可以不同。
    pub fn run_after_either<U, S, F>(&self, other: &S, action: F) -> ManagedStage<()>
    where
        U: Clone + Send + 'static,
        S: AsStage<U>,
        F: FnOnce() + Send + 'static,
    {
        self.signal()
            .race(&other.as_stage().signal())
            .run_with(Mode::Sync, StageAction::Plain(action))
    }

    pub fn run_after_either_async<U, S, F>(&self, other: &S, action: F) -> ManagedStage<()>
    where
        U: Clone + Send + 'static,
        S: AsStage<U>,
        F: FnOnce() + Send + 'static,
    {
        let mode = self.async_mode();
        self.signal()
            .race(&other.as_stage().signal())
            .run_with(mode, StageAction::Plain(action))
    }

    pub fn run_after_either_async_on<U, S, F>(
        &self,
        other: &S,
        action: StageAction<F>,
        executor: &StageExecutor,
    ) -> ManagedStage<()>
    where
        U: Clone + Send + 'static,
        S: AsStage<U>,
        F: FnOnce() + Send + 'static,
    {
        self.signal()
            .race(&other.as_stage().signal())
            .run_with(Mode::Async(executor.clone()), action)
    }

    /// 丢弃值、保留成败的中继阶段。
    fn signal(&self) -> ManagedStage<()> {
        let target = self.new_incomplete::<()>();
        let relay = target.clone();
        self.core.subscribe(Box::new(move |outcome: &ConcurrencyResult<T>| {
            relay.core.settle(outcome.as_ref().map(|_| ()).map_err(Clone::clone));
        }));
        target
    }

    // ---- then_compose ----

    pub fn then_compose<U, F>(&self, action: F) -> ManagedStage<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> ManagedStage<U> + Send + 'static,
    {
        self.compose_with(Mode::Sync, StageAction::Plain(action))
    }

    pub fn then_compose_async<U, F>(&self, action: F) -> ManagedStage<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> ManagedStage<U> + Send + 'static,
    {
        let mode = self.async_mode();
        self.compose_with(mode, StageAction::Plain(action))
    }

    pub fn then_compose_async_on<U, F>(
        &self,
        action: StageAction<F>,
        executor: &StageExecutor,
    ) -> ManagedStage<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> ManagedStage<U> + Send + 'static,
    {
        self.compose_with(Mode::Async(executor.clone()), action)
    }

    fn compose_with<U, F>(&self, mode: Mode, action: StageAction<F>) -> ManagedStage<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> ManagedStage<U> + Send + 'static,
    {
        self.react(mode, action, |outcome, action| match outcome {
            Ok(value) => Reaction::Run(Box::new(move |target: &ManagedStage<U>| {
                follow(&action(value), target);
            })),
            Err(error) => Reaction::Settle(Err(error)),
        })
    }

    // ---- exceptionally / exceptionally_compose ----

    pub fn exceptionally<F>(&self, action: F) -> ManagedStage<T>
    where
        F: FnOnce(ConcurrencyError) -> T + Send + 'static,
    {
        self.recover_with(Mode::Sync, StageAction::Plain(action))
    }

    pub fn exceptionally_async<F>(&self, action: F) -> ManagedStage<T>
    where
        F: FnOnce(ConcurrencyError) -> T + Send + 'static,
    {
        let mode = self.async_mode();
        self.recover_with(mode, StageAction::Plain(action))
    }

    pub fn exceptionally_async_on<F>(
        &self,
        action: StageAction<F>,
        executor: &StageExecutor,
    ) -> ManagedStage<T>
    where
        F: FnOnce(ConcurrencyError) -> T + Send + 'static,
    {
        self.recover_with(Mode::Async(executor.clone()), action)
    }

    fn recover_with<F>(&self, mode: Mode, action: StageAction<F>) -> ManagedStage<T>
    where
        F: FnOnce(ConcurrencyError) -> T + Send + 'static,
    {
        self.react(mode, action, |outcome, action| match outcome {
            Ok(value) => Reaction::Settle(Ok(value)),
            Err(error) => Reaction::produce(move || action(error)),
        })
    }

    pub fn exceptionally_compose<F>(&self, action: F) -> ManagedStage<T>
    where
        F: FnOnce(ConcurrencyError) -> ManagedStage<T> + Send + 'static,
    {
        self.recover_compose_with(Mode::Sync, StageAction::Plain(action))
    }

    pub fn exceptionally_compose_async<F>(&self, action: F) -> ManagedStage<T>
    where
        F: FnOnce(ConcurrencyError) -> ManagedStage<T> + Send + 'static,
    {
        let mode = self.async_mode();
        self.recover_compose_with(mode, StageAction::Plain(action))
    }

    pub fn exceptionally_compose_async_on<F>(
        &self,
        action: StageAction<F>,
        executor: &StageExecutor,
    ) -> ManagedStage<T>
    where
        F: FnOnce(ConcurrencyError) -> ManagedStage<T> + Send + 'static,
    {
        self.recover_compose_with(Mode::Async(executor.clone()), action)
    }

    fn recover_compose_with<F>(&self, mode: Mode, action: StageAction<F>) -> ManagedStage<T>
    where
        F: FnOnce(ConcurrencyError) -> ManagedStage<T> + Send + 'static,
    {
        self.react(mode, action, |outcome, action| match outcome {
            Ok(value) => Reaction::Settle(Ok(value)),
            Err(error) => Reaction::Run(Box::new(move |target: &ManagedStage<T>| {
                follow(&action(error), target);
            })),
        })
    }

    // ---- handle ----

    pub fn handle<U, F>(&self, action: F) -> ManagedStage<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(ConcurrencyResult<T>) -> U + Send + 'static,
    {
        self.handle_with(Mode::Sync, StageAction::Plain(action))
    }

    pub fn handle_async<U, F>(&self, action: F) -> ManagedStage<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(ConcurrencyResult<T>) -> U + Send + 'static,
    {
        let mode = self.async_mode();
        self.handle_with(mode, StageAction::Plain(action))
    }

    pub fn handle_async_on<U, F>(
        &self,
        action: StageAction<F>,
        executor: &StageExecutor,
    ) -> ManagedStage<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(ConcurrencyResult<T>) -> U + Send + 'static,
    {
        self.handle_with(Mode::Async(executor.clone()), action)
    }

    fn handle_with<U, F>(&self, mode: Mode, action: StageAction<F>) -> ManagedStage<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(ConcurrencyResult<T>) -> U + Send + 'static,
    {
        self.react(mode, action, |outcome, action| {
            Reaction::produce(move || action(outcome))
        })
    }

    // ---- when_complete ----

    pub fn when_complete<F>(&self, action: F) -> ManagedStage<T>
    where
        F: FnOnce(&ConcurrencyResult<T>) + Send + 'static,
    {
        self.observe_with(Mode::Sync, StageAction::Plain(action))
    }

    pub fn when_complete_async<F>(&self, action: F) -> ManagedStage<T>
    where
        F: FnOnce(&ConcurrencyResult<T>) + Send + 'static,
    {
        let mode = self.async_mode();
        self.observe_with(mode, StageAction::Plain(action))
    }

    pub fn when_complete_async_on<F>(
        &self,
        action: StageAction<F>,
        executor: &StageExecutor,
    ) -> ManagedStage<T>
    where
        F: FnOnce(&ConcurrencyResult<T>) + Send + 'static,
    {
        self.observe_with(Mode::Async(executor.clone()), action)
    }

    /// 源阶段失败时保留源失败；源阶段成功而动作失败时以动作的失败完成。
    fn observe_with<F>(&self, mode: Mode, action: StageAction<F>) -> ManagedStage<T>
    where
        F: FnOnce(&ConcurrencyResult<T>) + Send + 'static,
    {
        self.react(mode, action, |outcome, action| {
            Reaction::Run(Box::new(move |target: &ManagedStage<T>| {
                let observed = catch(|| {
                    action(&outcome);
                    Ok(())
                });
                let settled = match (outcome, observed) {
                    (Ok(value), Ok(())) => Ok(value),
                    (Ok(_), Err(failure)) => Err(ConcurrencyError::Execution(failure)),
                    (Err(error), Ok(())) => Err(error),
                    (Err(error), Err(secondary)) => {
                        warn!(error = %secondary, "when_complete action failed after the stage had already failed");
                        Err(error)
                    }
                };
                target.core.settle(settled);
            }))
        })
    }
}

/// 让 `target` 随 `inner` 完成。
fn follow<U: Clone + Send + 'static>(inner: &ManagedStage<U>, target: &ManagedStage<U>) {
    let relay = target.clone();
    inner.core.subscribe(Box::new(move |outcome: &ConcurrencyResult<U>| {
        relay.core.settle(outcome.clone());
    }));
}
