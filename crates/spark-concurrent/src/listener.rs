//! 任务生命周期监听器。
//!
//! # 教案式说明
//! - **意图 (Why)**：调用方需要在任务提交、开始、中止与结束时插入自己的逻辑（审计、配额、取消决策），
//!   同时不能让监听器的失败破坏运行时自身的状态推进。
//! - **契约 (What)**：
//!   - 每次尝试的通知顺序为 `on_submitted → on_starting → [on_aborted] → on_done`，
//!     `on_aborted` 只在尝试未正常完成（中止、取消、跳过）时出现；
//!   - `on_done` 每次尝试恰好一次；
//!   - 监听器返回 `Err` 或 panic 时失败被捕获并记录日志，运行时继续推进；
//!     `on_submitted` 失败会使提交被拒绝，`on_starting` 失败会使尝试中止；
//!   - 监听器可以通过 [`TaskEvent::control`] 取消任务。

use std::sync::Arc;

use tracing::warn;

use crate::error::{ConcurrencyError, Failure, TaskResult, catch};

/// 监听器可见的任务控制面。
pub trait TaskControl: Send + Sync {
    fn cancel(&self, interrupt: bool) -> bool;

    fn is_cancelled(&self) -> bool;

    fn is_done(&self) -> bool;
}

/// 一次通知的事件描述。
pub struct TaskEvent<'a> {
    pub control: &'a dyn TaskControl,
    pub executor: &'a str,
    pub identity: &'a str,
    /// 从 1 开始的尝试序号；一次性任务恒为 1。
    pub attempt: u64,
}

/// 生命周期监听器。所有方法默认不做任何事。
pub trait TaskListener: Send + Sync + 'static {
    fn on_submitted(&self, _event: &TaskEvent<'_>) -> TaskResult<()> {
        Ok(())
    }

    fn on_starting(&self, _event: &TaskEvent<'_>) -> TaskResult<()> {
        Ok(())
    }

    fn on_aborted(&self, _event: &TaskEvent<'_>, _error: &ConcurrencyError) -> TaskResult<()> {
        Ok(())
    }

    fn on_done(&self, _event: &TaskEvent<'_>, _error: Option<&ConcurrencyError>) -> TaskResult<()> {
        Ok(())
    }
}

/// 捕获监听器失败的分发器。
pub(crate) struct Notifier<'a> {
    listener: Option<&'a Arc<dyn TaskListener>>,
    event: TaskEvent<'a>,
}

impl<'a> Notifier<'a> {
    pub(crate) fn new(listener: Option<&'a Arc<dyn TaskListener>>, event: TaskEvent<'a>) -> Self {
        Self { listener, event }
    }

    pub(crate) fn submitted(&self) -> Option<Failure> {
        self.dispatch("on_submitted", |listener, event| listener.on_submitted(event))
    }

    pub(crate) fn starting(&self) -> Option<Failure> {
        self.dispatch("on_starting", |listener, event| listener.on_starting(event))
    }

    pub(crate) fn aborted(&self, error: &ConcurrencyError) {
        self.dispatch("on_aborted", |listener, event| listener.on_aborted(event, error));
    }

    pub(crate) fn done(&self, error: Option<&ConcurrencyError>) {
        self.dispatch("on_done", |listener, event| listener.on_done(event, error));
    }

    /// 终态通知：未正常完成时先发 `on_aborted`，随后发 `on_done`。
    pub(crate) fn terminal(&self, error: Option<&ConcurrencyError>, aborted: bool) {
        if aborted {
            if let Some(error) = error {
                self.aborted(error);
            }
        }
        self.done(error);
    }

    fn dispatch(
        &self,
        callback: &'static str,
        call: impl FnOnce(&dyn TaskListener, &TaskEvent<'_>) -> TaskResult<()>,
    ) -> Option<Failure> {
        let listener = self.listener?;
        match catch(|| call(listener.as_ref(), &self.event)) {
            Ok(()) => None,
            Err(failure) => {
                warn!(
                    callback,
                    executor = %self.event.executor,
                    identity = %self.event.identity,
                    attempt = self.event.attempt,
                    error = %failure,
                    "task listener failed"
                );
                Some(failure)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    struct Control;

    impl TaskControl for Control {
        fn cancel(&self, _interrupt: bool) -> bool {
            false
        }
        fn is_cancelled(&self) -> bool {
            false
        }
        fn is_done(&self) -> bool {
            false
        }
    }

    struct Panicking;

    impl TaskListener for Panicking {
        fn on_starting(&self, _event: &TaskEvent<'_>) -> TaskResult<()> {
            panic!("listener exploded")
        }
    }

    #[traced_test]
    #[test]
    fn listener_panic_is_captured_and_logged() {
        let listener: Arc<dyn TaskListener> = Arc::new(Panicking);
        let control = Control;
        let notifier = Notifier::new(
            Some(&listener),
            TaskEvent {
                control: &control,
                executor: "exec",
                identity: "job",
                attempt: 1,
            },
        );
        assert!(notifier.submitted().is_none());
        let failure = notifier.starting().expect("panic 应被转换为失败");
        assert!(failure.is_panic());
        assert!(logs_contain("task listener failed"));
    }
}
