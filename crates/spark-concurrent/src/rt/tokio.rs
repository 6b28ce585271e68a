//! 基于 Tokio 的底层执行器。
//!
//! # 教案式说明
//! - **意图 (Why)**：托管任务体是同步阻塞代码，直接放在 Tokio 工作线程上会饿死异步任务，
//!   因此一律交给 `spawn_blocking` 的阻塞线程池；延迟则由 Tokio 定时器负责。
//! - **契约 (What)**：
//!   - 取消尚未开始的工作保证其不再运行；仍在休眠的延迟任务会被直接中止；
//!   - 已经开始运行的工作不会被强行终止，打断由托管层的协作式中断完成。
//!   - 运行时关闭后提交的工作会被 Tokio 直接丢弃；丢弃经由 `NativeTask::guard` 与托管层的移交状态
//!     传回调用方，表现为 `Rejected`，不会让任务停在已提交状态。
//! - **实现提示 (How)**：工作先经 [`NativeTask::guard`] 包装，Tokio 侧只负责"何时、在哪个线程"运行。

use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::AbortHandle;

use crate::error::{ConcurrencyError, ConcurrencyResult, TaskResult};
use crate::native::{NativeExecutor, NativeFuture, NativeTask, QueuePolicy, Work};

/// 以 Tokio 运行时作为底层执行器。
#[derive(Clone, Debug)]
pub struct TokioNativeExecutor {
    name: String,
    handle: Handle,
}

impl TokioNativeExecutor {
    pub fn new(name: impl Into<String>, handle: Handle) -> Self {
        Self {
            name: name.into(),
            handle,
        }
    }

    /// 绑定当前线程所在的 Tokio 运行时；不在运行时上下文中时返回配置错误。
    pub fn from_current(name: impl Into<String>) -> ConcurrencyResult<Self> {
        let handle = Handle::try_current().map_err(|error| {
            ConcurrencyError::configuration(format!("no tokio runtime available: {error}"))
        })?;
        Ok(Self::new(name, handle))
    }
}

/// 延迟工作的句柄：取消时同时中止仍在休眠的定时任务。
struct DelayedWork {
    task: Arc<NativeTask>,
    timer: AbortHandle,
}

impl NativeFuture for DelayedWork {
    fn cancel(&self, interrupt: bool) -> bool {
        let cancelled = self.task.cancel(interrupt);
        if cancelled {
            self.timer.abort();
        }
        cancelled
    }

    fn is_cancelled(&self) -> bool {
        self.task.is_cancelled()
    }

    fn is_done(&self) -> bool {
        self.task.is_done()
    }
}

impl NativeExecutor for TokioNativeExecutor {
    fn submit(&self, work: Work, _policy: QueuePolicy) -> TaskResult<Arc<dyn NativeFuture>> {
        let (work, task) = NativeTask::guard(work);
        drop(self.handle.spawn_blocking(work));
        Ok(task)
    }

    fn schedule(&self, work: Work, delay: Duration) -> TaskResult<Arc<dyn NativeFuture>> {
        let (work, task) = NativeTask::guard(work);
        let timer = self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            drop(tokio::task::spawn_blocking(work));
        });
        Ok(Arc::new(DelayedWork {
            task,
            timer: timer.abort_handle(),
        }))
    }

    fn name(&self) -> &str {
        &self.name
    }
}
