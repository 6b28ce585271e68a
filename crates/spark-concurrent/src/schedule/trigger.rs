//! 触发器契约与上一次执行记录。

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

use crate::error::TaskResult;

/// 上一次（实际运行过的）执行记录。
///
/// 被触发器跳过的尝试不会产生新的记录。
#[derive(Clone)]
pub struct LastExecution {
    identity_name: Arc<str>,
    scheduled_start: SystemTime,
    run_start: SystemTime,
    run_end: SystemTime,
    result: Option<Arc<dyn Any + Send + Sync>>,
}

impl LastExecution {
    pub fn new(
        identity_name: Arc<str>,
        scheduled_start: SystemTime,
        run_start: SystemTime,
        run_end: SystemTime,
        result: Option<Arc<dyn Any + Send + Sync>>,
    ) -> Self {
        Self {
            identity_name,
            scheduled_start,
            run_start,
            run_end,
            result,
        }
    }

    pub fn identity_name(&self) -> &str {
        &self.identity_name
    }

    pub fn scheduled_start(&self) -> SystemTime {
        self.scheduled_start
    }

    pub fn run_start(&self) -> SystemTime {
        self.run_start
    }

    pub fn run_end(&self) -> SystemTime {
        self.run_end
    }

    /// 以具体类型读取上次的结果；任务体失败或类型不符时返回 `None`。
    pub fn result<R: Any>(&self) -> Option<&R> {
        self.result.as_deref()?.downcast_ref::<R>()
    }
}

impl fmt::Debug for LastExecution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LastExecution")
            .field("identity_name", &self.identity_name)
            .field("scheduled_start", &self.scheduled_start)
            .field("run_start", &self.run_start)
            .field("run_end", &self.run_end)
            .field("has_result", &self.result.is_some())
            .finish()
    }
}

/// 触发器：决定下一次运行时间以及是否跳过某次运行。
///
/// # 契约说明（What）
/// - `next_run_time` 返回 `None` 表示调度结束；`task_scheduled_time` 是调度被创建的时刻；
/// - `skip_run` 在计划运行时刻到达、上下文施加之后调用；返回 `Ok(true)` 跳过本次，
///   返回 `Err` 同样跳过，失败被记录到该次尝试的 `Skipped` 结果中。
pub trait Trigger: Send + Sync + 'static {
    fn next_run_time(
        &self,
        last: Option<&LastExecution>,
        task_scheduled_time: SystemTime,
    ) -> Option<SystemTime>;

    fn skip_run(
        &self,
        _last: Option<&LastExecution>,
        _scheduled_run_time: SystemTime,
    ) -> TaskResult<bool> {
        Ok(false)
    }
}
