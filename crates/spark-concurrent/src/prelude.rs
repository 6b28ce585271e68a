//! # spark-concurrent Prelude
//!
//! 常用类型一站式导入：`use spark_concurrent::prelude::*;` 即可提交任务、建立调度与组合阶段。
//! 上下文提供者、测试替身等边缘类型仍建议使用明确的模块路径。

pub use crate::config::ManagedExecutorConfig;
pub use crate::context::{ContextProviderRegistry, ExecutionProperties};
pub use crate::error::{ConcurrencyError, ConcurrencyResult, Failure, TaskResult};
pub use crate::executor::ManagedExecutor;
pub use crate::future::ManagedFuture;
pub use crate::interrupt;
pub use crate::listener::{TaskEvent, TaskListener};
pub use crate::native::NativeExecutor;
pub use crate::schedule::{ManagedScheduledFuture, Schedule, Trigger};
pub use crate::stage::{AsStage, ManagedStage, StageAction, StageExecutor};
pub use crate::task::ManagedTask;
