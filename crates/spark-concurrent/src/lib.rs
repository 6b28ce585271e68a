#![deny(unsafe_code)]
#![doc = "spark-concurrent: 上下文感知的托管任务执行运行时。"]
#![doc = ""]
#![doc = "== 能力概览 =="]
#![doc = "1. 一次性任务：`ManagedExecutor::submit` 捕获提交线程的上下文，在执行线程上施加并在结束后恢复，按固定顺序通知监听器。"]
#![doc = "2. 周期任务：固定延迟、固定速率（对齐槽位、不补跑）与触发器调度，同一调度的两次尝试永不重叠。"]
#![doc = "3. CompletionStage：依赖阶段继承默认执行器，并在注册动作时捕获上下文。"]
#![doc = ""]
#![doc = "== 协作者 =="]
#![doc = "线程池与定时器由实现 `NativeExecutor` 的宿主提供；上下文由注册到 `ContextProviderRegistry` 的提供者定义。"]
#![doc = "`runtime-tokio` feature 提供基于 Tokio 的现成适配；`test_stubs` 模块提供测试替身。"]

pub mod config;
pub mod context;
pub mod error;
pub mod executor;
pub mod future;
pub mod interrupt;
pub mod listener;
pub mod native;
pub mod prelude;
pub mod rt;
pub mod schedule;
pub mod stage;
pub mod status;
pub mod task;
/// 测试替身：底层执行器、监听器、上下文提供者与触发器。
///
/// # 使用方式（How）
/// - 通过 `use spark_concurrent::test_stubs::{ThreadPoolStub, RecordingListener};` 等语句引入；
/// - 仅供测试、基准与示例使用，生产代码应注入真实的底层执行器。
pub mod test_stubs;
pub mod time;

pub use config::{DEFAULT_CANCEL_RETRY_LIMIT, ManagedExecutorConfig};
pub use context::{
    AppliedContext, CapturedContext, ComponentContextProvider, ComponentMetadata,
    ComponentRegistry, ContextProvider, ContextProviderRegistry, ContextService, ContextSnapshot,
    ExecutionProperties, RestoreToken, TracingSpanProvider,
};
pub use error::{ConcurrencyError, ConcurrencyResult, Failure, TaskResult};
pub use executor::{ManagedExecutor, ManagedExecutorBuilder};
pub use future::ManagedFuture;
pub use listener::{TaskControl, TaskEvent, TaskListener};
pub use native::{NativeExecutor, NativeFuture, NativeTask, QueuePolicy, TaskPriority, Work};
pub use schedule::{LastExecution, ManagedScheduledFuture, Schedule, Trigger};
pub use stage::{
    AsStage, DelayedExecutor, ManagedStage, MinimalStage, StageAction, StageExecutor, StageFuture,
};
pub use status::{HasNext, StatusCell, TaskState};
pub use task::ManagedTask;
pub use time::{Clock, MockClock, SystemClock};
