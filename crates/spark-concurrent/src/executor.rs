//! # ManagedExecutor：对外的托管执行器门面
//!
//! ## 角色定位（Why）
//! - 应用代码只面对这一个入口：提交一次性任务、周期任务与 CompletionStage，
//!   上下文捕获与监听器契约在这里统一接线；
//! - 底层执行器（线程池、Tokio 适配层或测试桩）通过 [`NativeExecutor`] 注入，门面本身不持有线程。
//!
//! ## 契约（What）
//! - 捕获发生在调用线程上、提交之前；捕获失败以 `Rejected` 同步返回；
//! - 任务未自带监听器时使用执行器的默认监听器；
//! - 构造时校验配置，违反约束返回 `Configuration`。
//!
//! ## 实现提示（How）
//! - 共享状态集中在 [`ExecutorCore`]，门面是其 `Arc` 句柄，可廉价克隆并跨线程传递。

use std::any::type_name;
use std::fmt;
use std::sync::Arc;
use std::sync::mpsc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::config::ManagedExecutorConfig;
use crate::context::{
    ContextProviderRegistry, ContextService, ContextSnapshot, ExecutionProperties, TRANSACTION,
    TRANSACTION_SUSPEND, TRANSACTION_USE_EXECUTION_THREAD,
};
use crate::error::{ConcurrencyError, ConcurrencyResult, Failure, TaskResult};
use crate::future::{ManagedFuture, SubmittedTask};
use crate::listener::TaskListener;
use crate::native::NativeExecutor;
use crate::schedule::{ManagedScheduledFuture, RepeatBody, Schedule, ScheduledTask, Trigger};
use crate::stage::{ManagedStage, StageAction, StageExecutor};
use crate::task::ManagedTask;
use crate::time::{Clock, SystemClock};

/// 执行器共享状态。
pub(crate) struct ExecutorCore {
    pub(crate) name: Arc<str>,
    pub(crate) native: Arc<dyn NativeExecutor>,
    pub(crate) contexts: ContextService,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) config: ManagedExecutorConfig,
    pub(crate) listener: Option<Arc<dyn TaskListener>>,
}

/// 上下文感知的托管执行器。
#[derive(Clone)]
pub struct ManagedExecutor {
    core: Arc<ExecutorCore>,
}

/// [`ManagedExecutor`] 构建器，确保在创建时完成配置校验。
pub struct ManagedExecutorBuilder {
    native: Arc<dyn NativeExecutor>,
    config: ManagedExecutorConfig,
    clock: Arc<dyn Clock>,
    contexts: Option<ContextService>,
    registry: ContextProviderRegistry,
    listener: Option<Arc<dyn TaskListener>>,
}

impl ManagedExecutorBuilder {
    /// 设置执行器配置。
    pub fn with_config(mut self, config: ManagedExecutorConfig) -> Self {
        self.config = config;
        self
    }

    /// 设置时钟；测试中可注入 `MockClock`。
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// 设置上下文提供者注册表，传播策略取自配置。
    pub fn with_context_registry(mut self, registry: ContextProviderRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// 直接设置上下文服务；此时忽略配置中的传播策略与注册表。
    pub fn with_context_service(mut self, contexts: ContextService) -> Self {
        self.contexts = Some(contexts);
        self
    }

    /// 设置默认监听器。
    pub fn with_listener(mut self, listener: Arc<dyn TaskListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn build(self) -> ConcurrencyResult<ManagedExecutor> {
        self.config.validate()?;
        let contexts = match self.contexts {
            Some(contexts) => contexts,
            None => ContextService::new(self.registry)
                .with_policy(self.config.propagated.clone(), self.config.cleared.clone()),
        };
        info!(
            executor = %self.config.name,
            native = self.native.name(),
            providers = contexts.registry().len(),
            "managed executor ready"
        );
        Ok(ManagedExecutor {
            core: Arc::new(ExecutorCore {
                name: Arc::from(self.config.name.as_str()),
                native: self.native,
                contexts,
                clock: self.clock,
                config: self.config,
                listener: self.listener,
            }),
        })
    }
}

impl ManagedExecutor {
    pub fn builder(native: Arc<dyn NativeExecutor>) -> ManagedExecutorBuilder {
        ManagedExecutorBuilder {
            native,
            config: ManagedExecutorConfig::default(),
            clock: Arc::new(SystemClock),
            contexts: None,
            registry: ContextProviderRegistry::new(),
            listener: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    pub fn native(&self) -> &Arc<dyn NativeExecutor> {
        &self.core.native
    }

    pub fn config(&self) -> &ManagedExecutorConfig {
        &self.core.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.core.clock
    }

    pub fn context_service(&self) -> &ContextService {
        &self.core.contexts
    }

    /// 在当前线程按执行器策略捕获上下文。
    pub fn capture_context(
        &self,
        properties: ExecutionProperties,
    ) -> ConcurrencyResult<ContextSnapshot> {
        self.core.contexts.capture(properties, &self.core.name, None)
    }

    fn capture(
        &self,
        properties: ExecutionProperties,
        task_type: &str,
    ) -> ConcurrencyResult<ContextSnapshot> {
        self.core
            .contexts
            .capture(properties, &self.core.name, Some(task_type))
    }

    fn listener_for(&self, own: Option<Arc<dyn TaskListener>>) -> Option<Arc<dyn TaskListener>> {
        own.or_else(|| self.core.listener.clone())
    }

    // ---- 一次性任务 ----

    /// 提交后不保留句柄。
    pub fn execute<F>(&self, body: F) -> ConcurrencyResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit_runnable(
            move || {
                body();
                Ok(())
            },
            (),
        )
        .map(drop)
    }

    pub fn submit<T, F>(&self, body: F) -> ConcurrencyResult<ManagedFuture<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> TaskResult<T> + Send + 'static,
    {
        self.submit_task(ManagedTask::new(body))
    }

    /// 提交无返回值的任务，成功时以 `result` 作为结果。
    pub fn submit_runnable<T, F>(&self, body: F, result: T) -> ConcurrencyResult<ManagedFuture<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> TaskResult<()> + Send + 'static,
    {
        let context = self.capture(ExecutionProperties::new(), type_name::<F>())?;
        let listener = self.listener_for(None);
        SubmittedTask::submit(
            &self.core,
            Box::new(move || body().map(|()| result)),
            listener,
            context,
        )
    }

    pub fn submit_task<T, F>(&self, task: ManagedTask<F>) -> ConcurrencyResult<ManagedFuture<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> TaskResult<T> + Send + 'static,
    {
        let (body, listener, properties) = task.into_parts();
        let context = self.capture(properties, type_name::<F>())?;
        let listener = self.listener_for(listener);
        SubmittedTask::submit(&self.core, Box::new(body), listener, context)
    }

    /// 提交全部任务并等待它们结束；返回的句柄均已完成。
    ///
    /// 任一任务提交失败时，已提交的任务会被取消并返回该错误。
    pub fn invoke_all<T, F>(
        &self,
        bodies: impl IntoIterator<Item = F>,
    ) -> ConcurrencyResult<Vec<ManagedFuture<T>>>
    where
        T: Clone + Send + 'static,
        F: FnOnce() -> TaskResult<T> + Send + 'static,
    {
        let futures = self.submit_each(bodies)?;
        for future in &futures {
            // 只等待结束，结果由调用方从句柄读取。
            let _ = future.get();
        }
        Ok(futures)
    }

    /// 返回第一个成功完成的结果，并取消其余任务；全部失败时返回最后一个失败。
    pub fn invoke_any<T, F>(&self, bodies: impl IntoIterator<Item = F>) -> ConcurrencyResult<T>
    where
        T: Clone + Send + 'static,
        F: FnOnce() -> TaskResult<T> + Send + 'static,
    {
        let (sender, receiver) = mpsc::channel::<ConcurrencyResult<T>>();
        let wrapped = bodies.into_iter().map(|body| {
            let sender = sender.clone();
            move || {
                let outcome = body();
                let _ = sender.send(outcome.clone().map_err(ConcurrencyError::Execution));
                outcome
            }
        });
        let futures = self.submit_each(wrapped)?;
        drop(sender);
        if futures.is_empty() {
            return Err(ConcurrencyError::configuration(
                "invoke_any requires at least one task",
            ));
        }

        let mut last_error = ConcurrencyError::Cancelled;
        for _ in 0..futures.len() {
            match receiver.recv() {
                Ok(Ok(value)) => {
                    cancel_all(&futures);
                    return Ok(value);
                }
                Ok(Err(error)) => last_error = error,
                // 剩余任务在运行前被取消或中止，发送端随之释放。
                Err(_) => break,
            }
        }
        for future in &futures {
            if let Err(error) = future.get() {
                last_error = error;
            }
        }
        Err(last_error)
    }

    fn submit_each<T, F>(
        &self,
        bodies: impl IntoIterator<Item = F>,
    ) -> ConcurrencyResult<Vec<ManagedFuture<T>>>
    where
        T: Send + 'static,
        F: FnOnce() -> TaskResult<T> + Send + 'static,
    {
        let mut futures = Vec::new();
        for body in bodies {
            match self.submit(body) {
                Ok(future) => futures.push(future),
                Err(error) => {
                    cancel_all(&futures);
                    return Err(error);
                }
            }
        }
        Ok(futures)
    }

    // ---- 周期任务 ----

    /// 延迟后运行一次。
    pub fn schedule<T, F>(&self, body: F, delay: Duration) -> ConcurrencyResult<ManagedScheduledFuture<T>>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> TaskResult<T> + Send + 'static,
    {
        let task_type = type_name::<F>();
        let once = Mutex::new(Some(body));
        let body: RepeatBody<T> = Box::new(move || match once.lock().take() {
            Some(body) => body(),
            None => Err(Failure::msg("one-shot schedule ran more than once")),
        });
        self.start_schedule(body, None, ExecutionProperties::new(), task_type, Schedule::once(delay))
    }

    pub fn schedule_at_fixed_rate<T, F>(
        &self,
        body: F,
        initial: Duration,
        period: Duration,
    ) -> ConcurrencyResult<ManagedScheduledFuture<T>>
    where
        T: Clone + Send + Sync + 'static,
        F: Fn() -> TaskResult<T> + Send + Sync + 'static,
    {
        self.schedule_task(ManagedTask::new(body), Schedule::fixed_rate(initial, period))
    }

    pub fn schedule_with_fixed_delay<T, F>(
        &self,
        body: F,
        initial: Duration,
        delay: Duration,
    ) -> ConcurrencyResult<ManagedScheduledFuture<T>>
    where
        T: Clone + Send + Sync + 'static,
        F: Fn() -> TaskResult<T> + Send + Sync + 'static,
    {
        self.schedule_task(ManagedTask::new(body), Schedule::fixed_delay(initial, delay))
    }

    pub fn schedule_with_trigger<T, F>(
        &self,
        body: F,
        trigger: Arc<dyn Trigger>,
    ) -> ConcurrencyResult<ManagedScheduledFuture<T>>
    where
        T: Clone + Send + Sync + 'static,
        F: Fn() -> TaskResult<T> + Send + Sync + 'static,
    {
        self.schedule_task(ManagedTask::new(body), Schedule::triggered(trigger))
    }

    pub fn schedule_task<T, F>(
        &self,
        task: ManagedTask<F>,
        schedule: Schedule,
    ) -> ConcurrencyResult<ManagedScheduledFuture<T>>
    where
        T: Clone + Send + Sync + 'static,
        F: Fn() -> TaskResult<T> + Send + Sync + 'static,
    {
        let (body, listener, properties) = task.into_parts();
        self.start_schedule(Box::new(body), listener, properties, type_name::<F>(), schedule)
    }

    fn start_schedule<T>(
        &self,
        body: RepeatBody<T>,
        listener: Option<Arc<dyn TaskListener>>,
        properties: ExecutionProperties,
        task_type: &str,
        schedule: Schedule,
    ) -> ConcurrencyResult<ManagedScheduledFuture<T>>
    where
        T: Clone + Send + Sync + 'static,
    {
        schedule.validate()?;
        let context = self.capture(properties, task_type)?;
        let listener = self.listener_for(listener);
        debug!(executor = %self.core.name, schedule = ?schedule, "starting schedule");
        ScheduledTask::start(Arc::clone(&self.core), body, listener, context, schedule)
    }

    // ---- CompletionStage ----

    fn stage_executor(&self) -> StageExecutor {
        StageExecutor::Managed(self.clone())
    }

    pub fn completed_stage<T: Clone + Send + 'static>(&self, value: T) -> ManagedStage<T> {
        ManagedStage::settled(self.stage_executor(), Ok(value))
    }

    pub fn failed_stage<T: Clone + Send + 'static>(&self, failure: Failure) -> ManagedStage<T> {
        ManagedStage::settled(
            self.stage_executor(),
            Err(ConcurrencyError::Execution(failure)),
        )
    }

    pub fn new_incomplete_stage<T: Clone + Send + 'static>(&self) -> ManagedStage<T> {
        ManagedStage::incomplete(self.stage_executor())
    }

    /// 延迟 `delay` 后在本执行器的底层执行器上运行动作，配合 `*_async_on` 使用。
    pub fn delayed_executor(&self, delay: Duration) -> StageExecutor {
        StageExecutor::delayed(delay, self.clone())
    }

    /// 在本执行器上异步计算值；上下文在调用线程上捕获。
    pub fn supply_async<T, F>(&self, supplier: F) -> ManagedStage<T>
    where
        T: Clone + Send + 'static,
        F: FnOnce() -> TaskResult<T> + Send + 'static,
    {
        match self.capture_for_stage(type_name::<F>()) {
            Ok(context) => ManagedStage::supply_on(self.stage_executor(), Some(context), supplier),
            Err(error) => ManagedStage::settled(self.stage_executor(), Err(error)),
        }
    }

    pub fn run_async<F>(&self, action: F) -> ManagedStage<()>
    where
        F: FnOnce() -> TaskResult<()> + Send + 'static,
    {
        self.supply_async(action)
    }

    /// 立即捕获上下文并与动作绑定，交给 `*_async_on` 时不再重新捕获。
    pub fn contextualize<F>(&self, action: F) -> ConcurrencyResult<StageAction<F>> {
        let context = self.capture_for_stage(type_name::<F>())?;
        Ok(StageAction::contextual(action, context))
    }

    /// 阶段动作的捕获：按配置附加事务属性。
    pub(crate) fn capture_for_stage(&self, task_type: &str) -> ConcurrencyResult<ContextSnapshot> {
        let transaction = if self.core.config.suspend_transaction {
            TRANSACTION_SUSPEND
        } else {
            TRANSACTION_USE_EXECUTION_THREAD
        };
        let properties = ExecutionProperties::new().with(TRANSACTION, transaction);
        self.capture(properties, task_type)
    }
}

fn cancel_all<T: Send + 'static>(futures: &[ManagedFuture<T>]) {
    for future in futures {
        future.cancel(true);
    }
}

impl fmt::Debug for ManagedExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedExecutor")
            .field("name", &self.core.name)
            .field("native", &self.core.native.name())
            .field("config", &self.core.config)
            .finish_non_exhaustive()
    }
}
